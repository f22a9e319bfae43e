use std::fs;
use std::path::Path;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;
use crate::storage::{HybridStore, StoreLayout};

/// Opens the store in `path`.
///
/// # Errors
///
/// Returns [`AdminError::MissingStore`] when the directory holds no manifest
/// and `create_if_missing` is false.
pub fn open_store(path: &Path, opts: &AdminOpenOptions) -> Result<HybridStore> {
    let mut store_opts = opts.store.clone();
    if !opts.background {
        store_opts = store_opts.background_compaction(false);
    }
    let layout = StoreLayout::new(path);
    if !layout.manifest().exists() {
        if !opts.create_if_missing {
            return Err(AdminError::missing_store(path));
        }
        let store = HybridStore::create(
            path,
            opts.codec.clone(),
            std::iter::empty(),
            store_opts,
        )?;
        return Ok(store);
    }
    Ok(HybridStore::open(path, opts.codec.clone(), store_opts)?)
}

pub(crate) fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}
