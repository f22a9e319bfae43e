use std::sync::Arc;

use crate::codec::{SnapshotCodec, SortedIndexCodec};
use crate::storage::StoreOptions;

/// Common options used when opening a store for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Store options; background compaction is forced off by `open_store`
    /// unless `background` is set.
    pub store: StoreOptions,
    /// Keep the background compactor running while the store is open.
    pub background: bool,
    /// Create an empty store when the directory holds none.
    pub create_if_missing: bool,
    /// Snapshot codec.
    pub codec: Arc<dyn SnapshotCodec>,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            store: StoreOptions::default(),
            background: false,
            create_if_missing: false,
            codec: Arc::new(SortedIndexCodec),
        }
    }
}
