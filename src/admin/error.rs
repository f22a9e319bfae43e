use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::error::StoreError;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No store at the specified path.
    #[error("store not found: {0}")]
    MissingStore(PathBuf),
    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_store(path: impl AsRef<Path>) -> Self {
        AdminError::MissingStore(path.as_ref().to_path_buf())
    }
}
