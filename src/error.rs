use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::storage::CompactionPhase;
use crate::types::TermError;

/// Result alias used by the storage internals.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Umbrella error for store internals and the codec boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk data failed validation.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Caller supplied an argument the store cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// A term failed to parse or validate.
    #[error(transparent)]
    Term(#[from] TermError),
    /// Write rejected.
    #[error(transparent)]
    Write(#[from] WriteError),
    /// Lookup failed.
    #[error(transparent)]
    Lookup(#[from] LookupError),
    /// Compaction cycle failed.
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    /// Startup recovery could not restore a consistent state.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

/// Error returned by `insert` and `delete`. No state changes when it is returned.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The triple contains a malformed term or a term in an illegal position.
    #[error("malformed triple: {0}")]
    Malformed(#[from] TermError),
    /// The delta journal rejected the append.
    #[error("delta journal write failed: {0}")]
    Journal(#[source] io::Error),
    /// Lower-level storage failure.
    #[error("storage failure: {0}")]
    Storage(#[source] Box<StoreError>),
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Term(term) => WriteError::Malformed(term),
            StoreError::Io(io) => WriteError::Journal(io),
            StoreError::Write(write) => write,
            other => WriteError::Storage(Box::new(other)),
        }
    }
}

/// Error returned by `lookup` or yielded by its iterator.
#[derive(Debug, Error)]
pub enum LookupError {
    /// A bound pattern term is malformed.
    #[error("malformed pattern: {0}")]
    Malformed(#[from] TermError),
    /// The underlying scan or identifier decoding failed.
    #[error("scan failed: {0}")]
    Scan(#[source] Box<StoreError>),
}

impl From<StoreError> for LookupError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Term(term) => LookupError::Malformed(term),
            StoreError::Lookup(lookup) => lookup,
            other => LookupError::Scan(Box::new(other)),
        }
    }
}

/// Failure of a single compaction cycle. Always absorbed at the compactor
/// boundary: the store stays queryable on the previous snapshot.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Another cycle currently owns the compactor.
    #[error("a compaction cycle is already running")]
    AlreadyRunning,
    /// Active leases did not drain in time.
    #[error("timed out after {0:?} waiting for active leases to drain")]
    QuiesceTimeout(Duration),
    /// Internal invariant violated; the cycle refused to continue.
    #[error("compaction invariant violated: {0}")]
    Invariant(&'static str),
    /// A phase hook requested a failure.
    #[error("injected failure during {phase:?} (crash: {crash})")]
    Injected {
        /// Phase at which the failure was injected.
        phase: CompactionPhase,
        /// Whether the cycle stopped without cleaning up, as a process crash would.
        crash: bool,
    },
    /// I/O error while staging or installing.
    #[error("compaction I/O error: {0}")]
    Io(#[from] io::Error),
    /// Codec or store failure.
    #[error("compaction storage error: {0}")]
    Storage(#[source] Box<StoreError>),
}

impl From<StoreError> for CompactionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(io) => CompactionError::Io(io),
            StoreError::Compaction(inner) => inner,
            other => CompactionError::Storage(Box::new(other)),
        }
    }
}

impl From<WriteError> for CompactionError {
    fn from(err: WriteError) -> Self {
        CompactionError::Storage(Box::new(StoreError::Write(err)))
    }
}

impl CompactionError {
    /// Returns true when the cycle stopped without running abort cleanup.
    pub fn is_simulated_crash(&self) -> bool {
        matches!(self, CompactionError::Injected { crash: true, .. })
    }
}

/// Unrecoverable inconsistency detected while opening a store.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// No manifest in the store directory.
    #[error("no manifest found in {0}")]
    MissingManifest(std::path::PathBuf),
    /// Manifest could not be decoded.
    #[error("manifest unreadable: {0}")]
    Manifest(String),
    /// Manifest written by a newer format.
    #[error("unsupported manifest format version {0}")]
    UnsupportedVersion(u32),
    /// Another handle holds the store directory lock.
    #[error("store at {0} is already open")]
    Locked(std::path::PathBuf),
    /// Snapshot referenced by the manifest is gone.
    #[error("snapshot for epoch {epoch} missing at {path}")]
    MissingSnapshot {
        /// Epoch named by the manifest.
        epoch: u64,
        /// Expected snapshot path.
        path: std::path::PathBuf,
    },
    /// Tombstone journal referenced by the manifest is gone.
    #[error("tombstone journal for epoch {epoch} missing at {path}")]
    MissingTombstones {
        /// Epoch named by the manifest.
        epoch: u64,
        /// Expected journal path.
        path: std::path::PathBuf,
    },
}
