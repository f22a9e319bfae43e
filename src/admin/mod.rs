#![forbid(unsafe_code)]

//! Store administration utilities.
//!
//! Offline helpers used by the `tern` binary: opening a store directory for
//! inspection, reporting counters and file sizes, and verifying that the
//! on-disk state and the logical triple set agree.

mod error;
mod options;
mod stats;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Options for opening a store in admin mode.
pub use options::AdminOpenOptions;

/// Counters and file sizes of a store.
pub use stats::{stats, FilesystemStats, StatsReport};

/// Consistency checks over the manifest, the journals and the merged view.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

/// Opens the store directory named on the command line.
pub use util::open_store;
