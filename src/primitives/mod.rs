//! Low-level primitives for building the storage engine.
//!
//! Includes bitmaps, filesystem helpers, the lease barrier, the directory
//! lock and the checksummed record journal.

/// Plain and atomic fixed-length bitmaps.
pub mod bitmap;

/// Lease counting and the compaction gate.
pub mod concurrency;

/// Exclusive advisory file locks.
pub mod lock;

/// Durable file replacement and directory helpers.
pub mod io;

/// Append-only checksummed record journals.
///
/// Backs the delta stores, the tombstone log and compaction staging dumps.
pub mod journal;
