//! Tern: an RDF triple store built around an immutable, dictionary-encoded
//! snapshot and a double-buffered mutable delta.
//!
//! Writes land in the active delta store (or flip a tombstone bit when they
//! delete a snapshot-resident triple). Lookups are routed across the snapshot
//! and the delta stores and merged lazily. A background compactor folds the
//! delta and the tombstones into a fresh snapshot while lookups and writes
//! keep running, and the on-disk manifest lets a crashed cycle be recovered.

#![warn(missing_docs)]

pub mod admin;
pub mod codec;
pub mod error;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use error::{
    CompactionError, LookupError, RecoveryError, Result, StoreError, WriteError,
};
pub use storage::{
    CompactionConfig, CompactionPhase, CompactionStats, CompactionTrigger, DeltaSlot,
    HookAction, HybridStore, MergedIter, PhaseHook, RoutePlan, StoreOptions, Synchronous,
};
pub use types::{IdPattern, IdTriple, Role, Term, TermId, Triple, TriplePattern};
