//! Hybrid store engine.
//!
//! Owns the current epoch (snapshot plus delete bitmap), the two delta slots,
//! the manifest and the compactor. Lookups go through the router and come back
//! as a [`MergedIter`].

/// Online compaction cycle and its background worker.
pub mod compaction;

mod delta;
mod epoch;
mod layout;
mod manifest;
mod merged;
mod options;
mod recovery;
mod router;
mod store;

pub use compaction::{CompactionPhase, CompactionStats, CompactionTrigger};
pub use delta::{DeltaPattern, DeltaSlot, DeltaStore, DeltaTerm, DeltaTriple, SlotPair};
pub use epoch::{DeleteBitmap, Epoch, RoleBitmaps};
pub use layout::{StoreFile, StoreLayout, LOCK_FILE, MANIFEST_FILE};
pub use manifest::{Manifest, StagingFlags, MANIFEST_FORMAT_VERSION};
pub use merged::MergedIter;
pub use options::{CompactionConfig, HookAction, PhaseHook, StoreOptions, Synchronous};
pub use router::RoutePlan;
pub use store::{HybridStore, StoreStats};
