use std::path::{Path, PathBuf};

use crate::storage::delta::DeltaSlot;

/// Name of the manifest file in a store directory.
pub const MANIFEST_FILE: &str = "MANIFEST";
/// Name of the file holding the exclusive directory lock.
pub const LOCK_FILE: &str = "LOCK";
const STAGING_DIR: &str = "staging";

/// File names inside a store directory.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: PathBuf,
}

/// A file recognised by [`StoreLayout::classify`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreFile {
    /// The manifest itself.
    Manifest,
    /// Snapshot of an epoch.
    Snapshot(u64),
    /// Tombstone journal of an epoch.
    Tombstones(u64),
    /// Delta journal of a slot generation.
    Delta(DeltaSlot, u64),
}

impl StoreLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest path.
    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Lock file held for the lifetime of an open store.
    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Snapshot file of `epoch`.
    pub fn snapshot(&self, epoch: u64) -> PathBuf {
        self.root.join(format!("snapshot-{epoch}.idx"))
    }

    /// Tombstone journal of `epoch`.
    pub fn tombstones(&self, epoch: u64) -> PathBuf {
        self.root.join(format!("tombstones-{epoch}.log"))
    }

    /// Delta journal of `slot` at `generation`.
    pub fn delta(&self, slot: DeltaSlot, generation: u64) -> PathBuf {
        self.root
            .join(format!("delta-{}-{generation}.log", slot.label()))
    }

    /// Directory holding intermediate compaction files.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Frozen triples dumped for the cycle producing `epoch`.
    pub fn staging_dump(&self, epoch: u64) -> PathBuf {
        self.staging_dir().join(format!("dump-{epoch}.log"))
    }

    /// Index built from the dump.
    pub fn staging_built(&self, epoch: u64) -> PathBuf {
        self.staging_dir().join(format!("built-{epoch}.idx"))
    }

    /// Old snapshot minus the cutoff tombstones.
    pub fn staging_diff(&self, epoch: u64) -> PathBuf {
        self.staging_dir().join(format!("diff-{epoch}.idx"))
    }

    /// Candidate snapshot awaiting install.
    pub fn staging_merged(&self, epoch: u64) -> PathBuf {
        self.staging_dir().join(format!("merged-{epoch}.idx"))
    }

    /// Recognises store files by name.
    pub fn classify(file_name: &str) -> Option<StoreFile> {
        if file_name == MANIFEST_FILE {
            return Some(StoreFile::Manifest);
        }
        if let Some(epoch) = numbered(file_name, "snapshot-", ".idx") {
            return Some(StoreFile::Snapshot(epoch));
        }
        if let Some(epoch) = numbered(file_name, "tombstones-", ".log") {
            return Some(StoreFile::Tombstones(epoch));
        }
        let rest = file_name.strip_prefix("delta-")?;
        let (label, rest) = rest.split_once('-')?;
        let slot = DeltaSlot::from_label(label)?;
        let generation = rest.strip_suffix(".log")?.parse().ok()?;
        Some(StoreFile::Delta(slot, generation))
    }
}

fn numbered(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}
