use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};
use crate::primitives::io::atomic_write;
use crate::storage::delta::{DeltaSlot, SlotPair};

/// Current manifest format.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Intermediate compaction outputs known to be complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingFlags {
    /// Frozen triples dumped to the staging journal.
    pub dumped: bool,
    /// Staging index built from the dump.
    pub indexed: bool,
    /// Candidate snapshot written.
    pub merged: bool,
}

impl StagingFlags {
    /// Returns true when any staging output was recorded.
    pub fn any(&self) -> bool {
        self.dumped || self.indexed || self.merged
    }
}

/// Durable record of which files make up the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format of this record.
    pub format_version: u32,
    /// Snapshot epoch in use.
    pub epoch: u64,
    /// Slot receiving writes.
    pub active: DeltaSlot,
    /// Slot being compacted, if a cycle passed Switching.
    pub frozen: Option<DeltaSlot>,
    /// Journal generation per slot.
    pub delta_generations: SlotPair<u64>,
    /// Progress of the current cycle.
    #[serde(default)]
    pub staging: StagingFlags,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            epoch: 0,
            active: DeltaSlot::A,
            frozen: None,
            delta_generations: SlotPair::default(),
            staging: StagingFlags::default(),
        }
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

impl Manifest {
    /// Reads and validates the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let dir = path.parent().unwrap_or(path).to_path_buf();
                return Err(RecoveryError::MissingManifest(dir).into());
            }
            Err(err) => return Err(err.into()),
        };
        let probe: VersionProbe = serde_json::from_slice(&bytes)
            .map_err(|err| RecoveryError::Manifest(err.to_string()))?;
        if probe.format_version > MANIFEST_FORMAT_VERSION {
            return Err(RecoveryError::UnsupportedVersion(probe.format_version).into());
        }
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|err| RecoveryError::Manifest(err.to_string()))?;
        if manifest.frozen == Some(manifest.active) {
            return Err(
                RecoveryError::Manifest("frozen slot equals active slot".to_string()).into(),
            );
        }
        Ok(manifest)
    }

    /// Atomically replaces the manifest at `path`.
    pub fn store(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| RecoveryError::Manifest(err.to_string()))?;
        atomic_write(path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::tempdir;

    #[test]
    fn store_and_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("MANIFEST");
        let mut manifest = Manifest::default();
        manifest.epoch = 4;
        manifest.active = DeltaSlot::B;
        manifest.frozen = Some(DeltaSlot::A);
        manifest.delta_generations.a = 3;
        manifest.staging.dumped = true;
        manifest.store(&path)?;
        assert_eq!(Manifest::load(&path)?, manifest);
        Ok(())
    }

    #[test]
    fn missing_and_future_manifests_are_recovery_errors() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("MANIFEST");
        assert!(matches!(
            Manifest::load(&path),
            Err(StoreError::Recovery(RecoveryError::MissingManifest(_)))
        ));

        std::fs::write(&path, br#"{"format_version": 99}"#)?;
        assert!(matches!(
            Manifest::load(&path),
            Err(StoreError::Recovery(RecoveryError::UnsupportedVersion(99)))
        ));

        std::fs::write(&path, b"not json")?;
        assert!(matches!(
            Manifest::load(&path),
            Err(StoreError::Recovery(RecoveryError::Manifest(_)))
        ));
        Ok(())
    }
}
