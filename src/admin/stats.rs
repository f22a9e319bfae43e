use serde::Serialize;

use crate::admin::util::file_size;
use crate::primitives::concurrency::BarrierSnapshot;
use crate::storage::{CompactionStats, DeltaSlot, HybridStore, Manifest, SlotPair, StoreStats};

/// Everything `tern stats` prints.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Snapshot codec name.
    pub codec: &'static str,
    /// Persisted manifest.
    pub manifest: Manifest,
    /// Live counters.
    pub store: StoreStats,
    /// Most recent successful compaction in this process, if any.
    pub last_compaction: Option<CompactionStats>,
    /// Lease barrier state.
    pub leases: BarrierSnapshot,
    /// Sizes of the files the manifest references.
    pub filesystem: FilesystemStats,
}

/// Sizes in bytes of the files named by the manifest.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Store directory.
    pub path: String,
    /// Snapshot index.
    pub snapshot_bytes: u64,
    /// Tombstone journal.
    pub tombstone_bytes: u64,
    /// Delta journal per slot.
    pub delta_bytes: SlotPair<u64>,
}

/// Collects the report for an open store.
pub fn stats(store: &HybridStore) -> StatsReport {
    let manifest = store.manifest();
    let layout = store.layout();
    let delta_bytes = SlotPair::new(
        file_size(&layout.delta(DeltaSlot::A, manifest.delta_generations[DeltaSlot::A])),
        file_size(&layout.delta(DeltaSlot::B, manifest.delta_generations[DeltaSlot::B])),
    );
    let filesystem = FilesystemStats {
        path: store.path().display().to_string(),
        snapshot_bytes: file_size(&layout.snapshot(manifest.epoch)),
        tombstone_bytes: file_size(&layout.tombstones(manifest.epoch)),
        delta_bytes,
    };
    StatsReport {
        codec: store.codec_name(),
        store: store.stats(),
        last_compaction: store.last_compaction_stats(),
        leases: store.leases(),
        filesystem,
        manifest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{open_store, AdminOpenOptions};
    use crate::types::Triple;

    #[test]
    fn reports_delta_and_snapshot_sizes() -> crate::admin::Result<()> {
        let dir = tempfile::tempdir()?;
        let opts = AdminOpenOptions {
            create_if_missing: true,
            ..AdminOpenOptions::default()
        };
        let store = open_store(dir.path(), &opts)?;
        let triple = Triple::parse_line(r#"<http://example.org/s> <http://example.org/p> "o" ."#)
            .map_err(crate::error::StoreError::from)?;
        store.insert(&triple).map_err(crate::error::StoreError::from)?;
        let report = stats(&store);
        assert_eq!(report.store.logical_triples, 1);
        assert_eq!(report.codec, store.codec_name());
        assert!(report.filesystem.snapshot_bytes > 0);
        assert!(report.filesystem.delta_bytes[report.store.active] > 0);
        assert!(report.last_compaction.is_none());
        Ok(())
    }
}
