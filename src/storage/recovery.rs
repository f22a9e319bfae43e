use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::SnapshotCodec;
use crate::error::{RecoveryError, Result};
use crate::primitives::io::{remove_dir_if_exists, remove_if_exists};
use crate::storage::compaction::fold_frozen;
use crate::storage::delta::{DeltaSlot, DeltaStore, SlotPair};
use crate::storage::epoch::Epoch;
use crate::storage::layout::{StoreFile, StoreLayout, MANIFEST_FILE};
use crate::storage::manifest::{Manifest, StagingFlags};
use crate::storage::options::StoreOptions;

pub(crate) struct Recovered {
    pub(crate) manifest: Manifest,
    pub(crate) epoch: Arc<Epoch>,
    pub(crate) deltas: SlotPair<DeltaStore>,
}

/// Brings a store directory back to a consistent state: the manifest names
/// exactly one snapshot, one tombstone journal and one journal per slot, and
/// no slot is frozen.
pub(crate) fn recover(
    layout: &StoreLayout,
    codec: &dyn SnapshotCodec,
    options: &StoreOptions,
) -> Result<Recovered> {
    let mut manifest = Manifest::load(&layout.manifest())?;
    let interrupted = manifest.frozen.is_some() || manifest.staging.any();
    if interrupted {
        warn!(
            epoch = manifest.epoch,
            frozen = ?manifest.frozen,
            staging = ?manifest.staging,
            "store.recovery.interrupted_compaction"
        );
    }
    if remove_dir_if_exists(&layout.staging_dir())? {
        warn!(path = %layout.staging_dir().display(), "store.recovery.staging_removed");
    }
    remove_unreferenced(layout, &manifest)?;

    let snapshot_path = layout.snapshot(manifest.epoch);
    if !snapshot_path.exists() {
        return Err(RecoveryError::MissingSnapshot {
            epoch: manifest.epoch,
            path: snapshot_path,
        }
        .into());
    }
    let tombstones = layout.tombstones(manifest.epoch);
    if !tombstones.exists() {
        return Err(RecoveryError::MissingTombstones {
            epoch: manifest.epoch,
            path: tombstones,
        }
        .into());
    }
    let snapshot = codec.open(&snapshot_path)?;
    let epoch = Epoch::open(manifest.epoch, snapshot, &tombstones, options.synchronous)?;
    let deltas = SlotPair::try_from_fn(|slot| {
        DeltaStore::open(
            slot,
            &layout.delta(slot, manifest.delta_generations[slot]),
            manifest.delta_generations[slot],
            &epoch,
        )
    })?;

    if let Some(frozen) = manifest.frozen {
        let folded = fold_frozen(layout, &epoch, &deltas, &mut manifest, frozen)?;
        info!(
            folded,
            slot = frozen.label(),
            active = manifest.active.label(),
            "store.recovery.frozen_folded"
        );
    } else if manifest.staging.any() {
        let mut next = manifest.clone();
        next.staging = StagingFlags::default();
        next.store(&layout.manifest())?;
        manifest = next;
    }

    info!(
        epoch = manifest.epoch,
        snapshot_triples = epoch.snapshot().triple_count(),
        tombstones = epoch.deletes().count(),
        delta_a = deltas[DeltaSlot::A].len(),
        delta_b = deltas[DeltaSlot::B].len(),
        "store.recovery.complete"
    );
    Ok(Recovered {
        manifest,
        epoch: Arc::new(epoch),
        deltas,
    })
}

fn remove_unreferenced(layout: &StoreLayout, manifest: &Manifest) -> Result<()> {
    for entry in std::fs::read_dir(layout.root())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let stale = match StoreLayout::classify(name) {
            Some(StoreFile::Manifest) => false,
            Some(StoreFile::Snapshot(epoch)) | Some(StoreFile::Tombstones(epoch)) => {
                epoch != manifest.epoch
            }
            Some(StoreFile::Delta(slot, generation)) => {
                generation != manifest.delta_generations[slot]
            }
            None => name == format!("{MANIFEST_FILE}.tmp"),
        };
        if stale {
            let path = entry.path();
            remove_if_exists(&path)?;
            warn!(path = %path.display(), "store.recovery.unreferenced_removed");
        }
    }
    Ok(())
}
