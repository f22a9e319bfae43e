use std::sync::Arc;

use crate::codec::SnapshotScan;
use crate::error::LookupError;
use crate::storage::delta::DeltaTriple;
use crate::storage::epoch::Epoch;
use crate::types::Triple;

/// Lazy union of snapshot matches (minus tombstones) and delta matches.
///
/// Snapshot matches come first, in ordinal order; a tombstone is checked when
/// its ordinal is reached, so a delete issued mid-iteration may still hide a
/// later match. Delta matches were copied when the lookup started and are
/// decoded one at a time. The iterator pins the epoch it was created in.
pub struct MergedIter {
    epoch: Arc<Epoch>,
    snapshot: Option<SnapshotScan>,
    delta: std::vec::IntoIter<DeltaTriple>,
}

impl MergedIter {
    pub(crate) fn new(
        epoch: Arc<Epoch>,
        snapshot: Option<SnapshotScan>,
        delta: Vec<DeltaTriple>,
    ) -> Self {
        Self {
            epoch,
            snapshot,
            delta: delta.into_iter(),
        }
    }

    /// Epoch whose snapshot and encodings this iterator reads.
    pub fn epoch(&self) -> u64 {
        self.epoch.number()
    }
}

impl Iterator for MergedIter {
    type Item = Result<Triple, LookupError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(scan) = self.snapshot.as_mut() {
            for entry in scan.by_ref() {
                match entry {
                    Ok((ordinal, _)) if self.epoch.deletes().is_set(ordinal) => continue,
                    Ok((_, ids)) => {
                        return Some(
                            self.epoch
                                .snapshot()
                                .decode_triple(ids)
                                .map_err(LookupError::from),
                        )
                    }
                    Err(err) => return Some(Err(err.into())),
                }
            }
            self.snapshot = None;
        }
        let triple = self.delta.next()?;
        Some(self.epoch.decode_delta(&triple).map_err(LookupError::from))
    }
}

impl std::fmt::Debug for MergedIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedIter")
            .field("epoch", &self.epoch.number())
            .field("snapshot_pending", &self.snapshot.is_some())
            .field("delta_remaining", &self.delta.len())
            .finish()
    }
}
