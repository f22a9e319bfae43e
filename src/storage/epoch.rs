use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::codec::Snapshot;
use crate::error::{Result, StoreError};
use crate::primitives::bitmap::{AtomicBitmap, Bitmap};
use crate::primitives::journal::{Journal, JournalKind};
use crate::storage::delta::{DeltaTerm, DeltaTriple};
use crate::storage::options::Synchronous;
use crate::types::{IdPattern, IdTriple, Role, Term, TermId, Triple};

/// One bitmap per role id space.
#[derive(Debug, Default)]
pub struct RoleBitmaps<T> {
    /// Subject space, including the shared section.
    pub subject: T,
    /// Predicate space.
    pub predicate: T,
    /// Object space, including the shared section.
    pub object: T,
}

impl<T> RoleBitmaps<T> {
    /// Bitmap of `role`.
    pub fn get(&self, role: Role) -> &T {
        match role {
            Role::Subject => &self.subject,
            Role::Predicate => &self.predicate,
            Role::Object => &self.object,
        }
    }
}

/// Tombstone bits of one snapshot, persisted through its journal. A bit is
/// logged before it becomes visible.
#[derive(Debug)]
pub struct DeleteBitmap {
    bits: AtomicBitmap,
    journal: Mutex<Journal>,
    synchronous: Synchronous,
}

impl DeleteBitmap {
    fn open(path: &Path, triples: u64, synchronous: Synchronous, fresh: bool) -> Result<Self> {
        let bits = AtomicBitmap::new(triples);
        let journal = if fresh {
            Journal::create(path, JournalKind::Tombstone)?
        } else {
            let (journal, records) = Journal::open(path, JournalKind::Tombstone)?;
            for raw in records {
                let raw: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    StoreError::Corruption(format!("{}: bad tombstone record", path.display()))
                })?;
                let ordinal = u64::from_be_bytes(raw);
                if ordinal >= triples {
                    return Err(StoreError::Corruption(format!(
                        "{}: tombstone ordinal {ordinal} beyond {triples} triples",
                        path.display()
                    )));
                }
                bits.set(ordinal);
            }
            journal
        };
        Ok(Self {
            bits,
            journal: Mutex::new(journal),
            synchronous,
        })
    }

    /// Returns true when `ordinal` is tombstoned.
    pub fn is_set(&self, ordinal: u64) -> bool {
        self.bits.get(ordinal)
    }

    /// Tombstones `ordinal`. Returns false when it already was.
    pub fn mark(&self, ordinal: u64) -> std::io::Result<bool> {
        let mut journal = self.journal.lock();
        if self.bits.get(ordinal) || ordinal >= self.bits.len() {
            return Ok(false);
        }
        journal.append_synced(&ordinal.to_be_bytes(), self.synchronous == Synchronous::Full)?;
        Ok(self.bits.set(ordinal))
    }

    /// Tombstoned ordinals.
    pub fn count(&self) -> u64 {
        self.bits.count_ones()
    }

    /// Point-in-time copy of the bits.
    pub fn to_bitmap(&self) -> Bitmap {
        self.bits.to_bitmap()
    }

    /// Flushes the journal.
    pub fn sync(&self) -> Result<()> {
        self.journal.lock().sync()?;
        Ok(())
    }
}

/// Everything that lives exactly as long as one snapshot: the snapshot with
/// its membership, tombstone and delta usage bitmaps.
#[derive(Debug)]
pub struct Epoch {
    number: u64,
    snapshot: Arc<dyn Snapshot>,
    membership: RoleBitmaps<Bitmap>,
    deletes: DeleteBitmap,
    usage: RoleBitmaps<AtomicBitmap>,
}

impl Epoch {
    /// Loads an epoch, replaying the tombstone journal at `tombstones`.
    pub fn open(
        number: u64,
        snapshot: Arc<dyn Snapshot>,
        tombstones: &Path,
        synchronous: Synchronous,
    ) -> Result<Self> {
        Self::build(number, snapshot, tombstones, synchronous, false)
    }

    /// Creates an epoch with an empty tombstone journal at `tombstones`.
    pub fn create(
        number: u64,
        snapshot: Arc<dyn Snapshot>,
        tombstones: &Path,
        synchronous: Synchronous,
    ) -> Result<Self> {
        Self::build(number, snapshot, tombstones, synchronous, true)
    }

    fn build(
        number: u64,
        snapshot: Arc<dyn Snapshot>,
        tombstones: &Path,
        synchronous: Synchronous,
        fresh: bool,
    ) -> Result<Self> {
        let mut membership = RoleBitmaps {
            subject: Bitmap::new(snapshot.id_space(Role::Subject)),
            predicate: Bitmap::new(snapshot.id_space(Role::Predicate)),
            object: Bitmap::new(snapshot.id_space(Role::Object)),
        };
        for entry in Arc::clone(&snapshot).scan(IdPattern::any()) {
            let (_, triple) = entry?;
            membership.subject.set(triple.subject.bit());
            membership.predicate.set(triple.predicate.bit());
            membership.object.set(triple.object.bit());
        }
        let usage = RoleBitmaps {
            subject: AtomicBitmap::new(snapshot.id_space(Role::Subject)),
            predicate: AtomicBitmap::new(snapshot.id_space(Role::Predicate)),
            object: AtomicBitmap::new(snapshot.id_space(Role::Object)),
        };
        let deletes = DeleteBitmap::open(tombstones, snapshot.triple_count(), synchronous, fresh)?;
        debug!(
            epoch = number,
            triples = snapshot.triple_count(),
            tombstones = deletes.count(),
            "store.epoch.loaded"
        );
        Ok(Self {
            number,
            snapshot,
            membership,
            deletes,
            usage,
        })
    }

    /// Epoch number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Snapshot of this epoch.
    pub fn snapshot(&self) -> &Arc<dyn Snapshot> {
        &self.snapshot
    }

    /// Tombstones against this epoch's snapshot.
    pub fn deletes(&self) -> &DeleteBitmap {
        &self.deletes
    }

    /// Membership bitmaps.
    pub fn membership(&self) -> &RoleBitmaps<Bitmap> {
        &self.membership
    }

    /// Snapshot triples not tombstoned.
    pub fn live_snapshot_triples(&self) -> u64 {
        self.snapshot.triple_count() - self.deletes.count()
    }

    /// Dictionary lookup gated by the membership bitmap.
    pub fn member_id(&self, term: &Term, role: Role) -> Result<Option<TermId>> {
        Ok(self
            .snapshot
            .encode(term, role)?
            .filter(|id| self.membership.get(role).get(id.bit())))
    }

    /// Ordinal of `triple` in this snapshot, tombstoned or not.
    pub fn snapshot_ordinal(&self, triple: &Triple) -> Result<Option<u64>> {
        let (Some(subject), Some(predicate), Some(object)) = (
            self.member_id(&triple.subject, Role::Subject)?,
            self.member_id(&triple.predicate, Role::Predicate)?,
            self.member_id(&triple.object, Role::Object)?,
        ) else {
            return Ok(None);
        };
        Ok(self.snapshot.ordinal_of(IdTriple {
            subject,
            predicate,
            object,
        }))
    }

    /// Returns true when `triple` is in the snapshot and not tombstoned.
    pub fn is_live_in_snapshot(&self, triple: &Triple) -> Result<bool> {
        Ok(self
            .snapshot_ordinal(triple)?
            .is_some_and(|ordinal| !self.deletes.is_set(ordinal)))
    }

    /// Encodes one term for delta storage.
    pub fn encode_term(&self, term: &Term, role: Role) -> Result<DeltaTerm> {
        Ok(match self.snapshot.encode(term, role)? {
            Some(id) => DeltaTerm::Id(id),
            None => DeltaTerm::Raw(term.clone()),
        })
    }

    /// Encodes a triple for delta storage.
    pub fn encode_delta(&self, triple: &Triple) -> Result<DeltaTriple> {
        Ok(DeltaTriple {
            subject: self.encode_term(&triple.subject, Role::Subject)?,
            predicate: self.encode_term(&triple.predicate, Role::Predicate)?,
            object: self.encode_term(&triple.object, Role::Object)?,
        })
    }

    /// Decodes one delta term.
    pub fn decode_term(&self, term: &DeltaTerm, role: Role) -> Result<Term> {
        match term {
            DeltaTerm::Id(id) => self.snapshot.decode(*id, role),
            DeltaTerm::Raw(term) => Ok(term.clone()),
        }
    }

    /// Decodes a delta triple encoded against this epoch.
    pub fn decode_delta(&self, triple: &DeltaTriple) -> Result<Triple> {
        Ok(Triple {
            subject: self.decode_term(&triple.subject, Role::Subject)?,
            predicate: self.decode_term(&triple.predicate, Role::Predicate)?,
            object: self.decode_term(&triple.object, Role::Object)?,
        })
    }

    /// Records the identifiers a delta triple references.
    pub fn note_delta_usage(&self, triple: &DeltaTriple) {
        for (term, role) in [
            (&triple.subject, Role::Subject),
            (&triple.predicate, Role::Predicate),
            (&triple.object, Role::Object),
        ] {
            if let Some(id) = term.id() {
                self.usage.get(role).set(id.bit());
            }
        }
    }

    /// Returns false only when no delta triple references `id` in `role`.
    pub fn delta_may_use(&self, id: TermId, role: Role) -> bool {
        self.usage.get(role).get(id.bit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SnapshotCodec, SortedIndexCodec};
    use tempfile::tempdir;

    fn triple(line: &str) -> Triple {
        Triple::parse_line(line).unwrap()
    }

    fn epoch_with(dir: &Path, triples: &[Triple]) -> Result<Epoch> {
        let path = dir.join("snapshot-0.idx");
        let mut iter = triples.iter().cloned().map(Ok);
        SortedIndexCodec.build(&mut iter, &path)?;
        let snapshot = SortedIndexCodec.open(&path)?;
        Epoch::create(0, snapshot, &dir.join("tombstones-0.log"), Synchronous::Full)
    }

    #[test]
    fn tombstones_persist_across_reload() -> Result<()> {
        let dir = tempdir()?;
        let a = triple("<http://e/a> <http://e/p> <http://e/x> .");
        let b = triple("<http://e/b> <http://e/p> <http://e/x> .");
        let epoch = epoch_with(dir.path(), &[a.clone(), b.clone()])?;
        let ordinal = epoch.snapshot_ordinal(&a)?.expect("a in snapshot");
        assert!(epoch.deletes().mark(ordinal)?);
        assert!(!epoch.deletes().mark(ordinal)?);
        assert!(!epoch.is_live_in_snapshot(&a)?);
        assert!(epoch.is_live_in_snapshot(&b)?);
        assert_eq!(epoch.live_snapshot_triples(), 1);

        let snapshot = Arc::clone(epoch.snapshot());
        drop(epoch);
        let reopened = Epoch::open(
            0,
            snapshot,
            &dir.path().join("tombstones-0.log"),
            Synchronous::Full,
        )?;
        assert!(reopened.deletes().is_set(ordinal));
        assert_eq!(reopened.deletes().count(), 1);
        Ok(())
    }

    #[test]
    fn delta_encoding_uses_ids_only_for_dictionary_terms() -> Result<()> {
        let dir = tempdir()?;
        let epoch = epoch_with(
            dir.path(),
            &[triple("<http://e/a> <http://e/p> <http://e/x> .")],
        )?;
        let fresh = triple("<http://e/a> <http://e/p> <http://e/new> .");
        let encoded = epoch.encode_delta(&fresh)?;
        assert!(encoded.subject.id().is_some());
        assert!(encoded.predicate.id().is_some());
        assert_eq!(encoded.object, DeltaTerm::Raw(fresh.object.clone()));
        assert_eq!(epoch.decode_delta(&encoded)?, fresh);

        let p = encoded.predicate.id().expect("predicate id");
        assert!(!epoch.delta_may_use(p, Role::Predicate));
        epoch.note_delta_usage(&encoded);
        assert!(epoch.delta_may_use(p, Role::Predicate));
        Ok(())
    }

    #[test]
    fn out_of_range_tombstone_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let epoch = epoch_with(
            dir.path(),
            &[triple("<http://e/a> <http://e/p> <http://e/x> .")],
        )?;
        let snapshot = Arc::clone(epoch.snapshot());
        drop(epoch);
        let path = dir.path().join("tombstones-0.log");
        let mut journal = Journal::create(&path, JournalKind::Tombstone)?;
        journal.append(&5u64.to_be_bytes())?;
        journal.sync()?;
        drop(journal);
        let err = Epoch::open(0, snapshot, &path, Synchronous::Full).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
        Ok(())
    }
}
