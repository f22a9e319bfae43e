#![forbid(unsafe_code)]

use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError, WriteError};
use crate::primitives::journal::{Journal, JournalKind};
use crate::storage::epoch::Epoch;
use crate::types::{Term, TermId, Triple};

/// One of the two delta buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaSlot {
    /// First buffer.
    A,
    /// Second buffer.
    B,
}

impl DeltaSlot {
    /// Both slots.
    pub const BOTH: [DeltaSlot; 2] = [DeltaSlot::A, DeltaSlot::B];

    /// The opposite slot.
    pub fn other(self) -> Self {
        match self {
            DeltaSlot::A => DeltaSlot::B,
            DeltaSlot::B => DeltaSlot::A,
        }
    }

    /// Lowercase label used in file names.
    pub fn label(self) -> &'static str {
        match self {
            DeltaSlot::A => "a",
            DeltaSlot::B => "b",
        }
    }

    pub(crate) fn from_label(label: &str) -> Option<Self> {
        match label {
            "a" => Some(DeltaSlot::A),
            "b" => Some(DeltaSlot::B),
            _ => None,
        }
    }
}

/// A value per delta slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPair<T> {
    /// Value for slot A.
    pub a: T,
    /// Value for slot B.
    pub b: T,
}

impl<T> SlotPair<T> {
    /// Builds a pair from per-slot values.
    pub fn new(a: T, b: T) -> Self {
        Self { a, b }
    }

    /// Builds a pair by calling `f` for each slot.
    pub fn try_from_fn<E>(
        mut f: impl FnMut(DeltaSlot) -> std::result::Result<T, E>,
    ) -> std::result::Result<Self, E> {
        Ok(Self {
            a: f(DeltaSlot::A)?,
            b: f(DeltaSlot::B)?,
        })
    }
}

impl<T> Index<DeltaSlot> for SlotPair<T> {
    type Output = T;

    fn index(&self, slot: DeltaSlot) -> &T {
        match slot {
            DeltaSlot::A => &self.a,
            DeltaSlot::B => &self.b,
        }
    }
}

impl<T> IndexMut<DeltaSlot> for SlotPair<T> {
    fn index_mut(&mut self, slot: DeltaSlot) -> &mut T {
        match slot {
            DeltaSlot::A => &mut self.a,
            DeltaSlot::B => &mut self.b,
        }
    }
}

/// A delta-resident term: a snapshot identifier of the encoding epoch when
/// the snapshot dictionary has the term in that role, the raw term otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeltaTerm {
    /// Identifier in the encoding epoch.
    Id(TermId),
    /// Term absent from the snapshot dictionary.
    Raw(Term),
}

impl DeltaTerm {
    /// Identifier, when encoded.
    pub fn id(&self) -> Option<TermId> {
        match self {
            DeltaTerm::Id(id) => Some(*id),
            DeltaTerm::Raw(_) => None,
        }
    }
}

/// Triple as held by a delta store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeltaTriple {
    /// Subject.
    pub subject: DeltaTerm,
    /// Predicate.
    pub predicate: DeltaTerm,
    /// Object.
    pub object: DeltaTerm,
}

/// Delta-side pattern, encoded against the same epoch as the stores.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaPattern {
    /// Bound subject.
    pub subject: Option<DeltaTerm>,
    /// Bound predicate.
    pub predicate: Option<DeltaTerm>,
    /// Bound object.
    pub object: Option<DeltaTerm>,
}

impl DeltaPattern {
    /// Returns true when `triple` satisfies every bound position.
    pub fn matches(&self, triple: &DeltaTriple) -> bool {
        self.subject.as_ref().map_or(true, |t| *t == triple.subject)
            && self.predicate.as_ref().map_or(true, |t| *t == triple.predicate)
            && self.object.as_ref().map_or(true, |t| *t == triple.object)
    }
}

const RECORD_INSERT: u8 = 1;
const RECORD_REMOVE: u8 = 2;

/// Journal record of a delta store. Terms are stored in canonical form so a
/// journal replays against whatever epoch is current at open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeltaRecord {
    Insert(Triple),
    Remove(Triple),
}

impl DeltaRecord {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let (tag, triple) = match self {
            DeltaRecord::Insert(triple) => (RECORD_INSERT, triple),
            DeltaRecord::Remove(triple) => (RECORD_REMOVE, triple),
        };
        let mut buf = vec![tag];
        for term in [&triple.subject, &triple.predicate, &triple.object] {
            let text = term.to_string();
            buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
            buf.extend_from_slice(text.as_bytes());
        }
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| StoreError::Corruption(format!("delta record: {what}"));
        let (&tag, mut rest) = bytes.split_first().ok_or_else(|| corrupt("empty"))?;
        let mut terms = Vec::with_capacity(3);
        for _ in 0..3 {
            if rest.len() < 4 {
                return Err(corrupt("truncated length"));
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if rest.len() < len {
                return Err(corrupt("truncated term"));
            }
            let text = std::str::from_utf8(&rest[..len]).map_err(|_| corrupt("term not utf-8"))?;
            terms.push(Term::parse(text)?);
            rest = &rest[len..];
        }
        if !rest.is_empty() {
            return Err(corrupt("trailing bytes"));
        }
        let object = terms.pop().ok_or_else(|| corrupt("missing object"))?;
        let predicate = terms.pop().ok_or_else(|| corrupt("missing predicate"))?;
        let subject = terms.pop().ok_or_else(|| corrupt("missing subject"))?;
        let triple = Triple::new(subject, predicate, object)?;
        match tag {
            RECORD_INSERT => Ok(DeltaRecord::Insert(triple)),
            RECORD_REMOVE => Ok(DeltaRecord::Remove(triple)),
            _ => Err(corrupt("unknown tag")),
        }
    }
}

struct DeltaInner {
    triples: FxHashSet<DeltaTriple>,
    encoded_epoch: u64,
    journal: Journal,
    generation: u64,
}

/// Mutable triple set of one slot, backed by its journal.
pub struct DeltaStore {
    slot: DeltaSlot,
    inner: RwLock<DeltaInner>,
    writes: AtomicU64,
}

impl std::fmt::Debug for DeltaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("DeltaStore")
            .field("slot", &self.slot)
            .field("len", &inner.triples.len())
            .field("encoded_epoch", &inner.encoded_epoch)
            .field("generation", &inner.generation)
            .finish()
    }
}

impl DeltaStore {
    /// Opens the slot's journal at `generation` and replays it against `epoch`.
    pub(crate) fn open(
        slot: DeltaSlot,
        path: &Path,
        generation: u64,
        epoch: &Epoch,
    ) -> Result<Self> {
        let (journal, records) = Journal::open(path, JournalKind::Delta)?;
        let mut triples = FxHashSet::default();
        for raw in records {
            match DeltaRecord::decode(&raw)? {
                DeltaRecord::Insert(triple) => {
                    let encoded = epoch.encode_delta(&triple)?;
                    epoch.note_delta_usage(&encoded);
                    triples.insert(encoded);
                }
                DeltaRecord::Remove(triple) => {
                    triples.remove(&epoch.encode_delta(&triple)?);
                }
            }
        }
        Ok(Self {
            slot,
            inner: RwLock::new(DeltaInner {
                triples,
                encoded_epoch: epoch.number(),
                journal,
                generation,
            }),
            writes: AtomicU64::new(0),
        })
    }

    /// Slot served by this store.
    pub fn slot(&self) -> DeltaSlot {
        self.slot
    }

    /// Inserts an encoded triple, journaling its canonical form first. Returns
    /// false when it was already present.
    pub(crate) fn insert(
        &self,
        triple: &Triple,
        encoded: DeltaTriple,
        sync: bool,
    ) -> std::result::Result<bool, WriteError> {
        let mut inner = self.inner.write();
        if inner.triples.contains(&encoded) {
            return Ok(false);
        }
        let record = DeltaRecord::Insert(triple.clone()).encode();
        inner
            .journal
            .append_synced(&record, sync)
            .map_err(WriteError::Journal)?;
        inner.triples.insert(encoded);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Removes an encoded triple, journaling the removal first. Returns false
    /// when it was absent.
    pub(crate) fn remove(
        &self,
        triple: &Triple,
        encoded: &DeltaTriple,
        sync: bool,
    ) -> std::result::Result<bool, WriteError> {
        let mut inner = self.inner.write();
        if !inner.triples.contains(encoded) {
            return Ok(false);
        }
        let record = DeltaRecord::Remove(triple.clone()).encode();
        inner
            .journal
            .append_synced(&record, sync)
            .map_err(WriteError::Journal)?;
        inner.triples.remove(encoded);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Appends every triple in `entries` as one durable batch, then adds them.
    pub(crate) fn absorb(&self, entries: &[(Triple, DeltaTriple)]) -> Result<()> {
        let mut inner = self.inner.write();
        for (triple, encoded) in entries {
            if inner.triples.contains(encoded) {
                continue;
            }
            inner
                .journal
                .append(&DeltaRecord::Insert(triple.clone()).encode())?;
        }
        inner.journal.sync()?;
        for (_, encoded) in entries {
            inner.triples.insert(encoded.clone());
        }
        Ok(())
    }

    /// Returns true when the exact encoded triple is present.
    pub fn contains(&self, encoded: &DeltaTriple) -> bool {
        self.inner.read().triples.contains(encoded)
    }

    /// Number of triples.
    pub fn len(&self) -> usize {
        self.inner.read().triples.len()
    }

    /// Returns true when the store holds no triples.
    pub fn is_empty(&self) -> bool {
        self.inner.read().triples.is_empty()
    }

    /// Copies the triples matching `pattern`.
    pub(crate) fn matches(&self, pattern: &DeltaPattern) -> Vec<DeltaTriple> {
        let inner = self.inner.read();
        if let (Some(subject), Some(predicate), Some(object)) =
            (&pattern.subject, &pattern.predicate, &pattern.object)
        {
            let probe = DeltaTriple {
                subject: subject.clone(),
                predicate: predicate.clone(),
                object: object.clone(),
            };
            return inner.triples.get(&probe).cloned().into_iter().collect();
        }
        inner
            .triples
            .iter()
            .filter(|t| pattern.matches(t))
            .cloned()
            .collect()
    }

    /// Copies every triple.
    pub(crate) fn snapshot_triples(&self) -> Vec<DeltaTriple> {
        self.inner.read().triples.iter().cloned().collect()
    }

    /// Epoch against which the held identifiers were encoded.
    pub fn epoch_of_encoding(&self) -> u64 {
        self.inner.read().encoded_epoch
    }

    /// Writes accepted since the last counter reset.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_counter(&self) {
        self.writes.store(0, Ordering::Relaxed);
    }

    /// Replaces the in-memory encodings after a snapshot swap. The journal
    /// holds canonical terms and is left unchanged.
    pub(crate) fn replace_encodings(&self, triples: FxHashSet<DeltaTriple>, epoch: u64) {
        let mut inner = self.inner.write();
        inner.triples = triples;
        inner.encoded_epoch = epoch;
    }

    /// Empties the store and switches it to a fresh journal, returning the
    /// path of the journal it replaced.
    pub(crate) fn reset(&self, journal: Journal, generation: u64, epoch: u64) -> PathBuf {
        let mut inner = self.inner.write();
        let old = std::mem::replace(&mut inner.journal, journal);
        inner.triples.clear();
        inner.generation = generation;
        inner.encoded_epoch = epoch;
        self.writes.store(0, Ordering::Relaxed);
        old.path().to_path_buf()
    }

    /// Flushes the journal.
    pub fn sync(&self) -> Result<()> {
        self.inner.write().journal.sync()?;
        Ok(())
    }
}
