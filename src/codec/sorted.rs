use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::codec::{Snapshot, SnapshotCodec, SnapshotScan};
use crate::error::{Result, StoreError};
use crate::primitives::bitmap::Bitmap;
use crate::primitives::io::atomic_write;
use crate::types::{Checksum, Crc32Fast, IdPattern, IdTriple, Role, Term, TermId, Triple};

const INDEX_MAGIC: [u8; 4] = *b"TRNX";
const INDEX_FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 8 + 5 * 8;
const FOOTER_LEN: usize = 4;

/// Reference codec: a CRC-checked file holding a four-section dictionary
/// (shared, subject-only, predicates, object-only) and the triples sorted in
/// SPO order.
///
/// Identifiers follow the section layout: shared terms take `1..=S` in both
/// the subject and object spaces, subject-only terms continue the subject
/// space and object-only terms continue the object space. The ordinal of a
/// triple is its position in SPO order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortedIndexCodec;

impl SortedIndexCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }
}

impl SnapshotCodec for SortedIndexCodec {
    fn name(&self) -> &'static str {
        "sorted-index"
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn Snapshot>> {
        Ok(Arc::new(SortedSnapshot::load(path)?))
    }

    fn build(&self, triples: &mut dyn Iterator<Item = Result<Triple>>, out: &Path) -> Result<u64> {
        let mut distinct = BTreeSet::new();
        for triple in triples {
            let triple = triple?;
            triple.validate()?;
            distinct.insert(triple);
        }
        write_index(out, &distinct)
    }

    fn diff(&self, input: &Path, deletes: &Bitmap, out: &Path) -> Result<u64> {
        let snapshot = SortedSnapshot::load(input)?;
        let kept: Vec<IdTriple> = snapshot
            .triples
            .iter()
            .enumerate()
            .filter(|(ordinal, _)| !deletes.get(*ordinal as u64))
            .map(|(_, triple)| *triple)
            .collect();
        let count = kept.len() as u64;
        let filtered = SortedSnapshot {
            triples: kept,
            ..snapshot
        };
        atomic_write(out, &filtered.encode_file())?;
        debug!(
            input = %input.display(),
            dropped = deletes.count_ones(),
            kept = count,
            "codec.sorted.diff"
        );
        Ok(count)
    }

    fn cat(&self, a: &Path, b: &Path, out: &Path) -> Result<u64> {
        let mut distinct = BTreeSet::new();
        for path in [a, b] {
            let snapshot = SortedSnapshot::load(path)?;
            for triple in &snapshot.triples {
                distinct.insert(snapshot.decode_triple(*triple)?);
            }
        }
        write_index(out, &distinct)
    }
}

/// In-memory form of a sorted index file.
#[derive(Debug, Clone, PartialEq)]
pub struct SortedSnapshot {
    shared: Vec<Term>,
    subjects: Vec<Term>,
    predicates: Vec<Term>,
    objects: Vec<Term>,
    triples: Vec<IdTriple>,
}

impl SortedSnapshot {
    /// Reads and validates an index file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::decode_file(&bytes).map_err(|err| match err {
            StoreError::Corruption(msg) => {
                StoreError::Corruption(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    fn lookup(section: &[Term], term: &Term) -> Option<u64> {
        section.binary_search(term).ok().map(|idx| idx as u64)
    }

    fn encode_file(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_FORMAT_VERSION.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        for count in [
            self.shared.len(),
            self.subjects.len(),
            self.predicates.len(),
            self.objects.len(),
            self.triples.len(),
        ] {
            buf.extend_from_slice(&(count as u64).to_be_bytes());
        }
        for section in [&self.shared, &self.subjects, &self.predicates, &self.objects] {
            for term in section.iter() {
                let text = term.to_string();
                buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
            }
        }
        for triple in &self.triples {
            buf.extend_from_slice(&triple.subject.0.to_be_bytes());
            buf.extend_from_slice(&triple.predicate.0.to_be_bytes());
            buf.extend_from_slice(&triple.object.0.to_be_bytes());
        }
        let mut crc = Crc32Fast::default();
        crc.update(&buf);
        buf.extend_from_slice(&crc.finalize().to_be_bytes());
        buf
    }

    fn decode_file(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + FOOTER_LEN {
            return Err(corruption("index truncated"));
        }
        let (body, footer) = bytes.split_at(bytes.len() - FOOTER_LEN);
        let mut crc = Crc32Fast::default();
        crc.update(body);
        if crc.finalize() != u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]) {
            return Err(corruption("index crc mismatch"));
        }
        let mut cursor = Cursor { bytes: body, pos: 0 };
        if cursor.take(4)? != INDEX_MAGIC {
            return Err(corruption("index magic mismatch"));
        }
        let version = cursor.take(2)?;
        if u16::from_be_bytes([version[0], version[1]]) != INDEX_FORMAT_VERSION {
            return Err(corruption("index format version mismatch"));
        }
        cursor.take(2)?;
        let mut counts = [0u64; 5];
        for count in counts.iter_mut() {
            *count = cursor.u64()?;
        }
        let [shared, subjects, predicates, objects, triples] = counts;
        let shared = cursor.section(shared)?;
        let subjects = cursor.section(subjects)?;
        let predicates = cursor.section(predicates)?;
        let objects = cursor.section(objects)?;
        let triple_bytes = triples
            .checked_mul(24)
            .ok_or_else(|| corruption("triple count overflow"))?;
        if cursor.remaining() as u64 != triple_bytes {
            return Err(corruption("triple section length mismatch"));
        }
        let mut decoded = Vec::with_capacity(triples as usize);
        for _ in 0..triples {
            decoded.push(IdTriple::new(cursor.u64()?, cursor.u64()?, cursor.u64()?));
        }
        let snapshot = Self {
            shared,
            subjects,
            predicates,
            objects,
            triples: decoded,
        };
        snapshot.check_triples()?;
        Ok(snapshot)
    }

    fn check_triples(&self) -> Result<()> {
        if !self.triples.windows(2).all(|w| w[0] < w[1]) {
            return Err(corruption("triples not in strict SPO order"));
        }
        for triple in &self.triples {
            for role in Role::ALL {
                let id = triple.get(role);
                if id.0 == 0 || id.0 > self.id_space(role) {
                    return Err(corruption("triple references unknown identifier"));
                }
            }
        }
        Ok(())
    }

    fn range(&self, pattern: &IdPattern) -> (usize, usize) {
        let Some(subject) = pattern.subject else {
            return (0, self.triples.len());
        };
        let start = self.triples.partition_point(|t| t.subject < subject);
        let end = self.triples.partition_point(|t| t.subject <= subject);
        match pattern.predicate {
            Some(predicate) => {
                let slice = &self.triples[start..end];
                let lo = slice.partition_point(|t| t.predicate < predicate);
                let hi = slice.partition_point(|t| t.predicate <= predicate);
                (start + lo, start + hi)
            }
            None => (start, end),
        }
    }
}

impl Snapshot for SortedSnapshot {
    fn triple_count(&self) -> u64 {
        self.triples.len() as u64
    }

    fn id_space(&self, role: Role) -> u64 {
        let shared = self.shared.len() as u64;
        match role {
            Role::Subject => shared + self.subjects.len() as u64,
            Role::Predicate => self.predicates.len() as u64,
            Role::Object => shared + self.objects.len() as u64,
        }
    }

    fn encode(&self, term: &Term, role: Role) -> Result<Option<TermId>> {
        let shared = self.shared.len() as u64;
        let id = match role {
            Role::Predicate => Self::lookup(&self.predicates, term).map(|idx| idx + 1),
            Role::Subject | Role::Object => {
                let own = if role == Role::Subject {
                    &self.subjects
                } else {
                    &self.objects
                };
                Self::lookup(&self.shared, term)
                    .map(|idx| idx + 1)
                    .or_else(|| Self::lookup(own, term).map(|idx| shared + idx + 1))
            }
        };
        Ok(id.map(TermId))
    }

    fn decode(&self, id: TermId, role: Role) -> Result<Term> {
        let invalid = || StoreError::Invalid(format!("{} id {id} out of range", role.label()));
        let idx = id.0.checked_sub(1).ok_or_else(invalid)? as usize;
        let shared = self.shared.len();
        let term = match role {
            Role::Predicate => self.predicates.get(idx),
            Role::Subject if idx < shared => self.shared.get(idx),
            Role::Subject => self.subjects.get(idx - shared),
            Role::Object if idx < shared => self.shared.get(idx),
            Role::Object => self.objects.get(idx - shared),
        };
        term.cloned().ok_or_else(invalid)
    }

    fn ordinal_of(&self, triple: IdTriple) -> Option<u64> {
        self.triples
            .binary_search(&triple)
            .ok()
            .map(|idx| idx as u64)
    }

    fn triple_at(&self, ordinal: u64) -> Option<IdTriple> {
        self.triples.get(ordinal as usize).copied()
    }

    fn scan(self: Arc<Self>, pattern: IdPattern) -> SnapshotScan {
        let (pos, end) = self.range(&pattern);
        Box::new(SortedScan {
            snapshot: self,
            pattern,
            pos,
            end,
        })
    }
}

struct SortedScan {
    snapshot: Arc<SortedSnapshot>,
    pattern: IdPattern,
    pos: usize,
    end: usize,
}

impl Iterator for SortedScan {
    type Item = Result<(u64, IdTriple)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.end {
            let ordinal = self.pos;
            self.pos += 1;
            let triple = self.snapshot.triples[ordinal];
            if self.pattern.matches(&triple) {
                return Some(Ok((ordinal as u64, triple)));
            }
        }
        None
    }
}

fn write_index(out: &Path, distinct: &BTreeSet<Triple>) -> Result<u64> {
    let mut subjects = BTreeSet::new();
    let mut predicates = BTreeSet::new();
    let mut objects = BTreeSet::new();
    for triple in distinct {
        subjects.insert(&triple.subject);
        predicates.insert(&triple.predicate);
        objects.insert(&triple.object);
    }
    let shared: Vec<Term> = subjects
        .intersection(&objects)
        .map(|t| (*t).clone())
        .collect();
    let subject_only: Vec<Term> = subjects.difference(&objects).map(|t| (*t).clone()).collect();
    let object_only: Vec<Term> = objects.difference(&subjects).map(|t| (*t).clone()).collect();
    let mut snapshot = SortedSnapshot {
        shared,
        subjects: subject_only,
        predicates: predicates.into_iter().cloned().collect(),
        objects: object_only,
        triples: Vec::with_capacity(distinct.len()),
    };
    for triple in distinct {
        let encoded = IdTriple {
            subject: require(snapshot.encode(&triple.subject, Role::Subject)?)?,
            predicate: require(snapshot.encode(&triple.predicate, Role::Predicate)?)?,
            object: require(snapshot.encode(&triple.object, Role::Object)?)?,
        };
        snapshot.triples.push(encoded);
    }
    snapshot.triples.sort_unstable();
    atomic_write(out, &snapshot.encode_file())?;
    Ok(snapshot.triples.len() as u64)
}

fn require(id: Option<TermId>) -> Result<TermId> {
    id.ok_or_else(|| corruption("dictionary is missing a term it was built from"))
}

fn corruption(msg: &str) -> StoreError {
    StoreError::Corruption(msg.to_string())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corruption("index section truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_be_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn section(&mut self, count: u64) -> Result<Vec<Term>> {
        let mut terms: Vec<Term> = Vec::new();
        for _ in 0..count {
            let len = self.u32()? as usize;
            let raw = self.take(len)?;
            let text =
                std::str::from_utf8(raw).map_err(|_| corruption("dictionary entry not utf-8"))?;
            let term = Term::parse(text)
                .map_err(|err| StoreError::Corruption(format!("dictionary entry: {err}")))?;
            if terms.last().is_some_and(|prev| *prev >= term) {
                return Err(corruption("dictionary section not sorted"));
            }
            terms.push(term);
        }
        Ok(terms)
    }
}
