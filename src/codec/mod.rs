//! Snapshot codec boundary.
//!
//! The hybrid store never looks inside a snapshot file. It reads snapshots
//! through [`Snapshot`] and produces new ones through the file-to-file
//! transforms of [`SnapshotCodec`].

mod sorted;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::primitives::bitmap::Bitmap;
use crate::types::{IdPattern, IdTriple, Role, Term, TermId, Triple};

pub use sorted::{SortedIndexCodec, SortedSnapshot};

/// Lazy scan over snapshot matches as `(ordinal, triple)` pairs, in ordinal
/// order.
pub type SnapshotScan = Box<dyn Iterator<Item = Result<(u64, IdTriple)>> + Send>;

/// Immutable, dictionary-encoded, ordinal-addressable triple index.
pub trait Snapshot: Send + Sync + fmt::Debug {
    /// Number of triples; ordinals are `0..triple_count()`.
    fn triple_count(&self) -> u64;

    /// Largest identifier in the role's id space.
    fn id_space(&self, role: Role) -> u64;

    /// Looks `term` up in the role's dictionary.
    fn encode(&self, term: &Term, role: Role) -> Result<Option<TermId>>;

    /// Resolves an identifier of the role's id space.
    fn decode(&self, id: TermId, role: Role) -> Result<Term>;

    /// Ordinal of an exact triple, if present.
    fn ordinal_of(&self, triple: IdTriple) -> Option<u64>;

    /// Triple stored at `ordinal`.
    fn triple_at(&self, ordinal: u64) -> Option<IdTriple>;

    /// Lazily scans triples matching `pattern`.
    fn scan(self: Arc<Self>, pattern: IdPattern) -> SnapshotScan;

    /// Decodes all three positions of an encoded triple.
    fn decode_triple(&self, triple: IdTriple) -> Result<Triple> {
        Ok(Triple {
            subject: self.decode(triple.subject, Role::Subject)?,
            predicate: self.decode(triple.predicate, Role::Predicate)?,
            object: self.decode(triple.object, Role::Object)?,
        })
    }
}

/// Produces and opens snapshot files. Every transform writes a new file and
/// leaves its inputs untouched.
pub trait SnapshotCodec: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Opens a snapshot file.
    fn open(&self, path: &Path) -> Result<Arc<dyn Snapshot>>;

    /// Builds a snapshot from canonical triples; duplicates collapse. Returns
    /// the number of distinct triples written.
    fn build(&self, triples: &mut dyn Iterator<Item = Result<Triple>>, out: &Path) -> Result<u64>;

    /// Writes `input` without the ordinals set in `deletes`.
    fn diff(&self, input: &Path, deletes: &Bitmap, out: &Path) -> Result<u64>;

    /// Writes the union of two snapshots under a rebuilt dictionary.
    fn cat(&self, a: &Path, b: &Path, out: &Path) -> Result<u64>;
}
