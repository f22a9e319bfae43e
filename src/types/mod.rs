#![forbid(unsafe_code)]

//! Value types shared by the codec, the delta stores and the query surface.

pub mod checksum;
mod term;

use std::fmt;

pub use checksum::{record_crc32, Checksum, Crc32Fast};
pub use term::{Term, TermError, Triple, TriplePattern};

/// Dictionary identifier. Positive, and valid only inside the snapshot epoch
/// that assigned it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TermId(pub u64);

impl TermId {
    /// Zero-based position of the identifier inside its bitmap.
    pub fn bit(self) -> u64 {
        self.0.saturating_sub(1)
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TermId {
    fn from(value: u64) -> Self {
        TermId(value)
    }
}

/// Position of a term inside a triple; each role has its own id space.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Role {
    /// Subject space (shared section first, then subject-only terms).
    Subject,
    /// Predicate space.
    Predicate,
    /// Object space (shared section first, then object-only terms).
    Object,
}

impl Role {
    /// All roles in triple order.
    pub const ALL: [Role; 3] = [Role::Subject, Role::Predicate, Role::Object];

    /// Short lowercase label for logs.
    pub fn label(self) -> &'static str {
        match self {
            Role::Subject => "subject",
            Role::Predicate => "predicate",
            Role::Object => "object",
        }
    }
}

/// Triple of dictionary identifiers.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IdTriple {
    /// Subject id.
    pub subject: TermId,
    /// Predicate id.
    pub predicate: TermId,
    /// Object id.
    pub object: TermId,
}

impl IdTriple {
    /// Builds a triple from raw ids.
    pub fn new(subject: u64, predicate: u64, object: u64) -> Self {
        Self {
            subject: TermId(subject),
            predicate: TermId(predicate),
            object: TermId(object),
        }
    }

    /// Returns the id in the given role.
    pub fn get(&self, role: Role) -> TermId {
        match role {
            Role::Subject => self.subject,
            Role::Predicate => self.predicate,
            Role::Object => self.object,
        }
    }
}

/// Pattern over dictionary identifiers; `None` is a wildcard.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct IdPattern {
    /// Bound subject id.
    pub subject: Option<TermId>,
    /// Bound predicate id.
    pub predicate: Option<TermId>,
    /// Bound object id.
    pub object: Option<TermId>,
}

impl IdPattern {
    /// Pattern matching every triple.
    pub fn any() -> Self {
        Self::default()
    }

    /// Returns true when `triple` satisfies every bound position.
    pub fn matches(&self, triple: &IdTriple) -> bool {
        self.subject.map_or(true, |id| id == triple.subject)
            && self.predicate.map_or(true, |id| id == triple.predicate)
            && self.object.map_or(true, |id| id == triple.object)
    }
}
