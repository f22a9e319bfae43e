use rustc_hash::FxHashSet;
use tracing::warn;

use crate::storage::delta::{DeltaTerm, DeltaTriple};
use crate::storage::epoch::Epoch;
use crate::types::Role;

pub(crate) struct Remapped {
    pub(crate) triples: FxHashSet<DeltaTriple>,
    pub(crate) remapped: u64,
    pub(crate) failures: u64,
}

/// Re-encodes delta triples held against `old` so they address `new`.
///
/// A term the new snapshot fails to encode stays raw. A triple whose old
/// identifiers no longer decode is dropped from memory; its journal record is
/// untouched and replays on the next open.
pub(crate) fn remap(old: &Epoch, new: &Epoch, triples: Vec<DeltaTriple>) -> Remapped {
    let mut out = Remapped {
        triples: FxHashSet::default(),
        remapped: 0,
        failures: 0,
    };
    for triple in triples {
        let decoded = match old.decode_delta(&triple) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(
                    from_epoch = old.number(),
                    error = %err,
                    "store.compaction.remap_decode_failed"
                );
                out.failures += 1;
                continue;
            }
        };
        let mut encode = |term: &crate::types::Term, role: Role| match new.encode_term(term, role)
        {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    to_epoch = new.number(),
                    role = role.label(),
                    term = %term,
                    error = %err,
                    "store.compaction.remap_encode_failed"
                );
                out.failures += 1;
                DeltaTerm::Raw(term.clone())
            }
        };
        let remapped = DeltaTriple {
            subject: encode(&decoded.subject, Role::Subject),
            predicate: encode(&decoded.predicate, Role::Predicate),
            object: encode(&decoded.object, Role::Object),
        };
        new.note_delta_usage(&remapped);
        out.triples.insert(remapped);
        out.remapped += 1;
    }
    out
}
