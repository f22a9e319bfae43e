use serde::Serialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::error::Result;
use crate::storage::delta::{DeltaPattern, DeltaSlot, DeltaTerm};
use crate::storage::epoch::Epoch;
use crate::types::{IdPattern, Role, TermId, TriplePattern};

/// Which slots are live for reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct SlotState {
    pub(crate) active: DeltaSlot,
    pub(crate) frozen: Option<DeltaSlot>,
}

impl SlotState {
    pub(crate) fn readable(&self) -> SmallVec<[DeltaSlot; 2]> {
        let mut slots = SmallVec::new();
        slots.push(self.active);
        if let Some(frozen) = self.frozen {
            slots.push(frozen);
        }
        slots
    }
}

/// Sources a lookup has to touch.
#[derive(Clone, Debug)]
pub(crate) struct ScanPlan {
    pub(crate) snapshot: Option<IdPattern>,
    pub(crate) delta: Option<DeltaPattern>,
    pub(crate) slots: SmallVec<[DeltaSlot; 2]>,
}

/// Routing decision for a pattern, as reported by `HybridStore::explain`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoutePlan {
    /// Whether the snapshot is scanned.
    pub scan_snapshot: bool,
    /// Whether the delta stores are scanned.
    pub scan_delta: bool,
    /// Delta slots scanned when `scan_delta` is set.
    pub delta_slots: Vec<DeltaSlot>,
}

impl From<&ScanPlan> for RoutePlan {
    fn from(plan: &ScanPlan) -> Self {
        Self {
            scan_snapshot: plan.snapshot.is_some(),
            scan_delta: plan.delta.is_some(),
            delta_slots: if plan.delta.is_some() {
                plan.slots.to_vec()
            } else {
                Vec::new()
            },
        }
    }
}

/// Decides which sources can hold matches for `pattern`. A source is only
/// skipped when the bitmaps prove it holds none.
pub(crate) fn route(epoch: &Epoch, pattern: &TriplePattern, slots: SlotState) -> Result<ScanPlan> {
    let mut snapshot = Some(IdPattern::any());
    let mut delta = Some(DeltaPattern::default());
    for (bound, role) in [
        (&pattern.subject, Role::Subject),
        (&pattern.predicate, Role::Predicate),
        (&pattern.object, Role::Object),
    ] {
        let Some(term) = bound else {
            continue;
        };
        let id = epoch.snapshot().encode(term, role)?;
        let member = id.filter(|id| epoch.membership().get(role).get(id.bit()));
        match member {
            Some(id) => {
                if let Some(p) = snapshot.as_mut() {
                    set_id(p, role, id);
                }
            }
            None => snapshot = None,
        }
        let delta_term = match id {
            Some(id) if !epoch.delta_may_use(id, role) => None,
            Some(id) => Some(DeltaTerm::Id(id)),
            None => Some(DeltaTerm::Raw(term.clone())),
        };
        match delta_term {
            Some(term) => {
                if let Some(p) = delta.as_mut() {
                    set_delta(p, role, term);
                }
            }
            None => delta = None,
        }
    }
    let plan = ScanPlan {
        snapshot,
        delta,
        slots: slots.readable(),
    };
    debug!(
        epoch = epoch.number(),
        snapshot = plan.snapshot.is_some(),
        delta = plan.delta.is_some(),
        slots = plan.slots.len(),
        "store.router.plan"
    );
    Ok(plan)
}

fn set_id(pattern: &mut IdPattern, role: Role, id: TermId) {
    match role {
        Role::Subject => pattern.subject = Some(id),
        Role::Predicate => pattern.predicate = Some(id),
        Role::Object => pattern.object = Some(id),
    }
}

fn set_delta(pattern: &mut DeltaPattern, role: Role, term: DeltaTerm) {
    match role {
        Role::Subject => pattern.subject = Some(term),
        Role::Predicate => pattern.predicate = Some(term),
        Role::Object => pattern.object = Some(term),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SnapshotCodec, SortedIndexCodec};
    use crate::error::StoreError;
    use crate::storage::options::Synchronous;
    use crate::types::{Term, Triple};
    use tempfile::tempdir;

    const SLOTS: SlotState = SlotState {
        active: DeltaSlot::A,
        frozen: None,
    };

    fn epoch() -> Result<(tempfile::TempDir, Epoch)> {
        let dir = tempdir()?;
        let path = dir.path().join("snapshot-0.idx");
        let mut iter = [
            "<http://e/a> <http://e/p> <http://e/x> .",
            "<http://e/b> <http://e/q> \"v\" .",
        ]
        .into_iter()
        .map(|line| Triple::parse_line(line).map_err(StoreError::from));
        SortedIndexCodec.build(&mut iter, &path)?;
        let snapshot = SortedIndexCodec.open(&path)?;
        let epoch = Epoch::create(
            0,
            snapshot,
            &dir.path().join("tombstones-0.log"),
            Synchronous::Off,
        )?;
        Ok((dir, epoch))
    }

    fn iri(s: &str) -> Option<Term> {
        Some(Term::iri(s).unwrap())
    }

    #[test]
    fn unknown_term_skips_snapshot_but_not_delta() -> Result<()> {
        let (_dir, epoch) = epoch()?;
        let pattern = TriplePattern::new(iri("http://e/unknown"), None, None);
        let plan = route(&epoch, &pattern, SLOTS)?;
        assert!(plan.snapshot.is_none());
        assert_eq!(
            plan.delta.and_then(|p| p.subject),
            Some(DeltaTerm::Raw(Term::iri("http://e/unknown").unwrap()))
        );
        Ok(())
    }

    #[test]
    fn unused_snapshot_id_skips_delta() -> Result<()> {
        let (_dir, epoch) = epoch()?;
        let pattern = TriplePattern::new(None, iri("http://e/p"), None);
        let plan = route(&epoch, &pattern, SLOTS)?;
        assert!(plan.snapshot.is_some());
        assert!(plan.delta.is_none());

        let p = epoch
            .snapshot()
            .encode(&Term::iri("http://e/p").unwrap(), Role::Predicate)?
            .expect("p in dictionary");
        epoch.note_delta_usage(&crate::storage::delta::DeltaTriple {
            subject: DeltaTerm::Raw(Term::iri("http://e/new").unwrap()),
            predicate: DeltaTerm::Id(p),
            object: DeltaTerm::Raw(Term::literal("z")),
        });
        let plan = route(&epoch, &pattern, SLOTS)?;
        assert!(plan.snapshot.is_some() && plan.delta.is_some());
        Ok(())
    }

    #[test]
    fn wildcard_scans_everything_and_frozen_slot_is_included() -> Result<()> {
        let (_dir, epoch) = epoch()?;
        let slots = SlotState {
            active: DeltaSlot::B,
            frozen: Some(DeltaSlot::A),
        };
        let plan = route(&epoch, &TriplePattern::any(), slots)?;
        let report = RoutePlan::from(&plan);
        assert!(report.scan_snapshot && report.scan_delta);
        assert_eq!(report.delta_slots, vec![DeltaSlot::B, DeltaSlot::A]);
        Ok(())
    }
}
