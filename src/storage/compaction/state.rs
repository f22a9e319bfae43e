use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Phase of the compaction cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompactionPhase {
    /// No cycle running.
    Idle = 0,
    /// Waiting for active leases to drain.
    Quiescing = 1,
    /// Flipping the active slot and capturing the cutoff.
    Switching = 2,
    /// Writing frozen triples to staging.
    Dumping = 3,
    /// Building an index from the dump.
    Indexing = 4,
    /// Combining the old snapshot and the built index.
    Merging = 5,
    /// Re-encoding the active store against the new dictionary.
    Remapping = 6,
    /// Committing and swapping in the new epoch.
    Installing = 7,
}

impl CompactionPhase {
    /// Every phase a full cycle passes through, in order.
    pub const CYCLE: [CompactionPhase; 7] = [
        CompactionPhase::Quiescing,
        CompactionPhase::Switching,
        CompactionPhase::Dumping,
        CompactionPhase::Indexing,
        CompactionPhase::Merging,
        CompactionPhase::Remapping,
        CompactionPhase::Installing,
    ];

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CompactionPhase::Quiescing,
            2 => CompactionPhase::Switching,
            3 => CompactionPhase::Dumping,
            4 => CompactionPhase::Indexing,
            5 => CompactionPhase::Merging,
            6 => CompactionPhase::Remapping,
            7 => CompactionPhase::Installing,
            _ => CompactionPhase::Idle,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            CompactionPhase::Idle => "idle",
            CompactionPhase::Quiescing => "quiescing",
            CompactionPhase::Switching => "switching",
            CompactionPhase::Dumping => "dumping",
            CompactionPhase::Indexing => "indexing",
            CompactionPhase::Merging => "merging",
            CompactionPhase::Remapping => "remapping",
            CompactionPhase::Installing => "installing",
        }
    }
}

impl std::fmt::Display for CompactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase, readable with a single atomic load.
#[derive(Debug, Default)]
pub(crate) struct CompactionState {
    phase: AtomicU8,
}

impl CompactionState {
    pub(crate) fn current(&self) -> CompactionPhase {
        CompactionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Claims the compactor. Fails when a cycle is already running.
    pub(crate) fn try_begin(&self) -> bool {
        self.phase
            .compare_exchange(
                CompactionPhase::Idle as u8,
                CompactionPhase::Quiescing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn advance(&self, phase: CompactionPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        self.phase
            .store(CompactionPhase::Idle as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_cycle_can_begin() {
        let state = CompactionState::default();
        assert_eq!(state.current(), CompactionPhase::Idle);
        assert!(state.try_begin());
        assert!(!state.try_begin());
        state.advance(CompactionPhase::Merging);
        assert_eq!(state.current(), CompactionPhase::Merging);
        state.finish();
        assert!(state.try_begin());
    }

    #[test]
    fn phases_roundtrip_through_the_atomic() {
        for phase in CompactionPhase::CYCLE {
            assert_eq!(CompactionPhase::from_u8(phase as u8), phase);
        }
    }
}
