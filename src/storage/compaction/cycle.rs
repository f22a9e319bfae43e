use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{CompactionError, Result, StoreError};
use crate::primitives::bitmap::Bitmap;
use crate::primitives::io::{durable_rename, ensure_dir, remove_dir_if_exists, remove_if_exists};
use crate::primitives::journal::{Journal, JournalKind};
use crate::storage::compaction::remap::{remap, Remapped};
use crate::storage::compaction::{CompactionPhase, CompactionStats, CompactionTrigger};
use crate::storage::delta::{DeltaSlot, DeltaStore, DeltaTriple, SlotPair};
use crate::storage::epoch::Epoch;
use crate::storage::layout::StoreLayout;
use crate::storage::manifest::{Manifest, StagingFlags};
use crate::storage::options::{HookAction, Synchronous};
use crate::storage::router::SlotState;
use crate::storage::store::StoreInner;
use crate::types::Triple;

type CycleResult<T> = std::result::Result<T, CompactionError>;

/// Runs one full cycle. Failures abort back to the previous snapshot, except
/// injected crashes, which leave everything as a killed process would.
pub(crate) fn run_cycle(
    inner: &StoreInner,
    trigger: CompactionTrigger,
) -> CycleResult<CompactionStats> {
    if !inner.phase.try_begin() {
        return Err(CompactionError::AlreadyRunning);
    }
    let started = Instant::now();
    let mut cycle = Cycle::new(inner, trigger);
    info!(
        epoch = cycle.old.number(),
        ?trigger,
        "store.compaction.started"
    );
    let outcome = cycle.run(started);
    match &outcome {
        Ok(stats) => {
            info!(
                epoch = stats.epoch,
                triples = stats.snapshot_triples,
                frozen = stats.frozen_triples,
                purged = stats.tombstones_purged,
                pending = stats.pending_deletes,
                remapped = stats.remapped,
                duration_ms = stats.duration_ms,
                "store.compaction.installed"
            );
            *inner.last_stats.lock() = Some(stats.clone());
        }
        Err(err) if err.is_simulated_crash() => {
            warn!(phase = %cycle.phase, "store.compaction.crashed");
        }
        Err(err) => {
            warn!(phase = %cycle.phase, error = %err, "store.compaction.aborted");
            cycle.abort();
        }
    }
    inner.phase.finish();
    outcome
}

struct Cycle<'a> {
    inner: &'a StoreInner,
    trigger: CompactionTrigger,
    phase: CompactionPhase,
    old: Arc<Epoch>,
    next: u64,
    frozen: Option<DeltaSlot>,
    cutoff_triples: Vec<DeltaTriple>,
    cutoff_deletes: Bitmap,
    candidate: Option<Arc<Epoch>>,
    renamed: bool,
}

impl<'a> Cycle<'a> {
    fn new(inner: &'a StoreInner, trigger: CompactionTrigger) -> Self {
        let old = inner.current_epoch();
        let next = old.number() + 1;
        Self {
            inner,
            trigger,
            phase: CompactionPhase::Quiescing,
            old,
            next,
            frozen: None,
            cutoff_triples: Vec::new(),
            cutoff_deletes: Bitmap::default(),
            candidate: None,
            renamed: false,
        }
    }

    fn layout(&self) -> &'a StoreLayout {
        &self.inner.layout
    }

    fn enter(&mut self, phase: CompactionPhase) -> CycleResult<()> {
        self.phase = phase;
        self.inner.phase.advance(phase);
        debug!(phase = %phase, epoch = self.old.number(), "store.compaction.phase");
        let action = match self.inner.options.phase_hook.as_ref() {
            Some(hook) => hook(phase),
            None => HookAction::Continue,
        };
        match action {
            HookAction::Continue => Ok(()),
            HookAction::Fail => Err(CompactionError::Injected {
                phase,
                crash: false,
            }),
            HookAction::Crash => Err(CompactionError::Injected { phase, crash: true }),
        }
    }

    fn run(&mut self, started: Instant) -> CycleResult<CompactionStats> {
        let timeout = self.inner.options.compaction.quiesce_timeout();
        self.enter(CompactionPhase::Quiescing)?;
        let gate = self
            .inner
            .barrier
            .close(timeout)
            .ok_or(CompactionError::QuiesceTimeout(timeout))?;
        self.enter(CompactionPhase::Switching)?;
        self.switch()?;
        drop(gate);

        self.enter(CompactionPhase::Dumping)?;
        self.dump()?;
        self.enter(CompactionPhase::Indexing)?;
        self.index()?;
        self.enter(CompactionPhase::Merging)?;
        self.merge()?;

        self.enter(CompactionPhase::Remapping)?;
        let gate = self
            .inner
            .barrier
            .close(timeout)
            .ok_or(CompactionError::QuiesceTimeout(timeout))?;
        let remapped = self.remap()?;
        self.enter(CompactionPhase::Installing)?;
        let (stats, old_frozen_log) = self.install(remapped, started)?;
        drop(gate);

        self.remove_obsolete(old_frozen_log);
        Ok(stats)
    }

    /// Flips the active slot and captures the cutoff. Runs under the gate.
    fn switch(&mut self) -> CycleResult<()> {
        let slots = self.inner.slot_state();
        if slots.frozen.is_some() {
            return Err(CompactionError::Invariant("frozen slot still occupied"));
        }
        let frozen = slots.active;
        let active = frozen.other();
        if !self.inner.deltas[active].is_empty() {
            return Err(CompactionError::Invariant("standby delta slot is not empty"));
        }
        if self.inner.options.synchronous == Synchronous::Normal {
            self.inner.sync_all()?;
        }
        self.inner.commit_manifest(|m| {
            m.active = active;
            m.frozen = Some(frozen);
            m.staging = StagingFlags::default();
        })?;
        self.frozen = Some(frozen);
        *self.inner.slots.write() = SlotState {
            active,
            frozen: Some(frozen),
        };
        self.inner.deltas[active].reset_counter();
        self.inner.deltas[frozen].reset_counter();
        self.inner
            .threshold_signalled
            .store(false, std::sync::atomic::Ordering::Release);
        self.inner.pending_deletes.lock().clear();
        self.cutoff_triples = self.inner.deltas[frozen].snapshot_triples();
        self.cutoff_deletes = self.old.deletes().to_bitmap();
        debug!(
            frozen = frozen.label(),
            active = active.label(),
            frozen_triples = self.cutoff_triples.len(),
            tombstones = self.cutoff_deletes.count_ones(),
            "store.compaction.switched"
        );
        Ok(())
    }

    fn dump(&mut self) -> CycleResult<()> {
        ensure_dir(&self.layout().staging_dir())?;
        let path = self.layout().staging_dump(self.next);
        let mut journal = Journal::create(&path, JournalKind::Staging)?;
        for encoded in &self.cutoff_triples {
            let triple = self.old.decode_delta(encoded)?;
            journal.append(triple.to_string().as_bytes())?;
        }
        journal.sync()?;
        self.inner.commit_manifest(|m| m.staging.dumped = true)?;
        Ok(())
    }

    fn index(&mut self) -> CycleResult<()> {
        let records = Journal::read_all(self.layout().staging_dump(self.next), JournalKind::Staging)?;
        if records.len() != self.cutoff_triples.len() {
            return Err(CompactionError::Invariant("staging dump lost records"));
        }
        let mut triples = records.into_iter().map(parse_staged);
        let built = self.layout().staging_built(self.next);
        self.inner.codec.build(&mut triples, &built)?;
        self.inner.commit_manifest(|m| m.staging.indexed = true)?;
        Ok(())
    }

    fn merge(&mut self) -> CycleResult<()> {
        let layout = self.layout();
        let diff = layout.staging_diff(self.next);
        let merged = layout.staging_merged(self.next);
        let codec = &self.inner.codec;
        codec.diff(&layout.snapshot(self.old.number()), &self.cutoff_deletes, &diff)?;
        let count = codec.cat(&diff, &layout.staging_built(self.next), &merged)?;
        let expected = self.old.snapshot().triple_count() - self.cutoff_deletes.count_ones()
            + self.cutoff_triples.len() as u64;
        if count != expected {
            return Err(CompactionError::Invariant(
                "merged snapshot size does not match the cutoff",
            ));
        }
        self.inner.commit_manifest(|m| m.staging.merged = true)?;
        let snapshot = codec.open(&merged)?;
        let epoch = Epoch::create(
            self.next,
            snapshot,
            &layout.tombstones(self.next),
            self.inner.options.synchronous,
        )?;
        self.candidate = Some(Arc::new(epoch));
        Ok(())
    }

    /// Re-encodes the active store against the candidate. Runs under the gate.
    fn remap(&mut self) -> CycleResult<Remapped> {
        let candidate = self
            .candidate
            .as_ref()
            .ok_or(CompactionError::Invariant("no candidate epoch to remap against"))?;
        let active = self.inner.slot_state().active;
        let triples = self.inner.deltas[active].snapshot_triples();
        Ok(remap(&self.old, candidate, triples))
    }

    /// Applies pending deletes, commits the manifest and swaps the epoch.
    /// Runs under the gate; nothing after the manifest commit can fail.
    fn install(
        &mut self,
        remapped: Remapped,
        started: Instant,
    ) -> CycleResult<(CompactionStats, PathBuf)> {
        let candidate = Arc::clone(
            self.candidate
                .as_ref()
                .ok_or(CompactionError::Invariant("no candidate epoch to install"))?,
        );
        let frozen = self
            .frozen
            .ok_or(CompactionError::Invariant("no frozen slot to retire"))?;
        let active = frozen.other();

        let pending = std::mem::take(&mut *self.inner.pending_deletes.lock());
        let mut applied = 0u64;
        for triple in &pending {
            if let Some(ordinal) = candidate.snapshot_ordinal(triple)? {
                if candidate.deletes().mark(ordinal)? {
                    applied += 1;
                }
            }
        }
        candidate.deletes().sync()?;
        if self.inner.options.synchronous == Synchronous::Normal {
            self.inner.deltas[active].sync()?;
        }

        let layout = self.layout();
        durable_rename(&layout.staging_merged(self.next), &layout.snapshot(self.next))?;
        self.renamed = true;
        let generation = self.inner.manifest.lock().delta_generations[frozen] + 1;
        let journal = Journal::create(layout.delta(frozen, generation), JournalKind::Delta)?;
        let next = self.next;
        self.inner.commit_manifest(|m| {
            m.epoch = next;
            m.frozen = None;
            m.delta_generations[frozen] = generation;
            m.staging = StagingFlags::default();
        })?;

        *self.inner.epoch.write() = Arc::clone(&candidate);
        self.inner.deltas[active].replace_encodings(remapped.triples, next);
        let old_frozen_log = self.inner.deltas[frozen].reset(journal, generation, next);
        self.inner.slots.write().frozen = None;

        let stats = CompactionStats {
            epoch: next,
            trigger: self.trigger,
            frozen_triples: self.cutoff_triples.len() as u64,
            tombstones_purged: self.cutoff_deletes.count_ones(),
            pending_deletes: applied,
            snapshot_triples: candidate.snapshot().triple_count(),
            remapped: remapped.remapped,
            remap_failures: remapped.failures,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        Ok((stats, old_frozen_log))
    }

    fn remove_obsolete(&self, old_frozen_log: PathBuf) {
        let layout = self.layout();
        let old = self.old.number();
        for path in [layout.snapshot(old), layout.tombstones(old), old_frozen_log] {
            if let Err(err) = remove_if_exists(&path) {
                warn!(path = %path.display(), error = %err, "store.compaction.cleanup_failed");
            }
        }
        self.remove_staging();
    }

    fn remove_staging(&self) {
        let staging = self.layout().staging_dir();
        if let Err(err) = remove_dir_if_exists(&staging) {
            warn!(path = %staging.display(), error = %err, "store.compaction.cleanup_failed");
        }
    }

    /// Restores the pre-cycle shape: frozen content back in the active slot,
    /// staging and candidate files gone.
    fn abort(&mut self) {
        if let Some(frozen) = self.frozen {
            let inner = self.inner;
            let gate = inner.barrier.close_blocking();
            let epoch = inner.current_epoch();
            let mut manifest = inner.manifest.lock();
            match fold_frozen(&inner.layout, &epoch, &inner.deltas, &mut manifest, frozen) {
                Ok(folded) => {
                    inner.slots.write().frozen = None;
                    info!(folded, slot = frozen.label(), "store.compaction.frozen_restored");
                }
                Err(err) => {
                    warn!(error = %err, slot = frozen.label(), "store.compaction.restore_failed");
                }
            }
            drop(manifest);
            inner.pending_deletes.lock().clear();
            drop(gate);
        }
        let layout = self.layout();
        let mut leftovers = vec![layout.tombstones(self.next)];
        if self.renamed {
            leftovers.push(layout.snapshot(self.next));
        }
        self.candidate = None;
        for path in leftovers {
            if let Err(err) = remove_if_exists(&path) {
                warn!(path = %path.display(), error = %err, "store.compaction.cleanup_failed");
            }
        }
        self.remove_staging();
    }
}

fn parse_staged(raw: Vec<u8>) -> Result<Triple> {
    let text = String::from_utf8(raw)
        .map_err(|_| StoreError::Corruption("staged triple is not utf-8".to_string()))?;
    Ok(Triple::parse_line(&text)?)
}

/// Moves every frozen triple into the active slot and retires the frozen
/// journal. The active journal is synced before the manifest drops the
/// frozen slot, so a crash in between only replays the fold again.
pub(crate) fn fold_frozen(
    layout: &StoreLayout,
    epoch: &Epoch,
    deltas: &SlotPair<DeltaStore>,
    manifest: &mut Manifest,
    frozen: DeltaSlot,
) -> Result<u64> {
    let active = frozen.other();
    let entries = deltas[frozen]
        .snapshot_triples()
        .into_iter()
        .map(|encoded| Ok((epoch.decode_delta(&encoded)?, encoded)))
        .collect::<Result<Vec<(Triple, DeltaTriple)>>>()?;
    deltas[active].absorb(&entries)?;

    let generation = manifest.delta_generations[frozen] + 1;
    let journal = Journal::create(layout.delta(frozen, generation), JournalKind::Delta)?;
    let mut next = manifest.clone();
    next.frozen = None;
    next.delta_generations[frozen] = generation;
    next.staging = StagingFlags::default();
    next.store(&layout.manifest())?;
    *manifest = next;

    let old = deltas[frozen].reset(journal, generation, epoch.number());
    if let Err(err) = remove_if_exists(&old) {
        warn!(path = %old.display(), error = %err, "store.delta.cleanup_failed");
    }
    Ok(entries.len() as u64)
}
