use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::SnapshotCodec;
use crate::error::{CompactionError, LookupError, RecoveryError, Result, StoreError, WriteError};
use crate::primitives::concurrency::{BarrierSnapshot, LeaseBarrier};
use crate::primitives::io::ensure_dir;
use crate::primitives::journal::{Journal, JournalKind};
use crate::primitives::lock::FileLock;
use crate::storage::compaction::{
    run_cycle, CompactionPhase, CompactionState, CompactionStats, CompactionTrigger,
    CompactionWorker, WorkerMessage,
};
use crate::storage::delta::{DeltaSlot, DeltaStore, SlotPair};
use crate::storage::epoch::Epoch;
use crate::storage::layout::StoreLayout;
use crate::storage::manifest::Manifest;
use crate::storage::merged::MergedIter;
use crate::storage::options::{StoreOptions, Synchronous};
use crate::storage::recovery;
use crate::storage::router::{self, RoutePlan, SlotState};
use crate::types::{Triple, TriplePattern};

/// Shared state of an open store; the background worker holds a weak
/// reference to it.
pub(crate) struct StoreInner {
    pub(crate) layout: StoreLayout,
    pub(crate) codec: Arc<dyn SnapshotCodec>,
    pub(crate) options: StoreOptions,
    pub(crate) epoch: RwLock<Arc<Epoch>>,
    pub(crate) slots: RwLock<SlotState>,
    pub(crate) deltas: SlotPair<DeltaStore>,
    pub(crate) manifest: Mutex<Manifest>,
    pub(crate) barrier: LeaseBarrier,
    pub(crate) phase: CompactionState,
    /// Deletes issued after the cutoff that must be re-applied to the new
    /// snapshot at install.
    pub(crate) pending_deletes: Mutex<Vec<Triple>>,
    pub(crate) last_stats: Mutex<Option<CompactionStats>>,
    pub(crate) threshold_signalled: AtomicBool,
    trigger: Mutex<Option<Sender<WorkerMessage>>>,
    _lock: FileLock,
}

impl StoreInner {
    pub(crate) fn current_epoch(&self) -> Arc<Epoch> {
        Arc::clone(&self.epoch.read())
    }

    pub(crate) fn slot_state(&self) -> SlotState {
        *self.slots.read()
    }

    pub(crate) fn sync_writes(&self) -> bool {
        self.options.synchronous == Synchronous::Full
    }

    /// Persists `update` applied to the manifest, keeping the in-memory copy
    /// unchanged when the write fails.
    pub(crate) fn commit_manifest(&self, update: impl FnOnce(&mut Manifest)) -> Result<Manifest> {
        let mut guard = self.manifest.lock();
        let mut next = guard.clone();
        update(&mut next);
        next.store(&self.layout.manifest())?;
        *guard = next.clone();
        Ok(next)
    }

    pub(crate) fn has_pending_work(&self) -> bool {
        let epoch = self.current_epoch();
        epoch.deletes().count() > 0 || DeltaSlot::BOTH.iter().any(|s| !self.deltas[*s].is_empty())
    }

    /// Flushes every journal, for `Normal` mode boundaries and close.
    pub(crate) fn sync_all(&self) -> Result<()> {
        self.current_epoch().deletes().sync()?;
        for slot in DeltaSlot::BOTH {
            self.deltas[slot].sync()?;
        }
        Ok(())
    }

    fn note_write(&self, slot: DeltaSlot) {
        let threshold = self.options.compaction.delta_threshold;
        if threshold == 0 || self.deltas[slot].writes() < threshold {
            return;
        }
        if self.threshold_signalled.swap(true, Ordering::AcqRel) {
            return;
        }
        let sender = self.trigger.lock();
        match sender.as_ref() {
            Some(sender) => {
                debug!(threshold, "store.compaction.threshold_reached");
                if sender
                    .send(WorkerMessage::Trigger(CompactionTrigger::Threshold))
                    .is_err()
                {
                    self.threshold_signalled.store(false, Ordering::Release);
                }
            }
            None => self.threshold_signalled.store(false, Ordering::Release),
        }
    }
}

/// Point-in-time counters of an open store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Current snapshot epoch.
    pub epoch: u64,
    /// Compaction phase at the time of the call.
    pub phase: CompactionPhase,
    /// Triples stored in the snapshot, tombstoned or not.
    pub snapshot_triples: u64,
    /// Tombstoned snapshot triples.
    pub tombstones: u64,
    /// Triples per delta slot.
    pub delta_triples: SlotPair<u64>,
    /// Slot receiving writes.
    pub active: DeltaSlot,
    /// Slot being compacted.
    pub frozen: Option<DeltaSlot>,
    /// Logical triple count.
    pub logical_triples: u64,
}

/// Hybrid RDF triple store: an immutable snapshot plus a double-buffered delta.
pub struct HybridStore {
    inner: Arc<StoreInner>,
    worker: Mutex<Option<CompactionWorker>>,
}

impl HybridStore {
    /// Creates a store in `dir` whose first snapshot holds `triples`.
    pub fn create<I>(
        dir: impl AsRef<Path>,
        codec: Arc<dyn SnapshotCodec>,
        triples: I,
        options: StoreOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Triple>,
    {
        let layout = StoreLayout::new(dir.as_ref());
        ensure_dir(layout.root())?;
        let lock = lock_dir(&layout)?;
        if layout.manifest().exists() {
            return Err(StoreError::Invalid(format!(
                "store already exists at {}",
                layout.root().display()
            )));
        }
        let manifest = Manifest::default();
        let mut iter = triples.into_iter().map(Ok);
        let count = codec.build(&mut iter, &layout.snapshot(manifest.epoch))?;
        Journal::create(layout.tombstones(manifest.epoch), JournalKind::Tombstone)?;
        for slot in DeltaSlot::BOTH {
            Journal::create(
                layout.delta(slot, manifest.delta_generations[slot]),
                JournalKind::Delta,
            )?;
        }
        manifest.store(&layout.manifest())?;
        info!(
            path = %layout.root().display(),
            codec = codec.name(),
            triples = count,
            "store.created"
        );
        Self::open_locked(layout, lock, codec, options)
    }

    /// Opens an existing store, recovering from any interrupted compaction.
    pub fn open(
        dir: impl AsRef<Path>,
        codec: Arc<dyn SnapshotCodec>,
        options: StoreOptions,
    ) -> Result<Self> {
        let layout = StoreLayout::new(dir.as_ref());
        if !layout.manifest().exists() {
            return Err(RecoveryError::MissingManifest(layout.root().to_path_buf()).into());
        }
        let lock = lock_dir(&layout)?;
        Self::open_locked(layout, lock, codec, options)
    }

    fn open_locked(
        layout: StoreLayout,
        lock: FileLock,
        codec: Arc<dyn SnapshotCodec>,
        options: StoreOptions,
    ) -> Result<Self> {
        let recovered = recovery::recover(&layout, codec.as_ref(), &options)?;
        let epoch_number = recovered.epoch.number();
        let inner = Arc::new(StoreInner {
            layout,
            codec,
            epoch: RwLock::new(recovered.epoch),
            slots: RwLock::new(SlotState {
                active: recovered.manifest.active,
                frozen: None,
            }),
            deltas: recovered.deltas,
            manifest: Mutex::new(recovered.manifest),
            barrier: LeaseBarrier::new(),
            phase: CompactionState::default(),
            pending_deletes: Mutex::new(Vec::new()),
            last_stats: Mutex::new(None),
            threshold_signalled: AtomicBool::new(false),
            trigger: Mutex::new(None),
            options,
            _lock: lock,
        });
        let worker = if inner.options.compaction.enabled {
            let worker =
                CompactionWorker::spawn(Arc::downgrade(&inner), inner.options.compaction.interval())?;
            *inner.trigger.lock() = Some(worker.sender());
            Some(worker)
        } else {
            None
        };
        info!(
            path = %inner.layout.root().display(),
            epoch = epoch_number,
            background = worker.is_some(),
            "store.opened"
        );
        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Streams triples matching `pattern`.
    pub fn lookup(&self, pattern: &TriplePattern) -> std::result::Result<MergedIter, LookupError> {
        pattern.validate()?;
        let _lease = self.inner.barrier.acquire();
        let epoch = self.inner.current_epoch();
        let plan = router::route(&epoch, pattern, self.inner.slot_state())?;
        let snapshot = plan
            .snapshot
            .map(|ids| Arc::clone(epoch.snapshot()).scan(ids));
        let mut delta = Vec::new();
        if let Some(delta_pattern) = plan.delta.as_ref() {
            for slot in &plan.slots {
                delta.extend(self.inner.deltas[*slot].matches(delta_pattern));
            }
        }
        Ok(MergedIter::new(epoch, snapshot, delta))
    }

    /// Reports how a lookup of `pattern` would be routed right now.
    pub fn explain(&self, pattern: &TriplePattern) -> std::result::Result<RoutePlan, LookupError> {
        pattern.validate()?;
        let _lease = self.inner.barrier.acquire();
        let epoch = self.inner.current_epoch();
        let plan = router::route(&epoch, pattern, self.inner.slot_state())?;
        Ok(RoutePlan::from(&plan))
    }

    /// Adds `triple`. Returns false when it is already present.
    pub fn insert(&self, triple: &Triple) -> std::result::Result<bool, WriteError> {
        triple.validate()?;
        let _lease = self.inner.barrier.acquire();
        let epoch = self.inner.current_epoch();
        let slots = self.inner.slot_state();
        if epoch.is_live_in_snapshot(triple)? {
            return Ok(false);
        }
        let encoded = epoch.encode_delta(triple)?;
        if let Some(frozen) = slots.frozen {
            if self.inner.deltas[frozen].contains(&encoded) {
                return Ok(false);
            }
        }
        epoch.note_delta_usage(&encoded);
        let inserted =
            self.inner.deltas[slots.active].insert(triple, encoded, self.inner.sync_writes())?;
        if inserted {
            self.inner.note_write(slots.active);
        }
        Ok(inserted)
    }

    /// Removes `triple`. Returns false when it was not present.
    pub fn delete(&self, triple: &Triple) -> std::result::Result<bool, WriteError> {
        triple.validate()?;
        let _lease = self.inner.barrier.acquire();
        let epoch = self.inner.current_epoch();
        let slots = self.inner.slot_state();
        let sync = self.inner.sync_writes();
        let mut removed = false;
        // Set when the triple is part of the cycle's cutoff content.
        let mut cutoff_hit = false;
        if let Some(ordinal) = epoch.snapshot_ordinal(triple)? {
            if epoch.deletes().mark(ordinal).map_err(WriteError::Journal)? {
                removed = true;
                cutoff_hit = true;
            }
        }
        let encoded = epoch.encode_delta(triple)?;
        if self.inner.deltas[slots.active].remove(triple, &encoded, sync)? {
            removed = true;
            self.inner.note_write(slots.active);
        }
        if let Some(frozen) = slots.frozen {
            if self.inner.deltas[frozen].remove(triple, &encoded, sync)? {
                removed = true;
                cutoff_hit = true;
            }
            if cutoff_hit {
                self.inner.pending_deletes.lock().push(triple.clone());
            }
        }
        Ok(removed)
    }

    /// Returns true when `triple` is logically present.
    pub fn contains(&self, triple: &Triple) -> std::result::Result<bool, LookupError> {
        Ok(self.lookup(&TriplePattern::exact(triple))?.next().transpose()?.is_some())
    }

    /// Logical triple count: live snapshot triples plus both delta slots.
    pub fn len(&self) -> u64 {
        let _lease = self.inner.barrier.acquire();
        let epoch = self.inner.current_epoch();
        epoch.live_snapshot_triples()
            + DeltaSlot::BOTH
                .iter()
                .map(|slot| self.inner.deltas[*slot].len() as u64)
                .sum::<u64>()
    }

    /// Returns true when no triple is logically present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one compaction cycle on the calling thread.
    pub fn compact_now(&self) -> std::result::Result<CompactionStats, CompactionError> {
        run_cycle(&self.inner, CompactionTrigger::Manual)
    }

    /// Asks the background worker to run a cycle. Returns false when no
    /// worker is running.
    pub fn trigger_compaction(&self) -> bool {
        self.inner
            .trigger
            .lock()
            .as_ref()
            .is_some_and(|sender| {
                sender
                    .send(WorkerMessage::Trigger(CompactionTrigger::Manual))
                    .is_ok()
            })
    }

    /// Current compaction phase.
    pub fn compaction_phase(&self) -> CompactionPhase {
        self.inner.phase.current()
    }

    /// Current snapshot epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.current_epoch().number()
    }

    /// Counters for observability.
    pub fn stats(&self) -> StoreStats {
        let _lease = self.inner.barrier.acquire();
        let epoch = self.inner.current_epoch();
        let slots = self.inner.slot_state();
        let delta_triples = SlotPair::new(
            self.inner.deltas.a.len() as u64,
            self.inner.deltas.b.len() as u64,
        );
        StoreStats {
            epoch: epoch.number(),
            phase: self.inner.phase.current(),
            snapshot_triples: epoch.snapshot().triple_count(),
            tombstones: epoch.deletes().count(),
            logical_triples: epoch.live_snapshot_triples() + delta_triples.a + delta_triples.b,
            delta_triples,
            active: slots.active,
            frozen: slots.frozen,
        }
    }

    /// Stats of the most recent successful cycle.
    pub fn last_compaction_stats(&self) -> Option<CompactionStats> {
        self.inner.last_stats.lock().clone()
    }

    /// Copy of the persisted manifest.
    pub fn manifest(&self) -> Manifest {
        self.inner.manifest.lock().clone()
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        self.inner.layout.root()
    }

    /// Layout of the store directory.
    pub fn layout(&self) -> &StoreLayout {
        &self.inner.layout
    }

    /// Snapshot codec in use.
    pub fn codec_name(&self) -> &'static str {
        self.inner.codec.name()
    }

    /// Lease barrier counters.
    pub fn leases(&self) -> BarrierSnapshot {
        self.inner.barrier.snapshot()
    }

    /// Epoch each delta slot's identifiers were encoded against.
    pub fn delta_encoding_epochs(&self) -> SlotPair<u64> {
        SlotPair::new(
            self.inner.deltas.a.epoch_of_encoding(),
            self.inner.deltas.b.epoch_of_encoding(),
        )
    }

    /// Flushes every journal to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.sync_all()
    }

    /// Stops the background worker and flushes journals.
    pub fn close(self) -> Result<()> {
        self.shutdown_worker();
        self.inner.sync_all()
    }

    fn shutdown_worker(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            self.inner.trigger.lock().take();
            worker.shutdown();
        }
    }
}

fn lock_dir(layout: &StoreLayout) -> Result<FileLock> {
    FileLock::try_acquire(layout.lock())?
        .ok_or_else(|| RecoveryError::Locked(layout.root().to_path_buf()).into())
}

impl Drop for HybridStore {
    fn drop(&mut self) {
        self.shutdown_worker();
        if let Err(err) = self.inner.sync_all() {
            warn!(error = %err, "store.close.sync_failed");
        }
    }
}

impl std::fmt::Debug for HybridStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridStore")
            .field("path", &self.inner.layout.root())
            .field("epoch", &self.epoch())
            .field("phase", &self.compaction_phase())
            .finish()
    }
}
