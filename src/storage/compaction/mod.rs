//! Background compaction: folds the frozen delta slot and the tombstones into
//! a new snapshot while lookups and writes continue.

mod cycle;
mod remap;
mod state;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CompactionError;
use crate::storage::store::StoreInner;

pub(crate) use cycle::{fold_frozen, run_cycle};
pub use state::CompactionPhase;
pub(crate) use state::CompactionState;

/// What started a cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionTrigger {
    /// `compact_now` or `trigger_compaction`.
    Manual,
    /// Delta writes passed the configured threshold.
    Threshold,
    /// Periodic timer.
    Timer,
}

/// Outcome of a successful cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    /// Epoch installed by the cycle.
    pub epoch: u64,
    /// What started the cycle.
    pub trigger: CompactionTrigger,
    /// Frozen delta triples folded into the snapshot.
    pub frozen_triples: u64,
    /// Snapshot tombstones dropped by the cycle.
    pub tombstones_purged: u64,
    /// Deletes that arrived after the cutoff and were re-applied.
    pub pending_deletes: u64,
    /// Triples in the new snapshot.
    pub snapshot_triples: u64,
    /// Active delta triples re-encoded against the new dictionary.
    pub remapped: u64,
    /// Terms that could not be re-encoded and stayed in raw form.
    pub remap_failures: u64,
    /// Wall time of the cycle.
    pub duration_ms: u64,
}

pub(crate) enum WorkerMessage {
    Trigger(CompactionTrigger),
    Shutdown,
}

/// Thread running cycles on demand and on a timer.
pub(crate) struct CompactionWorker {
    sender: Sender<WorkerMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CompactionWorker {
    pub(crate) fn spawn(
        inner: Weak<StoreInner>,
        interval: Option<Duration>,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("tern-compactor".into())
            .spawn(move || compaction_loop(inner, receiver, interval))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    pub(crate) fn sender(&self) -> Sender<WorkerMessage> {
        self.sender.clone()
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("store.compaction.worker_panicked");
            }
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn compaction_loop(
    inner: Weak<StoreInner>,
    receiver: Receiver<WorkerMessage>,
    interval: Option<Duration>,
) {
    loop {
        let message = match interval {
            Some(interval) => receiver.recv_timeout(interval),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        let trigger = match message {
            Ok(WorkerMessage::Trigger(trigger)) => trigger,
            Ok(WorkerMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => CompactionTrigger::Timer,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(store) = inner.upgrade() else {
            break;
        };
        if trigger == CompactionTrigger::Timer && !store.has_pending_work() {
            debug!("store.compaction.timer_idle");
            continue;
        }
        match run_cycle(&store, trigger) {
            Ok(_) => {}
            Err(CompactionError::AlreadyRunning) => {
                debug!(?trigger, "store.compaction.skipped_busy");
            }
            // Already logged by the cycle; the store stays on the old snapshot.
            Err(_) => {}
        }
    }
}
