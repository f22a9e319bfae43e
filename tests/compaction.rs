#![allow(missing_docs)]

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use parking_lot::Mutex;
use tern::codec::{Snapshot, SnapshotCodec};
use tern::{
    CompactionError, CompactionPhase, CompactionTrigger, DeltaSlot, HookAction, Result,
    TriplePattern,
};

fn seed() -> Vec<tern::Triple> {
    (0..20)
        .map(|i| triple(&format!("s{i}"), "p", &format!("o{}", i % 4)))
        .collect()
}

#[test]
fn empty_cycle_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = create_store(dir.path(), seed(), manual_options())?;
    let before = contents(&store);

    let first = store.compact_now()?;
    assert_eq!(first.epoch, 1);
    assert_eq!(first.frozen_triples, 0);
    assert_eq!(first.tombstones_purged, 0);
    assert_eq!(first.snapshot_triples, 20);
    let second = store.compact_now()?;
    assert_eq!(second.epoch, 2);
    assert_eq!(second.snapshot_triples, 20);

    assert_eq!(contents(&store), before);
    assert_eq!(store.stats().tombstones, 0);
    assert_eq!(store.compaction_phase(), CompactionPhase::Idle);
    assert_eq!(store.last_compaction_stats(), Some(second));
    Ok(())
}

#[test]
fn cycle_folds_delta_and_tombstones() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = create_store(dir.path(), seed(), manual_options())?;
    for i in 0..5 {
        store.delete(&triple(&format!("s{i}"), "p", &format!("o{}", i % 4)))?;
    }
    for i in 0..7 {
        store.insert(&literal_triple(&format!("n{i}"), "label", "new"))?;
    }
    let expected = contents(&store);
    assert_eq!(store.len(), 22);
    let active_before = store.stats().active;

    let report = store.compact_now()?;
    assert_eq!(report.frozen_triples, 7);
    assert_eq!(report.tombstones_purged, 5);
    assert_eq!(report.snapshot_triples, 22);
    assert_eq!(report.trigger, CompactionTrigger::Manual);

    let stats = store.stats();
    assert_eq!(stats.active, active_before.other());
    assert_eq!(stats.frozen, None);
    assert_eq!(stats.snapshot_triples, 22);
    assert_eq!(stats.tombstones, 0);
    assert_eq!(stats.delta_triples, tern::storage::SlotPair::new(0, 0));
    assert_eq!(contents(&store), expected);
    assert!(!dir.path().join("staging").exists());
    Ok(())
}

#[test]
fn remapping_moves_every_delta_encoding_to_the_new_epoch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (reached_tx, reached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let reached_tx = Mutex::new(reached_tx);
    let release_rx = Mutex::new(release_rx);
    let options = manual_options().phase_hook(move |phase| {
        if phase == CompactionPhase::Indexing {
            let _ = reached_tx.lock().send(());
            let _ = release_rx.lock().recv();
        }
        HookAction::Continue
    });
    let store = std::sync::Arc::new(create_store(dir.path(), seed(), options)?);
    store.insert(&triple("fresh", "p", "o1"))?;

    let worker = {
        let store = std::sync::Arc::clone(&store);
        thread::spawn(move || store.compact_now())
    };
    reached_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cycle reached indexing");

    // Written against epoch 0 while the cycle is building epoch 1.
    store.insert(&triple("s1", "p", "late"))?;
    store.insert(&triple("late", "p", "o2"))?;
    store.insert(&literal_triple("late", "label", "only in delta"))?;
    assert_eq!(store.compaction_phase(), CompactionPhase::Indexing);
    let during = store.delta_encoding_epochs();
    assert_eq!(during, tern::storage::SlotPair::new(0, 0));

    release_tx.send(()).expect("release cycle");
    let report = worker.join().expect("cycle thread")?;
    assert_eq!(report.epoch, 1);
    assert_eq!(report.remapped, 3);
    assert_eq!(report.remap_failures, 0);

    let encodings = store.delta_encoding_epochs();
    assert_eq!(encodings[DeltaSlot::A], 1);
    assert_eq!(encodings[DeltaSlot::B], 1);
    assert!(store.contains(&triple("s1", "p", "late"))?);
    assert!(store.contains(&triple("fresh", "p", "o1"))?);
    assert_eq!(
        sorted(collect(&store, &pattern(Some("late"), None, None))),
        sorted(vec![
            triple("late", "p", "o2"),
            literal_triple("late", "label", "only in delta"),
        ])
    );
    assert_eq!(store.len(), 24);
    Ok(())
}

#[test]
fn writes_during_dumping_are_kept_and_pending_deletes_applied() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (reached_tx, reached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let reached_tx = Mutex::new(reached_tx);
    let release_rx = Mutex::new(release_rx);
    let options = manual_options().phase_hook(move |phase| {
        if phase == CompactionPhase::Dumping {
            let _ = reached_tx.lock().send(());
            let _ = release_rx.lock().recv();
        }
        HookAction::Continue
    });
    let store = std::sync::Arc::new(create_store(dir.path(), seed(), options)?);
    store.insert(&triple("frozen", "p", "a"))?;
    store.insert(&triple("frozen", "p", "b"))?;

    let worker = {
        let store = std::sync::Arc::clone(&store);
        thread::spawn(move || store.compact_now())
    };
    reached_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cycle reached dumping");

    let stats = store.stats();
    assert_eq!(stats.phase, CompactionPhase::Dumping);
    let frozen = stats.frozen.expect("frozen slot during the cycle");
    assert_eq!(stats.delta_triples[frozen], 2);

    // Already frozen: not duplicated into the active slot.
    assert!(!store.insert(&triple("frozen", "p", "a"))?);
    // Frozen and snapshot deletes after the cutoff become pending deletes.
    assert!(store.delete(&triple("frozen", "p", "b"))?);
    assert!(store.delete(&triple("s0", "p", "o0"))?);
    assert!(store.insert(&triple("during", "p", "c"))?);
    assert!(!store.contains(&triple("frozen", "p", "b"))?);
    assert!(!store.contains(&triple("s0", "p", "o0"))?);

    release_tx.send(()).expect("release cycle");
    let report = worker.join().expect("cycle thread")?;
    assert_eq!(report.frozen_triples, 2);
    assert_eq!(report.pending_deletes, 2);
    assert_eq!(report.snapshot_triples, 22);

    let stats = store.stats();
    assert_eq!(stats.tombstones, 2);
    assert_eq!(stats.delta_triples[stats.active], 1);
    assert!(store.contains(&triple("frozen", "p", "a"))?);
    assert!(!store.contains(&triple("frozen", "p", "b"))?);
    assert!(!store.contains(&triple("s0", "p", "o0"))?);
    assert!(store.contains(&triple("during", "p", "c"))?);
    assert_eq!(store.len(), 21);

    let expected = contents(&store);
    drop(store);
    let reopened = reopen(dir.path(), manual_options())?;
    assert_eq!(contents(&reopened), expected);
    assert_eq!(reopened.stats().tombstones, 2);
    Ok(())
}

#[test]
fn failure_at_any_phase_leaves_the_store_unchanged() -> Result<()> {
    for phase in CompactionPhase::CYCLE {
        let dir = tempfile::tempdir()?;
        let failpoint = Failpoint::default();
        let store = create_store(dir.path(), seed(), failpoint.options(manual_options()))?;
        store.delete(&triple("s3", "p", "o3"))?;
        store.insert(&triple("n", "p", "o1"))?;
        let before = contents(&store);
        let active = store.stats().active;

        failpoint.arm(phase, HookAction::Fail);
        let err = store.compact_now().expect_err("injected failure");
        assert!(
            matches!(err, CompactionError::Injected { phase: p, crash: false } if p == phase),
            "{phase}: {err}"
        );
        assert_eq!(failpoint.fired(), vec![phase]);

        let stats = store.stats();
        assert_eq!(stats.epoch, 0, "{phase}");
        assert_eq!(stats.phase, CompactionPhase::Idle, "{phase}");
        assert_eq!(stats.frozen, None, "{phase}");
        assert_eq!(stats.tombstones, 1, "{phase}");
        assert_eq!(contents(&store), before, "{phase}");
        assert!(store.manifest().frozen.is_none(), "{phase}");
        assert!(!dir.path().join("staging").exists(), "{phase}");
        assert!(!dir.path().join("snapshot-1.idx").exists(), "{phase}");
        assert!(!dir.path().join("tombstones-1.log").exists(), "{phase}");
        // Folded content lives in whichever slot is active after the abort.
        let after = store.stats();
        assert_eq!(
            after.delta_triples.a + after.delta_triples.b,
            1,
            "{phase} (active was {active:?})"
        );

        // The writes go on and the next cycle succeeds.
        store.insert(&triple("m", "p", "o2"))?;
        let report = store.compact_now()?;
        assert_eq!(report.epoch, 1, "{phase}");
        assert_eq!(report.snapshot_triples, 21, "{phase}");
        assert_eq!(store.len(), 21, "{phase}");
    }
    Ok(())
}

#[test]
fn concurrent_cycle_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (reached_tx, reached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let reached_tx = Mutex::new(reached_tx);
    let release_rx = Mutex::new(release_rx);
    let options = manual_options().phase_hook(move |phase| {
        if phase == CompactionPhase::Merging {
            let _ = reached_tx.lock().send(());
            let _ = release_rx.lock().recv();
        }
        HookAction::Continue
    });
    let store = std::sync::Arc::new(create_store(dir.path(), seed(), options)?);
    let worker = {
        let store = std::sync::Arc::clone(&store);
        thread::spawn(move || store.compact_now())
    };
    reached_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cycle reached merging");
    assert!(matches!(
        store.compact_now(),
        Err(CompactionError::AlreadyRunning)
    ));
    release_tx.send(()).expect("release cycle");
    worker.join().expect("cycle thread")?;
    assert_eq!(store.epoch(), 1);
    Ok(())
}

#[test]
fn compaction_does_not_wait_for_open_iterators() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = manual_options().quiesce_timeout(Duration::from_millis(50));
    let store = create_store(dir.path(), seed(), options)?;
    store.insert(&triple("n", "p", "o"))?;
    let before = contents(&store);

    // The iterator holds no lease; the store must still be able to compact
    // while one is being consumed.
    let mut iter = store.lookup(&TriplePattern::any())?;
    assert!(iter.next().is_some());
    let report = store.compact_now()?;
    assert_eq!(report.epoch, 1);
    let rest: Vec<_> = iter.collect::<std::result::Result<_, _>>()?;
    assert_eq!(rest.len(), before.len() - 1);
    Ok(())
}

#[test]
fn threshold_signals_background_worker() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = tern::StoreOptions::default()
        .background_compaction(true)
        .delta_threshold(5);
    let store = create_store(dir.path(), seed(), options)?;
    for i in 0..5 {
        store.insert(&triple(&format!("t{i}"), "p", "o"))?;
    }
    let deadline = Instant::now() + Duration::from_secs(20);
    let report = loop {
        if let Some(report) = store.last_compaction_stats() {
            break report;
        }
        assert!(Instant::now() < deadline, "background cycle did not run");
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(report.trigger, CompactionTrigger::Threshold);
    assert_eq!(report.frozen_triples, 5);
    assert_eq!(store.len(), 25);
    store.close()?;
    Ok(())
}

#[test]
fn manual_trigger_reaches_background_worker() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = create_store(
        dir.path(),
        seed(),
        tern::StoreOptions::default().background_compaction(true),
    )?;
    store.insert(&triple("n", "p", "o"))?;
    assert!(store.trigger_compaction());
    let deadline = Instant::now() + Duration::from_secs(20);
    while store.epoch() == 0 {
        assert!(Instant::now() < deadline, "background cycle did not run");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(store.len(), 21);

    let manual_dir = tempfile::tempdir()?;
    let manual = create_store(manual_dir.path(), seed(), manual_options())?;
    assert!(!manual.trigger_compaction());
    Ok(())
}

/// Fault a [`FaultyCodec`] snapshot injects for one term while armed.
#[derive(Clone, Debug, PartialEq)]
enum TermFault {
    Encode(tern::Term),
    Decode(tern::Term),
}

type SharedFault = std::sync::Arc<Mutex<Option<TermFault>>>;

#[derive(Debug)]
struct FaultyCodec {
    inner: tern::codec::SortedIndexCodec,
    fault: SharedFault,
}

#[derive(Debug)]
struct FaultySnapshot {
    inner: std::sync::Arc<dyn Snapshot>,
    fault: SharedFault,
}

fn injected(term: &tern::Term) -> tern::StoreError {
    tern::StoreError::Corruption(format!("injected dictionary fault for {term}"))
}

impl Snapshot for FaultySnapshot {
    fn triple_count(&self) -> u64 {
        self.inner.triple_count()
    }

    fn id_space(&self, role: tern::Role) -> u64 {
        self.inner.id_space(role)
    }

    fn encode(&self, term: &tern::Term, role: tern::Role) -> Result<Option<tern::TermId>> {
        if let Some(TermFault::Encode(bad)) = self.fault.lock().as_ref() {
            if bad == term {
                return Err(injected(term));
            }
        }
        self.inner.encode(term, role)
    }

    fn decode(&self, id: tern::TermId, role: tern::Role) -> Result<tern::Term> {
        let term = self.inner.decode(id, role)?;
        if let Some(TermFault::Decode(bad)) = self.fault.lock().as_ref() {
            if *bad == term {
                return Err(injected(&term));
            }
        }
        Ok(term)
    }

    fn ordinal_of(&self, triple: tern::IdTriple) -> Option<u64> {
        self.inner.ordinal_of(triple)
    }

    fn triple_at(&self, ordinal: u64) -> Option<tern::IdTriple> {
        self.inner.triple_at(ordinal)
    }

    fn scan(self: std::sync::Arc<Self>, pattern: tern::IdPattern) -> tern::codec::SnapshotScan {
        std::sync::Arc::clone(&self.inner).scan(pattern)
    }
}

impl SnapshotCodec for FaultyCodec {
    fn name(&self) -> &'static str {
        "faulty-sorted"
    }

    fn open(&self, path: &std::path::Path) -> Result<std::sync::Arc<dyn Snapshot>> {
        Ok(std::sync::Arc::new(FaultySnapshot {
            inner: self.inner.open(path)?,
            fault: std::sync::Arc::clone(&self.fault),
        }))
    }

    fn build(
        &self,
        triples: &mut dyn Iterator<Item = Result<tern::Triple>>,
        out: &std::path::Path,
    ) -> Result<u64> {
        self.inner.build(triples, out)
    }

    fn diff(
        &self,
        input: &std::path::Path,
        deletes: &tern::primitives::bitmap::Bitmap,
        out: &std::path::Path,
    ) -> Result<u64> {
        self.inner.diff(input, deletes, out)
    }

    fn cat(&self, a: &std::path::Path, b: &std::path::Path, out: &std::path::Path) -> Result<u64> {
        self.inner.cat(a, b, out)
    }
}

/// Runs one cycle with `fault` armed for the Remapping phase only, after
/// writing `late` into the newly active slot while the cycle is indexing.
fn cycle_with_remap_fault(
    dir: &std::path::Path,
    fault: TermFault,
    late: &[tern::Triple],
) -> Result<(tern::HybridStore, tern::CompactionStats)> {
    init_tracing();
    let shared = SharedFault::default();
    let codec = std::sync::Arc::new(FaultyCodec {
        inner: tern::codec::SortedIndexCodec,
        fault: std::sync::Arc::clone(&shared),
    });
    let (reached_tx, reached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let reached_tx = Mutex::new(reached_tx);
    let release_rx = Mutex::new(release_rx);
    let hook_fault = std::sync::Arc::clone(&shared);
    let options = manual_options().phase_hook(move |phase| {
        match phase {
            CompactionPhase::Indexing => {
                let _ = reached_tx.lock().send(());
                let _ = release_rx.lock().recv();
            }
            CompactionPhase::Remapping => *hook_fault.lock() = Some(fault.clone()),
            CompactionPhase::Installing => *hook_fault.lock() = None,
            _ => {}
        }
        HookAction::Continue
    });
    let store = std::sync::Arc::new(tern::HybridStore::create(dir, codec, seed(), options)?);
    store.insert(&triple("fresh", "p", "o3"))?;

    let worker = {
        let store = std::sync::Arc::clone(&store);
        thread::spawn(move || store.compact_now())
    };
    reached_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cycle reached indexing");
    for t in late {
        assert!(store.insert(t)?);
    }
    release_tx.send(()).expect("release cycle");
    let report = worker.join().expect("cycle thread")?;
    let store = std::sync::Arc::try_unwrap(store).expect("sole owner");
    Ok((store, report))
}

#[test]
fn remap_encode_failure_keeps_the_raw_term() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let poisoned = triple("late", "p", "o1");
    let healthy = triple("late", "p", "o2");
    let (store, report) = cycle_with_remap_fault(
        dir.path(),
        TermFault::Encode(iri("o1")),
        &[poisoned.clone(), healthy.clone()],
    )?;

    assert_eq!(report.epoch, 1);
    assert_eq!(report.remapped, 2);
    assert_eq!(report.remap_failures, 1);
    assert_eq!(store.epoch(), 1);
    assert_eq!(store.delta_encoding_epochs()[store.stats().active], 1);
    assert_eq!(
        sorted(collect(&store, &pattern(Some("late"), None, None))),
        sorted(vec![poisoned.clone(), healthy])
    );
    assert_eq!(store.len(), 23);
    assert_eq!(contents(&store).len(), 23);

    drop(store);
    let reopened = reopen(dir.path(), manual_options())?;
    assert!(reopened.contains(&poisoned)?);
    assert_eq!(reopened.len(), 23);
    Ok(())
}

#[test]
fn remap_decode_failure_drops_the_triple_until_replay() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let poisoned = triple("late", "p", "o1");
    let healthy = triple("late", "p", "o2");
    let (store, report) = cycle_with_remap_fault(
        dir.path(),
        TermFault::Decode(iri("o1")),
        &[poisoned.clone(), healthy.clone()],
    )?;

    assert_eq!(report.epoch, 1);
    assert_eq!(report.remapped, 1);
    assert_eq!(report.remap_failures, 1);
    assert!(!store.contains(&poisoned)?);
    assert!(store.contains(&healthy)?);
    assert_eq!(store.len(), 22);

    // The journal still holds the canonical record.
    drop(store);
    let reopened = reopen(dir.path(), manual_options())?;
    assert!(reopened.contains(&poisoned)?);
    assert!(reopened.contains(&healthy)?);
    assert_eq!(reopened.len(), 23);
    Ok(())
}
