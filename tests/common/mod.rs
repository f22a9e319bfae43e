#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tern::codec::SortedIndexCodec;
use tern::{
    CompactionPhase, HookAction, HybridStore, Result, StoreOptions, Term, Triple, TriplePattern,
};

static TRACING: Once = Once::new();

/// Routes store logs to the test harness output once per binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("TERN_TEST_LOG")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn iri(name: &str) -> Term {
    Term::iri(format!("http://example.org/{name}")).expect("valid iri")
}

pub fn triple(s: &str, p: &str, o: &str) -> Triple {
    Triple::new(iri(s), iri(p), iri(o)).expect("valid triple")
}

pub fn literal_triple(s: &str, p: &str, value: &str) -> Triple {
    Triple::new(iri(s), iri(p), Term::literal(value)).expect("valid triple")
}

pub fn pattern(s: Option<&str>, p: Option<&str>, o: Option<&str>) -> TriplePattern {
    TriplePattern::new(s.map(iri), p.map(iri), o.map(iri))
}

/// Options for deterministic tests: no background worker.
pub fn manual_options() -> StoreOptions {
    StoreOptions::default().background_compaction(false)
}

pub fn create_store(dir: &Path, triples: Vec<Triple>, options: StoreOptions) -> Result<HybridStore> {
    init_tracing();
    HybridStore::create(dir, Arc::new(SortedIndexCodec), triples, options)
}

pub fn reopen(dir: &Path, options: StoreOptions) -> Result<HybridStore> {
    init_tracing();
    HybridStore::open(dir, Arc::new(SortedIndexCodec), options)
}

/// Collects every match, failing on the first iterator error.
pub fn collect(store: &HybridStore, pattern: &TriplePattern) -> Vec<Triple> {
    store
        .lookup(pattern)
        .expect("lookup")
        .collect::<std::result::Result<Vec<_>, _>>()
        .expect("scan")
}

pub fn sorted(mut triples: Vec<Triple>) -> Vec<Triple> {
    triples.sort();
    triples
}

/// Everything the store holds, sorted.
pub fn contents(store: &HybridStore) -> Vec<Triple> {
    sorted(collect(store, &TriplePattern::any()))
}

/// One-shot fault injection point shared with a store's phase hook.
#[derive(Clone, Default)]
pub struct Failpoint {
    armed: Arc<Mutex<Option<(CompactionPhase, HookAction)>>>,
    fired: Arc<Mutex<Vec<CompactionPhase>>>,
}

impl Failpoint {
    pub fn arm(&self, phase: CompactionPhase, action: HookAction) {
        *self.armed.lock() = Some((phase, action));
    }

    pub fn fired(&self) -> Vec<CompactionPhase> {
        self.fired.lock().clone()
    }

    pub fn options(&self, base: StoreOptions) -> StoreOptions {
        let armed = Arc::clone(&self.armed);
        let fired = Arc::clone(&self.fired);
        base.phase_hook(move |phase| {
            let mut slot = armed.lock();
            match *slot {
                Some((target, action)) if target == phase => {
                    *slot = None;
                    fired.lock().push(phase);
                    action
                }
                _ => HookAction::Continue,
            }
        })
    }
}
