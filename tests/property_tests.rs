#![allow(missing_docs)]

mod common;

use std::collections::BTreeSet;

use common::*;
use proptest::prelude::*;
use tern::{Triple, TriplePattern};

#[derive(Debug, Clone)]
enum Operation {
    Insert { s: u8, p: u8, o: u8 },
    Delete { s: u8, p: u8, o: u8 },
    Lookup { s: Option<u8>, p: Option<u8>, o: Option<u8> },
    Compact,
    Reopen,
}

fn term_name(kind: &str, n: u8) -> String {
    format!("{kind}{n}")
}

fn model_triple(s: u8, p: u8, o: u8) -> Triple {
    // Objects overlap with subjects so the shared dictionary section is used.
    triple(&term_name("n", s), &term_name("p", p), &term_name("n", o))
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (0u8..6, 0u8..3, 0u8..6).prop_map(|(s, p, o)| Operation::Insert { s, p, o }),
        3 => (0u8..6, 0u8..3, 0u8..6).prop_map(|(s, p, o)| Operation::Delete { s, p, o }),
        2 => (
            proptest::option::of(0u8..7),
            proptest::option::of(0u8..4),
            proptest::option::of(0u8..7)
        )
            .prop_map(|(s, p, o)| Operation::Lookup { s, p, o }),
        1 => Just(Operation::Compact),
        1 => Just(Operation::Reopen),
    ]
}

fn arb_seed() -> impl Strategy<Value = BTreeSet<(u8, u8, u8)>> {
    prop::collection::btree_set((0u8..6, 0u8..3, 0u8..6), 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn store_matches_set_model(
        seed in arb_seed(),
        ops in prop::collection::vec(arb_operation(), 1..40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut model: BTreeSet<Triple> =
            seed.iter().map(|&(s, p, o)| model_triple(s, p, o)).collect();
        let mut store =
            create_store(dir.path(), model.iter().cloned().collect(), manual_options()).unwrap();

        for op in ops {
            match op {
                Operation::Insert { s, p, o } => {
                    let t = model_triple(s, p, o);
                    let inserted = store.insert(&t).unwrap();
                    prop_assert_eq!(inserted, model.insert(t));
                }
                Operation::Delete { s, p, o } => {
                    let t = model_triple(s, p, o);
                    let removed = store.delete(&t).unwrap();
                    prop_assert_eq!(removed, model.remove(&t));
                }
                Operation::Lookup { s, p, o } => {
                    let pattern = TriplePattern::new(
                        s.map(|n| iri(&term_name("n", n))),
                        p.map(|n| iri(&term_name("p", n))),
                        o.map(|n| iri(&term_name("n", n))),
                    );
                    let expected: Vec<Triple> =
                        model.iter().filter(|t| pattern.matches(t)).cloned().collect();
                    prop_assert_eq!(sorted(collect(&store, &pattern)), expected);
                }
                Operation::Compact => {
                    let report = store.compact_now().unwrap();
                    prop_assert_eq!(report.snapshot_triples, model.len() as u64);
                    prop_assert_eq!(store.stats().tombstones, 0);
                }
                Operation::Reopen => {
                    drop(store);
                    store = reopen(dir.path(), manual_options()).unwrap();
                }
            }

            // Conservation: counters, the full scan and the model agree.
            let stats = store.stats();
            let logical = stats.snapshot_triples - stats.tombstones
                + stats.delta_triples.a
                + stats.delta_triples.b;
            prop_assert_eq!(store.len(), logical);
            prop_assert_eq!(store.len(), model.len() as u64);
            let scanned: Vec<Triple> = contents(&store);
            prop_assert_eq!(scanned, model.iter().cloned().collect::<Vec<_>>());
        }
    }
}
