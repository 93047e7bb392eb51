// Property-based tests for wrap and comparison invariants.
//
// Two categories:
// 1. Reader-key canonicalization: any ordering or duplication of a reader
//    list names the same wrapper
// 2. Comparator: callee order never matters, a dropped callee always does
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use stagec::callgraph::CallGraph;
use stagec::compare::{compare, CallGraphMismatch};
use stagec::expr::Expr;
use stagec::pipeline::Pipeline;
use stagec::wrap::ReaderKey;

const READERS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn arb_reader_list() -> impl Strategy<Value = Vec<&'static str>> {
    prop::collection::vec(prop::sample::select(READERS.to_vec()), 1..8)
}

fn arb_call_graph() -> impl Strategy<Value = BTreeMap<String, Vec<String>>> {
    prop::collection::btree_map(
        "[a-e](\\.in\\.[0-3])?",
        prop::collection::btree_set("[a-h]", 0..5).prop_map(|s| s.into_iter().collect::<Vec<_>>()),
        1..6,
    )
}

fn to_graph(map: &BTreeMap<String, Vec<String>>) -> CallGraph {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn reader_key_ignores_order_and_duplicates(readers in arb_reader_list(), seed in any::<u64>()) {
        let mut shuffled = readers.clone();
        let n = shuffled.len();
        shuffled.rotate_left((seed as usize) % n);
        shuffled.reverse();
        prop_assert_eq!(
            ReaderKey::from_readers(readers.iter().copied()),
            ReaderKey::from_readers(shuffled.iter().copied())
        );
        let distinct: BTreeSet<&str> = readers.iter().copied().collect();
        prop_assert_eq!(
            ReaderKey::from_readers(readers.iter().copied()),
            ReaderKey::from_readers(distinct)
        );
    }

    #[test]
    fn wrap_returns_one_wrapper_per_reader_set(readers in arb_reader_list(), other in arb_reader_list()) {
        let mut p = Pipeline::new();
        let src = p.func("src");
        p.define(&src, &["x"], Expr::var("x")).unwrap();
        let funcs: Vec<_> = READERS.iter().map(|n| p.func(n)).collect();
        for f in &funcs {
            p.define(f, &["x"], src.at([Expr::var("x")])).unwrap();
        }
        let pick = |names: &[&str]| -> Vec<usize> {
            let mut idx: Vec<usize> = names.iter().filter_map(|n| READERS.iter().position(|r| r == n)).collect();
            idx.sort_unstable();
            idx.dedup();
            idx
        };

        let first_idx = pick(&readers);
        let first: Vec<_> = first_idx.iter().map(|&i| &funcs[i]).collect();
        let w1 = p.wrap(&src, &first).unwrap();
        let mut reversed = first.clone();
        reversed.reverse();
        prop_assert_eq!(&w1, &p.wrap(&src, &reversed).unwrap());

        let second_idx = pick(&other);
        let second: Vec<_> = second_idx.iter().map(|&i| &funcs[i]).collect();
        let w2 = p.wrap(&src, &second).unwrap();
        let same_set = first_idx.iter().collect::<BTreeSet<_>>() == second_idx.iter().collect::<BTreeSet<_>>();
        prop_assert_eq!(w1 == w2, same_set);
    }

    #[test]
    fn comparator_ignores_callee_order(map in arb_call_graph()) {
        let reversed: BTreeMap<String, Vec<String>> = map
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().rev().cloned().collect()))
            .collect();
        prop_assert_eq!(compare(&to_graph(&map), &to_graph(&reversed)), Ok(()));
    }

    #[test]
    fn comparator_notices_a_dropped_callee(map in arb_call_graph()) {
        let victim = map.iter().find(|(_, v)| !v.is_empty()).map(|(k, _)| k.clone());
        prop_assume!(victim.is_some());
        let victim = victim.unwrap();
        let mut changed = map.clone();
        if let Some(callees) = changed.get_mut(&victim) {
            callees.pop();
        }
        let err = compare(&to_graph(&changed), &to_graph(&map)).unwrap_err();
        let is_callees_for_victim = matches!(err, CallGraphMismatch::Callees { ref caller, .. } if caller == &victim);
        prop_assert!(is_callees_for_victim);
    }
}
