// End-to-end checks for the bundled wrap scenarios.
//
// Every scenario is built, lowered, its call graph extracted and compared,
// and the output realized over a reduced extent. Reduction domains in the
// scenarios cover [0, 100), so the extent stays above that.

use stagec::callgraph::{extract_call_graph, CallGraph};
use stagec::compare::CallGraphMismatch;
use stagec::config::Options;
use stagec::scenarios::{self, ScenarioError};

const QUICK: [i32; 2] = [104, 104];

fn run(name: &str) -> Vec<scenarios::CheckOutcome> {
    let scenario = scenarios::find(name).unwrap();
    scenarios::run(scenario, &Options::default(), &QUICK)
        .unwrap_or_else(|e| panic!("{}: {}", name, e))
}

#[test]
fn calling_wrap_no_op() {
    assert!(run("calling_wrap_no_op").is_empty());
}

#[test]
fn func_wrap() {
    let outcomes = run("func_wrap");
    assert_eq!(outcomes.len(), 1);
    insta::assert_snapshot!(outcomes[0].graph.to_string(), @r"
    g -> [img_im.in.0]
    img_im -> [img]
    img_im.in.0 -> [img_im]
    ");
}

#[test]
fn multiple_funcs_sharing_wrapper() {
    let outcomes = run("multiple_funcs_sharing_wrapper");
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        assert_eq!(outcome.graph.callees(&outcome.output).unwrap(), &["img_im.in.0".to_string()]);
    }
}

#[test]
fn global_wrap() {
    let outcomes = run("global_wrap");
    let h = outcomes[0].graph.callees("h").unwrap();
    assert_eq!(h.len(), 2);
    assert_eq!(outcomes[0].buffer.get(&[7, 9]), Some(32));
}

#[test]
fn update_defined_after_wrap() {
    let outcomes = run("update_defined_after_wrap");
    assert_eq!(outcomes.len(), 2);
    insta::assert_snapshot!(outcomes[0].graph.to_string(), @r"
    g -> [img_im.in.0]
    g.update(0) -> [g, img_im.in.0]
    img_im -> [img]
    img_im.in.0 -> [img_im]
    ");
    // Both specialization branches compute the same thing.
    assert_eq!(outcomes[0].buffer, outcomes[1].buffer);
}

#[test]
fn rdom_wrapper() {
    let outcomes = run("rdom_wrapper");
    assert_eq!(outcomes[0].output, "g.in.0");
    assert_eq!(outcomes[0].graph.callees("g"), Some(&[][..]));
    assert_eq!(outcomes[0].buffer.get(&[1, 2]), Some(4 + 12 + 10));
}

#[test]
fn global_and_custom_wrap() {
    let outcomes = run("global_and_custom_wrap");
    insta::assert_snapshot!(outcomes[0].graph.to_string(), @r"
    g -> [img_im.in.0]
    img_im -> [img]
    img_im.in.0 -> [img_im]
    img_im.in.1 -> [img_im]
    result -> [img_im.in.1, g]
    ");
}

#[test]
fn wrapper_depend_on_mutated_func() {
    let outcomes = run("wrapper_depend_on_mutated_func");
    assert_eq!(outcomes[0].graph.len(), 6);
}

#[test]
fn wrapper_on_wrapper() {
    let outcomes = run("wrapper_on_wrapper");
    assert_eq!(outcomes[0].graph.len(), 7);
    assert_eq!(outcomes[0].buffer.get(&[3, 5]), Some(32));
}

#[test]
fn wrapper_on_rdom_predicate() {
    let outcomes = run("wrapper_on_rdom_predicate");
    let buffer = &outcomes[0].buffer;
    assert_eq!(buffer.get(&[10, 10]), Some(15));
    assert_eq!(buffer.get(&[40, 10]), Some(10));
    assert_eq!(buffer.get(&[101, 0]), Some(10));
}

#[test]
fn two_fold_wrapper() {
    let outcomes = run("two_fold_wrapper");
    assert_eq!(outcomes[0].graph.len(), 4);
}

#[test]
fn multi_folds_wrapper() {
    let outcomes = run("multi_folds_wrapper");
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].graph.len(), 4);
    assert_eq!(outcomes[1].graph.len(), 6);
}

#[test]
fn wrong_expectation_is_reported() {
    let scenario = scenarios::find("func_wrap").unwrap();
    let mut built = scenario.build(&Options::default()).unwrap();
    built.checks[0].expected = [("g", vec!["img_im"]), ("img_im", vec!["img"]), ("img_im.in.0", vec!["img_im"])]
        .into_iter()
        .collect();
    let err = built
        .run_check(&built.checks[0], &QUICK)
        .err()
        .expect("mismatch expected");
    match err {
        ScenarioError::CallGraph { output, source } => {
            assert_eq!(output, "g");
            assert_eq!(
                source,
                CallGraphMismatch::Callees {
                    caller: "g".into(),
                    expected: vec!["img_im".into()],
                    actual: vec!["img_im.in.0".into()],
                }
            );
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn wrong_value_is_reported() {
    let scenario = scenarios::find("func_wrap").unwrap();
    let mut built = scenario.build(&Options::default()).unwrap();
    built.checks[0].value = |c| c[0] + 1;
    let err = built.run_check(&built.checks[0], &QUICK).err().unwrap();
    assert_eq!(err.to_string(), "g(0, 0) = 0 instead of 1");
}

#[test]
fn partial_stage_table_reports_unknown_producers() {
    let scenario = scenarios::find("func_wrap").unwrap();
    let built = scenario.build(&Options::default()).unwrap();
    let g = &built.checks[0].output;
    let module = built.pipeline.compile(g).unwrap();
    let result = extract_call_graph(&module.body, &built.pipeline.stage_meta_for(&[g]));
    assert!(result.has_errors());
    // Unknown producers are still recorded, so the graph is complete.
    let expected: &CallGraph = &built.checks[0].expected;
    assert_eq!(&result.graph, expected);
}

#[test]
fn wrapper_suffix_option_renames_every_wrapper() {
    let options = Options {
        wrapper_suffix: "_wrapper".into(),
        ..Options::default()
    };
    let scenario = scenarios::find("wrapper_on_wrapper").unwrap();
    let outcomes = scenarios::run(scenario, &options, &[32, 32]).unwrap();
    let wrappers = outcomes[0]
        .graph
        .iter()
        .filter(|(caller, _)| caller.contains("_wrapper."))
        .count();
    assert_eq!(wrappers, 4);
}
