// compare.rs — Order-insensitive call-graph comparison
//
// Two call graphs are equal when they have the same callers and, for each
// caller, the same set of callees. Callee order is ignored.
//
// Preconditions: none.
// Postconditions: `Ok(())` iff the graphs are equal as maps of sets.
// Failure modes: `CallGraphMismatch` describing the first difference found.
// Side effects: none.

use std::collections::BTreeSet;

use crate::callgraph::CallGraph;
use crate::diag::{codes, DiagLevel, Diagnostic};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallGraphMismatch {
    #[error("Expect {expected} callers instead of {actual}")]
    CallerCount { expected: usize, actual: usize },
    #[error("Expect {caller} to be in the call graphs")]
    MissingCaller { caller: String },
    #[error(
        "Expect callees of {caller} to be ({}); got ({}) instead",
        .expected.join(", "),
        .actual.join(", ")
    )]
    Callees {
        caller: String,
        /// Sorted.
        expected: Vec<String>,
        /// Sorted.
        actual: Vec<String>,
    },
}

impl CallGraphMismatch {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let d = Diagnostic::new(DiagLevel::Error, self.to_string()).with_code(codes::E0401);
        match self {
            CallGraphMismatch::CallerCount { .. } => d,
            CallGraphMismatch::MissingCaller { caller } | CallGraphMismatch::Callees { caller, .. } => {
                d.with_stage(caller.clone())
            }
        }
    }
}

fn sorted(callees: &[String]) -> BTreeSet<&str> {
    callees.iter().map(String::as_str).collect()
}

pub fn compare(actual: &CallGraph, expected: &CallGraph) -> Result<(), CallGraphMismatch> {
    if actual.len() != expected.len() {
        return Err(CallGraphMismatch::CallerCount {
            expected: expected.len(),
            actual: actual.len(),
        });
    }

    for (caller, expected_callees) in expected.iter() {
        let Some(actual_callees) = actual.callees(caller) else {
            return Err(CallGraphMismatch::MissingCaller {
                caller: caller.to_string(),
            });
        };
        let want = sorted(expected_callees);
        let got = sorted(actual_callees);
        if want != got {
            return Err(CallGraphMismatch::Callees {
                caller: caller.to_string(),
                expected: want.into_iter().map(str::to_string).collect(),
                actual: got.into_iter().map(str::to_string).collect(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(entries: &[(&str, &[&str])]) -> CallGraph {
        entries.iter().map(|(k, v)| (*k, v.iter().copied())).collect()
    }

    #[test]
    fn order_does_not_matter() {
        let a = graph(&[("A", &["X", "Y"])]);
        let b = graph(&[("A", &["Y", "X"])]);
        assert_eq!(compare(&a, &b), Ok(()));
    }

    #[test]
    fn caller_count_is_checked_first() {
        let a = graph(&[("A", &[]), ("B", &[])]);
        let b = graph(&[("A", &[])]);
        let err = compare(&a, &b).unwrap_err();
        assert_eq!(err.to_string(), "Expect 1 callers instead of 2");
    }

    #[test]
    fn missing_caller() {
        let a = graph(&[("A", &[])]);
        let b = graph(&[("B", &[])]);
        let err = compare(&a, &b).unwrap_err();
        assert_eq!(
            err,
            CallGraphMismatch::MissingCaller {
                caller: "B".to_string()
            }
        );
        assert_eq!(err.to_string(), "Expect B to be in the call graphs");
    }

    #[test]
    fn callee_sets_are_shown_sorted() {
        let a = graph(&[("g", &["img", "g"])]);
        let b = graph(&[("g", &["w", "g"])]);
        let err = compare(&a, &b).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Expect callees of g to be (g, w); got (g, img) instead"
        );
        let d = err.to_diagnostic();
        assert_eq!(d.code, Some(codes::E0401));
        assert_eq!(d.stage.as_deref(), Some("g"));
    }

    #[test]
    fn empty_callee_set_differs_from_nonempty() {
        let a = graph(&[("f", &[])]);
        let b = graph(&[("f", &["x"])]);
        assert!(matches!(compare(&a, &b), Err(CallGraphMismatch::Callees { .. })));
    }
}
