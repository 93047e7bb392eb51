// dot.rs — Graphviz DOT output for extracted call graphs
//
// One node per caller key and per callee; an edge caller -> callee for every
// recorded call. Names that never produce anything (image buffers) are drawn
// as boxes, wrappers are filled.
//
// Preconditions: none.
// Postconditions: returns a valid DOT string; node order is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;

use crate::callgraph::CallGraph;

/// Emit `graph` as a Graphviz DOT string, filling the nodes in `wrappers`.
pub fn emit_dot(graph: &CallGraph, wrappers: &BTreeSet<String>) -> String {
    Dot { graph, wrappers }.to_string()
}

struct Dot<'a> {
    graph: &'a CallGraph,
    wrappers: &'a BTreeSet<String>,
}

impl fmt::Display for Dot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "digraph calls {{")?;
        writeln!(f, "    rankdir=LR;")?;
        writeln!(f, "    node [fontname=\"Helvetica\", fontsize=10];")?;

        let mut names: BTreeSet<&str> = BTreeSet::new();
        for (caller, callees) in self.graph.iter() {
            names.insert(caller);
            names.extend(callees.iter().map(String::as_str));
        }
        for name in &names {
            writeln!(f, "    {} [label=\"{}\"{}];", node_id(name), name, self.attrs(name))?;
        }

        writeln!(f)?;
        for (caller, callees) in self.graph.iter() {
            for callee in callees {
                writeln!(f, "    {} -> {};", node_id(caller), node_id(callee))?;
            }
        }
        writeln!(f, "}}")
    }
}

impl Dot<'_> {
    fn attrs(&self, name: &str) -> &'static str {
        if !self.graph.contains(name) {
            ", shape=box"
        } else if self.wrappers.contains(name) {
            ", style=filled, fillcolor=lightblue"
        } else {
            ""
        }
    }
}

/// Quoted so `.`, `(` and `$` in stage names survive.
fn node_id(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_chain() {
        let graph: CallGraph = [
            ("g", vec!["img_im.in.0"]),
            ("img_im.in.0", vec!["img_im"]),
            ("img_im", vec!["img"]),
        ]
        .into_iter()
        .collect();
        let wrappers = BTreeSet::from(["img_im.in.0".to_string()]);
        insta::assert_snapshot!(emit_dot(&graph, &wrappers), @r#"
        digraph calls {
            rankdir=LR;
            node [fontname="Helvetica", fontsize=10];
            "g" [label="g"];
            "img" [label="img", shape=box];
            "img_im" [label="img_im"];
            "img_im.in.0" [label="img_im.in.0", style=filled, fillcolor=lightblue];

            "g" -> "img_im.in.0";
            "img_im" -> "img";
            "img_im.in.0" -> "img_im";
        }
        "#);
    }

    #[test]
    fn callers_without_callees_still_appear() {
        let graph: CallGraph = [("g", Vec::<&str>::new()), ("g.update(0)", vec!["g"])]
            .into_iter()
            .collect();
        let dot = emit_dot(&graph, &BTreeSet::new());
        assert!(dot.contains("\"g\" [label=\"g\"];"));
        assert!(dot.contains("\"g.update(0)\" -> \"g\";"));
        assert_eq!(dot.matches("->").count(), 1);
    }
}
