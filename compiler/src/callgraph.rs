// callgraph.rs — Call-graph extraction from lowered statement trees
//
// Walks a statement tree and records, for each producer region, which buffers
// it loads. The initialization of a stage is keyed by the stage name; all of
// its update definitions are lumped under `<name>.update(0)`.
//
// Preconditions: `stages` describes every producer that may appear in the tree.
// Postconditions: every producer region gets a key, even with no callees;
//                 callee lists are de-duplicated and keep first-seen order.
// Failure modes: none fatal. Unknown producers and producer regions whose
//                update part cannot be located are reported as diagnostics.
// Side effects: `tracing::warn!` on a malformed producer region.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::expr::Expr;
use crate::ir::Stmt;
use crate::stage::StageMeta;

// ── Call graph ──────────────────────────────────────────────────────────────

/// Caller key → callee names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CallGraph(BTreeMap<String, Vec<String>>);

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `caller` has an entry.
    pub fn ensure(&mut self, caller: &str) {
        if !self.0.contains_key(caller) {
            self.0.insert(caller.to_string(), Vec::new());
        }
    }

    /// Add `callee` under `caller` unless already present.
    pub fn record(&mut self, caller: &str, callee: &str) {
        self.ensure(caller);
        if let Some(callees) = self.0.get_mut(caller) {
            if !callees.iter().any(|c| c == callee) {
                callees.push(callee.to_string());
            }
        }
    }

    pub fn callees(&self, caller: &str) -> Option<&[String]> {
        self.0.get(caller).map(Vec::as_slice)
    }

    pub fn contains(&self, caller: &str) -> bool {
        self.0.contains_key(caller)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl<K, V, S> FromIterator<(K, V)> for CallGraph
where
    K: Into<String>,
    V: IntoIterator<Item = S>,
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut graph = CallGraph::new();
        for (caller, callees) in iter {
            let caller = caller.into();
            graph.ensure(&caller);
            for callee in callees {
                graph.record(&caller, &callee.into());
            }
        }
        graph
    }
}

impl fmt::Display for CallGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (caller, callees) in &self.0 {
            writeln!(f, "{} -> [{}]", caller, callees.join(", "))?;
        }
        Ok(())
    }
}

// ── Extraction ──────────────────────────────────────────────────────────────

pub struct ExtractResult {
    pub graph: CallGraph,
    pub diagnostics: Vec<Diagnostic>,
}

impl ExtractResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

/// Key under which every update definition of `stage` is recorded.
pub fn update_key(stage: &str) -> String {
    format!("{}.update(0)", stage)
}

pub fn extract_call_graph(body: &Stmt, stages: &BTreeMap<String, StageMeta>) -> ExtractResult {
    let mut extractor = Extractor {
        stages,
        graph: CallGraph::new(),
        diagnostics: Vec::new(),
        producer: None,
    };
    extractor.visit(body);
    ExtractResult {
        graph: extractor.graph,
        diagnostics: extractor.diagnostics,
    }
}

/// Skip leading lets and (taking the `then` branch) ifs down to a block;
/// its two halves are the initialization and the updates.
fn peel(body: &Stmt) -> Option<(&Stmt, &Stmt)> {
    let mut current = body;
    loop {
        match current {
            Stmt::LetStmt { body, .. } => current = body,
            Stmt::IfThenElse { then_case, .. } => current = then_case,
            Stmt::Block { first, rest } => return Some((first, rest)),
            _ => return None,
        }
    }
}

struct Extractor<'a> {
    stages: &'a BTreeMap<String, StageMeta>,
    graph: CallGraph,
    diagnostics: Vec<Diagnostic>,
    /// Key loads are currently attributed to; `None` outside any producer.
    producer: Option<String>,
}

impl<'a> Extractor<'a> {
    fn visit(&mut self, stmt: &Stmt) {
        if let Stmt::Producer { name, body } = stmt {
            self.visit_producer(name, body);
            return;
        }
        for e in stmt.exprs() {
            self.visit_expr(e);
        }
        for child in stmt.children() {
            self.visit(child);
        }
    }

    fn visit_expr(&mut self, e: &Expr) {
        let Some(producer) = self.producer.clone() else {
            return;
        };
        let graph = &mut self.graph;
        e.visit(&mut |node| {
            if let Expr::Load { name, .. } = node {
                graph.record(&producer, name);
            }
        });
    }

    fn visit_producer(&mut self, name: &str, body: &Stmt) {
        let has_updates = match self.stages.get(name) {
            Some(meta) => meta.has_updates,
            None => {
                self.diagnostics.push(
                    Diagnostic::new(DiagLevel::Error, "producer region for a stage that is not in the stage table")
                        .with_code(codes::E0310)
                        .with_stage(name),
                );
                false
            }
        };

        let (init, update) = if has_updates {
            match peel(body) {
                Some((first, rest)) => (first, Some(rest)),
                None => {
                    warn!(stage = name, "no block found after peeling producer region; treating it as initialization only");
                    self.diagnostics.push(
                        Diagnostic::new(DiagLevel::Warning, "stage has updates but its producer region has no block after peeling")
                            .with_code(codes::W0311)
                            .with_stage(name)
                            .with_hint("update callees are attributed to the initialization"),
                    );
                    (body, None)
                }
            }
        } else {
            (body, None)
        };

        let saved = self.producer.replace(name.to_string());
        self.graph.ensure(name);
        self.visit(init);

        if let Some(update) = update {
            let key = update_key(name);
            self.graph.ensure(&key);
            self.producer = Some(key);
            self.visit(update);
        }
        self.producer = saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ForKind;

    fn store(name: &str, loads: &[&str]) -> Stmt {
        let value = loads
            .iter()
            .map(|l| Expr::load(*l, vec![Expr::var("x")]))
            .reduce(|a, b| a + b)
            .unwrap_or(Expr::int(0));
        Stmt::Store {
            name: name.into(),
            args: vec![Expr::var("x")],
            value,
        }
    }

    fn meta(entries: &[(&str, bool)]) -> BTreeMap<String, StageMeta> {
        entries
            .iter()
            .map(|(n, u)| (n.to_string(), StageMeta { has_updates: *u }))
            .collect()
    }

    #[test]
    fn nested_producers_restore_the_outer_key() {
        let tree = Stmt::producer(
            "g",
            Stmt::for_loop(
                "g.s0.x",
                Expr::int(0),
                Expr::int(4),
                ForKind::Serial,
                Stmt::block(
                    Stmt::producer("w", store("w", &["img"])),
                    store("g", &["w"]),
                ),
            ),
        );
        let result = extract_call_graph(&tree, &meta(&[("g", false), ("w", false)]));
        let expected: CallGraph = [("g", vec!["w"]), ("w", vec!["img"])].into_iter().collect();
        assert_eq!(result.graph, expected);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn updates_are_lumped_after_peeling() {
        let body = Stmt::let_stmt(
            "g.s0.x.min",
            Expr::int(0),
            Stmt::if_then_else(
                Expr::param("p"),
                Stmt::block(
                    store("g", &[]),
                    Stmt::block(store("g", &["g", "a"]), store("g", &["b"])),
                ),
                store("g", &["never"]),
            ),
        );
        let tree = Stmt::producer("g", body);
        let result = extract_call_graph(&tree, &meta(&[("g", true)]));
        assert_eq!(result.graph.callees("g"), Some(&[][..]));
        assert_eq!(
            result.graph.callees("g.update(0)").unwrap(),
            &["g".to_string(), "a".to_string(), "b".to_string()]
        );
        assert_eq!(result.graph.len(), 2);
    }

    #[test]
    fn stage_without_updates_is_not_peeled() {
        let tree = Stmt::producer("f", Stmt::block(store("f", &["a"]), store("f", &["b"])));
        let result = extract_call_graph(&tree, &meta(&[("f", false)]));
        assert_eq!(
            result.graph.callees("f").unwrap(),
            &["a".to_string(), "b".to_string()]
        );
        assert!(!result.graph.contains("f.update(0)"));
    }

    #[test]
    fn peel_failure_is_a_warning() {
        let tree = Stmt::producer("g", store("g", &["a"]));
        let result = extract_call_graph(&tree, &meta(&[("g", true)]));
        assert_eq!(result.graph.callees("g").unwrap(), &["a".to_string()]);
        assert!(!result.graph.contains("g.update(0)"));
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, Some(codes::W0311));
        assert!(!result.has_errors());
    }

    #[test]
    fn unknown_producer_is_an_error_but_still_recorded() {
        let tree = Stmt::producer("mystery", store("mystery", &["a"]));
        let result = extract_call_graph(&tree, &BTreeMap::new());
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].code, Some(codes::E0310));
        assert_eq!(result.graph.callees("mystery").unwrap(), &["a".to_string()]);
    }

    #[test]
    fn loads_outside_producers_are_ignored() {
        let tree = Stmt::block(store("out", &["a"]), Stmt::producer("f", store("f", &["a", "a"])));
        let result = extract_call_graph(&tree, &meta(&[("f", false)]));
        assert_eq!(result.graph.len(), 1);
        assert_eq!(result.graph.callees("f").unwrap(), &["a".to_string()]);
    }

    #[test]
    fn display_and_json() {
        let graph: CallGraph = [("g", vec!["w", "img"]), ("w", vec![])].into_iter().collect();
        insta::assert_snapshot!(graph.to_string(), @r"
        g -> [w, img]
        w -> []
        ");
        let json: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        assert_eq!(json["g"][1], "img");
        assert_eq!(json["w"].as_array().map(Vec::len), Some(0));
    }
}
