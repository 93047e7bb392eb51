// stage.rs — Stage graph: named stages, their definitions, and image leaves
//
// Stages live in an arena indexed by `StageId` with a name index beside it.
// Every reference between stages is a call by name inside a definition, so
// the "reads" relation is recovered on demand by scanning definitions; adding
// a definition after the fact never requires graph surgery.
//
// Preconditions: stage and image names are unique within one graph.
// Postconditions: `reads`/`readers_of` reflect the definitions at call time.
// Failure modes: `check_acyclic` reports the first cycle found.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::expr::Expr;
use crate::id::StageId;
use crate::schedule::FuncSchedule;

// ── Reduction domains ───────────────────────────────────────────────────────

/// One dimension of a reduction domain, iterating `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RVar {
    pub name: String,
    pub min: Expr,
    pub extent: Expr,
}

/// A bounded, optionally predicated iteration space for update definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionDomain {
    pub name: String,
    pub vars: Vec<RVar>,
    /// Conjunction of every `where` clause.
    pub predicate: Option<Expr>,
}

const RVAR_SUFFIXES: [&str; 4] = ["x", "y", "z", "w"];

impl ReductionDomain {
    /// Build a domain from `(min, extent)` pairs; dimension `i` is named
    /// `<name>.x`, `<name>.y`, ... (then `<name>.<i>` past four).
    pub fn new(name: &str, bounds: &[(i32, i32)]) -> Self {
        let vars = bounds
            .iter()
            .enumerate()
            .map(|(i, &(min, extent))| RVar {
                name: rvar_name(name, i),
                min: Expr::Int(min),
                extent: Expr::Int(extent),
            })
            .collect();
        Self {
            name: name.to_string(),
            vars,
            predicate: None,
        }
    }

    pub fn add_predicate(&mut self, cond: Expr) {
        self.predicate = Some(match self.predicate.take() {
            Some(prev) => prev.and(cond),
            None => cond,
        });
    }

    pub fn contains_var(&self, name: &str) -> bool {
        self.vars.iter().any(|v| v.name == name)
    }
}

pub fn rvar_name(domain: &str, index: usize) -> String {
    match RVAR_SUFFIXES.get(index) {
        Some(suffix) => format!("{}.{}", domain, suffix),
        None => format!("{}.{}", domain, index),
    }
}

// ── Definitions ─────────────────────────────────────────────────────────────

/// `stage(lhs...) = rhs`, over `rdom` when it is an update with a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub lhs: Vec<Expr>,
    pub rhs: Expr,
    pub rdom: Option<ReductionDomain>,
}

impl Definition {
    fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.lhs
            .iter()
            .chain(std::iter::once(&self.rhs))
            .chain(self.rdom.iter().filter_map(|r| r.predicate.as_ref()))
    }

    /// Every name called by the lhs, rhs, or reduction predicate.
    pub fn calls(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for e in self.exprs() {
            names.extend(e.calls());
        }
        names
    }

    pub fn calls_name(&self, name: &str) -> bool {
        self.exprs().any(|e| e.calls_name(name))
    }

    /// Rename calls of `from` to `to` everywhere in the definition.
    pub fn rename_calls(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for e in self.lhs.iter_mut() {
            changed |= e.rename_calls(from, to);
        }
        changed |= self.rhs.rename_calls(from, to);
        if let Some(pred) = self.rdom.as_mut().and_then(|r| r.predicate.as_mut()) {
            changed |= pred.rename_calls(from, to);
        }
        changed
    }

    pub fn predicate(&self) -> Option<&Expr> {
        self.rdom.as_ref().and_then(|r| r.predicate.as_ref())
    }
}

// ── Stages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// Declared by the pipeline author.
    Declared,
    /// The stage through which an image parameter is read.
    ImageAccessor { image: String },
    /// Synthesized by the wrap resolver; copies `source` verbatim.
    Wrapper { source: String },
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub kind: StageKind,
    /// Pure argument names, set by the initialization definition.
    pub args: Vec<String>,
    pub init: Option<Definition>,
    pub updates: Vec<Definition>,
    pub schedule: FuncSchedule,
}

impl Stage {
    pub fn new(id: StageId, name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            args: Vec::new(),
            init: None,
            updates: Vec::new(),
            schedule: FuncSchedule::default(),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.init.is_some()
    }

    pub fn arity(&self) -> Option<usize> {
        self.init.as_ref().map(|_| self.args.len())
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn is_wrapper_of(&self, source: &str) -> bool {
        matches!(&self.kind, StageKind::Wrapper { source: s } if s == source)
    }

    /// Initialization first, then updates in order.
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.init.iter().chain(self.updates.iter())
    }

    /// Definition by index: 0 is the initialization, `k + 1` is update `k`.
    pub fn definition_mut(&mut self, index: usize) -> Option<&mut Definition> {
        if index == 0 {
            self.init.as_mut()
        } else {
            self.updates.get_mut(index - 1)
        }
    }

    pub fn definition_count(&self) -> usize {
        self.init.iter().count() + self.updates.len()
    }

    /// Names this stage reads, excluding itself.
    pub fn reads(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for def in self.definitions() {
            names.extend(def.calls());
        }
        names.remove(&self.name);
        names
    }
}

/// Per-stage facts the call-graph extractor needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMeta {
    pub has_updates: bool,
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StageGraph {
    stages: Vec<Stage>,
    index: HashMap<String, StageId>,
    /// Image parameter name → dimension count.
    images: BTreeMap<String, usize>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `name` is a stage or an image parameter.
    pub fn contains_name(&self, name: &str) -> bool {
        self.index.contains_key(name) || self.images.contains_key(name)
    }

    pub fn insert(&mut self, stage: Stage) -> StageId {
        let id = stage.id;
        self.index.insert(stage.name.clone(), id);
        self.stages.push(stage);
        id
    }

    pub fn declare_image(&mut self, name: &str, dims: usize) {
        self.images.insert(name.to_string(), dims);
    }

    pub fn image_dims(&self, name: &str) -> Option<usize> {
        self.images.get(name).copied()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let id = self.index.get(name)?;
        self.stages.iter().position(|s| s.id == *id)
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.position(name).map(|i| &self.stages[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Stage> {
        self.position(name).map(move |i| &mut self.stages[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Names read by stage `name` (stages and images), excluding itself.
    pub fn reads(&self, name: &str) -> BTreeSet<String> {
        self.get(name).map(Stage::reads).unwrap_or_default()
    }

    /// Stages whose definitions call `name`, in declaration order.
    pub fn readers_of(&self, name: &str) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.name != name && s.definitions().any(|d| d.calls_name(name)))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Metadata for every stage, keyed by name.
    pub fn meta(&self) -> BTreeMap<String, StageMeta> {
        self.stages
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    StageMeta {
                        has_updates: s.has_updates(),
                    },
                )
            })
            .collect()
    }

    /// Verify the reads relation has no cycle (a stage reading itself from
    /// an update is an accumulation, not a cycle). Returns the cycle path on
    /// failure, first node repeated at the end.
    pub fn check_acyclic(&self) -> Result<(), Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        fn dfs(
            graph: &StageGraph,
            name: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Result<(), Vec<String>> {
            match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    let start = path.iter().position(|n| n == name).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(name.to_string());
                    return Err(cycle);
                }
                Mark::Unvisited => {}
            }
            marks.insert(name.to_string(), Mark::Active);
            path.push(name.to_string());
            for callee in graph.reads(name) {
                if graph.contains(&callee) {
                    dfs(graph, &callee, marks, path)?;
                }
            }
            path.pop();
            marks.insert(name.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for stage in &self.stages {
            let mut path = Vec::new();
            dfs(self, &stage.name, &mut marks, &mut path)?;
        }
        Ok(())
    }
}
