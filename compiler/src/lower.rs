// lower.rs — Stage graph → statement tree
//
// Lowers the stages reachable from an output to one statement tree: inline
// stages are substituted into their callers, every other stage becomes a
// producer region placed at its compute site inside a `Realize` of the box its
// consumers need there.
//
// Preconditions: the graph was built through `Pipeline` (definitions are
//                well-formed; wraps are already rewritten in).
// Postconditions: every load in the tree names an image, the output, or a
//                 buffer realized around it; loop variables are named
//                 `<stage>.s<definition>.<dim>`.
// Failure modes: `LowerError` for undefined or unknown callees, cycles, bad
//                loop directives, and compute sites that do not cover every
//                load of the placed stage.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::trace;

use crate::bounds::{self, bounds_of, BoundsError, Interval, Region, Scope};
use crate::config::Options;
use crate::expr::Expr;
use crate::ir::{ForKind, Range, Stmt};
use crate::schedule::{ComputeLevel, Directive};
use crate::stage::{Definition, Stage, StageGraph};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LowerError {
    #[error("unknown output stage '{0}'")]
    UnknownStage(String),
    #[error("stage '{0}' is used but never defined")]
    Undefined(String),
    #[error("'{caller}' calls unknown name '{callee}'")]
    UnknownCallee { caller: String, callee: String },
    #[error("'{caller}' calls '{callee}' with {found} arguments, expected {expected}")]
    CallArity {
        caller: String,
        callee: String,
        expected: usize,
        found: usize,
    },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("definition {definition} of '{stage}' has no loop dimension '{dim}'")]
    UnknownDim {
        stage: String,
        definition: usize,
        dim: String,
    },
    #[error("definition {definition} of '{stage}' names dimension '{dim}' twice")]
    DuplicateDim {
        stage: String,
        definition: usize,
        dim: String,
    },
    #[error("split of '{dim}' in '{stage}' by non-positive factor {factor}")]
    BadFactor {
        stage: String,
        dim: String,
        factor: i32,
    },
    #[error("cannot compute '{stage}' at {at}.{var}: {reason}")]
    InvalidComputeAt {
        stage: String,
        at: String,
        var: String,
        reason: String,
    },
    #[error("stage '{0}' is realized but never loaded")]
    Unused(String),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
}

// ── Output ──────────────────────────────────────────────────────────────────

/// A lowered pipeline: one statement tree computing `name`.
#[derive(Debug, Clone)]
pub struct Module {
    /// The output stage; its bounds are the free names
    /// `<name>.min.<d>` / `<name>.extent.<d>`.
    pub name: String,
    pub output_dims: usize,
    pub body: Stmt,
    /// Stages with a producer region, output first, then in placement order.
    pub realized: Vec<String>,
    pub inlined: BTreeSet<String>,
    /// Images loaded by the tree, with their dimension counts.
    pub images: BTreeMap<String, usize>,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {} ({} dims)", self.name, self.output_dims)?;
        write!(f, "{}", self.body)
    }
}

pub fn min_name(buffer: &str, dim: usize) -> String {
    format!("{}.min.{}", buffer, dim)
}

pub fn extent_name(buffer: &str, dim: usize) -> String {
    format!("{}.extent.{}", buffer, dim)
}

fn loop_name(stage: &str, definition: usize, dim: &str) -> String {
    format!("{}.s{}.{}", stage, definition, dim)
}

// ── Entry point ─────────────────────────────────────────────────────────────

pub fn lower(graph: &StageGraph, output: &str, options: &Options) -> Result<Module, LowerError> {
    let out = graph
        .get(output)
        .ok_or_else(|| LowerError::UnknownStage(output.to_string()))?;
    if !out.is_defined() {
        return Err(LowerError::Undefined(output.to_string()));
    }

    let mut lowerer = Lowerer {
        graph,
        options,
        output,
        inlined: HashMap::new(),
        images: BTreeMap::new(),
    };
    let order = lowerer.collect()?;

    // Inline bodies, callees before callers.
    for name in &order {
        let stage = lowerer.stage(name)?;
        if lowerer.is_inline(stage) {
            if let Some(init) = &stage.init {
                let body = lowerer.lower_expr(&init.rhs);
                lowerer.inlined.insert(name.clone(), (stage.args.clone(), body));
            }
        }
    }

    // Consumers first: the output, then each realized stage after all of
    // its readers have been placed.
    let realized: Vec<String> = order
        .iter()
        .rev()
        .filter(|name| !lowerer.inlined.contains_key(*name))
        .cloned()
        .collect();

    let mut tree = Stmt::producer(output, lowerer.build_producer(out)?);
    for name in realized.iter().skip(1) {
        let stage = lowerer.stage(name)?;
        let producer = Stmt::producer(name.clone(), lowerer.build_producer(stage)?);
        tree = lowerer.place(tree, stage, &producer)?;
        trace!(stage = %name, level = %stage.schedule.compute, "placed producer");
    }

    Ok(Module {
        name: output.to_string(),
        output_dims: out.args.len(),
        body: tree,
        realized,
        inlined: lowerer.inlined.keys().cloned().collect(),
        images: lowerer.images,
    })
}

// ── Lowerer ─────────────────────────────────────────────────────────────────

struct Lowerer<'a> {
    graph: &'a StageGraph,
    options: &'a Options,
    output: &'a str,
    /// Inline stage → (pure args, lowered body).
    inlined: HashMap<String, (Vec<String>, Expr)>,
    images: BTreeMap<String, usize>,
}

/// One loop of a nest while directives are applied.
#[derive(Debug, Clone)]
struct LoopDim {
    name: String,
    min: Expr,
    extent: Expr,
    kind: ForKind,
    rvar: bool,
}

impl<'a> Lowerer<'a> {
    fn stage(&self, name: &str) -> Result<&'a Stage, LowerError> {
        self.graph
            .get(name)
            .ok_or_else(|| LowerError::UnknownStage(name.to_string()))
    }

    fn is_inline(&self, stage: &Stage) -> bool {
        stage.name != self.output
            && stage.schedule.compute == ComputeLevel::Inline
            && !stage.has_updates()
    }

    /// Reachable stages in post-order (callees first). Validates callees
    /// and arities, and rejects cycles.
    fn collect(&mut self) -> Result<Vec<String>, LowerError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }

        fn dfs(
            lowerer: &mut Lowerer<'_>,
            name: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
            order: &mut Vec<String>,
        ) -> Result<(), LowerError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Active) => {
                    let start = path.iter().position(|n| n == name).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(name.to_string());
                    return Err(LowerError::Cycle(cycle));
                }
                None => {}
            }
            let stage = lowerer.stage(name)?;
            if !stage.is_defined() {
                return Err(LowerError::Undefined(name.to_string()));
            }
            marks.insert(name.to_string(), Mark::Active);
            path.push(name.to_string());

            for callee in lowerer.check_calls(stage)? {
                if callee != name {
                    dfs(lowerer, &callee, marks, path, order)?;
                }
            }

            path.pop();
            marks.insert(name.to_string(), Mark::Done);
            order.push(name.to_string());
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        let mut order = Vec::new();
        let output = self.output;
        dfs(self, output, &mut marks, &mut path, &mut order)?;
        Ok(order)
    }

    /// Stage callees of `stage`, after checking every call it makes.
    fn check_calls(&mut self, stage: &Stage) -> Result<BTreeSet<String>, LowerError> {
        let mut calls = Vec::new();
        for def in stage.definitions() {
            let exprs = def
                .lhs
                .iter()
                .chain(std::iter::once(&def.rhs))
                .chain(def.predicate());
            for e in exprs {
                e.visit(&mut |node| {
                    if let Expr::Call { name, args } = node {
                        calls.push((name.clone(), args.len()));
                    }
                });
            }
        }

        let mut stages = BTreeSet::new();
        for (callee, found) in calls {
            let expected = if let Some(target) = self.graph.get(&callee) {
                stages.insert(callee.clone());
                match target.arity() {
                    Some(arity) => arity,
                    None => return Err(LowerError::Undefined(callee)),
                }
            } else if let Some(dims) = self.graph.image_dims(&callee) {
                self.images.insert(callee.clone(), dims);
                dims
            } else {
                return Err(LowerError::UnknownCallee {
                    caller: stage.name.clone(),
                    callee,
                });
            };
            if expected != found {
                return Err(LowerError::CallArity {
                    caller: stage.name.clone(),
                    callee,
                    expected,
                    found,
                });
            }
        }
        Ok(stages)
    }

    /// Substitute inline stages and turn every remaining call into a load.
    fn lower_expr(&self, e: &Expr) -> Expr {
        e.rewrite(&mut |node| match node {
            Expr::Call { name, args } => match self.inlined.get(&name) {
                Some((params, body)) => {
                    let bindings: HashMap<String, Expr> = params.iter().cloned().zip(args).collect();
                    body.substitute(&bindings)
                }
                None => Expr::Load { name, args },
            },
            other => other,
        })
    }

    // ── Producer regions ────────────────────────────────────────────────────

    fn build_producer(&self, stage: &Stage) -> Result<Stmt, LowerError> {
        let mut nests = Vec::new();
        for (k, def) in stage.definitions().enumerate() {
            nests.push(self.build_nest(stage, k, def)?);
        }
        let mut body = Stmt::block_of(nests).ok_or_else(|| LowerError::Undefined(stage.name.clone()))?;

        if self.options.emit_specializations {
            for cond in stage.schedule.specializations.iter().rev() {
                body = Stmt::if_then_else(self.lower_expr(cond), body.clone(), body);
            }
        }

        // Per-definition bounds of the pure dimensions, taken from the
        // realized region.
        for (k, def) in stage.definitions().enumerate().collect::<Vec<_>>().into_iter().rev() {
            for (d, arg) in stage.args.iter().enumerate().rev() {
                if def.lhs.get(d) != Some(&Expr::var(arg.clone())) {
                    continue;
                }
                let dim = loop_name(&stage.name, k, arg);
                let min = Expr::var(min_name(&stage.name, d));
                let max = min.clone() + Expr::var(extent_name(&stage.name, d)) - 1;
                body = Stmt::let_stmt(format!("{}.max", dim), max, body);
                body = Stmt::let_stmt(format!("{}.min", dim), min, body);
            }
        }
        Ok(body)
    }

    /// Loop nest of definition `k`: dims, directives, derived bindings and
    /// the store.
    fn build_nest(&self, stage: &Stage, k: usize, def: &Definition) -> Result<Stmt, LowerError> {
        let qualified = |dim: &str| loop_name(&stage.name, k, dim);

        // Innermost first: reduction variables, then the pure dims kept on
        // the left-hand side.
        let mut dims = Vec::new();
        if let Some(rdom) = &def.rdom {
            for rv in &rdom.vars {
                dims.push(LoopDim {
                    name: rv.name.clone(),
                    min: rv.min.clone(),
                    extent: rv.extent.clone(),
                    kind: ForKind::Serial,
                    rvar: true,
                });
            }
        }
        for (d, arg) in stage.args.iter().enumerate() {
            if def.lhs.get(d) == Some(&Expr::var(arg.clone())) {
                let min = Expr::var(format!("{}.min", qualified(arg)));
                let max = Expr::var(format!("{}.max", qualified(arg)));
                dims.push(LoopDim {
                    name: arg.clone(),
                    extent: max - min.clone() + 1,
                    min,
                    kind: ForKind::Serial,
                    rvar: false,
                });
            }
        }
        let originals: Vec<String> = dims.iter().map(|d| d.name.clone()).collect();

        let mut bindings: Vec<(String, Expr)> = Vec::new();
        let mut guards: Vec<Expr> = Vec::new();
        let find = |dims: &[LoopDim], name: &str| {
            dims.iter()
                .position(|d| d.name == name)
                .ok_or_else(|| LowerError::UnknownDim {
                    stage: stage.name.clone(),
                    definition: k,
                    dim: name.to_string(),
                })
        };

        for directive in stage.schedule.loops(k) {
            match directive {
                Directive::Split {
                    old,
                    outer,
                    inner,
                    factor,
                } => {
                    if *factor <= 0 {
                        return Err(LowerError::BadFactor {
                            stage: stage.name.clone(),
                            dim: old.clone(),
                            factor: *factor,
                        });
                    }
                    let f = *factor;
                    let pos = find(&dims, old)?;
                    let dim = dims.remove(pos);
                    let divides = dim.extent.as_int().map(|e| e % f == 0).unwrap_or(false);
                    let outer_var = Expr::var(qualified(outer));
                    let inner_var = Expr::var(qualified(inner));
                    let last = dim.min.clone() + dim.extent.clone() - 1;

                    let value = if divides || dim.rvar {
                        dim.min.clone() + outer_var * f + inner_var
                    } else {
                        // Shift the tail inwards so no point past the end is
                        // computed; a dim shorter than the factor is clamped.
                        let base = Expr::min(outer_var * f, Expr::max(dim.extent.clone() - f, 0));
                        Expr::min(dim.min.clone() + base + inner_var, last.clone())
                    };
                    if dim.rvar && !divides {
                        guards.push(Expr::var(qualified(old)).le(last));
                    }
                    bindings.push((qualified(old), value));

                    dims.insert(
                        pos,
                        LoopDim {
                            name: outer.clone(),
                            min: Expr::int(0),
                            extent: (dim.extent.clone() + (f - 1)) / f,
                            kind: ForKind::Serial,
                            rvar: dim.rvar,
                        },
                    );
                    dims.insert(
                        pos,
                        LoopDim {
                            name: inner.clone(),
                            min: Expr::int(0),
                            extent: Expr::int(f),
                            kind: ForKind::Serial,
                            rvar: dim.rvar,
                        },
                    );
                }
                Directive::Fuse {
                    inner,
                    outer,
                    fused,
                } => {
                    let pi = find(&dims, inner)?;
                    let po = find(&dims, outer)?;
                    if pi == po {
                        return Err(LowerError::DuplicateDim {
                            stage: stage.name.clone(),
                            definition: k,
                            dim: inner.clone(),
                        });
                    }
                    let inner_dim = dims[pi].clone();
                    let outer_dim = dims[po].clone();
                    dims.remove(pi.max(po));
                    dims.remove(pi.min(po));

                    let fused_var = Expr::var(qualified(fused));
                    bindings.push((
                        qualified(inner),
                        inner_dim.min.clone() + fused_var.clone() % inner_dim.extent.clone(),
                    ));
                    bindings.push((
                        qualified(outer),
                        outer_dim.min.clone() + fused_var / inner_dim.extent.clone(),
                    ));
                    dims.insert(
                        pi.min(po),
                        LoopDim {
                            name: fused.clone(),
                            min: Expr::int(0),
                            extent: inner_dim.extent * outer_dim.extent,
                            kind: ForKind::Serial,
                            rvar: inner_dim.rvar || outer_dim.rvar,
                        },
                    );
                }
                Directive::Reorder { dims: order } => {
                    let mut positions = Vec::new();
                    for name in order {
                        let pos = find(&dims, name)?;
                        if positions.contains(&pos) {
                            return Err(LowerError::DuplicateDim {
                                stage: stage.name.clone(),
                                definition: k,
                                dim: name.clone(),
                            });
                        }
                        positions.push(pos);
                    }
                    let picked: Vec<LoopDim> = positions.iter().map(|&p| dims[p].clone()).collect();
                    let mut slots = positions.clone();
                    slots.sort_unstable();
                    for (slot, dim) in slots.into_iter().zip(picked) {
                        dims[slot] = dim;
                    }
                }
                Directive::Vectorize { var } => {
                    let pos = find(&dims, var)?;
                    dims[pos].kind = ForKind::Vectorized;
                }
                Directive::Unroll { var } => {
                    let pos = find(&dims, var)?;
                    dims[pos].kind = ForKind::Unrolled;
                }
                Directive::Parallel { var } => {
                    let pos = find(&dims, var)?;
                    dims[pos].kind = ForKind::Parallel;
                }
            }
        }

        let mut body = Stmt::Store {
            name: stage.name.clone(),
            args: def.lhs.iter().map(|a| self.lower_expr(a)).collect(),
            value: self.lower_expr(&def.rhs),
        };
        if let Some(pred) = def.predicate() {
            body = Stmt::if_then(self.lower_expr(pred), body);
        }
        for name in originals.iter().rev() {
            body = Stmt::let_stmt(name.clone(), Expr::var(qualified(name)), body);
        }
        if let Some(cond) = guards.into_iter().reduce(Expr::and) {
            body = Stmt::if_then(cond, body);
        }
        // The first directive's binding is innermost.
        for (name, value) in bindings {
            body = Stmt::let_stmt(name, value, body);
        }
        for dim in dims {
            body = Stmt::for_loop(qualified(&dim.name), dim.min, dim.extent, dim.kind, body);
        }
        Ok(body)
    }

    // ── Placement ───────────────────────────────────────────────────────────

    fn place(&self, tree: Stmt, stage: &Stage, producer: &Stmt) -> Result<Stmt, LowerError> {
        let (at, var) = match &stage.schedule.compute {
            ComputeLevel::At { stage: at, var } => (at, var),
            ComputeLevel::Root | ComputeLevel::Inline => {
                return self.realize_around(stage, producer, tree);
            }
        };
        let invalid = |reason: &str| LowerError::InvalidComputeAt {
            stage: stage.name.clone(),
            at: at.clone(),
            var: var.clone(),
            reason: reason.to_string(),
        };

        if at == &stage.name {
            return Err(invalid("a stage cannot be computed inside itself"));
        }
        let consumer = self
            .graph
            .get(at)
            .ok_or_else(|| invalid("no such stage"))?;
        if self.inlined.contains_key(at) {
            return Err(invalid("that stage is inlined"));
        }

        let mut found_loop = false;
        let mut sites = Vec::new();
        for k in 0..consumer.definition_count() {
            let site = loop_name(at, k, var);
            let (exists, loads) = site_loads(&tree, &site, &stage.name);
            found_loop |= exists;
            if loads {
                sites.push(site);
            }
        }
        let site = match sites.as_slice() {
            [] if !found_loop => return Err(invalid("no such loop")),
            [] => return Err(invalid("it is not loaded inside that loop")),
            [site] => site.clone(),
            _ => return Err(invalid("it is loaded by more than one definition")),
        };
        if loads_outside(&tree, &stage.name, &site) {
            return Err(invalid("it is also loaded outside that loop"));
        }

        replace_loop_bodies(tree, &site, &mut |body| self.realize_around(stage, producer, body))
    }

    /// `let <T>.min/extent...; realize T { produce T; body }`, sized to what
    /// `body` loads plus what the updates of T write.
    fn realize_around(&self, stage: &Stage, producer: &Stmt, body: Stmt) -> Result<Stmt, LowerError> {
        let mut region = bounds::boxes_required(&body, &stage.name)?
            .ok_or_else(|| LowerError::Unused(stage.name.clone()))?;
        self.widen_by_updates(stage, &mut region)?;

        let name = &stage.name;
        let ranges = (0..region.len())
            .map(|d| Range {
                min: Expr::var(min_name(name, d)),
                extent: Expr::var(extent_name(name, d)),
            })
            .collect();
        let mut stmt = Stmt::Realize {
            name: name.clone(),
            bounds: ranges,
            body: Box::new(Stmt::block(producer.clone(), body)),
        };
        for (d, interval) in region.into_iter().enumerate().rev() {
            stmt = Stmt::let_stmt(extent_name(name, d), interval.extent(), stmt);
            stmt = Stmt::let_stmt(min_name(name, d), interval.min, stmt);
        }
        Ok(stmt)
    }

    /// Grow `region` to cover every point an update over a reduction domain
    /// stores to.
    fn widen_by_updates(&self, stage: &Stage, region: &mut Region) -> Result<(), LowerError> {
        for def in &stage.updates {
            let Some(rdom) = &def.rdom else { continue };
            let mut scope = Scope::new();
            for rv in &rdom.vars {
                scope.push(rv.name.clone(), Interval::from_range(&rv.min, &rv.extent));
            }
            for (d, arg) in stage.args.iter().enumerate() {
                let Some(lhs) = def.lhs.get(d) else { continue };
                if lhs == &Expr::var(arg.clone()) {
                    continue;
                }
                let written = bounds_of(lhs, &scope, &stage.name)?;
                if let Some(current) = region.get_mut(d) {
                    *current = current.union(&written);
                }
            }
        }
        Ok(())
    }
}

// ── Tree helpers ────────────────────────────────────────────────────────────

fn expr_loads(e: &Expr, buffer: &str) -> bool {
    let mut found = false;
    e.visit(&mut |node| {
        if let Expr::Load { name, .. } = node {
            found |= name == buffer;
        }
    });
    found
}

/// Whether a loop named `site` exists, and whether any such loop loads `buffer`.
fn site_loads(tree: &Stmt, site: &str, buffer: &str) -> (bool, bool) {
    let mut exists = false;
    let mut loads = false;
    tree.visit(&mut |s| {
        if let Stmt::For { var, body, .. } = s {
            if var == site {
                exists = true;
                loads |= body.loads(buffer);
            }
        }
    });
    (exists, loads)
}

/// True if `buffer` is loaded anywhere except inside loops named `site`.
fn loads_outside(stmt: &Stmt, buffer: &str, site: &str) -> bool {
    if let Stmt::For { var, .. } = stmt {
        if var == site {
            return false;
        }
    }
    stmt.exprs().into_iter().any(|e| expr_loads(e, buffer))
        || stmt
            .children()
            .into_iter()
            .any(|c| loads_outside(c, buffer, site))
}

/// Rebuild `stmt`, passing the body of every loop named `site` through `f`.
fn replace_loop_bodies(
    stmt: Stmt,
    site: &str,
    f: &mut dyn FnMut(Stmt) -> Result<Stmt, LowerError>,
) -> Result<Stmt, LowerError> {
    let rebuilt = match stmt {
        Stmt::For {
            var,
            min,
            extent,
            kind,
            body,
        } => {
            let body = if var == site {
                f(*body)?
            } else {
                replace_loop_bodies(*body, site, f)?
            };
            Stmt::for_loop(var, min, extent, kind, body)
        }
        Stmt::Producer { name, body } => Stmt::producer(name, replace_loop_bodies(*body, site, f)?),
        Stmt::LetStmt { name, value, body } => {
            Stmt::let_stmt(name, value, replace_loop_bodies(*body, site, f)?)
        }
        Stmt::Realize { name, bounds, body } => Stmt::Realize {
            name,
            bounds,
            body: Box::new(replace_loop_bodies(*body, site, f)?),
        },
        Stmt::IfThenElse {
            cond,
            then_case,
            else_case,
        } => Stmt::IfThenElse {
            cond,
            then_case: Box::new(replace_loop_bodies(*then_case, site, f)?),
            else_case: match else_case {
                Some(e) => Some(Box::new(replace_loop_bodies(*e, site, f)?)),
                None => None,
            },
        },
        Stmt::Block { first, rest } => Stmt::block(
            replace_loop_bodies(*first, site, f)?,
            replace_loop_bodies(*rest, site, f)?,
        ),
        store @ Stmt::Store { .. } => store,
    };
    Ok(rebuilt)
}
