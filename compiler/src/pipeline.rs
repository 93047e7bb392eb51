// pipeline.rs — Pipeline construction context
//
// A `Pipeline` is one compilation unit: it owns the stage graph, the wrap
// registry, the reduction domains and the id allocator, and is dropped with
// the compilation. Authors declare stages through it, attach definitions,
// request wraps (`wrap` = resolve + rewrite), attach schedules, and finally
// compile or realize an output stage.
//
// Preconditions: none.
// Postconditions: every attached definition has had the wrap ledger replayed
//                 onto it before this module returns.
// Failure modes: `PipelineError` for malformed definitions and wrap requests;
//                lowering and evaluation errors are forwarded.
// Side effects: none outside the pipeline itself.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::config::Options;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::eval::{self, Buffer, EvalError, Inputs};
use crate::expr::Expr;
use crate::id::IdAllocator;
use crate::lower::{self, LowerError, Module};
use crate::rewrite;
use crate::schedule::ScheduleBuilder;
use crate::stage::{rvar_name, Definition, ReductionDomain, Stage, StageGraph, StageKind, StageMeta};
use crate::wrap::{self, WrapError, WrapRegistry};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    #[error("stage '{0}' is already defined")]
    Redefinition(String),
    #[error("stage '{0}' must be defined before adding updates")]
    UpdateBeforeDefinition(String),
    #[error("stage '{stage}' has no update {index}")]
    UnknownUpdate { stage: String, index: usize },
    #[error("stage '{stage}' takes {expected} arguments, got {found}")]
    ArityMismatch {
        stage: String,
        expected: usize,
        found: usize,
    },
    #[error("initialization of '{0}' must use distinct pure variables")]
    ImpureInit(String),
    #[error("free variable '{var}' in definition of '{stage}'")]
    FreeVariable { stage: String, var: String },
    #[error("update of '{0}' uses more than one reduction domain")]
    MultipleReductionDomains(String),
    #[error("unknown reduction domain '{0}'")]
    UnknownReductionDomain(String),
    #[error(transparent)]
    Wrap(#[from] WrapError),
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl PipelineError {
    /// Diagnostic form, with a stable code where one is registered.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let d = Diagnostic::new(DiagLevel::Error, self.to_string());
        match self {
            PipelineError::Wrap(WrapError::UnknownSource(name) | WrapError::UndefinedSource(name)) => {
                d.with_code(codes::E0101).with_stage(name.clone())
            }
            PipelineError::Wrap(WrapError::UnknownReader { reader, .. }) => {
                d.with_code(codes::E0102).with_stage(reader.clone())
            }
            PipelineError::Lower(LowerError::Cycle(path)) => {
                let d = d.with_code(codes::E0201);
                match path.first() {
                    Some(first) => d.with_stage(first.clone()),
                    None => d,
                }
            }
            PipelineError::UnknownStage(name)
            | PipelineError::Redefinition(name)
            | PipelineError::UpdateBeforeDefinition(name)
            | PipelineError::ImpureInit(name)
            | PipelineError::MultipleReductionDomains(name) => d.with_stage(name.clone()),
            _ => d,
        }
    }
}

// ── Handles ─────────────────────────────────────────────────────────────────

/// Handle to a stage, by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Func {
    name: String,
}

impl Func {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call this stage at `args`.
    pub fn at<I, E>(&self, args: I) -> Expr
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::call(self.name.clone(), args.into_iter().map(Into::into).collect())
    }

    /// Call-graph key of the update regions of this stage.
    pub fn update_name(&self, index: usize) -> String {
        format!("{}.update({})", self.name, index)
    }
}

/// Handle to an externally supplied image. Readers call it through its
/// accessor stage, which is also what `wrap` wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageParam {
    name: String,
    dims: usize,
    accessor: String,
}

impl ImageParam {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn at<I, E>(&self, args: I) -> Expr
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::call(
            self.accessor.clone(),
            args.into_iter().map(Into::into).collect(),
        )
    }

    /// The accessor stage, for scheduling it like any other stage.
    pub fn func(&self) -> Func {
        Func {
            name: self.accessor.clone(),
        }
    }
}

/// Scalar parameter bound at realization time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    name: String,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> Expr {
        Expr::param(self.name.clone())
    }
}

/// Handle to a reduction domain registered with the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RDom {
    name: String,
    dims: usize,
}

impl RDom {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn var(&self, index: usize) -> Expr {
        Expr::var(rvar_name(&self.name, index))
    }

    pub fn x(&self) -> Expr {
        self.var(0)
    }

    pub fn y(&self) -> Expr {
        self.var(1)
    }

    pub fn z(&self) -> Expr {
        self.var(2)
    }
}

/// Anything that can be wrapped: a stage, or an image (through its accessor).
pub trait WrapSource {
    fn source_name(&self) -> &str;
}

impl WrapSource for Func {
    fn source_name(&self) -> &str {
        &self.name
    }
}

impl WrapSource for ImageParam {
    fn source_name(&self) -> &str {
        &self.name
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Pipeline {
    graph: StageGraph,
    registry: WrapRegistry,
    ids: IdAllocator,
    rdoms: HashMap<String, ReductionDomain>,
    params: BTreeSet<String>,
    options: Options,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn registry(&self) -> &WrapRegistry {
        &self.registry
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.graph.get(name)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.graph.contains_name(name)
            || self.params.contains(name)
            || self.rdoms.contains_key(name)
    }

    /// `name`, or `name$<n>` for the first free `n` if it is taken.
    fn unique_name(&self, name: &str) -> String {
        if !self.name_taken(name) {
            return name.to_string();
        }
        (1..)
            .map(|n| format!("{}${}", name, n))
            .find(|candidate| !self.name_taken(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    /// Declare a stage with no definition yet.
    pub fn func(&mut self, name: &str) -> Func {
        let name = self.unique_name(name);
        let id = self.ids.alloc_stage();
        self.graph
            .insert(Stage::new(id, name.clone(), StageKind::Declared));
        Func { name }
    }

    /// Declare an image of `dims` dimensions and its accessor stage
    /// `<name>_im(_0, ..) = <name>(_0, ..)`.
    pub fn image_param(&mut self, name: &str, dims: usize) -> ImageParam {
        let name = self.unique_name(name);
        self.graph.declare_image(&name, dims);
        let accessor = self.unique_name(&format!("{}_im", name));

        let args: Vec<String> = (0..dims).map(|i| format!("_{}", i)).collect();
        let vars: Vec<Expr> = args.iter().map(Expr::var).collect();
        let mut stage = Stage::new(
            self.ids.alloc_stage(),
            accessor.clone(),
            StageKind::ImageAccessor {
                image: name.clone(),
            },
        );
        stage.args = args;
        stage.init = Some(Definition {
            lhs: vars.clone(),
            rhs: Expr::call(name.clone(), vars),
            rdom: None,
        });
        self.graph.insert(stage);
        ImageParam {
            name,
            dims,
            accessor,
        }
    }

    pub fn param(&mut self, name: &str) -> Param {
        let name = self.unique_name(name);
        self.params.insert(name.clone());
        Param { name }
    }

    /// Declare a reduction domain from `(min, extent)` pairs.
    pub fn rdom(&mut self, name: &str, bounds: &[(i32, i32)]) -> RDom {
        let name = self.unique_name(name);
        self.rdoms
            .insert(name.clone(), ReductionDomain::new(&name, bounds));
        RDom {
            name,
            dims: bounds.len(),
        }
    }

    /// Restrict `rdom` to points where `cond` holds. Applies to updates
    /// defined after this call.
    pub fn rdom_where(&mut self, rdom: &RDom, cond: Expr) -> Result<(), PipelineError> {
        let domain = self
            .rdoms
            .get_mut(&rdom.name)
            .ok_or_else(|| PipelineError::UnknownReductionDomain(rdom.name.clone()))?;
        domain.add_predicate(cond);
        Ok(())
    }

    fn stage_mut(&mut self, name: &str) -> Result<&mut Stage, PipelineError> {
        self.graph
            .get_mut(name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// Attach the initialization definition `func(args...) = rhs`.
    pub fn define(&mut self, func: &Func, args: &[&str], rhs: Expr) -> Result<(), PipelineError> {
        let stage = self.stage_mut(&func.name)?;
        if stage.is_defined() {
            return Err(PipelineError::Redefinition(func.name.clone()));
        }
        let distinct: BTreeSet<&str> = args.iter().copied().collect();
        if distinct.len() != args.len() {
            return Err(PipelineError::ImpureInit(func.name.clone()));
        }
        let mut free = BTreeSet::new();
        rhs.free_vars(&mut free);
        if let Some(var) = free.iter().find(|v| !distinct.contains(v.as_str())) {
            return Err(PipelineError::FreeVariable {
                stage: func.name.clone(),
                var: var.clone(),
            });
        }

        stage.args = args.iter().map(|a| a.to_string()).collect();
        stage.init = Some(Definition {
            lhs: args.iter().map(|a| Expr::var(*a)).collect(),
            rhs,
            rdom: None,
        });
        rewrite::replay(&mut self.graph, &self.registry, &func.name, 0);
        Ok(())
    }

    /// Attach an update definition `func(lhs...) = rhs`. Returns the update
    /// index. Reduction variables pick the domain the update iterates over.
    pub fn update(&mut self, func: &Func, lhs: Vec<Expr>, rhs: Expr) -> Result<usize, PipelineError> {
        let stage = self
            .graph
            .get(&func.name)
            .ok_or_else(|| PipelineError::UnknownStage(func.name.clone()))?;
        if !stage.is_defined() {
            return Err(PipelineError::UpdateBeforeDefinition(func.name.clone()));
        }
        if lhs.len() != stage.args.len() {
            return Err(PipelineError::ArityMismatch {
                stage: func.name.clone(),
                expected: stage.args.len(),
                found: lhs.len(),
            });
        }

        let mut free = BTreeSet::new();
        for e in lhs.iter().chain(std::iter::once(&rhs)) {
            e.free_vars(&mut free);
        }
        let mut domains = BTreeSet::new();
        for var in &free {
            if let Some(pos) = stage.args.iter().position(|a| a == var) {
                if lhs[pos] != Expr::var(var.clone()) {
                    return Err(PipelineError::FreeVariable {
                        stage: func.name.clone(),
                        var: var.clone(),
                    });
                }
                continue;
            }
            match self.rdoms.values().find(|r| r.contains_var(var)) {
                Some(r) => {
                    domains.insert(r.name.clone());
                }
                None => {
                    return Err(PipelineError::FreeVariable {
                        stage: func.name.clone(),
                        var: var.clone(),
                    })
                }
            }
        }
        if domains.len() > 1 {
            return Err(PipelineError::MultipleReductionDomains(func.name.clone()));
        }
        let rdom = domains
            .into_iter()
            .next()
            .and_then(|name| self.rdoms.get(&name).cloned());

        let stage = self.stage_mut(&func.name)?;
        stage.updates.push(Definition { lhs, rhs, rdom });
        let index = stage.updates.len();
        rewrite::replay(&mut self.graph, &self.registry, &func.name, index);
        Ok(index - 1)
    }

    /// `func(lhs...) += value`.
    pub fn update_add(&mut self, func: &Func, lhs: Vec<Expr>, value: Expr) -> Result<usize, PipelineError> {
        let current = func.at(lhs.clone());
        self.update(func, lhs, current + value)
    }

    /// Route `readers` (or, with no readers, every reader) of `source`
    /// through a wrapper, creating it on first request.
    pub fn wrap<S: WrapSource>(&mut self, source: &S, readers: &[&Func]) -> Result<Func, PipelineError> {
        let readers: Vec<String> = readers.iter().map(|f| f.name.clone()).collect();
        let resolution = wrap::resolve_wrap(
            &mut self.graph,
            &mut self.registry,
            &mut self.ids,
            &self.options.wrapper_suffix,
            source.source_name(),
            &readers,
        )?;
        rewrite::commit(&mut self.graph, &mut self.registry, &resolution);
        debug!(wrapper = %resolution.wrapper, created = resolution.created, "wrap requested");
        Ok(Func {
            name: resolution.wrapper,
        })
    }

    /// Schedule of the initialization of `func` (and its compute level).
    pub fn schedule(&mut self, func: &Func) -> Result<ScheduleBuilder<'_>, PipelineError> {
        let stage = self.stage_mut(&func.name)?;
        Ok(ScheduleBuilder::new(&mut stage.schedule, 0))
    }

    /// Schedule of update `index` of `func`.
    pub fn schedule_update(&mut self, func: &Func, index: usize) -> Result<ScheduleBuilder<'_>, PipelineError> {
        let stage = self.stage_mut(&func.name)?;
        if index >= stage.updates.len() {
            return Err(PipelineError::UnknownUpdate {
                stage: func.name.clone(),
                index,
            });
        }
        Ok(ScheduleBuilder::new(&mut stage.schedule, index + 1))
    }

    /// Metadata of every stage in the pipeline.
    pub fn stage_meta(&self) -> BTreeMap<String, StageMeta> {
        self.graph.meta()
    }

    /// Metadata of the given stages only.
    pub fn stage_meta_for(&self, funcs: &[&Func]) -> BTreeMap<String, StageMeta> {
        let all = self.graph.meta();
        funcs
            .iter()
            .filter_map(|f| all.get(&f.name).map(|m| (f.name.clone(), *m)))
            .collect()
    }

    /// Lower `output` to a statement tree. The whole stage graph must be
    /// free of read cycles, not only the part `output` reaches.
    pub fn compile(&self, output: &Func) -> Result<Module, PipelineError> {
        self.graph.check_acyclic().map_err(LowerError::Cycle)?;
        Ok(lower::lower(&self.graph, &output.name, &self.options)?)
    }

    /// Compile `output` and evaluate it over `[0, extent)` in each dimension.
    pub fn realize(&self, output: &Func, extents: &[i32], inputs: &Inputs) -> Result<Buffer, PipelineError> {
        let module = self.compile(output)?;
        Ok(eval::run(&module, extents, inputs, &self.options)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy() -> Vec<Expr> {
        vec![Expr::var("x"), Expr::var("y")]
    }

    #[test]
    fn names_are_made_unique() {
        let mut p = Pipeline::new();
        let a = p.func("f");
        let b = p.func("f");
        assert_eq!(a.name(), "f");
        assert_eq!(b.name(), "f$1");
        let img = p.image_param("img", 2);
        assert_eq!(img.func().name(), "img_im");
    }

    #[test]
    fn define_rejects_free_variables_and_redefinition() {
        let mut p = Pipeline::new();
        let f = p.func("f");
        let err = p.define(&f, &["x"], Expr::var("y")).unwrap_err();
        assert!(matches!(err, PipelineError::FreeVariable { ref var, .. } if var == "y"));
        p.define(&f, &["x"], Expr::var("x")).unwrap();
        assert!(matches!(
            p.define(&f, &["x"], Expr::int(0)),
            Err(PipelineError::Redefinition(_))
        ));
        let g = p.func("g");
        assert!(matches!(
            p.define(&g, &["x", "x"], Expr::int(0)),
            Err(PipelineError::ImpureInit(_))
        ));
    }

    #[test]
    fn update_picks_reduction_domain() {
        let mut p = Pipeline::new();
        let g = p.func("g");
        p.define(&g, &["x", "y"], Expr::int(0)).unwrap();
        let r = p.rdom("r", &[(0, 10), (0, 10)]);
        p.rdom_where(&r, r.x().lt(r.y())).unwrap();
        let k = p.update_add(&g, vec![r.x(), r.y()], Expr::int(1)).unwrap();
        assert_eq!(k, 0);
        let stage = p.stage("g").unwrap();
        let rdom = stage.updates[0].rdom.as_ref().unwrap();
        assert_eq!(rdom.name, "r");
        assert!(rdom.predicate.is_some());
    }

    #[test]
    fn update_rejects_misplaced_pure_var_and_mixed_domains() {
        let mut p = Pipeline::new();
        let g = p.func("g");
        p.define(&g, &["x", "y"], Expr::int(0)).unwrap();
        let err = p
            .update(&g, vec![Expr::var("y"), Expr::var("x")], Expr::int(1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::FreeVariable { .. }));

        let r = p.rdom("r", &[(0, 4)]);
        let s = p.rdom("s", &[(0, 4)]);
        let err = p.update(&g, vec![r.x(), s.x()], Expr::int(1)).unwrap_err();
        assert!(matches!(err, PipelineError::MultipleReductionDomains(_)));

        assert_eq!(p.update(&g, xy(), Expr::int(1)).unwrap(), 0);
        assert!(matches!(
            p.update(&g, vec![Expr::var("x")], Expr::int(1)),
            Err(PipelineError::ArityMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn wrap_of_image_wraps_accessor() {
        let mut p = Pipeline::new();
        let img = p.image_param("img", 2);
        let f = p.func("f");
        p.define(&f, &["x", "y"], img.at(xy())).unwrap();
        let w = p.wrap(&img, &[&f]).unwrap();
        assert_eq!(w.name(), "img_im.in.0");
        assert_eq!(p.graph().reads("f").into_iter().collect::<Vec<_>>(), vec![w.name().to_string()]);
        assert_eq!(p.wrap(&img, &[&f]).unwrap(), w);
    }

    #[test]
    fn schedule_update_requires_the_update() {
        let mut p = Pipeline::new();
        let g = p.func("g");
        p.define(&g, &["x"], Expr::int(0)).unwrap();
        assert!(matches!(
            p.schedule_update(&g, 0),
            Err(PipelineError::UnknownUpdate { index: 0, .. })
        ));
        assert!(matches!(
            p.schedule(&Func { name: "nope".into() }),
            Err(PipelineError::UnknownStage(_))
        ));
    }

    #[test]
    fn wrapper_suffix_comes_from_options() {
        let mut p = Pipeline::with_options(Options {
            wrapper_suffix: "_wrapper".into(),
            ..Options::default()
        });
        let f = p.func("f");
        p.define(&f, &["x"], Expr::var("x")).unwrap();
        let w = p.wrap(&f, &[]).unwrap();
        assert_eq!(w.name(), "f_wrapper.0");
    }

    #[test]
    fn compile_rejects_a_read_cycle_anywhere_in_the_graph() {
        let mut p = Pipeline::new();
        let a = p.func("a");
        let b = p.func("b");
        let out = p.func("out");
        p.define(&a, &["x"], b.at([Expr::var("x")])).unwrap();
        p.define(&b, &["x"], a.at([Expr::var("x")])).unwrap();
        p.define(&out, &["x"], Expr::var("x")).unwrap();
        let err = p.compile(&out).unwrap_err();
        assert!(
            matches!(err, PipelineError::Lower(LowerError::Cycle(ref path)) if path == &["a", "b", "a"]),
            "{:?}",
            err
        );
        assert_eq!(err.to_diagnostic().code, Some(codes::E0201));
    }

    #[test]
    fn late_update_calls_the_end_of_the_wrap_chain() {
        let mut p = Pipeline::new();
        let img = p.image_param("img", 1);
        let g = p.func("g");
        p.define(&g, &["x"], img.at([Expr::var("x")])).unwrap();
        let w = p.wrap(&img, &[&g]).unwrap();
        let wg = p.wrap(&w, &[]).unwrap();
        p.update(&g, vec![Expr::var("x")], g.at([Expr::var("x")]) + img.at([Expr::var("x")]))
            .unwrap();
        let stage = p.stage("g").unwrap();
        let init: Vec<String> = stage.init.as_ref().unwrap().calls().into_iter().collect();
        let update: Vec<String> = stage.updates[0].calls().into_iter().collect();
        assert_eq!(init, vec![wg.name().to_string()]);
        assert_eq!(update, vec!["g".to_string(), wg.name().to_string()]);
    }

    #[test]
    fn errors_map_to_coded_diagnostics() {
        let mut p = Pipeline::new();
        let f = p.func("f");
        p.define(&f, &["x"], Expr::var("x")).unwrap();
        let ghost = Func {
            name: "ghost".to_string(),
        };
        let err = p.wrap(&f, &[&ghost]).unwrap_err();
        let d = err.to_diagnostic();
        assert_eq!(d.code, Some(codes::E0102));
        assert_eq!(d.stage.as_deref(), Some("ghost"));

        let err = p.wrap(&ghost, &[]).unwrap_err();
        assert_eq!(err.to_diagnostic().code, Some(codes::E0101));
        assert!(err.to_diagnostic().is_error());
    }
}
