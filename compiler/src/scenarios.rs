// scenarios.rs — Bundled wrap pipelines with their expected call graphs
//
// Each scenario builds a pipeline that exercises one wrap pattern (per-reader,
// shared, global, wrap-on-wrap, wraps reached from updates and reduction
// predicates), then names the outputs to check: the call graph the lowered
// tree must have and the value every output point must hold.
//
// Preconditions: none.
// Postconditions: `run` compiles, extracts, compares and realizes every check
//                 of a scenario, stopping at the first failure.
// Failure modes: `ScenarioError` for build errors, wrapper-name mismatches,
//                call-graph mismatches, extraction errors and wrong values.
// Side effects: none.

use tracing::{debug, info};

use crate::callgraph::{extract_call_graph, CallGraph};
use crate::compare::{compare, CallGraphMismatch};
use crate::config::Options;
use crate::diag::Diagnostic;
use crate::eval::{Buffer, Inputs};
use crate::expr::Expr;
use crate::lower::Module;
use crate::pipeline::{Func, ImageParam, Param, Pipeline, PipelineError};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("unknown scenario '{0}'")]
    Unknown(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("expected wrapper '{expected}', got '{found}'")]
    WrapperChanged { expected: String, found: String },
    #[error("{output}: {source}")]
    CallGraph {
        output: String,
        #[source]
        source: CallGraphMismatch,
    },
    #[error("{output}: call-graph extraction failed: {}", first_error(.diagnostics))]
    Extraction {
        output: String,
        diagnostics: Vec<Diagnostic>,
    },
    #[error("{output}({}) = {actual} instead of {expected}", join_coords(.coords))]
    Value {
        output: String,
        coords: Vec<i32>,
        actual: i32,
        expected: i32,
    },
}

fn first_error(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .find(|d| d.is_error())
        .map(|d| d.to_string())
        .unwrap_or_default()
}

fn join_coords(coords: &[i32]) -> String {
    coords
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Scenario model ──────────────────────────────────────────────────────────

/// An image input and the function filling it.
pub struct ImageInput {
    pub image: ImageParam,
    pub fill: fn(&[i32]) -> i32,
}

/// One output to compile and realize.
pub struct Check {
    pub output: Func,
    pub expected: CallGraph,
    /// Expected value at one output coordinate.
    pub value: fn(&[i32]) -> i32,
    pub params: Vec<(Param, i32)>,
}

/// A built scenario pipeline.
pub struct Built {
    pub pipeline: Pipeline,
    pub images: Vec<ImageInput>,
    pub checks: Vec<Check>,
}

/// Everything one check produced.
pub struct CheckOutcome {
    pub output: String,
    pub module: Module,
    pub graph: CallGraph,
    pub diagnostics: Vec<Diagnostic>,
    pub buffer: Buffer,
}

pub struct Scenario {
    pub name: &'static str,
    pub summary: &'static str,
    /// Output extents the scenario was written for.
    pub extents: [i32; 2],
    build: fn(&Options) -> Result<Built, ScenarioError>,
}

impl Scenario {
    pub fn build(&self, options: &Options) -> Result<Built, ScenarioError> {
        (self.build)(options)
    }
}

impl Built {
    /// Inputs for `check` with images sized to the first `dims` of `extents`.
    pub fn inputs(&self, check: &Check, extents: &[i32]) -> Inputs {
        let mut inputs = Inputs::new();
        for input in &self.images {
            let dims = input.image.dims().min(extents.len());
            inputs.bind(&input.image, Buffer::from_fn(&extents[..dims], input.fill));
        }
        for (param, value) in &check.params {
            inputs.set(param, *value);
        }
        inputs
    }

    /// Compile `check.output` and extract its call graph.
    pub fn extract(&self, check: &Check) -> Result<(Module, CallGraph, Vec<Diagnostic>), ScenarioError> {
        let module = self.pipeline.compile(&check.output)?;
        let result = extract_call_graph(&module.body, &self.pipeline.stage_meta());
        if result.has_errors() {
            return Err(ScenarioError::Extraction {
                output: check.output.name().to_string(),
                diagnostics: result.diagnostics,
            });
        }
        Ok((module, result.graph, result.diagnostics))
    }

    /// Compare the call graph, realize over `extents` and compare values.
    pub fn run_check(&self, check: &Check, extents: &[i32]) -> Result<CheckOutcome, ScenarioError> {
        let output = check.output.name().to_string();
        let (module, graph, diagnostics) = self.extract(check)?;
        compare(&graph, &check.expected).map_err(|source| ScenarioError::CallGraph {
            output: output.clone(),
            source,
        })?;

        let inputs = self.inputs(check, extents);
        let buffer = self.pipeline.realize(&check.output, extents, &inputs)?;
        if let Some((coords, actual, expected)) = buffer.first_mismatch(check.value) {
            return Err(ScenarioError::Value {
                output,
                coords,
                actual,
                expected,
            });
        }
        debug!(output = %output, fingerprint = %module.body.fingerprint(), "check passed");
        Ok(CheckOutcome {
            output,
            module,
            graph,
            diagnostics,
            buffer,
        })
    }
}

/// Build `scenario` and run every check over `extents`.
pub fn run(scenario: &Scenario, options: &Options, extents: &[i32]) -> Result<Vec<CheckOutcome>, ScenarioError> {
    let built = scenario.build(options)?;
    let mut outcomes = Vec::new();
    for check in &built.checks {
        outcomes.push(built.run_check(check, extents)?);
    }
    info!(scenario = scenario.name, checks = outcomes.len(), "scenario passed");
    Ok(outcomes)
}

pub fn all() -> &'static [Scenario] {
    SCENARIOS
}

pub fn find(name: &str) -> Result<&'static Scenario, ScenarioError> {
    SCENARIOS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ScenarioError::Unknown(name.to_string()))
}

static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "calling_wrap_no_op",
        summary: "repeated and reordered wrap requests return the same wrapper",
        extents: [0, 0],
        build: calling_wrap_no_op,
    },
    Scenario {
        name: "func_wrap",
        summary: "per-reader wrapper of an image",
        extents: [200, 200],
        build: func_wrap,
    },
    Scenario {
        name: "multiple_funcs_sharing_wrapper",
        summary: "one wrapper shared by three readers",
        extents: [200, 200],
        build: multiple_funcs_sharing_wrapper,
    },
    Scenario {
        name: "global_wrap",
        summary: "global wrapper computed inside a tiled, fused consumer",
        extents: [200, 200],
        build: global_wrap,
    },
    Scenario {
        name: "update_defined_after_wrap",
        summary: "an update attached after the wrap still reads the wrapper",
        extents: [200, 200],
        build: update_defined_after_wrap,
    },
    Scenario {
        name: "rdom_wrapper",
        summary: "global wrapper of a stage with updates",
        extents: [200, 200],
        build: rdom_wrapper,
    },
    Scenario {
        name: "global_and_custom_wrap",
        summary: "a custom wrapper takes precedence over the global one",
        extents: [200, 200],
        build: global_and_custom_wrap,
    },
    Scenario {
        name: "wrapper_depend_on_mutated_func",
        summary: "wrappers chained through stages computed at each other",
        extents: [200, 200],
        build: wrapper_depend_on_mutated_func,
    },
    Scenario {
        name: "wrapper_on_wrapper",
        summary: "wrapping a wrapper forms a chain",
        extents: [200, 200],
        build: wrapper_on_wrapper,
    },
    Scenario {
        name: "wrapper_on_rdom_predicate",
        summary: "wrappers reached from a reduction predicate",
        extents: [200, 200],
        build: wrapper_on_rdom_predicate,
    },
    Scenario {
        name: "two_fold_wrapper",
        summary: "two wrappers of a transposed read, both inside the tile loop",
        extents: [1024, 1024],
        build: two_fold_wrapper,
    },
    Scenario {
        name: "multi_folds_wrapper",
        summary: "four chained wrappers across two outputs",
        extents: [1024, 1024],
        build: multi_folds_wrapper,
    },
];

// ── Helpers ─────────────────────────────────────────────────────────────────

fn x() -> Expr {
    Expr::var("x")
}

fn y() -> Expr {
    Expr::var("y")
}

fn xy() -> Vec<Expr> {
    vec![x(), y()]
}

fn yx() -> Vec<Expr> {
    vec![y(), x()]
}

fn expect(entries: &[(&str, &[&str])]) -> CallGraph {
    entries
        .iter()
        .map(|(caller, callees)| (*caller, callees.iter().copied()))
        .collect()
}

fn check(output: &Func, expected: CallGraph, value: fn(&[i32]) -> i32) -> Check {
    Check {
        output: output.clone(),
        expected,
        value,
        params: Vec::new(),
    }
}

fn same_wrapper(expected: &Func, found: &Func) -> Result<(), ScenarioError> {
    if expected == found {
        Ok(())
    } else {
        Err(ScenarioError::WrapperChanged {
            expected: expected.name().to_string(),
            found: found.name().to_string(),
        })
    }
}

/// First two coordinates; missing ones read as 0.
fn planar(c: &[i32]) -> (i32, i32) {
    match *c {
        [] => (0, 0),
        [x] => (x, 0),
        [x, y, ..] => (x, y),
    }
}

fn x_plus_y(c: &[i32]) -> i32 {
    let (x, y) = planar(c);
    x + y
}

fn two_x_plus_three_y(c: &[i32]) -> i32 {
    let (x, y) = planar(c);
    2 * x + 3 * y
}

// ── Scenarios ───────────────────────────────────────────────────────────────

fn calling_wrap_no_op(options: &Options) -> Result<Built, ScenarioError> {
    {
        let mut p = Pipeline::with_options(options.clone());
        let img = p.image_param("img", 2);
        let f = p.func("f");
        p.define(&f, &["x", "y"], img.at(xy()))?;
        let wrapper = p.wrap(&img, &[&f])?;
        for _ in 0..5 {
            same_wrapper(&wrapper, &p.wrap(&img, &[&f])?)?;
        }
    }
    {
        let mut p = Pipeline::with_options(options.clone());
        let img = p.image_param("img", 2);
        let f = p.func("f");
        p.define(&f, &["x", "y"], img.at(xy()))?;
        let first = p.wrap(&img, &[])?;
        same_wrapper(&first, &p.wrap(&img, &[])?)?;
    }

    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let funcs: Vec<Func> = ["e", "f", "g", "h"].iter().map(|n| p.func(n)).collect();
    for f in &funcs {
        p.define(f, &["x", "y"], img.at(xy()))?;
    }
    let (e, f, g) = (&funcs[0], &funcs[1], &funcs[2]);
    let first = p.wrap(&img, &[e, f, g])?;
    same_wrapper(&first, &p.wrap(&img, &[g, f, e])?)?;

    Ok(Built {
        pipeline: p,
        images: Vec::new(),
        checks: Vec::new(),
    })
}

fn func_wrap(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 1);
    let g = p.func("g");
    p.define(&g, &["x", "y"], img.at([x()]))?;

    let wrapper = p.wrap(&img, &[&g])?;
    p.schedule(&wrapper)?.compute_root();
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();

    let expected = expect(&[
        (g.name(), &[wrapper.name()]),
        (wrapper.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: |c| planar(c).0,
        }],
        checks: vec![check(&g, expected, |c| planar(c).0)],
        pipeline: p,
    })
}

fn multiple_funcs_sharing_wrapper(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 1);
    let readers: Vec<Func> = ["g1", "g2", "g3"].iter().map(|n| p.func(n)).collect();
    for g in &readers {
        p.define(g, &["x", "y"], img.at([x()]))?;
    }

    let refs: Vec<&Func> = readers.iter().collect();
    let wrapper = p.wrap(&img, &refs)?;
    p.schedule(&wrapper)?.compute_root();
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();

    let checks = readers
        .iter()
        .map(|g| {
            let expected = expect(&[
                (g.name(), &[wrapper.name()]),
                (wrapper.name(), &[img_f.name()]),
                (img_f.name(), &[img.name()]),
            ]);
            check(g, expected, |c| planar(c).0)
        })
        .collect();
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: |c| planar(c).0,
        }],
        checks,
        pipeline: p,
    })
}

fn global_wrap(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let g = p.func("g");
    let h = p.func("h");
    p.define(&g, &["x", "y"], img.at(xy()))?;
    p.define(&h, &["x", "y"], g.at(xy()) + img.at(xy()))?;

    let wrapper = p.wrap(&img, &[])?;
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();
    p.schedule(&h)?
        .compute_root()
        .tile("x", "y", "xi", "yi", 16, 16)
        .fuse("x", "y", "t")
        .parallel("t");
    p.schedule(&g)?.compute_at(h.name(), "yi");
    p.schedule(&wrapper)?
        .compute_at(h.name(), "yi")
        .tile("_0", "_1", "xi", "yi", 8, 8)
        .fuse("xi", "yi", "t")
        .vectorize_by("t", 4);

    let expected = expect(&[
        (h.name(), &[g.name(), wrapper.name()]),
        (g.name(), &[wrapper.name()]),
        (wrapper.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: x_plus_y,
        }],
        checks: vec![check(&h, expected, |c| 2 * x_plus_y(c))],
        pipeline: p,
    })
}

fn in_triangle(x: i32, y: i32) -> bool {
    (0..=99).contains(&x) && (0..=99).contains(&y) && x < y
}

fn update_defined_after_wrap(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let g = p.func("g");
    p.define(&g, &["x", "y"], img.at(xy()))?;

    let wrapper = p.wrap(&img, &[&g])?;

    // Attached after the wrap: must read the wrapper too.
    let r = p.rdom("r", &[(0, 100), (0, 100)]);
    p.rdom_where(&r, r.x().lt(r.y()))?;
    p.update_add(&g, vec![r.x(), r.y()], 2 * img.at([r.x(), r.y()]))?;

    let param = p.param("p");
    p.schedule(&g)?
        .specialize(param.expr())
        .vectorize_by("x", 8)
        .unroll_by("x", 2)
        .split("x", "x", "xi", 4)
        .parallel("x");
    p.schedule_update(&g, 0)?
        .split("r.x", "rxo", "rxi", 2)
        .unroll("rxi");
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();
    p.schedule(&wrapper)?
        .compute_root()
        .vectorize_by("_0", 8)
        .unroll_by("_0", 2)
        .split("_0", "_0", "xi", 4)
        .parallel("_0");

    let update = g.update_name(0);
    let expected = expect(&[
        (g.name(), &[wrapper.name()]),
        (update.as_str(), &[wrapper.name(), g.name()]),
        (wrapper.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    let value: fn(&[i32]) -> i32 = |c| {
        let (x, y) = planar(c);
        if in_triangle(x, y) {
            3 * (x + y)
        } else {
            x + y
        }
    };
    let checks = [1, 0]
        .into_iter()
        .map(|on| Check {
            params: vec![(param.clone(), on)],
            ..check(&g, expected.clone(), value)
        })
        .collect();
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: x_plus_y,
        }],
        checks,
        pipeline: p,
    })
}

fn rdom_wrapper(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let g = p.func("g");
    p.define(&g, &["x", "y"], Expr::int(10))?;
    p.update_add(&g, xy(), 2 * img.at([x(), x()]))?;
    p.update_add(&g, xy(), 3 * img.at([y(), y()]))?;

    // A global wrapper lets the initialization and both updates share one
    // compute site inside it.
    let wrapper = p.wrap(&g, &[])?;
    p.schedule(&wrapper)?.compute_root();
    p.schedule(&g)?.compute_at(wrapper.name(), "x");
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();

    let update = g.update_name(0);
    let expected = expect(&[
        (g.name(), &[]),
        (update.as_str(), &[img_f.name(), g.name()]),
        (wrapper.name(), &[g.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: x_plus_y,
        }],
        checks: vec![check(&wrapper, expected, |c| 2 * two_x_plus_three_y(c) + 10)],
        pipeline: p,
    })
}

fn global_and_custom_wrap(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 1);
    let g = p.func("g");
    let result = p.func("result");
    p.define(&g, &["x", "y"], img.at([x()]))?;
    p.define(&result, &["x", "y"], img.at([x()]) + g.at(xy()))?;

    let img_in_g = p.wrap(&img, &[&g])?;
    p.schedule(&img_in_g)?.compute_at(g.name(), "x");
    let img_wrapper = p.wrap(&img, &[])?;
    p.schedule(&img_wrapper)?.compute_at(result.name(), "y");
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();
    p.schedule(&g)?.compute_at(result.name(), "y");

    let expected = expect(&[
        (result.name(), &[g.name(), img_wrapper.name()]),
        (g.name(), &[img_in_g.name()]),
        (img_wrapper.name(), &[img_f.name()]),
        (img_in_g.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: |c| planar(c).0,
        }],
        checks: vec![check(&result, expected, |c| 2 * planar(c).0)],
        pipeline: p,
    })
}

fn wrapper_depend_on_mutated_func(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let f = p.func("f");
    let g = p.func("g");
    let h = p.func("h");
    p.define(&f, &["x", "y"], img.at(xy()))?;
    p.define(&g, &["x", "y"], f.at(xy()))?;
    p.define(&h, &["x", "y"], g.at(xy()))?;

    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();
    p.schedule(&f)?.compute_at(g.name(), "y").vectorize_by("x", 8);
    p.schedule(&g)?.compute_root();
    let img_in_f = p.wrap(&img, &[&f])?;
    let g_in_h = p.wrap(&g, &[&h])?;
    p.schedule(&g_in_h)?
        .compute_at(h.name(), "y")
        .vectorize_by("x", 8);
    p.schedule(&img_in_f)?
        .compute_at(f.name(), "y")
        .split("_0", "xo", "xi", 8);

    let expected = expect(&[
        (h.name(), &[g_in_h.name()]),
        (g_in_h.name(), &[g.name()]),
        (g.name(), &[f.name()]),
        (f.name(), &[img_in_f.name()]),
        (img_in_f.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: x_plus_y,
        }],
        checks: vec![check(&h, expected, x_plus_y)],
        pipeline: p,
    })
}

fn wrapper_on_wrapper(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let g = p.func("g");
    let h = p.func("h");
    p.define(&g, &["x", "y"], img.at(xy()) + img.at(xy()))?;
    let img_in_g = p.wrap(&img, &[&g])?;
    p.schedule(&img_in_g)?.compute_root();
    let img_in_img_in_g = p.wrap(&img, &[&img_in_g])?;
    p.schedule(&img_in_img_in_g)?.compute_root();
    p.define(
        &h,
        &["x", "y"],
        g.at(xy()) + img.at(xy()) + img_in_img_in_g.at(xy()),
    )?;

    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();
    p.schedule(&g)?.compute_root();
    let img_in_h = p.wrap(&img, &[&h])?;
    p.schedule(&img_in_h)?.compute_root();
    let g_in_h = p.wrap(&g, &[&h])?;
    p.schedule(&g_in_h)?.compute_root();

    let expected = expect(&[
        (
            h.name(),
            &[img_in_h.name(), g_in_h.name(), img_in_img_in_g.name()],
        ),
        (img_in_h.name(), &[img_f.name()]),
        (g_in_h.name(), &[g.name()]),
        (g.name(), &[img_in_g.name()]),
        (img_in_g.name(), &[img_in_img_in_g.name()]),
        (img_in_img_in_g.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: x_plus_y,
        }],
        checks: vec![check(&h, expected, |c| 4 * x_plus_y(c))],
        pipeline: p,
    })
}

fn wrapper_on_rdom_predicate(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let g = p.func("g");
    let h = p.func("h");
    p.define(&g, &["x", "y"], Expr::int(10))?;
    p.define(&h, &["x", "y"], Expr::int(5))?;

    let r = p.rdom("r", &[(0, 100), (0, 100)]);
    let rxy = vec![r.x(), r.y()];
    p.rdom_where(&r, (img.at(rxy.clone()) + h.at(rxy.clone())).lt(50))?;
    p.update_add(&g, rxy.clone(), h.at(rxy))?;

    let h_wrapper = p.wrap(&h, &[])?;
    p.schedule(&h_wrapper)?
        .store_root()
        .compute_at(g.name(), "r.y");
    let img_in_g = p.wrap(&img, &[&g])?;
    p.schedule(&img_in_g)?.compute_at(g.name(), "r.x");
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();
    p.schedule(&h)?.compute_root();

    let update = g.update_name(0);
    let expected = expect(&[
        (g.name(), &[]),
        (update.as_str(), &[g.name(), img_in_g.name(), h_wrapper.name()]),
        (img_in_g.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
        (h_wrapper.name(), &[h.name()]),
        (h.name(), &[]),
    ]);
    let value: fn(&[i32]) -> i32 = |c| {
        let (x, y) = planar(c);
        if (0..=99).contains(&x) && (0..=99).contains(&y) && x + y + 5 < 50 {
            15
        } else {
            10
        }
    };
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: x_plus_y,
        }],
        checks: vec![check(&g, expected, value)],
        pipeline: p,
    })
}

fn two_fold_wrapper(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();

    let output = p.func("output");
    p.define(&output, &["x", "y"], img.at(yx()))?;
    p.schedule(&output)?.tile("x", "y", "xi", "yi", 8, 8);

    let img_in_output = p.wrap(&img, &[&output])?;
    p.schedule(&img_in_output)?
        .compute_at(output.name(), "x")
        .vectorize("_0")
        .unroll("_1");
    let img_in_output_in_output = p.wrap(&img_in_output, &[&output])?;
    p.schedule(&img_in_output_in_output)?
        .compute_at(output.name(), "x")
        .unroll("_0")
        .unroll("_1");

    let expected = expect(&[
        (output.name(), &[img_in_output_in_output.name()]),
        (img_in_output_in_output.name(), &[img_in_output.name()]),
        (img_in_output.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: two_x_plus_three_y,
        }],
        checks: vec![check(&output, expected, |c| 3 * planar(c).0 + 2 * planar(c).1)],
        pipeline: p,
    })
}

fn multi_folds_wrapper(options: &Options) -> Result<Built, ScenarioError> {
    let mut p = Pipeline::with_options(options.clone());
    let img = p.image_param("img", 2);
    let img_f = img.func();
    p.schedule(&img_f)?.compute_root();

    let g = p.func("g");
    p.define(&g, &["x", "y"], img.at(yx()))?;
    p.schedule(&g)?.compute_root().tile("x", "y", "xi", "yi", 8, 8);

    let img_in_g = p.wrap(&img, &[&g])?;
    p.schedule(&img_in_g)?
        .compute_root()
        .tile("_0", "_1", "xi", "yi", 8, 8)
        .vectorize("xi")
        .unroll("yi");
    let img_in_g_in_g = p.wrap(&img_in_g, &[&g])?;
    p.schedule(&img_in_g_in_g)?
        .compute_root()
        .tile("_0", "_1", "xi", "yi", 8, 8)
        .unroll("xi")
        .unroll("yi");

    let h = p.func("h");
    p.define(&h, &["x", "y"], img_in_g_in_g.at(yx()))?;
    let in_h = p.wrap(&img_in_g_in_g, &[&h])?;
    p.schedule(&in_h)?
        .compute_at(h.name(), "x")
        .vectorize("_0")
        .unroll("_1");
    let in_h_in_h = p.wrap(&in_h, &[&h])?;
    p.schedule(&in_h_in_h)?
        .compute_at(h.name(), "x")
        .unroll("_0")
        .unroll("_1");
    p.schedule(&h)?.compute_root().tile("x", "y", "xi", "yi", 8, 8);

    let g_expected = expect(&[
        (g.name(), &[img_in_g_in_g.name()]),
        (img_in_g_in_g.name(), &[img_in_g.name()]),
        (img_in_g.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    let h_expected = expect(&[
        (h.name(), &[in_h_in_h.name()]),
        (in_h_in_h.name(), &[in_h.name()]),
        (in_h.name(), &[img_in_g_in_g.name()]),
        (img_in_g_in_g.name(), &[img_in_g.name()]),
        (img_in_g.name(), &[img_f.name()]),
        (img_f.name(), &[img.name()]),
    ]);
    Ok(Built {
        images: vec![ImageInput {
            image: img,
            fill: two_x_plus_three_y,
        }],
        checks: vec![
            check(&g, g_expected, |c| 3 * planar(c).0 + 2 * planar(c).1),
            check(&h, h_expected, |c| 3 * planar(c).0 + 2 * planar(c).1),
        ],
        pipeline: p,
    })
}
