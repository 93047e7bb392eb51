// schedule.rs — Per-stage scheduling directives
//
// Records where a stage is computed (inline, root, or inside a consumer's
// loop) and the loop-nest directives of each of its definitions. The wrap core
// treats all of this as opaque configuration; only lowering interprets it, and
// lowering is where unknown dimension names are rejected.
//
// Preconditions: none.
// Postconditions: builder calls append directives in call order.
// Failure modes: none here (see `lower::LowerError::UnknownDim`).
// Side effects: none.

use std::fmt;

use crate::expr::Expr;

// ── Compute level ───────────────────────────────────────────────────────────

/// Where the stage's values are computed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ComputeLevel {
    /// Substituted into every caller (no producer region of its own).
    #[default]
    Inline,
    /// Computed once, outside every loop of the output.
    Root,
    /// Computed inside the loop over `var` of `stage`.
    At { stage: String, var: String },
}

impl fmt::Display for ComputeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeLevel::Inline => write!(f, "inline"),
            ComputeLevel::Root => write!(f, "root"),
            ComputeLevel::At { stage, var } => write!(f, "at({}, {})", stage, var),
        }
    }
}

// ── Loop directives ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Split {
        old: String,
        outer: String,
        inner: String,
        factor: i32,
    },
    Fuse {
        inner: String,
        outer: String,
        fused: String,
    },
    /// Innermost first, as in the schedule source.
    Reorder { dims: Vec<String> },
    Vectorize { var: String },
    Unroll { var: String },
    Parallel { var: String },
}

/// Directives of one definition (initialization or one update).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSchedule {
    pub directives: Vec<Directive>,
}

/// The full schedule of one stage.
#[derive(Debug, Clone, Default)]
pub struct FuncSchedule {
    pub compute: ComputeLevel,
    /// Recorded only; storage is always allocated at the compute site.
    pub store_root: bool,
    /// One `if` per condition around the producer's loop nests.
    pub specializations: Vec<Expr>,
    /// Index 0 is the initialization, index `k + 1` is update `k`.
    pub definitions: Vec<LoopSchedule>,
}

impl FuncSchedule {
    /// Directives of definition `index`, empty if none were given.
    pub fn loops(&self, index: usize) -> &[Directive] {
        self.definitions
            .get(index)
            .map(|l| l.directives.as_slice())
            .unwrap_or(&[])
    }

    fn loops_mut(&mut self, index: usize) -> &mut LoopSchedule {
        if self.definitions.len() <= index {
            self.definitions.resize_with(index + 1, LoopSchedule::default);
        }
        &mut self.definitions[index]
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Chainable view of a stage schedule, targeting one of its definitions.
pub struct ScheduleBuilder<'a> {
    schedule: &'a mut FuncSchedule,
    definition: usize,
}

impl<'a> ScheduleBuilder<'a> {
    pub(crate) fn new(schedule: &'a mut FuncSchedule, definition: usize) -> Self {
        Self {
            schedule,
            definition,
        }
    }

    fn push(&mut self, directive: Directive) -> &mut Self {
        self.schedule
            .loops_mut(self.definition)
            .directives
            .push(directive);
        self
    }

    fn fresh_inner(&self, var: &str, tag: &str) -> String {
        let n = self.schedule.loops(self.definition).len();
        format!("{}.{}{}", var, tag, n)
    }

    pub fn compute_root(&mut self) -> &mut Self {
        self.schedule.compute = ComputeLevel::Root;
        self
    }

    pub fn compute_at(&mut self, stage: &str, var: &str) -> &mut Self {
        self.schedule.compute = ComputeLevel::At {
            stage: stage.to_string(),
            var: var.to_string(),
        };
        self
    }

    pub fn compute_inline(&mut self) -> &mut Self {
        self.schedule.compute = ComputeLevel::Inline;
        self
    }

    pub fn store_root(&mut self) -> &mut Self {
        self.schedule.store_root = true;
        self
    }

    pub fn specialize(&mut self, cond: Expr) -> &mut Self {
        self.schedule.specializations.push(cond);
        self
    }

    pub fn split(&mut self, old: &str, outer: &str, inner: &str, factor: i32) -> &mut Self {
        self.push(Directive::Split {
            old: old.to_string(),
            outer: outer.to_string(),
            inner: inner.to_string(),
            factor,
        })
    }

    pub fn fuse(&mut self, inner: &str, outer: &str, fused: &str) -> &mut Self {
        self.push(Directive::Fuse {
            inner: inner.to_string(),
            outer: outer.to_string(),
            fused: fused.to_string(),
        })
    }

    pub fn reorder(&mut self, dims: &[&str]) -> &mut Self {
        self.push(Directive::Reorder {
            dims: dims.iter().map(|d| d.to_string()).collect(),
        })
    }

    /// Split `x` and `y` by the tile sizes and move both inner dims innermost.
    #[allow(clippy::too_many_arguments)]
    pub fn tile(
        &mut self,
        x: &str,
        y: &str,
        xi: &str,
        yi: &str,
        x_factor: i32,
        y_factor: i32,
    ) -> &mut Self {
        self.split(x, x, xi, x_factor)
            .split(y, y, yi, y_factor)
            .reorder(&[xi, yi, x, y])
    }

    pub fn vectorize(&mut self, var: &str) -> &mut Self {
        self.push(Directive::Vectorize {
            var: var.to_string(),
        })
    }

    pub fn vectorize_by(&mut self, var: &str, factor: i32) -> &mut Self {
        let inner = self.fresh_inner(var, "v");
        self.split(var, var, &inner, factor).vectorize(&inner)
    }

    pub fn unroll(&mut self, var: &str) -> &mut Self {
        self.push(Directive::Unroll {
            var: var.to_string(),
        })
    }

    pub fn unroll_by(&mut self, var: &str, factor: i32) -> &mut Self {
        let inner = self.fresh_inner(var, "u");
        self.split(var, var, &inner, factor).unroll(&inner)
    }

    pub fn parallel(&mut self, var: &str) -> &mut Self {
        self.push(Directive::Parallel {
            var: var.to_string(),
        })
    }
}
