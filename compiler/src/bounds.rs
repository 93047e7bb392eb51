// bounds.rs — Symbolic interval analysis over statement subtrees
//
// Computes the box of a buffer that a subtree loads, as expressions over the
// names that are free in the subtree (loop variables and lets of enclosing
// statements stay symbolic and are bound at run time).
//
// Preconditions: loads inside index expressions do not occur.
// Postconditions: the returned box contains every index loaded in the subtree.
// Failure modes: `BoundsError` when an index depends on loaded data or on a
//                division by a non-constant.
// Side effects: none.

use crate::expr::{BinOp, Expr};
use crate::ir::Stmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundsError {
    #[error("index of '{buffer}' depends on a load of '{loaded}'")]
    DataDependent { buffer: String, loaded: String },
    #[error("cannot bound division by non-constant '{0}'")]
    NonConstantDivisor(String),
}

/// Closed interval `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub min: Expr,
    pub max: Expr,
}

impl Interval {
    pub fn new(min: Expr, max: Expr) -> Self {
        Self { min, max }
    }

    pub fn point(e: Expr) -> Self {
        Self {
            min: e.clone(),
            max: e,
        }
    }

    /// Interval of a loop `[min, min + extent)`.
    pub fn from_range(min: &Expr, extent: &Expr) -> Self {
        Self::new(min.clone(), min.clone() + extent.clone() - 1)
    }

    pub fn union(&self, other: &Interval) -> Interval {
        Interval::new(
            union_bound(BinOp::Min, &self.min, &other.min),
            union_bound(BinOp::Max, &self.max, &other.max),
        )
    }

    /// `max - min + 1`; exactly `1` for a point.
    pub fn extent(&self) -> Expr {
        (self.max.clone() - self.min.clone() + 1).simplify()
    }

    fn as_constant(&self) -> Option<i32> {
        match (self.min.as_int(), self.max.as_int()) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        }
    }

    fn is_point(&self) -> bool {
        self.min == self.max
    }
}

fn union_bound(op: BinOp, a: &Expr, b: &Expr) -> Expr {
    if a == b {
        a.clone()
    } else {
        Expr::binary(op, a.clone(), b.clone())
    }
}

/// One interval per dimension.
pub type Region = Vec<Interval>;

pub fn union_regions(a: &Region, b: &Region) -> Region {
    a.iter().zip(b.iter()).map(|(x, y)| x.union(y)).collect()
}

// ── Scope ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Binding {
    /// Loop variable, or a let narrowed by a guard.
    Range(Interval),
    /// Let-bound name, already expanded over the enclosing bindings.
    Let(Expr),
}

/// Names bound inside the analyzed subtree, innermost last.
///
/// Lets are kept as expressions and substituted before interval arithmetic,
/// so a min and a max derived from the same loop variable still cancel.
#[derive(Debug, Default)]
pub struct Scope {
    bindings: Vec<(String, Binding)>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, interval: Interval) {
        self.bindings.push((name.into(), Binding::Range(interval)));
    }

    pub fn push_let(&mut self, name: impl Into<String>, value: &Expr) {
        let value = self.expand(value);
        self.bindings.push((name.into(), Binding::Let(value)));
    }

    pub fn pop(&mut self) {
        self.bindings.pop();
    }

    /// Range bound to `name`, if it is a loop variable or a narrowed let.
    pub fn get(&self, name: &str) -> Option<&Interval> {
        match self.lookup(name)? {
            Binding::Range(interval) => Some(interval),
            Binding::Let(_) => None,
        }
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    /// `e` with every let-bound name replaced by its value, simplified.
    fn expand(&self, e: &Expr) -> Expr {
        e.rewrite(&mut |node| {
            if let Expr::Var(name) = &node {
                if let Some(Binding::Let(value)) = self.lookup(name) {
                    return value.clone();
                }
            }
            node
        })
        .simplify()
    }

    fn replace(&mut self, name: &str, binding: Binding) -> Option<Binding> {
        let slot = self.bindings.iter_mut().rev().find(|(n, _)| n == name)?;
        Some(std::mem::replace(&mut slot.1, binding))
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

/// Interval of `e` given the bindings in `scope`. `buffer` names the buffer
/// whose index is being bounded, for error reporting.
pub fn bounds_of(e: &Expr, scope: &Scope, buffer: &str) -> Result<Interval, BoundsError> {
    let interval = interval_of(&scope.expand(e), scope, buffer)?;
    Ok(Interval::new(interval.min.simplify(), interval.max.simplify()))
}

fn interval_of(e: &Expr, scope: &Scope, buffer: &str) -> Result<Interval, BoundsError> {
    match e {
        Expr::Int(_) | Expr::Param(_) => Ok(Interval::point(e.clone())),
        Expr::Var(name) => Ok(scope
            .get(name)
            .cloned()
            .unwrap_or_else(|| Interval::point(e.clone()))),
        Expr::Call { name, .. } | Expr::Load { name, .. } => Err(BoundsError::DataDependent {
            buffer: buffer.to_string(),
            loaded: name.clone(),
        }),
        Expr::Not(_) => Ok(boolean()),
        Expr::Select {
            then_value,
            else_value,
            ..
        } => {
            let t = interval_of(then_value, scope, buffer)?;
            let f = interval_of(else_value, scope, buffer)?;
            Ok(t.union(&f))
        }
        Expr::Binary { op, a, b } => {
            let a_int = interval_of(a, scope, buffer)?;
            let b_int = interval_of(b, scope, buffer)?;
            binary_bounds(*op, &a_int, &b_int, b)
        }
    }
}

fn boolean() -> Interval {
    Interval::new(Expr::int(0), Expr::int(1))
}

fn binary_bounds(op: BinOp, a: &Interval, b: &Interval, b_expr: &Expr) -> Result<Interval, BoundsError> {
    // Exact when both sides are single values.
    if a.is_point() && b.is_point() {
        return Ok(Interval::point(Expr::binary(op, a.min.clone(), b.min.clone())));
    }
    let interval = match op {
        BinOp::Add => Interval::new(a.min.clone() + b.min.clone(), a.max.clone() + b.max.clone()),
        BinOp::Sub => Interval::new(a.min.clone() - b.max.clone(), a.max.clone() - b.min.clone()),
        BinOp::Mul => mul_bounds(a, b),
        BinOp::Div => match b.as_constant() {
            Some(c) if c > 0 => Interval::new(a.min.clone() / c, a.max.clone() / c),
            Some(c) if c < 0 => Interval::new(a.max.clone() / c, a.min.clone() / c),
            Some(_) => return Err(BoundsError::NonConstantDivisor(b_expr.to_string())),
            // Floor division by one fixed value is monotonic in the
            // dividend, whatever the divisor's sign.
            None if b.is_point() => {
                let lo = a.min.clone() / b.min.clone();
                let hi = a.max.clone() / b.min.clone();
                if lo == hi {
                    Interval::point(lo)
                } else {
                    Interval::new(Expr::min(lo.clone(), hi.clone()), Expr::max(lo, hi))
                }
            }
            None => return Err(BoundsError::NonConstantDivisor(b_expr.to_string())),
        },
        BinOp::Mod => match b.as_constant() {
            Some(c) if c > 0 => Interval::new(Expr::int(0), Expr::int(c - 1)),
            _ => Interval::new(Expr::int(0), b.max.clone() - 1),
        },
        BinOp::Min => Interval::new(
            union_bound(BinOp::Min, &a.min, &b.min),
            union_bound(BinOp::Min, &a.max, &b.max),
        ),
        BinOp::Max => Interval::new(
            union_bound(BinOp::Max, &a.min, &b.min),
            union_bound(BinOp::Max, &a.max, &b.max),
        ),
        BinOp::Eq
        | BinOp::Ne
        | BinOp::Lt
        | BinOp::Le
        | BinOp::Gt
        | BinOp::Ge
        | BinOp::And
        | BinOp::Or => boolean(),
    };
    Ok(interval)
}

fn mul_bounds(a: &Interval, b: &Interval) -> Interval {
    let scale = |i: &Interval, c: i32| {
        if c >= 0 {
            Interval::new(i.min.clone() * c, i.max.clone() * c)
        } else {
            Interval::new(i.max.clone() * c, i.min.clone() * c)
        }
    };
    if let Some(c) = b.as_constant() {
        return scale(a, c);
    }
    if let Some(c) = a.as_constant() {
        return scale(b, c);
    }
    if a.is_point() && b.is_point() {
        return Interval::point(a.min.clone() * b.min.clone());
    }
    let products = [
        a.min.clone() * b.min.clone(),
        a.min.clone() * b.max.clone(),
        a.max.clone() * b.min.clone(),
        a.max.clone() * b.max.clone(),
    ];
    let lo = products[1..]
        .iter()
        .fold(products[0].clone(), |acc, p| Expr::min(acc, p.clone()));
    let hi = products[1..]
        .iter()
        .fold(products[0].clone(), |acc, p| Expr::max(acc, p.clone()));
    Interval::new(lo, hi)
}

// ── Statements ──────────────────────────────────────────────────────────────

/// Box of `buffer` loaded anywhere in `stmt`, or `None` if it is never loaded.
pub fn boxes_required(stmt: &Stmt, buffer: &str) -> Result<Option<Region>, BoundsError> {
    let mut scope = Scope::new();
    let mut acc = None;
    walk(stmt, buffer, &mut scope, &mut acc)?;
    Ok(acc)
}

/// Box of `buffer` loaded by `e` under `scope`, merged into `acc`.
pub fn expr_boxes(e: &Expr, buffer: &str, scope: &Scope, acc: &mut Option<Region>) -> Result<(), BoundsError> {
    let mut loads = Vec::new();
    e.visit(&mut |node| {
        if let Expr::Load { name, args } = node {
            if name == buffer {
                loads.push(args.clone());
            }
        }
    });
    for args in loads {
        let region = args
            .iter()
            .map(|a| bounds_of(a, scope, buffer))
            .collect::<Result<Region, _>>()?;
        *acc = Some(match acc.take() {
            Some(prev) => union_regions(&prev, &region),
            None => region,
        });
    }
    Ok(())
}

fn walk(stmt: &Stmt, buffer: &str, scope: &mut Scope, acc: &mut Option<Region>) -> Result<(), BoundsError> {
    for e in stmt.exprs() {
        expr_boxes(e, buffer, scope, acc)?;
    }
    match stmt {
        Stmt::Producer { body, .. } | Stmt::Realize { body, .. } => walk(body, buffer, scope, acc),
        Stmt::For {
            var,
            min,
            extent,
            body,
            ..
        } => {
            let lo = bounds_of(min, scope, buffer)?;
            let hi = bounds_of(&(min.clone() + extent.clone() - 1), scope, buffer)?;
            scope.push(var.clone(), Interval::new(lo.min, hi.max));
            let result = walk(body, buffer, scope, acc);
            scope.pop();
            result
        }
        Stmt::LetStmt { name, value, body } => {
            // A let holding loaded data stays opaque.
            if reads_data(value) {
                scope.push(name.clone(), Interval::point(Expr::var(name.clone())));
            } else {
                scope.push_let(name.clone(), value);
            }
            let result = walk(body, buffer, scope, acc);
            scope.pop();
            result
        }
        Stmt::IfThenElse {
            cond,
            then_case,
            else_case,
        } => {
            let restored = tighten(cond, scope, buffer);
            let result = walk(then_case, buffer, scope, acc);
            for (name, binding) in restored.into_iter().rev() {
                scope.replace(&name, binding);
            }
            result?;
            match else_case {
                Some(e) => walk(e, buffer, scope, acc),
                None => Ok(()),
            }
        }
        Stmt::Block { first, rest } => {
            walk(first, buffer, scope, acc)?;
            walk(rest, buffer, scope, acc)
        }
        Stmt::Store { .. } => Ok(()),
    }
}

/// Narrow scope bindings under guards of the form `var <= bound` (possibly
/// and-ed together). Returns the previous bindings for restoring.
fn tighten(cond: &Expr, scope: &mut Scope, buffer: &str) -> Vec<(String, Binding)> {
    let mut restored = Vec::new();
    let mut conjuncts = vec![cond];
    while let Some(c) = conjuncts.pop() {
        match c {
            Expr::Binary {
                op: BinOp::And,
                a,
                b,
            } => {
                conjuncts.push(a);
                conjuncts.push(b);
            }
            Expr::Binary {
                op: BinOp::Le,
                a,
                b,
            } => {
                let Expr::Var(name) = a.as_ref() else {
                    continue;
                };
                if scope.lookup(name).is_none() {
                    continue;
                }
                let (Ok(current), Ok(limit)) = (bounds_of(a, scope, buffer), bounds_of(b, scope, buffer)) else {
                    continue;
                };
                let narrowed = Interval::new(current.min, Expr::min(current.max, limit.max));
                if let Some(prev) = scope.replace(name, Binding::Range(narrowed)) {
                    restored.push((name.clone(), prev));
                }
            }
            _ => {}
        }
    }
    restored
}

fn reads_data(e: &Expr) -> bool {
    let mut found = false;
    e.visit(&mut |node| {
        found |= matches!(node, Expr::Load { .. } | Expr::Call { .. });
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ForKind;

    fn x() -> Expr {
        Expr::var("x")
    }

    fn point_region(region: &Region) -> Vec<(Expr, Expr)> {
        region.iter().map(|i| (i.min.clone(), i.max.clone())).collect()
    }

    #[test]
    fn arithmetic_bounds() {
        let mut scope = Scope::new();
        scope.push("x", Interval::new(Expr::int(0), Expr::int(9)));
        let b = bounds_of(&(x() * 2 + 1), &scope, "f").unwrap();
        assert_eq!(b, Interval::new(Expr::int(1), Expr::int(19)));
        let b = bounds_of(&(Expr::int(5) - x()), &scope, "f").unwrap();
        assert_eq!(b, Interval::new(Expr::int(-4), Expr::int(5)));
        let b = bounds_of(&(x() / 4), &scope, "f").unwrap();
        assert_eq!(b, Interval::new(Expr::int(0), Expr::int(2)));
        let b = bounds_of(&(x() % 3), &scope, "f").unwrap();
        assert_eq!(b, Interval::new(Expr::int(0), Expr::int(2)));
        let b = bounds_of(&(x() * -1), &scope, "f").unwrap();
        assert_eq!(b, Interval::new(Expr::int(-9), Expr::int(0)));
    }

    #[test]
    fn division_by_a_symbolic_point() {
        let mut scope = Scope::new();
        scope.push("t", Interval::new(Expr::int(0), Expr::var("n") * 4 - 1));
        let b = bounds_of(&(Expr::var("t") / Expr::var("n")), &scope, "f").unwrap();
        assert_eq!(b.min, Expr::min(Expr::int(0) / Expr::var("n"), (Expr::var("n") * 4 - 1) / Expr::var("n")));
        scope.push("m", Interval::new(Expr::int(1), Expr::var("n")));
        assert!(matches!(
            bounds_of(&(Expr::var("t") / Expr::var("m")), &scope, "f"),
            Err(BoundsError::NonConstantDivisor(_))
        ));
    }

    #[test]
    fn unscoped_names_stay_symbolic() {
        let scope = Scope::new();
        let b = bounds_of(&(Expr::var("n") + 1), &scope, "f").unwrap();
        assert_eq!(b, Interval::point(Expr::var("n") + 1));
    }

    #[test]
    fn data_dependent_index_is_an_error() {
        let scope = Scope::new();
        let e = Expr::load("g", vec![x()]);
        assert!(matches!(
            bounds_of(&e, &scope, "f"),
            Err(BoundsError::DataDependent { .. })
        ));
    }

    #[test]
    fn loop_nest_box() {
        // for y in [0, 4): for x in [2, 8): out(x, y) = f[x - 1, y] + f[x + 1, y]
        let body = Stmt::Store {
            name: "out".into(),
            args: vec![x(), Expr::var("y")],
            value: Expr::load("f", vec![x() - 1, Expr::var("y")])
                + Expr::load("f", vec![x() + 1, Expr::var("y")]),
        };
        let nest = Stmt::for_loop(
            "y",
            Expr::int(0),
            Expr::int(4),
            ForKind::Serial,
            Stmt::for_loop("x", Expr::int(2), Expr::int(8), ForKind::Serial, body),
        );
        let region = boxes_required(&nest, "f").unwrap().unwrap();
        assert_eq!(
            point_region(&region),
            vec![(Expr::int(1), Expr::int(10)), (Expr::int(0), Expr::int(3))]
        );
        assert!(boxes_required(&nest, "g").unwrap().is_none());
    }

    #[test]
    fn guard_tightens_loop_variable() {
        // for x in [0, 8): if (x <= 5) f[x]
        let body = Stmt::if_then(
            x().le(5),
            Stmt::Store {
                name: "out".into(),
                args: vec![x()],
                value: Expr::load("f", vec![x()]),
            },
        );
        let nest = Stmt::for_loop("x", Expr::int(0), Expr::int(8), ForKind::Serial, body);
        let region = boxes_required(&nest, "f").unwrap().unwrap();
        assert_eq!(point_region(&region), vec![(Expr::int(0), Expr::int(5))]);
    }

    #[test]
    fn lets_inside_subtree_are_bounded() {
        let store = Stmt::Store {
            name: "out".into(),
            args: vec![x()],
            value: Expr::load("f", vec![Expr::var("t")]),
        };
        let nest = Stmt::for_loop(
            "x",
            Expr::int(0),
            Expr::int(4),
            ForKind::Serial,
            Stmt::let_stmt("t", x() * 2, store),
        );
        let region = boxes_required(&nest, "f").unwrap().unwrap();
        assert_eq!(point_region(&region), vec![(Expr::int(0), Expr::int(6))]);
    }

    #[test]
    fn point_region_of_a_nested_stage_stays_a_point() {
        // for v in [0, 8):
        //   let w.min = v; let w.extent = 1
        //   let w.x.min = w.min; let w.x.max = w.min + w.extent - 1
        //   for w.x in [w.x.min, w.x.max - w.x.min + 1): w[w.x] = f[w.x]
        let v = Expr::var("v");
        let point = Interval::point(v.clone());
        assert_eq!(point.extent(), Expr::int(1));

        let store = Stmt::Store {
            name: "w".into(),
            args: vec![Expr::var("w.x")],
            value: Expr::load("f", vec![Expr::var("w.x")]),
        };
        let inner = Stmt::for_loop(
            "w.x",
            Expr::var("w.x.min"),
            Expr::var("w.x.max") - Expr::var("w.x.min") + 1,
            ForKind::Serial,
            store,
        );
        let lets = Stmt::let_stmt(
            "w.min",
            v,
            Stmt::let_stmt(
                "w.extent",
                point.extent(),
                Stmt::let_stmt(
                    "w.x.min",
                    Expr::var("w.min"),
                    Stmt::let_stmt(
                        "w.x.max",
                        Expr::var("w.min") + Expr::var("w.extent") - 1,
                        inner,
                    ),
                ),
            ),
        );
        let nest = Stmt::for_loop("v", Expr::int(0), Expr::int(8), ForKind::Serial, lets);
        let region = boxes_required(&nest, "f").unwrap().unwrap();
        assert_eq!(point_region(&region), vec![(Expr::int(0), Expr::int(7))]);
    }

    #[test]
    fn correlated_loop_bounds_cancel() {
        // for t in [0, 4): let lo = t * 16; let hi = min(t * 16 + 15, 49)
        //   for x in [lo, hi - lo + 1): f[x]
        let t = Expr::var("t");
        let store = Stmt::Store {
            name: "out".into(),
            args: vec![x()],
            value: Expr::load("f", vec![x()]),
        };
        let inner = Stmt::for_loop(
            "x",
            Expr::var("lo"),
            Expr::var("hi") - Expr::var("lo") + 1,
            ForKind::Serial,
            store,
        );
        let nest = Stmt::for_loop(
            "t",
            Expr::int(0),
            Expr::int(4),
            ForKind::Serial,
            Stmt::let_stmt(
                "lo",
                t.clone() * 16,
                Stmt::let_stmt("hi", Expr::min(t * 16 + 15, 49), inner),
            ),
        );
        let region = boxes_required(&nest, "f").unwrap().unwrap();
        assert_eq!(point_region(&region), vec![(Expr::int(0), Expr::int(49))]);
    }

    #[test]
    fn guard_narrows_a_let_bound_name() {
        // for o in [0, 4): for i in [0, 4): let r = o * 4 + i; if (r <= 9) f[r]
        let body = Stmt::let_stmt(
            "r",
            Expr::var("o") * 4 + Expr::var("i"),
            Stmt::if_then(
                Expr::var("r").le(9),
                Stmt::Store {
                    name: "out".into(),
                    args: vec![Expr::var("r")],
                    value: Expr::load("f", vec![Expr::var("r")]),
                },
            ),
        );
        let nest = Stmt::for_loop(
            "o",
            Expr::int(0),
            Expr::int(4),
            ForKind::Serial,
            Stmt::for_loop("i", Expr::int(0), Expr::int(4), ForKind::Serial, body),
        );
        let region = boxes_required(&nest, "f").unwrap().unwrap();
        assert_eq!(point_region(&region), vec![(Expr::int(0), Expr::int(9))]);
    }
}
