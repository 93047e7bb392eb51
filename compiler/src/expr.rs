// expr.rs — Front-end expression model for stage definitions
//
// Stage bodies, reduction predicates, loop bounds and lowered IR values all
// share this one expression type. Inter-stage references are calls by name:
// the referenced stage is looked up when the expression is traversed, never
// through a structural pointer.
//
// Preconditions: none.
// Postconditions: smart constructors fold integer constants, drop additive and
//                 multiplicative identities and cancel `a - a`; `simplify`
//                 additionally collects linear terms.
// Failure modes: none (division and modulo by zero evaluate to 0).
// Side effects: none.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops;

use serde::Serialize;

// ── Operators ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Floor division (rounds towards negative infinity for positive divisors).
    Div,
    /// Euclidean modulo (never negative).
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    /// Evaluate on 32-bit integers. Booleans are 0 / 1.
    pub fn apply(self, a: i32, b: i32) -> i32 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    0
                } else {
                    let q = a.wrapping_div(b);
                    if (a % b != 0) && ((a < 0) != (b < 0)) {
                        q - 1
                    } else {
                        q
                    }
                }
            }
            BinOp::Mod => {
                if b == 0 {
                    0
                } else {
                    a.wrapping_rem_euclid(b)
                }
            }
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
            BinOp::Eq => (a == b) as i32,
            BinOp::Ne => (a != b) as i32,
            BinOp::Lt => (a < b) as i32,
            BinOp::Le => (a <= b) as i32,
            BinOp::Gt => (a > b) as i32,
            BinOp::Ge => (a >= b) as i32,
            BinOp::And => (a != 0 && b != 0) as i32,
            BinOp::Or => (a != 0 || b != 0) as i32,
        }
    }
}

// ── Expression ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Expr {
    Int(i32),
    /// Pure variable, reduction variable, or a let/loop-bound name.
    Var(String),
    /// Scalar pipeline parameter, bound at realization time.
    Param(String),
    Binary {
        op: BinOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    Not(Box<Expr>),
    Select {
        cond: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    /// Reference to a stage or image parameter by name (front end).
    Call { name: String, args: Vec<Expr> },
    /// Read of a realized buffer by name (produced by lowering).
    Load { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn int(value: i32) -> Expr {
        Expr::Int(value)
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn param(name: impl Into<String>) -> Expr {
        Expr::Param(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn load(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Load {
            name: name.into(),
            args,
        }
    }

    /// Build a binary node, folding constants and trivial identities.
    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Expr {
        match (op, &a, &b) {
            (_, Expr::Int(x), Expr::Int(y)) => Expr::Int(op.apply(*x, *y)),
            (BinOp::Add, Expr::Int(0), _) => b,
            (BinOp::Add, _, Expr::Int(0)) | (BinOp::Sub, _, Expr::Int(0)) => a,
            (BinOp::Mul, Expr::Int(1), _) => b,
            (BinOp::Mul, _, Expr::Int(1)) | (BinOp::Div, _, Expr::Int(1)) => a,
            (BinOp::Sub, _, _) if a == b => Expr::Int(0),
            (BinOp::Min | BinOp::Max, _, _) if a == b => a,
            _ => Expr::Binary {
                op,
                a: Box::new(a),
                b: Box::new(b),
            },
        }
    }

    pub fn min(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Min, a.into(), b.into())
    }

    pub fn max(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Max, a.into(), b.into())
    }

    pub fn select(cond: Expr, then_value: impl Into<Expr>, else_value: impl Into<Expr>) -> Expr {
        Expr::Select {
            cond: Box::new(cond),
            then_value: Box::new(then_value.into()),
            else_value: Box::new(else_value.into()),
        }
    }

    pub fn lt(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Lt, self, other.into())
    }

    pub fn le(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Le, self, other.into())
    }

    pub fn gt(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Gt, self, other.into())
    }

    pub fn ge(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ge, self, other.into())
    }

    pub fn equals(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Eq, self, other.into())
    }

    pub fn not_equals(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ne, self, other.into())
    }

    pub fn and(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::And, self, other.into())
    }

    pub fn or(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Or, self, other.into())
    }

    pub fn not(self) -> Expr {
        match self {
            Expr::Int(v) => Expr::Int((v == 0) as i32),
            other => Expr::Not(Box::new(other)),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Pre-order walk over this expression and all sub-expressions.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Int(_) | Expr::Var(_) | Expr::Param(_) => {}
            Expr::Binary { a, b, .. } => {
                a.visit(f);
                b.visit(f);
            }
            Expr::Not(a) => a.visit(f),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => {
                cond.visit(f);
                then_value.visit(f);
                else_value.visit(f);
            }
            Expr::Call { args, .. } | Expr::Load { args, .. } => {
                for arg in args {
                    arg.visit(f);
                }
            }
        }
    }

    /// Rebuild the expression bottom-up: children first, then `f` on the node.
    pub fn rewrite(&self, f: &mut dyn FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = match self {
            Expr::Int(_) | Expr::Var(_) | Expr::Param(_) => self.clone(),
            Expr::Binary { op, a, b } => Expr::binary(*op, a.rewrite(f), b.rewrite(f)),
            Expr::Not(a) => a.rewrite(f).not(),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => Expr::select(cond.rewrite(f), then_value.rewrite(f), else_value.rewrite(f)),
            Expr::Call { name, args } => Expr::call(
                name.clone(),
                args.iter().map(|arg| arg.rewrite(f)).collect(),
            ),
            Expr::Load { name, args } => Expr::load(
                name.clone(),
                args.iter().map(|arg| arg.rewrite(f)).collect(),
            ),
        };
        f(rebuilt)
    }

    /// Names of every stage or image called, in no particular order.
    pub fn calls(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Call { name, .. } = e {
                names.insert(name.clone());
            }
        });
        names
    }

    /// True if `name` is called anywhere in this expression.
    pub fn calls_name(&self, target: &str) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Call { name, .. } = e {
                found |= name == target;
            }
        });
        found
    }

    /// Collect the free variable names of this expression.
    pub fn free_vars(&self, out: &mut BTreeSet<String>) {
        self.visit(&mut |e| {
            if let Expr::Var(name) = e {
                out.insert(name.clone());
            }
        });
    }

    /// Rename every call of `from` to `to`, keeping arguments untouched.
    /// Returns whether anything changed.
    pub fn rename_calls(&mut self, from: &str, to: &str) -> bool {
        match self {
            Expr::Int(_) | Expr::Var(_) | Expr::Param(_) => false,
            Expr::Binary { a, b, .. } => {
                let changed_a = a.rename_calls(from, to);
                let changed_b = b.rename_calls(from, to);
                changed_a || changed_b
            }
            Expr::Not(a) => a.rename_calls(from, to),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => {
                let c = cond.rename_calls(from, to);
                let t = then_value.rename_calls(from, to);
                let e = else_value.rename_calls(from, to);
                c || t || e
            }
            Expr::Call { name, args } => {
                let mut changed = false;
                for arg in args.iter_mut() {
                    changed |= arg.rename_calls(from, to);
                }
                if name == from {
                    *name = to.to_string();
                    changed = true;
                }
                changed
            }
            Expr::Load { args, .. } => {
                let mut changed = false;
                for arg in args.iter_mut() {
                    changed |= arg.rename_calls(from, to);
                }
                changed
            }
        }
    }

    /// Replace free variables by the expressions bound in `vars`.
    pub fn substitute(&self, vars: &HashMap<String, Expr>) -> Expr {
        self.rewrite(&mut |e| {
            if let Expr::Var(name) = &e {
                if let Some(bound) = vars.get(name) {
                    return bound.clone();
                }
            }
            e
        })
    }

    /// Collect sums, differences and constant multiples into one linear
    /// combination so equal terms cancel: `(a + 15 + m) - (a + m)` is `15`.
    /// Anything non-linear is kept as an opaque term with simplified children.
    pub fn simplify(&self) -> Expr {
        Linear::of(self).into_expr()
    }
}

// ── Linear normalization ────────────────────────────────────────────────────

/// `constant + Σ coeff·term`, terms in first-seen order.
#[derive(Debug, Default)]
struct Linear {
    terms: Vec<(Expr, i32)>,
    constant: i32,
}

impl Linear {
    fn of(e: &Expr) -> Linear {
        match e {
            Expr::Int(v) => Linear {
                terms: Vec::new(),
                constant: *v,
            },
            Expr::Binary { op: BinOp::Add, a, b } => Linear::of(a).plus(Linear::of(b), 1),
            Expr::Binary { op: BinOp::Sub, a, b } => Linear::of(a).plus(Linear::of(b), -1),
            Expr::Binary { op: BinOp::Mul, a, b } => {
                let la = Linear::of(a);
                let lb = Linear::of(b);
                match (la.as_constant(), lb.as_constant()) {
                    (_, Some(c)) => la.scaled(c),
                    (Some(c), None) => lb.scaled(c),
                    (None, None) => Linear::term(Expr::binary(BinOp::Mul, la.into_expr(), lb.into_expr())),
                }
            }
            Expr::Binary { op, a, b } => {
                Linear::term(Expr::binary(*op, a.simplify(), b.simplify()))
            }
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => Linear::term(Expr::select(
                cond.simplify(),
                then_value.simplify(),
                else_value.simplify(),
            )),
            Expr::Not(a) => Linear::term(a.simplify().not()),
            Expr::Var(_) | Expr::Param(_) | Expr::Call { .. } | Expr::Load { .. } => Linear::term(e.clone()),
        }
    }

    fn term(e: Expr) -> Linear {
        match e {
            Expr::Int(v) => Linear {
                terms: Vec::new(),
                constant: v,
            },
            other => Linear {
                terms: vec![(other, 1)],
                constant: 0,
            },
        }
    }

    fn as_constant(&self) -> Option<i32> {
        self.terms.is_empty().then_some(self.constant)
    }

    fn scaled(mut self, c: i32) -> Linear {
        for (_, coeff) in &mut self.terms {
            *coeff = coeff.wrapping_mul(c);
        }
        self.constant = self.constant.wrapping_mul(c);
        self.terms.retain(|(_, coeff)| *coeff != 0);
        self
    }

    fn plus(mut self, other: Linear, sign: i32) -> Linear {
        for (term, coeff) in other.terms {
            let coeff = coeff.wrapping_mul(sign);
            match self.terms.iter_mut().find(|(t, _)| *t == term) {
                Some((_, c)) => *c = c.wrapping_add(coeff),
                None => self.terms.push((term, coeff)),
            }
        }
        self.constant = self.constant.wrapping_add(other.constant.wrapping_mul(sign));
        self.terms.retain(|(_, coeff)| *coeff != 0);
        self
    }

    fn into_expr(self) -> Expr {
        let (positive, negative): (Vec<_>, Vec<_>) = self.terms.into_iter().partition(|(_, c)| *c > 0);
        let scale = |term: Expr, c: i32| if c == 1 { term } else { term * c };

        let mut acc: Option<Expr> = None;
        for (term, c) in positive {
            let t = scale(term, c);
            acc = Some(match acc {
                Some(a) => a + t,
                None => t,
            });
        }
        let mut constant = self.constant;
        if acc.is_none() && !negative.is_empty() {
            acc = Some(Expr::Int(constant));
            constant = 0;
        }
        for (term, c) in negative {
            let t = scale(term, c.wrapping_neg());
            acc = Some(match acc {
                Some(a) => a - t,
                None => Expr::Int(0) - t,
            });
        }
        match acc {
            Some(a) if constant > 0 => a + constant,
            Some(a) if constant < 0 => a - constant.wrapping_neg(),
            Some(a) => a,
            None => Expr::Int(constant),
        }
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Int(value)
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Int(value as i32)
    }
}

impl From<&Expr> for Expr {
    fn from(value: &Expr) -> Self {
        value.clone()
    }
}

// ── Arithmetic operators ────────────────────────────────────────────────────

macro_rules! impl_arith {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl ops::$trait<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs.clone())
            }
        }

        impl ops::$trait<i32> for Expr {
            type Output = Expr;
            fn $method(self, rhs: i32) -> Expr {
                Expr::binary($op, self, Expr::Int(rhs))
            }
        }

        impl ops::$trait<Expr> for i32 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, Expr::Int(self), rhs)
            }
        }
    };
}

impl_arith!(Add, add, BinOp::Add);
impl_arith!(Sub, sub, BinOp::Sub);
impl_arith!(Mul, mul, BinOp::Mul);
impl_arith!(Div, div, BinOp::Div);
impl_arith!(Rem, rem, BinOp::Mod);

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::binary(BinOp::Sub, Expr::Int(0), self)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Expr]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Var(name) | Expr::Param(name) => write!(f, "{}", name),
            Expr::Binary {
                op: op @ (BinOp::Min | BinOp::Max),
                a,
                b,
            } => write!(f, "{}({}, {})", op.symbol(), a, b),
            Expr::Binary { op, a, b } => write!(f, "({} {} {})", a, op.symbol(), b),
            Expr::Not(a) => write!(f, "!{}", a),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => write!(f, "select({}, {}, {})", cond, then_value, else_value),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            Expr::Load { name, args } => {
                write!(f, "{}[", name)?;
                write_args(f, args)?;
                write!(f, "]")
            }
        }
    }
}
