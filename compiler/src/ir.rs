// ir.rs — Lowered statement tree
//
// The output of lowering and the input of both the call-graph extractor and
// the evaluator. Expressions inside statements are `Expr` with every stage
// call turned into a `Load` of the realized buffer.
//
// Preconditions: none.
// Postconditions: `Display` is deterministic; `fingerprint` hashes it.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::expr::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForKind {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
}

impl fmt::Display for ForKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForKind::Serial => write!(f, "for"),
            ForKind::Parallel => write!(f, "parallel"),
            ForKind::Vectorized => write!(f, "vectorized"),
            ForKind::Unrolled => write!(f, "unrolled"),
        }
    }
}

/// `[min, min + extent)` in one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stmt {
    /// The full computation of one stage (initialization and updates).
    Producer { name: String, body: Box<Stmt> },
    For {
        var: String,
        min: Expr,
        extent: Expr,
        kind: ForKind,
        body: Box<Stmt>,
    },
    LetStmt {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },
    IfThenElse {
        cond: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Block { first: Box<Stmt>, rest: Box<Stmt> },
    Store {
        name: String,
        args: Vec<Expr>,
        value: Expr,
    },
    /// Allocate buffer `name` over `bounds` for the duration of `body`.
    Realize {
        name: String,
        bounds: Vec<Range>,
        body: Box<Stmt>,
    },
}

impl Stmt {
    pub fn producer(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::Producer {
            name: name.into(),
            body: Box::new(body),
        }
    }

    pub fn for_loop(var: impl Into<String>, min: Expr, extent: Expr, kind: ForKind, body: Stmt) -> Stmt {
        Stmt::For {
            var: var.into(),
            min,
            extent,
            kind,
            body: Box::new(body),
        }
    }

    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Stmt {
        Stmt::LetStmt {
            name: name.into(),
            value,
            body: Box::new(body),
        }
    }

    pub fn if_then(cond: Expr, then_case: Stmt) -> Stmt {
        Stmt::IfThenElse {
            cond,
            then_case: Box::new(then_case),
            else_case: None,
        }
    }

    pub fn if_then_else(cond: Expr, then_case: Stmt, else_case: Stmt) -> Stmt {
        Stmt::IfThenElse {
            cond,
            then_case: Box::new(then_case),
            else_case: Some(Box::new(else_case)),
        }
    }

    pub fn block(first: Stmt, rest: Stmt) -> Stmt {
        Stmt::Block {
            first: Box::new(first),
            rest: Box::new(rest),
        }
    }

    /// Right-nested block of `stmts`; `None` when empty.
    pub fn block_of(stmts: Vec<Stmt>) -> Option<Stmt> {
        let mut iter = stmts.into_iter().rev();
        let last = iter.next()?;
        Some(iter.fold(last, |rest, first| Stmt::block(first, rest)))
    }

    /// Pre-order walk over this statement and every nested statement.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Stmt)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Direct sub-statements, in evaluation order.
    pub fn children(&self) -> Vec<&Stmt> {
        match self {
            Stmt::Producer { body, .. }
            | Stmt::For { body, .. }
            | Stmt::LetStmt { body, .. }
            | Stmt::Realize { body, .. } => vec![body.as_ref()],
            Stmt::IfThenElse {
                then_case,
                else_case,
                ..
            } => std::iter::once(then_case.as_ref())
                .chain(else_case.as_deref())
                .collect(),
            Stmt::Block { first, rest } => vec![first.as_ref(), rest.as_ref()],
            Stmt::Store { .. } => Vec::new(),
        }
    }

    /// Every expression held directly by this node (not by nested statements).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::For { min, extent, .. } => vec![min, extent],
            Stmt::LetStmt { value, .. } => vec![value],
            Stmt::IfThenElse { cond, .. } => vec![cond],
            Stmt::Store { args, value, .. } => args.iter().chain(std::iter::once(value)).collect(),
            Stmt::Realize { bounds, .. } => bounds.iter().flat_map(|r| [&r.min, &r.extent]).collect(),
            Stmt::Producer { .. } | Stmt::Block { .. } => Vec::new(),
        }
    }

    /// True if any expression in this subtree loads `name`.
    pub fn loads(&self, name: &str) -> bool {
        let mut found = false;
        self.visit(&mut |s| {
            for e in s.exprs() {
                e.visit(&mut |e| {
                    if let Expr::Load { name: n, .. } = e {
                        found |= n == name;
                    }
                });
            }
        });
        found
    }

    /// Producer regions in this subtree, in pre-order.
    pub fn producers(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.visit(&mut |s| {
            if let Stmt::Producer { name, .. } = s {
                names.push(name.as_str());
            }
        });
        names
    }

    /// Stable hash of the printed tree: 16 hex chars of SHA-256.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        let hash = hasher.finalize();
        hash.iter().take(8).map(|b| format!("{:02x}", b)).collect()
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            Stmt::Producer { name, body } => {
                writeln!(f, "{}produce {} {{", pad, name)?;
                body.fmt_indented(f, depth + 1)?;
                writeln!(f, "{}}}", pad)
            }
            Stmt::For {
                var,
                min,
                extent,
                kind,
                body,
            } => {
                writeln!(f, "{}{} ({}, {}, {}) {{", pad, kind, var, min, extent)?;
                body.fmt_indented(f, depth + 1)?;
                writeln!(f, "{}}}", pad)
            }
            Stmt::LetStmt { name, value, body } => {
                writeln!(f, "{}let {} = {}", pad, name, value)?;
                body.fmt_indented(f, depth)
            }
            Stmt::IfThenElse {
                cond,
                then_case,
                else_case,
            } => {
                writeln!(f, "{}if ({}) {{", pad, cond)?;
                then_case.fmt_indented(f, depth + 1)?;
                if let Some(else_case) = else_case {
                    writeln!(f, "{}}} else {{", pad)?;
                    else_case.fmt_indented(f, depth + 1)?;
                }
                writeln!(f, "{}}}", pad)
            }
            Stmt::Block { first, rest } => {
                first.fmt_indented(f, depth)?;
                rest.fmt_indented(f, depth)
            }
            Stmt::Store { name, args, value } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                writeln!(f, "{}{}({}) = {}", pad, name, args.join(", "), value)
            }
            Stmt::Realize { name, bounds, body } => {
                let bounds: Vec<String> = bounds
                    .iter()
                    .map(|r| format!("[{}, {}]", r.min, r.extent))
                    .collect();
                writeln!(f, "{}realize {}({}) {{", pad, name, bounds.join(", "))?;
                body.fmt_indented(f, depth + 1)?;
                writeln!(f, "{}}}", pad)
            }
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str) -> Stmt {
        Stmt::Store {
            name: name.into(),
            args: vec![Expr::var("x")],
            value: Expr::load("a", vec![Expr::var("x")]) + 1,
        }
    }

    #[test]
    fn block_of_nests_to_the_right() {
        let b = Stmt::block_of(vec![store("f"), store("g"), store("h")]).unwrap();
        match b {
            Stmt::Block { first, rest } => {
                assert_eq!(*first, store("f"));
                assert!(matches!(*rest, Stmt::Block { .. }));
            }
            other => panic!("expected block, got {:?}", other),
        }
        assert!(Stmt::block_of(Vec::new()).is_none());
    }

    #[test]
    fn display_is_indented() {
        let s = Stmt::producer(
            "f",
            Stmt::for_loop("f.s0.x", Expr::int(0), Expr::int(4), ForKind::Vectorized, store("f")),
        );
        let text = s.to_string();
        assert_eq!(
            text,
            "produce f {\n  vectorized (f.s0.x, 0, 4) {\n    f(x) = (a[x] + 1)\n  }\n}\n"
        );
    }

    #[test]
    fn loads_and_producers() {
        let s = Stmt::block(Stmt::producer("f", store("f")), Stmt::producer("g", store("g")));
        assert!(s.loads("a"));
        assert!(!s.loads("f"));
        assert_eq!(s.producers(), vec!["f", "g"]);
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = Stmt::producer("f", store("f"));
        let b = Stmt::producer("g", store("g"));
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }
}
