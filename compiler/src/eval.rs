// eval.rs — Statement-tree interpreter
//
// Runs a lowered module over 32-bit integer buffers. Loop kinds are
// annotations only: every loop runs serially, in order.
//
// Preconditions: the module came from `lower::lower`.
// Postconditions: the returned buffer covers `[0, extent)` per dimension.
// Failure modes: `EvalError` for unbound images, params or names, dimension
//                mismatches, and (with bounds checking on) accesses outside a
//                realized buffer.
// Side effects: none.

use std::collections::HashMap;

use tracing::trace;

use crate::config::Options;
use crate::expr::{BinOp, Expr};
use crate::ir::Stmt;
use crate::lower::{extent_name, min_name, Module};
use crate::pipeline::{ImageParam, Param};

// ── Buffers ─────────────────────────────────────────────────────────────────

/// Dense integer buffer; the first dimension is innermost in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    mins: Vec<i32>,
    extents: Vec<i32>,
    data: Vec<i32>,
}

impl Buffer {
    pub fn new(mins: Vec<i32>, extents: Vec<i32>) -> Self {
        let extents: Vec<i32> = extents.into_iter().map(|e| e.max(0)).collect();
        let len = extents.iter().map(|&e| e as usize).product();
        Self {
            mins,
            extents,
            data: vec![0; len],
        }
    }

    /// Zero-filled buffer over `[0, extent)` in each dimension.
    pub fn with_extents(extents: &[i32]) -> Self {
        Self::new(vec![0; extents.len()], extents.to_vec())
    }

    pub fn from_fn(extents: &[i32], f: impl Fn(&[i32]) -> i32) -> Self {
        let mut buf = Self::with_extents(extents);
        for (i, coords) in buf.coords().enumerate().collect::<Vec<_>>() {
            buf.data[i] = f(&coords);
        }
        buf
    }

    pub fn dims(&self) -> usize {
        self.extents.len()
    }

    pub fn mins(&self) -> &[i32] {
        &self.mins
    }

    pub fn extents(&self) -> &[i32] {
        &self.extents
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    fn offset(&self, coords: &[i32]) -> Option<usize> {
        if coords.len() != self.extents.len() {
            return None;
        }
        let mut offset = 0usize;
        let mut stride = 1usize;
        for ((&c, &min), &extent) in coords.iter().zip(&self.mins).zip(&self.extents) {
            let rel = c.checked_sub(min)?;
            if rel < 0 || rel >= extent {
                return None;
            }
            offset += rel as usize * stride;
            stride *= extent as usize;
        }
        Some(offset)
    }

    pub fn get(&self, coords: &[i32]) -> Option<i32> {
        self.offset(coords).map(|i| self.data[i])
    }

    /// Returns false if `coords` is outside the buffer.
    pub fn set(&mut self, coords: &[i32], value: i32) -> bool {
        match self.offset(coords) {
            Some(i) => {
                self.data[i] = value;
                true
            }
            None => false,
        }
    }

    /// Every coordinate in memory order.
    pub fn coords(&self) -> impl Iterator<Item = Vec<i32>> + '_ {
        let total = self.data.len();
        (0..total).map(move |mut i| {
            self.mins
                .iter()
                .zip(&self.extents)
                .map(|(&min, &extent)| {
                    let extent = extent as usize;
                    let c = min + (i % extent) as i32;
                    i /= extent;
                    c
                })
                .collect()
        })
    }

    /// First coordinate where `f` disagrees with the buffer, with both values.
    pub fn first_mismatch(&self, f: impl Fn(&[i32]) -> i32) -> Option<(Vec<i32>, i32, i32)> {
        self.coords().find_map(|c| {
            let actual = self.get(&c)?;
            let expected = f(&c);
            (actual != expected).then_some((c, actual, expected))
        })
    }
}

// ── Inputs ──────────────────────────────────────────────────────────────────

/// Values for the images and scalar params a module reads.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    images: HashMap<String, Buffer>,
    params: HashMap<String, i32>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, image: &ImageParam, buffer: Buffer) -> &mut Self {
        self.bind_named(image.name(), buffer)
    }

    pub fn bind_named(&mut self, name: &str, buffer: Buffer) -> &mut Self {
        self.images.insert(name.to_string(), buffer);
        self
    }

    pub fn set(&mut self, param: &Param, value: i32) -> &mut Self {
        self.set_named(param.name(), value)
    }

    pub fn set_named(&mut self, name: &str, value: i32) -> &mut Self {
        self.params.insert(name.to_string(), value);
        self
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("no buffer bound to image '{0}'")]
    UnboundImage(String),
    #[error("no value bound to param '{0}'")]
    UnboundParam(String),
    #[error("'{0}' is not bound")]
    UnboundVar(String),
    #[error("'{buffer}' has {found} dimensions, expected {expected}")]
    DimensionMismatch {
        buffer: String,
        expected: usize,
        found: usize,
    },
    #[error("access to '{buffer}' at {coords:?} is outside mins {mins:?} extents {extents:?}")]
    OutOfBounds {
        buffer: String,
        coords: Vec<i32>,
        mins: Vec<i32>,
        extents: Vec<i32>,
    },
    #[error("'{0}' is not a realized buffer")]
    UnknownBuffer(String),
    #[error("unlowered call to '{0}'")]
    UnloweredCall(String),
}

// ── Interpreter ─────────────────────────────────────────────────────────────

/// Evaluate `module` with its output over `[0, extents[d])`.
pub fn run(module: &Module, extents: &[i32], inputs: &Inputs, options: &Options) -> Result<Buffer, EvalError> {
    if extents.len() != module.output_dims {
        return Err(EvalError::DimensionMismatch {
            buffer: module.name.clone(),
            expected: module.output_dims,
            found: extents.len(),
        });
    }
    for (image, &dims) in &module.images {
        let buffer = inputs
            .images
            .get(image)
            .ok_or_else(|| EvalError::UnboundImage(image.clone()))?;
        if buffer.dims() != dims {
            return Err(EvalError::DimensionMismatch {
                buffer: image.clone(),
                expected: dims,
                found: buffer.dims(),
            });
        }
    }

    let bound_names: Vec<(String, i32)> = extents
        .iter()
        .enumerate()
        .flat_map(|(d, &e)| [(min_name(&module.name, d), 0), (extent_name(&module.name, d), e)])
        .collect();

    let mut interp = Interp {
        env: HashMap::new(),
        buffers: HashMap::new(),
        images: &inputs.images,
        params: &inputs.params,
        check_bounds: options.check_bounds,
    };
    for (name, value) in &bound_names {
        interp.env.insert(name.as_str(), vec![*value]);
    }
    interp
        .buffers
        .insert(module.name.as_str(), vec![Buffer::with_extents(extents)]);

    interp.exec(&module.body)?;

    interp
        .buffers
        .remove(module.name.as_str())
        .and_then(|mut stack| stack.pop())
        .ok_or_else(|| EvalError::UnknownBuffer(module.name.clone()))
}

struct Interp<'a> {
    /// Name → stack of bindings, innermost last.
    env: HashMap<&'a str, Vec<i32>>,
    /// Realized buffers; an inner `Realize` of the same name shadows.
    buffers: HashMap<&'a str, Vec<Buffer>>,
    images: &'a HashMap<String, Buffer>,
    params: &'a HashMap<String, i32>,
    check_bounds: bool,
}

impl<'a> Interp<'a> {
    fn push(&mut self, name: &'a str, value: i32) {
        self.env.entry(name).or_default().push(value);
    }

    fn pop(&mut self, name: &str) {
        if let Some(stack) = self.env.get_mut(name) {
            stack.pop();
        }
    }

    fn exec(&mut self, stmt: &'a Stmt) -> Result<(), EvalError> {
        match stmt {
            Stmt::Producer { body, .. } => self.exec(body),
            Stmt::For {
                var,
                min,
                extent,
                body,
                ..
            } => {
                let lo = self.eval(min)?;
                let n = self.eval(extent)?;
                self.push(var, lo);
                let mut result = Ok(());
                for i in lo..lo.saturating_add(n.max(0)) {
                    if let Some(slot) = self.env.get_mut(var.as_str()).and_then(|s| s.last_mut()) {
                        *slot = i;
                    }
                    result = self.exec(body);
                    if result.is_err() {
                        break;
                    }
                }
                self.pop(var);
                result
            }
            Stmt::LetStmt { name, value, body } => {
                let v = self.eval(value)?;
                self.push(name, v);
                let result = self.exec(body);
                self.pop(name);
                result
            }
            Stmt::IfThenElse {
                cond,
                then_case,
                else_case,
            } => {
                if self.eval(cond)? != 0 {
                    self.exec(then_case)
                } else if let Some(e) = else_case {
                    self.exec(e)
                } else {
                    Ok(())
                }
            }
            Stmt::Block { first, rest } => {
                self.exec(first)?;
                self.exec(rest)
            }
            Stmt::Store { name, args, value } => {
                let coords = self.eval_all(args)?;
                let v = self.eval(value)?;
                let check = self.check_bounds;
                let buffer = self
                    .buffers
                    .get_mut(name.as_str())
                    .and_then(|s| s.last_mut())
                    .ok_or_else(|| EvalError::UnknownBuffer(name.clone()))?;
                if !buffer.set(&coords, v) && check {
                    return Err(out_of_bounds(name, coords, buffer));
                }
                Ok(())
            }
            Stmt::Realize { name, bounds, body } => {
                let mut mins = Vec::with_capacity(bounds.len());
                let mut extents = Vec::with_capacity(bounds.len());
                for range in bounds {
                    mins.push(self.eval(&range.min)?);
                    extents.push(self.eval(&range.extent)?);
                }
                trace!(buffer = %name, ?mins, ?extents, "realize");
                self.buffers
                    .entry(name.as_str())
                    .or_default()
                    .push(Buffer::new(mins, extents));
                let result = self.exec(body);
                if let Some(stack) = self.buffers.get_mut(name.as_str()) {
                    stack.pop();
                }
                result
            }
        }
    }

    fn eval_all(&self, exprs: &[Expr]) -> Result<Vec<i32>, EvalError> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn eval(&self, e: &Expr) -> Result<i32, EvalError> {
        match e {
            Expr::Int(v) => Ok(*v),
            Expr::Var(name) => self
                .env
                .get(name.as_str())
                .and_then(|s| s.last().copied())
                .ok_or_else(|| EvalError::UnboundVar(name.clone())),
            Expr::Param(name) => self
                .params
                .get(name)
                .copied()
                .ok_or_else(|| EvalError::UnboundParam(name.clone())),
            Expr::Binary {
                op: BinOp::And,
                a,
                b,
            } => Ok((self.eval(a)? != 0 && self.eval(b)? != 0) as i32),
            Expr::Binary {
                op: BinOp::Or,
                a,
                b,
            } => Ok((self.eval(a)? != 0 || self.eval(b)? != 0) as i32),
            Expr::Binary { op, a, b } => Ok(op.apply(self.eval(a)?, self.eval(b)?)),
            Expr::Not(a) => Ok((self.eval(a)? == 0) as i32),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => {
                if self.eval(cond)? != 0 {
                    self.eval(then_value)
                } else {
                    self.eval(else_value)
                }
            }
            Expr::Call { name, .. } => Err(EvalError::UnloweredCall(name.clone())),
            Expr::Load { name, args } => {
                let coords = self.eval_all(args)?;
                let buffer = self
                    .buffers
                    .get(name.as_str())
                    .and_then(|s| s.last())
                    .or_else(|| self.images.get(name))
                    .ok_or_else(|| EvalError::UnknownBuffer(name.clone()))?;
                match buffer.get(&coords) {
                    Some(v) => Ok(v),
                    None if self.check_bounds => Err(out_of_bounds(name, coords, buffer)),
                    None => Ok(0),
                }
            }
        }
    }
}

fn out_of_bounds(name: &str, coords: Vec<i32>, buffer: &Buffer) -> EvalError {
    EvalError::OutOfBounds {
        buffer: name.to_string(),
        coords,
        mins: buffer.mins.clone(),
        extents: buffer.extents.clone(),
    }
}
