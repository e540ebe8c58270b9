//! Expression interpreter.
//!
//! Each map instance owns an [`EvalState`] holding its source, output and
//! variable histories. Buffers are sized at construction, so evaluating
//! short vectors does not touch the heap.

use smallvec::{SmallVec, smallvec};

use crate::model::Type;
use crate::{Error, Result};

use super::ast::{BinaryOp, UnaryOp};
use super::compile::{Destination, Expression, Node, Op};
use super::Vector;

// ============================================================================
// History buffers
// ============================================================================

/// Ring buffer of the most recent samples; `get(0)` is the newest.
#[derive(Debug, Clone)]
pub struct History {
    samples: Vec<Vector>,
    head: usize,
    count: usize,
}

impl History {
    /// Room for the current sample plus `depth` older ones.
    pub fn new(depth: usize) -> Self {
        Self { samples: vec![Vector::new(); depth + 1], head: 0, count: 0 }
    }

    pub fn push(&mut self, values: &[f64]) {
        self.head = (self.head + 1) % self.samples.len();
        let slot = &mut self.samples[self.head];
        slot.clear();
        slot.extend_from_slice(values);
        self.count = (self.count + 1).min(self.samples.len());
    }

    pub fn get(&self, back: usize) -> Option<&Vector> {
        if back >= self.count {
            return None;
        }
        let n = self.samples.len();
        Some(&self.samples[(self.head + n - back) % n])
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }
}

/// Per-instance evaluation state.
#[derive(Debug, Clone)]
pub struct EvalState {
    sources: Vec<History>,
    output: History,
    variables: Vec<History>,
    seed: u64,
    rng: u64,
}

impl EvalState {
    /// `seed` feeds `uniform()`; the same seed replays the same sequence.
    pub fn new(expr: &Expression, seed: u64) -> Self {
        Self {
            sources: expr.source_depth.iter().map(|d| History::new(*d)).collect(),
            output: History::new(expr.output_depth),
            variables: expr.variable_depth.iter().map(|d| History::new(*d)).collect(),
            seed: seed | 1,
            rng: seed | 1,
        }
    }

    /// Record a new sample for source slot `slot`.
    pub fn push_source(&mut self, slot: usize, values: &[f64]) {
        if let Some(h) = self.sources.get_mut(slot) {
            h.push(values);
        }
    }

    /// True once every source slot has received at least one sample.
    pub fn has_all_sources(&self) -> bool {
        self.sources.iter().all(|h| !h.is_empty())
    }

    pub fn last_output(&self) -> Option<&[f64]> {
        self.output.get(0).map(|v| v.as_slice())
    }

    /// Forget all history, as when an instance is released.
    pub fn reset(&mut self) {
        for h in self.sources.iter_mut().chain(self.variables.iter_mut()) {
            h.clear();
        }
        self.output.clear();
        self.rng = self.seed;
    }

    /// xorshift64* in `[0, 1)`.
    fn next_unit(&mut self) -> f64 {
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11) as f64 / (1u64 << 53) as f64
    }
}

// ============================================================================
// Evaluation
// ============================================================================

impl Expression {
    /// Run the program against the newest samples in `state`.
    ///
    /// Returns `Ok(None)` when no statement wrote to `y` (every element of
    /// an else-less conditional was false). On error nothing is committed
    /// to the histories.
    pub fn evaluate(&self, state: &mut EvalState) -> Result<Option<Vector>> {
        let mut scratch: SmallVec<[Option<Vector>; 4]> = smallvec![None; self.variables.len()];
        let mut out: Option<Vector> = None;

        for stmt in &self.statements {
            let guard = match &stmt.guard {
                Some(g) => {
                    let g = self.eval_node(g, state, &scratch)?;
                    if g.iter().all(|c| *c == 0.0) {
                        continue;
                    }
                    Some(g)
                }
                None => None,
            };
            let value = self.eval_node(&stmt.value, state, &scratch)?;

            match stmt.dest {
                Destination::Output { start, len } => {
                    let mut target = match out.take() {
                        Some(v) => v,
                        None => state.output.get(0).cloned()
                            .unwrap_or_else(|| smallvec![0.0; self.output().len]),
                    };
                    write_elements(&mut target, start, len, &value, guard.as_deref());
                    out = Some(target);
                }
                Destination::Variable { index, start, len } => {
                    let mut target = match scratch[index].take() {
                        Some(v) => v,
                        None => state.variables[index].get(0).cloned()
                            .unwrap_or_else(|| smallvec![0.0; self.variables[index].len]),
                    };
                    write_elements(&mut target, start, len, &value, guard.as_deref());
                    scratch[index] = Some(target);
                }
            }
        }

        let finite = out.iter().chain(scratch.iter().flatten()).all(|v| v.iter().all(|x| x.is_finite()));
        if !finite {
            return Err(Error::Evaluation(format!("'{}' produced a non-finite value", self.text())));
        }

        if let Some(v) = &out {
            state.output.push(v);
        }
        for (index, value) in scratch.iter().enumerate() {
            if let Some(v) = value {
                state.variables[index].push(v);
            }
        }
        Ok(out)
    }

    fn eval_node(&self, node: &Node, state: &mut EvalState, scratch: &[Option<Vector>]) -> Result<Vector> {
        let len = node.len;
        Ok(match &node.op {
            Op::Const(v) => v.clone(),
            Op::Source { slot, history, start } => {
                read(state.sources[*slot].get(*history), *start, len)
            }
            Op::Output { history, start } => read(state.output.get(history - 1), *start, len),
            Op::Variable { index, history: 0, start } => {
                let current = scratch[*index].as_ref().or_else(|| state.variables[*index].get(0));
                read(current, *start, len)
            }
            Op::Variable { index, history, start } => {
                read(state.variables[*index].get(history - 1), *start, len)
            }
            Op::Vector(items) => {
                let mut out = Vector::with_capacity(len);
                for item in items {
                    out.extend_from_slice(&self.eval_node(item, state, scratch)?);
                }
                out
            }
            Op::Unary { op, arg } => {
                let arg = self.eval_node(arg, state, scratch)?;
                match op {
                    UnaryOp::Negate => arg.iter().map(|v| narrow(node.ty, -v)).collect(),
                    UnaryOp::Not => arg.iter().map(|v| truth(*v == 0.0)).collect(),
                }
            }
            Op::Binary { op, left, right } => {
                let operand_ty = left.ty.promote(right.ty);
                let a = self.eval_node(left, state, scratch)?;
                let b = self.eval_node(right, state, scratch)?;
                let mut out = Vector::with_capacity(len);
                for i in 0..len {
                    out.push(binary(*op, operand_ty, at(&a, i), at(&b, i))?);
                }
                out
            }
            Op::Conditional { cond, then, otherwise } => {
                let c = self.eval_node(cond, state, scratch)?;
                // Only evaluate the branches that are selected somewhere, so
                // `x != 0 ? 1/x : 0` is safe.
                let any_true = c.iter().any(|v| *v != 0.0);
                let any_false = c.iter().any(|v| *v == 0.0);
                let t = if any_true { self.eval_node(then, state, scratch)? } else { smallvec![0.0] };
                let f = if any_false { self.eval_node(otherwise, state, scratch)? } else { smallvec![0.0] };
                (0..len)
                    .map(|i| narrow(node.ty, if at(&c, i) != 0.0 { at(&t, i) } else { at(&f, i) }))
                    .collect()
            }
            Op::Call1 { f, arg } => {
                let arg = self.eval_node(arg, state, scratch)?;
                arg.iter().map(|v| narrow(node.ty, f.apply(*v))).collect()
            }
            Op::Call2 { f, a, b } => {
                let a = self.eval_node(a, state, scratch)?;
                let b = self.eval_node(b, state, scratch)?;
                (0..len).map(|i| narrow(node.ty, f.apply(at(&a, i), at(&b, i)))).collect()
            }
            Op::Reduce { f, arg } => {
                let arg = self.eval_node(arg, state, scratch)?;
                smallvec![narrow(node.ty, f.apply(&arg))]
            }
            Op::Linear { args } => {
                let mut vals: SmallVec<[Vector; 5]> = SmallVec::new();
                for a in args {
                    vals.push(self.eval_node(a, state, scratch)?);
                }
                let mut out = Vector::with_capacity(len);
                for i in 0..len {
                    let [x, in_min, in_max, out_min, out_max] =
                        [0, 1, 2, 3, 4].map(|k| at(&vals[k], i));
                    if in_max == in_min {
                        return Err(Error::Evaluation("linear(): empty input range".into()));
                    }
                    out.push(narrow(node.ty, out_min + (x - in_min) * (out_max - out_min) / (in_max - in_min)));
                }
                out
            }
            Op::Uniform { arg } => {
                let arg = self.eval_node(arg, state, scratch)?;
                let mut out = Vector::with_capacity(len);
                for v in arg.iter() {
                    out.push(narrow(node.ty, v * state.next_unit()));
                }
                out
            }
        })
    }
}

/// Copy `len` elements starting at `start`; missing history reads as zeros.
fn read(sample: Option<&Vector>, start: usize, len: usize) -> Vector {
    match sample {
        Some(v) if v.len() >= start + len => Vector::from_slice(&v[start..start + len]),
        _ => smallvec![0.0; len],
    }
}

fn write_elements(target: &mut Vector, start: usize, len: usize, value: &[f64], guard: Option<&[f64]>) {
    for i in 0..len {
        if let Some(g) = guard {
            if at(g, i) == 0.0 {
                continue;
            }
        }
        if let Some(slot) = target.get_mut(start + i) {
            *slot = at(value, i);
        }
    }
}

/// Element `i`, broadcasting scalars.
fn at(v: &[f64], i: usize) -> f64 {
    if v.len() == 1 { v[0] } else { v[i] }
}

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Round a result to the precision of its node type.
fn narrow(ty: Type, v: f64) -> f64 {
    match ty {
        Type::Int32 => v as i32 as f64,
        Type::Float32 => v as f32 as f64,
        Type::Float64 => v,
    }
}

fn binary(op: BinaryOp, ty: Type, a: f64, b: f64) -> Result<f64> {
    let int = |v: f64| v as i32;
    Ok(match op {
        BinaryOp::Add => narrow(ty, a + b),
        BinaryOp::Sub => narrow(ty, a - b),
        BinaryOp::Mul => narrow(ty, a * b),
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(Error::Evaluation("division by zero".into()));
            }
            match ty {
                Type::Int32 => narrow(ty, (a / b).trunc()),
                _ => narrow(ty, a / b),
            }
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(Error::Evaluation("modulo by zero".into()));
            }
            narrow(ty, a % b)
        }
        BinaryOp::Shl => int(a).wrapping_shl(int(b) as u32) as f64,
        BinaryOp::Shr => int(a).wrapping_shr(int(b) as u32) as f64,
        BinaryOp::BitAnd => (int(a) & int(b)) as f64,
        BinaryOp::BitOr => (int(a) | int(b)) as f64,
        BinaryOp::BitXor => (int(a) ^ int(b)) as f64,
        BinaryOp::Eq => truth(a == b),
        BinaryOp::Neq => truth(a != b),
        BinaryOp::Lt => truth(a < b),
        BinaryOp::Lte => truth(a <= b),
        BinaryOp::Gt => truth(a > b),
        BinaryOp::Gte => truth(a >= b),
        BinaryOp::And => truth(a != 0.0 && b != 0.0),
        BinaryOp::Or => truth(a != 0.0 || b != 0.0),
    })
}
