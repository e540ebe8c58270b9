//! Expression compiler.
//!
//! Resolves names against the map's source and destination signatures,
//! checks element types and vector lengths, and produces a typed operator
//! tree. Compilation happens once per map definition; evaluation re-enters
//! the tree for every update.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::smallvec;

use crate::model::Type;
use crate::{Error, Result};

use super::ast::{self, BinaryOp, Expr, Literal, Program, Target, UnaryOp};
use super::functions::{BinaryFn, Function, Reducer, UnaryFn};
use super::Vector;

/// Element type and vector length of one side of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub ty: Type,
    pub len: usize,
}

impl Signature {
    pub fn new(ty: Type, len: usize) -> Self {
        Self { ty, len }
    }
}

/// A typed operator-tree node. `ty` drives integer versus floating-point
/// arithmetic; `len` is the vector length this node produces.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub ty: Type,
    pub len: usize,
    pub op: Op,
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Const(Vector),
    Source { slot: usize, history: usize, start: usize },
    /// `y{-n}`; `history` is at least 1
    Output { history: usize, start: usize },
    Variable { index: usize, history: usize, start: usize },
    Vector(Vec<Node>),
    Unary { op: UnaryOp, arg: Box<Node> },
    Binary { op: BinaryOp, left: Box<Node>, right: Box<Node> },
    Conditional { cond: Box<Node>, then: Box<Node>, otherwise: Box<Node> },
    Call1 { f: UnaryFn, arg: Box<Node> },
    Call2 { f: BinaryFn, a: Box<Node>, b: Box<Node> },
    Reduce { f: Reducer, arg: Box<Node> },
    Linear { args: Vec<Node> },
    Uniform { arg: Box<Node> },
}

/// Where a statement writes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Destination {
    Output { start: usize, len: usize },
    Variable { index: usize, start: usize, len: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct Statement {
    pub dest: Destination,
    pub value: Node,
    /// Condition of an else-less `cond ? value`: elements where it is zero
    /// keep their previous value.
    pub guard: Option<Node>,
}

#[derive(Debug, Clone)]
pub(crate) struct Variable {
    pub name: String,
    pub ty: Type,
    pub len: usize,
    known: bool,
}

/// A compiled map expression.
#[derive(Debug, Clone)]
pub struct Expression {
    text: String,
    sources: Vec<Signature>,
    output: Signature,
    pub(crate) statements: Vec<Statement>,
    pub(crate) variables: Vec<Variable>,
    /// Deepest history read per source slot.
    pub(crate) source_depth: Vec<usize>,
    pub(crate) output_depth: usize,
    pub(crate) variable_depth: Vec<usize>,
}

impl Expression {
    /// Parse and compile `text` for the given source signatures (`x0`,
    /// `x1`, ...) and destination signature (`y`).
    pub fn compile(text: &str, sources: &[Signature], output: Signature) -> Result<Expression> {
        if sources.is_empty() {
            return Err(Error::ExpressionSyntax {
                position: 0,
                message: "expression needs at least one source".into(),
            });
        }
        let program = super::parse(text)?;

        // Variables referenced through their history before their first
        // assignment get a provisional shape; recompile once it is known.
        let mut variables = collect_variables(&program);
        for _ in 0..4 {
            let mut c = Compiler::new(sources, output, variables);
            let statements = c.compile_program(&program)?;
            if !c.retry {
                return Ok(Expression {
                    text: text.to_string(),
                    sources: sources.to_vec(),
                    output,
                    statements,
                    variables: c.variables,
                    source_depth: c.source_depth,
                    output_depth: c.output_depth,
                    variable_depth: c.variable_depth,
                });
            }
            variables = c.variables;
        }
        Err(Error::ExpressionSyntax {
            position: 0,
            message: "could not infer variable lengths".into(),
        })
    }

    /// The identity map `y=x` used by raw maps.
    pub fn identity(source: Signature, output: Signature) -> Result<Expression> {
        Expression::compile("y=x", &[source], output)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sources(&self) -> &[Signature] {
        &self.sources
    }

    pub fn output(&self) -> Signature {
        self.output
    }

    /// True if the program only copies its single source through.
    pub fn is_passthrough(&self) -> bool {
        self.sources.len() == 1
            && self.sources[0] == self.output
            && self.statements.len() == 1
            && self.statements[0].guard.is_none()
            && matches!(
                self.statements[0].value.op,
                Op::Source { slot: 0, history: 0, start: 0 }
            )
            && self.statements[0].value.len == self.output.len
            && matches!(self.statements[0].dest, Destination::Output { start: 0, .. })
    }
}

fn collect_variables(program: &Program) -> Vec<Variable> {
    let mut vars: Vec<Variable> = Vec::new();
    for stmt in &program.statements {
        if let Target::Variable { name, .. } = &stmt.target {
            if !vars.iter().any(|v| &v.name == name) {
                vars.push(Variable { name: name.clone(), ty: Type::Float64, len: 1, known: false });
            }
        }
    }
    vars
}

// ============================================================================
// Compiler
// ============================================================================

struct Compiler<'a> {
    sources: &'a [Signature],
    output: Signature,
    variables: Vec<Variable>,
    by_name: HashMap<String, usize>,
    /// Assigned by an earlier statement in program order.
    assigned: Vec<bool>,
    /// Read while its shape was still provisional.
    guessed: Vec<bool>,
    source_depth: Vec<usize>,
    output_depth: usize,
    variable_depth: Vec<usize>,
    retry: bool,
    position: usize,
}

impl<'a> Compiler<'a> {
    fn new(sources: &'a [Signature], output: Signature, variables: Vec<Variable>) -> Self {
        let by_name = variables.iter().enumerate().map(|(i, v)| (v.name.clone(), i)).collect();
        let n = variables.len();
        Self {
            sources,
            output,
            variables,
            by_name,
            assigned: vec![false; n],
            guessed: vec![false; n],
            source_depth: vec![0; sources.len()],
            output_depth: 0,
            variable_depth: vec![0; n],
            retry: false,
            position: 0,
        }
    }

    fn error(&self, position: usize, message: String) -> Error {
        Error::ExpressionSyntax { position, message }
    }

    fn compile_program(&mut self, program: &Program) -> Result<Vec<Statement>> {
        let mut out = Vec::with_capacity(program.statements.len());
        for stmt in &program.statements {
            self.position = stmt.position;
            out.push(self.compile_statement(stmt)?);
        }
        if !out.iter().any(|s| matches!(s.dest, Destination::Output { .. })) {
            return Err(self.error(0, "expression never assigns 'y'".into()));
        }
        Ok(out)
    }

    fn compile_statement(&mut self, stmt: &ast::Assignment) -> Result<Statement> {
        // An else-less conditional is only meaningful as a whole right-hand side.
        let (guard, value) = match &stmt.value {
            Expr::Conditional { cond, then, otherwise: None } => {
                (Some(self.compile_expr(cond)?), self.compile_expr(then)?)
            }
            other => (None, self.compile_expr(other)?),
        };

        let dest = match &stmt.target {
            Target::Output { slice } => {
                let (start, len) = match slice {
                    Some(s) => {
                        if s.end >= self.output.len {
                            return Err(self.error(stmt.position, format!(
                                "index {} out of range for 'y' of length {}", s.end, self.output.len
                            )));
                        }
                        check_fit(value.len, s.len(), false)?;
                        (s.start, s.len())
                    }
                    None => {
                        check_fit(value.len, self.output.len, true)?;
                        (0, self.output.len)
                    }
                };
                if slice.is_some() || guard.is_some() {
                    self.output_depth = self.output_depth.max(1);
                }
                Destination::Output { start, len }
            }
            Target::Variable { name, slice } => {
                let index = self.by_name[name.as_str()];
                let (start, len) = match slice {
                    Some(s) => {
                        if !self.variables[index].known {
                            return Err(self.error(stmt.position, format!(
                                "variable '{name}' must be assigned whole before indexing"
                            )));
                        }
                        let var_len = self.variables[index].len;
                        if s.end >= var_len {
                            return Err(self.error(stmt.position, format!(
                                "index {} out of range for '{name}' of length {var_len}", s.end
                            )));
                        }
                        check_fit(value.len, s.len(), false)?;
                        (s.start, s.len())
                    }
                    None => {
                        let var = &mut self.variables[index];
                        if !var.known {
                            if self.guessed[index] && (var.len != value.len || var.ty != value.ty) {
                                self.retry = true;
                            }
                            var.ty = value.ty;
                            var.len = value.len;
                            var.known = true;
                        }
                        check_fit(value.len, var.len, false)?;
                        (0, var.len)
                    }
                };
                if slice.is_some() || guard.is_some() {
                    self.variable_depth[index] = self.variable_depth[index].max(1);
                }
                self.assigned[index] = true;
                Destination::Variable { index, start, len }
            }
        };

        if let Some(g) = &guard {
            let len = match dest {
                Destination::Output { len, .. } | Destination::Variable { len, .. } => len,
            };
            check_fit(g.len, len, false)?;
        }

        Ok(Statement { dest, value, guard })
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<Node> {
        match expr {
            Expr::Literal(Literal::Int(v)) => {
                let ty = if i32::try_from(*v).is_ok() { Type::Int32 } else { Type::Float64 };
                Ok(Node { ty, len: 1, op: Op::Const(smallvec![*v as f64]) })
            }
            Expr::Literal(Literal::Float(v)) => {
                Ok(Node { ty: Type::Float32, len: 1, op: Op::Const(smallvec![*v]) })
            }
            Expr::Reference(r) => self.compile_reference(r),
            Expr::Vector(items) => {
                let nodes = items.iter().map(|e| self.compile_expr(e)).collect::<Result<Vec<_>>>()?;
                let len = nodes.iter().map(|n| n.len).sum();
                let ty = nodes.iter().map(|n| n.ty).fold(Type::Int32, Type::promote);
                Ok(Node { ty, len, op: Op::Vector(nodes) })
            }
            Expr::Unary { op, expr } => {
                let arg = self.compile_expr(expr)?;
                let ty = match op {
                    UnaryOp::Negate => arg.ty,
                    UnaryOp::Not => Type::Int32,
                };
                Ok(Node { ty, len: arg.len, op: Op::Unary { op: *op, arg: Box::new(arg) } })
            }
            Expr::Binary { left, op, right } => {
                let left = self.compile_expr(left)?;
                let right = self.compile_expr(right)?;
                let len = broadcast(left.len, right.len)?;
                let ty = if op.is_bitwise() {
                    for side in [&left, &right] {
                        if side.ty != Type::Int32 {
                            return Err(Error::TypeMismatch {
                                expected: Type::Int32.name().into(),
                                got: side.ty.name().into(),
                            });
                        }
                    }
                    Type::Int32
                } else if op.is_boolean() {
                    Type::Int32
                } else {
                    left.ty.promote(right.ty)
                };
                Ok(Node { ty, len, op: Op::Binary { op: *op, left: Box::new(left), right: Box::new(right) } })
            }
            Expr::Conditional { cond, then, otherwise: Some(otherwise) } => {
                let cond = self.compile_expr(cond)?;
                let then = self.compile_expr(then)?;
                let otherwise = self.compile_expr(otherwise)?;
                let len = broadcast(broadcast(cond.len, then.len)?, otherwise.len)?;
                let ty = then.ty.promote(otherwise.ty);
                Ok(Node {
                    ty,
                    len,
                    op: Op::Conditional {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                })
            }
            Expr::Conditional { otherwise: None, .. } => Err(self.error(
                self.position,
                "conditional without ':' must be the whole right-hand side".into(),
            )),
            Expr::Call { name, args, position } => self.compile_call(name, args, *position),
        }
    }

    fn compile_reference(&mut self, r: &ast::Reference) -> Result<Node> {
        let (sig, op) = if r.name == "y" {
            if r.history == 0 {
                return Err(self.error(r.position, "'y' can only be read from its history, e.g. y{-1}".into()));
            }
            self.output_depth = self.output_depth.max(r.history);
            (self.output, Op::Output { history: r.history, start: 0 })
        } else if super::parser::is_source_name(&r.name) {
            let slot = match &r.name[1..] {
                "" => 0,
                digits => digits.parse::<usize>().unwrap_or(usize::MAX),
            };
            let Some(sig) = self.sources.get(slot).copied() else {
                return Err(self.error(r.position, format!(
                    "'{}' does not name a source (map has {})", r.name, self.sources.len()
                )));
            };
            self.source_depth[slot] = self.source_depth[slot].max(r.history);
            (sig, Op::Source { slot, history: r.history, start: 0 })
        } else {
            let Some(&index) = self.by_name.get(r.name.as_str()) else {
                return Err(self.error(r.position, format!("unknown variable '{}'", r.name)));
            };
            if r.history == 0 && !self.assigned[index] {
                return Err(self.error(r.position, format!("variable '{}' used before assignment", r.name)));
            }
            if !self.variables[index].known {
                self.guessed[index] = true;
            }
            self.variable_depth[index] = self.variable_depth[index].max(r.history);
            let var = &self.variables[index];
            (Signature::new(var.ty, var.len), Op::Variable { index, history: r.history, start: 0 })
        };

        let (start, len) = match r.slice {
            Some(s) if s.end >= sig.len => {
                return Err(self.error(r.position, format!(
                    "index {} out of range for '{}' of length {}", s.end, r.name, sig.len
                )));
            }
            Some(s) => (s.start, s.len()),
            None => (0, sig.len),
        };
        let op = match op {
            Op::Output { history, .. } => Op::Output { history, start },
            Op::Source { slot, history, .. } => Op::Source { slot, history, start },
            Op::Variable { index, history, .. } => Op::Variable { index, history, start },
            other => other,
        };
        Ok(Node { ty: sig.ty, len, op })
    }

    fn compile_call(&mut self, name: &str, args: &[Expr], position: usize) -> Result<Node> {
        let Some(function) = Function::lookup(name) else {
            return Err(self.error(position, format!("unknown function '{name}'")));
        };
        if args.len() != function.arity() {
            return Err(self.error(position, format!(
                "'{name}' takes {} argument(s), got {}", function.arity(), args.len()
            )));
        }
        let mut nodes = args.iter().map(|e| self.compile_expr(e)).collect::<Result<Vec<_>>>()?;

        match function {
            Function::Constant(v) => Ok(Node { ty: Type::Float64, len: 1, op: Op::Const(smallvec![v]) }),
            Function::Unary(f) => {
                let arg = nodes.remove(0);
                Ok(Node { ty: f.result_type(arg.ty), len: arg.len, op: Op::Call1 { f, arg: Box::new(arg) } })
            }
            Function::Binary(f) => {
                let b = nodes.remove(1);
                let a = nodes.remove(0);
                let len = broadcast(a.len, b.len)?;
                Ok(Node { ty: f.result_type(a.ty, b.ty), len, op: Op::Call2 { f, a: Box::new(a), b: Box::new(b) } })
            }
            Function::Reduce(f) => {
                let arg = nodes.remove(0);
                Ok(Node { ty: f.result_type(arg.ty), len: 1, op: Op::Reduce { f, arg: Box::new(arg) } })
            }
            Function::Linear => {
                let mut len = 1;
                for n in &nodes {
                    len = broadcast(len, n.len)?;
                }
                let ty = nodes.iter().map(|n| n.ty).fold(Type::Float32, Type::promote);
                Ok(Node { ty, len, op: Op::Linear { args: nodes } })
            }
            Function::Uniform => {
                let arg = nodes.remove(0);
                Ok(Node { ty: arg.ty.promote(Type::Float32), len: arg.len, op: Op::Uniform { arg: Box::new(arg) } })
            }
        }
    }
}

/// Length of an element-wise combination: equal lengths, or a scalar
/// broadcast against a vector.
fn broadcast(a: usize, b: usize) -> Result<usize> {
    match (a, b) {
        _ if a == b => Ok(a),
        (1, _) => Ok(b),
        (_, 1) => Ok(a),
        _ => Err(Error::LengthMismatch { expected: a, got: b }),
    }
}

/// Can a value of length `got` be stored into `expected` elements? Scalars
/// broadcast; a whole-`y` assignment may also truncate a vector into a
/// scalar destination.
fn check_fit(got: usize, expected: usize, truncate_to_scalar: bool) -> Result<()> {
    if got == expected || got == 1 || (truncate_to_scalar && expected == 1) {
        Ok(())
    } else {
        Err(Error::LengthMismatch { expected, got })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32x(len: usize) -> Signature {
        Signature::new(Type::Float32, len)
    }

    #[test]
    fn test_compile_linear() {
        let e = Expression::compile("y=linear(x,0,100,0,3)", &[f32x(1)], f32x(1)).unwrap();
        assert_eq!(e.statements.len(), 1);
        assert_eq!(e.statements[0].value.ty, Type::Float32);
    }

    #[test]
    fn test_length_mismatch_neither_scalar() {
        let err = Expression::compile("y=x", &[f32x(3)], f32x(2)).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { expected: 2, got: 3 }));
        let err = Expression::compile("y=x+[1,2]", &[f32x(3)], f32x(3)).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { .. }));
    }

    #[test]
    fn test_scalar_broadcast_and_truncation() {
        assert!(Expression::compile("y=x", &[f32x(1)], f32x(4)).is_ok());
        assert!(Expression::compile("y=x", &[f32x(4)], f32x(1)).is_ok());
        assert!(Expression::compile("y=x*[1,2,3]", &[f32x(1)], f32x(3)).is_ok());
    }

    #[test]
    fn test_bitwise_requires_ints() {
        let ints = Signature::new(Type::Int32, 1);
        assert!(Expression::compile("y=x & 3", &[ints], ints).is_ok());
        let err = Expression::compile("y=x & 3", &[f32x(1)], ints).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_missing_source_slot() {
        let err = Expression::compile("y=x0+x1", &[f32x(1)], f32x(1)).unwrap_err();
        assert!(matches!(err, Error::ExpressionSyntax { position: 5, .. }));
        assert!(Expression::compile("y=x0+x1", &[f32x(1), f32x(1)], f32x(1)).is_ok());
    }

    #[test]
    fn test_variables() {
        let e = Expression::compile("ema=ema{-1}*0.9+x*0.1; y=ema", &[f32x(2)], f32x(2)).unwrap();
        assert_eq!(e.variables[0].len, 2);
        assert_eq!(e.variable_depth[0], 1);
        let err = Expression::compile("y=a; a=x", &[f32x(1)], f32x(1)).unwrap_err();
        assert!(matches!(err, Error::ExpressionSyntax { .. }));
    }

    #[test]
    fn test_history_depths() {
        let e = Expression::compile("y=x-x{-3}+y{-2}", &[f32x(1)], f32x(1)).unwrap();
        assert_eq!(e.source_depth, vec![3]);
        assert_eq!(e.output_depth, 2);
    }

    #[test]
    fn test_index_out_of_range() {
        assert!(Expression::compile("y=x[2]", &[f32x(2)], f32x(1)).is_err());
        assert!(Expression::compile("y[2]=x", &[f32x(1)], f32x(2)).is_err());
        assert!(Expression::compile("y[1]=x[0]", &[f32x(2)], f32x(2)).is_ok());
    }

    #[test]
    fn test_must_assign_output() {
        assert!(Expression::compile("a=x", &[f32x(1)], f32x(1)).is_err());
    }

    #[test]
    fn test_function_errors() {
        assert!(Expression::compile("y=nosuch(x)", &[f32x(1)], f32x(1)).is_err());
        assert!(Expression::compile("y=pow(x)", &[f32x(1)], f32x(1)).is_err());
        assert!(Expression::compile("y=1+(x>0?x)", &[f32x(1)], f32x(1)).is_err());
    }

    #[test]
    fn test_passthrough_detection() {
        assert!(Expression::identity(f32x(2), f32x(2)).unwrap().is_passthrough());
        assert!(!Expression::identity(f32x(1), Signature::new(Type::Int32, 1)).unwrap().is_passthrough());
        assert!(!Expression::compile("y=x*1", &[f32x(1)], f32x(1)).unwrap().is_passthrough());
    }
}
