//! Expression AST.
//!
//! Pure data produced by the parser. Names are still strings here; the
//! compiler resolves them against the map's source and destination
//! signatures.

/// A complete expression: one or more `;`-separated assignments.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Assignment>,
}

/// `target = value`
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: Target,
    pub value: Expr,
    /// Byte offset of the target, for error reporting.
    pub position: usize,
}

/// Left-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// `y`, `y[i]` or `y[i:j]`
    Output { slice: Option<Slice> },
    /// A user variable such as `ema`
    Variable { name: String, slice: Option<Slice> },
}

/// Element selection: `[i]` is `Slice { start: i, end: i }`, `[i:j]` is
/// inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: usize,
    pub end: usize,
}

impl Slice {
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Literal(Literal),
    /// Variable reference: `x`, `x1{-2}`, `y{-1}[0]`, `ema`
    Reference(Reference),
    /// Vector literal: `[x, 1, 2]` (concatenation of its elements)
    Vector(Vec<Expr>),
    /// Unary operation: `-x`, `!x`
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// Binary operation: `a + b`, `a && b`
    Binary { left: Box<Expr>, op: BinaryOp, right: Box<Expr> },
    /// `cond ? then : otherwise`; `otherwise` is absent for `cond ? then`
    Conditional { cond: Box<Expr>, then: Box<Expr>, otherwise: Option<Box<Expr>> },
    /// Function call: `linear(x, 0, 100, 0, 3)`
    Call { name: String, args: Vec<Expr>, position: usize },
}

/// Literal values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

/// A named vector with optional history offset and element selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub name: String,
    /// Samples back in time; 0 is the current value.
    pub history: usize,
    pub slice: Option<Slice>,
    pub position: usize,
}

/// Binary operators, lowest to highest precedence group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or, And,
    BitOr, BitXor, BitAnd,
    Eq, Neq,
    Lt, Lte, Gt, Gte,
    Shl, Shr,
    Add, Sub,
    Mul, Div, Mod,
}

impl BinaryOp {
    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::BitAnd | BinaryOp::Shl | BinaryOp::Shr)
    }

    /// Comparison and logical operators yield 0/1 integers.
    pub fn is_boolean(self) -> bool {
        matches!(
            self,
            BinaryOp::Or | BinaryOp::And | BinaryOp::Eq | BinaryOp::Neq
                | BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}
