//! # Map Expressions
//!
//! A small C-like language for transforming source vectors into a
//! destination vector, e.g. `y=linear(x,0,100,0,3)` or
//! `ema=ema{-1}*0.9+x*0.1; y=ema`.
//!
//! Text is tokenized, parsed into an [`ast::Program`], then compiled
//! against concrete source/destination signatures into an [`Expression`].
//! Evaluation keeps its history in a per-instance [`EvalState`].

pub mod ast;
pub mod compile;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;

use smallvec::SmallVec;

use crate::Result;

pub use compile::{Expression, Signature};
pub use eval::{EvalState, History};

/// Scratch vector used during evaluation.
pub type Vector = SmallVec<[f64; 8]>;

/// Parse an expression string into an AST without resolving names.
pub fn parse(text: &str) -> Result<ast::Program> {
    let tokens = lexer::tokenize(text)?;
    parser::parse_program(&tokens)
}

/// Check that `text` is syntactically valid.
pub fn check_syntax(text: &str) -> Result<()> {
    parse(text).map(|_| ())
}
