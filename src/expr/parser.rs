//! Expression recursive descent parser.
//!
//! Parses token streams into a [`Program`]. Supports:
//! - `;`-separated assignments to `y`, `y[i]`, `y[i:j]` and user variables
//! - C-like operator precedence, including bitwise and logical operators
//! - ternary `c ? a : b` and else-less `c ? a`
//! - history `x{-n}`, element index `x[i]` and slices `x[i:j]`
//! - function calls and vector literals

use crate::{Error, Result};
use super::ast::*;
use super::lexer::{Token, TokenKind};

/// Deepest history reference accepted (`x{-100}`).
pub const MAX_HISTORY: usize = 100;

/// Parser state: wraps a token slice with cursor.
struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&Token> {
        let tok = self.peek();
        if tok.kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error(format!("Expected {:?}, got {:?} '{}'", kind, tok.kind, tok.text)))
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, msg: String) -> Error {
        Error::ExpressionSyntax {
            position: self.peek().span.start,
            message: msg,
        }
    }

    fn expect_index(&mut self) -> Result<usize> {
        let tok = self.expect(TokenKind::Integer)?;
        let position = tok.span.start;
        tok.text.parse::<usize>().map_err(|_| Error::ExpressionSyntax {
            position,
            message: "Invalid index".into(),
        })
    }
}

/// Parse a complete expression program from tokens.
pub fn parse_program(tokens: &[Token]) -> Result<Program> {
    let mut p = Parser::new(tokens);
    let mut statements = Vec::new();

    loop {
        // Allow stray and trailing semicolons
        while p.eat(TokenKind::Semicolon) {}
        if p.at(TokenKind::Eof) {
            break;
        }
        statements.push(parse_assignment(&mut p)?);
        if !p.at(TokenKind::Eof) && !p.at(TokenKind::Semicolon) {
            return Err(p.error(format!("Unexpected token after statement: {:?} '{}'", p.peek_kind(), p.peek().text)));
        }
    }

    if statements.is_empty() {
        return Err(p.error("Empty expression".into()));
    }
    Ok(Program { statements })
}

// ============================================================================
// Statements
// ============================================================================

fn parse_assignment(p: &mut Parser) -> Result<Assignment> {
    let tok = p.expect(TokenKind::Identifier)?.clone();
    let slice = if p.at(TokenKind::LBracket) { Some(parse_slice(p)?) } else { None };

    let target = if tok.text == "y" {
        Target::Output { slice }
    } else if is_source_name(&tok.text) {
        return Err(Error::ExpressionSyntax {
            position: tok.span.start,
            message: format!("Cannot assign to source '{}'", tok.text),
        });
    } else {
        Target::Variable { name: tok.text.clone(), slice }
    };

    if !p.at(TokenKind::Assign) {
        return Err(p.error(format!("Expected '=' after '{}'", tok.text)));
    }
    p.advance();
    let value = parse_expr(p)?;
    Ok(Assignment { target, value, position: tok.span.start })
}

/// `x`, `x0` .. `x7` style source names (any `x` followed by digits).
pub(crate) fn is_source_name(name: &str) -> bool {
    name.strip_prefix('x')
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

fn parse_slice(p: &mut Parser) -> Result<Slice> {
    p.expect(TokenKind::LBracket)?;
    let start = p.expect_index()?;
    let end = if p.eat(TokenKind::Colon) { p.expect_index()? } else { start };
    if end < start {
        return Err(p.error(format!("Empty slice [{start}:{end}]")));
    }
    p.expect(TokenKind::RBracket)?;
    Ok(Slice { start, end })
}

fn parse_history(p: &mut Parser) -> Result<usize> {
    p.expect(TokenKind::LBrace)?;
    let negative = p.eat(TokenKind::Minus);
    let depth = p.expect_index()?;
    if !negative && depth != 0 {
        return Err(p.error("History offsets must be zero or negative".into()));
    }
    if depth > MAX_HISTORY {
        return Err(p.error(format!("History depth {depth} exceeds {MAX_HISTORY}")));
    }
    p.expect(TokenKind::RBrace)?;
    Ok(depth)
}

// ============================================================================
// Expressions, lowest precedence first
// ============================================================================

fn parse_expr(p: &mut Parser) -> Result<Expr> {
    parse_conditional(p)
}

fn parse_conditional(p: &mut Parser) -> Result<Expr> {
    let cond = parse_or_expr(p)?;
    if !p.eat(TokenKind::Question) {
        return Ok(cond);
    }
    let then = parse_conditional(p)?;
    let otherwise = if p.eat(TokenKind::Colon) {
        Some(Box::new(parse_conditional(p)?))
    } else {
        None
    };
    Ok(Expr::Conditional { cond: Box::new(cond), then: Box::new(then), otherwise })
}

/// One left-associative precedence level.
fn parse_binary_level(
    p: &mut Parser,
    next: fn(&mut Parser) -> Result<Expr>,
    ops: &[(TokenKind, BinaryOp)],
) -> Result<Expr> {
    let mut left = next(p)?;
    loop {
        let Some(op) = ops.iter().find(|(kind, _)| p.at(*kind)).map(|&(_, op)| op) else {
            break;
        };
        p.advance();
        let right = next(p)?;
        left = Expr::Binary { left: Box::new(left), op, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_or_expr(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_and_expr, &[(TokenKind::PipePipe, BinaryOp::Or)])
}

fn parse_and_expr(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_bitor, &[(TokenKind::AmpAmp, BinaryOp::And)])
}

fn parse_bitor(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_bitxor, &[(TokenKind::Pipe, BinaryOp::BitOr)])
}

fn parse_bitxor(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_bitand, &[(TokenKind::Caret, BinaryOp::BitXor)])
}

fn parse_bitand(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_equality, &[(TokenKind::Amp, BinaryOp::BitAnd)])
}

fn parse_equality(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_comparison, &[
        (TokenKind::Eq, BinaryOp::Eq),
        (TokenKind::Neq, BinaryOp::Neq),
    ])
}

fn parse_comparison(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_shift, &[
        (TokenKind::Lt, BinaryOp::Lt),
        (TokenKind::Lte, BinaryOp::Lte),
        (TokenKind::Gt, BinaryOp::Gt),
        (TokenKind::Gte, BinaryOp::Gte),
    ])
}

fn parse_shift(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_addition, &[
        (TokenKind::Shl, BinaryOp::Shl),
        (TokenKind::Shr, BinaryOp::Shr),
    ])
}

fn parse_addition(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_multiplication, &[
        (TokenKind::Plus, BinaryOp::Add),
        (TokenKind::Minus, BinaryOp::Sub),
    ])
}

fn parse_multiplication(p: &mut Parser) -> Result<Expr> {
    parse_binary_level(p, parse_unary, &[
        (TokenKind::Star, BinaryOp::Mul),
        (TokenKind::Slash, BinaryOp::Div),
        (TokenKind::Percent, BinaryOp::Mod),
    ])
}

fn parse_unary(p: &mut Parser) -> Result<Expr> {
    if p.eat(TokenKind::Minus) {
        let expr = parse_unary(p)?;
        // Fold negative literals so `-1` stays a constant
        return Ok(match expr {
            Expr::Literal(Literal::Int(v)) => Expr::Literal(Literal::Int(-v)),
            Expr::Literal(Literal::Float(v)) => Expr::Literal(Literal::Float(-v)),
            other => Expr::Unary { op: UnaryOp::Negate, expr: Box::new(other) },
        });
    }
    if p.eat(TokenKind::Not) {
        let expr = parse_unary(p)?;
        return Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(expr) });
    }
    if p.eat(TokenKind::Plus) {
        return parse_unary(p);
    }
    parse_primary(p)
}

fn parse_primary(p: &mut Parser) -> Result<Expr> {
    match p.peek_kind() {
        TokenKind::Integer => {
            let tok = p.advance();
            let val = tok.text.parse::<i64>().map_err(|_| {
                Error::ExpressionSyntax { position: tok.span.start, message: "Invalid integer".into() }
            })?;
            Ok(Expr::Literal(Literal::Int(val)))
        }
        TokenKind::Float => {
            let tok = p.advance();
            let val = tok.text.parse::<f64>().map_err(|_| {
                Error::ExpressionSyntax { position: tok.span.start, message: "Invalid float".into() }
            })?;
            Ok(Expr::Literal(Literal::Float(val)))
        }

        // Parenthesized expression
        TokenKind::LParen => {
            p.advance();
            let expr = parse_expr(p)?;
            p.expect(TokenKind::RParen)?;
            Ok(expr)
        }

        // Vector literal
        TokenKind::LBracket => {
            p.advance();
            let mut items = vec![parse_expr(p)?];
            while p.eat(TokenKind::Comma) {
                items.push(parse_expr(p)?);
            }
            p.expect(TokenKind::RBracket)?;
            Ok(Expr::Vector(items))
        }

        // Identifier: function call or variable reference
        TokenKind::Identifier => {
            let tok = p.advance().clone();
            if p.at(TokenKind::LParen) {
                p.advance();
                let mut args = Vec::new();
                if !p.at(TokenKind::RParen) {
                    args.push(parse_expr(p)?);
                    while p.eat(TokenKind::Comma) {
                        args.push(parse_expr(p)?);
                    }
                }
                p.expect(TokenKind::RParen)?;
                return Ok(Expr::Call { name: tok.text, args, position: tok.span.start });
            }

            // Suffixes in either order: x{-1}[0] or x[0]{-1}
            let mut history = 0;
            let mut slice = None;
            let mut seen_history = false;
            loop {
                if p.at(TokenKind::LBrace) && !seen_history {
                    history = parse_history(p)?;
                    seen_history = true;
                } else if p.at(TokenKind::LBracket) && slice.is_none() {
                    slice = Some(parse_slice(p)?);
                } else {
                    break;
                }
            }
            Ok(Expr::Reference(Reference { name: tok.text, history, slice, position: tok.span.start }))
        }

        TokenKind::Eof => Err(p.error("Unexpected end of expression".into())),
        _ => Err(p.error(format!("Unexpected token in expression: {:?} '{}'", p.peek_kind(), p.peek().text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::tokenize;

    fn parse(src: &str) -> Result<Program> {
        let tokens = tokenize(src)?;
        parse_program(&tokens)
    }

    fn single(src: &str) -> Expr {
        let mut prog = parse(src).unwrap();
        assert_eq!(prog.statements.len(), 1);
        prog.statements.remove(0).value
    }

    #[test]
    fn test_simple_assignment() {
        let prog = parse("y=x*2").unwrap();
        assert_eq!(prog.statements[0].target, Target::Output { slice: None });
        assert!(matches!(
            prog.statements[0].value,
            Expr::Binary { op: BinaryOp::Mul, .. }
        ));
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        match single("y = 1 + 2 * 3") {
            Expr::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        // a & b == c parses as a & (b == c)
        match single("y = x & 1 == 1") {
            Expr::Binary { op: BinaryOp::BitAnd, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Eq, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_left_associative_subtraction() {
        match single("y = 10 - 4 - 3") {
            Expr::Binary { op: BinaryOp::Sub, left, .. } => {
                assert!(matches!(*left, Expr::Binary { op: BinaryOp::Sub, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_history_and_slice() {
        match single("y = x1{-2}[0:1]") {
            Expr::Reference(r) => {
                assert_eq!(r.name, "x1");
                assert_eq!(r.history, 2);
                assert_eq!(r.slice, Some(Slice { start: 0, end: 1 }));
            }
            other => panic!("unexpected {other:?}"),
        }
        match single("y = x[1]{-1}") {
            Expr::Reference(r) => {
                assert_eq!(r.history, 1);
                assert_eq!(r.slice, Some(Slice { start: 1, end: 1 }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_history_limit() {
        assert!(parse("y = x{-100}").is_ok());
        assert!(matches!(parse("y = x{-101}"), Err(Error::ExpressionSyntax { .. })));
        assert!(parse("y = x{2}").is_err());
    }

    #[test]
    fn test_conditionals() {
        assert!(matches!(
            single("y = x > 0 ? x : -x"),
            Expr::Conditional { otherwise: Some(_), .. }
        ));
        assert!(matches!(
            single("y = x > 0 ? x"),
            Expr::Conditional { otherwise: None, .. }
        ));
    }

    #[test]
    fn test_multiple_statements() {
        let prog = parse("ema = ema{-1} * 0.9 + x * 0.1; y = ema;").unwrap();
        assert_eq!(prog.statements.len(), 2);
        assert_eq!(
            prog.statements[0].target,
            Target::Variable { name: "ema".into(), slice: None }
        );
    }

    #[test]
    fn test_element_target() {
        let prog = parse("y[1] = x").unwrap();
        assert_eq!(
            prog.statements[0].target,
            Target::Output { slice: Some(Slice { start: 1, end: 1 }) }
        );
    }

    #[test]
    fn test_negative_literal_folds() {
        assert_eq!(single("y = -3"), Expr::Literal(Literal::Int(-3)));
    }

    #[test]
    fn test_call_and_vector() {
        match single("y = linear([x, 1], 0, 100, 0, 3)") {
            Expr::Call { name, args, .. } => {
                assert_eq!(name, "linear");
                assert_eq!(args.len(), 5);
                assert!(matches!(args[0], Expr::Vector(ref v) if v.len() == 2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("y = "), Err(Error::ExpressionSyntax { .. })));
        assert!(matches!(parse("y = (x"), Err(Error::ExpressionSyntax { .. })));
        assert!(matches!(parse("x * 2"), Err(Error::ExpressionSyntax { .. })));
        assert!(matches!(parse("x = 2"), Err(Error::ExpressionSyntax { .. })));
        assert!(matches!(parse(""), Err(Error::ExpressionSyntax { .. })));
        assert!(matches!(parse("y = x x"), Err(Error::ExpressionSyntax { .. })));
    }

    #[test]
    fn test_error_position() {
        match parse("y = x +") {
            Err(Error::ExpressionSyntax { position, .. }) => assert_eq!(position, 7),
            other => panic!("unexpected {other:?}"),
        }
    }
}
