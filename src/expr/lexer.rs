//! Expression lexer: tokenizes a map expression string.

use crate::{Error, Result};

/// A token from the lexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub text: String,
}

/// Source span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Literals
    Integer, Float,

    // Names: variables (`x`, `y`, `x1`, user variables) and functions
    Identifier,

    // Punctuation
    LParen, RParen, LBracket, RBracket, LBrace, RBrace,
    Comma, Colon, Semicolon, Question,

    // Operators
    Assign,     // =
    Eq,         // ==
    Neq,        // !=
    Not,        // !
    Lt, Lte, Gt, Gte,
    Shl,        // <<
    Shr,        // >>
    Plus, Minus, Star, Slash, Percent,
    Amp,        // &
    AmpAmp,     // &&
    Pipe,       // |
    PipePipe,   // ||
    Caret,      // ^ (bitwise xor)

    Eof,
}

/// Tokenize an expression string.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => { chars.next(); }

            // Numbers: 12, 1.5, .5, 1e-3, 2.
            c if c.is_ascii_digit()
                || (c == '.' && matches!(chars.clone().nth(1), Some((_, d)) if d.is_ascii_digit())) =>
            {
                let start = pos;
                let mut num = String::new();
                let mut is_float = false;
                let mut seen_exp = false;
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(c);
                        chars.next();
                    } else if c == '.' && !is_float && !seen_exp {
                        is_float = true;
                        num.push(c);
                        chars.next();
                    } else if (c == 'e' || c == 'E') && !seen_exp {
                        // Only an exponent if digits (optionally signed) follow.
                        let mut look = chars.clone();
                        look.next();
                        let next = look.peek().map(|&(_, c)| c);
                        let exp_ok = match next {
                            Some(d) if d.is_ascii_digit() => true,
                            Some('+') | Some('-') => {
                                look.next();
                                matches!(look.peek(), Some(&(_, d)) if d.is_ascii_digit())
                            }
                            _ => false,
                        };
                        if !exp_ok {
                            break;
                        }
                        seen_exp = true;
                        is_float = true;
                        num.push(c);
                        chars.next();
                        if let Some(&(_, sign)) = chars.peek() {
                            if sign == '+' || sign == '-' {
                                num.push(sign);
                                chars.next();
                            }
                        }
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: if is_float { TokenKind::Float } else { TokenKind::Integer },
                    span: Span { start, end: start + num.len() },
                    text: num,
                });
            }

            // Identifiers
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Identifier,
                    span: Span { start, end: start + ident.len() },
                    text: ident,
                });
            }

            // Punctuation
            '(' => { chars.next(); tokens.push(punct(TokenKind::LParen, pos, "(")); }
            ')' => { chars.next(); tokens.push(punct(TokenKind::RParen, pos, ")")); }
            '[' => { chars.next(); tokens.push(punct(TokenKind::LBracket, pos, "[")); }
            ']' => { chars.next(); tokens.push(punct(TokenKind::RBracket, pos, "]")); }
            '{' => { chars.next(); tokens.push(punct(TokenKind::LBrace, pos, "{")); }
            '}' => { chars.next(); tokens.push(punct(TokenKind::RBrace, pos, "}")); }
            ',' => { chars.next(); tokens.push(punct(TokenKind::Comma, pos, ",")); }
            ':' => { chars.next(); tokens.push(punct(TokenKind::Colon, pos, ":")); }
            ';' => { chars.next(); tokens.push(punct(TokenKind::Semicolon, pos, ";")); }
            '?' => { chars.next(); tokens.push(punct(TokenKind::Question, pos, "?")); }
            '+' => { chars.next(); tokens.push(punct(TokenKind::Plus, pos, "+")); }
            '-' => { chars.next(); tokens.push(punct(TokenKind::Minus, pos, "-")); }
            '*' => { chars.next(); tokens.push(punct(TokenKind::Star, pos, "*")); }
            '/' => { chars.next(); tokens.push(punct(TokenKind::Slash, pos, "/")); }
            '%' => { chars.next(); tokens.push(punct(TokenKind::Percent, pos, "%")); }
            '^' => { chars.next(); tokens.push(punct(TokenKind::Caret, pos, "^")); }
            '=' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '='))) {
                    chars.next();
                    tokens.push(punct(TokenKind::Eq, pos, "=="));
                } else {
                    tokens.push(punct(TokenKind::Assign, pos, "="));
                }
            }
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '='))) {
                    chars.next();
                    tokens.push(punct(TokenKind::Neq, pos, "!="));
                } else {
                    tokens.push(punct(TokenKind::Not, pos, "!"));
                }
            }
            '<' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '='))) {
                    chars.next();
                    tokens.push(punct(TokenKind::Lte, pos, "<="));
                } else if matches!(chars.peek(), Some(&(_, '<'))) {
                    chars.next();
                    tokens.push(punct(TokenKind::Shl, pos, "<<"));
                } else {
                    tokens.push(punct(TokenKind::Lt, pos, "<"));
                }
            }
            '>' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '='))) {
                    chars.next();
                    tokens.push(punct(TokenKind::Gte, pos, ">="));
                } else if matches!(chars.peek(), Some(&(_, '>'))) {
                    chars.next();
                    tokens.push(punct(TokenKind::Shr, pos, ">>"));
                } else {
                    tokens.push(punct(TokenKind::Gt, pos, ">"));
                }
            }
            '&' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '&'))) {
                    chars.next();
                    tokens.push(punct(TokenKind::AmpAmp, pos, "&&"));
                } else {
                    tokens.push(punct(TokenKind::Amp, pos, "&"));
                }
            }
            '|' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '|'))) {
                    chars.next();
                    tokens.push(punct(TokenKind::PipePipe, pos, "||"));
                } else {
                    tokens.push(punct(TokenKind::Pipe, pos, "|"));
                }
            }

            other => {
                return Err(Error::ExpressionSyntax {
                    position: pos,
                    message: format!("Unexpected character: '{other}'"),
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span { start: input.len(), end: input.len() },
        text: String::new(),
    });

    Ok(tokens)
}

fn punct(kind: TokenKind, pos: usize, text: &str) -> Token {
    Token {
        kind,
        span: Span { start: pos, end: pos + text.len() },
        text: text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(kinds("y=x*2"), vec![
            TokenKind::Identifier, // y
            TokenKind::Assign,
            TokenKind::Identifier, // x
            TokenKind::Star,
            TokenKind::Integer,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn test_history_and_index() {
        assert_eq!(kinds("x{-1}[0]"), vec![
            TokenKind::Identifier,
            TokenKind::LBrace,
            TokenKind::Minus,
            TokenKind::Integer,
            TokenKind::RBrace,
            TokenKind::LBracket,
            TokenKind::Integer,
            TokenKind::RBracket,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(kinds("a==b!=c<=d>=e<<f>>g&&h||i"), vec![
            TokenKind::Identifier, TokenKind::Eq,
            TokenKind::Identifier, TokenKind::Neq,
            TokenKind::Identifier, TokenKind::Lte,
            TokenKind::Identifier, TokenKind::Gte,
            TokenKind::Identifier, TokenKind::Shl,
            TokenKind::Identifier, TokenKind::Shr,
            TokenKind::Identifier, TokenKind::AmpAmp,
            TokenKind::Identifier, TokenKind::PipePipe,
            TokenKind::Identifier, TokenKind::Eof,
        ]);
    }

    #[test]
    fn test_number_forms() {
        let tokens = tokenize("1 2.5 .5 1e3 2.5e-2 3.").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[2].text, ".5");
        assert_eq!(tokens[3].kind, TokenKind::Float);
        assert_eq!(tokens[4].text, "2.5e-2");
        assert_eq!(tokens[5].text, "3.");
    }

    #[test]
    fn test_exponent_needs_digits() {
        // `2e` is a number followed by identifier `e`
        let tokens = tokenize("2e").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("y = x # 2").unwrap_err();
        assert!(matches!(err, Error::ExpressionSyntax { position: 6, .. }));
    }
}
