//! Subscription expression engine.
//!
//! The router only needs two things from an expression subsystem: turn source
//! text into a filter (or a Nack-able error) and evaluate that filter against
//! a notification. [`ExpressionEngine`] and [`Filter`] are that boundary.
//!
//! [`BasicExpressions`] is a small engine covering the common subset:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | "true" | "false"
//!          | "require" "(" name ")"
//!          | name ( "==" | "!=" ) literal
//! literal := integer | real | "string" | 'string'
//! ```
//!
//! A comparison against a missing attribute or a value of another type is
//! false for both `==` and `!=`.
//!
//! Parentheses and `!` may nest at most [`MAX_NESTING`] levels deep; deeper
//! input is a syntax error. `&&` and `||` chains are stored flat, so their
//! length does not add depth.

use std::{collections::BTreeSet, fmt, sync::Arc};

use elvin_proto::{NackCode, Notification, Value};
use thiserror::Error;

/// Deepest nesting of parentheses and `!` the parser accepts.
pub const MAX_NESTING: usize = 64;

/// A compiled subscription filter.
pub trait Filter: Send + Sync + fmt::Debug {
    /// True when the notification matches.
    fn evaluate(&self, notification: &Notification) -> bool;

    /// Attribute names the filter refers to, used to match quenches.
    fn attribute_names(&self) -> BTreeSet<String>;
}

/// Compiles expression source text into filters.
pub trait ExpressionEngine: Send + Sync + 'static {
    /// Parse `expression`.
    fn parse(&self, expression: &str) -> Result<Arc<dyn Filter>, ExpressionError>;
}

/// Why an expression was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// Nothing but whitespace.
    #[error("empty expression")]
    Empty,

    /// Syntax error.
    #[error("parse error at offset {offset} near {token:?}")]
    Syntax {
        /// Byte offset of the offending token.
        offset: usize,
        /// Offending token text, or `<end>`.
        token: String,
    },
}

impl ExpressionError {
    /// Nack code and substitution arguments for this error.
    pub fn to_nack(&self) -> (NackCode, Vec<Value>) {
        match self {
            Self::Empty => (NackCode::ParseError, vec![Value::from("<empty>")]),
            Self::Syntax { token, .. } => (NackCode::ParseError, vec![Value::from(token.as_str())]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Name(String),
    Int(i64),
    Real(f64),
    Str(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::Not => f.write_str("!"),
            Self::And => f.write_str("&&"),
            Self::Or => f.write_str("||"),
            Self::Eq => f.write_str("=="),
            Self::Ne => f.write_str("!="),
            Self::Name(name) => f.write_str(name),
            Self::Int(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let syntax = |offset: usize, token: &str| ExpressionError::Syntax { offset, token: token.to_owned() };
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let rest = &source[offset..];
        let fixed = [
            ("&&", Token::And),
            ("||", Token::Or),
            ("==", Token::Eq),
            ("!=", Token::Ne),
            ("(", Token::LParen),
            (")", Token::RParen),
            ("!", Token::Not),
        ];
        if let Some((text, token)) = fixed.into_iter().find(|(text, _)| rest.starts_with(text)) {
            for _ in 0..text.len() {
                chars.next();
            }
            tokens.push((offset, token));
            continue;
        }

        if c == '"' || c == '\'' {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some((_, next)) = chars.next() {
                match next {
                    '\\' => match chars.next() {
                        Some((_, escaped)) => value.push(escaped),
                        None => break,
                    },
                    q if q == c => {
                        closed = true;
                        break;
                    },
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(syntax(offset, rest));
            }
            tokens.push((offset, Token::Str(value)));
            continue;
        }

        if c.is_ascii_digit() || c == '-' || c == '+' {
            let mut end = offset + c.len_utf8();
            chars.next();
            while let Some(&(at, next)) = chars.peek() {
                if next.is_ascii_digit() || matches!(next, '.' | 'e' | 'E') {
                    end = at + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let text = &source[offset..end];
            let token = if let Ok(value) = text.parse::<i64>() {
                Token::Int(value)
            } else if let Ok(value) = text.parse::<f64>() {
                Token::Real(value)
            } else {
                return Err(syntax(offset, text));
            };
            tokens.push((offset, token));
            continue;
        }

        if is_name_start(c) {
            let mut end = offset;
            while let Some(&(at, next)) = chars.peek() {
                if is_name_char(next) {
                    end = at + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((offset, Token::Name(source[offset..end].to_owned())));
            continue;
        }

        return Err(syntax(offset, &c.to_string()));
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Const(bool),
    Require(String),
    Compare { name: String, op: Comparison, literal: Value },
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

/// Equality of two values, `None` when they are not comparable.
fn values_equal(left: &Value, right: &Value) -> Option<bool> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a == b),
        (Value::Opaque(a), Value::Opaque(b)) => Some(a == b),
        _ => match (left.as_i64(), right.as_i64()) {
            (Some(a), Some(b)) => Some(a == b),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Some(a == b),
                _ => None,
            },
        },
    }
}

impl Expr {
    fn evaluate(&self, notification: &Notification) -> bool {
        match self {
            Self::Const(value) => *value,
            Self::Require(name) => notification.contains(name),
            Self::Compare { name, op, literal } => {
                let Some(equal) = notification.get(name).and_then(|value| values_equal(value, literal))
                else {
                    return false;
                };
                match op {
                    Comparison::Equal => equal,
                    Comparison::NotEqual => !equal,
                }
            },
            Self::Not(inner) => !inner.evaluate(notification),
            Self::And(terms) => terms.iter().all(|term| term.evaluate(notification)),
            Self::Or(terms) => terms.iter().any(|term| term.evaluate(notification)),
        }
    }

    fn collect_names(&self, names: &mut BTreeSet<String>) {
        match self {
            Self::Const(_) => {},
            Self::Require(name) | Self::Compare { name, .. } => {
                names.insert(name.clone());
            },
            Self::Not(inner) => inner.collect_names(names),
            Self::And(terms) | Self::Or(terms) => {
                for term in terms {
                    term.collect_names(names);
                }
            },
        }
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token)| token)
    }

    fn error(&self) -> ExpressionError {
        match self.tokens.get(self.position) {
            Some((offset, token)) => ExpressionError::Syntax { offset: *offset, token: token.to_string() },
            None => ExpressionError::Syntax { offset: self.end, token: "<end>".to_owned() },
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExpressionError> {
        if self.peek() == Some(expected) {
            self.position += 1;
            Ok(())
        } else {
            Err(self.error())
        }
    }

    /// Enter one nesting level, failing at the token that goes too deep.
    fn descend(&mut self) -> Result<(), ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error());
        }
        self.depth += 1;
        self.position += 1;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.position += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 { terms.swap_remove(0) } else { Expr::Or(terms) })
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.position += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 { terms.swap_remove(0) } else { Expr::And(terms) })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            },
            Some(Token::Name(name)) => {
                self.position += 1;
                match name.as_str() {
                    "true" => return Ok(Expr::Const(true)),
                    "false" => return Ok(Expr::Const(false)),
                    "require" if self.peek() == Some(&Token::LParen) => {
                        self.position += 1;
                        let Some(Token::Name(attribute)) = self.peek().cloned() else {
                            return Err(self.error());
                        };
                        self.position += 1;
                        self.expect(&Token::RParen)?;
                        return Ok(Expr::Require(attribute));
                    },
                    _ => {},
                }
                let op = match self.peek() {
                    Some(Token::Eq) => Comparison::Equal,
                    Some(Token::Ne) => Comparison::NotEqual,
                    _ => return Err(self.error()),
                };
                self.position += 1;
                let literal = match self.peek() {
                    Some(Token::Int(value)) => match i32::try_from(*value) {
                        Ok(small) => Value::Int32(small),
                        Err(_) => Value::Int64(*value),
                    },
                    Some(Token::Real(value)) => Value::Float64(*value),
                    Some(Token::Str(value)) => Value::String(value.clone()),
                    _ => return Err(self.error()),
                };
                self.position += 1;
                Ok(Expr::Compare { name, op, literal })
            },
            _ => Err(self.error()),
        }
    }
}

/// Filter produced by [`BasicExpressions`].
#[derive(Debug)]
struct BasicFilter {
    expr: Expr,
    names: BTreeSet<String>,
}

impl Filter for BasicFilter {
    fn evaluate(&self, notification: &Notification) -> bool {
        self.expr.evaluate(notification)
    }

    fn attribute_names(&self) -> BTreeSet<String> {
        self.names.clone()
    }
}

/// Built-in expression engine for the common subset of the language.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicExpressions;

impl ExpressionEngine for BasicExpressions {
    fn parse(&self, expression: &str) -> Result<Arc<dyn Filter>, ExpressionError> {
        if expression.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, position: 0, end: expression.len(), depth: 0 };
        let expr = parser.parse_or()?;
        if parser.peek().is_some() {
            return Err(parser.error());
        }
        let mut names = BTreeSet::new();
        expr.collect_names(&mut names);
        Ok(Arc::new(BasicFilter { expr, names }))
    }
}
