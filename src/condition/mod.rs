//! Predicate expressions for transformer `if` fields.
//!
//! ```text
//! $.status >= 400 and $attributes.env == 'prod'
//! $.message contains 'error' or $.message match '(?i)fatal'
//! env('CLUSTER') == $resource.cluster
//! ```
//!
//! Operands are field paths, string or number literals, and `env("NAME")`
//! (undefined names evaluate to the empty string). Comparisons combine
//! with `and`/`or`, left-associative, parenthesized as needed. Missing
//! fields evaluate as null: equal only to nothing, ordered before
//! everything.

mod lexer;

use std::fmt;

use entry::{Entry, Field, Value};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::Error;
use lexer::{Lexer, Token};

#[derive(Debug, Clone, PartialEq)]
enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone)]
enum Operand {
    Field(Field),
    String(String),
    Number(f64),
    Env(String),
}

#[derive(Debug, Clone)]
enum Node {
    Compare {
        lhs: Operand,
        op: Comparison,
        rhs: Operand,
    },
    Match {
        lhs: Operand,
        regex: regex::Regex,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// A compiled predicate. Keeps the source text for display and
/// round-tripping through configuration.
#[derive(Clone)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(input: &str) -> Result<Expression, Error> {
        let mut parser = Parser {
            lexer: Lexer::new(input),
        };
        let root = parser.parse()?;
        Ok(Expression {
            source: input.to_owned(),
            root,
        })
    }

    /// Evaluates against an entry. Never panics; malformed regexes are
    /// caught at parse time.
    pub fn eval(&self, entry: &Entry) -> bool {
        eval_node(&self.root, entry)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Expression::parse(&source).map_err(de::Error::custom)
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    fn parse(&mut self) -> Result<Node, Error> {
        let node = self.parse_node()?;
        self.parse_tail(node, true)
    }

    /// Folds `and`/`or` connectives onto `node`, left-associative.
    fn parse_tail(&mut self, mut node: Node, top_level: bool) -> Result<Node, Error> {
        loop {
            match self.lexer.peek() {
                None => return Ok(node),
                Some(Err(err)) => return Err(Error::config(err)),
                Some(Ok((_, Token::Symbol(")")))) if !top_level => return Ok(node),
                Some(Ok((pos, token))) => {
                    let connective = match token {
                        Token::Word("and") => true,
                        Token::Word("or") => false,
                        other => {
                            return Err(Error::config(format!(
                                "expected 'and' or 'or' at {pos}, found {other:?}"
                            )));
                        }
                    };
                    self.advance()?;

                    let rhs = self.parse_node()?;
                    node = if connective {
                        Node::And(Box::new(node), Box::new(rhs))
                    } else {
                        Node::Or(Box::new(node), Box::new(rhs))
                    };
                }
            }
        }
    }

    /// A parenthesized expression or a single comparison.
    fn parse_node(&mut self) -> Result<Node, Error> {
        if let Some(Ok((_, Token::Symbol("(")))) = self.lexer.peek() {
            self.advance()?;
            let inner = self.parse_node()?;
            let inner = self.parse_tail(inner, false)?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }

        let lhs = self.parse_operand()?;
        let (pos, op) = self.next_token()?;

        if op == Token::Word("match") {
            // Compile now so a bad pattern is a configuration error, not a
            // runtime surprise.
            let (pos, pattern) = self.next_token()?;
            let Token::String(pattern) = pattern else {
                return Err(Error::config(format!(
                    "the right-hand side of 'match' must be a string literal, found {pattern:?} at {pos}"
                )));
            };
            let regex = regex::Regex::new(pattern)
                .map_err(|err| Error::config(format!("invalid match pattern: {err}")))?;
            return Ok(Node::Match { lhs, regex });
        }

        let op = match op {
            Token::Symbol("==") => Comparison::Eq,
            Token::Symbol("!=") => Comparison::Ne,
            Token::Symbol("<") => Comparison::Lt,
            Token::Symbol("<=") => Comparison::Le,
            Token::Symbol(">") => Comparison::Gt,
            Token::Symbol(">=") => Comparison::Ge,
            Token::Word("contains") => Comparison::Contains,
            other => {
                return Err(Error::config(format!(
                    "expected a comparison operator at {pos}, found {other:?}"
                )));
            }
        };
        let rhs = self.parse_operand()?;

        Ok(Node::Compare { lhs, op, rhs })
    }

    fn parse_operand(&mut self) -> Result<Operand, Error> {
        let (pos, token) = self.next_token()?;
        match token {
            Token::Path(path) => {
                let field: Field = path
                    .parse()
                    .map_err(|err| Error::config(format!("invalid field at {pos}: {err}")))?;
                Ok(Operand::Field(field))
            }
            Token::String(s) => Ok(Operand::String(s.to_owned())),
            Token::Number(n) => Ok(Operand::Number(n)),
            Token::Word("env") => {
                self.expect_symbol("(")?;
                let (pos, name) = self.next_token()?;
                let name = match name {
                    Token::String(s) => s.to_owned(),
                    other => {
                        return Err(Error::config(format!(
                            "env() takes a string name, found {other:?} at {pos}"
                        )));
                    }
                };
                self.expect_symbol(")")?;
                Ok(Operand::Env(name))
            }
            Token::Word("true") => Ok(Operand::String("true".to_owned())),
            Token::Word("false") => Ok(Operand::String("false".to_owned())),
            other => Err(Error::config(format!(
                "expected a field, literal or env() at {pos}, found {other:?}"
            ))),
        }
    }

    fn next_token(&mut self) -> Result<(usize, Token<'a>), Error> {
        match self.lexer.next() {
            Some(Ok(token)) => Ok(token),
            Some(Err(err)) => Err(Error::config(err)),
            None => Err(Error::config(format!(
                "unexpected end of expression at {}",
                self.lexer.pos()
            ))),
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<(), Error> {
        let (pos, token) = self.next_token()?;
        if token != Token::Symbol(symbol) {
            return Err(Error::config(format!(
                "expected '{symbol}' at {pos}, found {token:?}"
            )));
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<(), Error> {
        match self.lexer.next() {
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(Error::config(err)),
            None => Err(Error::config("unexpected end of expression")),
        }
    }
}

fn eval_node(node: &Node, entry: &Entry) -> bool {
    match node {
        Node::And(lhs, rhs) => eval_node(lhs, entry) && eval_node(rhs, entry),
        Node::Or(lhs, rhs) => eval_node(lhs, entry) || eval_node(rhs, entry),
        Node::Compare { lhs, op, rhs } => compare(lhs, op, rhs, entry),
        Node::Match { lhs, regex } => match resolve(lhs, entry) {
            Some(value) => regex.is_match(&value.coerce_string()),
            None => false,
        },
    }
}

/// The value of an operand at evaluation time; `None` is a missing field.
fn resolve(operand: &Operand, entry: &Entry) -> Option<Value> {
    match operand {
        Operand::Field(field) => field.get(entry).map(|v| v.into_owned()),
        Operand::String(s) => Some(Value::String(s.clone())),
        Operand::Number(n) => Some(Value::Float(*n)),
        Operand::Env(name) => Some(Value::String(
            std::env::var(name).unwrap_or_default(),
        )),
    }
}

fn compare(lhs: &Operand, op: &Comparison, rhs: &Operand, entry: &Entry) -> bool {
    let lhs = resolve(lhs, entry);
    let rhs = resolve(rhs, entry);

    match op {
        Comparison::Eq => loose_eq(&lhs, &rhs),
        Comparison::Ne => !loose_eq(&lhs, &rhs),
        Comparison::Lt | Comparison::Le | Comparison::Gt | Comparison::Ge => {
            let ordering = match (&lhs, &rhs) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => {
                        x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    // Numbers written as strings still compare numerically.
                    _ => match (coerce_f64(a), coerce_f64(b)) {
                        (Some(x), Some(y)) => {
                            x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
                        }
                        _ => a.coerce_string().cmp(&b.coerce_string()),
                    },
                },
            };

            match op {
                Comparison::Lt => ordering.is_lt(),
                Comparison::Le => ordering.is_le(),
                Comparison::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
        Comparison::Contains => match (&lhs, &rhs) {
            (Some(a), Some(b)) => a.coerce_string().contains(&b.coerce_string()),
            _ => false,
        },
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Equality across the number/string divide: `$.status == 404` holds
/// whether the field is numeric or the string `"404"`.
fn loose_eq(lhs: &Option<Value>, rhs: &Option<Value>) -> bool {
    match (lhs, rhs) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (coerce_f64(a), coerce_f64(b)) {
                return x == y;
            }
            a.coerce_string() == b.coerce_string()
        }
        _ => false,
    }
}
