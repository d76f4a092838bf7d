//! Custom aggregation expressions
//!
//! A small expression language for mean metrics:
//!
//! ```text
//! expr   := agg '(' arith ')' | agg '(' '*'? ')' | arith
//! arith  := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := number | 'properties.' ident | '(' arith ')' | '-' factor
//! agg    := sum | avg | min | max | count
//! ```
//!
//! An expression without an aggregation call is summed.

use crate::error::ComputeError;
use crate::schema::EventRow;
use serde::{Deserialize, Serialize};

/// How per-event values collapse into one per-subject value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(Aggregation::Sum),
            "avg" => Some(Aggregation::Avg),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "count" => Some(Aggregation::Count),
            _ => None,
        }
    }

    /// Reduce per-event values; an empty input reduces to 0
    pub fn reduce(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Count => values.len() as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum ValueExpr {
    Number(f64),
    Property(String),
    Neg(Box<ValueExpr>),
    Binary(BinaryOp, Box<ValueExpr>, Box<ValueExpr>),
}

impl ValueExpr {
    fn eval(&self, row: &EventRow) -> f64 {
        match self {
            ValueExpr::Number(n) => *n,
            // non-numeric and missing properties count as 0
            ValueExpr::Property(key) => row.property(key).and_then(|v| v.as_f64()).unwrap_or(0.0),
            ValueExpr::Neg(inner) => -inner.eval(row),
            ValueExpr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(row), rhs.eval(row));
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div if b == 0.0 => 0.0,
                    BinaryOp::Div => a / b,
                }
            }
        }
    }
}

/// A parsed aggregation expression
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationExpression {
    pub aggregation: Aggregation,
    value: Option<ValueExpr>,
}

impl AggregationExpression {
    pub fn parse(source: &str) -> Result<Self, ComputeError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_top()?;
        if parser.pos != parser.tokens.len() {
            return Err(ComputeError::Expression(format!(
                "unexpected trailing input in '{source}'"
            )));
        }
        Ok(expr)
    }

    /// Per-event value; `count(*)` counts every event as 1
    pub fn value_of(&self, row: &EventRow) -> f64 {
        self.value.as_ref().map(|v| v.eval(row)).unwrap_or(1.0)
    }

    /// Evaluate over a subject's matching events
    pub fn evaluate<'a, I>(&self, rows: I) -> f64
    where
        I: IntoIterator<Item = &'a EventRow>,
    {
        let values: Vec<f64> = rows.into_iter().map(|r| self.value_of(r)).collect();
        self.aggregation.reduce(&values)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Dot,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ComputeError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    ComputeError::Expression(format!("invalid number '{text}'"))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphanumeric() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ComputeError::Expression(format!(
                    "unexpected character '{other}' in '{source}'"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ComputeError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(ComputeError::Expression(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_top(&mut self) -> Result<AggregationExpression, ComputeError> {
        if let (Some(Token::Ident(name)), Some(Token::LParen)) =
            (self.tokens.first(), self.tokens.get(1))
        {
            if let Some(aggregation) = Aggregation::from_name(name) {
                self.pos = 2;
                let value = match self.peek() {
                    Some(Token::RParen) if aggregation == Aggregation::Count => None,
                    Some(Token::Star) if aggregation == Aggregation::Count => {
                        self.pos += 1;
                        None
                    }
                    _ => Some(self.parse_arith()?),
                };
                self.expect(Token::RParen)?;
                return Ok(AggregationExpression { aggregation, value });
            }
        }

        Ok(AggregationExpression {
            aggregation: Aggregation::Sum,
            value: Some(self.parse_arith()?),
        })
    }

    fn parse_arith(&mut self) -> Result<ValueExpr, ComputeError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_term()?;
            lhs = ValueExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_term(&mut self) -> Result<ValueExpr, ComputeError> {
        let mut lhs = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_factor()?;
            lhs = ValueExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_factor(&mut self) -> Result<ValueExpr, ComputeError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(ValueExpr::Number(n)),
            Some(Token::Minus) => Ok(ValueExpr::Neg(Box::new(self.parse_factor()?))),
            Some(Token::LParen) => {
                let inner = self.parse_arith()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if name == "properties" => {
                self.expect(Token::Dot)?;
                match self.next() {
                    Some(Token::Ident(key)) => Ok(ValueExpr::Property(key)),
                    other => Err(ComputeError::Expression(format!(
                        "expected property name after 'properties.', found {other:?}"
                    ))),
                }
            }
            Some(Token::Ident(name)) => Err(ComputeError::Expression(format!(
                "unsupported identifier '{name}' (only properties.<key> is allowed)"
            ))),
            other => Err(ComputeError::Expression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}
