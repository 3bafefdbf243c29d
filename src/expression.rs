//! Algebraic constraint expressions over named parameters.
//!
//! A parameter may be tied to other parameters through an expression such as
//! `p0_center + 1.5` or `2.0 * p1_sigma`. Expressions are parsed once into a
//! small syntax tree and evaluated with a caller-supplied name resolver, so the
//! same [`Expression`] can be re-evaluated every time the optimizer moves the
//! free parameters.
//!
//! The grammar covers the usual arithmetic operators (`+ - * /`, `**` or `^` for
//! powers, unary minus), parentheses, the constants `pi` and `inf`, and the
//! functions `sqrt exp log log10 abs sin cos tan` (one argument) and `min max`
//! (two arguments).
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

/// All the ways an expression can fail to parse
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Expression is empty")]
    Empty,
    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedCharacter(char, usize),
    #[error("Invalid number literal \"{0}\"")]
    InvalidNumber(String),
    #[error("Unexpected token {0} in expression")]
    UnexpectedToken(String),
    #[error("Unexpected end of expression")]
    UnexpectedEnd,
    #[error("Unknown function \"{0}\"")]
    UnknownFunction(String),
    #[error("Function \"{name}\" takes {expected} argument(s), {found} given")]
    WrongArity {
        name: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Plus,
    Minus,
    Star,
    Slash,
    Power,
    LeftParen,
    RightParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(v) => write!(f, "{v}"),
            Token::Name(n) => write!(f, "\"{n}\""),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Power => f.write_str("'**'"),
            Token::LeftParen => f.write_str("'('"),
            Token::RightParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent part, e.g. 1e-5 or 2.5E+3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
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
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Power);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '^' => {
                tokens.push(Token::Power);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c => return Err(ExpressionError::UnexpectedCharacter(c, i)),
        }
    }
    Ok(tokens)
}

/// The functions an expression may call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sqrt,
    Exp,
    Log,
    Log10,
    Abs,
    Sin,
    Cos,
    Tan,
    Min,
    Max,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "sqrt" => Self::Sqrt,
            "exp" => Self::Exp,
            "log" => Self::Log,
            "log10" => Self::Log10,
            "abs" => Self::Abs,
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        };
        Some(f)
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Min | Self::Max => 2,
            _ => 1,
        }
    }

    fn apply(&self, args: &[f64]) -> f64 {
        match self {
            Self::Sqrt => args[0].sqrt(),
            Self::Exp => args[0].exp(),
            Self::Log => args[0].ln(),
            Self::Log10 => args[0].log10(),
            Self::Abs => args[0].abs(),
            Self::Sin => args[0].sin(),
            Self::Cos => args[0].cos(),
            Self::Tan => args[0].tan(),
            Self::Min => args[0].min(args[1]),
            Self::Max => args[0].max(args[1]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Pow => lhs.powf(rhs),
        }
    }
}

/// A node in the expression syntax tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Number(f64),
    Name(String),
    Negate(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl Node {
    fn evaluate<E, F>(&self, resolve: &mut F) -> Result<f64, E>
    where
        F: FnMut(&str) -> Result<f64, E>,
    {
        let value = match self {
            Node::Number(v) => *v,
            Node::Name(name) => resolve(name)?,
            Node::Negate(inner) => -inner.evaluate(resolve)?,
            Node::Binary(op, lhs, rhs) => {
                let lhs = lhs.evaluate(resolve)?;
                let rhs = rhs.evaluate(resolve)?;
                op.apply(lhs, rhs)
            }
            Node::Call(func, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(resolve)?);
                }
                func.apply(&values)
            }
        };
        Ok(value)
    }

    fn collect_names<'a>(&'a self, acc: &mut Vec<&'a str>) {
        match self {
            Node::Number(_) => {}
            Node::Name(name) => {
                if !acc.contains(&name.as_str()) {
                    acc.push(name.as_str());
                }
            }
            Node::Negate(inner) => inner.collect_names(acc),
            Node::Binary(_, lhs, rhs) => {
                lhs.collect_names(acc);
                rhs.collect_names(acc);
            }
            Node::Call(_, args) => {
                for arg in args {
                    arg.collect_names(acc);
                }
            }
        }
    }
}

/// Recursive descent over the token stream.
///
/// ```text
/// expr  := term (('+' | '-') term)*
/// term  := unary (('*' | '/') unary)*
/// unary := ('-' | '+') unary | power
/// power := atom ('**' unary)?
/// atom  := number | name | name '(' expr (',' expr)* ')' | '(' expr ')'
/// ```
struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn parse_expr(&mut self) -> Result<Node, ExpressionError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.position += 1;
            let rhs = self.parse_term()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Node, ExpressionError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.position += 1;
            let rhs = self.parse_unary()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.position += 1;
                Ok(Node::Negate(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.position += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Node, ExpressionError> {
        let base = self.parse_atom()?;
        if let Some(Token::Power) = self.peek() {
            self.position += 1;
            let exponent = self.parse_unary()?;
            return Ok(Node::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Node, ExpressionError> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Node::Number(v)),
            Some(Token::Name(name)) => {
                if let Some(Token::LeftParen) = self.peek() {
                    self.position += 1;
                    let func = Function::from_name(&name)
                        .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                    let mut args = vec![self.parse_expr()?];
                    while let Some(Token::Comma) = self.peek() {
                        self.position += 1;
                        args.push(self.parse_expr()?);
                    }
                    self.expect(Token::RightParen)?;
                    if args.len() != func.arity() {
                        return Err(ExpressionError::WrongArity {
                            name,
                            expected: func.arity(),
                            found: args.len(),
                        });
                    }
                    Ok(Node::Call(func, args))
                } else {
                    match name.as_str() {
                        "pi" => Ok(Node::Number(std::f64::consts::PI)),
                        "inf" => Ok(Node::Number(f64::INFINITY)),
                        _ => Ok(Node::Name(name)),
                    }
                }
            }
            Some(Token::LeftParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RightParen)?;
                Ok(inner)
            }
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

/// A parsed constraint expression which remembers its source text
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(into = "String", try_from = "String")
)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let root = parser.parse_expr()?;
        if let Some(token) = parser.next() {
            return Err(ExpressionError::UnexpectedToken(token.to_string()));
        }
        Ok(Self {
            source: source.trim().to_string(),
            root,
        })
    }

    /// The text this expression was parsed from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// The distinct parameter names referenced, in order of first appearance
    pub fn names(&self) -> Vec<&str> {
        let mut acc = Vec::new();
        self.root.collect_names(&mut acc);
        acc
    }

    /// Evaluate the expression, looking up every name through `resolve`.
    ///
    /// The first error returned by `resolve` aborts the evaluation.
    pub fn evaluate<E, F>(&self, mut resolve: F) -> Result<f64, E>
    where
        F: FnMut(&str) -> Result<f64, E>,
    {
        self.root.evaluate(&mut resolve)
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Expression {
    type Error = ExpressionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Expression> for String {
    fn from(value: Expression) -> Self {
        value.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
