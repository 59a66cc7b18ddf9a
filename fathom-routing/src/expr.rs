//! Sharding expressions.
//!
//! A sharding expression maps a row to an integer key. The grammar is a
//! small arithmetic language over the row's columns:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/' | '%') factor)*
//! factor := INTEGER | IDENT | IDENT '(' [expr] ')' | '(' expr ')'
//! ```
//!
//! Functions: `hash(x)` (xxh3 of the value), `identity(x)` and `rand()`.

use std::fmt;

use bytes::BytesMut;
use fathom_core::{Block, Row, Value};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{RoutingError, RoutingResult};
use crate::limits::{EXPRESSION_DEPTH_MAX, EXPRESSION_LENGTH_MAX};

/// An expression evaluated once per inserted row to choose its shard.
pub trait ShardingExpression: Send + Sync + fmt::Debug {
    /// Name of the result column (the canonical expression text).
    fn column_name(&self) -> &str;

    /// Columns the expression reads.
    fn required_columns(&self) -> Vec<String>;

    /// Evaluates the expression for every row of `block`.
    ///
    /// # Errors
    /// Returns `MissingColumn` if the block lacks an input column and
    /// `Evaluation` if a row cannot be evaluated.
    fn evaluate(&self, block: &Block) -> RoutingResult<Vec<Value>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Hash,
    Identity,
    Rand,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(u64),
    Column(String),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Column(name) => f.write_str(name),
            Self::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Self::Call(function, args) => {
                let name = match function {
                    Function::Hash => "hash",
                    Function::Identity => "identity",
                    Function::Rand => "rand",
                };
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "{name}({})", args.join(", "))
            }
        }
    }
}

/// A compiled sharding expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    text: String,
    canonical: String,
    root: Node,
}

impl Expression {
    /// Returns the source text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Compiles a sharding expression.
///
/// # Errors
/// Returns `Parse` on syntax errors and `UnknownFunction` for calls to
/// functions that do not exist or have the wrong arity.
pub fn compile(text: &str) -> RoutingResult<Expression> {
    if text.len() > EXPRESSION_LENGTH_MAX {
        return Err(RoutingError::Parse {
            expr: text.chars().take(64).collect(),
            position: EXPRESSION_LENGTH_MAX,
            reason: "expression too long",
        });
    }
    let mut parser = Parser {
        text,
        bytes: text.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let root = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(Expression {
        text: text.to_string(),
        canonical: root.to_string(),
        root,
    })
}

impl ShardingExpression for Expression {
    fn column_name(&self) -> &str {
        &self.canonical
    }

    fn required_columns(&self) -> Vec<String> {
        fn walk(node: &Node, out: &mut Vec<String>) {
            match node {
                Node::Literal(_) => {}
                Node::Column(name) => {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
                Node::Binary(_, lhs, rhs) => {
                    walk(lhs, out);
                    walk(rhs, out);
                }
                Node::Call(_, args) => args.iter().for_each(|a| walk(a, out)),
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    fn evaluate(&self, block: &Block) -> RoutingResult<Vec<Value>> {
        let bound = self.bind(&self.root, block)?;
        block
            .rows()
            .iter()
            .map(|row| self.eval(&bound, row))
            .collect()
    }
}

/// Expression with column names resolved to block positions.
enum Bound {
    Literal(u64),
    Column(usize),
    Binary(BinaryOp, Box<Bound>, Box<Bound>),
    Call(Function, Vec<Bound>),
}

impl Expression {
    fn bind(&self, node: &Node, block: &Block) -> RoutingResult<Bound> {
        Ok(match node {
            Node::Literal(v) => Bound::Literal(*v),
            Node::Column(name) => Bound::Column(block.column_index(name).ok_or_else(|| {
                RoutingError::MissingColumn { name: name.clone() }
            })?),
            Node::Binary(op, lhs, rhs) => Bound::Binary(
                *op,
                Box::new(self.bind(lhs, block)?),
                Box::new(self.bind(rhs, block)?),
            ),
            Node::Call(function, args) => Bound::Call(
                *function,
                args.iter()
                    .map(|a| self.bind(a, block))
                    .collect::<RoutingResult<_>>()?,
            ),
        })
    }

    fn eval(&self, node: &Bound, row: &Row) -> RoutingResult<Value> {
        match node {
            Bound::Literal(v) => Ok(Value::UInt(*v)),
            Bound::Column(idx) => Ok(row[*idx].clone()),
            Bound::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, row)?;
                let rhs = self.eval(rhs, row)?;
                self.arithmetic(*op, &lhs, &rhs)
            }
            Bound::Call(Function::Hash, args) => {
                let value = self.eval(&args[0], row)?;
                let mut buf = BytesMut::new();
                match &value {
                    Value::String(s) => buf.extend_from_slice(s.as_bytes()),
                    other => other.encode(&mut buf),
                }
                Ok(Value::UInt(xxh3_64(&buf)))
            }
            Bound::Call(Function::Identity, args) => self.eval(&args[0], row),
            Bound::Call(Function::Rand, _) => Ok(Value::UInt(rand::random::<u64>())),
        }
    }

    fn arithmetic(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RoutingResult<Value> {
        let as_int = |v: &Value| match v {
            Value::Int(i) => Ok(i128::from(*i)),
            Value::UInt(u) => Ok(i128::from(*u)),
            other => Err(self.evaluation_error(format!(
                "cannot apply '{}' to {}",
                op.symbol(),
                other.type_name()
            ))),
        };
        let (a, b) = (as_int(lhs)?, as_int(rhs)?);
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Mod if b == 0 => {
                return Err(self.evaluation_error("division by zero".to_string()));
            }
            BinaryOp::Div => a.checked_div(b),
            // Euclidean remainder, never negative.
            BinaryOp::Mod => a.checked_rem_euclid(b),
        };
        let result = result.ok_or_else(|| self.evaluation_error("integer overflow".to_string()))?;
        if let Ok(v) = u64::try_from(result) {
            Ok(Value::UInt(v))
        } else if let Ok(v) = i64::try_from(result) {
            Ok(Value::Int(v))
        } else {
            Err(self.evaluation_error("integer overflow".to_string()))
        }
    }

    fn evaluation_error(&self, reason: String) -> RoutingError {
        RoutingError::Evaluation {
            expr: self.text.clone(),
            reason,
        }
    }
}

// -----------------------------------------------------------------------------
// Parser
// -----------------------------------------------------------------------------

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: u32,
}

impl Parser<'_> {
    fn error(&self, reason: &'static str) -> RoutingError {
        RoutingError::Parse {
            expr: self.text.to_string(),
            position: self.pos,
            reason,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8, reason: &'static str) -> RoutingResult<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(reason))
        }
    }

    fn expr(&mut self) -> RoutingResult<Node> {
        self.depth += 1;
        if self.depth > EXPRESSION_DEPTH_MAX {
            return Err(self.error("expression nested too deeply"));
        }
        let mut node = self.term()?;
        loop {
            let op = match self.peek() {
                Some(b'+') => BinaryOp::Add,
                Some(b'-') => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.term()?));
        }
        self.depth -= 1;
        Ok(node)
    }

    fn term(&mut self) -> RoutingResult<Node> {
        let mut node = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(b'*') => BinaryOp::Mul,
                Some(b'/') => BinaryOp::Div,
                Some(b'%') => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.factor()?));
        }
        Ok(node)
    }

    fn factor(&mut self) -> RoutingResult<Node> {
        let text = self.text;
        match self.peek() {
            None => Err(self.error("unexpected end of expression")),
            Some(b'(') => {
                self.pos += 1;
                let node = self.expr()?;
                self.expect(b')', "expected ')'")?;
                Ok(node)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
                text[start..self.pos]
                    .parse::<u64>()
                    .map(Node::Literal)
                    .map_err(|_| self.error("integer literal out of range"))
            }
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let start = self.pos;
                while self.pos < self.bytes.len()
                    && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
                {
                    self.pos += 1;
                }
                let name = &text[start..self.pos];
                if self.peek() != Some(b'(') {
                    return Ok(Node::Column(name.to_string()));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(b')') {
                    args.push(self.expr()?);
                    while self.peek() == Some(b',') {
                        self.pos += 1;
                        args.push(self.expr()?);
                    }
                }
                self.expect(b')', "expected ')' after arguments")?;
                let function = match (name, args.len()) {
                    ("hash", 1) => Function::Hash,
                    ("identity", 1) => Function::Identity,
                    ("rand", 0) => Function::Rand,
                    _ => {
                        return Err(RoutingError::UnknownFunction {
                            name: name.to_string(),
                            arity: args.len(),
                        })
                    }
                };
                Ok(Node::Call(function, args))
            }
            Some(_) => Err(self.error("unexpected character")),
        }
    }
}
