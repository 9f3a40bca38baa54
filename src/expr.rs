//! Sandboxed expression language for branch conditions, trigger guards,
//! rejection rules and bindings.
//!
//! The grammar is fixed: literals, dotted paths into `slots`, `session` and
//! `parent`, comparisons (`==`, `!=`, `<`, `<=`, `>`, `>=`, `in`, `not in`,
//! `is`, `is not`) and boolean connectives (`and`, `or`, `not`, plus the
//! `&&`, `||`, `!` spellings). There are no function calls and no assignment.

mod eval;
mod parser;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use eval::truthy;

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted path, e.g. `slots.destination.city`
    Path(Vec<String>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {position}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("cannot apply `{op}` to {left} and {right}")]
    TypeMismatch {
        op: CompareOp,
        left: String,
        right: String,
    },
}

/// Variable lookup for expression evaluation.
///
/// Unknown paths resolve to `Value::Null`; they are never an error.
pub trait Scope {
    fn resolve(&self, path: &[String]) -> Value;
}

/// Scope with no variables, used to detect constant conditions
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn resolve(&self, _path: &[String]) -> Value {
        Value::Null
    }
}

/// A parsed expression together with its source text.
///
/// Serializes as the source string so flow files and persisted state stay
/// human readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    expr: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let expr = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tree(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate to a value
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value, EvalError> {
        eval::evaluate(&self.expr, scope)
    }

    /// Evaluate and coerce to a boolean using [`truthy`]
    pub fn test(&self, scope: &dyn Scope) -> Result<bool, EvalError> {
        self.evaluate(scope).map(|v| truthy(&v))
    }

    /// Whether the expression reads any variable
    pub fn references_variables(&self) -> bool {
        fn walk(expr: &Expr) -> bool {
            match expr {
                Expr::Literal(_) => false,
                Expr::Path(_) => true,
                Expr::List(items) => items.iter().any(walk),
                Expr::Not(inner) => walk(inner),
                Expr::And(l, r) | Expr::Or(l, r) => walk(l) || walk(r),
                Expr::Compare { left, right, .. } => walk(left) || walk(right),
            }
        }
        walk(&self.expr)
    }

    /// True when the expression reads no variables and evaluates truthy.
    pub fn is_constant_true(&self) -> bool {
        !self.references_variables() && self.test(&EmptyScope).unwrap_or(false)
    }
}

impl FromStr for Expression {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Expression {
    type Error = ParseError;

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
