//! Expression evaluation over JSON values

use super::{CompareOp, EvalError, Expr, Scope};
use serde_json::Value;
use std::cmp::Ordering;

pub(super) fn evaluate(expr: &Expr, scope: &dyn Scope) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => Ok(scope.resolve(segments)),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, scope)?))),
        Expr::And(left, right) => {
            if !truthy(&evaluate(left, scope)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(right, scope)?)))
        }
        Expr::Or(left, right) => {
            if truthy(&evaluate(left, scope)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(right, scope)?)))
        }
        Expr::Compare { op, left, right } => {
            let l = evaluate(left, scope)?;
            let r = evaluate(right, scope)?;
            compare(*op, &l, &r).map(Value::Bool)
        }
    }
}

/// Truthiness: null, false, 0, "" and empty collections are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        CompareOp::In => contains(op, right, left),
        CompareOp::NotIn => contains(op, right, left).map(|found| !found),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            // An unset slot never satisfies an ordering.
            if left.is_null() || right.is_null() {
                return Ok(false);
            }
            let ordering = order(left, right).ok_or_else(|| mismatch(op, left, right))?;
            Ok(match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y) == Some(Ordering::Equal),
            _ => a == b,
        },
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(op: CompareOp, haystack: &Value, needle: &Value) -> Result<bool, EvalError> {
    match haystack {
        Value::Null => Ok(false),
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            _ => Err(mismatch(op, needle, haystack)),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Err(mismatch(op, needle, haystack)),
        },
        _ => Err(mismatch(op, needle, haystack)),
    }
}

fn mismatch(op: CompareOp, left: &Value, right: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op,
        left: type_name(left).to_string(),
        right: type_name(right).to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
