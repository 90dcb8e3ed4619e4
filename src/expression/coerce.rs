/// Type coercion rules of the expression language
///
/// Errors are plain messages; the evaluator wraps them together with the
/// expression text.

use crate::expression::ast::BinaryOp;
use serde_json::{Number, Value};
use std::cmp::Ordering;

type Coerced<T> = std::result::Result<T, String>;

/// Integer or floating point operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Coerced<Value> {
        match self {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| format!("Result '{}' is not a finite number", f)),
        }
    }
}

/// Type name used in error messages
pub fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => format!("'{}'", s),
        other => other.to_string(),
    }
}

/// Boolean coercion
pub fn to_bool(value: &Value) -> Coerced<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::String(s) if s.is_empty() => Ok(false),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(format!("Cannot coerce {} to boolean", describe(other))),
    }
}

/// String coercion
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numeric coercion
pub fn to_number(value: &Value) -> Coerced<Num> {
    match value {
        Value::Number(n) => Ok(n
            .as_i64()
            .map(Num::Int)
            .unwrap_or_else(|| Num::Float(n.as_f64().unwrap_or(f64::NAN)))),
        Value::Null => Ok(Num::Int(0)),
        Value::String(s) if s.trim().is_empty() => Ok(Num::Int(0)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .map(Num::Int)
                .or_else(|_| trimmed.parse::<f64>().map(Num::Float))
                .map_err(|_| format!("Cannot coerce {} to number", describe(value)))
        }
        other => Err(format!("Cannot coerce {} to number", describe(other))),
    }
}

/// `empty` operator semantics
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Unary minus
pub fn negate(value: &Value) -> Coerced<Value> {
    match to_number(value)? {
        Num::Int(i) => i
            .checked_neg()
            .map(Num::Int)
            .unwrap_or(Num::Float(-(i as f64)))
            .into_value(),
        Num::Float(f) => Num::Float(-f).into_value(),
    }
}

/// Numeric operators
pub fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Coerced<Value> {
    let l = to_number(left)?;
    let r = to_number(right)?;

    let result = match (op, l, r) {
        (BinaryOp::Add, Num::Int(a), Num::Int(b)) => {
            a.checked_add(b).map(Num::Int).unwrap_or(Num::Float(a as f64 + b as f64))
        }
        (BinaryOp::Sub, Num::Int(a), Num::Int(b)) => {
            a.checked_sub(b).map(Num::Int).unwrap_or(Num::Float(a as f64 - b as f64))
        }
        (BinaryOp::Mul, Num::Int(a), Num::Int(b)) => {
            a.checked_mul(b).map(Num::Int).unwrap_or(Num::Float(a as f64 * b as f64))
        }
        (BinaryOp::Mod, Num::Int(_), Num::Int(0)) => return Err("Division by zero".to_string()),
        (BinaryOp::Mod, Num::Int(a), Num::Int(b)) => Num::Int(a % b),
        (BinaryOp::Add, a, b) => Num::Float(a.as_f64() + b.as_f64()),
        (BinaryOp::Sub, a, b) => Num::Float(a.as_f64() - b.as_f64()),
        (BinaryOp::Mul, a, b) => Num::Float(a.as_f64() * b.as_f64()),
        (BinaryOp::Div | BinaryOp::Mod, _, b) if b.as_f64() == 0.0 => {
            return Err("Division by zero".to_string())
        }
        (BinaryOp::Div, a, b) => Num::Float(a.as_f64() / b.as_f64()),
        (BinaryOp::Mod, a, b) => Num::Float(a.as_f64() % b.as_f64()),
        (other, _, _) => return Err(format!("'{}' is not an arithmetic operator", other.symbol())),
    };
    result.into_value()
}

/// Loose EL equality: numbers compare by value, strings coerce to the other side
pub fn equals(left: &Value, right: &Value) -> Coerced<bool> {
    match (left, right) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Null, _) | (_, Value::Null) => Ok(false),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (to_number(left), to_number(right)) {
                (Ok(l), Ok(r)) => Ok(numeric_cmp(l, r) == Some(Ordering::Equal)),
                _ => Ok(false),
            }
        }
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            Ok(to_bool(left)? == to_bool(right)?)
        }
        _ => Ok(left == right),
    }
}

/// Ordering and equality operators
pub fn compare(op: BinaryOp, left: &Value, right: &Value) -> Coerced<bool> {
    let ordering = match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => return Ok(false),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            numeric_cmp(to_number(left)?, to_number(right)?)
        }
        _ => {
            return Err(format!(
                "Cannot compare {} and {}",
                describe(left),
                describe(right)
            ))
        }
    };

    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        other => return Err(format!("'{}' is not a relational operator", other.symbol())),
    })
}

/// Ordering for `compareTo` style calls
pub fn ordering(left: &Value, right: &Value) -> Coerced<Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => numeric_cmp(to_number(left)?, to_number(right)?)
            .ok_or_else(|| format!("Cannot compare {} and {}", describe(left), describe(right))),
    }
}

fn numeric_cmp(left: Num, right: Num) -> Option<Ordering> {
    match (left, right) {
        (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
        (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
    }
}
