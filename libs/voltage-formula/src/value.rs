//! Formula values and lookup outcomes

use crate::error::{FormulaError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed formula value
///
/// Integers are carried as `Number`; the evaluator works in floating point so
/// that `7 / 2` is `3.5` regardless of how the literals were written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormulaValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FormulaValue {
    /// Numeric view of the value
    ///
    /// Booleans map to 1/0, numeric text is parsed (entity states often arrive
    /// as strings), anything else is `None`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FormulaValue::Number(n) => Some(*n),
            FormulaValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FormulaValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormulaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into an evalexpr value for execution
    pub fn to_evalexpr(&self) -> evalexpr::Value {
        match self {
            FormulaValue::Number(n) => evalexpr::Value::Float(*n),
            FormulaValue::Bool(b) => evalexpr::Value::Boolean(*b),
            FormulaValue::Text(s) => evalexpr::Value::String(s.clone()),
        }
    }

    /// Operand bound to an expression identifier
    ///
    /// Finite numeric text binds as a number, the same reading handlers
    /// apply through [`as_number`](Self::as_number). Other text stays a string.
    pub fn to_operand(&self) -> evalexpr::Value {
        match self {
            FormulaValue::Text(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => evalexpr::Value::Float(n),
                _ => evalexpr::Value::String(s.clone()),
            },
            other => other.to_evalexpr(),
        }
    }

    /// Convert an evalexpr result back into a formula value
    pub fn from_evalexpr(value: evalexpr::Value) -> Result<Self> {
        match value {
            evalexpr::Value::Float(f) => Ok(FormulaValue::Number(f)),
            evalexpr::Value::Int(i) => Ok(FormulaValue::Number(i as f64)),
            evalexpr::Value::Boolean(b) => Ok(FormulaValue::Bool(b)),
            evalexpr::Value::String(s) => Ok(FormulaValue::Text(s)),
            other => Err(FormulaError::function(format!(
                "Expression did not evaluate to a scalar: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for FormulaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaValue::Number(n) => write!(f, "{}", n),
            FormulaValue::Bool(b) => write!(f, "{}", b),
            FormulaValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FormulaValue {
    fn from(value: f64) -> Self {
        FormulaValue::Number(value)
    }
}

impl From<i64> for FormulaValue {
    fn from(value: i64) -> Self {
        FormulaValue::Number(value as f64)
    }
}

impl From<bool> for FormulaValue {
    fn from(value: bool) -> Self {
        FormulaValue::Bool(value)
    }
}

impl From<&str> for FormulaValue {
    fn from(value: &str) -> Self {
        FormulaValue::Text(value.to_string())
    }
}

impl From<String> for FormulaValue {
    fn from(value: String) -> Self {
        FormulaValue::Text(value)
    }
}

/// Outcome of resolving one name
///
/// `Value(false)` and `Value(0)` are ordinary resolved values; only the other
/// variants mean "no usable value".
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Resolved value
    Value(FormulaValue),
    /// The name is known but currently carries no value
    Absent,
    /// The source is momentarily unavailable
    Unavailable,
    /// The source reports an unknown state
    Unknown,
    /// No resolution strategy knows this name
    NotFound,
}

impl Lookup {
    pub fn value(&self) -> Option<&FormulaValue> {
        match self {
            Lookup::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Lookup::Value(_))
    }
}

impl From<FormulaValue> for Lookup {
    fn from(value: FormulaValue) -> Self {
        Lookup::Value(value)
    }
}

impl From<f64> for Lookup {
    fn from(value: f64) -> Self {
        Lookup::Value(FormulaValue::Number(value))
    }
}

impl From<bool> for Lookup {
    fn from(value: bool) -> Self {
        Lookup::Value(FormulaValue::Bool(value))
    }
}

impl From<&str> for Lookup {
    fn from(value: &str) -> Self {
        Lookup::Value(FormulaValue::Text(value.to_string()))
    }
}
