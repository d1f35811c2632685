//! Evaluation results

use crate::error::FormulaError;
use crate::value::{FormulaValue, Lookup};
use serde::Serialize;
use std::fmt;

/// Why a formula could not produce a value this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// Input known but without a value
    Absent,
    /// Input reports an unknown state
    Unknown,
    /// Input momentarily unavailable
    Unavailable,
    /// Formula skipped by an open circuit breaker
    CircuitOpen,
}

impl TransientKind {
    /// Map a non-value lookup outcome to its transient kind
    pub fn from_lookup(lookup: &Lookup) -> Option<Self> {
        match lookup {
            Lookup::Absent => Some(TransientKind::Absent),
            Lookup::Unknown => Some(TransientKind::Unknown),
            Lookup::Unavailable => Some(TransientKind::Unavailable),
            Lookup::Value(_) | Lookup::NotFound => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Absent => "absent",
            TransientKind::Unknown => "unknown",
            TransientKind::Unavailable => "unavailable",
            TransientKind::CircuitOpen => "circuit open",
        }
    }
}

/// Non-fatal outcome detail: which names were missing and how
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransientReason {
    /// Dominant kind (unavailable > unknown > absent)
    pub kind: TransientKind,
    /// Names referenced by the formula that had no usable value
    pub names: Vec<String>,
}

impl TransientReason {
    pub fn new(kind: TransientKind, names: Vec<String>) -> Self {
        Self { kind, names }
    }

    pub fn single(kind: TransientKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            names: vec![name.into()],
        }
    }

    pub fn mentions(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

impl fmt::Display for TransientReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransientKind::CircuitOpen => {
                write!(f, "temporarily skipped: circuit open for {}", self.names.join(", "))
            },
            kind => write!(
                f,
                "temporarily unavailable: {} {}",
                self.names.join(", "),
                kind.as_str()
            ),
        }
    }
}

/// Final, classified outcome of one formula in one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationResult {
    Success(FormulaValue),
    Transient(TransientReason),
    Fatal(FormulaError),
}

impl EvaluationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, EvaluationResult::Success(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EvaluationResult::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EvaluationResult::Fatal(_))
    }

    pub fn value(&self) -> Option<&FormulaValue> {
        match self {
            EvaluationResult::Success(v) => Some(v),
            _ => None,
        }
    }

    /// The lookup a dependent formula observes for this result
    pub fn as_lookup(&self) -> Lookup {
        match self {
            EvaluationResult::Success(v) => Lookup::Value(v.clone()),
            EvaluationResult::Transient(reason) => match reason.kind {
                TransientKind::Absent => Lookup::Absent,
                TransientKind::Unknown => Lookup::Unknown,
                TransientKind::Unavailable | TransientKind::CircuitOpen => Lookup::Unavailable,
            },
            EvaluationResult::Fatal(_) => Lookup::Unavailable,
        }
    }
}

impl fmt::Display for EvaluationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationResult::Success(v) => write!(f, "{}", v),
            EvaluationResult::Transient(reason) => write!(f, "{}", reason),
            EvaluationResult::Fatal(err) => write!(f, "configuration error: {}", err),
        }
    }
}
