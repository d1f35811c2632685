//! Alternate-state classification and fallbacks
//!
//! Phase 4 runs every formula outcome through one classifier. A formula may
//! declare a replacement per alternate state; the replacement is either a
//! literal or another formula evaluated in the same context.

use crate::result::{EvaluationResult, TransientKind};
use crate::value::FormulaValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Classified non-success outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlternateState {
    Unavailable,
    Unknown,
    /// Input present but without a value
    #[serde(rename = "none")]
    Absent,
    Fatal,
    /// Catch-all for the transient states above
    Fallback,
}

impl AlternateState {
    /// Alternate state of an outcome; `None` for a success
    pub fn classify(result: &EvaluationResult) -> Option<Self> {
        match result {
            EvaluationResult::Success(_) => None,
            EvaluationResult::Transient(reason) => Some(match reason.kind {
                TransientKind::Absent => AlternateState::Absent,
                TransientKind::Unknown => AlternateState::Unknown,
                TransientKind::Unavailable | TransientKind::CircuitOpen => {
                    AlternateState::Unavailable
                },
            }),
            EvaluationResult::Fatal(_) => Some(AlternateState::Fatal),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlternateState::Unavailable => "unavailable",
            AlternateState::Unknown => "unknown",
            AlternateState::Absent => "none",
            AlternateState::Fatal => "fatal",
            AlternateState::Fallback => "fallback",
        }
    }
}

/// Replacement for an alternate state
///
/// In YAML either a plain scalar (`unavailable: 0`) or a formula
/// (`unavailable: { formula: "backup * 2" }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FallbackValue {
    Formula { formula: String },
    Literal(FormulaValue),
}

impl FallbackValue {
    pub fn formula(text: impl Into<String>) -> Self {
        FallbackValue::Formula {
            formula: text.into(),
        }
    }

    pub fn literal(value: impl Into<FormulaValue>) -> Self {
        FallbackValue::Literal(value.into())
    }
}

/// Fallback declared for `state`
///
/// An exact key wins. The `fallback` catch-all covers transient states only;
/// a fatal outcome is replaced solely by an explicit `fatal` entry.
pub fn select_fallback<V>(
    fallbacks: &BTreeMap<AlternateState, V>,
    state: AlternateState,
) -> Option<(AlternateState, &V)> {
    if let Some(value) = fallbacks.get(&state) {
        return Some((state, value));
    }
    if state == AlternateState::Fatal {
        return None;
    }
    fallbacks
        .get(&AlternateState::Fallback)
        .map(|value| (AlternateState::Fallback, value))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::error::FormulaError;
    use crate::result::TransientReason;

    #[test]
    fn test_classify() {
        assert_eq!(
            AlternateState::classify(&EvaluationResult::Success(FormulaValue::Number(1.0))),
            None
        );
        assert_eq!(
            AlternateState::classify(&EvaluationResult::Transient(TransientReason::single(
                TransientKind::Absent,
                "x"
            ))),
            Some(AlternateState::Absent)
        );
        assert_eq!(
            AlternateState::classify(&EvaluationResult::Fatal(FormulaError::UnresolvedName(
                "x".into()
            ))),
            Some(AlternateState::Fatal)
        );
    }

    #[test]
    fn test_select_exact_then_catch_all() {
        let mut fallbacks = BTreeMap::new();
        fallbacks.insert(AlternateState::Unknown, FallbackValue::literal(1.0));
        fallbacks.insert(AlternateState::Fallback, FallbackValue::literal(0.0));

        let (state, value) = select_fallback(&fallbacks, AlternateState::Unknown).unwrap();
        assert_eq!(state, AlternateState::Unknown);
        assert_eq!(value, &FallbackValue::literal(1.0));

        let (state, _) = select_fallback(&fallbacks, AlternateState::Unavailable).unwrap();
        assert_eq!(state, AlternateState::Fallback);

        assert!(select_fallback(&fallbacks, AlternateState::Fatal).is_none());
    }

    #[test]
    fn test_fallbacks_from_yaml() {
        let yaml = "unavailable: 0\nnone: { formula: \"backup * 2\" }\nfatal: off\n";
        let fallbacks: BTreeMap<AlternateState, FallbackValue> =
            serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            fallbacks[&AlternateState::Unavailable],
            FallbackValue::literal(0.0)
        );
        assert_eq!(
            fallbacks[&AlternateState::Absent],
            FallbackValue::formula("backup * 2")
        );
        assert_eq!(fallbacks[&AlternateState::Fatal], FallbackValue::literal("off"));
    }
}
