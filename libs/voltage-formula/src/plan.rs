//! AST & binding-plan service
//!
//! `analyze(text)` parses a formula text at most once and derives its
//! [`BindingPlan`]: every name the formula can touch, how each name should be
//! resolved, and which calls need a raw name instead of a value. Both the tree
//! and the plan are cached by the exact text, so two formulas with identical
//! text share one entry no matter which group or variable holds them.

use crate::ast::{Expr, Span, SyntaxTree};
use crate::error::{FormulaError, Result};
use crate::parser::parse_formula;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Named constants resolved without any lookup
const CONSTANTS: &[(&str, f64)] = &[("pi", std::f64::consts::PI), ("e", std::f64::consts::E)];

/// Value of a built-in constant
pub fn constant_value(name: &str) -> Option<f64> {
    CONSTANTS
        .iter()
        .find(|(constant, _)| *constant == name)
        .map(|(_, value)| *value)
}

/// How a referenced name gets its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResolutionStrategy {
    /// Resolved through the injected external lookup
    ExternalLookup,
    /// Produced by another primary/attribute formula of the same group
    GroupInternal,
    /// Literal group variable or built-in constant
    Literal,
    /// Produced by a computed-variable formula of the same group
    Computed,
    /// Passed to a reference-aware handler as a name, never dereferenced
    RawName,
}

/// Category of a function call found in a formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallCategory {
    /// Needs the unresolved name of its first argument
    ReferenceConsuming,
    /// Pure function from the named function registry
    Registered,
    /// Left to the evaluator's own built-ins (`if`, `floor`, ...)
    Builtin,
}

/// One reference-consuming call site
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCall {
    pub function: String,
    /// First argument, as a name
    pub raw_name: String,
    /// Remaining arguments, evaluated as ordinary expressions
    pub args: Vec<Expr>,
    pub span: Span,
    /// Position among the formula's reference calls, in reading order
    pub index: usize,
}

impl ReferenceCall {
    /// Placeholder identifier bound to this call's precomputed value
    pub fn placeholder(&self) -> String {
        format!(
            "{}{}_{}",
            crate::ast::PLACEHOLDER_PREFIX,
            self.index,
            self.function
        )
    }
}

/// Immutable per-text binding plan
#[derive(Debug, Clone)]
pub struct BindingPlan {
    pub text: String,
    pub tree: Arc<SyntaxTree>,
    /// Every name the formula may dereference or pass raw
    pub names: BTreeSet<String>,
    /// Strategy hint per name, derived from the text alone
    pub strategies: BTreeMap<String, ResolutionStrategy>,
    /// Function name to category
    pub calls: BTreeMap<String, CallCategory>,
    /// Outermost reference-consuming calls in reading order
    pub reference_calls: Vec<ReferenceCall>,
}

impl BindingPlan {
    pub fn has_reference_calls(&self) -> bool {
        !self.reference_calls.is_empty()
    }

    pub fn categories(&self) -> BTreeSet<CallCategory> {
        self.calls.values().copied().collect()
    }

    pub fn strategy(&self, name: &str) -> Option<ResolutionStrategy> {
        self.strategies.get(name).copied()
    }

    /// Names read as values (everything except raw-only references)
    pub fn value_names(&self) -> impl Iterator<Item = &str> {
        self.strategies
            .iter()
            .filter(|(_, s)| **s != ResolutionStrategy::RawName)
            .map(|(n, _)| n.as_str())
    }
}

/// Parses formulas once and caches trees and plans by text
pub struct AnalysisService {
    trees: DashMap<String, Arc<SyntaxTree>>,
    plans: DashMap<String, Result<Arc<BindingPlan>>>,
    reference_functions: HashSet<String>,
    registered_functions: HashSet<String>,
    parse_count: AtomicU64,
}

impl AnalysisService {
    /// Create a service that knows which calls consume references and which
    /// are registered pure functions
    pub fn new<I, J, S, T>(reference_functions: I, registered_functions: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            trees: DashMap::new(),
            plans: DashMap::new(),
            reference_functions: reference_functions.into_iter().map(Into::into).collect(),
            registered_functions: registered_functions.into_iter().map(Into::into).collect(),
            parse_count: AtomicU64::new(0),
        }
    }

    /// Binding plan for `text`, parsing it on first use only
    ///
    /// Parse failures are cached as well; a malformed text is parsed once and
    /// reports the same error on every call.
    pub fn analyze(&self, text: &str) -> Result<Arc<BindingPlan>> {
        if let Some(cached) = self.plans.get(text) {
            return cached.value().clone();
        }

        self.plans
            .entry(text.to_string())
            .or_insert_with(|| self.build_plan(text))
            .value()
            .clone()
    }

    /// Cached syntax tree, if `text` was analyzed successfully
    pub fn tree(&self, text: &str) -> Option<Arc<SyntaxTree>> {
        self.trees.get(text).map(|t| t.value().clone())
    }

    /// Number of parser runs since creation
    pub fn parse_count(&self) -> u64 {
        self.parse_count.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Drop one cached text; the next `analyze` reparses it
    pub fn evict(&self, text: &str) {
        self.plans.remove(text);
        self.trees.remove(text);
    }

    /// Drop everything (memory pressure)
    pub fn clear(&self) {
        self.plans.clear();
        self.trees.clear();
    }

    pub fn category_of(&self, function: &str) -> CallCategory {
        if self.reference_functions.contains(function) {
            CallCategory::ReferenceConsuming
        } else if self.registered_functions.contains(function) {
            CallCategory::Registered
        } else {
            CallCategory::Builtin
        }
    }

    fn build_plan(&self, text: &str) -> Result<Arc<BindingPlan>> {
        self.parse_count.fetch_add(1, Ordering::Relaxed);
        let tree = Arc::new(parse_formula(text)?);
        self.trees.insert(text.to_string(), tree.clone());

        let mut collector = PlanCollector {
            service: self,
            strategies: BTreeMap::new(),
            calls: BTreeMap::new(),
            reference_calls: Vec::new(),
        };
        collector.collect(&tree.root, false)?;

        let names = collector.strategies.keys().cloned().collect::<BTreeSet<_>>();
        debug!(
            formula = text,
            names = names.len(),
            reference_calls = collector.reference_calls.len(),
            "Built binding plan"
        );

        Ok(Arc::new(BindingPlan {
            text: text.to_string(),
            tree,
            names,
            strategies: collector.strategies,
            calls: collector.calls,
            reference_calls: collector.reference_calls,
        }))
    }
}

struct PlanCollector<'s> {
    service: &'s AnalysisService,
    strategies: BTreeMap<String, ResolutionStrategy>,
    calls: BTreeMap<String, CallCategory>,
    reference_calls: Vec<ReferenceCall>,
}

impl PlanCollector<'_> {
    fn record_value(&mut self, name: &str) {
        let strategy = if constant_value(name).is_some() {
            ResolutionStrategy::Literal
        } else {
            ResolutionStrategy::ExternalLookup
        };
        // A value use outranks a raw-only use of the same name
        self.strategies.insert(name.to_string(), strategy);
    }

    fn record_raw(&mut self, name: &str) {
        self.strategies
            .entry(name.to_string())
            .or_insert(ResolutionStrategy::RawName);
    }

    /// `nested` is true inside the arguments of a reference call, whose own
    /// reference calls are handled when those arguments are evaluated
    fn collect(&mut self, expr: &Expr, nested: bool) -> Result<()> {
        match expr {
            Expr::Number(_) | Expr::Text(_) | Expr::Bool(_) => Ok(()),
            Expr::Name { name, .. } => {
                self.record_value(name);
                Ok(())
            },
            Expr::Unary { operand, .. } => self.collect(operand, nested),
            Expr::Binary { left, right, .. } => {
                self.collect(left, nested)?;
                self.collect(right, nested)
            },
            Expr::Call {
                function,
                args,
                span,
            } => {
                let category = self.service.category_of(function);
                self.calls.insert(function.clone(), category);

                if category != CallCategory::ReferenceConsuming {
                    for arg in args {
                        self.collect(arg, nested)?;
                    }
                    return Ok(());
                }

                let raw_name = match args.first() {
                    Some(Expr::Name { name, .. }) => name.clone(),
                    Some(Expr::Text(name)) => name.clone(),
                    Some(_) => {
                        return Err(FormulaError::invalid_call(
                            function,
                            "first argument must be a name",
                        ))
                    },
                    None => {
                        return Err(FormulaError::invalid_call(
                            function,
                            "missing the name argument",
                        ))
                    },
                };
                self.record_raw(&raw_name);

                for arg in &args[1..] {
                    self.collect(arg, true)?;
                }

                if !nested {
                    let index = self.reference_calls.len();
                    self.reference_calls.push(ReferenceCall {
                        function: function.clone(),
                        raw_name,
                        args: args[1..].to_vec(),
                        span: *span,
                        index,
                    });
                }
                Ok(())
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn service() -> AnalysisService {
        AnalysisService::new(["metadata", "integrate"], ["clamp"])
    }

    #[test]
    fn test_identical_text_is_parsed_once() {
        let service = service();
        let first = service.analyze("a + b").unwrap();
        let second = service.analyze("a + b").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.parse_count(), 1);

        service.analyze("a+b").unwrap();
        assert_eq!(service.parse_count(), 2);
    }

    #[test]
    fn test_parse_failure_is_cached() {
        let service = service();
        let first = service.analyze("a + ").unwrap_err();
        let second = service.analyze("a + ").unwrap_err();
        assert_eq!(first, second);
        assert_eq!(service.parse_count(), 1);
    }

    #[test]
    fn test_names_cover_every_identifier() {
        let service = service();
        let plan = service
            .analyze("clamp(sensor.a, low, high) + if(flag, pi, 0)")
            .unwrap();

        let names: Vec<&str> = plan.names.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["flag", "high", "low", "pi", "sensor.a"]);
        assert_eq!(plan.strategy("pi"), Some(ResolutionStrategy::Literal));
        assert_eq!(
            plan.strategy("sensor.a"),
            Some(ResolutionStrategy::ExternalLookup)
        );
        assert_eq!(plan.calls["clamp"], CallCategory::Registered);
        assert_eq!(plan.calls["if"], CallCategory::Builtin);
        assert!(!plan.has_reference_calls());
    }

    #[test]
    fn test_reference_call_first_argument_is_raw() {
        let service = service();
        let plan = service
            .analyze("metadata(sensor.door, 'last_changed') + integrate(power, k)")
            .unwrap();

        assert!(plan.has_reference_calls());
        assert_eq!(plan.strategy("sensor.door"), Some(ResolutionStrategy::RawName));
        assert_eq!(plan.strategy("power"), Some(ResolutionStrategy::RawName));
        assert_eq!(plan.strategy("k"), Some(ResolutionStrategy::ExternalLookup));
        assert_eq!(plan.reference_calls.len(), 2);
        assert_eq!(plan.reference_calls[0].raw_name, "sensor.door");
        assert_eq!(plan.reference_calls[1].placeholder(), "__ref1_integrate");
        assert_eq!(
            plan.categories(),
            BTreeSet::from([CallCategory::ReferenceConsuming])
        );
    }

    #[test]
    fn test_value_use_outranks_raw_use() {
        let service = service();
        let plan = service.analyze("integrate(power) + power").unwrap();
        assert_eq!(
            plan.strategy("power"),
            Some(ResolutionStrategy::ExternalLookup)
        );
        let plan = service.analyze("power + integrate(power)").unwrap();
        assert_eq!(
            plan.strategy("power"),
            Some(ResolutionStrategy::ExternalLookup)
        );
    }

    #[test]
    fn test_nested_reference_calls_are_not_top_level() {
        let service = service();
        let plan = service
            .analyze("integrate(p, metadata(sensor.x, 'factor'))")
            .unwrap();
        assert_eq!(plan.reference_calls.len(), 1);
        assert!(plan.names.contains("sensor.x"));
    }

    #[test]
    fn test_invalid_reference_call() {
        let service = service();
        assert!(matches!(
            service.analyze("integrate(a + b)"),
            Err(FormulaError::InvalidReferenceCall { .. })
        ));
        assert!(matches!(
            service.analyze("metadata()"),
            Err(FormulaError::InvalidReferenceCall { .. })
        ));
    }

    #[test]
    fn test_evict_forces_reparse() {
        let service = service();
        service.analyze("x * 2").unwrap();
        assert!(service.tree("x * 2").is_some());
        service.evict("x * 2");
        assert!(service.tree("x * 2").is_none());
        service.analyze("x * 2").unwrap();
        assert_eq!(service.parse_count(), 2);
    }
}
