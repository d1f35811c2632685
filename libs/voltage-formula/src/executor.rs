//! Handler routing and formula execution
//!
//! Executing one formula:
//! 1. every reference-consuming call is dispatched to its handler and the
//!    returned value is bound to the call's placeholder (formula-local layer)
//! 2. the tree is rendered to canonical text, with placeholders in place of
//!    those calls, and compiled through the compiled-expression cache
//! 3. only the identifiers of the compiled expression are read from the
//!    context; any of them without a value turns the outcome transient
//! 4. the compiled expression runs against exactly those values

use crate::ast::Expr;
use crate::compiled::CompiledCache;
use crate::context::{EvaluationContext, LocalBinding};
use crate::error::{FormulaError, Result};
use crate::functions::FunctionRegistry;
use crate::handlers::HandlerRegistry;
use crate::plan::{AnalysisService, BindingPlan, ReferenceCall};
use crate::result::{EvaluationResult, TransientKind, TransientReason};
use crate::value::{FormulaValue, Lookup};
use evalexpr::ContextWithMutableVariables;
use tracing::{debug, trace};

/// Non-fatal outcome of one execution
enum Step {
    Value(FormulaValue),
    Transient(TransientReason),
}

/// Canonical text of a plan: normalized rendering with reference calls
/// replaced by their placeholders
pub fn canonical_text(plan: &BindingPlan) -> String {
    plan.tree.root.render(&mut |expr| match expr {
        Expr::Call { span, .. } => plan
            .reference_calls
            .iter()
            .find(|call| call.span == *span)
            .map(ReferenceCall::placeholder),
        _ => None,
    })
}

/// Executes binding plans against a context
pub struct Executor<'e> {
    analysis: &'e AnalysisService,
    compiled: &'e CompiledCache,
    handlers: &'e HandlerRegistry,
    functions: &'e FunctionRegistry,
}

impl<'e> Executor<'e> {
    pub fn new(
        analysis: &'e AnalysisService,
        compiled: &'e CompiledCache,
        handlers: &'e HandlerRegistry,
        functions: &'e FunctionRegistry,
    ) -> Self {
        Self {
            analysis,
            compiled,
            handlers,
            functions,
        }
    }

    /// Execute one formula; every failure becomes a `Fatal` result
    pub fn execute(
        &self,
        group_id: &str,
        plan: &BindingPlan,
        context: &mut EvaluationContext<'_>,
    ) -> EvaluationResult {
        match self.run(group_id, plan, context) {
            Ok(Step::Value(value)) => EvaluationResult::Success(value),
            Ok(Step::Transient(reason)) => EvaluationResult::Transient(reason),
            Err(err) => EvaluationResult::Fatal(err),
        }
    }

    fn run(
        &self,
        group_id: &str,
        plan: &BindingPlan,
        context: &mut EvaluationContext<'_>,
    ) -> Result<Step> {
        // Arguments may contain reference calls of their own, whose
        // placeholders share names with ours; bind ours only once all calls
        // are dispatched.
        let mut placeholders = Vec::with_capacity(plan.reference_calls.len());
        for call in &plan.reference_calls {
            let mut args = Vec::with_capacity(call.args.len());
            for arg in &call.args {
                match self.evaluate_argument(group_id, arg, context)? {
                    Step::Value(value) => args.push(value),
                    transient => return Ok(transient),
                }
            }

            let output = self.handlers.route(group_id, call, &args, context)?;
            match output.value {
                Lookup::Value(value) => placeholders.push((output.fragment, value)),
                Lookup::NotFound => {
                    return Err(FormulaError::UnresolvedName(call.raw_name.clone()))
                },
                other => {
                    let kind =
                        TransientKind::from_lookup(&other).unwrap_or(TransientKind::Unavailable);
                    return Ok(Step::Transient(TransientReason::single(
                        kind,
                        call.raw_name.clone(),
                    )));
                },
            }
        }
        for (fragment, value) in placeholders {
            context.bind_local(fragment, LocalBinding::Value(Lookup::Value(value)));
        }

        let canonical = canonical_text(plan);
        let compiled = self.compiled.compile(&canonical)?;
        debug!(formula = %plan.text, canonical = %canonical, "Executing formula");

        // Scoped missing-value check: only names this expression reads
        let mut evaluator = evalexpr::HashMapContext::new();
        let mut missing: Vec<(TransientKind, String)> = Vec::new();
        for identifier in compiled.identifiers() {
            match context.get(identifier) {
                Lookup::Value(value) => {
                    evaluator
                        .set_value(identifier.clone(), value.to_operand())
                        .map_err(|e| {
                            FormulaError::internal(format!("Failed to bind {}: {}", identifier, e))
                        })?;
                },
                Lookup::NotFound => return Err(FormulaError::UnresolvedName(identifier.clone())),
                other => {
                    if let Some(kind) = TransientKind::from_lookup(&other) {
                        missing.push((kind, identifier.clone()));
                    }
                },
            }
        }

        if let Some(kind) = missing.iter().map(|(kind, _)| *kind).max() {
            let names = missing.into_iter().map(|(_, name)| name).collect();
            let reason = TransientReason::new(kind, names);
            trace!(formula = %plan.text, %reason, "Formula inputs missing");
            return Ok(Step::Transient(reason));
        }

        self.functions.install(&mut evaluator)?;
        let value = compiled
            .execute(&evaluator)
            .map_err(|e| match e {
                FormulaError::Execution { message, .. } => {
                    FormulaError::execution(&plan.text, message)
                },
                other => other,
            })?;
        let value = FormulaValue::from_evalexpr(value)
            .map_err(|e| FormulaError::execution(&plan.text, e.to_string()))?;

        if let FormulaValue::Number(n) = value {
            if !n.is_finite() {
                return Err(FormulaError::execution(
                    &plan.text,
                    format!("result is not a finite number ({})", n),
                ));
            }
        }
        Ok(Step::Value(value))
    }

    /// Evaluate a non-name argument of a reference call
    fn evaluate_argument(
        &self,
        group_id: &str,
        arg: &Expr,
        context: &mut EvaluationContext<'_>,
    ) -> Result<Step> {
        match arg {
            Expr::Number(n) => Ok(Step::Value(FormulaValue::Number(*n))),
            Expr::Text(s) => Ok(Step::Value(FormulaValue::Text(s.clone()))),
            Expr::Bool(b) => Ok(Step::Value(FormulaValue::Bool(*b))),
            _ => {
                let text = arg.render(&mut |_| None);
                let plan = self.analysis.analyze(&text)?;
                self.run(group_id, &plan, context)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::context::{MapLookup, SlotBinding};
    use crate::state::MemoryStateStore;
    use std::sync::Arc;

    struct Fixture {
        analysis: AnalysisService,
        compiled: CompiledCache,
        handlers: HandlerRegistry,
        functions: FunctionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let handlers = HandlerRegistry::with_builtins(Arc::new(MemoryStateStore::new()));
            let functions = FunctionRegistry::with_builtins();
            Self {
                analysis: AnalysisService::new(handlers.names(), functions.names()),
                compiled: CompiledCache::new(16),
                handlers,
                functions,
            }
        }

        fn run(&self, text: &str, lookup: &MapLookup) -> EvaluationResult {
            let plan = self.analysis.analyze(text).unwrap();
            let bindings = plan
                .names
                .iter()
                .map(|n| (n.clone(), SlotBinding::External))
                .collect::<Vec<_>>();
            let mut context = EvaluationContext::prepare(bindings, lookup);
            Executor::new(&self.analysis, &self.compiled, &self.handlers, &self.functions)
                .execute("g", &plan, &mut context)
        }
    }

    #[test]
    fn test_canonical_text_replaces_reference_calls() {
        let fixture = Fixture::new();
        let plan = fixture
            .analysis
            .analyze("integrate(power, 2) * 3 + abs(x)")
            .unwrap();
        assert_eq!(
            canonical_text(&plan),
            "((__ref0_integrate * 3.0) + abs(x))"
        );
    }

    #[test]
    fn test_integer_literals_divide_as_floats() {
        let fixture = Fixture::new();
        let result = fixture.run("7 / 2", &MapLookup::new());
        assert_eq!(result, EvaluationResult::Success(FormulaValue::Number(3.5)));
    }

    #[test]
    fn test_missing_check_names_only_transient_identifiers() {
        let fixture = Fixture::new();
        let lookup = MapLookup::new()
            .with_value("leg1", 10.0)
            .with_state("leg2", Lookup::Unavailable)
            .with_state("leg3", Lookup::Unknown);
        match fixture.run("leg1 + leg2 + leg3", &lookup) {
            EvaluationResult::Transient(reason) => {
                assert_eq!(reason.kind, TransientKind::Unavailable);
                assert_eq!(reason.names, vec!["leg2".to_string(), "leg3".to_string()]);
            },
            other => panic!("unexpected result: {other}"),
        }
    }

    #[test]
    fn test_false_and_zero_are_values() {
        let fixture = Fixture::new();
        let lookup = MapLookup::new()
            .with_value("flag", false)
            .with_value("zero", 0.0);
        assert_eq!(
            fixture.run("if(flag, 1, zero)", &lookup),
            EvaluationResult::Success(FormulaValue::Number(0.0))
        );
    }

    #[test]
    fn test_unresolved_name_is_fatal() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.run("ghost * 2", &MapLookup::new()),
            EvaluationResult::Fatal(FormulaError::UnresolvedName("ghost".into()))
        );
    }

    #[test]
    fn test_reference_and_nested_calls() {
        let fixture = Fixture::new();
        let lookup = MapLookup::new()
            .with_value("sensor.door", "on")
            .with_metadata("sensor.door", "factor", 4.0)
            .with_value("sensor.power", 100.0);
        assert_eq!(
            fixture.run(
                "metadata(sensor.door, 'factor') + moving_avg(sensor.power, metadata(sensor.door, 'factor'))",
                &lookup
            ),
            EvaluationResult::Success(FormulaValue::Number(104.0))
        );
    }

    #[test]
    fn test_division_by_zero_is_fatal() {
        let fixture = Fixture::new();
        assert!(fixture.run("1 / 0", &MapLookup::new()).is_fatal());
    }

    #[test]
    fn test_registered_function_errors_are_fatal() {
        let fixture = Fixture::new();
        let result = fixture.run("clamp(5, 10, 0)", &MapLookup::new());
        assert!(matches!(
            result,
            EvaluationResult::Fatal(FormulaError::Execution { .. })
        ));
    }
}
