//! End-to-end group evaluation tests
//!
//! Covers dependency ordering, cycle detection, transient isolation, the
//! `state` token, group variables, fallbacks and reference handlers.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use voltage_formula::{
    AlternateState, EvaluationResult, ExternalLookup, FallbackValue, FormulaDef, FormulaEngine,
    FormulaError, FormulaGroup, FormulaKind, FormulaValue, GroupOutcome, HandlerCall, Lookup,
    MapLookup, MemoryStateStore, Phase, ReferenceHandler, StateStore, TransientKind,
    VariableBinding,
};

/// Lookup that counts resolutions per name
struct CountingLookup {
    inner: MapLookup,
    calls: Mutex<HashMap<String, usize>>,
}

impl CountingLookup {
    fn new(inner: MapLookup) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn count(&self, name: &str) -> usize {
        self.calls.lock().get(name).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl ExternalLookup for CountingLookup {
    fn lookup(&self, name: &str) -> Lookup {
        *self.calls.lock().entry(name.to_string()).or_insert(0) += 1;
        self.inner.lookup(name)
    }

    fn snapshot_version(&self) -> Option<u64> {
        self.inner.snapshot_version()
    }
}

fn number(n: f64) -> EvaluationResult {
    EvaluationResult::Success(FormulaValue::Number(n))
}

// ============================================================================
// Ordering and cycles
// ============================================================================

#[test]
fn test_formulas_run_after_their_producers() {
    let engine = FormulaEngine::new().unwrap();
    // Declared consumer-first
    let group = FormulaGroup::new("g")
        .computed("doubled", "base * 2")
        .primary("main", "doubled + 1")
        .computed("base", "input + 1");

    let report = engine.evaluate(&group, &MapLookup::new().with_value("input", 4.0));
    assert!(report.is_completed());
    assert_eq!(report.result("base"), Some(&number(5.0)));
    assert_eq!(report.result("doubled"), Some(&number(10.0)));
    assert_eq!(report.result("main"), Some(&number(11.0)));

    // Reports keep declaration order
    let ids: Vec<&str> = report.formulas.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["doubled", "main", "base"]);
}

#[test]
fn test_two_formula_cycle_fails_before_execution() {
    let engine = FormulaEngine::new().unwrap();
    let lookup = CountingLookup::new(MapLookup::new());
    let group = FormulaGroup::new("g")
        .primary("a", "b + 1")
        .attribute("b", "a + 1");

    let report = engine.evaluate(&group, &lookup);

    let expected = FormulaError::Cycle {
        members: vec!["a".into(), "b".into(), "a".into()],
    };
    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.outcome, GroupOutcome::Failed(expected.clone()));
    assert_eq!(report.result("a"), Some(&EvaluationResult::Fatal(expected.clone())));
    assert_eq!(report.result("b"), Some(&EvaluationResult::Fatal(expected)));

    // Nothing executed, nothing looked up
    assert_eq!(engine.stats().compilations, 0);
    assert_eq!(lookup.total(), 0);
}

#[test]
fn test_self_reference_is_a_cycle() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g")
        .primary("main", "1")
        .computed("z", "z + 1");

    let report = engine.evaluate(&group, &MapLookup::new());
    match &report.outcome {
        GroupOutcome::Failed(FormulaError::Cycle { members }) => {
            assert_eq!(members, &vec!["z".to_string(), "z".to_string()]);
        },
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        report.result("main"),
        Some(&EvaluationResult::Fatal(FormulaError::Cycle {
            members: vec!["z".into(), "z".into()]
        }))
    );
}

// ============================================================================
// Transient isolation
// ============================================================================

#[test]
fn test_unavailable_input_only_affects_its_formulas() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("feeder")
        .primary("total", "leg1 + leg2")
        .attribute("leg1_double", "leg1 * 2")
        .attribute("half", "state / 2");
    let lookup = MapLookup::new()
        .with_value("leg1", 10.0)
        .with_state("leg2", Lookup::Unavailable);

    let report = engine.evaluate(&group, &lookup);
    assert!(report.is_completed());
    assert_eq!(report.phase, Phase::Consolidated);

    match report.result("total").unwrap() {
        EvaluationResult::Transient(reason) => {
            assert_eq!(reason.kind, TransientKind::Unavailable);
            assert_eq!(reason.names, vec!["leg2".to_string()]);
        },
        other => panic!("unexpected result: {}", other),
    }
    assert_eq!(report.result("leg1_double"), Some(&number(20.0)));

    // Dependents of a transient formula are transient, never fatal
    assert!(report.result("half").unwrap().is_transient());
    assert_eq!(
        report.formula("total").unwrap().alternate,
        Some(AlternateState::Unavailable)
    );
}

#[test]
fn test_transient_and_fatal_are_reported_differently() {
    let engine = FormulaEngine::new().unwrap();
    let lookup = MapLookup::new()
        .with_value("leg1", 10.0)
        .with_state("leg2", Lookup::Unavailable);

    let transient_group = FormulaGroup::new("t").primary("main", "leg1 + leg2");
    let fatal_group = FormulaGroup::new("f").primary("main", "leg1 + leg3");
    let transient = engine.evaluate(&transient_group, &lookup);
    let fatal = engine.evaluate(&fatal_group, &lookup);

    let transient = transient.result("main").unwrap().to_string();
    let fatal = fatal.result("main").unwrap().to_string();
    assert!(transient.contains("leg2"));
    assert!(transient.starts_with("temporarily unavailable"));
    assert!(fatal.contains("leg3"));
    assert!(fatal.starts_with("configuration error"));
}

#[test]
fn test_numeric_text_states_take_part_in_arithmetic() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("feeder")
        .primary("total", "leg1 + leg2")
        .attribute("energy", "integrate(leg1) + 0")
        .attribute("mode", "if(sensor.door == \"on\", 1, 0)");
    let lookup = MapLookup::new()
        .with_value("leg1", "10")
        .with_value("leg2", 5.0)
        .with_value("sensor.door", "on");

    let report = engine.evaluate(&group, &lookup);
    assert!(report.is_completed());
    assert_eq!(report.result("total"), Some(&number(15.0)));
    assert!(report.result("energy").unwrap().is_success());
    assert_eq!(report.result("mode"), Some(&number(1.0)));
}

#[test]
fn test_false_and_zero_are_memoized_values() {
    let engine = FormulaEngine::new().unwrap();
    let lookup = CountingLookup::new(
        MapLookup::new()
            .with_value("flag", false)
            .with_value("zero", 0.0),
    );
    let group = FormulaGroup::new("g")
        .primary("main", "if(flag, zero, zero + 1)")
        .attribute("twice", "zero * 2")
        .attribute("negated", "!flag");

    let report = engine.evaluate(&group, &lookup);
    assert_eq!(report.result("main"), Some(&number(1.0)));
    assert_eq!(report.result("twice"), Some(&number(0.0)));
    assert_eq!(
        report.result("negated"),
        Some(&EvaluationResult::Success(FormulaValue::Bool(true)))
    );

    // One resolution per name per cycle
    assert_eq!(lookup.count("flag"), 1);
    assert_eq!(lookup.count("zero"), 1);
}

#[test]
fn test_unused_names_are_never_looked_up() {
    let engine = FormulaEngine::new().unwrap();
    let lookup = CountingLookup::new(MapLookup::new().with_value("a", 1.0));
    let group = FormulaGroup::new("g")
        .primary("main", "a + 1")
        .with_formula(
            FormulaDef::new("side", "a * 2", FormulaKind::Attribute)
                .with_fallback(AlternateState::Unavailable, FallbackValue::formula("backup")),
        );

    engine.evaluate(&group, &lookup);
    assert_eq!(lookup.count("a"), 1);
    assert_eq!(lookup.count("backup"), 0);
}

// ============================================================================
// State token, variables, fallbacks
// ============================================================================

#[test]
fn test_state_reads_subject_then_primary_result() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g")
        .with_subject("sensor.temperature")
        .primary("main", "state * 2")
        .attribute("offset", "state + 1");
    let lookup = MapLookup::new().with_value("sensor.temperature", 5.0);

    let report = engine.evaluate(&group, &lookup);
    assert_eq!(report.result("main"), Some(&number(10.0)));
    assert_eq!(report.result("offset"), Some(&number(11.0)));
}

#[test]
fn test_group_variables() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g")
        .primary("main", "ratio * source + pi * 0")
        .variable("ratio", VariableBinding::literal(0.5))
        .variable("source", VariableBinding::entity("sensor.power"));
    let lookup = MapLookup::new().with_value("sensor.power", 300.0);

    let report = engine.evaluate(&group, &lookup);
    assert_eq!(report.result("main"), Some(&number(150.0)));
}

#[test]
fn test_group_from_yaml_with_fallbacks() {
    let yaml = r#"
id: feeder
subject: sensor.feeder
variables:
  ratio: 0.5
  main_leg: { entity: sensor.leg1 }
formulas:
  - id: total
    formula: "state * ratio"
    fallbacks:
      unavailable: 0
  - id: leg
    kind: attribute
    formula: "main_leg + state"
"#;
    let group: FormulaGroup = serde_yaml::from_str(yaml).unwrap();
    let engine = FormulaEngine::new().unwrap();

    let lookup = MapLookup::new()
        .with_value("sensor.feeder", 100.0)
        .with_value("sensor.leg1", 7.0);
    let report = engine.evaluate(&group, &lookup);
    assert_eq!(report.result("total"), Some(&number(50.0)));
    assert_eq!(report.result("leg"), Some(&number(57.0)));

    // Fallback value replaces the result and is what dependents read
    let lookup = MapLookup::new()
        .with_state("sensor.feeder", Lookup::Unavailable)
        .with_value("sensor.leg1", 7.0);
    let report = engine.evaluate(&group, &lookup);
    let total = report.formula("total").unwrap();
    assert_eq!(total.result, number(0.0));
    assert_eq!(total.alternate, Some(AlternateState::Unavailable));
    assert_eq!(total.fallback, Some(AlternateState::Unavailable));
    assert_eq!(report.result("leg"), Some(&number(7.0)));
}

#[test]
fn test_formula_fallback_and_catch_all() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g")
        .with_formula(
            FormulaDef::new("main", "primary_meter * 2", FormulaKind::Primary)
                .with_fallback(AlternateState::Absent, FallbackValue::formula("backup_meter * 2"))
                .with_fallback(AlternateState::Fallback, FallbackValue::literal(-1.0)),
        );

    let absent = MapLookup::new()
        .with_state("primary_meter", Lookup::Absent)
        .with_value("backup_meter", 21.0);
    let report = engine.evaluate(&group, &absent);
    assert_eq!(report.result("main"), Some(&number(42.0)));
    assert_eq!(report.formula("main").unwrap().fallback, Some(AlternateState::Absent));

    let unknown = MapLookup::new().with_state("primary_meter", Lookup::Unknown);
    let report = engine.evaluate(&group, &unknown);
    assert_eq!(report.result("main"), Some(&number(-1.0)));
    assert_eq!(report.formula("main").unwrap().fallback, Some(AlternateState::Fallback));
}

#[test]
fn test_catch_all_never_hides_fatal_outcomes() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g").with_formula(
        FormulaDef::new("main", "ghost + 1", FormulaKind::Primary)
            .with_fallback(AlternateState::Fallback, FallbackValue::literal(0.0)),
    );
    let report = engine.evaluate(&group, &MapLookup::new());
    assert!(report.result("main").unwrap().is_fatal());

    let group = FormulaGroup::new("g2").with_formula(
        FormulaDef::new("main", "ghost + 1", FormulaKind::Primary)
            .with_fallback(AlternateState::Fatal, FallbackValue::literal(0.0)),
    );
    let report = engine.evaluate(&group, &MapLookup::new());
    assert_eq!(report.result("main"), Some(&number(0.0)));
    assert!(report.is_completed());
}

// ============================================================================
// Reference handlers and functions
// ============================================================================

/// Returns the length of the entity id it is given
struct NameLength;

impl ReferenceHandler for NameLength {
    fn name(&self) -> &str {
        "name_len"
    }

    fn handle(&self, call: HandlerCall<'_, '_>) -> voltage_formula::Result<Lookup> {
        Ok(Lookup::Value(FormulaValue::Number(call.raw_name.len() as f64)))
    }
}

#[test]
fn test_custom_handler_receives_the_name() {
    let engine = FormulaEngine::builder()
        .handler(NameLength)
        .build()
        .unwrap();
    let lookup = CountingLookup::new(MapLookup::new());
    let group = FormulaGroup::new("g")
        .primary("main", "name_len(sensor.abc) + 1")
        .variable("alias", VariableBinding::entity("sensor.abcdef"))
        .attribute("aliased", "name_len(alias)");

    let report = engine.evaluate(&group, &lookup);
    assert_eq!(report.result("main"), Some(&number(11.0)));
    // Aliases are followed to the entity id
    assert_eq!(report.result("aliased"), Some(&number(13.0)));
    // The handler never asked for a value
    assert_eq!(lookup.total(), 0);
}

#[test]
fn test_custom_pure_function() {
    let engine = FormulaEngine::builder()
        .function("double", |args: &[FormulaValue]| {
            let value = args
                .first()
                .and_then(FormulaValue::as_number)
                .ok_or_else(|| FormulaError::function("double() expects a number"))?;
            Ok(FormulaValue::Number(value * 2.0))
        })
        .build()
        .unwrap();
    let group = FormulaGroup::new("g").primary("main", "double(x) + clamp(x, 0, 1)");

    let report = engine.evaluate(&group, &MapLookup::new().with_value("x", 4.0));
    assert_eq!(report.result("main"), Some(&number(9.0)));
}

#[test]
fn test_metadata_handler() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g")
        .primary("main", "metadata(sensor.door, 'open_count') * 10")
        .attribute("missing", "metadata(sensor.door, 'nope')");
    let lookup = MapLookup::new()
        .with_value("sensor.door", "on")
        .with_metadata("sensor.door", "open_count", 3.0);

    let report = engine.evaluate(&group, &lookup);
    assert_eq!(report.result("main"), Some(&number(30.0)));
    match report.result("missing").unwrap() {
        EvaluationResult::Transient(reason) => assert_eq!(reason.kind, TransientKind::Unknown),
        other => panic!("unexpected result: {}", other),
    }
}

#[test]
fn test_moving_average_across_cycles_and_reset() {
    let store = Arc::new(MemoryStateStore::new());
    let engine = FormulaEngine::builder()
        .state_store(store.clone())
        .build()
        .unwrap();
    let group = FormulaGroup::new("avg").primary("main", "moving_avg(power, 3)");

    let mut averages = Vec::new();
    for power in [10.0, 20.0, 30.0, 40.0] {
        let report = engine.evaluate(&group, &MapLookup::new().with_value("power", power));
        averages.push(report.value("main").and_then(FormulaValue::as_number).unwrap());
    }
    assert_eq!(averages, vec![10.0, 15.0, 20.0, 30.0]);
    assert!(!store.is_empty());

    assert_eq!(engine.clear_group_state("avg").unwrap(), 1);
    assert!(store.get("formula:state:avg:moving_avg:power").unwrap().is_none());

    let report = engine.evaluate(&group, &MapLookup::new().with_value("power", 5.0));
    assert_eq!(report.result("main"), Some(&number(5.0)));
}

#[test]
fn test_oversized_moving_average_window_is_fatal() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g").primary("main", "moving_avg(x, 100000000000000000000)");

    let report = engine.evaluate(&group, &MapLookup::new().with_value("x", 1.0));
    match report.result("main").unwrap() {
        EvaluationResult::Fatal(FormulaError::InvalidReferenceCall { function, .. }) => {
            assert_eq!(function, "moving_avg");
        },
        other => panic!("unexpected result: {}", other),
    }
    assert!(!report.is_completed());
}

#[test]
fn test_unknown_function_is_fatal() {
    let engine = FormulaEngine::new().unwrap();
    let group = FormulaGroup::new("g").primary("main", "nonexistent(1) + 1");
    let report = engine.evaluate(&group, &MapLookup::new());
    assert!(report.result("main").unwrap().is_fatal());
    assert!(!report.is_completed());
}
