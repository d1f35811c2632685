//! voltage-formula - Formula evaluation engine for VoltageEMS
//!
//! Evaluates groups of related formulas (a primary formula plus attribute and
//! computed formulas) against values supplied by the host, once per cycle.
//!
//! # Features
//!
//! - **Parse once**: every distinct formula text is parsed and analyzed once
//! - **Compile once**: canonical expressions are compiled once and reused
//! - **Lazy context**: an input is looked up on first use and memoized
//! - **Dependency order**: formulas run after the formulas they read; cycles
//!   are reported before anything executes
//! - **Reference calls**: `metadata()`, `integrate()`, `moving_avg()`,
//!   `rate_of_change()` receive the entity name, not its value
//! - **Transient vs fatal**: a missing input defers the formula, a broken
//!   formula fails it
//!
//! # Example
//!
//! ```rust
//! use voltage_formula::{FormulaEngine, FormulaGroup, FormulaValue, Lookup, MapLookup};
//!
//! let engine = FormulaEngine::new().unwrap();
//! let group = FormulaGroup::new("feeder")
//!     .primary("total", "leg1 + leg2")
//!     .attribute("per_leg", "state / 2");
//!
//! let lookup = MapLookup::new()
//!     .with_value("leg1", 10.0)
//!     .with_value("leg2", 20.0);
//! let report = engine.evaluate(&group, &lookup);
//! assert_eq!(report.value("total"), Some(&FormulaValue::Number(30.0)));
//! assert_eq!(report.value("per_leg"), Some(&FormulaValue::Number(15.0)));
//!
//! // A missing input is transient, never an error
//! let lookup = MapLookup::new()
//!     .with_value("leg1", 10.0)
//!     .with_state("leg2", Lookup::Unavailable);
//! let report = engine.evaluate(&group, &lookup);
//! assert!(report.result("total").unwrap().is_transient());
//! ```
//!
//! # Evaluation phases
//!
//! | Phase | Work |
//! |-------|------|
//! | 0 | guard: result cache, circuit breaker |
//! | 1 | binding plans, dependency order, cycle detection |
//! | 2 | lazy context preparation |
//! | 3 | execution in dependency order |
//! | 4 | classification, fallbacks, report |

pub mod alternate;
pub mod ast;
pub mod compiled;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod functions;
pub mod graph;
pub mod group;
pub mod guard;
pub mod handlers;
pub mod parser;
pub mod plan;
pub mod result;
pub mod runner;
pub mod state;
pub mod value;

// Re-exports for convenience
pub use alternate::{AlternateState, FallbackValue};
pub use config::EngineConfig;
pub use context::{EvaluationContext, ExternalLookup, MapLookup};
pub use engine::{
    EngineStats, EvaluationOptions, FormulaEngine, FormulaEngineBuilder, FormulaReport,
    GroupOutcome, GroupReport, Phase,
};
pub use error::{FormulaError, Result};
pub use functions::FunctionRegistry;
pub use group::{FormulaDef, FormulaGroup, FormulaKind, VariableBinding};
pub use handlers::{HandlerCall, HandlerRegistry, ReferenceHandler};
pub use parser::parse_formula;
pub use plan::{AnalysisService, BindingPlan};
pub use result::{EvaluationResult, TransientKind, TransientReason};
pub use runner::CycleRunner;
pub use state::{MemoryStateStore, NullStateStore, StateStore};
pub use value::{FormulaValue, Lookup};

// Pure functions for direct use
pub use functions::{clamp, round, scale, sign};
