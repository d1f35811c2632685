//! Evaluation orchestrator
//!
//! One group evaluation runs five strictly sequential phases:
//!
//! | Phase | Work |
//! |-------|------|
//! | 0 Guard | result-cache short circuit, open circuits |
//! | 1 Plan & Detect | binding plans, dependency order, cycle detection |
//! | 2 Context Prepare | one lazy context sized to the plan union |
//! | 3 Execute | formulas in dependency order, fallbacks applied |
//! | 4 Consolidate | classification, breaker and cache updates, report |
//!
//! A fatal condition stops the remaining formulas; they are reported as
//! aborted. Cancellation and deadlines are checked between phases and
//! between formulas.

use crate::alternate::{select_fallback, AlternateState};
use crate::compiled::{CompiledCache, CompiledCacheStats};
use crate::config::EngineConfig;
use crate::context::{EvaluationContext, ExternalLookup};
use crate::error::{FormulaError, Result};
use crate::executor::Executor;
use crate::functions::FunctionRegistry;
use crate::graph;
use crate::group::{FormulaGroup, FormulaId, FormulaKind, GroupPlan, PlannedFallback, STATE_TOKEN};
use crate::guard::{CircuitBreaker, ResultCache};
use crate::handlers::{HandlerRegistry, ReferenceHandler};
use crate::plan::{AnalysisService, BindingPlan};
use crate::result::{EvaluationResult, TransientKind, TransientReason};
use crate::state::{group_prefix, MemoryStateStore, StateStore};
use crate::value::FormulaValue;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn};

/// Orchestrator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Guarded,
    Planned,
    ContextReady,
    Executing,
    Consolidated,
    Failed,
}

impl Phase {
    fn next(self) -> Option<Phase> {
        match self {
            Phase::Created => Some(Phase::Guarded),
            Phase::Guarded => Some(Phase::Planned),
            Phase::Planned => Some(Phase::ContextReady),
            Phase::ContextReady => Some(Phase::Executing),
            Phase::Executing => Some(Phase::Consolidated),
            Phase::Consolidated | Phase::Failed => None,
        }
    }
}

/// Tracks the phase of one evaluation; phases only move forward
struct PhaseTracker {
    phase: Phase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: Phase::Created,
        }
    }

    fn advance(&mut self, to: Phase) -> Result<()> {
        if self.phase.next() != Some(to) {
            return Err(FormulaError::internal(format!(
                "illegal phase transition {:?} -> {:?}",
                self.phase, to
            )));
        }
        debug!(from = ?self.phase, to = ?to, "Phase transition");
        self.phase = to;
        Ok(())
    }

    fn fail(&mut self) {
        debug!(from = ?self.phase, "Phase transition to failed");
        self.phase = Phase::Failed;
    }
}

/// Cancellation and deadline for one evaluation
#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl EvaluationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Reason to abandon the evaluation, if any
    fn abandoned(&self) -> Option<&'static str> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some("cancelled");
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some("deadline exceeded");
        }
        None
    }
}

/// Group-wide outcome
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    /// Every formula was classified
    Completed,
    /// A group-wide fatal condition (invalid group, cycle, fatal formula)
    Failed(FormulaError),
    /// Cancelled or past its deadline; results cover executed formulas only
    Abandoned(String),
}

/// Outcome of one formula in one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaReport {
    pub id: FormulaId,
    pub kind: FormulaKind,
    /// Final result, after fallbacks
    pub result: EvaluationResult,
    /// Classification of the outcome before fallbacks
    pub alternate: Option<AlternateState>,
    /// Fallback entry that produced `result`
    pub fallback: Option<AlternateState>,
}

/// Result of one group evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub group_id: String,
    /// Final phase: `Consolidated` or `Failed`
    pub phase: Phase,
    pub outcome: GroupOutcome,
    /// Declaration order
    pub formulas: Vec<FormulaReport>,
    pub from_cache: bool,
}

impl GroupReport {
    pub fn formula(&self, id: &str) -> Option<&FormulaReport> {
        self.formulas.iter().find(|f| f.id == id)
    }

    pub fn result(&self, id: &str) -> Option<&EvaluationResult> {
        self.formula(id).map(|f| &f.result)
    }

    pub fn value(&self, id: &str) -> Option<&FormulaValue> {
        self.result(id).and_then(EvaluationResult::value)
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == GroupOutcome::Completed
    }
}

/// Diagnostics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    /// Distinct texts in the AST/plan cache
    pub analyzed_texts: usize,
    pub parse_count: u64,
    pub compiled_entries: usize,
    pub compiled_hits: u64,
    pub compilations: u64,
    pub compiled_evictions: u64,
    pub open_circuits: usize,
    pub cached_reports: usize,
    pub evaluations: u64,
}

/// Builder for [`FormulaEngine`]
pub struct FormulaEngineBuilder {
    config: EngineConfig,
    state_store: Option<Arc<dyn StateStore>>,
    handlers: HandlerRegistry,
    functions: FunctionRegistry,
}

impl FormulaEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Store for stateful handlers (default: in memory)
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Add or replace a reference-aware handler
    pub fn handler(mut self, handler: impl ReferenceHandler + 'static) -> Self {
        self.handlers.register(handler);
        self
    }

    /// Add or replace a pure function
    pub fn function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[FormulaValue]) -> Result<FormulaValue> + Send + Sync + 'static,
    {
        self.functions.register(name, function);
        self
    }

    pub fn build(self) -> Result<FormulaEngine> {
        self.config.validate()?;

        let state_store = self
            .state_store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        let mut handlers = HandlerRegistry::with_builtins(state_store.clone());
        handlers.extend(self.handlers);

        let analysis = AnalysisService::new(handlers.names(), self.functions.names());
        Ok(FormulaEngine {
            compiled: CompiledCache::new(self.config.compiled_cache_capacity),
            breaker: CircuitBreaker::new(self.config.circuit_breaker.clone()),
            results: ResultCache::new(&self.config.result_cache),
            analysis,
            handlers,
            functions: self.functions,
            state_store,
            config: self.config,
            evaluations: AtomicU64::new(0),
        })
    }
}

/// Formula evaluation engine
///
/// Shared between threads; each call to [`FormulaEngine::evaluate`] builds its
/// own context, so independent groups evaluate in parallel.
pub struct FormulaEngine {
    config: EngineConfig,
    analysis: AnalysisService,
    compiled: CompiledCache,
    handlers: HandlerRegistry,
    functions: FunctionRegistry,
    state_store: Arc<dyn StateStore>,
    breaker: CircuitBreaker,
    results: ResultCache,
    evaluations: AtomicU64,
}

/// Per-formula bookkeeping during Phase 3
struct Executed {
    raw: EvaluationResult,
    result: EvaluationResult,
    fallback: Option<AlternateState>,
    /// Not executed because of an earlier fatal outcome
    aborted: bool,
}

impl FormulaEngine {
    pub fn builder() -> FormulaEngineBuilder {
        FormulaEngineBuilder {
            config: EngineConfig::default(),
            state_store: None,
            handlers: HandlerRegistry::new(),
            functions: FunctionRegistry::with_builtins(),
        }
    }

    /// Engine with default configuration and built-ins
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Binding plan of one text (cached)
    pub fn analyze(&self, text: &str) -> Result<Arc<BindingPlan>> {
        self.analysis.analyze(text)
    }

    pub fn evaluate(&self, group: &FormulaGroup, lookup: &dyn ExternalLookup) -> GroupReport {
        self.evaluate_with(group, lookup, &EvaluationOptions::default())
    }

    pub fn evaluate_with(
        &self,
        group: &FormulaGroup,
        lookup: &dyn ExternalLookup,
        options: &EvaluationOptions,
    ) -> GroupReport {
        let span = info_span!("formula_group", group = %group.id);
        let _enter = span.enter();
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let mut tracker = PhaseTracker::new();
        match self.run_phases(group, lookup, options, &mut tracker) {
            Ok(report) => report,
            Err(err) => {
                if err.is_internal() {
                    error!(
                        target: "voltage_formula::internal",
                        group = %group.id,
                        error = %err,
                        "Internal error"
                    );
                } else {
                    error!(group = %group.id, error = %err, "Group evaluation failed");
                }
                tracker.fail();
                Self::failed_report(group, tracker.phase, err)
            },
        }
    }

    fn run_phases(
        &self,
        group: &FormulaGroup,
        lookup: &dyn ExternalLookup,
        options: &EvaluationOptions,
        tracker: &mut PhaseTracker,
    ) -> Result<GroupReport> {
        // === Phase 0: guard ===
        if let Some(reason) = options.abandoned() {
            return Ok(Self::abandoned_report(group, tracker, reason, Vec::new()));
        }
        let fingerprint = group.fingerprint()?;
        let snapshot = lookup.snapshot_version();
        if let Some(version) = snapshot {
            if let Some(mut cached) = self.results.get(&group.id, fingerprint, version) {
                debug!(version, "Result cache hit");
                cached.from_cache = true;
                return Ok(cached);
            }
        }
        let open: HashSet<&str> = group
            .formulas
            .iter()
            .map(|f| f.id.as_str())
            .filter(|id| self.breaker.is_open(&group.id, id))
            .collect();
        tracker.advance(Phase::Guarded)?;

        // === Phase 1: plan & detect ===
        let plan = GroupPlan::build(group, &self.analysis)?;
        let order = graph::order(&plan)?;
        tracker.advance(Phase::Planned)?;
        if let Some(reason) = options.abandoned() {
            return Ok(Self::abandoned_report(group, tracker, reason, Vec::new()));
        }

        // === Phase 2: context prepare ===
        let mut context = EvaluationContext::prepare(plan.bindings.clone(), lookup);
        tracker.advance(Phase::ContextReady)?;
        if let Some(reason) = options.abandoned() {
            return Ok(Self::abandoned_report(group, tracker, reason, Vec::new()));
        }

        // === Phase 3: execute in order ===
        tracker.advance(Phase::Executing)?;
        let executor =
            Executor::new(&self.analysis, &self.compiled, &self.handlers, &self.functions);
        let mut executed: HashMap<&str, Executed> = HashMap::with_capacity(order.len());
        let mut abort: Option<(String, FormulaError)> = None;

        for id in &order {
            if let Some(reason) = options.abandoned() {
                let done = Self::collect(&plan, &mut executed);
                return Ok(Self::abandoned_report(group, tracker, reason, done));
            }
            let Some(formula) = plan.formula(id) else {
                return Err(FormulaError::internal(format!(
                    "ordered formula {} not planned",
                    id
                )));
            };

            if let Some((cause, _)) = &abort {
                let result = EvaluationResult::Fatal(FormulaError::Aborted {
                    cause: cause.clone(),
                });
                context.set(id, result.as_lookup());
                executed.insert(
                    formula.id.as_str(),
                    Executed {
                        raw: result.clone(),
                        result,
                        fallback: None,
                        aborted: true,
                    },
                );
                continue;
            }

            context.enter_formula(formula.locals.clone());
            let raw = if open.contains(id.as_str()) {
                EvaluationResult::Transient(TransientReason::single(TransientKind::CircuitOpen, id))
            } else {
                match &formula.plan {
                    Ok(text_plan) => executor.execute(&group.id, text_plan, &mut context),
                    Err(err) => EvaluationResult::Fatal(err.clone()),
                }
            };
            let raw = self.apply_subject_policy(group, formula.kind, raw);

            // Fallbacks run in the same context so dependents see them
            let mut result = raw.clone();
            let mut fallback = None;
            if let Some(state) = AlternateState::classify(&raw) {
                if let Some((entry, planned)) = select_fallback(&formula.fallbacks, state) {
                    let replacement = match planned {
                        PlannedFallback::Literal(value) => EvaluationResult::Success(value.clone()),
                        PlannedFallback::Formula { plan: Ok(p), .. } => {
                            executor.execute(&group.id, p, &mut context)
                        },
                        PlannedFallback::Formula { plan: Err(e), .. } => {
                            EvaluationResult::Fatal(e.clone())
                        },
                    };
                    if replacement.is_success() {
                        debug!(formula = %id, fallback = entry.as_str(), "Fallback applied");
                        result = replacement;
                        fallback = Some(entry);
                    } else {
                        warn!(
                            formula = %id,
                            fallback = entry.as_str(),
                            outcome = %replacement,
                            "Fallback did not produce a value"
                        );
                    }
                }
            }
            context.leave_formula();
            context.set(id, result.as_lookup());

            match &result {
                EvaluationResult::Success(value) => {
                    debug!(formula = %id, %value, "Formula evaluated");
                },
                EvaluationResult::Transient(reason) => {
                    warn!(formula = %id, %reason, "Formula not evaluated");
                },
                EvaluationResult::Fatal(err) => {
                    if err.is_internal() {
                        error!(
                            target: "voltage_formula::internal",
                            formula = %id,
                            error = %err,
                            "Internal error"
                        );
                    } else {
                        error!(formula = %id, error = %err, "Formula failed");
                    }
                    abort = Some((id.clone(), err.clone()));
                },
            }

            executed.insert(
                formula.id.as_str(),
                Executed {
                    raw,
                    result,
                    fallback,
                    aborted: false,
                },
            );
        }

        // === Phase 4: consolidate ===
        for (id, entry) in &executed {
            if entry.aborted {
                continue;
            }
            match &entry.raw {
                EvaluationResult::Success(_) => self.breaker.record_success(&group.id, id),
                // A declared fatal fallback covered it
                EvaluationResult::Fatal(_) if entry.fallback.is_some() => {},
                EvaluationResult::Fatal(_) => {
                    self.breaker.record_failure(&group.id, id);
                },
                EvaluationResult::Transient(_) => {},
            }
        }

        let formulas = Self::collect(&plan, &mut executed);
        let report = match abort {
            Some((_, err)) => {
                tracker.fail();
                GroupReport {
                    group_id: group.id.clone(),
                    phase: tracker.phase,
                    outcome: GroupOutcome::Failed(err),
                    formulas,
                    from_cache: false,
                }
            },
            None => {
                tracker.advance(Phase::Consolidated)?;
                let report = GroupReport {
                    group_id: group.id.clone(),
                    phase: tracker.phase,
                    outcome: GroupOutcome::Completed,
                    formulas,
                    from_cache: false,
                };
                if let Some(version) = snapshot {
                    self.results
                        .insert(&group.id, fingerprint, version, report.clone());
                }
                report
            },
        };

        debug!(
            formulas = report.formulas.len(),
            lookups = context.external_lookups(),
            "Group consolidated"
        );
        Ok(report)
    }

    /// Transient outcome caused by the group's own subject becomes fatal
    /// when configured so
    fn apply_subject_policy(
        &self,
        group: &FormulaGroup,
        kind: FormulaKind,
        result: EvaluationResult,
    ) -> EvaluationResult {
        if !self.config.subject_missing_is_fatal {
            return result;
        }
        let (Some(subject), EvaluationResult::Transient(reason)) = (&group.subject, &result) else {
            return result;
        };
        let by_subject = reason.mentions(subject)
            || (kind == FormulaKind::Primary && reason.mentions(STATE_TOKEN));
        if !by_subject || reason.kind == TransientKind::CircuitOpen {
            return result;
        }
        EvaluationResult::Fatal(FormulaError::SubjectUnavailable {
            subject: subject.clone(),
            state: reason.kind.as_str().to_string(),
        })
    }

    /// Reports in declaration order for every executed formula
    fn collect(plan: &GroupPlan, executed: &mut HashMap<&str, Executed>) -> Vec<FormulaReport> {
        plan.formulas
            .iter()
            .filter_map(|formula| {
                executed.remove(formula.id.as_str()).map(|entry| FormulaReport {
                    id: formula.id.clone(),
                    kind: formula.kind,
                    alternate: if entry.aborted {
                        None
                    } else {
                        AlternateState::classify(&entry.raw)
                    },
                    result: entry.result,
                    fallback: entry.fallback,
                })
            })
            .collect()
    }

    fn abandoned_report(
        group: &FormulaGroup,
        tracker: &mut PhaseTracker,
        reason: &str,
        formulas: Vec<FormulaReport>,
    ) -> GroupReport {
        warn!(reason, "Group evaluation abandoned");
        tracker.fail();
        GroupReport {
            group_id: group.id.clone(),
            phase: tracker.phase,
            outcome: GroupOutcome::Abandoned(reason.to_string()),
            formulas,
            from_cache: false,
        }
    }

    /// Every formula carries the group-wide error
    pub(crate) fn failed_report(
        group: &FormulaGroup,
        phase: Phase,
        err: FormulaError,
    ) -> GroupReport {
        GroupReport {
            group_id: group.id.clone(),
            phase,
            formulas: group
                .formulas
                .iter()
                .map(|f| FormulaReport {
                    id: f.id.clone(),
                    kind: f.kind,
                    result: EvaluationResult::Fatal(err.clone()),
                    alternate: Some(AlternateState::Fatal),
                    fallback: None,
                })
                .collect(),
            outcome: GroupOutcome::Failed(err),
            from_cache: false,
        }
    }

    /// Forget persisted handler state of one group
    pub fn clear_group_state(&self, group_id: &str) -> Result<usize> {
        self.results.invalidate(group_id);
        self.state_store.delete_prefix(&group_prefix(group_id))
    }

    /// Drop the AST, compiled and result caches (memory pressure)
    pub fn clear_caches(&self) {
        self.analysis.clear();
        self.compiled.clear();
        self.results.clear();
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn compiled_stats(&self) -> CompiledCacheStats {
        self.compiled.stats()
    }

    pub fn stats(&self) -> EngineStats {
        let compiled = self.compiled.stats();
        EngineStats {
            analyzed_texts: self.analysis.len(),
            parse_count: self.analysis.parse_count(),
            compiled_entries: compiled.entries,
            compiled_hits: compiled.hits,
            compilations: compiled.compilations,
            compiled_evictions: compiled.evictions,
            open_circuits: self.breaker.open_count(),
            cached_reports: self.results.len(),
            evaluations: self.evaluations.load(Ordering::Relaxed),
        }
    }
}
