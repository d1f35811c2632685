//! Reference-aware handlers
//!
//! A reference-consuming call such as `integrate(power)` needs the name
//! `power` itself, not its current value. The executor dispatches these calls
//! here before compiling the formula; the handler's value is bound to a
//! placeholder identifier that takes the call's place in the canonical text.
//!
//! Built-in handlers: `metadata(entity, key)`, plus the stateful
//! `integrate(var[, factor])`, `moving_avg(var, window)` and
//! `rate_of_change(var)`.

use crate::context::EvaluationContext;
use crate::error::{FormulaError, Result};
use crate::plan::ReferenceCall;
use crate::state::{
    load_state, save_state, state_key, IntegrateState, MovingAvgState, RateOfChangeState,
    StateStore,
};
use crate::value::{FormulaValue, Lookup};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// One dispatched call
pub struct HandlerCall<'c, 'a> {
    pub group_id: &'c str,
    pub function: &'c str,
    /// First argument as a name, group aliases already followed
    pub raw_name: &'c str,
    /// Remaining arguments, evaluated
    pub args: &'c [FormulaValue],
    pub context: &'c mut EvaluationContext<'a>,
}

impl HandlerCall<'_, '_> {
    /// Current numeric value behind the raw name
    ///
    /// `Ok(Err(lookup))` carries a transient outcome the handler should return
    /// unchanged.
    pub fn numeric_input(&mut self) -> Result<std::result::Result<f64, Lookup>> {
        match self.context.get(self.raw_name) {
            Lookup::Value(value) => value.as_number().map(Ok).ok_or_else(|| {
                FormulaError::function(format!(
                    "{}(): '{}' is not numeric ({})",
                    self.function, self.raw_name, value
                ))
            }),
            Lookup::NotFound => Err(FormulaError::UnresolvedName(self.raw_name.to_string())),
            transient => Ok(Err(transient)),
        }
    }

    fn number_arg(&self, index: usize, default: Option<f64>) -> Result<f64> {
        match self.args.get(index) {
            Some(arg) => arg.as_number().ok_or_else(|| {
                FormulaError::invalid_call(
                    self.function,
                    format!("argument {} must be numeric", index + 2),
                )
            }),
            None => default.ok_or_else(|| {
                FormulaError::invalid_call(
                    self.function,
                    format!("missing argument {}", index + 2),
                )
            }),
        }
    }
}

/// Handler for one reference-consuming function
pub trait ReferenceHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, call: HandlerCall<'_, '_>) -> Result<Lookup>;
}

/// Result of routing one call: the fragment replacing it in the canonical
/// text and the value that fragment is bound to
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub fragment: String,
    pub value: Lookup,
}

/// Handlers keyed by function name
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ReferenceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `metadata` and the stateful handlers backed by `store`
    pub fn with_builtins(store: Arc<dyn StateStore>) -> Self {
        let backend = StateBackend::new(store);
        let mut registry = Self::new();
        registry.register(MetadataHandler);
        registry.register(IntegrateHandler(backend.clone()));
        registry.register(MovingAvgHandler(backend.clone()));
        registry.register(RateOfChangeHandler(backend));
        registry
    }

    pub fn register(&mut self, handler: impl ReferenceHandler + 'static) {
        self.handlers
            .insert(handler.name().to_string(), Arc::new(handler));
    }

    /// Take over every handler of `other`, replacing same-named ones
    pub fn extend(&mut self, other: HandlerRegistry) {
        self.handlers.extend(other.handlers);
    }

    pub fn get(&self, function: &str) -> Option<&Arc<dyn ReferenceHandler>> {
        self.handlers.get(function)
    }

    pub fn contains(&self, function: &str) -> bool {
        self.handlers.contains_key(function)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Dispatch one call site
    ///
    /// Identical signatures (function, resolved name, arguments) are handled
    /// once per cycle; later call sites reuse the memoized value.
    pub fn route(
        &self,
        group_id: &str,
        call: &ReferenceCall,
        args: &[FormulaValue],
        context: &mut EvaluationContext<'_>,
    ) -> Result<HandlerOutput> {
        let handler = self
            .get(&call.function)
            .ok_or_else(|| FormulaError::UnknownHandler(call.function.clone()))?;
        let raw_name = context.resolve_name(&call.raw_name);
        let signature = call_signature(&call.function, &raw_name, args);

        let value = match context.cached_call(&signature) {
            Some(value) => {
                trace!(signature = %signature, "Reference call served from cycle cache");
                value
            },
            None => {
                let value = handler.handle(HandlerCall {
                    group_id,
                    function: &call.function,
                    raw_name: &raw_name,
                    args,
                    context: &mut *context,
                })?;
                debug!(
                    group = group_id,
                    function = %call.function,
                    name = %raw_name,
                    ?value,
                    "Dispatched reference call"
                );
                context.cache_call(signature, value.clone());
                value
            },
        };

        Ok(HandlerOutput {
            fragment: call.placeholder(),
            value,
        })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

fn call_signature(function: &str, raw_name: &str, args: &[FormulaValue]) -> String {
    format!("{}({}; {:?})", function, raw_name, args)
}

// === Built-in handlers ===

/// `metadata(entity, key)`: host metadata about an entity
pub struct MetadataHandler;

impl ReferenceHandler for MetadataHandler {
    fn name(&self) -> &str {
        "metadata"
    }

    fn handle(&self, call: HandlerCall<'_, '_>) -> Result<Lookup> {
        let key = match call.args {
            [FormulaValue::Text(key)] => key,
            _ => {
                return Err(FormulaError::invalid_call(
                    "metadata",
                    "expects metadata(entity, 'key')",
                ))
            },
        };

        if let Some(value) = call.context.metadata(call.raw_name, key) {
            return Ok(Lookup::Value(value));
        }

        // Distinguish a missing entity from an untracked key
        match call.context.get(call.raw_name) {
            Lookup::NotFound => Err(FormulaError::UnresolvedName(call.raw_name.to_string())),
            Lookup::Value(_) => Ok(Lookup::Unknown),
            transient => Ok(transient),
        }
    }
}

/// Shared state access for stateful handlers
#[derive(Clone)]
pub struct StateBackend {
    store: Arc<dyn StateStore>,
    clock: fn() -> f64,
}

impl StateBackend {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            clock: unix_now,
        }
    }

    /// Replace the wall clock (seconds since the epoch)
    pub fn with_clock(mut self, clock: fn() -> f64) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> f64 {
        (self.clock)()
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// `integrate(var[, factor])`: time integral, accumulated += value * dt * factor
///
/// The first call only records the timestamp and returns 0.
pub struct IntegrateHandler(pub StateBackend);

impl ReferenceHandler for IntegrateHandler {
    fn name(&self) -> &str {
        "integrate"
    }

    fn handle(&self, mut call: HandlerCall<'_, '_>) -> Result<Lookup> {
        let unit_factor = call.number_arg(0, Some(1.0))?;
        let value = match call.numeric_input()? {
            Ok(value) => value,
            Err(transient) => return Ok(transient),
        };

        let store = self.0.store.as_ref();
        let key = state_key(call.group_id, "integrate", call.raw_name);
        let now = self.0.now();

        let Some(state) = load_state::<IntegrateState>(store, &key)? else {
            save_state(
                store,
                &key,
                &IntegrateState {
                    last_ts: now,
                    accumulated: 0.0,
                },
            )?;
            return Ok(Lookup::Value(0.0.into()));
        };

        let dt = now - state.last_ts;
        if dt <= 0.0 {
            return Ok(Lookup::Value(state.accumulated.into()));
        }

        let delta = value * dt * unit_factor;
        let accumulated = state.accumulated + delta;
        debug!(
            var = call.raw_name,
            value = value,
            dt = dt,
            delta = delta,
            accumulated = accumulated,
            "integrate"
        );

        save_state(
            store,
            &key,
            &IntegrateState {
                last_ts: now,
                accumulated,
            },
        )?;
        Ok(Lookup::Value(accumulated.into()))
    }
}

/// Largest accepted `moving_avg` window, in samples
pub const MAX_MOVING_AVG_WINDOW: usize = 10_000;

/// `moving_avg(var, window)`: average over the last `window` samples
pub struct MovingAvgHandler(pub StateBackend);

impl ReferenceHandler for MovingAvgHandler {
    fn name(&self) -> &str {
        "moving_avg"
    }

    fn handle(&self, mut call: HandlerCall<'_, '_>) -> Result<Lookup> {
        let window = call.number_arg(0, None)?;
        if !window.is_finite() || window < 1.0 || window > MAX_MOVING_AVG_WINDOW as f64 {
            return Err(FormulaError::invalid_call(
                "moving_avg",
                format!("window must be between 1 and {}", MAX_MOVING_AVG_WINDOW),
            ));
        }
        let window = window as usize;
        let value = match call.numeric_input()? {
            Ok(value) => value,
            Err(transient) => return Ok(transient),
        };

        let store = self.0.store.as_ref();
        let key = state_key(call.group_id, "moving_avg", call.raw_name);

        // A changed window size restarts the average
        let mut state = load_state::<MovingAvgState>(store, &key)?
            .filter(|s| s.window() == window)
            .unwrap_or_else(|| MovingAvgState::new(window));
        let avg = state.add(value);

        debug!(
            var = call.raw_name,
            value = value,
            window = window,
            avg = avg,
            "moving_avg"
        );

        save_state(store, &key, &state)?;
        Ok(Lookup::Value(avg.into()))
    }
}

/// `rate_of_change(var)`: dv/dt per second since the previous cycle
pub struct RateOfChangeHandler(pub StateBackend);

impl ReferenceHandler for RateOfChangeHandler {
    fn name(&self) -> &str {
        "rate_of_change"
    }

    fn handle(&self, mut call: HandlerCall<'_, '_>) -> Result<Lookup> {
        let value = match call.numeric_input()? {
            Ok(value) => value,
            Err(transient) => return Ok(transient),
        };

        let store = self.0.store.as_ref();
        let key = state_key(call.group_id, "rate", call.raw_name);
        let now = self.0.now();

        let rate = match load_state::<RateOfChangeState>(store, &key)? {
            Some(state) => {
                let dt = now - state.last_ts;
                let rate = if dt > 0.0 {
                    (value - state.last_value) / dt
                } else {
                    0.0
                };
                debug!(
                    var = call.raw_name,
                    value = value,
                    last_value = state.last_value,
                    dt = dt,
                    rate = rate,
                    "rate_of_change"
                );
                rate
            },
            // First call - store current and return 0
            None => 0.0,
        };

        save_state(
            store,
            &key,
            &RateOfChangeState {
                last_ts: now,
                last_value: value,
            },
        )?;
        Ok(Lookup::Value(rate.into()))
    }
}
