//! Phase 0 guards: circuit breaker and result cache

use crate::config::{CircuitBreakerConfig, ResultCacheConfig};
use crate::engine::GroupReport;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Skips formulas that keep failing fatally
///
/// After `failure_threshold` consecutive fatal outcomes the formula is skipped
/// for `cooldown`. Once the cooldown elapses the formula runs again, and a
/// single further fatal outcome reopens the circuit. A success closes it.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// (group id, formula id) -> state
    states: DashMap<(String, String), BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    fn key(group: &str, formula: &str) -> (String, String) {
        (group.to_string(), formula.to_string())
    }

    /// Whether the formula must be skipped right now
    pub fn is_open(&self, group: &str, formula: &str) -> bool {
        let Some(mut state) = self.states.get_mut(&Self::key(group, formula)) else {
            return false;
        };
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Half-open: allow one attempt
                state.open_until = None;
                state.consecutive_failures = self.config.failure_threshold.saturating_sub(1);
                debug!(group, formula, "Circuit half-open");
                false
            },
            None => false,
        }
    }

    /// Record a fatal outcome; returns true when this trips the circuit
    pub fn record_failure(&self, group: &str, formula: &str) -> bool {
        let mut state = self.states.entry(Self::key(group, formula)).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold && state.open_until.is_none()
        {
            state.open_until = Some(Instant::now() + self.config.cooldown());
            warn!(
                group,
                formula,
                failures = state.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "Circuit opened"
            );
            return true;
        }
        false
    }

    pub fn record_success(&self, group: &str, formula: &str) {
        if self.states.remove(&Self::key(group, formula)).is_some() {
            debug!(group, formula, "Circuit closed");
        }
    }

    pub fn failures(&self, group: &str, formula: &str) -> u32 {
        self.states
            .get(&Self::key(group, formula))
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Number of currently open circuits
    pub fn open_count(&self) -> usize {
        let now = Instant::now();
        self.states
            .iter()
            .filter(|entry| entry.open_until.is_some_and(|until| now < until))
            .count()
    }

    pub fn reset(&self) {
        self.states.clear();
        info!("Circuit breaker reset");
    }
}

struct CachedReport {
    fingerprint: u64,
    snapshot_version: u64,
    report: GroupReport,
    inserted: u64,
}

#[derive(Default)]
struct ResultCacheInner {
    entries: HashMap<String, CachedReport>,
    tick: u64,
}

/// Last report per group, reused while neither the group definition nor the
/// lookup snapshot changed
pub struct ResultCache {
    enabled: bool,
    capacity: usize,
    inner: Mutex<ResultCacheInner>,
}

impl ResultCache {
    pub fn new(config: &ResultCacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.capacity.max(1),
            inner: Mutex::new(ResultCacheInner::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, group: &str, fingerprint: u64, snapshot_version: u64) -> Option<GroupReport> {
        if !self.enabled {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .entries
            .get(group)
            .filter(|c| c.fingerprint == fingerprint && c.snapshot_version == snapshot_version)
            .map(|c| c.report.clone())
    }

    pub fn insert(&self, group: &str, fingerprint: u64, snapshot_version: u64, report: GroupReport) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let inserted = inner.tick;

        if !inner.entries.contains_key(group) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, c)| c.inserted)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                inner.entries.remove(&key);
            }
        }

        inner.entries.insert(
            group.to_string(),
            CachedReport {
                fingerprint,
                snapshot_version,
                report,
                inserted,
            },
        );
    }

    pub fn invalidate(&self, group: &str) {
        self.inner.lock().entries.remove(group);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}
