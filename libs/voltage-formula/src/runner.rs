//! Cycle runner - evaluates many independent groups per cycle
//!
//! Group evaluation is synchronous, so each group of a cycle runs on tokio's
//! blocking pool. Groups share nothing but the engine's caches; reports come
//! back in registration order.

use crate::context::ExternalLookup;
use crate::engine::{EvaluationOptions, FormulaEngine, GroupOutcome, GroupReport, Phase};
use crate::error::FormulaError;
use crate::group::FormulaGroup;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default cycle interval (1s)
pub const DEFAULT_CYCLE_MS: u64 = 1000;

/// Periodic evaluation of registered groups
pub struct CycleRunner {
    engine: Arc<FormulaEngine>,
    lookup: Arc<dyn ExternalLookup>,
    groups: RwLock<Vec<Arc<FormulaGroup>>>,
    /// Reports of the most recent cycle
    latest: RwLock<Vec<GroupReport>>,
    /// Per-cycle budget; groups still running past it are abandoned
    cycle_timeout: Option<Duration>,
    /// Cancels in-flight evaluations on stop; replaced on every start
    cancel: Mutex<CancellationToken>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    cycle_ms: u64,
}

impl CycleRunner {
    /// A `cycle_ms` of 0 is raised to 1
    pub fn new(engine: Arc<FormulaEngine>, lookup: Arc<dyn ExternalLookup>, cycle_ms: u64) -> Self {
        if cycle_ms == 0 {
            warn!("Cycle interval of 0ms raised to 1ms");
        }
        Self {
            engine,
            lookup,
            groups: RwLock::new(Vec::new()),
            latest: RwLock::new(Vec::new()),
            cycle_timeout: None,
            cancel: Mutex::new(CancellationToken::new()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            cycle_ms: cycle_ms.max(1),
        }
    }

    pub fn cycle_ms(&self) -> u64 {
        self.cycle_ms
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = Some(timeout);
        self
    }

    /// Register a group, replacing one with the same id
    pub async fn add_group(&self, group: FormulaGroup) {
        let mut groups = self.groups.write().await;
        match groups.iter_mut().find(|g| g.id == group.id) {
            Some(existing) => *existing = Arc::new(group),
            None => groups.push(Arc::new(group)),
        }
    }

    pub async fn remove_group(&self, group_id: &str) -> bool {
        let mut groups = self.groups.write().await;
        let before = groups.len();
        groups.retain(|g| g.id != group_id);
        groups.len() != before
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Reports of the last completed cycle
    pub async fn latest_reports(&self) -> Vec<GroupReport> {
        self.latest.read().await.clone()
    }

    /// Evaluate every registered group once
    pub async fn run_cycle(&self) -> Vec<GroupReport> {
        let groups: Vec<Arc<FormulaGroup>> = self.groups.read().await.clone();
        let started = Instant::now();

        let mut options = EvaluationOptions::new().with_cancel(self.cancel.lock().child_token());
        if let Some(timeout) = self.cycle_timeout {
            options = options.with_deadline(started + timeout);
        }

        let handles: Vec<_> = groups
            .iter()
            .map(|group| {
                let engine = Arc::clone(&self.engine);
                let lookup = Arc::clone(&self.lookup);
                let group = Arc::clone(group);
                let options = options.clone();
                tokio::task::spawn_blocking(move || {
                    engine.evaluate_with(&group, lookup.as_ref(), &options)
                })
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (group, handle) in groups.iter().zip(handles) {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(group = %group.id, "Group evaluation task failed: {}", e);
                    reports.push(FormulaEngine::failed_report(
                        group,
                        Phase::Failed,
                        FormulaError::internal(format!("evaluation task failed: {}", e)),
                    ));
                },
            }
        }

        let failed = reports
            .iter()
            .filter(|r| matches!(r.outcome, GroupOutcome::Failed(_)))
            .count();
        debug!(
            groups = reports.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cycle finished"
        );

        *self.latest.write().await = reports.clone();
        reports
    }

    /// Start the cycle loop
    pub async fn start(&self) {
        if self.running.load(Ordering::Relaxed) {
            warn!("Cycle runner already running");
            return;
        }

        self.running.store(true, Ordering::Relaxed);
        *self.cancel.lock() = CancellationToken::new();
        info!("Starting cycle runner with {}ms cycle", self.cycle_ms);

        let mut cycle_interval = interval(Duration::from_millis(self.cycle_ms));

        loop {
            tokio::select! {
                _ = cycle_interval.tick() => {
                    self.run_cycle().await;
                }
                _ = self.shutdown.notified() => {
                    info!("Cycle runner received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        info!("Cycle runner stopped");
    }

    /// Stop the cycle loop and cancel in-flight evaluations
    pub fn stop(&self) {
        info!("Stopping cycle runner...");
        self.cancel.lock().cancel();
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::context::MapLookup;
    use crate::value::FormulaValue;

    fn runner(lookup: MapLookup) -> CycleRunner {
        CycleRunner::new(
            Arc::new(FormulaEngine::new().unwrap()),
            Arc::new(lookup),
            DEFAULT_CYCLE_MS,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cycle_keeps_registration_order() {
        let runner = runner(MapLookup::new().with_value("a", 2.0));
        for i in 0..8 {
            let group = FormulaGroup::new(format!("g{}", i)).primary("main", format!("a * {}", i));
            runner.add_group(group).await;
        }

        let reports = runner.run_cycle().await;
        assert_eq!(reports.len(), 8);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.group_id, format!("g{}", i));
            assert_eq!(
                report.value("main"),
                Some(&FormulaValue::Number(2.0 * i as f64))
            );
        }
        assert_eq!(runner.latest_reports().await.len(), 8);
    }

    #[tokio::test]
    async fn test_failing_group_does_not_affect_others() {
        let runner = runner(MapLookup::new().with_value("a", 1.0));
        runner
            .add_group(FormulaGroup::new("bad").primary("x", "y").attribute("y", "x"))
            .await;
        runner
            .add_group(FormulaGroup::new("good").primary("main", "a + 1"))
            .await;

        let reports = runner.run_cycle().await;
        assert!(!reports[0].is_completed());
        assert_eq!(reports[1].value("main"), Some(&FormulaValue::Number(2.0)));
    }

    #[tokio::test]
    async fn test_add_replaces_and_remove() {
        let runner = runner(MapLookup::new());
        runner.add_group(FormulaGroup::new("g").primary("main", "1")).await;
        runner.add_group(FormulaGroup::new("g").primary("main", "2")).await;
        assert_eq!(runner.group_count().await, 1);

        let reports = runner.run_cycle().await;
        assert_eq!(reports[0].value("main"), Some(&FormulaValue::Number(2.0)));

        assert!(runner.remove_group("g").await);
        assert!(!runner.remove_group("g").await);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let runner = Arc::new(CycleRunner::new(
            Arc::new(FormulaEngine::new().unwrap()),
            Arc::new(MapLookup::new()),
            10,
        ));
        runner.add_group(FormulaGroup::new("g").primary("main", "1")).await;

        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.is_running());

        runner.stop();
        task.await.unwrap();
        assert!(!runner.is_running());
        assert!(!runner.latest_reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop_evaluates_again() {
        let runner = Arc::new(CycleRunner::new(
            Arc::new(FormulaEngine::new().unwrap()),
            Arc::new(MapLookup::new()),
            10,
        ));
        runner.add_group(FormulaGroup::new("g").primary("main", "1")).await;

        for _ in 0..2 {
            let task = {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move { runner.start().await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(runner.is_running());
            runner.stop();
            task.await.unwrap();
        }

        let reports = runner.latest_reports().await;
        assert_eq!(reports[0].outcome, GroupOutcome::Completed);
        assert_eq!(reports[0].value("main"), Some(&FormulaValue::Number(1.0)));
    }

    #[tokio::test]
    async fn test_zero_cycle_interval_is_raised() {
        let runner = Arc::new(CycleRunner::new(
            Arc::new(FormulaEngine::new().unwrap()),
            Arc::new(MapLookup::new()),
            0,
        ));
        assert_eq!(runner.cycle_ms(), 1);

        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.start().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.stop();
        task.await.unwrap();
        assert!(!runner.is_running());
    }
}
