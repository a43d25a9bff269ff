//! Scenario executor
//!
//! Owns one scenario's VU arena and keeps its Running count equal to the
//! ramp controller's target. Scale-up spawns fresh VUs; scale-down signals
//! the most recently spawned Running VUs to stop after their current
//! iteration. When the profile finishes, every VU is stopped and joined
//! before the executor reports.

use crate::error::{LoadTestError, Result};
use crate::ramp::{RampController, RampStep};
use crate::vu::{VuEnvironment, VuHandle};
use barrage_core::{ScenarioSpec, Tags, VuState};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// RUN CONTROL
// ============================================================================

/// Operator abort switch shared by a run's executors
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Signal every executor to stop its VUs and wind down
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of an [`AbortHandle`]
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once an abort is signalled; pending forever otherwise
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ============================================================================
// EVENTS & REPORT
// ============================================================================

/// Diagnostic lifecycle events; they carry no metric semantics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    ScenarioStarted { scenario: String },
    VuSpawned { scenario: String, vu: u64 },
    VuStopping { scenario: String, vu: u64 },
    VuStopped { scenario: String, vu: u64 },
    ScenarioFinished { scenario: String, aborted: bool },
}

/// Outcome of one scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub executor: String,
    pub vus_spawned: u64,
    pub peak_vus: usize,
    pub iterations: u64,
    pub aborted: bool,
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Drives one scenario's concurrency profile
pub struct ScenarioExecutor {
    spec: ScenarioSpec,
    env: VuEnvironment,
    tick: Duration,
    abort: AbortSignal,
    live: watch::Sender<usize>,
    events: Option<mpsc::UnboundedSender<ExecutorEvent>>,

    vus: Vec<VuHandle>,
    next_id: u64,
    vus_spawned: u64,
    peak_vus: usize,
    iterations: u64,
}

impl ScenarioExecutor {
    pub fn new(spec: ScenarioSpec, env: VuEnvironment, tick: Duration, abort: AbortSignal) -> Self {
        let (live, _rx) = watch::channel(0);
        Self {
            spec,
            env,
            tick,
            abort,
            live,
            events: None,
            vus: Vec::new(),
            next_id: 1,
            vus_spawned: 0,
            peak_vus: 0,
            iterations: 0,
        }
    }

    /// Forward lifecycle events to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ExecutorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Live count of Running VUs
    pub fn live_vus(&self) -> watch::Receiver<usize> {
        self.live.subscribe()
    }

    pub fn spec(&self) -> &ScenarioSpec {
        &self.spec
    }

    /// Run the scenario against `run_start`, honouring its start offset
    pub async fn run(mut self, run_start: Instant) -> Result<ScenarioReport> {
        let name = self.spec.name.clone();

        let mut abort = self.abort.clone();
        tokio::select! {
            _ = sleep_until(run_start + self.spec.start_offset) => {}
            _ = abort.aborted() => {
                info!(scenario = %name, "Aborted before start");
                return Ok(self.report(true));
            }
        }

        info!(
            scenario = %name,
            executor = %self.spec.executor_kind(),
            duration = ?self.spec.total_duration(),
            peak_vus = self.spec.peak_vus(),
            "Scenario started"
        );
        self.emit(ExecutorEvent::ScenarioStarted {
            scenario: name.clone(),
        });

        let tags = self.vu_tags();
        let scenario_start = Instant::now();
        let mut ramp = RampController::for_scenario(&self.spec, self.tick);
        let mut aborted = false;

        loop {
            self.reap().await?;

            let elapsed = scenario_start.elapsed();
            match ramp.advance(elapsed) {
                RampStep::Target(target) => self.scale_to(target as usize, &tags),
                RampStep::Finished => break,
            }
            self.publish_live();

            let wake = scenario_start + ramp.next_wake(elapsed);
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = abort.aborted() => {
                    warn!(scenario = %name, "Abort signalled, stopping VUs");
                    aborted = true;
                    break;
                }
            }
        }

        self.shutdown().await?;
        info!(
            scenario = %name,
            iterations = self.iterations,
            vus_spawned = self.vus_spawned,
            aborted,
            "Scenario finished"
        );
        self.emit(ExecutorEvent::ScenarioFinished {
            scenario: name,
            aborted,
        });
        Ok(self.report(aborted))
    }

    fn vu_tags(&self) -> Tags {
        let mut tags = self.spec.tags.clone();
        tags.insert("scenario".to_string(), self.spec.name.clone());
        tags
    }

    fn running(&self) -> usize {
        self.vus
            .iter()
            .filter(|vu| vu.state() == VuState::Running)
            .count()
    }

    fn publish_live(&mut self) {
        let running = self.running();
        self.peak_vus = self.peak_vus.max(running);
        self.live.send_replace(running);
    }

    /// Spawn or stop VUs until exactly `target` are Running
    fn scale_to(&mut self, target: usize, tags: &Tags) {
        let running = self.running();
        if target > running {
            for _ in running..target {
                let id = self.next_id;
                self.next_id += 1;
                let mut vu = VuHandle::spawn(id, &self.spec.name, tags.clone(), &self.env);
                vu.mark_running();
                self.vus.push(vu);
                self.vus_spawned += 1;
                debug!(scenario = %self.spec.name, vu = id, "VU spawned");
                self.emit(ExecutorEvent::VuSpawned {
                    scenario: self.spec.name.clone(),
                    vu: id,
                });
            }
        } else if target < running {
            let excess = running - target;
            let mut stopped = Vec::with_capacity(excess);
            for vu in self
                .vus
                .iter_mut()
                .rev()
                .filter(|vu| vu.state() == VuState::Running)
                .take(excess)
            {
                vu.signal_stop();
                stopped.push(vu.id());
            }
            for id in stopped {
                debug!(scenario = %self.spec.name, vu = id, "VU stopping");
                self.emit(ExecutorEvent::VuStopping {
                    scenario: self.spec.name.clone(),
                    vu: id,
                });
            }
        }
    }

    /// Join stopping VUs whose tasks have exited
    async fn reap(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.vus.len() {
            let vu = &self.vus[i];
            if vu.state() == VuState::Stopping && vu.is_finished() {
                let vu = self.vus.swap_remove(i);
                self.finish(vu).await?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Stop every VU and wait for all of them
    async fn shutdown(&mut self) -> Result<()> {
        for vu in &mut self.vus {
            vu.signal_stop();
        }
        self.live.send_replace(0);
        for vu in std::mem::take(&mut self.vus) {
            self.finish(vu).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, mut vu: VuHandle) -> Result<()> {
        let report = vu.join().await.map_err(|e| LoadTestError::Executor {
            scenario: self.spec.name.clone(),
            reason: format!("VU {} task failed: {}", vu.id(), e),
        })?;
        self.iterations += report.iterations;
        debug!(
            scenario = %self.spec.name,
            vu = vu.id(),
            iterations = report.iterations,
            state = %vu.state(),
            "VU stopped"
        );
        self.emit(ExecutorEvent::VuStopped {
            scenario: self.spec.name.clone(),
            vu: vu.id(),
        });
        Ok(())
    }

    fn emit(&self, event: ExecutorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn report(&self, aborted: bool) -> ScenarioReport {
        ScenarioReport {
            name: self.spec.name.clone(),
            executor: self.spec.executor_kind().to_string(),
            vus_spawned: self.vus_spawned,
            peak_vus: self.peak_vus,
            iterations: self.iterations,
            aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IterationContext;
    use crate::dispatcher::{Workload, WorkloadMix};
    use crate::error::TransportError;
    use crate::transport::{Request, Response, Transport};
    use async_trait::async_trait;
    use barrage_core::{MetricSink, RunStage, ThinkTime};
    use std::sync::Arc;
    use tokio::time::sleep;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn invoke(&self, _request: &Request) -> std::result::Result<Response, TransportError> {
            Ok(Response::new(200, "", Duration::ZERO))
        }
    }

    struct Idle;

    #[async_trait]
    impl Workload for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn execute(&self, _ctx: &IterationContext) {}
    }

    fn env(think: Duration) -> VuEnvironment {
        VuEnvironment {
            transport: Arc::new(NoTransport),
            sink: Arc::new(MetricSink::with_builtin_schema()),
            mix: Arc::new(WorkloadMix::single(Arc::new(Idle))),
            think_time: ThinkTime::fixed(think),
            seed: Some(1),
        }
    }

    async fn live_at(rx: &watch::Receiver<usize>, start: Instant, at: Duration) -> usize {
        tokio::time::sleep_until(start + at).await;
        *rx.borrow()
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_profile_window() {
        let spec = ScenarioSpec::constant("load_test", 4, Duration::from_millis(10_500))
            .with_start_offset(Duration::from_secs(5));
        let executor = ScenarioExecutor::new(
            spec,
            env(Duration::from_secs(1)),
            Duration::from_secs(1),
            AbortHandle::new().signal(),
        );
        let live = executor.live_vus();
        let start = Instant::now();
        let task = tokio::spawn(executor.run(start));

        assert_eq!(live_at(&live, start, Duration::from_secs(2)).await, 0);
        assert_eq!(live_at(&live, start, Duration::from_millis(5_001)).await, 4);
        assert_eq!(live_at(&live, start, Duration::from_secs(15)).await, 4);
        assert_eq!(live_at(&live, start, Duration::from_millis(15_501)).await, 0);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.vus_spawned, 4);
        assert_eq!(report.peak_vus, 4);
        assert!(!report.aborted);
        // The eleventh iteration is in flight at stop and runs to completion
        assert_eq!(report.iterations, 4 * 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_is_lifo() {
        let spec = ScenarioSpec::ramping(
            "spike_test",
            3,
            vec![
                RunStage::new(Duration::from_secs(2), 3),
                RunStage::new(Duration::ZERO, 1),
                RunStage::new(Duration::from_secs(5), 1),
            ],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = ScenarioExecutor::new(
            spec,
            env(Duration::from_secs(1)),
            Duration::from_secs(1),
            AbortHandle::new().signal(),
        )
        .with_events(tx);
        executor.run(Instant::now()).await.unwrap();

        let mut stopping = Vec::new();
        let mut stopped = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ExecutorEvent::VuStopping { vu, .. } => stopping.push(vu),
                ExecutorEvent::VuStopped { vu, .. } => stopped.push(vu),
                _ => {}
            }
        }
        // The drop to 1 VU retires the newest two
        assert_eq!(stopping, vec![3, 2]);
        stopped.sort_unstable();
        assert_eq!(stopped, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_target_spawns_nothing() {
        let spec = ScenarioSpec::ramping(
            "idle_test",
            0,
            vec![RunStage::new(Duration::from_secs(30), 0)],
        );
        let executor = ScenarioExecutor::new(
            spec,
            env(Duration::from_secs(1)),
            Duration::from_secs(1),
            AbortHandle::new().signal(),
        );
        let report = executor.run(Instant::now()).await.unwrap();
        assert_eq!(report.vus_spawned, 0);
        assert_eq!(report.iterations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_vus_after_current_iteration() {
        let abort = AbortHandle::new();
        let spec = ScenarioSpec::constant("soak_test", 2, Duration::from_secs(3_600));
        let executor = ScenarioExecutor::new(
            spec,
            env(Duration::from_secs(3)),
            Duration::from_secs(1),
            abort.signal(),
        );
        let start = Instant::now();
        let task = tokio::spawn(executor.run(start));

        sleep(Duration::from_secs(4)).await;
        abort.abort();
        let report = task.await.unwrap().unwrap();

        assert!(report.aborted);
        assert_eq!(report.iterations, 2 * 2);
        assert!(start.elapsed() < Duration::from_secs(7));
    }
}
