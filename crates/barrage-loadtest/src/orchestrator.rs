//! Run orchestrator
//!
//! `Idle → Setup → Running → Teardown → Done`. Everything that can be
//! rejected up front (scenario names, thresholds against the metric
//! schema, weights) is rejected in [`RunOrchestrator::new`], so a run that
//! starts never fails on configuration. Setup failure ends the run before
//! any scenario is scheduled; teardown always runs once setup succeeded.

use crate::dispatcher::WorkloadMix;
use crate::error::{LoadTestError, Result};
use crate::executor::{AbortHandle, ExecutorEvent, ScenarioExecutor, ScenarioReport};
use crate::hooks::LifecycleHooks;
use crate::report::RunResult;
use crate::transport::Transport;
use crate::vu::VuEnvironment;
use barrage_core::{
    names, ConfigError, LoadTestConfig, MetricSink, ScenarioSpec, ThinkTime, ThresholdEvaluator,
    ThresholdSpec,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

// ============================================================================
// PHASE & PLAN
// ============================================================================

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Setup,
    Running,
    Teardown,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Setup => "setup",
            Self::Running => "running",
            Self::Teardown => "teardown",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Immutable description of one run
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub scenarios: Vec<ScenarioSpec>,
    pub thresholds: Vec<ThresholdSpec>,
    pub think_time: ThinkTime,
    pub ramp_tick: Duration,
    pub progress_interval: Duration,
    /// Fixed RNG seed for reproducible workload draws
    pub seed: Option<u64>,
}

impl RunPlan {
    pub fn new(scenarios: Vec<ScenarioSpec>) -> Self {
        Self {
            scenarios,
            thresholds: Vec::new(),
            think_time: ThinkTime::default(),
            ramp_tick: Duration::from_secs(1),
            progress_interval: Duration::from_secs(10),
            seed: None,
        }
    }

    /// Plan from a validated configuration
    pub fn from_config(config: &LoadTestConfig) -> barrage_core::Result<Self> {
        config.validate()?;
        Ok(Self {
            scenarios: config.scenario_specs()?,
            thresholds: config.threshold_specs()?,
            think_time: config.think_time,
            ramp_tick: config.engine.ramp_tick.get(),
            progress_interval: config.engine.progress_interval.get(),
            seed: None,
        })
    }

    pub fn with_threshold(mut self, threshold: ThresholdSpec) -> Self {
        self.thresholds.push(threshold);
        self
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Offset at which the last scenario window closes
    pub fn planned_duration(&self) -> Duration {
        self.scenarios
            .iter()
            .map(ScenarioSpec::end_offset)
            .max()
            .unwrap_or_default()
    }

    /// Most VUs the plan can run at once across overlapping scenario windows
    pub fn peak_concurrent_vus(&self) -> u32 {
        // Concurrency only rises when a window opens
        self.scenarios
            .iter()
            .map(|at| {
                let t = at.start_offset;
                self.scenarios
                    .iter()
                    .filter(|s| s.start_offset <= t && t < s.end_offset())
                    .map(ScenarioSpec::peak_vus)
                    .sum()
            })
            .max()
            .unwrap_or(0)
    }

    fn validate(&self) -> barrage_core::Result<()> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !seen.insert(scenario.name.as_str()) {
                return Err(ConfigError::DuplicateScenario(scenario.name.clone()));
            }
        }
        self.think_time.validate()
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Runs every scenario of a plan against one target
pub struct RunOrchestrator {
    plan: RunPlan,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn LifecycleHooks>,
    sink: Arc<MetricSink>,
    evaluator: ThresholdEvaluator,
    executors: Vec<ScenarioExecutor>,
    abort: AbortHandle,
    phase: watch::Sender<RunPhase>,
}

impl RunOrchestrator {
    /// Validate the plan and prepare one executor per scenario
    pub fn new(
        plan: RunPlan,
        transport: Arc<dyn Transport>,
        mix: WorkloadMix,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Result<Self> {
        plan.validate()?;

        let sink = Arc::new(MetricSink::with_builtin_schema());
        mix.declare_metrics(&sink)?;
        let evaluator = ThresholdEvaluator::new(plan.thresholds.clone(), &sink)?;

        let env = VuEnvironment {
            transport: Arc::clone(&transport),
            sink: Arc::clone(&sink),
            mix: Arc::new(mix),
            think_time: plan.think_time,
            seed: plan.seed,
        };
        let abort = AbortHandle::new();
        let executors = plan
            .scenarios
            .iter()
            .map(|spec| {
                ScenarioExecutor::new(spec.clone(), env.clone(), plan.ramp_tick, abort.signal())
            })
            .collect();
        let (phase, _rx) = watch::channel(RunPhase::Idle);

        Ok(Self {
            plan,
            transport,
            hooks,
            sink,
            evaluator,
            executors,
            abort,
            phase,
        })
    }

    /// Forward every executor's lifecycle events to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ExecutorEvent>) -> Self {
        self.executors = self
            .executors
            .into_iter()
            .map(|executor| executor.with_events(events.clone()))
            .collect();
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn sink(&self) -> Arc<MetricSink> {
        Arc::clone(&self.sink)
    }

    /// Running-VU count of a scenario
    pub fn live_vus(&self, scenario: &str) -> Option<watch::Receiver<usize>> {
        self.executors
            .iter()
            .find(|e| e.spec().name == scenario)
            .map(ScenarioExecutor::live_vus)
    }

    /// Execute the run to completion.
    ///
    /// An operator abort still tears down and yields a result flagged
    /// `aborted`; setup and executor failures are returned as errors.
    pub async fn run(mut self) -> Result<RunResult> {
        let started_at = Utc::now();

        self.set_phase(RunPhase::Setup);
        let context = match self.hooks.setup(self.transport.as_ref()).await {
            Ok(context) => context,
            Err(e) => {
                error!("Setup failed, no scenario started: {}", e);
                self.set_phase(RunPhase::Done);
                return Err(e);
            }
        };

        self.set_phase(RunPhase::Running);
        info!(
            scenarios = self.plan.scenarios.len(),
            thresholds = self.evaluator.thresholds().len(),
            planned = ?self.plan.planned_duration(),
            "Run started"
        );
        let run_start = Instant::now();

        let live: Vec<_> = self.executors.iter().map(ScenarioExecutor::live_vus).collect();
        let progress = tokio::spawn(report_progress(
            Arc::clone(&self.sink),
            self.evaluator.clone(),
            live,
            run_start,
            self.plan.progress_interval,
        ));

        let mut pending: FuturesUnordered<_> = std::mem::take(&mut self.executors)
            .into_iter()
            .map(|executor| {
                let name = executor.spec().name.clone();
                let task = tokio::spawn(executor.run(run_start));
                async move { (name, task.await) }
            })
            .collect();

        let mut reports = Vec::with_capacity(pending.len());
        let mut failure: Option<LoadTestError> = None;
        while let Some((scenario, joined)) = pending.next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(LoadTestError::Executor {
                    scenario: scenario.clone(),
                    reason: e.to_string(),
                })
            });
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(scenario = %scenario, "Executor failed, aborting run: {}", e);
                    self.abort.abort();
                    failure.get_or_insert(e);
                }
            }
        }
        progress.abort();
        let elapsed = run_start.elapsed();

        self.set_phase(RunPhase::Teardown);
        self.hooks.teardown(self.transport.as_ref(), context).await;
        self.set_phase(RunPhase::Done);

        if let Some(e) = failure {
            return Err(e);
        }

        let aborted = self.abort.is_aborted();
        let outcomes = self.evaluator.evaluate(&self.sink, elapsed);
        for outcome in outcomes.iter().filter(|o| !o.passed) {
            warn!(observed = ?outcome.observed, "Threshold failed: {}", outcome.threshold);
        }

        let order = |report: &ScenarioReport| {
            self.plan
                .scenarios
                .iter()
                .position(|s| s.name == report.name)
        };
        reports.sort_by_key(order);

        let metrics = self
            .sink
            .snapshot_all()
            .iter()
            .map(|(name, aggregate)| (name.clone(), aggregate.summary()))
            .collect();

        let result = RunResult::new(
            started_at,
            elapsed.as_secs_f64(),
            aborted,
            metrics,
            outcomes,
            reports,
        );
        info!(
            duration_secs = result.duration_secs,
            passed = result.passed,
            aborted,
            "Run complete"
        );
        Ok(result)
    }

    fn set_phase(&self, phase: RunPhase) {
        info!("Run phase: {}", phase);
        self.phase.send_replace(phase);
    }
}

/// Log request count, error rate and interim threshold status every
/// `interval` until aborted
async fn report_progress(
    sink: Arc<MetricSink>,
    evaluator: ThresholdEvaluator,
    live: Vec<watch::Receiver<usize>>,
    run_start: Instant,
    interval: Duration,
) {
    let interval = interval.max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval_at(run_start + interval, interval);
    loop {
        ticker.tick().await;
        let elapsed = run_start.elapsed();
        let requests = sink
            .snapshot(names::HTTP_REQS)
            .map_or(0, |m| m.sample_count());
        let error_rate = sink
            .snapshot(names::HTTP_REQ_FAILED)
            .and_then(|m| m.rate())
            .unwrap_or(0.0);
        let vus: usize = live.iter().map(|rx| *rx.borrow()).sum();
        let failing = evaluator
            .evaluate(&sink, elapsed)
            .iter()
            .filter(|o| !o.passed)
            .count();
        info!(
            elapsed_secs = elapsed.as_secs(),
            vus,
            requests,
            error_rate = %format!("{:.2}%", error_rate * 100.0),
            failing_thresholds = failing,
            "Progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IterationContext;
    use crate::dispatcher::Workload;
    use crate::error::TransportError;
    use crate::hooks::{NoopHooks, SetupContext};
    use barrage_core::RunStage;
    use crate::transport::{Request, Response};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Ok200;

    #[async_trait]
    impl Transport for Ok200 {
        async fn invoke(&self, _request: &Request) -> std::result::Result<Response, TransportError> {
            Ok(Response::new(200, "", Duration::from_millis(5)))
        }
    }

    struct Ping;

    #[async_trait]
    impl Workload for Ping {
        fn name(&self) -> &str {
            "ping"
        }

        async fn execute(&self, ctx: &IterationContext) {
            let _ = ctx.request(Request::get("/health")).await;
        }
    }

    /// Records the phase seen at each hook call
    struct Recording {
        phase: watch::Receiver<RunPhase>,
        seen: Arc<Mutex<Vec<RunPhase>>>,
    }

    #[async_trait]
    impl LifecycleHooks for Recording {
        async fn setup(
            &self,
            _transport: &dyn Transport,
        ) -> std::result::Result<SetupContext, LoadTestError> {
            self.seen.lock().push(*self.phase.borrow());
            Ok(SetupContext::default())
        }

        async fn teardown(&self, _transport: &dyn Transport, _context: SetupContext) {
            self.seen.lock().push(*self.phase.borrow());
        }
    }

    fn plan() -> RunPlan {
        RunPlan::new(vec![ScenarioSpec::constant(
            "smoke_test",
            1,
            Duration::from_millis(4_500),
        )])
        .with_think_time(ThinkTime::fixed(Duration::from_secs(1)))
        .with_seed(11)
    }

    fn orchestrator(plan: RunPlan, hooks: Arc<dyn LifecycleHooks>) -> Result<RunOrchestrator> {
        RunOrchestrator::new(
            plan,
            Arc::new(Ok200),
            WorkloadMix::single(Arc::new(Ping)),
            hooks,
        )
    }

    #[test]
    fn test_duplicate_scenarios_rejected() {
        let spec = ScenarioSpec::constant("smoke_test", 1, Duration::from_secs(1));
        let err = orchestrator(RunPlan::new(vec![spec.clone(), spec]), Arc::new(NoopHooks))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LoadTestError::Config(ConfigError::DuplicateScenario(_))
        ));
    }

    #[test]
    fn test_unknown_threshold_metric_rejected() {
        let plan = plan().with_threshold(ThresholdSpec::parse("users_archived", "count>0").unwrap());
        let err = orchestrator(plan, Arc::new(NoopHooks)).err().unwrap();
        assert!(matches!(
            err,
            LoadTestError::Config(ConfigError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_peak_concurrent_vus() {
        let stage = |secs, target| RunStage::new(Duration::from_secs(secs), target);

        // Back-to-back default scenarios never overlap; the spike peaks at 300
        let config = LoadTestConfig::default();
        assert_eq!(RunPlan::from_config(&config).unwrap().peak_concurrent_vus(), 300);

        let plan = RunPlan::new(vec![
            ScenarioSpec::constant("load_test", 10, Duration::from_secs(60)),
            ScenarioSpec::ramping("stress_test", 5, vec![stage(60, 50), stage(30, 0)])
                .with_start_offset(Duration::from_secs(30)),
            ScenarioSpec::constant("smoke_test", 1, Duration::from_secs(10))
                .with_start_offset(Duration::from_secs(60)),
        ]);
        assert_eq!(plan.peak_concurrent_vus(), 60);

        // A window closing as another opens does not overlap it
        let plan = RunPlan::new(vec![
            ScenarioSpec::constant("a", 40, Duration::from_secs(30)),
            ScenarioSpec::constant("b", 20, Duration::from_secs(30))
                .with_start_offset(Duration::from_secs(30)),
        ]);
        assert_eq!(plan.peak_concurrent_vus(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phases_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = orchestrator(plan(), Arc::new(NoopHooks)).unwrap();
        let hooks = Recording {
            phase: orchestrator.phase(),
            seen: Arc::clone(&seen),
        };
        let orchestrator = RunOrchestrator {
            hooks: Arc::new(hooks),
            ..orchestrator
        };
        let phase = orchestrator.phase();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(*seen.lock(), vec![RunPhase::Setup, RunPhase::Teardown]);
        assert_eq!(*phase.borrow(), RunPhase::Done);
        assert!(result.passed);
        assert!(!result.aborted);
        assert_eq!(result.scenarios.len(), 1);
        assert_eq!(result.scenarios[0].iterations, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_produces_flagged_result() {
        let plan = RunPlan::new(vec![ScenarioSpec::constant(
            "soak_test",
            3,
            Duration::from_secs(3_600),
        )])
        .with_think_time(ThinkTime::fixed(Duration::from_secs(2)));
        let orchestrator = orchestrator(plan, Arc::new(NoopHooks)).unwrap();
        let abort = orchestrator.abort_handle();
        let task = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        abort.abort();
        let result = task.await.unwrap().unwrap();

        assert!(result.aborted);
        assert_eq!(result.exit_code(), crate::report::EXIT_FAILED);
        assert!(result.duration_secs < 10.0);
        assert_eq!(result.scenarios[0].iterations, 3 * 3);
    }
}
