//! Virtual user runtime
//!
//! A VU is one tokio task looping over iterations: dispatch one workload to
//! completion, sleep a uniformly drawn think time, then look for a stop
//! signal. The stop flag is only read at that iteration boundary, so an
//! in-flight request or sleep is never cut short.

use crate::context::IterationContext;
use crate::dispatcher::WorkloadMix;
use crate::transport::Transport;
use barrage_core::{names, MetricSample, MetricSink, Tags, ThinkTime, VuState};
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Shared collaborators every VU of a run uses
#[derive(Clone)]
pub struct VuEnvironment {
    pub transport: Arc<dyn Transport>,
    pub sink: Arc<MetricSink>,
    pub mix: Arc<WorkloadMix>,
    pub think_time: ThinkTime,
    /// Base seed for reproducible draws, entropy when `None`
    pub seed: Option<u64>,
}

impl VuEnvironment {
    fn rng_for(&self, scenario: &str, vu_id: u64) -> StdRng {
        match self.seed {
            Some(seed) => {
                let salt = scenario
                    .bytes()
                    .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
                    });
                StdRng::seed_from_u64(seed ^ salt ^ vu_id.wrapping_mul(0x9e37_79b9_7f4a_7c15))
            }
            None => StdRng::from_entropy(),
        }
    }
}

/// What a VU did before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VuReport {
    pub iterations: u64,
}

struct VirtualUser {
    id: u64,
    tags: Tags,
    env: VuEnvironment,
    stop: Arc<AtomicBool>,
    rng: StdRng,
}

impl VirtualUser {
    async fn run(mut self) -> VuReport {
        let mut iterations = 0u64;
        loop {
            let started = Instant::now();
            let ctx = IterationContext::new(
                Arc::clone(&self.env.transport),
                Arc::clone(&self.env.sink),
                self.tags.clone(),
                self.id,
                iterations,
            );

            let draw: f64 = self.rng.gen();
            let dispatched = AssertUnwindSafe(self.env.mix.dispatch(draw, &ctx))
                .catch_unwind()
                .await;
            if dispatched.is_err() {
                warn!(vu = self.id, iteration = iterations, "Workload panicked, continuing");
            }

            sleep(self.think_time()).await;

            iterations += 1;
            self.env.sink.record_or_warn(MetricSample::counter(
                names::ITERATIONS,
                1.0,
                self.tags.clone(),
            ));
            self.env.sink.record_or_warn(MetricSample::duration(
                names::ITERATION_DURATION,
                started.elapsed(),
                self.tags.clone(),
            ));

            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }
        debug!(vu = self.id, iterations, "VU finished");
        VuReport { iterations }
    }

    fn think_time(&mut self) -> Duration {
        let (min, max) = (self.env.think_time.min.get(), self.env.think_time.max.get());
        if min >= max {
            min
        } else {
            self.rng.gen_range(min..=max)
        }
    }
}

/// Executor-side handle on one spawned VU.
///
/// Only the owning executor transitions the state.
pub struct VuHandle {
    id: u64,
    state: VuState,
    stop: Arc<AtomicBool>,
    task: JoinHandle<VuReport>,
}

impl VuHandle {
    /// Spawn the VU task. The handle starts in `Starting`.
    pub(crate) fn spawn(id: u64, scenario: &str, tags: Tags, env: &VuEnvironment) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let vu = VirtualUser {
            id,
            tags,
            rng: env.rng_for(scenario, id),
            env: env.clone(),
            stop: Arc::clone(&stop),
        };
        Self {
            id,
            state: VuState::Starting,
            stop,
            task: tokio::spawn(vu.run()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    pub(crate) fn mark_running(&mut self) {
        if self.state == VuState::Starting {
            self.state = VuState::Running;
        }
    }

    /// Ask the VU to stop after its current iteration
    pub(crate) fn signal_stop(&mut self) {
        if matches!(self.state, VuState::Starting | VuState::Running) {
            self.stop.store(true, Ordering::Release);
            self.state = VuState::Stopping;
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit and mark the handle `Stopped`
    pub(crate) async fn join(&mut self) -> Result<VuReport, JoinError> {
        let report = (&mut self.task).await;
        self.state = VuState::Stopped;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Workload;
    use crate::error::TransportError;
    use crate::transport::{Request, Response};
    use async_trait::async_trait;
    use barrage_core::MetricKind;
    use std::sync::atomic::AtomicU64;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn invoke(&self, _request: &Request) -> Result<Response, TransportError> {
            Err(TransportError::Other("unused".to_string()))
        }
    }

    struct Counting(Arc<AtomicU64>);

    #[async_trait]
    impl Workload for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self, _ctx: &IterationContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    #[async_trait]
    impl Workload for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, ctx: &IterationContext) {
            if ctx.iteration() == 0 {
                panic!("first iteration blows up");
            }
        }
    }

    /// Issues one request per iteration and ignores the outcome
    struct Requesting;

    #[async_trait]
    impl Workload for Requesting {
        fn name(&self) -> &str {
            "requesting"
        }

        async fn execute(&self, ctx: &IterationContext) {
            let _ = ctx.request(Request::get("/health")).await;
        }
    }

    fn env(workload: Arc<dyn Workload>, think: ThinkTime) -> VuEnvironment {
        VuEnvironment {
            transport: Arc::new(NoTransport),
            sink: Arc::new(MetricSink::with_builtin_schema()),
            mix: Arc::new(WorkloadMix::single(workload)),
            think_time: think,
            seed: Some(7),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_sleep_to_finish() {
        let count = Arc::new(AtomicU64::new(0));
        let env = env(
            Arc::new(Counting(Arc::clone(&count))),
            ThinkTime::fixed(Duration::from_secs(10)),
        );
        let start = Instant::now();
        let mut handle = VuHandle::spawn(1, "smoke_test", Tags::new(), &env);
        handle.mark_running();

        sleep(Duration::from_secs(1)).await;
        handle.signal_stop();
        assert_eq!(handle.state(), VuState::Stopping);

        sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        let report = handle.join().await.unwrap();
        assert_eq!(handle.state(), VuState::Stopped);
        assert_eq!(report.iterations, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_iterations_recorded() {
        let count = Arc::new(AtomicU64::new(0));
        let env = env(
            Arc::new(Counting(Arc::clone(&count))),
            ThinkTime::fixed(Duration::from_secs(1)),
        );
        let mut handle = VuHandle::spawn(1, "load_test", Tags::new(), &env);

        sleep(Duration::from_millis(2_500)).await;
        handle.signal_stop();
        let report = handle.join().await.unwrap();

        assert_eq!(report.iterations, 3);
        let iterations = env.sink.snapshot(names::ITERATIONS).unwrap();
        assert_eq!(iterations.sample_count(), 3);
        let durations = env.sink.snapshot(names::ITERATION_DURATION).unwrap();
        assert_eq!(durations.kind(), MetricKind::Trend);
        assert_eq!(durations.sample_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_workload_does_not_kill_vu() {
        let env = env(Arc::new(Panicking), ThinkTime::fixed(Duration::from_millis(100)));
        let mut handle = VuHandle::spawn(3, "stress_test", Tags::new(), &env);

        sleep(Duration::from_millis(250)).await;
        handle.signal_stop();
        let report = handle.join().await.unwrap();
        assert_eq!(report.iterations, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_do_not_stop_iterations() {
        let env = env(Arc::new(Requesting), ThinkTime::fixed(Duration::from_secs(1)));
        let mut handle = VuHandle::spawn(2, "load_test", Tags::new(), &env);

        sleep(Duration::from_millis(2_500)).await;
        handle.signal_stop();
        let report = handle.join().await.unwrap();

        assert_eq!(report.iterations, 3);
        let failed = env.sink.snapshot(names::HTTP_REQ_FAILED).unwrap();
        assert_eq!(failed.sample_count(), 3);
        assert_eq!(failed.rate(), Some(1.0));
        assert_eq!(env.sink.snapshot(names::ITERATIONS).unwrap().sample_count(), 3);
    }

    #[test]
    fn test_think_time_within_bounds() {
        let env = env(
            Arc::new(Panicking),
            ThinkTime::new(Duration::from_millis(500), Duration::from_millis(2_000)),
        );
        let mut vu = VirtualUser {
            id: 1,
            tags: Tags::new(),
            rng: env.rng_for("spike_test", 1),
            env,
            stop: Arc::new(AtomicBool::new(false)),
        };
        for _ in 0..1_000 {
            let pause = vu.think_time();
            assert!(pause >= Duration::from_millis(500) && pause <= Duration::from_millis(2_000));
        }
    }
}
