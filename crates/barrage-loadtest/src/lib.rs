//! # Barrage Load Testing Engine
//!
//! Scenario-driven HTTP load generation.
//!
//! ## Features
//!
//! - **Concurrent Scenarios**: constant and ramping VU profiles with start offsets
//! - **Virtual Users**: one tokio task per VU, cooperative stop at iteration boundaries
//! - **Weighted Traffic Mix**: cumulative-weight dispatch over named workloads
//! - **Metrics Collection**: counters, rates and HDR-backed trends, tagged per scenario
//! - **Thresholds**: pass/fail predicates deciding the process exit code
//! - **Export**: box-drawn console report, JSON and Prometheus text
//!
//! ## Usage
//!
//! ```bash
//! # Run the default smoke/load/stress/spike plan against a local service
//! cargo run --package barrage-loadtest -- run --target http://localhost:8080
//!
//! # Run a plan from a config file and keep the results
//! cargo run --package barrage-loadtest -- run --config config/stress-test.toml --output results.json
//!
//! # Check a config without running it
//! cargo run --package barrage-loadtest -- validate --config config/stress-test.toml
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   RunOrchestrator ──► ScenarioExecutor (per scenario) ──► VuHandle (per VU)
//!         │                    │ RampController                 │
//!         │                    ▼                                ▼
//!   LifecycleHooks        live VU count                  WorkloadMix ──► Workload
//!                                                                           │
//!   ThresholdEvaluator ◄───────────── MetricSink ◄──── IterationContext ◄───┘
//! ```

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod export;
pub mod hooks;
pub mod orchestrator;
pub mod ramp;
pub mod report;
pub mod transport;
pub mod vu;
pub mod workloads;

pub use context::IterationContext;
pub use dispatcher::{Workload, WorkloadMix, WorkloadRegistry};
pub use error::{LoadTestError, Result, TransportError};
pub use executor::{AbortHandle, AbortSignal, ExecutorEvent, ScenarioExecutor, ScenarioReport};
pub use export::render_prometheus;
pub use hooks::{HealthCheckHooks, LifecycleHooks, NoopHooks, SetupContext};
pub use orchestrator::{RunOrchestrator, RunPhase, RunPlan};
pub use ramp::{RampController, RampStep};
pub use report::{RunResult, EXIT_FAILED, EXIT_FATAL, EXIT_PASSED};
pub use transport::{HttpTransport, Method, Request, Response, Transport};
pub use vu::{VuEnvironment, VuHandle, VuReport};
pub use workloads::{user_api_registry, ErrorPolicy, Step};
