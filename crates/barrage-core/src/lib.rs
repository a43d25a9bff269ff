//! # Barrage Core
//!
//! Data model and measurement layer of the Barrage load harness.
//!
//! This crate provides:
//! - `ScenarioSpec` / `RunStage` - declarative traffic shapes (constant or ramping VUs)
//! - `MetricSink` - concurrent, order-independent aggregation of counters, rates and trends
//! - `ThresholdEvaluator` - pass/fail predicates over aggregated metrics
//! - `LoadTestConfig` - the TOML configuration surface
//!
//! ## Flow
//!
//! ```text
//!   LoadTestConfig ──validate──► ScenarioSpec[] ──► (engine) ──► MetricSample
//!                  └──────────► ThresholdSpec[]                      │
//!                                     │                              ▼
//!                                     └──────► ThresholdEvaluator ◄── MetricSink
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod threshold;
pub mod types;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use threshold::*;
pub use types::*;
