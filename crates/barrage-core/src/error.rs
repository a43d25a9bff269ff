//! Error types for scenario configuration and metric recording

use crate::metrics::MetricKind;
use thiserror::Error;

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while validating a run definition.
///
/// Every variant is fatal: a run with an invalid definition never starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    // === Scenarios ===
    /// Two scenarios share a name
    #[error("Duplicate scenario name: {0}")]
    DuplicateScenario(String),

    /// Scenario name is empty or contains characters unusable as a tag value
    #[error("Invalid scenario name '{0}'")]
    InvalidScenarioName(String),

    /// Executor kind string not recognised
    #[error("Unknown executor kind '{0}' (expected constant-vus or ramping-vus)")]
    UnknownExecutor(String),

    /// Required field missing for the executor kind
    #[error("Scenario '{scenario}' is missing '{field}'")]
    MissingField { scenario: String, field: &'static str },

    /// Ramping profile without stages
    #[error("Scenario '{0}' has no stages")]
    EmptyStages(String),

    /// Duration string could not be parsed
    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    /// No scenarios configured
    #[error("No scenarios configured")]
    NoScenarios,

    // === Thresholds ===
    /// Predicate string could not be parsed
    #[error("Invalid threshold predicate '{predicate}' for metric '{metric}': {reason}")]
    InvalidPredicate {
        metric: String,
        predicate: String,
        reason: String,
    },

    /// Threshold references a metric not declared in the sink schema
    #[error("Threshold references unknown metric '{0}'")]
    UnknownMetric(String),

    /// Aggregation is not defined for the metric's kind
    #[error("Aggregation '{aggregation}' is not valid for {kind} metric '{metric}'")]
    AggregationMismatch {
        metric: String,
        kind: MetricKind,
        aggregation: String,
    },

    // === Workload mix ===
    /// Weights are empty, negative, or do not partition [0,1)
    #[error("Invalid workload weights: {0}")]
    InvalidWeights(String),

    /// Workload mix names a workload that is not registered
    #[error("Unknown workload '{0}'")]
    UnknownWorkload(String),

    // === General ===
    /// Think-time interval with min greater than max
    #[error("Invalid think time: min {min_ms}ms exceeds max {max_ms}ms")]
    InvalidThinkTime { min_ms: u64, max_ms: u64 },

    /// Target URL missing or malformed
    #[error("Invalid target URL '{0}'")]
    InvalidTarget(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Errors raised by the metric sink
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    /// Sample kind disagrees with the kind registered for the metric name
    #[error("Metric '{name}' is registered as {registered}, got a {got} sample")]
    KindMismatch {
        name: String,
        registered: MetricKind,
        got: MetricKind,
    },

    /// Histogram allocation or recording failed
    #[error("Histogram error: {0}")]
    Histogram(String),
}
