//! Pass/fail thresholds over aggregated metrics
//!
//! A threshold pairs a metric key (`http_req_duration` or
//! `http_req_duration{scenario=stress_test}`) with a predicate such as
//! `p(95)<1000` or `rate<0.1`. Trend values compare in milliseconds.

use crate::error::{ConfigError, Result};
use crate::metrics::{AggregatedMetric, MetricKind, MetricSink};
use crate::types::Tags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Statistic a predicate is applied to
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in 0..=100
    Percentile(f64),
    /// Fraction of true samples (rate) or per-second throughput (counter)
    Rate,
    /// Counter total
    Count,
}

impl Aggregation {
    /// Whether the statistic is a trend statistic measured in milliseconds
    pub fn is_latency(self) -> bool {
        matches!(
            self,
            Self::Avg | Self::Min | Self::Max | Self::Med | Self::Percentile(_)
        )
    }

    /// Whether the statistic is defined for a metric kind
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match self {
            Self::Avg | Self::Min | Self::Max | Self::Med | Self::Percentile(_) => {
                kind == MetricKind::Trend
            }
            Self::Rate => matches!(kind, MetricKind::Rate | MetricKind::Counter),
            Self::Count => kind == MetricKind::Counter,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({})", p),
            Self::Rate => f.write_str("rate"),
            Self::Count => f.write_str("count"),
        }
    }
}

/// Comparison operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => observed == bound,
            Self::Ne => observed != bound,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// Parsed `<aggregation> <op> <value>` expression
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Predicate {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison.symbol(), self.bound)
    }
}

impl FromStr for Predicate {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let s: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let op_at = s
            .find(|c| matches!(c, '<' | '>' | '=' | '!'))
            .ok_or_else(|| "missing comparison operator".to_string())?;
        let (agg, rest) = s.split_at(op_at);

        let aggregation = parse_aggregation(agg)?;

        let (comparison, value) = if let Some(v) = rest.strip_prefix("<=") {
            (Comparison::Le, v)
        } else if let Some(v) = rest.strip_prefix(">=") {
            (Comparison::Ge, v)
        } else if let Some(v) = rest.strip_prefix("==") {
            (Comparison::Eq, v)
        } else if let Some(v) = rest.strip_prefix("!=") {
            (Comparison::Ne, v)
        } else if let Some(v) = rest.strip_prefix('<') {
            (Comparison::Lt, v)
        } else if let Some(v) = rest.strip_prefix('>') {
            (Comparison::Gt, v)
        } else {
            return Err(format!("unknown operator in '{}'", rest));
        };

        // Trend bounds may carry a unit; the stored bound is in milliseconds
        let (number, scale) = if let Some(n) = value.strip_suffix("ms") {
            (n, Some(1.0))
        } else if let Some(n) = value.strip_suffix('s') {
            (n, Some(1000.0))
        } else {
            (value, None)
        };
        if scale.is_some() && !aggregation.is_latency() {
            return Err(format!("unit suffix on non-trend bound '{}'", value));
        }
        let bound = number
            .parse::<f64>()
            .map(|n| n * scale.unwrap_or(1.0))
            .map_err(|_| format!("invalid number '{}'", value))?;
        if !bound.is_finite() {
            return Err(format!("invalid number '{}'", value));
        }

        Ok(Self {
            aggregation,
            comparison,
            bound,
        })
    }
}

fn parse_aggregation(s: &str) -> std::result::Result<Aggregation, String> {
    match s {
        "avg" => return Ok(Aggregation::Avg),
        "min" => return Ok(Aggregation::Min),
        "max" => return Ok(Aggregation::Max),
        "med" => return Ok(Aggregation::Med),
        "rate" => return Ok(Aggregation::Rate),
        "count" => return Ok(Aggregation::Count),
        "" => return Err("missing aggregation".to_string()),
        _ => {}
    }

    // p(95), p(99.9) or the short form p95
    let digits = s
        .strip_prefix("p(")
        .and_then(|r| r.strip_suffix(')'))
        .or_else(|| s.strip_prefix('p'))
        .ok_or_else(|| format!("unknown aggregation '{}'", s))?;
    let p = digits
        .parse::<f64>()
        .map_err(|_| format!("invalid percentile '{}'", s))?;
    if (0.0..=100.0).contains(&p) {
        Ok(Aggregation::Percentile(p))
    } else {
        Err(format!("percentile {} out of range", p))
    }
}

/// Split `name{k=v,k2=v2}` into the metric name and its tag selector
pub fn parse_metric_key(key: &str) -> Result<(String, Tags)> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        return Ok((key.to_string(), Tags::new()));
    };
    let invalid = || ConfigError::InvalidPredicate {
        metric: key.to_string(),
        predicate: String::new(),
        reason: "malformed tag selector".to_string(),
    };

    let name = key[..open].trim();
    let body = key[open + 1..].strip_suffix('}').ok_or_else(invalid)?;
    let mut selector = Tags::new();
    for pair in body.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair.split_once('=').ok_or_else(invalid)?;
        selector.insert(k.trim().to_string(), v.trim().to_string());
    }
    if name.is_empty() {
        return Err(invalid());
    }
    Ok((name.to_string(), selector))
}

/// One configured threshold
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdSpec {
    /// Metric name
    pub metric: String,
    /// Only series carrying all of these tags are considered
    pub selector: Tags,
    pub predicate: Predicate,
    /// Metric key and expression as written in the configuration
    pub source: String,
}

impl ThresholdSpec {
    /// Parse a metric key and predicate expression
    pub fn parse(metric_key: &str, expression: &str) -> Result<Self> {
        let (metric, selector) = parse_metric_key(metric_key)?;
        let predicate =
            expression
                .parse::<Predicate>()
                .map_err(|reason| ConfigError::InvalidPredicate {
                    metric: metric_key.to_string(),
                    predicate: expression.to_string(),
                    reason,
                })?;
        Ok(Self {
            metric,
            selector,
            predicate,
            source: format!("{}: {}", metric_key.trim(), expression.trim()),
        })
    }

    /// Check the threshold against the sink's schema
    pub fn validate(&self, sink: &MetricSink) -> Result<()> {
        let kind = sink
            .kind_of(&self.metric)
            .ok_or_else(|| ConfigError::UnknownMetric(self.metric.clone()))?;
        if self.predicate.aggregation.applies_to(kind) {
            Ok(())
        } else {
            Err(ConfigError::AggregationMismatch {
                metric: self.metric.clone(),
                kind,
                aggregation: self.predicate.aggregation.to_string(),
            })
        }
    }

    /// Observed statistic for this threshold's aggregation.
    ///
    /// `None` when the metric has no samples.
    pub fn observe(&self, aggregate: &AggregatedMetric, elapsed: Duration) -> Option<f64> {
        if aggregate.sample_count() == 0 {
            return None;
        }
        match (aggregate, self.predicate.aggregation) {
            (AggregatedMetric::Trend(t), Aggregation::Avg) => t.avg_ms(),
            (AggregatedMetric::Trend(t), Aggregation::Min) => t.min_ms(),
            (AggregatedMetric::Trend(t), Aggregation::Max) => t.max_ms(),
            (AggregatedMetric::Trend(t), Aggregation::Med) => t.median_ms(),
            (AggregatedMetric::Trend(t), Aggregation::Percentile(p)) => t.percentile_ms(p),
            (AggregatedMetric::Rate { .. }, Aggregation::Rate) => aggregate.rate(),
            (AggregatedMetric::Counter { .. }, Aggregation::Count) => aggregate.sum(),
            (AggregatedMetric::Counter { .. }, Aggregation::Rate) => {
                let secs = elapsed.as_secs_f64();
                aggregate
                    .sum()
                    .map(|sum| if secs > 0.0 { sum / secs } else { 0.0 })
            }
            _ => None,
        }
    }
}

/// Result of evaluating one threshold
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    /// Metric key and expression as configured
    pub threshold: String,
    pub metric: String,
    pub passed: bool,
    /// Observed statistic; absent when the metric had no samples
    pub observed: Option<f64>,
}

/// Evaluates a fixed, validated set of thresholds against a sink
#[derive(Clone, Debug, Default)]
pub struct ThresholdEvaluator {
    thresholds: Vec<ThresholdSpec>,
}

impl ThresholdEvaluator {
    /// Build an evaluator, rejecting thresholds the sink cannot satisfy
    pub fn new(thresholds: Vec<ThresholdSpec>, sink: &MetricSink) -> Result<Self> {
        for threshold in &thresholds {
            threshold.validate(sink)?;
        }
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &[ThresholdSpec] {
        &self.thresholds
    }

    /// One outcome per threshold.
    ///
    /// A metric with zero samples passes.
    pub fn evaluate(&self, sink: &MetricSink, elapsed: Duration) -> Vec<ThresholdOutcome> {
        self.thresholds
            .iter()
            .map(|threshold| {
                let observed = sink
                    .snapshot_matching(&threshold.metric, &threshold.selector)
                    .and_then(|aggregate| threshold.observe(&aggregate, elapsed));
                let passed = observed.map_or(true, |value| {
                    threshold
                        .predicate
                        .comparison
                        .holds(value, threshold.predicate.bound)
                });
                ThresholdOutcome {
                    threshold: threshold.source.clone(),
                    metric: threshold.metric.clone(),
                    passed,
                    observed,
                }
            })
            .collect()
    }

    /// Logical AND of all outcomes
    pub fn all_passed(outcomes: &[ThresholdOutcome]) -> bool {
        outcomes.iter().all(|o| o.passed)
    }
}
