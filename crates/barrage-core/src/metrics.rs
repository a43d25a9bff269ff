//! Metric sink
//!
//! Thread-safe aggregation of counters, rates and trends keyed by metric
//! name plus tag set. Samples are append-only facts; aggregates are derived
//! on read and never depend on the order in which samples arrived:
//!
//! - counters keep an integer sum of millionths and a sample count
//! - rates keep true/total tallies
//! - trends keep exact integer-microsecond count/sum/min/max plus an HDR
//!   histogram for percentiles
//!
//! Each series (name + tags) has its own lock. The series index is a
//! sharded map, so concurrent VUs recording into different series never
//! contend on a single global lock.

use crate::error::MetricsError;
use crate::types::Tags;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Significant figures kept by trend histograms
const TREND_SIGFIG: u8 = 3;

/// Names of the metrics every run records
pub mod names {
    /// Counter: one per request attempt
    pub const HTTP_REQS: &str = "http_reqs";
    /// Trend: elapsed time of completed requests (ms)
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    /// Rate: transport failure or status >= 400
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    /// Rate: one sample per evaluated check
    pub const CHECKS: &str = "checks";
    /// Counter: completed VU iterations
    pub const ITERATIONS: &str = "iterations";
    /// Trend: wall time of a VU iteration including think time (ms)
    pub const ITERATION_DURATION: &str = "iteration_duration";
}

/// Kind of a metric
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => f.write_str("counter"),
            Self::Rate => f.write_str("rate"),
            Self::Trend => f.write_str("trend"),
        }
    }
}

// ============================================================================
// SAMPLES
// ============================================================================

/// One measurement emitted by a workload or the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    /// Counter increment, 0/1 for rates, milliseconds for trends
    pub value: f64,
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    fn new(name: &str, kind: MetricKind, value: f64, tags: Tags) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value,
            tags,
            timestamp: Utc::now(),
        }
    }

    /// Counter increment
    pub fn counter(name: &str, value: f64, tags: Tags) -> Self {
        Self::new(name, MetricKind::Counter, value, tags)
    }

    /// Boolean rate sample
    pub fn rate(name: &str, value: bool, tags: Tags) -> Self {
        Self::new(name, MetricKind::Rate, if value { 1.0 } else { 0.0 }, tags)
    }

    /// Trend observation in milliseconds
    pub fn trend(name: &str, value_ms: f64, tags: Tags) -> Self {
        Self::new(name, MetricKind::Trend, value_ms, tags)
    }

    /// Trend observation from a duration
    pub fn duration(name: &str, value: Duration, tags: Tags) -> Self {
        Self::trend(name, value.as_secs_f64() * 1000.0, tags)
    }
}

// ============================================================================
// AGGREGATES
// ============================================================================

/// Distribution of trend values.
///
/// Values are held as whole microseconds so count/sum/min/max are exact
/// integers and merging is associative.
#[derive(Debug, Clone)]
pub struct TrendAggregate {
    histogram: Histogram<u64>,
    count: u64,
    sum_us: u128,
    min_us: u64,
    max_us: u64,
}

impl TrendAggregate {
    fn new() -> Result<Self, MetricsError> {
        let histogram = Histogram::new(TREND_SIGFIG)
            .map_err(|e| MetricsError::Histogram(format!("{:?}", e)))?;
        Ok(Self {
            histogram,
            count: 0,
            sum_us: 0,
            min_us: u64::MAX,
            max_us: 0,
        })
    }

    fn record_ms(&mut self, value_ms: f64) -> Result<(), MetricsError> {
        let us = ms_to_us(value_ms);
        self.histogram
            .record(us)
            .map_err(|e| MetricsError::Histogram(format!("{:?}", e)))?;
        self.count += 1;
        self.sum_us += u128::from(us);
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
        Ok(())
    }

    fn merge(&mut self, other: &Self) -> Result<(), MetricsError> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| MetricsError::Histogram(format!("{:?}", e)))?;
        self.count += other.count;
        self.sum_us += other.sum_us;
        self.min_us = self.min_us.min(other.min_us);
        self.max_us = self.max_us.max(other.max_us);
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| us_to_ms(self.min_us))
    }

    pub fn max_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| us_to_ms(self.max_us))
    }

    pub fn avg_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_us as f64 / self.count as f64 / 1000.0)
    }

    /// Percentile (0..=100) in milliseconds.
    ///
    /// Clamped to the exact observed range, so a distribution of identical
    /// values reports that value at every percentile.
    pub fn percentile_ms(&self, percentile: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let quantile = (percentile / 100.0).clamp(0.0, 1.0);
        let us = self
            .histogram
            .value_at_quantile(quantile)
            .clamp(self.min_us, self.max_us);
        Some(us_to_ms(us))
    }

    pub fn median_ms(&self) -> Option<f64> {
        self.percentile_ms(50.0)
    }
}

impl PartialEq for TrendAggregate {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
            && self.sum_us == other.sum_us
            && self.min_us == other.min_us
            && self.max_us == other.max_us
            && self.histogram == other.histogram
    }
}

fn ms_to_us(value_ms: f64) -> u64 {
    if value_ms.is_finite() && value_ms > 0.0 {
        (value_ms * 1000.0).round() as u64
    } else {
        0
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// Counter increments are kept in millionths of a unit
const COUNTER_SCALE: f64 = 1_000_000.0;

fn to_counter_units(value: f64) -> i128 {
    if value.is_finite() {
        (value * COUNTER_SCALE).round() as i128
    } else {
        0
    }
}

/// Aggregate over every sample recorded for one metric (or one tag-filtered
/// subset of it)
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatedMetric {
    /// `units` is the running sum in millionths, see [`AggregatedMetric::sum`]
    Counter { units: i128, samples: u64 },
    Rate { trues: u64, total: u64 },
    Trend(TrendAggregate),
}

impl AggregatedMetric {
    fn empty(kind: MetricKind) -> Result<Self, MetricsError> {
        Ok(match kind {
            MetricKind::Counter => Self::Counter { units: 0, samples: 0 },
            MetricKind::Rate => Self::Rate { trues: 0, total: 0 },
            MetricKind::Trend => Self::Trend(TrendAggregate::new()?),
        })
    }

    fn add(&mut self, value: f64) -> Result<(), MetricsError> {
        match self {
            Self::Counter { units, samples } => {
                *units += to_counter_units(value);
                *samples += 1;
            }
            Self::Rate { trues, total } => {
                if value != 0.0 {
                    *trues += 1;
                }
                *total += 1;
            }
            Self::Trend(trend) => trend.record_ms(value)?,
        }
        Ok(())
    }

    /// Fold another aggregate of the same kind into this one
    pub fn merge(&mut self, other: &Self) -> Result<(), MetricsError> {
        match (self, other) {
            (Self::Counter { units, samples }, Self::Counter { units: u, samples: n }) => {
                *units += u;
                *samples += n;
            }
            (Self::Rate { trues, total }, Self::Rate { trues: t, total: n }) => {
                *trues += t;
                *total += n;
            }
            (Self::Trend(a), Self::Trend(b)) => a.merge(b)?,
            (this, other) => {
                return Err(MetricsError::KindMismatch {
                    name: String::new(),
                    registered: this.kind(),
                    got: other.kind(),
                })
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of samples folded into the aggregate
    pub fn sample_count(&self) -> u64 {
        match self {
            Self::Counter { samples, .. } => *samples,
            Self::Rate { total, .. } => *total,
            Self::Trend(trend) => trend.count(),
        }
    }

    /// Total of all increments, for counter metrics
    pub fn sum(&self) -> Option<f64> {
        match self {
            Self::Counter { units, .. } => Some(*units as f64 / COUNTER_SCALE),
            _ => None,
        }
    }

    /// Fraction of true samples, for rate metrics
    pub fn rate(&self) -> Option<f64> {
        match self {
            Self::Rate { trues, total } if *total > 0 => Some(*trues as f64 / *total as f64),
            Self::Rate { .. } => Some(0.0),
            _ => None,
        }
    }

    /// Summary suitable for reports and JSON output
    pub fn summary(&self) -> MetricSummary {
        match self {
            Self::Counter { samples, .. } => MetricSummary::Counter {
                count: self.sum().unwrap_or(0.0),
                samples: *samples,
            },
            Self::Rate { trues, total } => MetricSummary::Rate {
                rate: self.rate().unwrap_or(0.0),
                passes: *trues,
                fails: total - trues,
            },
            Self::Trend(t) => MetricSummary::Trend {
                count: t.count(),
                avg: t.avg_ms().unwrap_or(0.0),
                min: t.min_ms().unwrap_or(0.0),
                med: t.median_ms().unwrap_or(0.0),
                max: t.max_ms().unwrap_or(0.0),
                p90: t.percentile_ms(90.0).unwrap_or(0.0),
                p95: t.percentile_ms(95.0).unwrap_or(0.0),
                p99: t.percentile_ms(99.0).unwrap_or(0.0),
            },
        }
    }
}

/// Serializable view of an [`AggregatedMetric`]; trend values are in ms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: f64,
        samples: u64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        avg: f64,
        min: f64,
        med: f64,
        max: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
}

// ============================================================================
// SINK
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    tags: Tags,
}

/// Concurrent metric aggregator shared by every VU of a run
#[derive(Debug, Default)]
pub struct MetricSink {
    /// Declared kind per metric name
    schema: DashMap<String, MetricKind>,

    /// Per-series aggregates
    series: DashMap<SeriesKey, Arc<Mutex<AggregatedMetric>>>,

    /// Samples accepted since creation
    recorded: AtomicU64,
}

impl MetricSink {
    /// Empty sink with no declared metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink with the engine's built-in metrics declared
    pub fn with_builtin_schema() -> Self {
        let sink = Self::new();
        for (name, kind) in [
            (names::HTTP_REQS, MetricKind::Counter),
            (names::HTTP_REQ_DURATION, MetricKind::Trend),
            (names::HTTP_REQ_FAILED, MetricKind::Rate),
            (names::CHECKS, MetricKind::Rate),
            (names::ITERATIONS, MetricKind::Counter),
            (names::ITERATION_DURATION, MetricKind::Trend),
        ] {
            sink.schema.insert(name.to_string(), kind);
        }
        sink
    }

    /// Declare a metric so thresholds may reference it before any sample
    /// arrives. Re-declaring with the same kind is a no-op.
    pub fn declare(&self, name: &str, kind: MetricKind) -> Result<(), MetricsError> {
        let registered = match self.kind_of(name) {
            Some(registered) => registered,
            None => *self.schema.entry(name.to_string()).or_insert(kind),
        };
        if registered == kind {
            Ok(())
        } else {
            Err(MetricsError::KindMismatch {
                name: name.to_string(),
                registered,
                got: kind,
            })
        }
    }

    /// Kind declared for a metric name
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.schema.get(name).map(|k| *k)
    }

    /// Record one sample.
    ///
    /// Undeclared names are declared with the sample's kind on first use.
    pub fn record(&self, sample: MetricSample) -> Result<(), MetricsError> {
        self.declare(&sample.name, sample.kind)?;

        let key = SeriesKey {
            name: sample.name,
            tags: sample.tags,
        };
        let series = match self.series.get(&key) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let fresh = Arc::new(Mutex::new(AggregatedMetric::empty(sample.kind)?));
                Arc::clone(self.series.entry(key).or_insert(fresh).value())
            }
        };

        series.lock().add(sample.value)?;
        self.recorded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record, logging instead of propagating a rejected sample
    pub fn record_or_warn(&self, sample: MetricSample) {
        if let Err(e) = self.record(sample) {
            warn!("Dropped metric sample: {}", e);
        }
    }

    /// Aggregate across every tag set recorded for `name`.
    ///
    /// Returns `None` for undeclared metrics and an empty aggregate for
    /// declared metrics without samples.
    pub fn snapshot(&self, name: &str) -> Option<AggregatedMetric> {
        self.snapshot_matching(name, &Tags::new())
    }

    /// Aggregate across the series of `name` whose tags contain every
    /// `key=value` pair of `selector`
    pub fn snapshot_matching(&self, name: &str, selector: &Tags) -> Option<AggregatedMetric> {
        let kind = self.kind_of(name)?;
        let mut aggregate = match AggregatedMetric::empty(kind) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                warn!("Cannot aggregate '{}': {}", name, e);
                return None;
            }
        };

        let matching: Vec<Arc<Mutex<AggregatedMetric>>> = self
            .series
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.name == name
                    && selector
                        .iter()
                        .all(|(k, v)| key.tags.get(k).is_some_and(|t| t == v))
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for series in matching {
            let series = series.lock();
            if let Err(e) = aggregate.merge(&series) {
                warn!("Skipping series of '{}': {}", name, e);
            }
        }
        Some(aggregate)
    }

    /// Aggregates for every declared metric, keyed by name
    pub fn snapshot_all(&self) -> BTreeMap<String, AggregatedMetric> {
        let names: Vec<String> = self.schema.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.snapshot(&name).map(|agg| (name, agg)))
            .collect()
    }

    /// Total samples accepted
    pub fn samples_recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Number of distinct (name, tags) series
    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}
