//! Prometheus text export of a finished run

use crate::report::RunResult;
use barrage_core::MetricSummary;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

/// Metric name prefix
const NAMESPACE: &str = "barrage";

/// Render a run's final aggregates in Prometheus text exposition format
pub fn render_prometheus(result: &RunResult) -> prometheus::Result<String> {
    let registry = Registry::new();

    let duration = Gauge::new(
        format!("{}_run_duration_seconds", NAMESPACE),
        "Wall-clock duration of the run",
    )?;
    duration.set(result.duration_secs);
    registry.register(Box::new(duration))?;

    let passed = Gauge::new(
        format!("{}_run_passed", NAMESPACE),
        "1 when every threshold passed and the run was not aborted",
    )?;
    passed.set(if result.succeeded() { 1.0 } else { 0.0 });
    registry.register(Box::new(passed))?;

    for (name, summary) in &result.metrics {
        let base = format!("{}_{}", NAMESPACE, sanitize(name));
        match summary {
            MetricSummary::Counter { count, .. } => {
                let gauge = Gauge::new(format!("{}_total", base), format!("Counter {}", name))?;
                gauge.set(*count);
                registry.register(Box::new(gauge))?;
            }
            MetricSummary::Rate { rate, .. } => {
                let gauge = Gauge::new(format!("{}_rate", base), format!("Rate {}", name))?;
                gauge.set(*rate);
                registry.register(Box::new(gauge))?;
            }
            MetricSummary::Trend {
                count,
                avg,
                min,
                med,
                max,
                p90,
                p95,
                p99,
            } => {
                let stats = GaugeVec::new(
                    Opts::new(format!("{}_ms", base), format!("Trend {} in milliseconds", name)),
                    &["stat"],
                )?;
                for (stat, value) in [
                    ("avg", avg),
                    ("min", min),
                    ("med", med),
                    ("max", max),
                    ("p90", p90),
                    ("p95", p95),
                    ("p99", p99),
                ] {
                    stats.with_label_values(&[stat]).set(*value);
                }
                registry.register(Box::new(stats))?;

                let samples =
                    Gauge::new(format!("{}_count", base), format!("Samples of {}", name))?;
                samples.set(*count as f64);
                registry.register(Box::new(samples))?;
            }
        }
    }

    if !result.thresholds.is_empty() {
        let thresholds = GaugeVec::new(
            Opts::new(
                format!("{}_threshold_passed", NAMESPACE),
                "1 when the threshold held",
            ),
            &["threshold"],
        )?;
        for outcome in &result.thresholds {
            thresholds
                .with_label_values(&[outcome.threshold.as_str()])
                .set(if outcome.passed { 1.0 } else { 0.0 });
        }
        registry.register(Box::new(thresholds))?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Map a metric name onto `[a-zA-Z0-9_]`
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use barrage_core::ThresholdOutcome;
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("http_req_duration"), "http_req_duration");
        assert_eq!(sanitize("users.created-v2"), "users_created_v2");
    }

    #[test]
    fn test_render_prometheus() {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "users_created".to_string(),
            MetricSummary::Counter {
                count: 12.0,
                samples: 12,
            },
        );
        metrics.insert(
            "errors".to_string(),
            MetricSummary::Rate {
                rate: 0.25,
                passes: 1,
                fails: 3,
            },
        );
        metrics.insert(
            "api_latency".to_string(),
            MetricSummary::Trend {
                count: 4,
                avg: 10.0,
                min: 5.0,
                med: 9.0,
                max: 20.0,
                p90: 18.0,
                p95: 19.0,
                p99: 20.0,
            },
        );
        let thresholds = vec![ThresholdOutcome {
            threshold: "errors: rate<0.1".to_string(),
            metric: "errors".to_string(),
            passed: false,
            observed: Some(0.25),
        }];
        let result = RunResult::new(Utc::now(), 30.0, false, metrics, thresholds, Vec::new());

        let text = render_prometheus(&result).unwrap();
        assert!(text.contains("barrage_users_created_total 12"));
        assert!(text.contains("barrage_errors_rate 0.25"));
        assert!(text.contains(r#"barrage_api_latency_ms{stat="p95"} 19"#));
        assert!(text.contains(r#"barrage_threshold_passed{threshold="errors: rate<0.1"} 0"#));
        assert!(text.contains("barrage_run_passed 0"));
    }
}
