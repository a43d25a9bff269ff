//! Run result and console report

use crate::executor::ScenarioReport;
use barrage_core::{MetricSummary, ThresholdEvaluator, ThresholdOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Exit code for a clean pass
pub const EXIT_PASSED: i32 = 0;
/// Exit code when thresholds failed or the run was aborted
pub const EXIT_FAILED: i32 = 1;
/// Exit code for fatal configuration or setup errors
pub const EXIT_FATAL: i32 = 2;

/// Final snapshot of a run, materialised once after teardown
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Operator abort cut the run short
    pub aborted: bool,
    /// Logical AND of every threshold
    pub passed: bool,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunResult {
    pub fn new(
        started_at: DateTime<Utc>,
        duration_secs: f64,
        aborted: bool,
        metrics: BTreeMap<String, MetricSummary>,
        thresholds: Vec<ThresholdOutcome>,
        scenarios: Vec<ScenarioReport>,
    ) -> Self {
        let passed = ThresholdEvaluator::all_passed(&thresholds);
        Self {
            started_at,
            duration_secs,
            aborted,
            passed,
            metrics,
            thresholds,
            scenarios,
        }
    }

    /// True when every threshold passed and the run completed
    pub fn succeeded(&self) -> bool {
        self.passed && !self.aborted
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            EXIT_PASSED
        } else {
            EXIT_FAILED
        }
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    /// Box-drawn console report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let rule = "═".repeat(62);

        let _ = writeln!(out, "\n╔{}╗", rule);
        row(&mut out, &format!("{:^60}", "BARRAGE LOAD TEST RESULTS"));
        let _ = writeln!(out, "╠{}╣", rule);
        row(
            &mut out,
            &format!("Started:  {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC")),
        );
        row(&mut out, &format!("Duration: {:>10.2} seconds", self.duration_secs));
        if self.aborted {
            row(&mut out, "Run was ABORTED by the operator");
        }

        let _ = writeln!(out, "╠{}╣", rule);
        row(&mut out, "METRICS");
        for (name, summary) in &self.metrics {
            match summary {
                MetricSummary::Counter { count, .. } => {
                    let per_sec = if self.duration_secs > 0.0 {
                        count / self.duration_secs
                    } else {
                        0.0
                    };
                    row(
                        &mut out,
                        &format!("  {:<22} {:>10} {:>10.2}/s", name, count, per_sec),
                    );
                }
                MetricSummary::Rate { rate, passes, fails } => {
                    row(
                        &mut out,
                        &format!(
                            "  {:<22} {:>9.2}%  ✓ {:<7} ✗ {:<7}",
                            name,
                            rate * 100.0,
                            passes,
                            fails
                        ),
                    );
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
                    row(&mut out, &format!("  {:<22} {:>10} samples", name, count));
                    row(
                        &mut out,
                        &format!(
                            "    avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms",
                            avg, min, med, max
                        ),
                    );
                    row(
                        &mut out,
                        &format!("    p(90)={:.2}ms p(95)={:.2}ms p(99)={:.2}ms", p90, p95, p99),
                    );
                }
            }
        }

        if !self.scenarios.is_empty() {
            let _ = writeln!(out, "╠{}╣", rule);
            row(&mut out, "SCENARIOS");
            for s in &self.scenarios {
                row(
                    &mut out,
                    &format!(
                        "  {:<16} {:<12} vus={:<5} iterations={}{}",
                        s.name,
                        s.executor,
                        s.vus_spawned,
                        s.iterations,
                        if s.aborted { " (aborted)" } else { "" }
                    ),
                );
            }
        }

        if !self.thresholds.is_empty() {
            let _ = writeln!(out, "╠{}╣", rule);
            row(&mut out, "THRESHOLDS");
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                let observed = t
                    .observed
                    .map_or_else(|| "no samples".to_string(), |v| format!("{:.4}", v));
                row(&mut out, &format!("  {} {:<40} {}", mark, t.threshold, observed));
            }
        }

        let _ = writeln!(out, "╠{}╣", rule);
        let verdict = match (self.passed, self.aborted) {
            (_, true) => "OVERALL: ✗ RUN ABORTED",
            (true, false) => "OVERALL: ✓ ALL THRESHOLDS PASSED",
            (false, false) => "OVERALL: ✗ SOME THRESHOLDS FAILED",
        };
        row(&mut out, verdict);
        let _ = writeln!(out, "╚{}╝", rule);
        out
    }

    /// Print the formatted report to stdout
    pub fn print_report(&self) {
        println!("{}", self.render());
    }
}

fn row(out: &mut String, text: &str) {
    let _ = writeln!(out, "║ {:<60} ║", text);
}
