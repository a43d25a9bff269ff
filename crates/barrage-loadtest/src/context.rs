//! Per-iteration context handed to workloads
//!
//! Wraps the transport so every request records the built-in HTTP metrics,
//! and carries the VU's tag set into checks and custom metrics.

use crate::error::TransportError;
use crate::transport::{Request, Response, Transport};
use barrage_core::{names, MetricSample, MetricSink, Tags};
use std::sync::Arc;
use tracing::debug;

/// Everything a workload may touch during one iteration
pub struct IterationContext {
    transport: Arc<dyn Transport>,
    sink: Arc<MetricSink>,
    tags: Tags,
    vu_id: u64,
    iteration: u64,
}

impl IterationContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<MetricSink>,
        tags: Tags,
        vu_id: u64,
        iteration: u64,
    ) -> Self {
        Self {
            transport,
            sink,
            tags,
            vu_id,
            iteration,
        }
    }

    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// Zero-based iteration number of this VU
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Scenario tags (`scenario`, `test_type`, ...)
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn sink(&self) -> &MetricSink {
        &self.sink
    }

    /// Scenario tags merged with `extra`
    pub fn tags_with(&self, extra: &Tags) -> Tags {
        let mut tags = self.tags.clone();
        tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags
    }

    /// Issue a request and record `http_reqs`, `http_req_duration` and
    /// `http_req_failed`.
    ///
    /// 4xx/5xx come back as `Ok`; the failed-request rate counts them.
    pub async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let mut tags = self.tags_with(&request.tags);
        tags.insert("method".to_string(), request.method.to_string());

        let outcome = self.transport.invoke(&request).await;

        match &outcome {
            Ok(response) => {
                tags.insert("status".to_string(), response.status.to_string());
                self.sink.record_or_warn(MetricSample::duration(
                    names::HTTP_REQ_DURATION,
                    response.elapsed,
                    tags.clone(),
                ));
                self.sink.record_or_warn(MetricSample::rate(
                    names::HTTP_REQ_FAILED,
                    response.status >= 400,
                    tags.clone(),
                ));
            }
            Err(e) => {
                debug!(
                    vu = self.vu_id,
                    method = %request.method,
                    path = %request.path,
                    kind = e.kind(),
                    "Request failed: {}",
                    e
                );
                tags.insert("error".to_string(), e.kind().to_string());
                self.sink.record_or_warn(MetricSample::rate(
                    names::HTTP_REQ_FAILED,
                    true,
                    tags.clone(),
                ));
            }
        }
        self.sink
            .record_or_warn(MetricSample::counter(names::HTTP_REQS, 1.0, tags));

        outcome
    }

    /// Record one named check; returns its result.
    ///
    /// Checks are advisory and never abort the workload.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        let mut tags = self.tags.clone();
        tags.insert("check".to_string(), name.to_string());
        self.sink
            .record_or_warn(MetricSample::rate(names::CHECKS, passed, tags));
        passed
    }

    /// Record every check; true only if all passed
    pub fn check_all(&self, checks: &[(&str, bool)]) -> bool {
        checks
            .iter()
            .fold(true, |all, (name, passed)| self.check(name, *passed) && all)
    }

    /// Add to a counter
    pub fn add_counter(&self, name: &str, value: f64, extra: &Tags) {
        self.sink
            .record_or_warn(MetricSample::counter(name, value, self.tags_with(extra)));
    }

    /// Add a boolean rate sample
    pub fn add_rate(&self, name: &str, value: bool, extra: &Tags) {
        self.sink
            .record_or_warn(MetricSample::rate(name, value, self.tags_with(extra)));
    }

    /// Add a trend observation in milliseconds
    pub fn add_trend(&self, name: &str, value_ms: f64, extra: &Tags) {
        self.sink
            .record_or_warn(MetricSample::trend(name, value_ms, self.tags_with(extra)));
    }
}
