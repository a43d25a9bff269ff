//! User-API workloads
//!
//! The default traffic mix exercises a user service through `/health` and
//! `/api/users`. Each request is a [`Step`] that declares which statuses it
//! expects and which of them count toward the `errors` rate, so error
//! classification is data on the step rather than logic in the workload.
//! A failed check on a step's response counts as an error too.

pub mod fixtures;
pub mod users;

use crate::context::IterationContext;
use crate::dispatcher::WorkloadRegistry;
use crate::transport::{Request, Response};
use barrage_core::{MetricKind, Tags};
use serde::{Deserialize, Serialize};

pub use users::{CrudWorkload, ErrorPathWorkload, ReadWorkload, WriteWorkload};

/// Rate of unexpected failures
pub const ERRORS: &str = "errors";
/// Latency of every workload step, in milliseconds
pub const API_LATENCY: &str = "api_latency";
/// Users the workloads created
pub const USERS_CREATED: &str = "users_created";
/// Users the workloads deleted
pub const USERS_DELETED: &str = "users_deleted";

/// Custom metrics shared by the user-API workloads
pub fn user_metrics() -> Vec<(&'static str, MetricKind)> {
    vec![
        (ERRORS, MetricKind::Rate),
        (API_LATENCY, MetricKind::Trend),
        (USERS_CREATED, MetricKind::Counter),
        (USERS_DELETED, MetricKind::Counter),
    ]
}

/// Registry holding `read`, `write`, `crud` and `errors`
pub fn user_api_registry() -> WorkloadRegistry {
    let mut registry = WorkloadRegistry::new();
    registry.register(ReadWorkload);
    registry.register(WriteWorkload);
    registry.register(CrudWorkload);
    registry.register(ErrorPathWorkload);
    registry
}

/// Which completed responses count as errors.
///
/// A request that fails to complete is always an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Any 4xx or 5xx
    ClientOrServer,
    /// 5xx only
    ServerOnly,
    /// Any status outside the step's expected set
    Unexpected,
}

impl ErrorPolicy {
    pub fn is_error(self, status: u16, expected: &[u16]) -> bool {
        match self {
            Self::ClientOrServer => status >= 400,
            Self::ServerOnly => status >= 500,
            Self::Unexpected => !expected.contains(&status),
        }
    }
}

/// One request of a workload and how to classify its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// `operation` tag on the request's metrics
    pub operation: &'static str,
    /// Statuses the step is designed to produce
    pub expected: &'static [u16],
    pub policy: ErrorPolicy,
}

impl Step {
    pub const fn new(
        operation: &'static str,
        expected: &'static [u16],
        policy: ErrorPolicy,
    ) -> Self {
        Self {
            operation,
            expected,
            policy,
        }
    }

    /// Whether `response` carries an expected status
    pub fn status_ok(&self, response: &Response) -> bool {
        self.expected.contains(&response.status)
    }

    /// Issue the request and evaluate `checks` against the response.
    ///
    /// The request counts as one `errors` sample, true when the status
    /// policy flags it or any check fails. Returns whether every check
    /// passed; a request that could not complete returns `false`.
    pub async fn perform_checked<F>(&self, ctx: &IterationContext, request: Request, checks: F) -> bool
    where
        F: FnOnce(&Response) -> Vec<(String, bool)> + Send,
    {
        let Some(response) = self.send(ctx, request).await else {
            return false;
        };
        let results = checks(&response);
        let named: Vec<(&str, bool)> = results.iter().map(|(n, ok)| (n.as_str(), *ok)).collect();
        let passed = ctx.check_all(&named);
        self.record_error(
            ctx,
            !passed || self.policy.is_error(response.status, self.expected),
        );
        passed
    }

    async fn send(&self, ctx: &IterationContext, request: Request) -> Option<Response> {
        match ctx
            .request(request.with_tag("operation", self.operation))
            .await
        {
            Ok(response) => {
                ctx.add_trend(
                    API_LATENCY,
                    response.elapsed.as_secs_f64() * 1_000.0,
                    &self.tags(),
                );
                Some(response)
            }
            Err(_) => {
                self.record_error(ctx, true);
                None
            }
        }
    }

    fn record_error(&self, ctx: &IterationContext, failed: bool) {
        ctx.add_rate(ERRORS, failed, &self.tags());
    }

    fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("operation".to_string(), self.operation.to_string());
        tags
    }
}
