//! Setup and teardown hooks
//!
//! Both run once per run, outside every scenario window. A setup failure
//! is fatal and happens before any VU is spawned.

use crate::error::LoadTestError;
use crate::transport::{Request, Transport};
use async_trait::async_trait;
use tracing::{info, warn};

/// Opaque value handed from setup to teardown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupContext {
    pub base_url: String,
    pub data: serde_json::Value,
}

/// Run lifecycle collaborator
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Prepare the target; an error aborts the run
    async fn setup(&self, transport: &dyn Transport) -> Result<SetupContext, LoadTestError>;

    /// Clean up after every scenario has stopped
    async fn teardown(&self, transport: &dyn Transport, context: SetupContext);
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {
    async fn setup(&self, _transport: &dyn Transport) -> Result<SetupContext, LoadTestError> {
        Ok(SetupContext::default())
    }

    async fn teardown(&self, _transport: &dyn Transport, _context: SetupContext) {}
}

/// Requires the target's health endpoint to answer 200 before the run
#[derive(Debug, Clone)]
pub struct HealthCheckHooks {
    base_url: String,
    health_path: String,
}

impl HealthCheckHooks {
    pub fn new(base_url: impl Into<String>, health_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            health_path: health_path.into(),
        }
    }
}

#[async_trait]
impl LifecycleHooks for HealthCheckHooks {
    async fn setup(&self, transport: &dyn Transport) -> Result<SetupContext, LoadTestError> {
        info!("Starting load test against {}", self.base_url);

        let response = transport
            .invoke(&Request::get(self.health_path.as_str()))
            .await
            .map_err(|e| {
                LoadTestError::TargetUnreachable(format!("{}{}: {}", self.base_url, self.health_path, e))
            })?;

        if response.status != 200 {
            return Err(LoadTestError::TargetUnreachable(format!(
                "{}{} answered {}",
                self.base_url, self.health_path, response.status
            )));
        }

        let data = response.json().unwrap_or(serde_json::Value::Null);
        info!(elapsed = ?response.elapsed, "Target health check passed");
        Ok(SetupContext {
            base_url: self.base_url.clone(),
            data,
        })
    }

    async fn teardown(&self, transport: &dyn Transport, context: SetupContext) {
        match transport.invoke(&Request::get(self.health_path.as_str())).await {
            Ok(res) if res.status == 200 => {
                info!("Load test completed against {}", context.base_url)
            }
            Ok(res) => warn!(
                status = res.status,
                "Load test completed; target health degraded at {}", context.base_url
            ),
            Err(e) => warn!("Load test completed; target unreachable at teardown: {}", e),
        }
    }
}
