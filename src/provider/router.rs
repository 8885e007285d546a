//! Tool router: resolve a tool to its provider and execute the call.
//!
//! Resolution never touches a process or the network. Execution connects
//! lazily, retries transient failures under the configured [`RetryPolicy`],
//! and on a lost connection performs exactly one reconnect and one more call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use super::errors::GatewayError;
use super::manager::ConnectionManager;
use super::registry::ProviderRegistry;
use super::retry::RetryPolicy;
use super::types::InvocationOutcome;

#[derive(Clone)]
pub struct ToolRouter {
    registry: Arc<ProviderRegistry>,
    connections: ConnectionManager,
    retry: RetryPolicy,
}

impl ToolRouter {
    pub fn new(connections: ConnectionManager) -> Self {
        Self::with_retry_policy(connections, RetryPolicy::default())
    }

    pub fn with_retry_policy(connections: ConnectionManager, retry: RetryPolicy) -> Self {
        Self {
            registry: Arc::clone(connections.registry()),
            connections,
            retry,
        }
    }

    /// Pick the provider for `tool`.
    ///
    /// An explicit provider id wins over the route table and reaches tools
    /// shadowed by a name collision.
    pub fn resolve(&self, tool: &str, explicit: Option<&str>) -> Result<String, GatewayError> {
        let id = match explicit.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self
                .registry
                .route(tool)
                .ok_or_else(|| GatewayError::ToolNotMapped {
                    tool: tool.to_string(),
                })?,
        };

        match self.registry.get(&id) {
            Some(config) if !config.disabled => Ok(id),
            _ => Err(GatewayError::ProviderNotFound { id }),
        }
    }

    /// Execute `tool` with `arguments`, optionally on an explicit provider.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        explicit: Option<&str>,
    ) -> Result<InvocationOutcome, GatewayError> {
        let started = Instant::now();
        let provider_id = self.resolve(tool, explicit)?;
        let attempts = AtomicU32::new(0);

        tracing::debug!(tool, provider = %provider_id, "invoking tool");

        let first = self
            .retry
            .run(tool, |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.call_once(&provider_id, tool, &arguments)
            })
            .await;

        let (result, reconnected) = match first {
            Err(e) if e.is_connection_lost() => {
                tracing::warn!(
                    tool,
                    provider = %provider_id,
                    error = %e,
                    "connection lost during call, reconnecting once"
                );
                self.connections.disconnect(&provider_id).await;
                self.connections.connect(&provider_id).await?;
                attempts.fetch_add(1, Ordering::Relaxed);
                (self.call_once(&provider_id, tool, &arguments).await, true)
            }
            other => (other, false),
        };

        let execution_time_ms = started.elapsed().as_millis() as u64;
        let result = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    tool,
                    provider = %provider_id,
                    error = %e,
                    elapsed_ms = execution_time_ms,
                    "tool call failed"
                );
                return Err(e);
            }
        };

        self.registry.set_route(tool, &provider_id);
        tracing::info!(
            tool,
            provider = %provider_id,
            elapsed_ms = execution_time_ms,
            reconnected,
            "tool call succeeded"
        );

        Ok(InvocationOutcome {
            tool: tool.to_string(),
            provider_id,
            result,
            attempts: attempts.load(Ordering::Relaxed),
            reconnected,
            execution_time_ms,
        })
    }

    async fn call_once(
        &self,
        provider_id: &str,
        tool: &str,
        arguments: &Value,
    ) -> Result<Value, GatewayError> {
        let conn = self.connections.ensure_connected(provider_id).await?;
        conn.transport.call_tool(tool, arguments.clone()).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
