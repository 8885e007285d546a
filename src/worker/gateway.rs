//! The gateway service: one owned value holding the registry, the connection
//! table and the router. HTTP handlers call into it; nothing here knows about
//! axum.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::provider::transport::extract_result;
use crate::provider::{
    ConnectionManager, GatewayError, ImportReport, InvocationOutcome, ProviderConfig,
    ProviderRegistry, ProviderState, RetryPolicy, ToolDescriptor, ToolRouter, TransportFactory,
};

/// Upper bound on one tool invocation, retries and reconnect included.
pub const INVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Liveness report served on `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub connected_provider_ids: Vec<String>,
    pub route_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Counters served on `/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Seconds since the worker started.
    pub uptime: u64,
    pub configured_count: usize,
    pub active_count: usize,
    pub mapped_tool_count: usize,
}

/// A provider config together with its runtime state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderView {
    #[serde(flatten)]
    pub config: ProviderConfig,
    pub is_connected: bool,
    pub state: ProviderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of saving a provider with an optional connect.
#[derive(Debug)]
pub struct SaveOutcome {
    pub provider: ProviderView,
    /// Set when the config was saved but the requested connect failed.
    pub connection_error: Option<GatewayError>,
}

pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    connections: ConnectionManager,
    router: ToolRouter,
    started_at: Instant,
    instance_id: Option<String>,
    invocation_timeout: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        factory: Arc<dyn TransportFactory>,
        retry: RetryPolicy,
    ) -> Self {
        let connections = ConnectionManager::new(Arc::clone(&registry), factory);
        Self::from_parts(connections, retry)
    }

    pub fn from_parts(connections: ConnectionManager, retry: RetryPolicy) -> Self {
        Self {
            registry: Arc::clone(connections.registry()),
            router: ToolRouter::with_retry_policy(connections.clone(), retry),
            connections,
            started_at: Instant::now(),
            instance_id: None,
            invocation_timeout: INVOCATION_TIMEOUT,
        }
    }

    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    // ─── Reports ─────────────────────────────────────────────────────────────

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            timestamp: Utc::now(),
            connected_provider_ids: self.connections.connected_ids(),
            route_count: self.registry.route_count(),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            uptime: self.started_at.elapsed().as_secs(),
            configured_count: self.registry.len(),
            active_count: self.connections.connected_ids().len(),
            mapped_tool_count: self.registry.route_count(),
        }
    }

    /// Route table as `(tool, provider id, provider connected)`.
    pub fn mapping(&self) -> Vec<(String, String, bool)> {
        self.registry
            .routes()
            .into_iter()
            .map(|(tool, id)| {
                let connected = self.connections.is_connected(&id);
                (tool, id, connected)
            })
            .collect()
    }

    // ─── Provider configs ────────────────────────────────────────────────────

    pub fn view(&self, config: ProviderConfig) -> ProviderView {
        let state = self.connections.state(&config.id);
        ProviderView {
            is_connected: state == ProviderState::Connected,
            last_error: self.connections.last_error(&config.id),
            state,
            config,
        }
    }

    pub fn providers(&self) -> Vec<ProviderView> {
        self.registry
            .list()
            .into_iter()
            .map(|config| self.view(config))
            .collect()
    }

    pub fn provider(&self, id: &str) -> Result<ProviderView, GatewayError> {
        self.registry
            .get(id)
            .map(|config| self.view(config))
            .ok_or_else(|| GatewayError::ConfigNotFound { id: id.to_string() })
    }

    /// Providers launched with the same command and arguments as `id`.
    pub fn related(&self, id: &str) -> Result<Vec<ProviderView>, GatewayError> {
        let related = self
            .registry
            .related(id)
            .ok_or_else(|| GatewayError::ConfigNotFound { id: id.to_string() })?;
        Ok(related.into_iter().map(|config| self.view(config)).collect())
    }

    /// Upsert a provider, disconnecting it first if it is live, then connect
    /// when asked. A failed connect does not undo the save.
    pub async fn save_provider(
        &self,
        mut config: ProviderConfig,
        auto_connect: bool,
    ) -> Result<SaveOutcome, GatewayError> {
        if config.id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "provider id is required".into(),
            });
        }
        if config.validate().is_err() {
            return Err(GatewayError::InvalidRequest {
                reason: "a command or a url is required".into(),
            });
        }
        if config.description.trim().is_empty() {
            config.description = format!("Tool provider {}", config.id);
        }

        if self.connections.is_connected(&config.id) {
            tracing::debug!(provider = %config.id, "provider is connected, disconnecting before update");
            self.connections.disconnect(&config.id).await;
        }

        let saved = self.registry.upsert(config);
        tracing::info!(provider = %saved.id, command = %saved.command, auto_connect, "provider saved");

        let connection_error = if auto_connect {
            match self.connections.connect(&saved.id).await {
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(provider = %saved.id, error = %e, "provider saved but connect failed");
                    Some(e)
                }
            }
        } else {
            None
        };

        Ok(SaveOutcome {
            provider: self.view(saved),
            connection_error,
        })
    }

    /// Disconnect and delete a provider.
    pub async fn remove_provider(&self, id: &str) -> Result<ProviderConfig, GatewayError> {
        if !self.registry.contains(id) {
            return Err(GatewayError::ConfigNotFound { id: id.to_string() });
        }
        self.connections.disconnect(id).await;
        self.registry
            .delete(id)
            .ok_or_else(|| GatewayError::ConfigNotFound { id: id.to_string() })
    }

    pub fn export(&self) -> BTreeMap<String, ProviderConfig> {
        self.registry.export()
    }

    /// Bulk import. With `overwrite`, live providers that are about to be
    /// replaced are disconnected first.
    pub async fn import(
        &self,
        entries: BTreeMap<String, ProviderConfig>,
        overwrite: bool,
    ) -> ImportReport {
        if overwrite {
            for id in entries.keys() {
                if self.connections.is_connected(id) {
                    self.connections.disconnect(id).await;
                }
            }
        }
        self.registry.import(entries, overwrite)
    }

    // ─── Connections ─────────────────────────────────────────────────────────

    pub async fn connect(&self, id: &str) -> Result<ProviderView, GatewayError> {
        self.connections.connect(id).await?;
        self.provider(id)
    }

    /// Returns the provider and whether it had been connected.
    pub async fn disconnect(&self, id: &str) -> Result<(ProviderView, bool), GatewayError> {
        if !self.registry.contains(id) {
            return Err(GatewayError::ConfigNotFound { id: id.to_string() });
        }
        let was_connected = self.connections.disconnect(id).await;
        Ok((self.provider(id)?, was_connected))
    }

    pub async fn disconnect_all(&self) {
        self.connections.disconnect_all().await;
    }

    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>, GatewayError> {
        self.connections.list_tools(id).await
    }

    /// Pass-through listing such as `resources/list` or `prompts/list`.
    /// Returns the array stored under `key` in the provider's reply.
    pub async fn list_catalog(
        &self,
        id: &str,
        method: &str,
        key: &str,
    ) -> Result<Value, GatewayError> {
        let conn = self.connections.ensure_connected(id).await?;
        let response = conn.transport.request(method, None).await?;
        let result = extract_result(response).map_err(|e| GatewayError::InvocationFailed {
            tool: method.to_string(),
            reason: e.message,
            code: Some(e.code),
        })?;
        Ok(result
            .get(key)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())))
    }

    // ─── Invocation ──────────────────────────────────────────────────────────

    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        provider: Option<&str>,
    ) -> Result<InvocationOutcome, GatewayError> {
        if tool.trim().is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "tool name is required".into(),
            });
        }
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let call = self.router.invoke(tool, arguments, provider);
        match tokio::time::timeout(self.invocation_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let id = provider
                    .map(str::to_string)
                    .or_else(|| self.registry.route(tool))
                    .unwrap_or_default();
                tracing::warn!(
                    tool,
                    provider = %id,
                    timeout_secs = self.invocation_timeout.as_secs(),
                    "tool invocation timed out"
                );
                Err(GatewayError::RequestTimeout {
                    id,
                    method: "tools/call".into(),
                    timeout_ms: self.invocation_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Connect every enabled provider at startup.
    pub async fn connect_enabled(&self, retry: &RetryPolicy) -> Vec<String> {
        self.connections.connect_all(retry).await
    }
}
