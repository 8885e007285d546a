//! Provider connection manager.
//!
//! Holds at most one live connection per provider id. A connect attempt runs
//! in its own task and is published as a shared future, so concurrent callers
//! join the same attempt instead of spawning duplicate processes. The attempt
//! finalizes its slot itself, which keeps the table consistent even when
//! every caller has stopped waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};

use super::errors::GatewayError;
use super::lifecycle::{open_session, TransportFactory, HANDSHAKE_TIMEOUT};
use super::registry::ProviderRegistry;
use super::retry::RetryPolicy;
use super::transport::ProviderTransport;
use super::types::{ProviderState, ServerInfo, ToolDescriptor};

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<ProviderConnection>, GatewayError>>>;

/// A live provider session.
pub struct ProviderConnection {
    pub provider_id: String,
    pub transport: Arc<dyn ProviderTransport>,
    pub server_info: Option<ServerInfo>,
    pub connected_at: DateTime<Utc>,
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl ProviderConnection {
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_tools(&self, tools: Vec<ToolDescriptor>) {
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = tools;
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}

enum Slot {
    Connecting { generation: u64, attempt: ConnectFuture },
    Connected(Arc<ProviderConnection>),
}

struct Inner {
    registry: Arc<ProviderRegistry>,
    factory: Arc<dyn TransportFactory>,
    handshake_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    last_errors: Mutex<HashMap<String, String>>,
    generation: AtomicU64,
}

/// Cloneable handle to the connection table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<ProviderRegistry>, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_handshake_timeout(registry, factory, HANDSHAKE_TIMEOUT)
    }

    pub fn with_handshake_timeout(
        registry: Arc<ProviderRegistry>,
        factory: Arc<dyn TransportFactory>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                factory,
                handshake_timeout,
                slots: Mutex::new(HashMap::new()),
                last_errors: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    /// Connect to a provider, replacing any existing connection.
    ///
    /// Configuration problems are reported before any transport is opened.
    /// A call that arrives while an attempt is in flight joins that attempt.
    pub async fn connect(&self, id: &str) -> Result<Arc<ProviderConnection>, GatewayError> {
        let config = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| GatewayError::ConfigNotFound { id: id.to_string() })?;
        config.validate()?;

        let attempt = {
            let mut slots = self.inner.lock_slots();
            match slots.remove(id) {
                Some(Slot::Connecting { generation, attempt }) => {
                    tracing::debug!(provider = %id, "joining in-flight connect");
                    slots.insert(
                        id.to_string(),
                        Slot::Connecting {
                            generation,
                            attempt: attempt.clone(),
                        },
                    );
                    attempt
                }
                previous => {
                    let previous = match previous {
                        Some(Slot::Connected(conn)) => Some(conn),
                        _ => None,
                    };
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let attempt = self.start_attempt(id, generation, previous);
                    slots.insert(
                        id.to_string(),
                        Slot::Connecting {
                            generation,
                            attempt: attempt.clone(),
                        },
                    );
                    attempt
                }
            }
        };

        attempt.await
    }

    fn start_attempt(
        &self,
        id: &str,
        generation: u64,
        previous: Option<Arc<ProviderConnection>>,
    ) -> ConnectFuture {
        let inner = Arc::clone(&self.inner);
        let provider_id = id.to_string();
        let task = tokio::spawn(async move { inner.run_attempt(provider_id, generation, previous).await });

        let id = id.to_string();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(GatewayError::Internal {
                    reason: format!("connect task for '{id}' failed: {e}"),
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Drop a provider's connection and its routes.
    ///
    /// Returns whether a live connection existed. Routes naming the provider
    /// are removed even when it was not connected.
    pub async fn disconnect(&self, id: &str) -> bool {
        let removed = self.inner.lock_slots().remove(id);

        let was_connected = match removed {
            Some(Slot::Connected(conn)) => {
                self.inner.teardown(&conn).await;
                true
            }
            Some(Slot::Connecting { .. }) => {
                tracing::info!(provider = %id, "abandoning in-flight connect");
                false
            }
            None => false,
        };

        self.inner.registry.remove_routes_for(id);
        if was_connected {
            tracing::info!(provider = %id, "provider disconnected");
        }
        was_connected
    }

    /// Disconnect every provider. Used on worker shutdown and overwrite imports.
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.inner.lock_slots().keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// Connect every enabled provider, retrying transient failures.
    ///
    /// Failures are logged and skipped. Returns the ids that connected.
    pub async fn connect_all(&self, policy: &RetryPolicy) -> Vec<String> {
        let mut connected = Vec::new();
        for config in self.inner.registry.list() {
            if config.disabled {
                tracing::debug!(provider = %config.id, "skipping disabled provider");
                continue;
            }
            let label = format!("connect {}", config.id);
            match policy.run(&label, |_| self.connect(&config.id)).await {
                Ok(_) => connected.push(config.id),
                Err(e) => {
                    tracing::warn!(provider = %config.id, error = %e, "startup connect failed")
                }
            }
        }
        tracing::info!(connected = connected.len(), "startup connections complete");
        connected
    }

    /// The live connection for `id`, if any.
    pub fn get(&self, id: &str) -> Option<Arc<ProviderConnection>> {
        match self.inner.lock_slots().get(id) {
            Some(Slot::Connected(conn)) if conn.is_alive() => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// The live connection for `id`, connecting first if needed.
    pub async fn ensure_connected(&self, id: &str) -> Result<Arc<ProviderConnection>, GatewayError> {
        if let Some(conn) = self.get(id) {
            return Ok(conn);
        }
        self.connect(id).await
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Ids with a live connection, sorted.
    pub fn connected_ids(&self) -> Vec<String> {
        let slots = self.inner.lock_slots();
        let mut ids: Vec<String> = slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Connected(conn) if conn.is_alive() => Some(id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    pub fn state(&self, id: &str) -> ProviderState {
        match self.inner.lock_slots().get(id) {
            Some(Slot::Connecting { .. }) => return ProviderState::Connecting,
            Some(Slot::Connected(conn)) if conn.is_alive() => return ProviderState::Connected,
            _ => {}
        }
        if self.last_error(id).is_some() {
            ProviderState::Failed
        } else {
            ProviderState::Disconnected
        }
    }

    /// Message of the most recent failed connect, cleared on success.
    pub fn last_error(&self, id: &str) -> Option<String> {
        self.inner
            .last_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Refresh a provider's tool list (connecting lazily) and republish its routes.
    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let conn = self.ensure_connected(id).await?;
        let tools = conn.transport.list_tools().await?;
        self.inner.registry.publish_routes(id, &tools);
        conn.replace_tools(tools.clone());
        Ok(tools)
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_error(&self, id: &str, err: Option<&GatewayError>) {
        let mut errors = self.last_errors.lock().unwrap_or_else(PoisonError::into_inner);
        match err {
            Some(e) => errors.insert(id.to_string(), e.to_string()),
            None => errors.remove(id),
        };
    }

    async fn run_attempt(
        &self,
        id: String,
        generation: u64,
        previous: Option<Arc<ProviderConnection>>,
    ) -> Result<Arc<ProviderConnection>, GatewayError> {
        if let Some(old) = previous {
            tracing::info!(provider = %id, "reconnecting, closing previous connection");
            self.teardown(&old).await;
            self.registry.remove_routes_for(&id);
        }

        // Re-read the config: it may have been replaced while we queued.
        let session = match self.registry.get(&id) {
            Some(config) => open_session(self.factory.as_ref(), &config, self.handshake_timeout).await,
            None => Err(GatewayError::ConfigNotFound { id: id.clone() }),
        };

        let stale = {
            let mut slots = self.lock_slots();
            let current = matches!(
                slots.get(&id),
                Some(Slot::Connecting { generation: g, .. }) if *g == generation
            );

            match session {
                Ok(session) if current => {
                    let conn = Arc::new(ProviderConnection {
                        provider_id: id.clone(),
                        transport: session.transport,
                        server_info: session.server_info,
                        connected_at: Utc::now(),
                        tools: RwLock::new(session.tools.clone()),
                    });
                    // Routes are published under the slot lock so a racing
                    // disconnect cannot leave them behind.
                    self.registry.publish_routes(&id, &session.tools);
                    slots.insert(id.clone(), Slot::Connected(Arc::clone(&conn)));
                    self.record_error(&id, None);
                    tracing::info!(provider = %id, tools = session.tools.len(), "provider connected");
                    return Ok(conn);
                }
                Ok(session) => session,
                Err(e) => {
                    if current {
                        slots.remove(&id);
                    }
                    tracing::warn!(provider = %id, error = %e, "provider connect failed");
                    self.record_error(&id, Some(&e));
                    return Err(e);
                }
            }
        };

        tracing::info!(provider = %id, "connect superseded by disconnect, closing session");
        close_transport(&id, stale.transport.as_ref()).await;
        Err(GatewayError::ConnectionLost {
            id,
            reason: "disconnected while connecting".into(),
        })
    }

    async fn teardown(&self, conn: &ProviderConnection) {
        close_transport(&conn.provider_id, conn.transport.as_ref()).await;
    }
}

async fn close_transport(id: &str, transport: &dyn ProviderTransport) {
    if transport.supports_graceful_shutdown() {
        if let Err(e) = transport.shutdown().await {
            tracing::warn!(provider = %id, error = %e, "graceful shutdown failed");
        }
    } else {
        tracing::debug!(provider = %id, "transport has no graceful shutdown, dropping session");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
