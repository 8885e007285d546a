//! Gateway error types.
//!
//! Every failure that crosses a module boundary is a `GatewayError`. Variants
//! carry the identifiers needed for structured logging plus a human-readable
//! reason; underlying causes are flattened to text so the type stays `Clone`
//! (a joined connect attempt hands the same outcome to every waiter).

use thiserror::Error;

/// Errors raised by the registry, connection manager, router and supervisor.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No provider configuration exists for the id.
    #[error("no configuration for provider '{id}'")]
    ConfigNotFound { id: String },

    /// The provider's launch command is empty (and it has no service url).
    #[error("provider '{id}' has an empty launch command")]
    InvalidCommand { id: String },

    /// The provider process could not be started.
    #[error("failed to spawn provider '{id}': {reason}")]
    SpawnFailed { id: String, reason: String },

    /// The handshake did not complete within the connect timeout.
    #[error("provider '{id}' handshake timed out after {timeout_secs}s")]
    ConnectTimeout { id: String, timeout_secs: u64 },

    /// The provider answered the handshake with an error or hung up mid-handshake.
    #[error("provider '{id}' rejected the handshake: {reason}")]
    ConnectRejected { id: String, reason: String },

    /// No route exists for the tool and no explicit provider was given.
    #[error("no provider is mapped for tool '{tool}'")]
    ToolNotMapped { tool: String },

    /// The addressed provider is absent from the registry or disabled.
    #[error("provider '{id}' not found")]
    ProviderNotFound { id: String },

    /// The provider returned an error for the call.
    #[error("tool call '{tool}' failed: {reason}")]
    InvocationFailed {
        tool: String,
        reason: String,
        code: Option<i32>,
    },

    /// The transport to the provider was severed (closed pipe, reset, refused).
    #[error("connection to provider '{id}' lost: {reason}")]
    ConnectionLost { id: String, reason: String },

    /// A request went unanswered for longer than the request timeout.
    #[error("request '{method}' to provider '{id}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        id: String,
        method: String,
        timeout_ms: u64,
    },

    /// Every candidate port in the scan window is occupied.
    #[error("no free port in {first}..={last}")]
    PortInUse { first: u16, last: u16 },

    /// The worker's liveness endpoint did not report healthy.
    #[error("health check on port {port} failed: {reason}")]
    HealthCheckFailed { port: u16, reason: String },

    /// The supervisor reached its start-attempt bound.
    #[error("worker failed to start after {attempts} attempts")]
    StartupAttemptsExhausted { attempts: u32 },

    /// The caller sent a request the gateway cannot act on.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Unexpected internal failure (task panic, poisoned state).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl GatewayError {
    /// Stable snake_case identifier used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "config_not_found",
            Self::InvalidCommand { .. } => "invalid_command",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::ConnectRejected { .. } => "connect_rejected",
            Self::ToolNotMapped { .. } => "tool_not_mapped",
            Self::ProviderNotFound { .. } => "provider_not_found",
            Self::InvocationFailed { .. } => "invocation_failed",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::PortInUse { .. } => "port_in_use",
            Self::HealthCheckFailed { .. } => "health_check_failed",
            Self::StartupAttemptsExhausted { .. } => "startup_attempts_exhausted",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether the failure signature indicates a severed transport.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// Transient failures worth retrying with backoff.
    ///
    /// An invocation failure without a JSON-RPC code came from the transport
    /// (an HTTP error status, a garbled reply) and may succeed on retry; one
    /// with a code is the provider's answer and is final. Connection loss is
    /// absent: the router handles it with a reconnect cycle instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::ConnectTimeout { .. }
                | Self::InvocationFailed { code: None, .. }
        )
    }

    /// Configuration-class failures. These are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::InvalidCommand { .. }
                | Self::ToolNotMapped { .. }
                | Self::ProviderNotFound { .. }
                | Self::InvalidRequest { .. }
        )
    }
}
