//! Provider session lifecycle.
//!
//! Opening a session means: build a transport for the config (spawn the
//! process, or point an HTTP client at the url), run the MCP handshake under a
//! timeout, then fetch the tool list. A transport that fails any step is
//! dropped on the spot; stdio children are spawned with kill-on-drop, so a
//! failed handshake never leaves a process behind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::errors::GatewayError;
use super::http::HttpTransport;
use super::transport::{ProviderTransport, StdioTransport, REQUEST_TIMEOUT};
use super::types::{ProviderConfig, ServerInfo, ToolDescriptor};

/// Timeout for the initialize handshake.
///
/// Generous enough for providers that load heavy runtimes at startup.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on stderr text written to the log on a failed handshake.
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

// ─── Transport Factory ───────────────────────────────────────────────────────

/// Creates transports for provider configs.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, config: &ProviderConfig)
        -> Result<Arc<dyn ProviderTransport>, GatewayError>;
}

/// Spawns stdio providers as child processes and builds HTTP clients for
/// network-backed ones.
pub struct ProcessTransportFactory {
    request_timeout: Duration,
}

impl ProcessTransportFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for ProcessTransportFactory {
    fn default() -> Self {
        Self::new(REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl TransportFactory for ProcessTransportFactory {
    async fn open(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderTransport>, GatewayError> {
        if let Some(url) = config.url.as_deref().filter(|_| config.is_network()) {
            tracing::info!(provider = %config.id, url, "opening HTTP provider session");
            let transport = HttpTransport::new(&config.id, url, self.request_timeout)?;
            return Ok(Arc::new(transport));
        }

        let child = spawn_process(config)?;
        tracing::info!(
            provider = %config.id,
            command = %config.command,
            pid = child.id(),
            "spawned provider process"
        );
        let transport = StdioTransport::new(&config.id, child, self.request_timeout)?;
        Ok(Arc::new(transport))
    }
}

/// Spawn the provider process with piped stdio.
///
/// The child inherits the gateway's environment with the config's overrides
/// applied on top.
pub fn spawn_process(config: &ProviderConfig) -> Result<Child, GatewayError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    cmd.envs(&config.env);

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|e| GatewayError::SpawnFailed {
        id: config.id.clone(),
        reason: format!("{}: {e}", config.command),
    })
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// A handshaken provider session and the tools it advertised.
pub struct Session {
    pub transport: Arc<dyn ProviderTransport>,
    pub server_info: Option<ServerInfo>,
    pub tools: Vec<ToolDescriptor>,
}

/// Open a transport, perform the handshake, and list tools.
pub async fn open_session(
    factory: &dyn TransportFactory,
    config: &ProviderConfig,
    handshake_timeout: Duration,
) -> Result<Session, GatewayError> {
    let transport = factory.open(config).await?;

    let init = match tokio::time::timeout(handshake_timeout, transport.handshake()).await {
        Ok(Ok(init)) => init,
        Ok(Err(e)) => {
            log_diagnostics(&config.id, &e, transport.diagnostics());
            return Err(e);
        }
        Err(_) => {
            if let Some(stderr) = transport.diagnostics() {
                tracing::warn!(
                    provider = %config.id,
                    stderr = %stderr,
                    "provider stderr captured on handshake timeout"
                );
            }
            return Err(GatewayError::ConnectTimeout {
                id: config.id.clone(),
                timeout_secs: handshake_timeout.as_secs(),
            });
        }
    };

    let tools = transport.list_tools().await?;

    tracing::info!(
        provider = %config.id,
        server = init.server_info.as_ref().and_then(|s| s.name.as_deref()).unwrap_or("unknown"),
        protocol = init.protocol_version.as_deref().unwrap_or("unspecified"),
        tools = tools.len(),
        "provider session established"
    );

    Ok(Session {
        transport,
        server_info: init.server_info,
        tools,
    })
}

/// Log the provider's recent stderr next to a handshake failure.
///
/// The tail stays in the log; callers only ever see the short reason.
fn log_diagnostics(id: &str, err: &GatewayError, stderr: Option<String>) {
    let Some(mut stderr) = stderr else {
        return;
    };
    if stderr.len() > MAX_DIAGNOSTIC_CHARS {
        let mut cut = MAX_DIAGNOSTIC_CHARS;
        while !stderr.is_char_boundary(cut) {
            cut -= 1;
        }
        stderr.truncate(cut);
        stderr.push_str("...(truncated)");
    }
    tracing::warn!(
        provider = %id,
        error = %err,
        stderr = %stderr.trim(),
        "provider stderr captured on handshake failure"
    );
}
