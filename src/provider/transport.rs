//! Provider transports.
//!
//! [`ProviderTransport`] is the seam between the connection manager and a
//! live provider session. The MCP conversation (handshake, tool listing, tool
//! calls) is written once as provided methods on top of `request`/`notify`;
//! implementations only move JSON-RPC messages.
//!
//! [`StdioTransport`] speaks line-delimited JSON-RPC over a child process's
//! stdin/stdout. A background reader task owns stdout and dispatches each
//! response to the waiting request by id, so concurrent calls share one pipe.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::GatewayError;
use super::types::{
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, ToolDescriptor, CLIENT_NAME, INTERNAL_ERROR, PROTOCOL_VERSION,
};

/// Request-level timeout for a single JSON-RPC exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a provider gets to exit after its stdin is closed.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages, guarding against a cursor that never ends.
const MAX_TOOL_PAGES: usize = 64;

/// Stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Request ID Generator ────────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A live session with one provider.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Send a request and wait for its response.
    ///
    /// Only transport failures are errors here; a JSON-RPC error reply is a
    /// successful exchange and is returned as-is.
    async fn request(&self, method: &str, params: Option<Value>)
        -> Result<JsonRpcResponse, GatewayError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError>;

    /// Whether `shutdown` does anything beyond dropping the session.
    fn supports_graceful_shutdown(&self) -> bool;

    async fn shutdown(&self) -> Result<(), GatewayError>;

    fn is_alive(&self) -> bool;

    /// Recent provider-side output worth logging next to a failure.
    fn diagnostics(&self) -> Option<String> {
        None
    }

    /// MCP `initialize` followed by `notifications/initialized`.
    ///
    /// Any failure other than a timeout is reported as `ConnectRejected`.
    async fn handshake(&self) -> Result<InitializeResult, GatewayError> {
        let id = self.provider_id().to_string();
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = self
            .request("initialize", Some(params))
            .await
            .map_err(|e| rejected_unless_timeout(&id, e))?;

        let result = extract_result(response).map_err(|e| GatewayError::ConnectRejected {
            id: id.clone(),
            reason: format!("{} (code {})", e.message, e.code),
        })?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| GatewayError::ConnectRejected {
                id: id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.notify("notifications/initialized", None)
            .await
            .map_err(|e| rejected_unless_timeout(&id, e))?;

        Ok(init)
    }

    /// Fetch every page of `tools/list`.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let response = self.request("tools/list", params).await?;
            let result = extract_result(response).map_err(|e| invocation_failed("tools/list", e))?;

            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| GatewayError::InvocationFailed {
                    tool: "tools/list".into(),
                    reason: format!("failed to parse tool list: {e}"),
                    code: None,
                })?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            provider = self.provider_id(),
            pages = MAX_TOOL_PAGES,
            "tools/list pagination did not terminate, keeping what was fetched"
        );
        Ok(tools)
    }

    /// Invoke a tool and return the provider's `result` payload.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, GatewayError> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self.request("tools/call", Some(params)).await?;
        extract_result(response).map_err(|e| invocation_failed(name, e))
    }
}

fn rejected_unless_timeout(id: &str, err: GatewayError) -> GatewayError {
    match err {
        GatewayError::RequestTimeout { .. } | GatewayError::ConnectTimeout { .. } => err,
        other => GatewayError::ConnectRejected {
            id: id.to_string(),
            reason: other.to_string(),
        },
    }
}

fn invocation_failed(tool: &str, err: JsonRpcError) -> GatewayError {
    GatewayError::InvocationFailed {
        tool: tool.to_string(),
        reason: err.message,
        code: Some(err.code),
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Split a JSON-RPC response into its result or its error object.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, JsonRpcError> {
    if let Some(err) = response.error {
        return Err(err);
    }

    response.result.ok_or(JsonRpcError {
        code: INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── StdioTransport ──────────────────────────────────────────────────────────

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// JSON-RPC over a child process's stdio.
pub struct StdioTransport {
    provider_id: String,
    writer: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    /// Take ownership of a spawned child with piped stdin/stdout.
    pub fn new(
        provider_id: &str,
        mut child: Child,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let stdin = child.stdin.take().ok_or_else(|| GatewayError::SpawnFailed {
            id: provider_id.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::SpawnFailed {
            id: provider_id.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::new()));

        let mut tasks = vec![tokio::spawn(read_responses(
            provider_id.to_string(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ))];
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(relay_stderr(
                provider_id.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
            )));
        }

        Ok(Self {
            provider_id: provider_id.to_string(),
            writer: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            alive,
            stderr_tail,
            request_timeout,
            tasks,
        })
    }

    async fn write_line(&self, mut line: String) -> Result<(), GatewayError> {
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let stdin = writer.as_mut().ok_or_else(|| GatewayError::ConnectionLost {
            id: self.provider_id.clone(),
            reason: "stdin already closed".into(),
        })?;

        let result = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| GatewayError::ConnectionLost {
            id: self.provider_id.clone(),
            reason: format!("failed to write to stdin: {e}"),
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> GatewayError {
        GatewayError::ConnectionLost {
            id: self.provider_id.clone(),
            reason: "provider stdout closed (process may have exited)".into(),
        }
    }
}

#[async_trait]
impl ProviderTransport for StdioTransport {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let id = next_request_id();
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(|e| {
            GatewayError::Internal {
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        // The reader clears `alive` before draining, so a request registered
        // after the drain is caught here instead of waiting out the timeout.
        if !self.alive.load(Ordering::Acquire) {
            self.lock_pending().remove(&id);
            return Err(self.closed_error());
        }

        if let Err(e) = self.write_line(line).await {
            self.lock_pending().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(GatewayError::RequestTimeout {
                    id: self.provider_id.clone(),
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(|e| {
            GatewayError::Internal {
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.write_line(line).await
    }

    fn supports_graceful_shutdown(&self) -> bool {
        true
    }

    /// Close stdin, wait for the process to exit, kill it if it does not.
    async fn shutdown(&self) -> Result<(), GatewayError> {
        drop(self.writer.lock().await.take());

        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(provider = %self.provider_id, %status, "provider exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(provider = %self.provider_id, error = %e, "failed to wait for provider");
                }
                Err(_) => {
                    tracing::warn!(
                        provider = %self.provider_id,
                        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                        "provider did not exit after stdin closed, killing"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(provider = %self.provider_id, error = %e, "failed to kill provider");
                    }
                }
            }
        }
        *slot = None;
        self.alive.store(false, Ordering::Release);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        match self.child.try_lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            },
            // Someone is shutting it down or waiting on it.
            Err(_) => true,
        }
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Dispatch stdout lines to pending requests until EOF.
async fn read_responses(
    provider_id: String,
    stdout: ChildStdout,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(response) => {
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&response.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => tracing::debug!(
                                provider = %provider_id,
                                id = response.id,
                                "response for unknown or abandoned request"
                            ),
                        }
                    }
                    // Server-initiated notifications and stray log output.
                    Err(_) => tracing::trace!(provider = %provider_id, line = trimmed, "ignored stdout line"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(provider = %provider_id, error = %e, "failed to read provider stdout");
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    tracing::debug!(provider = %provider_id, "provider stdout closed");
}

/// Forward stderr to the log and keep a short tail for diagnostics.
async fn relay_stderr(
    provider_id: String,
    stderr: ChildStderr,
    tail: Arc<StdMutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(provider = %provider_id, stderr = %line, "provider stderr");
        let mut buffer = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() == STDERR_TAIL_LINES {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(json!({"text": "hello"})),
            error: None,
        };
        assert_eq!(extract_result(resp).unwrap()["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let err = extract_result(resp).unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        assert_eq!(extract_result(resp).unwrap_err().code, INTERNAL_ERROR);
    }

    #[cfg(unix)]
    fn spawn(program: &str, args: &[&str]) -> Child {
        tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    // `cat` echoes each request line back; a request parses as a response
    // carrying the same id, which is enough to exercise id dispatch.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_requests_are_dispatched_by_id() {
        let transport = StdioTransport::new("echo", spawn("cat", &[]), REQUEST_TIMEOUT).unwrap();

        let (a, b) = tokio::join!(
            transport.request("first", None),
            transport.request("second", None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id, b.id);
        assert!(transport.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_process_surfaces_connection_lost() {
        let transport = StdioTransport::new("gone", spawn("true", &[]), REQUEST_TIMEOUT).unwrap();

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(err.is_connection_lost(), "unexpected error: {err}");
        assert!(!transport.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let transport = StdioTransport::new(
            "mute",
            spawn("sleep", &["5"]),
            Duration::from_millis(50),
        )
        .unwrap();

        let err = transport.request("tools/call", None).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RequestTimeout { ref method, .. } if method == "tools/call"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_closes_stdin_and_reaps() {
        let transport = StdioTransport::new("echo", spawn("cat", &[]), REQUEST_TIMEOUT).unwrap();
        assert!(transport.supports_graceful_shutdown());

        transport.shutdown().await.unwrap();
        assert!(!transport.is_alive());

        let err = transport.notify("ping", None).await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_rejected_when_process_exits() {
        let transport = StdioTransport::new(
            "crashy",
            spawn("sh", &["-c", "echo boom >&2; exit 1"]),
            REQUEST_TIMEOUT,
        )
        .unwrap();

        let err = transport.handshake().await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectRejected { ref id, .. } if id == "crashy"));
    }
}
