//! Scriptable transport doubles for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::errors::GatewayError;
use super::lifecycle::TransportFactory;
use super::transport::ProviderTransport;
use super::types::{InitializeResult, JsonRpcResponse, ProviderConfig, ToolDescriptor};

#[derive(Debug, Clone, Copy)]
pub enum Handshake {
    Ok,
    Hang,
    Reject,
}

/// Outcome of the next `tools/call`, shared across every transport a factory opens.
#[derive(Debug, Clone)]
pub enum Scripted {
    Ok(Value),
    Lost,
    Timeout,
    /// Wait this long, then answer like an unscripted call.
    Delay(Duration),
    /// Wait out the transport's 60s request timeout, then fail with it.
    Stall,
    Fail(&'static str),
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    calls: AtomicUsize,
    shutdowns: AtomicUsize,
}

pub struct FakeFactory {
    tools: BTreeMap<String, Vec<String>>,
    handshake: Handshake,
    open_delay: Duration,
    graceful: bool,
    shutdown_fails: bool,
    stderr: Option<&'static str>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    counters: Arc<Counters>,
    transports: Mutex<Vec<Weak<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            handshake: Handshake::Ok,
            open_delay: Duration::ZERO,
            graceful: true,
            shutdown_fails: false,
            stderr: None,
            script: Arc::new(Mutex::new(VecDeque::new())),
            counters: Arc::new(Counters::default()),
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tools(mut self, provider: &str, tools: &[&str]) -> Self {
        self.tools.insert(
            provider.to_string(),
            tools.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn without_graceful_shutdown(mut self) -> Self {
        self.graceful = false;
        self
    }

    /// Graceful shutdown still closes the transport but reports an error.
    pub fn with_failing_shutdown(mut self) -> Self {
        self.shutdown_fails = true;
        self
    }

    /// Stderr text every opened transport reports as diagnostics.
    pub fn with_stderr(mut self, stderr: &'static str) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Scripted>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }

    /// Transports still referenced somewhere and not shut down or severed.
    pub fn live_count(&self) -> usize {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.is_alive())
            .count()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn open(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderTransport>, GatewayError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let tools = self
            .tools
            .get(&config.id)
            .into_iter()
            .flatten()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                description: format!("{name} from {}", config.id),
                input_schema: json!({"type": "object"}),
            })
            .collect();

        let transport = Arc::new(FakeTransport {
            id: config.id.clone(),
            tools,
            handshake: self.handshake,
            graceful: self.graceful,
            shutdown_fails: self.shutdown_fails,
            stderr: self.stderr,
            alive: AtomicBool::new(true),
            script: Arc::clone(&self.script),
            counters: Arc::clone(&self.counters),
        });
        self.transports.lock().unwrap().push(Arc::downgrade(&transport));
        Ok(transport)
    }
}

pub struct FakeTransport {
    id: String,
    tools: Vec<ToolDescriptor>,
    handshake: Handshake,
    graceful: bool,
    shutdown_fails: bool,
    stderr: Option<&'static str>,
    alive: AtomicBool,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    counters: Arc<Counters>,
}

impl FakeTransport {
    fn lost(&self) -> GatewayError {
        GatewayError::ConnectionLost {
            id: self.id.clone(),
            reason: "pipe closed".into(),
        }
    }
}

#[async_trait]
impl ProviderTransport for FakeTransport {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn request(
        &self,
        _method: &str,
        _params: Option<Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        Ok(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 0,
            result: Some(json!({})),
            error: None,
        })
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), GatewayError> {
        Ok(())
    }

    fn supports_graceful_shutdown(&self) -> bool {
        self.graceful
    }

    fn diagnostics(&self) -> Option<String> {
        self.stderr.map(str::to_string)
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if self.shutdown_fails {
            return Err(self.lost());
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn handshake(&self) -> Result<InitializeResult, GatewayError> {
        match self.handshake {
            Handshake::Ok => Ok(InitializeResult {
                protocol_version: Some("2024-11-05".into()),
                capabilities: json!({"tools": {}}),
                server_info: None,
            }),
            Handshake::Hang => std::future::pending().await,
            Handshake::Reject => Err(GatewayError::ConnectRejected {
                id: self.id.clone(),
                reason: "unsupported protocol version".into(),
            }),
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        if !self.is_alive() {
            return Err(self.lost());
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, GatewayError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_alive() {
            return Err(self.lost());
        }

        let mut next = self.script.lock().unwrap().pop_front();
        if let Some(Scripted::Delay(delay)) = next {
            tokio::time::sleep(delay).await;
            next = None;
        }
        match next {
            Some(Scripted::Ok(value)) => Ok(value),
            Some(Scripted::Lost) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(self.lost())
            }
            Some(Scripted::Stall) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(GatewayError::RequestTimeout {
                    id: self.id.clone(),
                    method: "tools/call".into(),
                    timeout_ms: 60_000,
                })
            }
            Some(Scripted::Timeout) => Err(GatewayError::RequestTimeout {
                id: self.id.clone(),
                method: "tools/call".into(),
                timeout_ms: 60_000,
            }),
            Some(Scripted::Fail(reason)) => Err(GatewayError::InvocationFailed {
                tool: name.to_string(),
                reason: reason.to_string(),
                code: Some(-32000),
            }),
            None | Some(Scripted::Delay(_)) => Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!("{name} handled by {}", self.id),
                }],
                "arguments": arguments,
            })),
        }
    }
}
