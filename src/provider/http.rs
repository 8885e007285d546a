//! JSON-RPC over HTTP POST for network-backed providers.
//!
//! Each request is one POST to the provider's url. Replies may be plain JSON
//! or a `text/event-stream` body carrying the response as SSE `data:` events.
//! The `Mcp-Session-Id` header returned by the server is echoed on later calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use super::errors::GatewayError;
use super::transport::{next_request_id, ProviderTransport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Timeout for establishing the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SESSION_HEADER: &str = "mcp-session-id";

pub struct HttpTransport {
    provider_id: String,
    endpoint: String,
    client: reqwest::Client,
    request_timeout: Duration,
    session_id: Mutex<Option<String>>,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        provider_id: &str,
        endpoint: &str,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::SpawnFailed {
                id: provider_id.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            provider_id: provider_id.to_string(),
            endpoint: endpoint.to_string(),
            client,
            request_timeout,
            session_id: Mutex::new(None),
            alive: AtomicBool::new(true),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);

        let session = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(session) = session {
            if let Ok(value) = HeaderValue::from_str(&session) {
                request = request.header(SESSION_HEADER, value);
            }
        }

        let response = request.send().await.map_err(|e| self.send_error(method, e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::InvocationFailed {
                tool: method.to_string(),
                reason: format!("provider answered HTTP {status}"),
                code: None,
            });
        }
        Ok(response)
    }

    fn send_error(&self, method: &str, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::RequestTimeout {
                id: self.provider_id.clone(),
                method: method.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            self.alive.store(false, Ordering::Release);
            GatewayError::ConnectionLost {
                id: self.provider_id.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let id = next_request_id();
        let response = self
            .post(method, &JsonRpcRequest::new(id, method, params))
            .await?;
        self.alive.store(true, Ordering::Release);

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|e| self.send_error(method, e))?;

        let parsed = if is_sse {
            sse_data_payloads(&body)
                .iter()
                .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data).ok())
                .find(|r| r.id == id)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).ok()
        };

        parsed.ok_or_else(|| GatewayError::InvocationFailed {
            tool: method.to_string(),
            reason: "provider reply is not a JSON-RPC response".into(),
            code: None,
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
        self.post(method, &JsonRpcNotification::new(method, params))
            .await
            .map(|_| ())
    }

    fn supports_graceful_shutdown(&self) -> bool {
        false
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        self.alive.store(false, Ordering::Release);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Collect the `data:` payload of every event in an SSE body.
fn sse_data_payloads(body: &str) -> Vec<String> {
    let normalized = body.replace("\r\n", "\n");
    let mut payloads = Vec::new();

    for event in normalized.split("\n\n") {
        let mut data: Option<String> = None;
        for line in event.lines() {
            let Some(value) = line.strip_prefix("data:") else {
                continue;
            };
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
        if let Some(data) = data {
            payloads.push(data);
        }
    }
    payloads
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sse_payloads_join_multiline_data() {
        let body = "event: message\ndata: {\"a\":\ndata: 1}\n\n: keepalive\n\ndata: second\n\n";
        let payloads = sse_data_payloads(body);
        assert_eq!(payloads, vec!["{\"a\":\n1}".to_string(), "second".to_string()]);
    }

    /// Minimal provider answering `initialize`, `tools/list` and `tools/call`.
    async fn fake_provider(Json(req): Json<Value>) -> Json<Value> {
        let id = req["id"].clone();
        let result = match req["method"].as_str() {
            Some("initialize") => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "1.0"}
            }),
            Some("tools/list") => json!({
                "tools": [{"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}}]
            }),
            Some("tools/call") => json!({
                "content": [{"type": "text", "text": req["params"]["arguments"]["text"].clone()}]
            }),
            // Notifications carry no id; the body is ignored by the client.
            _ => return Json(json!({})),
        };
        Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    async fn serve_fake() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/mcp", post(fake_provider));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    #[tokio::test]
    async fn test_session_over_http() {
        let url = serve_fake().await;
        let transport = HttpTransport::new("remote", &url, Duration::from_secs(5)).unwrap();

        let init = transport.handshake().await.unwrap();
        assert_eq!(
            init.server_info.and_then(|s| s.name).as_deref(),
            Some("fake")
        );

        let tools = transport.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = transport
            .call_tool("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "hi");
        assert!(!transport.supports_graceful_shutdown());
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_lost() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(
            "remote",
            &format!("http://127.0.0.1:{port}/mcp"),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionLost { .. }));
        assert!(!transport.is_alive());
    }
}
