//! Worker health verification.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::provider::GatewayError;

/// Timeout for one `/health` request.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// The parts of the worker's `/health` reply the supervisor cares about.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, port: u16) -> Result<WorkerHealth, GatewayError>;
}

/// `GET http://127.0.0.1:{port}/health` over reqwest.
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new() -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Internal {
                reason: format!("failed to build health client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, port: u16) -> Result<WorkerHealth, GatewayError> {
        let failed = |reason: String| GatewayError::HealthCheckFailed { port, reason };

        let response = self
            .client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    failed(format!("no answer within {}s", HEALTH_TIMEOUT.as_secs()))
                } else {
                    failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| failed(format!("failed to read body: {e}")))?;
        parse_health_body(port, &body)
    }
}

/// A healthy reply is a JSON object with a non-empty `status`.
pub fn parse_health_body(port: u16, body: &str) -> Result<WorkerHealth, GatewayError> {
    let failed = |reason: &str| GatewayError::HealthCheckFailed {
        port,
        reason: reason.to_string(),
    };

    if body.trim().is_empty() {
        return Err(failed("empty body"));
    }
    let health: WorkerHealth =
        serde_json::from_str(body).map_err(|_| failed("malformed body"))?;
    if health.status.trim().is_empty() {
        return Err(failed("missing status"));
    }
    Ok(health)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        port
    }

    #[test]
    fn test_parse_health_body() {
        let ok = parse_health_body(1, r#"{"status":"ok","instanceId":"abc"}"#).unwrap();
        assert_eq!(ok.instance_id.as_deref(), Some("abc"));

        for body in ["", "   ", "<html>", r#"{"status":""}"#, r#"{"uptime":3}"#] {
            assert!(
                matches!(parse_health_body(1, body), Err(GatewayError::HealthCheckFailed { .. })),
                "body {body:?} should fail"
            );
        }
    }

    #[tokio::test]
    async fn test_healthy_worker() {
        let port = serve(Router::new().route("/health", get(|| async { r#"{"status":"ok"}"# }))).await;
        let health = HttpHealthChecker::new().unwrap().check(port).await.unwrap();
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn test_empty_body_fails() {
        let port = serve(Router::new().route("/health", get(|| async { "" }))).await;
        let err = HttpHealthChecker::new().unwrap().check(port).await.unwrap_err();
        assert!(matches!(err, GatewayError::HealthCheckFailed { ref reason, .. } if reason == "empty body"));
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let port = serve(Router::new().route(
            "/health",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, r#"{"status":"starting"}"#) }),
        ))
        .await;
        let err = HttpHealthChecker::new().unwrap().check(port).await.unwrap_err();
        assert!(matches!(err, GatewayError::HealthCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = HttpHealthChecker::new().unwrap().check(port).await.unwrap_err();
        assert!(matches!(err, GatewayError::HealthCheckFailed { port: p, .. } if p == port));
    }
}
