//! HTTP surface of the worker.
//!
//! Canonical routes live under `/providers` and `/tools`. The same handlers
//! are mounted a second time under `/mcp/clients` and `/mcp/tools` for older
//! callers, which expect `name`/`client` field names instead of
//! `id`/`providerId`; the [`Dialect`] extension picks the spelling.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;

use super::gateway::{Gateway, ProviderView};
use crate::provider::{GatewayError, ProviderConfig};

type AppState = Arc<Gateway>;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A [`GatewayError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(GatewayError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GatewayError::ConfigNotFound { .. }
            | GatewayError::ProviderNotFound { .. }
            | GatewayError::ToolNotMapped { .. } => StatusCode::NOT_FOUND,
            GatewayError::InvalidCommand { .. } | GatewayError::InvalidRequest { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::ConnectTimeout { .. } | GatewayError::RequestTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::SpawnFailed { .. }
            | GatewayError::ConnectRejected { .. }
            | GatewayError::InvocationFailed { .. }
            | GatewayError::ConnectionLost { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::PortInUse { .. }
            | GatewayError::HealthCheckFailed { .. }
            | GatewayError::StartupAttemptsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(GatewayError::InvalidRequest {
            reason: rejection.body_text(),
        })
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            GatewayError::Internal { reason } => {
                tracing::error!(reason = %reason, "internal error serving request");
                "internal error".to_string()
            }
            other => {
                tracing::debug!(status = status.as_u16(), error = %other, "request failed");
                other.to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.kind(),
                message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T = Json<Value>> = Result<T, ApiError>;

// ─── Dialect ─────────────────────────────────────────────────────────────────

/// Field spelling used in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Canonical,
    Legacy,
}

impl Dialect {
    fn id_key(self) -> &'static str {
        match self {
            Self::Canonical => "id",
            Self::Legacy => "name",
        }
    }

    fn list_key(self) -> &'static str {
        match self {
            Self::Canonical => "providers",
            Self::Legacy => "clients",
        }
    }

    fn item_key(self) -> &'static str {
        match self {
            Self::Canonical => "provider",
            Self::Legacy => "client",
        }
    }

    fn owner_key(self) -> &'static str {
        match self {
            Self::Canonical => "providerId",
            Self::Legacy => "client",
        }
    }

    fn connected_key(self) -> &'static str {
        match self {
            Self::Canonical => "providerConnected",
            Self::Legacy => "clientConnected",
        }
    }

    /// Serialize a provider view with its id under the dialect's key.
    fn view(self, view: &ProviderView) -> Value {
        let mut value = serde_json::to_value(view).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut value {
            map.insert(self.id_key().to_string(), Value::String(view.config.id.clone()));
        }
        value
    }
}

// ─── Request bodies ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveProviderRequest {
    #[serde(default, alias = "name")]
    pub id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub auto_connect: bool,
}

impl SaveProviderRequest {
    fn into_config(self) -> (ProviderConfig, bool) {
        let config = ProviderConfig {
            id: self.id.trim().to_string(),
            command: self.command,
            args: self.args,
            env: self.env,
            description: self.description,
            last_updated: None,
            url: self.url,
            disabled: self.disabled,
        };
        (config, self.auto_connect)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, alias = "clientName", alias = "client")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    pub configs: Option<BTreeMap<String, ProviderConfig>>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize)]
pub struct ClientQuery {
    pub client: Option<String>,
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build the worker's HTTP router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let legacy = provider_routes("/mcp/clients", "/mcp/tools")
        .route("/mcp/clients/by-server/{id}", get(related))
        .route("/mcp/tools", get(list_tools_by_query))
        .route("/mcp/resources", get(list_resources_by_query))
        .route("/mcp/prompts", get(list_prompts_by_query))
        .route("/api/clients", get(list_providers))
        .route("/api/clients/{id}/tools", get(list_tools))
        .layer(Extension(Dialect::Legacy));

    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/api/status", get(status))
        .merge(provider_routes("/providers", "/tools").layer(Extension(Dialect::Canonical)))
        .merge(legacy)
        .with_state(gateway);

    with_layers(app)
}

/// CORS, request tracing, and a panic guard answering 500 `{error, message}`.
fn with_layers(app: Router) -> Router {
    app.layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        )
        .layer(TraceLayer::new_for_http())
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let reason = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    ApiError(GatewayError::Internal {
        reason: format!("handler panicked: {reason}"),
    })
    .into_response()
}

fn provider_routes(providers: &str, tools: &str) -> Router<AppState> {
    Router::new()
        .route(providers, get(list_providers).post(save_provider))
        .route(&format!("{providers}/export"), get(export_providers))
        .route(&format!("{providers}/import"), post(import_providers))
        .route(
            &format!("{providers}/{{id}}"),
            get(get_provider).delete(delete_provider),
        )
        .route(&format!("{providers}/{{id}}/related"), get(related))
        .route(&format!("{providers}/{{id}}/connect"), post(connect_provider))
        .route(&format!("{providers}/{{id}}/disconnect"), post(disconnect_provider))
        .route(&format!("{providers}/{{id}}/tools"), get(list_tools))
        .route(&format!("{providers}/{{id}}/tools/call"), post(call_provider_tool))
        .route(&format!("{providers}/{{id}}/resources"), get(list_resources))
        .route(&format!("{providers}/{{id}}/prompts"), get(list_prompts))
        .route(&format!("{tools}/call"), post(call_tool))
        .route(&format!("{tools}/mapping"), get(tool_mapping))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(gw): State<AppState>) -> impl IntoResponse {
    Json(gw.health())
}

async fn status(State(gw): State<AppState>) -> impl IntoResponse {
    Json(gw.status())
}

async fn list_providers(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
) -> Json<Value> {
    let views: Vec<Value> = gw.providers().iter().map(|v| dialect.view(v)).collect();
    Json(json!({ dialect.list_key(): views }))
}

async fn get_provider(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
) -> ApiResult {
    Ok(Json(dialect.view(&gw.provider(&id)?)))
}

async fn related(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
) -> ApiResult {
    let views: Vec<Value> = gw.related(&id)?.iter().map(|v| dialect.view(v)).collect();
    Ok(Json(json!({
        "serverId": id,
        dialect.list_key(): views,
    })))
}

async fn save_provider(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    body: Result<Json<SaveProviderRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let (config, auto_connect) = body.into_config();
    let outcome = gw.save_provider(config, auto_connect).await?;
    let id = outcome.provider.config.id.clone();
    let provider = dialect.view(&outcome.provider);

    let response = match outcome.connection_error {
        Some(e) => (
            StatusCode::MULTI_STATUS,
            Json(json!({
                "success": true,
                "configSaved": true,
                "connectionError": e.to_string(),
                "message": format!("provider {id} saved but failed to connect: {e}"),
                dialect.item_key(): provider,
            })),
        )
            .into_response(),
        None => {
            let message = if auto_connect {
                format!("provider {id} saved and connected")
            } else {
                format!("provider {id} saved")
            };
            Json(json!({
                "success": true,
                "message": message,
                dialect.item_key(): provider,
            }))
            .into_response()
        }
    };
    Ok(response)
}

async fn delete_provider(State(gw): State<AppState>, Path(id): Path<String>) -> ApiResult {
    gw.remove_provider(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("provider {id} deleted"),
    })))
}

async fn export_providers(State(gw): State<AppState>) -> impl IntoResponse {
    let configs = gw.export();
    tracing::info!(count = configs.len(), "exporting provider configs");
    (
        [(
            header::CONTENT_DISPOSITION,
            "attachment; filename=toolgate_providers.json",
        )],
        Json(configs),
    )
}

async fn import_providers(
    State(gw): State<AppState>,
    body: Result<Json<ImportRequest>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let configs = body.configs.ok_or_else(|| GatewayError::InvalidRequest {
        reason: "configs must be an object of provider configs".into(),
    })?;

    let report = gw.import(configs, body.overwrite).await;
    Ok(Json(json!({
        "success": true,
        "message": format!(
            "imported {}, skipped {}, failed {}",
            report.imported.len(),
            report.skipped.len(),
            report.failed.len()
        ),
        "results": report,
    })))
}

async fn connect_provider(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
) -> ApiResult {
    let view = gw.connect(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("provider {id} connected"),
        dialect.item_key(): dialect.view(&view),
    })))
}

async fn disconnect_provider(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
) -> ApiResult {
    let (view, was_connected) = gw.disconnect(&id).await?;
    let message = if was_connected {
        format!("provider {id} disconnected")
    } else {
        format!("provider {id} was not connected")
    };
    Ok(Json(json!({
        "success": true,
        "message": message,
        "wasConnected": was_connected,
        dialect.item_key(): dialect.view(&view),
    })))
}

async fn list_tools(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
) -> ApiResult {
    ensure_configured(&gw, &id)?;
    let tools = gw.list_tools(&id).await?;
    Ok(Json(json!({
        dialect.owner_key(): id,
        "tools": tools,
    })))
}

async fn list_tools_by_query(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Query(query): Query<ClientQuery>,
) -> ApiResult {
    list_tools(State(gw), Extension(dialect), Path(client_param(query)?)).await
}

async fn list_resources_by_query(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Query(query): Query<ClientQuery>,
) -> ApiResult {
    list_resources(State(gw), Extension(dialect), Path(client_param(query)?)).await
}

async fn list_prompts_by_query(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Query(query): Query<ClientQuery>,
) -> ApiResult {
    list_prompts(State(gw), Extension(dialect), Path(client_param(query)?)).await
}

fn client_param(query: ClientQuery) -> Result<String, GatewayError> {
    query
        .client
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest {
            reason: "the client query parameter is required".into(),
        })
}

async fn list_resources(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
) -> ApiResult {
    ensure_configured(&gw, &id)?;
    let resources = gw.list_catalog(&id, "resources/list", "resources").await?;
    Ok(Json(json!({
        dialect.owner_key(): id,
        "resources": resources,
    })))
}

async fn list_prompts(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
) -> ApiResult {
    ensure_configured(&gw, &id)?;
    let prompts = gw.list_catalog(&id, "prompts/list", "prompts").await?;
    Ok(Json(json!({
        dialect.owner_key(): id,
        "prompts": prompts,
    })))
}

async fn call_provider_tool(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    Path(id): Path<String>,
    body: Result<Json<CallToolRequest>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    ensure_configured(&gw, &id)?;
    let outcome = gw.invoke(&body.name, body.arguments, Some(&id)).await?;

    Ok(Json(match dialect {
        Dialect::Canonical => serde_json::to_value(&outcome).unwrap_or_else(|_| json!({})),
        Dialect::Legacy => json!({
            "client": outcome.provider_id,
            "tool": outcome.tool,
            "result": outcome.result,
        }),
    }))
}

async fn call_tool(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
    body: Result<Json<CallToolRequest>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let outcome = gw
        .invoke(&body.name, body.arguments, body.provider_id.as_deref())
        .await?;

    Ok(Json(match dialect {
        Dialect::Canonical => serde_json::to_value(&outcome).unwrap_or_else(|_| json!({})),
        Dialect::Legacy => json!({ "result": outcome.result }),
    }))
}

async fn tool_mapping(
    State(gw): State<AppState>,
    Extension(dialect): Extension<Dialect>,
) -> Json<Value> {
    let mapping: Vec<Value> = gw
        .mapping()
        .into_iter()
        .map(|(tool, id, connected)| {
            json!({
                "tool": tool,
                dialect.owner_key(): id,
                dialect.connected_key(): connected,
            })
        })
        .collect();

    Json(json!({
        "totalTools": mapping.len(),
        "mapping": mapping,
    }))
}

fn ensure_configured(gw: &Gateway, id: &str) -> Result<(), GatewayError> {
    if gw.registry().contains(id) {
        Ok(())
    } else {
        Err(GatewayError::ConfigNotFound { id: id.to_string() })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::provider::testing::{FakeFactory, Handshake};
    use crate::provider::{ProviderRegistry, RetryPolicy};

    struct TestApp {
        dir: tempfile::TempDir,
        factory: Arc<FakeFactory>,
        gateway: Arc<Gateway>,
    }

    impl TestApp {
        fn new(factory: FakeFactory) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self::in_dir(dir, factory)
        }

        fn in_dir(dir: tempfile::TempDir, factory: FakeFactory) -> Self {
            let registry = Arc::new(ProviderRegistry::open(dir.path()));
            let factory = Arc::new(factory);
            let gateway = Arc::new(Gateway::new(
                registry,
                factory.clone(),
                RetryPolicy::linear(3, Duration::from_millis(5)),
            ));
            Self {
                dir,
                factory,
                gateway,
            }
        }

        async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(match body {
                    Some(v) => Body::from(v.to_string()),
                    None => Body::empty(),
                })
                .unwrap();

            let response = router(Arc::clone(&self.gateway))
                .oneshot(request)
                .await
                .unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_weather_scenario() {
        let app = TestApp::new(FakeFactory::new().with_tools("weather", &["get_weather"]));

        let (status, body) = app
            .send(
                "POST",
                "/providers",
                Some(json!({
                    "id": "weather",
                    "command": "node",
                    "args": ["weather.js"],
                    "autoConnect": true,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"]["id"], "weather");
        assert_eq!(body["provider"]["isConnected"], true);

        let (status, body) = app
            .send(
                "POST",
                "/tools/call",
                Some(json!({"name": "get_weather", "arguments": {"city": "Paris"}})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["providerId"], "weather");
        assert_eq!(body["result"]["arguments"]["city"], "Paris");

        let (_, mapping) = app.send("GET", "/tools/mapping", None).await;
        assert_eq!(mapping["totalTools"], 1);
        assert_eq!(mapping["mapping"][0]["tool"], "get_weather");
        assert_eq!(mapping["mapping"][0]["providerConnected"], true);

        let (_, health) = app.send("GET", "/health", None).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["connectedProviderIds"], json!(["weather"]));
        assert_eq!(health["routeCount"], 1);

        // Survives a restart: routes and configs are reloaded from disk.
        let dir = app.dir;
        drop(app.gateway);
        let restarted = TestApp::in_dir(dir, FakeFactory::new().with_tools("weather", &["get_weather"]));
        let (status, body) = restarted
            .send("POST", "/tools/call", Some(json!({"name": "get_weather"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["providerId"], "weather");
        assert_eq!(restarted.factory.opens(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_tool_is_404() {
        let app = TestApp::new(FakeFactory::new());
        let (status, body) = app
            .send("POST", "/tools/call", Some(json!({"name": "nope"})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "tool_not_mapped");
        assert_eq!(app.factory.opens(), 0);
    }

    #[tokio::test]
    async fn test_missing_tool_name_is_400() {
        let app = TestApp::new(FakeFactory::new());
        let (status, body) = app.send("POST", "/tools/call", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let app = TestApp::new(FakeFactory::new());
        let request = Request::builder()
            .method("POST")
            .uri("/providers")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router(Arc::clone(&app.gateway)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_failed_auto_connect_is_207() {
        let app = TestApp::new(FakeFactory::new().with_handshake(Handshake::Reject));
        let (status, body) = app
            .send(
                "POST",
                "/mcp/clients",
                Some(json!({
                    "name": "weather",
                    "command": "node",
                    "args": [],
                    "autoConnect": true,
                })),
            )
            .await;

        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(body["configSaved"], true);
        assert!(body["connectionError"].as_str().unwrap().contains("rejected"));
        assert_eq!(body["client"]["name"], "weather");
        assert_eq!(body["client"]["isConnected"], false);
    }

    #[tokio::test]
    async fn test_connection_error_leaves_out_provider_stderr() {
        let app = TestApp::new(
            FakeFactory::new()
                .with_handshake(Handshake::Reject)
                .with_stderr("Traceback (most recent call last): API_KEY=sk-live-123"),
        );
        let (status, body) = app
            .send(
                "POST",
                "/providers",
                Some(json!({"id": "py", "command": "python", "autoConnect": true})),
            )
            .await;

        assert_eq!(status, StatusCode::MULTI_STATUS);
        let text = body.to_string();
        assert!(body["connectionError"].as_str().unwrap().contains("rejected"));
        assert!(!text.contains("Traceback"));
        assert!(!text.contains("sk-live-123"));

        let (status, body) = app.send("POST", "/providers/py/connect", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!body.to_string().contains("sk-live-123"));
    }

    #[tokio::test]
    async fn test_panicking_handler_answers_500() {
        let app = with_layers(Router::new().route(
            "/boom",
            get(|| async {
                if true {
                    panic!("handler blew up");
                }
                "unreachable"
            }),
        ));

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"error": "internal", "message": "internal error"}));
    }

    #[tokio::test]
    async fn test_legacy_routes_use_client_names() {
        let app = TestApp::new(FakeFactory::new().with_tools("w", &["get_weather"]));
        app.send(
            "POST",
            "/mcp/clients",
            Some(json!({"name": "w", "command": "node", "args": ["a.js"], "autoConnect": true})),
        )
        .await;
        app.send(
            "POST",
            "/mcp/clients",
            Some(json!({"name": "w2", "command": "node", "args": ["a.js"]})),
        )
        .await;

        let (_, list) = app.send("GET", "/mcp/clients", None).await;
        assert_eq!(list["clients"][0]["name"], "w");
        assert_eq!(list["clients"][0]["isConnected"], true);

        let (_, api_list) = app.send("GET", "/api/clients", None).await;
        assert_eq!(api_list["clients"].as_array().unwrap().len(), 2);

        let (_, related) = app.send("GET", "/mcp/clients/by-server/w", None).await;
        assert_eq!(related["serverId"], "w");
        assert_eq!(related["clients"].as_array().unwrap().len(), 2);

        let (status, call) = app
            .send(
                "POST",
                "/mcp/tools/call",
                Some(json!({"name": "get_weather", "arguments": {}, "clientName": "w"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(call["result"]["content"].is_array());
        assert!(call.get("providerId").is_none());

        let (_, mapping) = app.send("GET", "/mcp/tools/mapping", None).await;
        assert_eq!(mapping["mapping"][0]["client"], "w");
        assert_eq!(mapping["mapping"][0]["clientConnected"], true);

        let (_, tools) = app.send("GET", "/mcp/tools?client=w", None).await;
        assert_eq!(tools["client"], "w");
        assert_eq!(tools["tools"][0]["name"], "get_weather");

        let (status, tools) = app.send("GET", "/api/clients/w/tools", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tools["client"], "w");
        assert_eq!(tools["tools"][0]["name"], "get_weather");

        let (status, resources) = app.send("GET", "/mcp/resources?client=w", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resources["client"], "w");
        assert_eq!(resources["resources"], json!([]));

        let (status, prompts) = app.send("GET", "/mcp/prompts?client=w", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(prompts["prompts"], json!([]));

        let (status, body) = app.send("GET", "/mcp/resources", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _) = app.send("GET", "/mcp/prompts?client=ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_provider_lifecycle_routes() {
        let app = TestApp::new(FakeFactory::new().with_tools("a", &["one", "two"]));
        app.send(
            "POST",
            "/providers",
            Some(json!({"id": "a", "command": "node"})),
        )
        .await;

        let (status, body) = app.send("GET", "/providers/a/tools", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["providerId"], "a");
        assert_eq!(body["tools"].as_array().unwrap().len(), 2);

        let (status, body) = app.send("POST", "/providers/a/disconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wasConnected"], true);
        let (_, mapping) = app.send("GET", "/tools/mapping", None).await;
        assert_eq!(mapping["totalTools"], 0);

        let (status, body) = app.send("POST", "/providers/a/connect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"]["state"], "connected");

        let (status, body) = app
            .send(
                "POST",
                "/providers/a/tools/call",
                Some(json!({"name": "two", "arguments": {"x": 1}})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tool"], "two");
        assert_eq!(body["attempts"], 1);

        let (status, _) = app.send("DELETE", "/providers/a", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = app.send("GET", "/providers/a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "config_not_found");
    }

    #[tokio::test]
    async fn test_unknown_provider_routes_are_404() {
        let app = TestApp::new(FakeFactory::new());
        for (method, uri) in [
            ("POST", "/providers/ghost/connect"),
            ("POST", "/providers/ghost/disconnect"),
            ("GET", "/providers/ghost/tools"),
            ("GET", "/mcp/clients/ghost/resources"),
            ("DELETE", "/mcp/clients/ghost"),
        ] {
            let (status, _) = app.send(method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        }
        assert_eq!(app.factory.opens(), 0);
    }

    #[tokio::test]
    async fn test_export_and_import() {
        let app = TestApp::new(FakeFactory::new());
        let (status, body) = app
            .send(
                "POST",
                "/providers/import",
                Some(json!({
                    "configs": {
                        "a": {"command": "node", "args": ["a.js"]},
                        "b": {"command": "", "args": []},
                    },
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"]["imported"], json!(["a"]));
        assert_eq!(body["results"]["failed"][0]["id"], "b");

        let (status, export) = app.send("GET", "/providers/export", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(export["a"]["command"], "node");
        assert!(export.get("b").is_none());

        let (status, body) = app
            .send("POST", "/mcp/clients/import", Some(json!({"overwrite": true})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_status_counts() {
        let app = TestApp::new(FakeFactory::new().with_tools("a", &["one"]));
        app.send(
            "POST",
            "/providers",
            Some(json!({"id": "a", "command": "node", "autoConnect": true})),
        )
        .await;

        for uri in ["/status", "/api/status"] {
            let (status, body) = app.send("GET", uri, None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["configuredCount"], 1);
            assert_eq!(body["activeCount"], 1);
            assert_eq!(body["mappedToolCount"], 1);
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (GatewayError::ToolNotMapped { tool: "x".into() }, StatusCode::NOT_FOUND),
            (GatewayError::InvalidCommand { id: "x".into() }, StatusCode::BAD_REQUEST),
            (
                GatewayError::RequestTimeout {
                    id: "x".into(),
                    method: "tools/call".into(),
                    timeout_ms: 1,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                GatewayError::ConnectionLost {
                    id: "x".into(),
                    reason: "eof".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                GatewayError::Internal { reason: "boom".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }
}
