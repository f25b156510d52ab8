//! chatrelay-proxy: HTTP facade over the completion dispatcher.
//!
//! Routes:
//!
//! - `GET /` health check with the crate version.
//! - `POST /chat` full conversation in, one answer out.
//! - `POST /simple` single user message (query parameters), wrapped in the
//!   default system prompt.
//! - `GET /metrics` Prometheus text exposition when the `prometheus` feature
//!   is enabled, 501 otherwise.
//!
//! Upstream failures never surface as HTTP errors: after exhausting retries
//! the dispatcher's error text is returned in the `response` field with a
//! 200. Only malformed requests (422) and faults inside the handler (500)
//! produce error statuses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatrelay_core::{CompletionRequest, Message, DEFAULT_ENDPOINT};
use chatrelay_dispatch::{DispatchOutcome, Dispatcher};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[cfg(feature = "prometheus")]
use chatrelay_telemetry::{prometheus_http_response, PrometheusMetricsRecorder};

pub mod prompts;

pub use prompts::{create_chat_messages, DEFAULT_SYSTEM_PROMPT};

/// Error type for the proxy server.
#[derive(Debug)]
pub enum ProxyError {
    /// Failed to bind/serve HTTP.
    Http(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Http(msg) => write!(f, "proxy HTTP error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

/// Errors returned by request handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The request body or query could not be used (422).
    InvalidRequest(String),

    /// Something failed while handling the request (500).
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::InvalidRequest(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error processing request: {}", msg),
            ),
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct ProxyState {
    dispatcher: Arc<Dispatcher>,
    default_temperature: f64,

    #[cfg(feature = "prometheus")]
    prometheus: Option<Arc<PrometheusMetricsRecorder>>,
}

impl ProxyState {
    pub fn new(dispatcher: Arc<Dispatcher>, default_temperature: f64) -> Self {
        Self {
            dispatcher,
            default_temperature,
            #[cfg(feature = "prometheus")]
            prometheus: None,
        }
    }

    /// Expose `recorder` on `GET /metrics`.
    #[cfg(feature = "prometheus")]
    pub fn with_prometheus(mut self, recorder: Arc<PrometheusMetricsRecorder>) -> Self {
        self.prometheus = Some(recorder);
        self
    }

    /// Missing or zero temperatures fall back to the configured default.
    fn temperature(&self, requested: Option<f64>) -> f64 {
        match requested {
            Some(t) if t != 0.0 => t,
            _ => self.default_temperature,
        }
    }

    async fn run_dispatch(&self, request: CompletionRequest) -> Result<DispatchOutcome, ApiError> {
        // A panic inside a client must not take the connection down with it.
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move { dispatcher.dispatch(&request).await })
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }
}

/// Build the Axum `Router` for the relay.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/chat", post(chat))
        .route("/simple", post(simple))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Configuration for the proxy HTTP server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the relay on.
    pub listen_addr: SocketAddr,
}

/// Handle to a proxy server ready to run.
pub struct ProxyServer {
    cfg: ProxyConfig,
    state: ProxyState,
}

impl ProxyServer {
    /// Create a new proxy server with the given configuration and state.
    pub fn new(cfg: ProxyConfig, state: ProxyState) -> Self {
        Self { cfg, state }
    }

    /// Spawn the HTTP server on the current Tokio runtime and return a handle.
    pub fn spawn(self) -> JoinHandle<Result<(), ProxyError>> {
        tokio::spawn(self.run())
    }

    /// Run the HTTP server until it exits.
    pub async fn run(self) -> Result<(), ProxyError> {
        let addr = self.cfg.listen_addr;
        let app = router(self.state);

        info!("chatrelay-proxy: binding HTTP server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            ProxyError::Http(format!("failed to bind proxy listener on {}: {}", addr, e))
        })?;

        info!("chatrelay-proxy: listening on {}", addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("chatrelay-proxy: accept error: {}", e);
                    return Err(ProxyError::Http(e.to_string()));
                }
            };

            let svc = app.clone();
            let io = hyper_util::rt::TokioIo::new(stream);
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, hyper_util::service::TowerToHyperService::new(svc));

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    error!("chatrelay-proxy: error serving {}: {}", peer_addr, e);
                }
            });
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Handler for `GET /`.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,

    #[serde(default)]
    pub endpoint_name: Option<String>,

    #[serde(default)]
    pub model_name: Option<String>,

    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Response of `POST /chat` and `POST /simple`.
///
/// `modelUsed` and `endpointUsed` are omitted when every attempt failed and
/// `response` carries the error description instead of an answer.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_used: Option<String>,
}

impl From<DispatchOutcome> for ChatResponse {
    fn from(outcome: DispatchOutcome) -> Self {
        match outcome {
            DispatchOutcome::Success(s) => ChatResponse {
                response: s.text,
                model_used: Some(s.model_used),
                endpoint_used: Some(s.endpoint_used),
            },
            DispatchOutcome::Exhausted(f) => ChatResponse {
                response: f.error_text(),
                model_used: None,
                endpoint_used: None,
            },
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn completion_request(
    messages: Vec<Message>,
    endpoint_name: Option<String>,
    model_name: Option<String>,
    temperature: f64,
) -> CompletionRequest {
    CompletionRequest {
        messages,
        endpoint_name: non_blank(endpoint_name).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        model_name: non_blank(model_name),
        temperature,
    }
}

/// Handler for `POST /chat`.
async fn chat(
    State(state): State<ProxyState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(req) = payload?;
    if req.messages.is_empty() {
        return Err(ApiError::InvalidRequest(
            "messages must contain at least one message".to_string(),
        ));
    }

    let temperature = state.temperature(req.temperature);
    let request = completion_request(req.messages, req.endpoint_name, req.model_name, temperature);

    let outcome = state.run_dispatch(request).await.inspect_err(|e| {
        error!("Error in chat endpoint: {:?}", e);
    })?;

    Ok(Json(outcome.into()))
}

/// Query parameters of `POST /simple`.
#[derive(Debug, Deserialize)]
pub struct SimpleParams {
    pub message: String,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default, rename = "modelName")]
    pub model_name: Option<String>,

    #[serde(default, rename = "endpointName")]
    pub endpoint_name: Option<String>,

    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Handler for `POST /simple`.
async fn simple(
    State(state): State<ProxyState>,
    params: Result<Query<SimpleParams>, QueryRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Query(params) = params?;
    let system_prompt = params
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let messages = create_chat_messages(&params.message, system_prompt, &[]);

    let temperature = state.temperature(params.temperature);
    let request = completion_request(messages, params.endpoint_name, params.model_name, temperature);

    let outcome = state.run_dispatch(request).await.inspect_err(|e| {
        error!("Error in simple chat endpoint: {:?}", e);
    })?;

    Ok(Json(outcome.into()))
}

/// Handler for `GET /metrics`.
async fn metrics_handler(State(_state): State<ProxyState>) -> Response {
    #[cfg(feature = "prometheus")]
    if let Some(recorder) = _state.prometheus.as_ref() {
        let (parts, body) = prometheus_http_response(recorder.registry()).into_parts();
        return (parts.status, parts.headers, axum::body::Body::from(body)).into_response();
    }

    (
        StatusCode::NOT_IMPLEMENTED,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Prometheus metrics not enabled\n",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chatrelay_core::{Completion, Endpoint, RelayError, Result as RelayResult};
    use chatrelay_dispatch::RetryPolicy;
    use chatrelay_endpoints::{EndpointRegistryBuilder, UpstreamClient};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::util::ServiceExt;

    /// Echoes the last message back, or always fails.
    struct EchoClient {
        fail: bool,
        seen: Mutex<Vec<(String, Vec<Message>, f64)>>,
    }

    impl EchoClient {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UpstreamClient for EchoClient {
        async fn chat_completion(
            &self,
            model: &str,
            messages: &[Message],
            temperature: f64,
        ) -> RelayResult<Completion> {
            self.seen
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec(), temperature));

            if self.fail {
                return Err(RelayError::upstream("echo", 503, "connection reset"));
            }
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Completion::new(format!("echo: {last}"), None))
        }
    }

    fn app(default: Arc<EchoClient>, alt: Arc<EchoClient>) -> Router {
        let mut builder = EndpointRegistryBuilder::new();
        builder
            .register(
                Endpoint::new(DEFAULT_ENDPOINT, "http://u0/v1").with_default_model("M0"),
                default,
            )
            .unwrap()
            .register(Endpoint::new("alt", "http://u1/v1").with_default_model("M1"), alt)
            .unwrap();
        let registry = Arc::new(builder.build().unwrap());

        let dispatcher = Dispatcher::new(registry, RetryPolicy::new(3, Duration::ZERO), "M0");
        router(ProxyState::new(Arc::new(dispatcher), 0.7))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok_and_version() {
        let response = app(EchoClient::new(false), EchoClient::new(false))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = read_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn chat_routes_to_named_endpoint_with_its_model() {
        let alt = EchoClient::new(false);
        let response = app(EchoClient::new(false), alt.clone())
            .oneshot(post_json(
                "/chat",
                serde_json::json!({
                    "messages": [{"role": "user", "content": "hi"}],
                    "endpointName": "alt",
                    "modelName": "M0"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ChatResponse = read_json(response).await;
        assert_eq!(
            body,
            ChatResponse {
                response: "echo: hi".to_string(),
                model_used: Some("M1".to_string()),
                endpoint_used: Some("alt".to_string()),
            }
        );

        let seen = alt.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "M1");
        assert_eq!(seen[0].2, 0.7);
    }

    #[tokio::test]
    async fn chat_exhaustion_is_a_200_with_error_text() {
        let default = EchoClient::new(true);
        let response = app(default.clone(), EchoClient::new(false))
            .oneshot(post_json(
                "/chat",
                serde_json::json!({
                    "messages": [{"role": "user", "content": "hi"}],
                    "temperature": 0.3
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = read_json(response).await;
        let text = body["response"].as_str().unwrap();
        assert!(text.starts_with("Error: Model call failed. Reason: "));
        assert!(text.contains("connection reset"));
        assert!(body.get("modelUsed").is_none());
        assert!(body.get("endpointUsed").is_none());

        let seen = default.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(_, _, t)| *t == 0.3));
    }

    #[tokio::test]
    async fn chat_rejects_empty_messages() {
        let response = app(EchoClient::new(false), EchoClient::new(false))
            .oneshot(post_json("/chat", serde_json::json!({"messages": []})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = read_json(response).await;
        assert!(body["detail"].as_str().unwrap().contains("at least one"));
    }

    #[tokio::test]
    async fn chat_rejects_malformed_json_with_detail() {
        let response = app(EchoClient::new(false), EchoClient::new(false))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"messages\": ["))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = read_json(response).await;
        assert!(!body["detail"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn simple_without_message_is_rejected_with_detail() {
        let default = EchoClient::new(false);
        let response = app(default.clone(), EchoClient::new(false))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/simple?modelName=M0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = read_json(response).await;
        assert!(body["detail"].as_str().unwrap().contains("message"));
        assert!(default.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_temperature_falls_back_to_default() {
        let default = EchoClient::new(false);
        let response = app(default.clone(), EchoClient::new(false))
            .oneshot(post_json(
                "/chat",
                serde_json::json!({
                    "messages": [{"role": "user", "content": "hi"}],
                    "temperature": 0.0
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(default.seen.lock().unwrap()[0].2, 0.7);
    }

    #[tokio::test]
    async fn simple_wraps_message_in_system_prompt() {
        let default = EchoClient::new(false);
        let response = app(default.clone(), EchoClient::new(false))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/simple?message=hello%20there")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ChatResponse = read_json(response).await;
        assert_eq!(body.response, "echo: hello there");
        assert_eq!(body.model_used.as_deref(), Some("M0"));

        let seen = default.seen.lock().unwrap();
        let messages = &seen[0].1;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(messages[1], Message::user("hello there"));
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_implemented() {
        let response = app(EchoClient::new(false), EchoClient::new(false))
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = app(EchoClient::new(false), EchoClient::new(false))
            .oneshot(Request::builder().uri("/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
