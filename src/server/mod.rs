pub mod dispatch;

use crate::cli::ProxyConfig;
use crate::models::{AnthropicRequest, CountTokensRequest, CountTokensResponse};
use crate::providers::error::ProviderError;
use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use bytes::Bytes;
use dispatch::{DispatchResult, Gateway};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Absent when another recorder is already installed (tests)
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
            metrics_handle: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        self.gateway.config()
    }
}

/// Routes of the gateway
pub fn build_router(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/status", get(status))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(config: ProxyConfig) -> anyhow::Result<()> {
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let gateway =
        Gateway::new(Arc::new(config)).context("Failed to initialise backends from configuration")?;
    let state = Arc::new(AppState::new(gateway).with_metrics(metrics_handle));
    let app = build_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "bridgeway",
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics_handle {
        Some(ref handle) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            )],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Configuration and routing state; credentials appear only as booleans.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gateway = &state.gateway;
    let backends = gateway.backends();
    let failover = gateway.failover();
    let failover_config = failover.config();

    let describe = |b: &crate::providers::backend::BackendDescriptor| {
        serde_json::json!({
            "id": b.id,
            "kind": b.kind.as_str(),
            "base_url": b.base_url,
            "resource_name": b.resource_name,
        })
    };
    let records: Vec<serde_json::Value> = failover
        .snapshot()
        .into_iter()
        .map(|r| {
            serde_json::json!({
                "backend": r.backend_id,
                "consecutive_failures": r.consecutive_failures,
                "seconds_since_last_failure": r.last_failure.map(|t| t.elapsed().as_secs()),
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "proxy_active": true,
        "backend": {
            "primary": describe(&backends.primary),
            "fallback": backends.fallback.as_deref().map(describe),
            "active": gateway.active_backend().id,
        },
        "failover": {
            "enabled": failover_config.enabled,
            "active": backends.fallback.is_some()
                && failover.should_use_fallback(&backends.primary.id),
            "threshold": failover_config.fallback_after_failures,
            "records": records,
        },
    });
    if let (Some(body), serde_json::Value::Object(summary)) =
        (body.as_object_mut(), state.config().summary())
    {
        body.extend(summary);
    }
    Json(body)
}

async fn handle_count_tokens(body: Bytes) -> Result<Json<CountTokensResponse>, AppError> {
    let request: CountTokensRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid request format: {}", e)))?;
    Ok(Json(CountTokensResponse {
        input_tokens: request.estimate_tokens(),
    }))
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: AnthropicRequest = serde_json::from_slice(&body).map_err(|e| {
        error!("❌ Failed to parse request: {}", e);
        AppError::InvalidRequest(format!("Invalid request format: {}", e))
    })?;
    let req_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

    match state.gateway.dispatch(&request, &req_id).await? {
        DispatchResult::Complete { response, .. } => Ok(Json(response).into_response()),
        DispatchResult::Streaming { response, .. } => {
            let mut http = Response::new(Body::from_stream(response.stream));
            let headers = http.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            for (name, value) in response.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&value),
                ) {
                    headers.insert(name, value);
                }
            }
            Ok(http)
        }
    }
}

/// Handler errors, rendered in the Anthropic error envelope.
#[derive(Debug)]
pub enum AppError {
    Provider(ProviderError),
    InvalidRequest(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        AppError::Provider(err)
    }
}

impl AppError {
    /// HTTP status and Anthropic error type.
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        let err = match self {
            AppError::InvalidRequest(_) => {
                return (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            AppError::Provider(err) => err,
        };
        match err {
            ProviderError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            ProviderError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "api_error"),
            ProviderError::Server { status: 503, .. } => (StatusCode::BAD_GATEWAY, "overloaded_error"),
            ProviderError::Connection { .. } | ProviderError::Server { .. } => {
                (StatusCode::BAD_GATEWAY, "api_error")
            }
            ProviderError::Client { status, .. } => {
                let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST);
                let error_type = match *status {
                    401 => "authentication_error",
                    403 => "permission_error",
                    404 => "not_found_error",
                    _ => "invalid_request_error",
                };
                (code, error_type)
            }
            ProviderError::Security(_) | ProviderError::Config(_) | ProviderError::Translation(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error")
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }
        let message = match self {
            AppError::Provider(ref err) => err.client_message(),
            AppError::InvalidRequest(ref msg) => msg.clone(),
        };
        let body = Json(serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        }));
        let mut response = (status, body).into_response();

        if let AppError::Provider(ProviderError::RateLimited {
            retry_after: Some(after),
            ..
        }) = self
        {
            let secs = after.as_secs_f64().ceil() as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Provider(e) => write!(f, "{}", e),
            AppError::InvalidRequest(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AppError {}
