//! HTTP surface
//!
//! `POST /api/screenshot` runs a capture; `GET /health` reports breaker
//! state and `GET /metrics` serves the Prometheus exposition.

use crate::{CaptureError, CaptureOrchestrator, CaptureRequestBody, CaptureResponse, CaptureResult, HealthLevel};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub orchestrator: Arc<CaptureOrchestrator>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/screenshot", post(screenshot_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<(), CaptureError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "Capture service listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

async fn screenshot_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    payload: Result<Json<CaptureRequestBody>, JsonRejection>,
) -> Response {
    let client_id = peer.ip().to_string();

    let result = match payload {
        Ok(Json(body)) => state.orchestrator.handle(body, &client_id).await,
        Err(rejection) => state
            .orchestrator
            .refuse(&client_id, CaptureError::InvalidRequest(rejection.body_text())),
    };

    capture_response(&result)
}

fn capture_response(result: &CaptureResult) -> Response {
    let status = StatusCode::from_u16(result.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(CaptureResponse::from(result))).into_response();

    if let CaptureResult::Failure(failure) = result {
        if let Some(retry_after) = failure.retry_after {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
    }
    response
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.orchestrator.health();
    let status = match report.status {
        HealthLevel::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthLevel::Healthy | HealthLevel::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
