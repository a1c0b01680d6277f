//! ==============================================================================
//! api.rs - http surface
//! ==============================================================================
//!
//! routes:
//!     POST /espdata       ingest a measurement object or array (device route)
//!     POST /api/readings  same handler
//!     GET  /data          latest persisted reading
//!     GET  /health        liveness
//!
//! status codes:
//!     201 batch processed (forwarding failures are reported per reading)
//!     400 empty/malformed body, bad values, missing ids, nothing recognized
//!     500 storage failure, remaining readings were not processed
//!
//! ==============================================================================

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::domain::{BatchResult, ForwardOutcome};
use crate::error::PipelineError;
use crate::pipeline::{CancelFlag, Pipeline};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub log_payloads: bool,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline, log_payloads: false }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/espdata", post(ingest))
        .route("/api/readings", post(ingest))
        .route("/data", get(latest))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http",
                    %request_id,
                    method = %req.method(),
                    uri = %req.uri(),
                )
            }),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

// ==============================================================================
// response bodies
// ==============================================================================

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancelled: bool,
    pub outcomes: Vec<ForwardOutcome>,
}

impl From<BatchResult> for IngestResponse {
    fn from(batch: BatchResult) -> Self {
        Self {
            success: true,
            processed: batch.processed_count,
            error: None,
            cancelled: batch.cancelled,
            outcomes: batch.outcomes,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = if self.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let error = Some(self.to_string());
        let outcomes = match self {
            PipelineError::Storage { completed, .. } => completed,
            _ => Vec::new(),
        };
        let body = IngestResponse {
            success: false,
            processed: outcomes.iter().filter(|o| o.is_persisted()).count(),
            error,
            cancelled: false,
            outcomes,
        };
        (status, Json(body)).into_response()
    }
}

// ==============================================================================
// handlers
// ==============================================================================

/// POST /espdata
///
/// the pipeline runs on its own task so that a dropped request (client gone)
/// only stops the batch between readings; the guard flips the flag when this
/// future is dropped before the task finishes.
async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            tracing::warn!(%request_id, error = %rejection.body_text(), "rejected ingest body");
            return PipelineError::MalformedBody(rejection.body_text()).into_response();
        }
    };
    if state.log_payloads {
        tracing::debug!(%request_id, payload = %body, "data received from device");
    }

    let cancel = CancelFlag::new();
    let guard = cancel.drop_guard();
    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.ingest(body, &cancel).await });
    let joined = task.await;
    guard.disarm();

    match joined {
        Ok(Ok(batch)) => {
            tracing::info!(
                %request_id,
                processed = batch.processed_count,
                forward_failures = batch.forward_failures(),
                cancelled = batch.cancelled,
                "batch ingested"
            );
            (StatusCode::CREATED, Json(IngestResponse::from(batch))).into_response()
        }
        Ok(Err(e)) => {
            if e.is_validation() {
                tracing::warn!(%request_id, error = %e, "batch rejected");
            } else {
                tracing::error!(%request_id, error = %e, "batch aborted");
            }
            e.into_response()
        }
        Err(join) => {
            tracing::error!(%request_id, error = %join, "ingest task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": "server error"})),
            )
                .into_response()
        }
    }
}

/// GET /data
async fn latest(State(state): State<AppState>) -> Response {
    match state.pipeline.store().latest().await {
        Ok(Some(stored)) => Json(stored).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"success": false, "error": "no readings stored yet"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "latest reading lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}
