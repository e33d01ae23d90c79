//! REST endpoints: submit download jobs and look up their status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::jobs::model::{Backoff, JobId, JobOptions};
use crate::jobs::producer::JobProducer;
use crate::store::StatusStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub producer: JobProducer,
    /// Read-only view of job status records.
    pub status: Arc<dyn StatusStore>,
}

/// Build the Axum router for the download API.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/downloads", post(create_download))
        .route("/api/downloads/{id}", get(get_download))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDownloadRequest {
    #[serde(default)]
    file_ids: Vec<String>,
    attempts: Option<u32>,
    backoff: Option<Backoff>,
}

async fn create_download(
    State(state): State<AppState>,
    body: Result<Json<CreateDownloadRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": rejection.body_text()})),
            );
        }
    };
    if req.file_ids.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "fileIds must be a non-empty list"})),
        );
    }

    let options = JobOptions {
        attempts: req.attempts,
        backoff: req.backoff,
    };
    match state.producer.enqueue(req.file_ids, options).await {
        Ok(id) => {
            info!(job_id = %id, "Accepted download request");
            (StatusCode::ACCEPTED, Json(json!({"jobId": id})))
        }
        Err(e) => {
            warn!("Failed to enqueue download: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "Queue unavailable"})),
            )
        }
    }
}

async fn get_download(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = JobId::new(id);
    match state.status.get_status(&job_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(json!(record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Job not found or expired"})),
        ),
        Err(e) => {
            warn!(job_id = %job_id, "Status lookup failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "Status store unavailable"})),
            )
        }
    }
}
