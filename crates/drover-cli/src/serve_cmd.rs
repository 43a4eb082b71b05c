//! Read-only HTTP surface over the task store.
//!
//! Three endpoints, all list-shaped: `/tasks`, `/tasks/status/{status}`,
//! and `/task_history`. The HTTP layer is a thin read-through -- it never
//! mutates the store.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use drover_store::{Task, TaskStatus, TaskStore};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListResponse {
    pub total_count: usize,
    pub data: Vec<Task>,
}

impl TaskListResponse {
    fn new(mut data: Vec<Task>) -> Self {
        data.sort_by_key(|t| t.created_at);
        Self {
            total_count: data.len(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(store: Arc<TaskStore>) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/status/{status}", get(list_tasks_by_status))
        .route("/task_history", get(task_history))
        .layer(CorsLayer::permissive())
        .with_state(store)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve the read surface until `cancel` fires.
pub async fn run_serve(store: Arc<TaskStore>, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let app = build_router(store);
    tracing::info!("drover serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server error")?;
    tracing::info!("drover serve shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_tasks(State(store): State<Arc<TaskStore>>) -> Json<TaskListResponse> {
    Json(TaskListResponse::new(store.list()))
}

async fn list_tasks_by_status(
    State(store): State<Arc<TaskStore>>,
    Path(status): Path<String>,
) -> Result<Json<TaskListResponse>, AppError> {
    let status: TaskStatus = status
        .parse()
        .map_err(|_| AppError::unprocessable(format!("invalid task status: {status:?}")))?;
    Ok(Json(TaskListResponse::new(store.list_by_status(status))))
}

async fn task_history(State(store): State<Arc<TaskStore>>) -> Json<TaskListResponse> {
    Json(TaskListResponse::new(store.list_history()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
