use axum::{
    extract::{Path, State},
    response::Json,
};
use std::sync::Arc;

use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use mailq_core::models::{TaskResponse, TaskStats};
use mailq_core::AppError;

/// Get a task by ID
#[utoipa::path(
    get,
    path = "/tasks/{id}",
    tag = "tasks",
    params(
        ("id" = i64, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task found", body = TaskResponse),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state))]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    match state.store.get(task_id).await? {
        Some(task) => Ok(Json(TaskResponse::from(task))),
        None => Err(AppError::NotFound(format!("Task {} not found", task_id)).into()),
    }
}

/// Count tasks per status
#[utoipa::path(
    get,
    path = "/tasks/stats",
    tag = "tasks",
    responses(
        (status = 200, description = "Task counts", body = TaskStats),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state))]
pub async fn task_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TaskStats>, HttpAppError> {
    Ok(Json(state.store.stats().await?))
}

/// Retry a dead task
///
/// Resets the failure count and returns the task to the pending pool.
#[utoipa::path(
    post,
    path = "/tasks/{id}/retry",
    tag = "tasks",
    params(
        ("id" = i64, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task requeued", body = TaskResponse),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 409, description = "Task is not dead", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state))]
pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskResponse>, HttpAppError> {
    if let Some(task) = state.queue.revive(task_id).await? {
        return Ok(Json(TaskResponse::from(task)));
    }

    match state.store.get(task_id).await? {
        Some(task) => Err(AppError::Conflict(format!(
            "Task {} is {}, only dead tasks can be retried",
            task_id, task.status
        ))
        .into()),
        None => Err(AppError::NotFound(format!("Task {} not found", task_id)).into()),
    }
}
