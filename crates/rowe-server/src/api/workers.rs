//! The pull-based worker protocol.
//!
//! Workers register, heartbeat on their own timer, pull tasks through the
//! atomic checkout, and report completions. A checkout body carries
//! everything the worker needs to run the task with the shared engine:
//! the inline tool, the resolved job, the stage-out destination, and the
//! staging credentials this submission is entitled to.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use rowe_core::error::{ServerError, TaskFailure};
use rowe_core::models::{Task, TaskState, Worker, WorkerRuntime};
use rowe_core::stager::StagingCredentials;
use rowe_core::state::AppState;

use crate::envelope::{ApiError, Envelope};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/{id}/heartbeat", put(heartbeat))
        .route("/{id}/checkout", axum::routing::get(checkout))
        .route("/{id}", delete(deregister))
}

/// `/tasks/{id}/complete` lives outside the `/workers` prefix.
pub fn tasks_router() -> Router<AppState> {
    Router::new().route("/{id}/complete", put(complete))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    name: String,
    #[serde(default)]
    hostname: String,
    runtime: String,
    #[serde(default = "default_cores")]
    cores: i64,
    #[serde(default)]
    memory: i64,
    #[serde(default)]
    group: String,
}

fn default_cores() -> i64 {
    1
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    let runtime = WorkerRuntime::from_str(&body.runtime).ok_or_else(|| {
        ServerError::BadRequest(format!(
            "unknown runtime '{}' (expected direct, container, or container-alt)",
            body.runtime
        ))
    })?;
    let worker = Worker::new(
        body.name,
        body.hostname,
        runtime,
        body.cores,
        body.memory,
        body.group,
    );
    state.worker_store.save(&worker).await?;
    tracing::info!("worker {} registered ({})", worker.name, worker.id);
    Ok(Envelope::success(serde_json::json!({ "id": worker.id })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest {
    /// Task ids the worker believes it is still running.
    #[serde(default)]
    running_tasks: Vec<String>,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    let alive = state.worker_store.heartbeat(&id).await?;
    if !alive {
        return Err(ServerError::NotFound(format!("worker {} not found", id)).into());
    }

    // tasks the server no longer considers this worker's: tell it to stop
    let running = body.map(|Json(b)| b.running_tasks).unwrap_or_default();
    let mut cancel = Vec::new();
    for task_id in running {
        let ours = state
            .task_store
            .get(&task_id)
            .await?
            .map(|t| t.state == TaskState::Running && t.claimed_by.as_deref() == Some(id.as_str()))
            .unwrap_or(false);
        if !ours {
            cancel.push(task_id);
        }
    }
    Ok(Envelope::success(serde_json::json!({ "cancel": cancel })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutBody {
    task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage_out: Option<String>,
    credentials: StagingCredentials,
}

async fn checkout(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let worker = match state.worker_store.get(&id).await {
        Ok(Some(worker)) => worker,
        Ok(None) => {
            return ApiError(ServerError::NotFound(format!("worker {} not found", id)))
                .into_response()
        }
        Err(e) => return ApiError(e).into_response(),
    };

    match state
        .task_store
        .checkout(&worker, state.config.worker_lease_secs)
        .await
    {
        Ok(Some(task)) => {
            tracing::info!("task {} checked out by worker {}", task.id, worker.name);
            let stage_out = if state.config.stage_out_base.is_empty() {
                None
            } else {
                Some(state.config.stage_out_base.clone())
            };
            Envelope::success(CheckoutBody {
                task,
                stage_out,
                credentials: StagingCredentials::default(),
            })
            .into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn deregister(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    if !state.worker_store.deregister(&id).await? {
        return Err(ServerError::NotFound(format!("worker {} not found", id)).into());
    }
    Ok(Envelope::success(serde_json::json!({ "deregistered": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest {
    worker_id: String,
    /// SUCCESS or FAILED.
    state: String,
    #[serde(default)]
    outputs: Option<serde_json::Map<String, serde_json::Value>>,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
    failure: Option<TaskFailure>,
}

async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    let task_state = TaskState::from_str(&body.state)
        .filter(|s| matches!(s, TaskState::Success | TaskState::Failed))
        .ok_or_else(|| {
            ServerError::BadRequest(format!(
                "completion state must be SUCCESS or FAILED, got '{}'",
                body.state
            ))
        })?;

    let accepted = state
        .task_store
        .complete_from_worker(
            &id,
            &body.worker_id,
            task_state,
            body.outputs.as_ref(),
            body.exit_code,
            body.stdout.as_deref(),
            body.stderr.as_deref(),
            body.failure.as_ref(),
        )
        .await?;

    if !accepted {
        // stale lease or duplicate completion
        return Err(ServerError::Conflict(format!(
            "task {} is not running under worker {}",
            id, body.worker_id
        ))
        .into());
    }
    tracing::info!("task {} completed as {} by worker {}", id, body.state, body.worker_id);
    Ok(Envelope::success(serde_json::json!({ "accepted": true })))
}
