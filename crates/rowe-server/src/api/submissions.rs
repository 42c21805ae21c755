use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use rowe_core::error::ServerError;
use rowe_core::models::{Submission, Task};
use rowe_core::state::AppState;

use crate::envelope::{clamp_page, ApiError, Envelope, Pagination};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_submissions).post(create_submission))
        .route("/{id}", get(get_submission))
        .route("/{id}/cancel", put(cancel_submission))
        .route("/{id}/tasks", get(list_tasks))
        .route("/{id}/tasks/{tid}", get(get_task))
        .route("/{id}/tasks/{tid}/logs", get(get_task_logs))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_submissions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Envelope<Vec<Submission>>, ApiError> {
    let (limit, offset) = clamp_page(query.limit, query.offset);
    let submissions = state.submission_store.list(limit, offset).await?;
    let total = state.submission_store.count().await?;
    Ok(Envelope::paginated(
        submissions,
        Pagination {
            limit,
            offset,
            total,
        },
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubmissionRequest {
    workflow_id: String,
    #[serde(default)]
    inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubmissionQuery {
    #[serde(default)]
    dry_run: bool,
}

async fn create_submission(
    State(state): State<AppState>,
    Query(query): Query<CreateSubmissionQuery>,
    Json(body): Json<CreateSubmissionRequest>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    let workflow = state
        .workflow_store
        .get(&body.workflow_id)
        .await?
        .ok_or_else(|| {
            ServerError::NotFound(format!("workflow {} not found", body.workflow_id))
        })?;

    // concrete inputs must cover every required workflow input
    let mut errors = Vec::new();
    for input in &workflow.parsed.inputs {
        let provided = body
            .inputs
            .get(&input.id)
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if !provided && !input.r#type.is_optional() && input.default.is_none() {
            errors.push(format!("inputs.{}: required input is missing", input.id));
        }
    }
    for key in body.inputs.keys() {
        if workflow.parsed.input(key).is_none() {
            errors.push(format!("inputs.{}: not a declared workflow input", key));
        }
    }
    if !errors.is_empty() {
        return Err(ServerError::Validation(errors).into());
    }

    if query.dry_run {
        return Ok(Envelope::success(serde_json::json!({
            "valid": true,
            "workflowId": workflow.id,
        })));
    }

    let submission = Submission::new(workflow.id.clone(), body.inputs, body.labels);
    state.submission_store.save(&submission).await?;
    state
        .scheduler
        .materialize_submission(&workflow, &submission)
        .await?;
    tracing::info!(
        "created submission {} for workflow {}",
        submission.id,
        workflow.name
    );
    Ok(Envelope::success(serde_json::to_value(submission).unwrap_or_default()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionDetail {
    #[serde(flatten)]
    submission: Submission,
    tasks: Vec<Task>,
}

async fn get_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Envelope<SubmissionDetail>, ApiError> {
    let submission = state
        .submission_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("submission {} not found", id)))?;
    let tasks = state.task_store.list_by_submission(&id).await?;
    Ok(Envelope::success(SubmissionDetail { submission, tasks }))
}

async fn cancel_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Envelope<Submission>, ApiError> {
    let submission = state.scheduler.cancel_submission(&id).await?;
    Ok(Envelope::success(submission))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Envelope<Vec<Task>>, ApiError> {
    if state.submission_store.get(&id).await?.is_none() {
        return Err(ServerError::NotFound(format!("submission {} not found", id)).into());
    }
    let tasks = state.task_store.list_by_submission(&id).await?;
    Ok(Envelope::success(tasks))
}

async fn fetch_task(state: &AppState, sid: &str, tid: &str) -> Result<Task, ServerError> {
    let task = state
        .task_store
        .get(tid)
        .await?
        .filter(|t| t.submission_id == sid)
        .ok_or_else(|| {
            ServerError::NotFound(format!("task {} not found in submission {}", tid, sid))
        })?;
    Ok(task)
}

async fn get_task(
    State(state): State<AppState>,
    Path((sid, tid)): Path<(String, String)>,
) -> Result<Envelope<Task>, ApiError> {
    Ok(Envelope::success(fetch_task(&state, &sid, &tid).await?))
}

async fn get_task_logs(
    State(state): State<AppState>,
    Path((sid, tid)): Path<(String, String)>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    let task = fetch_task(&state, &sid, &tid).await?;
    Ok(Envelope::success(serde_json::json!({
        "taskId": task.id,
        "stepId": task.step_id,
        "state": task.state,
        "exitCode": task.exit_code,
        "stdout": task.stdout.unwrap_or_default(),
        "stderr": task.stderr.unwrap_or_default(),
        "failure": task.failure,
    })))
}
