use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use rowe_core::cwl;
use rowe_core::error::ServerError;
use rowe_core::models::Workflow;
use rowe_core::state::AppState;

use crate::envelope::{clamp_page, ApiError, Envelope, Pagination};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(register_workflow))
        .route(
            "/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/{id}/validate", post(validate_workflow))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Envelope<Vec<Workflow>>, ApiError> {
    let (limit, offset) = clamp_page(query.limit, query.offset);
    let workflows = state.workflow_store.list(limit, offset).await?;
    let total = state.workflow_store.count().await?;
    Ok(Envelope::paginated(
        workflows,
        Pagination {
            limit,
            offset,
            total,
        },
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterWorkflowRequest {
    name: String,
    #[serde(default)]
    description: String,
    /// The packed CWL document, YAML or JSON.
    cwl: String,
}

async fn register_workflow(
    State(state): State<AppState>,
    Json(body): Json<RegisterWorkflowRequest>,
) -> Result<Envelope<Workflow>, ApiError> {
    let parsed = cwl::parse_document(&body.cwl, None)?;
    let workflow = Workflow::new(body.name, body.description, body.cwl, parsed);
    state.workflow_store.save(&workflow).await?;
    tracing::info!("registered workflow {} ({})", workflow.name, workflow.id);
    Ok(Envelope::success(workflow))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Envelope<Workflow>, ApiError> {
    let workflow = state
        .workflow_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("workflow {} not found", id)))?;
    Ok(Envelope::success(workflow))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateWorkflowRequest {
    name: Option<String>,
    description: Option<String>,
    /// Re-registration: a new document replaces the old definition.
    cwl: Option<String>,
}

async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateWorkflowRequest>,
) -> Result<Envelope<Workflow>, ApiError> {
    let mut workflow = state
        .workflow_store
        .get(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("workflow {} not found", id)))?;

    if let Some(cwl_text) = body.cwl {
        workflow.parsed = cwl::parse_document(&cwl_text, None)?;
        workflow.cwl_version = workflow.parsed.cwl_version.clone();
        workflow.raw_cwl = cwl_text;
    }
    if let Some(name) = body.name {
        workflow.name = name;
    }
    if let Some(description) = body.description {
        workflow.description = description;
    }
    workflow.updated_at = chrono::Utc::now();
    state.workflow_store.save(&workflow).await?;
    Ok(Envelope::success(workflow))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    state.workflow_store.delete(&id).await?;
    Ok(Envelope::success(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest {
    /// Validate this document; defaults to the stored definition.
    cwl: Option<String>,
}

async fn validate_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ValidateRequest>>,
) -> Result<Envelope<serde_json::Value>, ApiError> {
    let text = match body.and_then(|Json(b)| b.cwl) {
        Some(text) => text,
        None => {
            state
                .workflow_store
                .get(&id)
                .await?
                .ok_or_else(|| ServerError::NotFound(format!("workflow {} not found", id)))?
                .raw_cwl
        }
    };
    let result = match cwl::parse_document(&text, None) {
        Ok(_) => serde_json::json!({ "valid": true, "errors": [] }),
        Err(ServerError::Validation(errors)) => {
            serde_json::json!({ "valid": false, "errors": errors })
        }
        Err(other) => return Err(other.into()),
    };
    Ok(Envelope::success(result))
}
