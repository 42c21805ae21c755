//! Remote-service executor against a mocked JSON-RPC 1.1 endpoint:
//! schema fetch, parameter validation, start, poll, manifest collection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};

use rowe_core::config::RoweConfig;
use rowe_core::cwl;
use rowe_core::db::Database;
use rowe_core::models::{Submission, SubmissionState, TaskState, Workflow};
use rowe_core::state::{AppState, AppStateInner};

async fn rpc_handler(Json(body): Json<Value>) -> Json<Value> {
    let method = body["method"].as_str().unwrap_or_default();
    let result = match method {
        "query_app_description" => json!([{
            "id": "GenomeAssembly",
            "parameters": [
                {"id": "genome", "required": 1, "type": "string"},
                {"id": "output_path", "required": 1, "type": "folder"},
                {"id": "output_file", "required": 1, "type": "wsid"},
            ],
        }]),
        "start_app" => json!({"id": "J"}),
        "query_tasks" => json!({"J": {"status": "completed"}}),
        "Workspace.get" => json!([[[
            "manifest",
            "job_result",
            "{\"files\": [\"assembly.fasta\", \"report.html\"]}",
        ]]]),
        other => json!({"unexpected": other}),
    };
    Json(json!({"id": body["id"], "result": result, "error": null}))
}

async fn spawn_mock_service() -> String {
    let router = Router::new().route("/", post(rpc_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/", addr)
}

const REMOTE_TOOL: &str = r#"
cwlVersion: v1.2
class: CommandLineTool
baseCommand: [bvbrc-app]
hints:
  roweHint:
    bvbrc_app_id: GenomeAssembly
inputs:
  genome: string
outputs:
  files:
    type: File[]
"#;

#[tokio::test]
async fn remote_flow_starts_polls_and_collects_the_manifest() {
    let endpoint = spawn_mock_service().await;
    let config = RoweConfig {
        bvbrc: rowe_core::config::BvbrcConfig {
            endpoint,
            token: "test-token".to_string(),
            workspace_path: "/user/jobs".to_string(),
            schema_ttl_secs: 300,
        },
        ..Default::default()
    };
    let db = Database::open_in_memory().unwrap();
    let state: AppState = Arc::new(AppStateInner::new(config, db).unwrap());

    let parsed = cwl::parse_document(REMOTE_TOOL, None).unwrap();
    let workflow = Workflow::new(
        "assembly".to_string(),
        String::new(),
        REMOTE_TOOL.to_string(),
        parsed,
    );
    state.workflow_store.save(&workflow).await.unwrap();

    let mut inputs = serde_json::Map::new();
    inputs.insert("genome".to_string(), json!("my-genome"));
    let submission = Submission::new(workflow.id.clone(), inputs, HashMap::new());
    state.submission_store.save(&submission).await.unwrap();
    state
        .scheduler
        .materialize_submission(&workflow, &submission)
        .await
        .unwrap();

    // schedule + dispatch + poll-to-completion across a few ticks
    for _ in 0..5 {
        state.scheduler.tick().await.unwrap();
        let current = state
            .submission_store
            .get(&submission.id)
            .await
            .unwrap()
            .unwrap();
        if current.state.is_terminal() {
            break;
        }
    }

    let done = state
        .submission_store
        .get(&submission.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.state, SubmissionState::Completed, "{:?}", done.error);

    let tasks = state.task_store.list_by_submission(&submission.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.state, TaskState::Success);
    assert_eq!(task.external_id.as_deref(), Some("J"));

    // manifest files surface as the declared output, under the hidden
    // sibling folder of the result object
    let files = task.outputs.as_ref().unwrap()["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["basename"], "assembly.fasta");
    let location = files[0]["location"].as_str().unwrap();
    assert!(
        location.contains(&format!(".{}/assembly.fasta", task.id)),
        "{}",
        location
    );

    // the schema landed in the persistent cache
    let cached = state
        .app_schema_store
        .get("GenomeAssembly")
        .await
        .unwrap()
        .expect("schema cached");
    assert_eq!(cached.parameters.len(), 3);

    let outputs = done.outputs.unwrap();
    assert_eq!(outputs["files"].as_array().unwrap().len(), 2);
}
