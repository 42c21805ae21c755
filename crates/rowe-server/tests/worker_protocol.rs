//! Worker protocol over real HTTP: register, checkout, lease expiry,
//! stale-completion rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rowe_core::config::RoweConfig;
use rowe_core::cwl;
use rowe_core::db::Database;
use rowe_core::models::{Submission, SubmissionState, TaskState, Workflow};
use rowe_core::state::{AppState, AppStateInner};

async fn spawn_app(mut config: RoweConfig) -> (String, AppState) {
    config.db_path = String::new();
    let db = Database::open_in_memory().unwrap();
    let state: AppState = Arc::new(AppStateInner::new(config, db).unwrap());
    let router = rowe_server::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/api/v1", addr), state)
}

const WORKER_TOOL: &str = r#"
cwlVersion: v1.2
class: CommandLineTool
baseCommand: [echo, done]
hints:
  roweHint:
    executor: worker
inputs: []
outputs: []
"#;

async fn submit_worker_task(state: &AppState) -> Submission {
    let parsed = cwl::parse_document(WORKER_TOOL, None).unwrap();
    let workflow = Workflow::new("wf".to_string(), String::new(), WORKER_TOOL.to_string(), parsed);
    state.workflow_store.save(&workflow).await.unwrap();
    let submission = Submission::new(workflow.id.clone(), serde_json::Map::new(), HashMap::new());
    state.submission_store.save(&submission).await.unwrap();
    state
        .scheduler
        .materialize_submission(&workflow, &submission)
        .await
        .unwrap();
    // schedule + park in QUEUED for the worker pool
    state.scheduler.tick().await.unwrap();
    submission
}

async fn register_worker(client: &reqwest::Client, base: &str, name: &str) -> String {
    let response = client
        .post(format!("{}/workers/register", base))
        .json(&serde_json::json!({
            "name": name,
            "hostname": "testhost",
            "runtime": "direct",
            "cores": 2,
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn checkout_leases_one_task_and_serves_204_when_empty() {
    let (base, state) = spawn_app(RoweConfig::default()).await;
    let client = reqwest::Client::new();
    let submission = submit_worker_task(&state).await;

    let worker = register_worker(&client, &base, "w1").await;

    let response = client
        .get(format!("{}/workers/{}/checkout", base, worker))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    let task = &body["data"]["task"];
    assert_eq!(task["state"], "RUNNING");
    assert_eq!(task["submissionId"], serde_json::json!(submission.id));
    // the checkout body carries the execution recipe
    assert_eq!(task["tool"]["class"], "CommandLineTool");
    assert!(task["job"].is_object());

    // nothing left: 204
    let response = client
        .get(format!("{}/workers/{}/checkout", base, worker))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn expired_lease_moves_task_to_second_worker_and_rejects_the_first() {
    let config = RoweConfig {
        worker_lease_secs: 0,
        ..Default::default()
    };
    let (base, state) = spawn_app(config).await;
    let client = reqwest::Client::new();
    submit_worker_task(&state).await;

    let w1 = register_worker(&client, &base, "w1").await;
    let w2 = register_worker(&client, &base, "w2").await;

    // w1 claims, then goes silent; the zero-second lease expires at once
    let response = client
        .get(format!("{}/workers/{}/checkout", base, w1))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    let task_id = body["data"]["task"]["id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(50)).await;
    state.scheduler.tick().await.unwrap();

    let task = state.task_store.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Queued, "expired lease returns to the queue");
    assert!(task.claimed_by.is_none());
    assert_eq!(task.retry_count, 0, "lease expiry is not a retry");

    // w2 claims and completes
    let response = client
        .get(format!("{}/workers/{}/checkout", base, w2))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = client
        .put(format!("{}/tasks/{}/complete", base, task_id))
        .json(&serde_json::json!({
            "workerId": w2,
            "state": "SUCCESS",
            "outputs": {},
            "exitCode": 0,
            "stdout": "done\n",
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // the original worker's late completion bounces
    let response = client
        .put(format!("{}/tasks/{}/complete", base, task_id))
        .json(&serde_json::json!({
            "workerId": w1,
            "state": "SUCCESS",
            "exitCode": 0,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    let task = state.task_store.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Success);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test]
async fn completed_worker_tasks_finalize_the_submission() {
    let (base, state) = spawn_app(RoweConfig::default()).await;
    let client = reqwest::Client::new();
    let submission = submit_worker_task(&state).await;
    let worker = register_worker(&client, &base, "w1").await;

    let response = client
        .get(format!("{}/workers/{}/checkout", base, worker))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    let task_id = body["data"]["task"]["id"].as_str().unwrap();

    client
        .put(format!("{}/tasks/{}/complete", base, task_id))
        .json(&serde_json::json!({
            "workerId": worker,
            "state": "SUCCESS",
            "outputs": {},
            "exitCode": 0,
        }))
        .send()
        .await
        .unwrap();

    state.scheduler.tick().await.unwrap();
    let submission = state
        .submission_store
        .get(&submission.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(submission.state, SubmissionState::Completed);
}

#[tokio::test]
async fn heartbeat_reports_withdrawn_tasks() {
    let (base, state) = spawn_app(RoweConfig::default()).await;
    let client = reqwest::Client::new();
    let submission = submit_worker_task(&state).await;
    let worker = register_worker(&client, &base, "w1").await;

    let response = client
        .get(format!("{}/workers/{}/checkout", base, worker))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    let task_id = body["data"]["task"]["id"].as_str().unwrap().to_string();

    // nothing withdrawn yet
    let response = client
        .put(format!("{}/workers/{}/heartbeat", base, worker))
        .json(&serde_json::json!({ "runningTasks": [task_id] }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["cancel"], serde_json::json!([]));

    // cancelling the submission withdraws the in-flight task
    state.scheduler.cancel_submission(&submission.id).await.unwrap();
    let response = client
        .put(format!("{}/workers/{}/heartbeat", base, worker))
        .json(&serde_json::json!({ "runningTasks": [task_id] }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["cancel"], serde_json::json!([task_id]));
}
