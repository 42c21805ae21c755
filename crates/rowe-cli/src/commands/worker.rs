//! `rowe worker` — the pull-based worker daemon.
//!
//! Registers with a Rowe server, heartbeats on its own timer (so a long
//! tool run never stalls liveness), pulls one task at a time through the
//! checkout endpoint, executes it with the same engine the server embeds,
//! and reports completion. Heartbeat responses list tasks the server has
//! withdrawn; those runs are aborted in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use rowe_core::engine::{RunnerConfig, RuntimeKind, ToolRunner};
use rowe_core::error::TaskFailure;
use rowe_core::models::Task;
use rowe_core::stager::{SchemeStager, StagingCredentials};

pub struct WorkerArgs {
    pub server: String,
    pub name: Option<String>,
    pub runtime: String,
    pub group: String,
    pub cores: i64,
    pub memory: i64,
    pub heartbeat_secs: u64,
    pub poll_secs: u64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Registered {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutBody {
    task: Task,
    #[serde(default)]
    stage_out: Option<String>,
    #[serde(default)]
    credentials: StagingCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatReply {
    #[serde(default)]
    cancel: Vec<String>,
}

pub async fn execute(args: WorkerArgs) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rowe_cli=info,rowe_core=info".into()),
        )
        .init();

    match run_worker(args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("worker failed: {}", e);
            1
        }
    }
}

async fn run_worker(args: WorkerArgs) -> Result<(), String> {
    let http = reqwest::Client::new();
    let base = format!("{}/api/v1", args.server.trim_end_matches('/'));

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("{}-{}", hostname, &uuid::Uuid::new_v4().to_string()[..8]));

    // register
    let response = http
        .post(format!("{}/workers/register", base))
        .json(&serde_json::json!({
            "name": name,
            "hostname": hostname,
            "runtime": args.runtime,
            "cores": args.cores,
            "memory": args.memory,
            "group": args.group,
        }))
        .send()
        .await
        .map_err(|e| format!("register: {}", e))?;
    if !response.status().is_success() {
        return Err(format!("register: HTTP {}", response.status()));
    }
    let registered: Envelope<Registered> =
        response.json().await.map_err(|e| format!("register: {}", e))?;
    let worker_id = registered
        .data
        .ok_or_else(|| "register: empty response".to_string())?
        .id;
    tracing::info!("registered as {} ({})", name, worker_id);

    // in-flight runs, keyed by task id, abortable from the heartbeat loop
    let inflight: Arc<Mutex<HashMap<String, tokio::task::AbortHandle>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let heartbeat = tokio::spawn(heartbeat_loop(
        http.clone(),
        base.clone(),
        worker_id.clone(),
        args.heartbeat_secs,
        inflight.clone(),
    ));

    let work_base = std::env::temp_dir().join(format!("rowe-worker-{}", worker_id));
    let container_runtime = args.runtime != "direct";

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            checked_out = checkout(&http, &base, &worker_id) => {
                match checked_out {
                    Ok(Some(body)) => {
                        run_one(&http, &base, &worker_id, body, &work_base, container_runtime, &inflight)
                            .await;
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_secs(args.poll_secs)).await;
                    }
                    Err(e) => {
                        tracing::warn!("checkout failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(args.poll_secs)).await;
                    }
                }
            }
        }
    }

    heartbeat.abort();
    tracing::info!("deregistering");
    http.delete(format!("{}/workers/{}", base, worker_id))
        .send()
        .await
        .ok();
    Ok(())
}

async fn checkout(
    http: &reqwest::Client,
    base: &str,
    worker_id: &str,
) -> Result<Option<CheckoutBody>, String> {
    let response = http
        .get(format!("{}/workers/{}/checkout", base, worker_id))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    match response.status() {
        reqwest::StatusCode::NO_CONTENT => Ok(None),
        status if status.is_success() => {
            let envelope: Envelope<CheckoutBody> =
                response.json().await.map_err(|e| e.to_string())?;
            Ok(envelope.data)
        }
        status => Err(format!("HTTP {}", status)),
    }
}

/// Execute one checked-out task to completion and report the result.
async fn run_one(
    http: &reqwest::Client,
    base: &str,
    worker_id: &str,
    body: CheckoutBody,
    work_base: &std::path::Path,
    container_runtime: bool,
    inflight: &Arc<Mutex<HashMap<String, tokio::task::AbortHandle>>>,
) {
    let task = body.task;
    let task_id = task.id.clone();
    tracing::info!("running task {} (step {})", task_id, task.step_id);

    let runner = ToolRunner::new(
        Arc::new(SchemeStager::new(body.credentials, None)),
        RunnerConfig {
            work_base: work_base.to_path_buf(),
            ..Default::default()
        },
    );
    let kind = if container_runtime && task.tool.requirements().docker.is_some() {
        RuntimeKind::Container
    } else {
        RuntimeKind::Local
    };

    let stage_out = body.stage_out.clone();
    let tool = task.tool.clone();
    let job = task.job.clone().unwrap_or_default();
    let handle = tokio::spawn({
        let task_id = task_id.clone();
        async move { runner.run(&tool, &job, &task_id, kind, stage_out.as_deref()).await }
    });
    inflight
        .lock()
        .await
        .insert(task_id.clone(), handle.abort_handle());

    let result = handle.await;
    inflight.lock().await.remove(&task_id);

    let completion = match result {
        Err(join_error) if join_error.is_cancelled() => {
            tracing::info!("task {} cancelled by server", task_id);
            return;
        }
        Err(join_error) => completion_body(
            worker_id,
            "FAILED",
            None,
            None,
            None,
            None,
            Some(&TaskFailure::Exec {
                message: format!("worker run panicked: {}", join_error),
                transient: true,
            }),
        ),
        Ok(Ok(outcome)) => {
            let state = if outcome.failure.is_none() {
                "SUCCESS"
            } else {
                "FAILED"
            };
            completion_body(
                worker_id,
                state,
                Some(&outcome.outputs),
                Some(outcome.exit_code),
                Some(&outcome.stdout),
                Some(&outcome.stderr),
                outcome.failure.as_ref(),
            )
        }
        Ok(Err(failure)) => {
            completion_body(worker_id, "FAILED", None, None, None, None, Some(&failure))
        }
    };

    let response = http
        .put(format!("{}/tasks/{}/complete", base, task_id))
        .json(&completion)
        .send()
        .await;
    match response {
        Ok(r) if r.status() == reqwest::StatusCode::CONFLICT => {
            tracing::warn!("completion for task {} rejected (stale lease)", task_id);
        }
        Ok(r) if !r.status().is_success() => {
            tracing::warn!("completion for task {} failed: HTTP {}", task_id, r.status());
        }
        Ok(_) => tracing::info!("task {} reported", task_id),
        Err(e) => tracing::warn!("completion for task {} failed: {}", task_id, e),
    }
}

fn completion_body(
    worker_id: &str,
    state: &str,
    outputs: Option<&Map<String, Value>>,
    exit_code: Option<i32>,
    stdout: Option<&str>,
    stderr: Option<&str>,
    failure: Option<&TaskFailure>,
) -> Value {
    serde_json::json!({
        "workerId": worker_id,
        "state": state,
        "outputs": outputs,
        "exitCode": exit_code,
        "stdout": stdout,
        "stderr": stderr,
        "failure": failure,
    })
}

/// Heartbeats run on their own timer so long tool runs never stall them.
async fn heartbeat_loop(
    http: reqwest::Client,
    base: String,
    worker_id: String,
    interval_secs: u64,
    inflight: Arc<Mutex<HashMap<String, tokio::task::AbortHandle>>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        let running: Vec<String> = inflight.lock().await.keys().cloned().collect();
        let response = http
            .put(format!("{}/workers/{}/heartbeat", base, worker_id))
            .json(&serde_json::json!({ "runningTasks": running }))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => {
                if let Ok(envelope) = r.json::<Envelope<HeartbeatReply>>().await {
                    let cancel = envelope.data.map(|d| d.cancel).unwrap_or_default();
                    if !cancel.is_empty() {
                        let mut inflight = inflight.lock().await;
                        for task_id in cancel {
                            if let Some(handle) = inflight.remove(&task_id) {
                                tracing::info!("aborting withdrawn task {}", task_id);
                                handle.abort();
                            }
                        }
                    }
                }
            }
            Ok(r) => tracing::warn!("heartbeat rejected: HTTP {}", r.status()),
            Err(e) => tracing::warn!("heartbeat failed: {}", e),
        }
    }
}
