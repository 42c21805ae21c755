//! Task persistence and the atomic checkout query.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use serde_json::Value;

use crate::db::Database;
use crate::error::{ServerError, TaskFailure};
use crate::models::{ExecutorType, Task, TaskState, Worker, WorkerRuntime};

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

const COLUMNS: &str = "id, submission_id, step_id, state, executor_type, external_id, \
     tool_json, job_json, depends_on_json, scatter_index, worker_group, needs_container, \
     outputs_json, exit_code, stdout, stderr, failure_json, retry_count, max_retries, \
     claimed_by, lease_expires_at, created_at, started_at, completed_at";

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, task: &Task) -> Result<(), ServerError> {
        let t = task.clone();
        let tool = serde_json::to_string(&t.tool)
            .map_err(|e| ServerError::Internal(format!("serialize tool: {}", e)))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, submission_id, step_id, state, executor_type, external_id,
                         tool_json, job_json, depends_on_json, scatter_index, worker_group, needs_container,
                         outputs_json, exit_code, stdout, stderr, failure_json, retry_count, max_retries,
                         claimed_by, lease_expires_at, created_at, started_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                    rusqlite::params![
                        t.id,
                        t.submission_id,
                        t.step_id,
                        t.state.as_str(),
                        t.executor_type.map(|e| e.as_str()),
                        t.external_id,
                        tool,
                        t.job.as_ref().map(|j| Value::Object(j.clone()).to_string()),
                        serde_json::to_string(&t.depends_on).unwrap_or_default(),
                        t.scatter_index.map(|i| i as i64),
                        t.worker_group,
                        t.needs_container as i64,
                        t.outputs.as_ref().map(|o| Value::Object(o.clone()).to_string()),
                        t.exit_code,
                        t.stdout,
                        t.stderr,
                        t.failure.as_ref().and_then(|f| serde_json::to_string(f).ok()),
                        t.retry_count,
                        t.max_retries,
                        t.claimed_by,
                        t.lease_expires_at.map(|ts| ts.timestamp_millis()),
                        t.created_at.timestamp_millis(),
                        t.started_at.map(|ts| ts.timestamp_millis()),
                        t.completed_at.map(|ts| ts.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    row_to_task,
                )
                .optional()
            })
            .await
    }

    pub async fn list_by_submission(&self, submission_id: &str) -> Result<Vec<Task>, ServerError> {
        let submission_id = submission_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tasks WHERE submission_id = ?1 ORDER BY created_at, step_id, scatter_index",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![submission_id], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// PENDING → SCHEDULED, writing the resolved job exactly once.
    pub async fn schedule(
        &self,
        id: &str,
        job: &serde_json::Map<String, Value>,
        executor: ExecutorType,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let job_text = Value::Object(job.clone()).to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET state = 'SCHEDULED', job_json = COALESCE(job_json, ?1), executor_type = ?2
                     WHERE id = ?3 AND state = 'PENDING'",
                    rusqlite::params![job_text, executor.as_str(), id],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// SCHEDULED → QUEUED/RUNNING at dispatch, recording the executor's
    /// external id.
    pub async fn dispatch(
        &self,
        id: &str,
        to: TaskState,
        external_id: Option<&str>,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let external_id = external_id.map(str::to_string);
        let now = Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET state = ?1, external_id = ?2, started_at = COALESCE(started_at, ?3)
                     WHERE id = ?4 AND state = 'SCHEDULED'",
                    rusqlite::params![to.as_str(), external_id, now, id],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Plain conditional transition.
    pub async fn transition(
        &self,
        id: &str,
        from: TaskState,
        to: TaskState,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks SET state = ?1 WHERE id = ?2 AND state = ?3",
                    rusqlite::params![to.as_str(), id, from.as_str()],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Terminal write for one attempt: exactly one completion may land.
    pub async fn complete(
        &self,
        id: &str,
        state: TaskState,
        outputs: Option<&serde_json::Map<String, Value>>,
        exit_code: Option<i32>,
        stdout: Option<&str>,
        stderr: Option<&str>,
        failure: Option<&TaskFailure>,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let outputs = outputs.map(|o| Value::Object(o.clone()).to_string());
        let stdout = stdout.map(str::to_string);
        let stderr = stderr.map(str::to_string);
        let failure = failure.and_then(|f| serde_json::to_string(f).ok());
        let now = Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET state = ?1, outputs_json = ?2, exit_code = ?3, stdout = ?4, stderr = ?5,
                         failure_json = ?6, claimed_by = NULL, lease_expires_at = NULL, completed_at = ?7
                     WHERE id = ?8 AND state IN ('PENDING', 'SCHEDULED', 'QUEUED', 'RUNNING')",
                    rusqlite::params![state.as_str(), outputs, exit_code, stdout, stderr, failure, now, id],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Completion reported by a worker. The lease must still be held by that
    /// worker; a stale worker's write is rejected.
    pub async fn complete_from_worker(
        &self,
        id: &str,
        worker_id: &str,
        state: TaskState,
        outputs: Option<&serde_json::Map<String, Value>>,
        exit_code: Option<i32>,
        stdout: Option<&str>,
        stderr: Option<&str>,
        failure: Option<&TaskFailure>,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        let outputs = outputs.map(|o| Value::Object(o.clone()).to_string());
        let stdout = stdout.map(str::to_string);
        let stderr = stderr.map(str::to_string);
        let failure = failure.and_then(|f| serde_json::to_string(f).ok());
        let now = Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET state = ?1, outputs_json = ?2, exit_code = ?3, stdout = ?4, stderr = ?5,
                         failure_json = ?6, claimed_by = NULL, lease_expires_at = NULL, completed_at = ?7
                     WHERE id = ?8 AND state = 'RUNNING' AND claimed_by = ?9",
                    rusqlite::params![
                        state.as_str(),
                        outputs,
                        exit_code,
                        stdout,
                        stderr,
                        failure,
                        now,
                        id,
                        worker_id
                    ],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Atomic checkout: one QUEUED worker task whose runtime/group matches,
    /// flipped to RUNNING and leased in a single statement. Two concurrent
    /// checkouts can never both win the same row.
    pub async fn checkout(
        &self,
        worker: &Worker,
        lease_secs: i64,
    ) -> Result<Option<Task>, ServerError> {
        let worker_id = worker.id.clone();
        let group = worker.group.clone();
        let container_capable = !matches!(worker.runtime, WorkerRuntime::Direct);
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let lease_ms = (now + chrono::Duration::seconds(lease_secs)).timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "UPDATE tasks
                         SET state = 'RUNNING', claimed_by = ?1, lease_expires_at = ?2,
                             started_at = COALESCE(started_at, ?3)
                         WHERE id = (
                             SELECT id FROM tasks
                             WHERE state = 'QUEUED' AND executor_type = 'worker'
                               AND (claimed_by IS NULL OR lease_expires_at < ?3)
                               AND (worker_group = '' OR worker_group = ?4)
                               AND (needs_container = 0 OR ?5)
                             ORDER BY created_at LIMIT 1
                         )
                         RETURNING {}",
                        COLUMNS
                    ),
                    rusqlite::params![worker_id, lease_ms, now_ms, group, container_capable],
                    row_to_task,
                )
                .optional()
            })
            .await
    }

    /// Reclaim worker tasks whose lease has expired: back to QUEUED with the
    /// claim cleared. Lease expiry is not a retry.
    pub async fn reclaim_expired(&self) -> Result<usize, ServerError> {
        let now = Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET state = 'QUEUED', claimed_by = NULL, lease_expires_at = NULL
                     WHERE state = 'RUNNING' AND executor_type = 'worker'
                       AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1",
                    rusqlite::params![now],
                )
            })
            .await?;
        Ok(changed)
    }

    /// Rewire a gather task to wait on its scatter children.
    pub async fn update_depends_on(&self, id: &str, depends_on: &[String]) -> Result<(), ServerError> {
        let id = id.to_string();
        let deps = serde_json::to_string(depends_on).unwrap_or_default();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks SET depends_on_json = ?1 WHERE id = ?2",
                    rusqlite::params![deps, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Record the resolved job on a task that never dispatches (scatter
    /// gather nodes).
    pub async fn set_job(
        &self,
        id: &str,
        job: &serde_json::Map<String, Value>,
    ) -> Result<(), ServerError> {
        let id = id.to_string();
        let job_text = Value::Object(job.clone()).to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks SET job_json = COALESCE(job_json, ?1) WHERE id = ?2",
                    rusqlite::params![job_text, id],
                )?;
                Ok(())
            })
            .await
    }

    /// FAILED → RETRYING (retry budget checked by the scheduler).
    pub async fn mark_retrying(&self, id: &str) -> Result<bool, ServerError> {
        self.transition(id, TaskState::Failed, TaskState::Retrying).await
    }

    /// RETRYING → PENDING with the attempt counter bumped and per-attempt
    /// state cleared. The resolved job survives.
    pub async fn requeue_retrying(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET state = 'PENDING', retry_count = retry_count + 1,
                         executor_type = NULL, external_id = NULL, outputs_json = NULL,
                         exit_code = NULL, failure_json = NULL,
                         claimed_by = NULL, lease_expires_at = NULL,
                         started_at = NULL, completed_at = NULL
                     WHERE id = ?1 AND state = 'RETRYING'",
                    rusqlite::params![id],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Cancellation sweep: tasks not yet handed to an executor become
    /// SKIPPED.
    pub async fn skip_undispatched(&self, submission_id: &str) -> Result<usize, ServerError> {
        let submission_id = submission_id.to_string();
        let now = Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks SET state = 'SKIPPED', completed_at = ?1
                     WHERE submission_id = ?2 AND state IN ('PENDING', 'SCHEDULED', 'QUEUED', 'RETRYING')",
                    rusqlite::params![now, submission_id],
                )
            })
            .await?;
        Ok(changed)
    }
}

fn row_to_task(row: &Row<'_>) -> Result<Task, rusqlite::Error> {
    let state_text: String = row.get(3)?;
    let executor_text: Option<String> = row.get(4)?;
    let tool_text: String = row.get(6)?;
    let job_text: Option<String> = row.get(7)?;
    let depends_text: String = row.get(8)?;
    let scatter_index: Option<i64> = row.get(9)?;
    let needs_container: i64 = row.get(11)?;
    let outputs_text: Option<String> = row.get(12)?;
    let failure_text: Option<String> = row.get(16)?;
    let lease_ms: Option<i64> = row.get(20)?;
    let created_ms: i64 = row.get(21)?;
    let started_ms: Option<i64> = row.get(22)?;
    let completed_ms: Option<i64> = row.get(23)?;

    let tool = serde_json::from_str(&tool_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Task {
        id: row.get(0)?,
        submission_id: row.get(1)?,
        step_id: row.get(2)?,
        state: TaskState::from_str(&state_text).unwrap_or(TaskState::Pending),
        executor_type: executor_text.as_deref().and_then(ExecutorType::from_str),
        external_id: row.get(5)?,
        tool,
        job: job_text.and_then(|t| serde_json::from_str(&t).ok()),
        depends_on: serde_json::from_str(&depends_text).unwrap_or_default(),
        scatter_index: scatter_index.map(|i| i as usize),
        worker_group: row.get(10)?,
        needs_container: needs_container != 0,
        outputs: outputs_text.and_then(|t| serde_json::from_str(&t).ok()),
        exit_code: row.get(13)?,
        stdout: row.get(14)?,
        stderr: row.get(15)?,
        failure: failure_text.and_then(|t| serde_json::from_str(&t).ok()),
        retry_count: row.get(17)?,
        max_retries: row.get(18)?,
        claimed_by: row.get(19)?,
        lease_expires_at: lease_ms.and_then(DateTime::from_timestamp_millis),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        started_at: started_ms.and_then(DateTime::from_timestamp_millis),
        completed_at: completed_ms.and_then(DateTime::from_timestamp_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cwl::{Process, Tool};
    use crate::models::WorkerState;

    fn noop_tool() -> Process {
        Process::Tool(Tool {
            id: "noop".to_string(),
            base_command: vec!["true".to_string()],
            arguments: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            requirements: Default::default(),
            hints: Default::default(),
            stdin: None,
            stdout: None,
            stderr: None,
            success_codes: Vec::new(),
            temporary_fail_codes: Vec::new(),
            permanent_fail_codes: Vec::new(),
        })
    }

    async fn seed(db: &Database) -> (TaskStore, Task) {
        use crate::models::{Submission, Workflow};
        use crate::store::{SubmissionStore, WorkflowStore};

        let parsed = crate::cwl::parse_document(
            "cwlVersion: v1.2\nclass: CommandLineTool\nbaseCommand: [true]\ninputs: []\noutputs: []\n",
            None,
        )
        .unwrap();
        let workflow = Workflow::new("w".to_string(), String::new(), String::new(), parsed);
        WorkflowStore::new(db.clone()).save(&workflow).await.unwrap();
        let submission = Submission::new(
            workflow.id.clone(),
            serde_json::Map::new(),
            Default::default(),
        );
        SubmissionStore::new(db.clone()).save(&submission).await.unwrap();

        let store = TaskStore::new(db.clone());
        let mut task = Task::new(submission.id, "main".to_string(), noop_tool(), Vec::new(), 0);
        task.state = TaskState::Queued;
        task.executor_type = Some(ExecutorType::Worker);
        store.save(&task).await.unwrap();
        (store, task)
    }

    fn worker() -> Worker {
        Worker {
            id: "w1".to_string(),
            name: "w1".to_string(),
            hostname: "host".to_string(),
            runtime: WorkerRuntime::Direct,
            cores: 4,
            memory: 0,
            group: String::new(),
            state: WorkerState::Active,
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn concurrent_checkouts_win_exactly_once() {
        let db = Database::open_in_memory().unwrap();
        let (store, _task) = seed(&db).await;

        let w1 = worker();
        let mut w2 = worker();
        w2.id = "w2".to_string();

        let (a, b) = tokio::join!(store.checkout(&w1, 60), store.checkout(&w2, 60));
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(a.is_some() != b.is_some(), "exactly one checkout must win");
        let claimed = a.or(b).unwrap();
        assert_eq!(claimed.state, TaskState::Running);
        assert!(claimed.claimed_by.is_some());
    }

    #[tokio::test]
    async fn stale_worker_completion_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let (store, task) = seed(&db).await;

        let claimed = store.checkout(&worker(), 60).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);

        // another worker steals the task after lease reclaim
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE tasks SET claimed_by = 'w2' WHERE id = ?1",
                    rusqlite::params![task.id],
                )
            })
            .unwrap();

        let accepted = store
            .complete_from_worker(&task.id, "w1", TaskState::Success, None, Some(0), None, None, None)
            .await
            .unwrap();
        assert!(!accepted, "stale lease holder must be rejected");

        let accepted = store
            .complete_from_worker(&task.id, "w2", TaskState::Success, None, Some(0), None, None, None)
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn reclaim_returns_expired_leases_to_queue() {
        let db = Database::open_in_memory().unwrap();
        let (store, task) = seed(&db).await;
        store.checkout(&worker(), -5).await.unwrap().unwrap();

        let reclaimed = store.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed, 1);
        let task = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert!(task.claimed_by.is_none());
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn group_and_runtime_filter_checkout() {
        let db = Database::open_in_memory().unwrap();
        let (store, task) = seed(&db).await;
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE tasks SET worker_group = 'gpu', needs_container = 1 WHERE id = ?1",
                    rusqlite::params![task.id],
                )
            })
            .unwrap();

        // wrong group, no container runtime
        assert!(store.checkout(&worker(), 60).await.unwrap().is_none());

        let mut capable = worker();
        capable.group = "gpu".to_string();
        capable.runtime = WorkerRuntime::Container;
        assert!(store.checkout(&capable, 60).await.unwrap().is_some());
    }
}
