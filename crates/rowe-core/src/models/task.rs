//! One schedulable unit: one step × one scatter index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cwl::Process;
use crate::error::TaskFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Scheduled,
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    Retrying,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
            TaskState::Retrying => "RETRYING",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskState::Pending),
            "SCHEDULED" => Some(TaskState::Scheduled),
            "QUEUED" => Some(TaskState::Queued),
            "RUNNING" => Some(TaskState::Running),
            "SUCCESS" => Some(TaskState::Success),
            "FAILED" => Some(TaskState::Failed),
            "SKIPPED" => Some(TaskState::Skipped),
            "RETRYING" => Some(TaskState::Retrying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorType {
    Local,
    Container,
    Worker,
    RemoteService,
}

impl ExecutorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorType::Local => "local",
            ExecutorType::Container => "container",
            ExecutorType::Worker => "worker",
            ExecutorType::RemoteService => "remote-service",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ExecutorType::Local),
            "container" => Some(ExecutorType::Container),
            "worker" => Some(ExecutorType::Worker),
            "remote-service" => Some(ExecutorType::RemoteService),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub submission_id: String,
    pub step_id: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_type: Option<ExecutorType>,
    /// Assigned by the executor; used for polling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Inline resolved process definition — the execution recipe.
    pub tool: Process,
    /// Resolved inputs. Written once, at dispatch resolution; never mutated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<serde_json::Map<String, serde_json::Value>>,
    /// Upstream task ids that must reach SUCCESS first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Index within a scatter expansion, when this task is a scatter child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scatter_index: Option<usize>,
    /// Worker steering label; checkout only hands the task to matching
    /// workers.
    #[serde(default)]
    pub worker_group: String,
    /// Whether the task needs a container-capable runtime.
    #[serde(default)]
    pub needs_container: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Failure classification for the most recent attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    pub retry_count: i64,
    pub max_retries: i64,
    /// Worker id while held; cleared on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        submission_id: String,
        step_id: String,
        tool: Process,
        depends_on: Vec<String>,
        max_retries: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            submission_id,
            step_id,
            state: TaskState::Pending,
            executor_type: None,
            external_id: None,
            tool,
            job: None,
            depends_on,
            scatter_index: None,
            worker_group: String::new(),
            needs_container: false,
            outputs: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            failure: None,
            retry_count: 0,
            max_retries,
            claimed_by: None,
            lease_expires_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
