//! Execution backends.
//!
//! Every backend implements one contract: submit a task, poll its status,
//! cancel it, and fetch its logs. The registry maps `executor_type` to an
//! implementation and is read-only after startup.

pub mod bvbrc;
pub mod local;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskFailure;
use crate::models::{ExecutorType, Task, TaskState};

/// What a dispatch produced: the state the task enters and, for
/// out-of-process backends, the id used for polling.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub state: TaskState,
    pub external_id: Option<String>,
}

/// One attempt's terminal result.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub state: TaskState,
    pub outputs: Option<serde_json::Map<String, Value>>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub failure: Option<TaskFailure>,
}

/// Poll outcome for a dispatched task.
#[derive(Debug, Clone)]
pub enum PollStatus {
    Queued,
    Running,
    Terminal(TaskResult),
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn submit(&self, task: &Task) -> Result<Submitted, TaskFailure>;
    async fn status(&self, task: &Task) -> Result<PollStatus, TaskFailure>;
    async fn cancel(&self, task: &Task) -> Result<(), TaskFailure>;
    async fn logs(&self, task: &Task) -> Result<(String, String), TaskFailure>;
}

/// `executor_type` → implementation. Built once at startup.
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: ExecutorType, executor: Arc<dyn Executor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: ExecutorType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn available(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> =
            self.executors.keys().map(|k| k.as_str()).collect();
        kinds.sort();
        kinds
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
