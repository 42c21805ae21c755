//! Worker-proxy executor.
//!
//! The server side of the pull-based protocol: submit parks the task in
//! QUEUED and remote workers claim it through the checkout endpoint. Status
//! reads whatever state the store holds — workers write completions straight
//! through `/tasks/{id}/complete`.

use async_trait::async_trait;

use crate::error::TaskFailure;
use crate::models::{Task, TaskState};
use crate::store::TaskStore;

use super::{Executor, PollStatus, Submitted, TaskResult};

pub struct WorkerExecutor {
    tasks: TaskStore,
}

impl WorkerExecutor {
    pub fn new(tasks: TaskStore) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Executor for WorkerExecutor {
    async fn submit(&self, _task: &Task) -> Result<Submitted, TaskFailure> {
        Ok(Submitted {
            state: TaskState::Queued,
            external_id: None,
        })
    }

    async fn status(&self, task: &Task) -> Result<PollStatus, TaskFailure> {
        let current = self
            .tasks
            .get(&task.id)
            .await
            .map_err(|e| TaskFailure::Exec {
                message: format!("status read: {}", e),
                transient: true,
            })?
            .ok_or_else(|| TaskFailure::Exec {
                message: "task vanished from the store".to_string(),
                transient: false,
            })?;

        Ok(match current.state {
            TaskState::Queued => PollStatus::Queued,
            TaskState::Running => PollStatus::Running,
            state if state.is_terminal() => PollStatus::Terminal(TaskResult {
                state,
                outputs: current.outputs,
                exit_code: current.exit_code,
                stdout: current.stdout,
                stderr: current.stderr,
                failure: current.failure,
            }),
            _ => PollStatus::Queued,
        })
    }

    async fn cancel(&self, _task: &Task) -> Result<(), TaskFailure> {
        // The claiming worker learns about cancellation from its next
        // heartbeat; the conditional completion update rejects any late
        // result it still reports.
        Ok(())
    }

    async fn logs(&self, task: &Task) -> Result<(String, String), TaskFailure> {
        Ok((
            task.stdout.clone().unwrap_or_default(),
            task.stderr.clone().unwrap_or_default(),
        ))
    }
}
