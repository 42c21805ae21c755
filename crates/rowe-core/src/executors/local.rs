//! In-process executor: runs the execution engine on this host, directly or
//! in a container.
//!
//! Each submit spawns one background run, bounded by a semaphore so the
//! server never has more than the configured number of tools in flight.
//! Finished results park in memory until the scheduler polls them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::engine::{RuntimeKind, ToolRunner};
use crate::error::TaskFailure;
use crate::models::{Task, TaskState};

use super::{Executor, PollStatus, Submitted, TaskResult};

pub struct InProcessExecutor {
    runner: Arc<ToolRunner>,
    kind: RuntimeKind,
    slots: Arc<Semaphore>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    finished: Arc<Mutex<HashMap<String, TaskResult>>>,
    /// Base URI outputs stage out to, when configured.
    stage_out_base: Option<String>,
}

impl InProcessExecutor {
    pub fn new(
        runner: Arc<ToolRunner>,
        kind: RuntimeKind,
        slots: usize,
        stage_out_base: Option<String>,
    ) -> Self {
        Self {
            runner,
            kind,
            slots: Arc::new(Semaphore::new(slots.max(1))),
            running: Mutex::new(HashMap::new()),
            finished: Arc::new(Mutex::new(HashMap::new())),
            stage_out_base,
        }
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    async fn submit(&self, task: &Task) -> Result<Submitted, TaskFailure> {
        let runner = self.runner.clone();
        let kind = self.kind;
        let slots = self.slots.clone();
        let finished = self.finished.clone();
        let stage_out = self.stage_out_base.clone();

        let task_id = task.id.clone();
        let tool = task.tool.clone();
        let job = task.job.clone().unwrap_or_default();

        let handle = tokio::spawn({
            let task_id = task_id.clone();
            async move {
                let _permit = match slots.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let result = match runner
                    .run(&tool, &job, &task_id, kind, stage_out.as_deref())
                    .await
                {
                    Ok(outcome) => TaskResult {
                        state: if outcome.failure.is_none() {
                            TaskState::Success
                        } else {
                            TaskState::Failed
                        },
                        outputs: Some(outcome.outputs),
                        exit_code: Some(outcome.exit_code),
                        stdout: Some(outcome.stdout),
                        stderr: Some(outcome.stderr),
                        failure: outcome.failure,
                    },
                    Err(failure) => TaskResult {
                        state: TaskState::Failed,
                        outputs: None,
                        exit_code: None,
                        stdout: None,
                        stderr: None,
                        failure: Some(failure),
                    },
                };
                finished.lock().await.insert(task_id, result);
            }
        });

        self.running.lock().await.insert(task_id, handle);
        Ok(Submitted {
            state: TaskState::Running,
            external_id: None,
        })
    }

    async fn status(&self, task: &Task) -> Result<PollStatus, TaskFailure> {
        if let Some(result) = self.finished.lock().await.remove(&task.id) {
            self.running.lock().await.remove(&task.id);
            return Ok(PollStatus::Terminal(result));
        }
        Ok(PollStatus::Running)
    }

    async fn cancel(&self, task: &Task) -> Result<(), TaskFailure> {
        if let Some(handle) = self.running.lock().await.remove(&task.id) {
            // drop-kills the subprocess via kill_on_drop
            handle.abort();
        }
        self.finished.lock().await.remove(&task.id);
        Ok(())
    }

    async fn logs(&self, task: &Task) -> Result<(String, String), TaskFailure> {
        Ok((
            task.stdout.clone().unwrap_or_default(),
            task.stderr.clone().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cwl::{Process, Tool};
    use crate::engine::RunnerConfig;
    use crate::stager::{SchemeStager, StagingCredentials};

    fn executor(base: &std::path::Path) -> InProcessExecutor {
        let runner = Arc::new(ToolRunner::new(
            Arc::new(SchemeStager::new(StagingCredentials::default(), None)),
            RunnerConfig {
                work_base: base.to_path_buf(),
                ..Default::default()
            },
        ));
        InProcessExecutor::new(runner, RuntimeKind::Local, 2, None)
    }

    fn true_task() -> Task {
        let tool = Process::Tool(Tool {
            id: "t".to_string(),
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
        });
        let mut task = Task::new("s".to_string(), "main".to_string(), tool, Vec::new(), 0);
        task.job = Some(serde_json::Map::new());
        task
    }

    #[tokio::test]
    async fn submit_then_poll_reaches_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let task = true_task();

        let submitted = executor.submit(&task).await.unwrap();
        assert_eq!(submitted.state, TaskState::Running);

        let mut rounds = 0;
        loop {
            match executor.status(&task).await.unwrap() {
                PollStatus::Terminal(result) => {
                    assert_eq!(result.state, TaskState::Success);
                    assert_eq!(result.exit_code, Some(0));
                    break;
                }
                _ => {
                    rounds += 1;
                    assert!(rounds < 100, "run never finished");
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
            }
        }
    }
}
