//! The tick-driven task scheduler.
//!
//! One cooperative loop drives every live submission. Each tick sweeps
//! worker staleness and expired leases, then runs the phases: advance
//! pending tasks (dependency settlement, input resolution, conditionals,
//! scatter), dispatch scheduled tasks to executors, requeue retries, poll
//! out-of-process executors, finalize finished submissions, and mark
//! retryable failures. Every decision reads from the store; in-memory state
//! lives only within the current tick.

pub mod inputs;
pub mod scatter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::RoweConfig;
use crate::cwl::{ScatterMethod, Step, WorkflowSpec};
use crate::error::{ServerError, TaskFailure};
use crate::executors::{ExecutorRegistry, PollStatus};
use crate::expression::{self, ExprContext};
use crate::models::{ExecutorType, Submission, SubmissionState, Task, TaskState, Workflow};
use crate::store::{SubmissionStore, TaskStore, WorkerStore, WorkflowStore};

pub struct Scheduler {
    workflows: WorkflowStore,
    submissions: SubmissionStore,
    tasks: TaskStore,
    workers: WorkerStore,
    registry: Arc<ExecutorRegistry>,
    config: RoweConfig,
}

impl Scheduler {
    pub fn new(
        workflows: WorkflowStore,
        submissions: SubmissionStore,
        tasks: TaskStore,
        workers: WorkerStore,
        registry: Arc<ExecutorRegistry>,
        config: RoweConfig,
    ) -> Self {
        Self {
            workflows,
            submissions,
            tasks,
            workers,
            registry,
            config,
        }
    }

    /// Run ticks forever. Spawned once at server startup.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(50)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!("scheduler tick failed: {}", e);
            }
        }
    }

    /// One full pass over the working set.
    pub async fn tick(&self) -> Result<(), ServerError> {
        let stale = self.workers.mark_stale(self.config.heartbeat_grace_secs).await?;
        if stale > 0 {
            tracing::warn!("{} worker(s) marked stale", stale);
        }
        let reclaimed = self.tasks.reclaim_expired().await?;
        if reclaimed > 0 {
            tracing::warn!("{} expired lease(s) returned to the queue", reclaimed);
        }

        for submission in self.submissions.list_live().await? {
            if submission.state == SubmissionState::Pending {
                self.submissions
                    .transition(&submission.id, SubmissionState::Pending, SubmissionState::Running)
                    .await?;
            }
            let Some(workflow) = self.workflows.get(&submission.workflow_id).await? else {
                tracing::error!(
                    "submission {} references missing workflow {}",
                    submission.id,
                    submission.workflow_id
                );
                continue;
            };
            self.advance_pending(&workflow.parsed, &submission).await?;
            self.dispatch_scheduled(&submission).await?;
            self.requeue_retrying(&submission).await?;
            self.poll_inflight(&submission).await?;
            self.finalize(&workflow.parsed, &submission).await?;
            self.mark_retries(&submission).await?;
        }
        Ok(())
    }

    /// Create one task per step for a fresh submission, in topological
    /// order so every task's `depends_on` can reference upstream task ids.
    pub async fn materialize_submission(
        &self,
        workflow: &Workflow,
        submission: &Submission,
    ) -> Result<(), ServerError> {
        let spec = &workflow.parsed;
        let mut task_ids: HashMap<&str, String> = HashMap::new();
        for step_id in &spec.topo_order {
            let step = spec.step(step_id).ok_or_else(|| {
                ServerError::Internal(format!("topological order names unknown step '{}'", step_id))
            })?;
            let depends_on = step
                .depends_on
                .iter()
                .filter_map(|s| task_ids.get(s.as_str()).cloned())
                .collect();
            let mut task = Task::new(
                submission.id.clone(),
                step.id.clone(),
                step.run.clone(),
                depends_on,
                self.config.default_max_retries,
            );
            task.worker_group = step.hints.worker_group.clone().unwrap_or_default();
            task.needs_container = step.run.requirements().docker.is_some();
            task_ids.insert(step.id.as_str(), task.id.clone());
            self.tasks.save(&task).await?;
        }
        Ok(())
    }

    /// Cancellation: in-flight tasks get their executor's native cancel and
    /// become SKIPPED; never-dispatched tasks become SKIPPED; the submission
    /// terminates CANCELLED. Once terminal, stale completions bounce off the
    /// conditional updates.
    pub async fn cancel_submission(&self, id: &str) -> Result<Submission, ServerError> {
        let submission = self
            .submissions
            .get(id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("submission {} not found", id)))?;
        if submission.state.is_terminal() {
            return Err(ServerError::Conflict(format!(
                "submission {} is already {}",
                id,
                submission.state.as_str()
            )));
        }

        for task in self.tasks.list_by_submission(id).await? {
            if matches!(task.state, TaskState::Queued | TaskState::Running) {
                if let Some(kind) = task.executor_type {
                    if let Some(executor) = self.registry.get(kind) {
                        if let Err(e) = executor.cancel(&task).await {
                            tracing::warn!("cancel of task {} failed: {}", task.id, e);
                        }
                    }
                }
                self.tasks
                    .complete(&task.id, TaskState::Skipped, None, None, None, None, None)
                    .await?;
            }
        }
        self.tasks.skip_undispatched(id).await?;
        self.submissions
            .finalize(id, SubmissionState::Cancelled, None, None)
            .await?;
        self.submissions
            .get(id)
            .await?
            .ok_or_else(|| ServerError::Internal("submission vanished during cancel".to_string()))
    }

    // ─── Phase 1: advance pending ────────────────────────────────────────

    async fn advance_pending(
        &self,
        spec: &WorkflowSpec,
        submission: &Submission,
    ) -> Result<(), ServerError> {
        let tasks = self.tasks.list_by_submission(&submission.id).await?;
        let wf_inputs = apply_input_defaults(spec, &submission.inputs);

        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let step_task: HashMap<&str, &Task> = tasks
            .iter()
            .filter(|t| t.scatter_index.is_none())
            .map(|t| (t.step_id.as_str(), t))
            .collect();
        let mut children: HashMap<&str, Vec<&Task>> = HashMap::new();
        for task in tasks.iter().filter(|t| t.scatter_index.is_some()) {
            children.entry(task.step_id.as_str()).or_default().push(task);
        }
        for kids in children.values_mut() {
            kids.sort_by_key(|t| t.scatter_index);
        }

        let upstream = |step_id: &str, out: &str| -> Option<Value> {
            step_task.get(step_id).and_then(|t| {
                if t.state == TaskState::Success {
                    t.outputs.as_ref().and_then(|o| o.get(out).cloned())
                } else {
                    None
                }
            })
        };

        for task in tasks
            .iter()
            .filter(|t| t.state == TaskState::Pending && t.scatter_index.is_none())
        {
            let Some(step) = spec.step(&task.step_id) else {
                continue;
            };
            let inline_js =
                step.run.requirements().inline_javascript || spec.requirements.inline_javascript;

            // a gather node whose children already exist only waits on them
            if !step.scatter.is_empty() {
                if let Some(kids) = children.get(task.step_id.as_str()) {
                    self.advance_gather(task, step, kids).await?;
                    continue;
                }
            }

            // dependency settlement
            let mut blocked = false;
            let mut failed_dep = false;
            for dep_id in &task.depends_on {
                if let Some(dep) = by_id.get(dep_id.as_str()) {
                    match dep.state {
                        TaskState::Success | TaskState::Skipped => {}
                        TaskState::Failed if !will_retry(dep) => failed_dep = true,
                        _ => blocked = true,
                    }
                }
            }
            if blocked {
                continue;
            }
            if failed_dep {
                self.tasks
                    .complete(&task.id, TaskState::Skipped, None, None, None, None, None)
                    .await?;
                continue;
            }

            // a SKIPPED dependency propagates: its nulls must be compensated
            // by a default on every step input that sources it
            let skipped_steps: std::collections::HashSet<&str> = task
                .depends_on
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .filter(|d| d.state == TaskState::Skipped)
                .map(|d| d.step_id.as_str())
                .collect();
            if !skipped_steps.is_empty() {
                let uncompensated = step.inputs.iter().any(|input| {
                    input.default.is_none()
                        && input.sources.iter().any(|s| {
                            s.split_once('/')
                                .map(|(sid, _)| skipped_steps.contains(sid))
                                .unwrap_or(false)
                        })
                });
                if uncompensated {
                    self.tasks
                        .complete(&task.id, TaskState::Skipped, None, None, None, None, None)
                        .await?;
                    continue;
                }
            }

            let pre = match inputs::resolve_sources(step, &wf_inputs, &upstream) {
                Ok(pre) => pre,
                Err(failure) => {
                    self.fail_task(&task.id, failure).await?;
                    continue;
                }
            };

            // conditional guard
            if let Some(when) = &step.when {
                let ctx = ExprContext::new(Value::Object(pre.clone()), Value::Null, inline_js);
                match expression::evaluate(when, &ctx) {
                    Ok(value) => {
                        if !truthy(&value) {
                            self.tasks
                                .complete(&task.id, TaskState::Skipped, None, None, None, None, None)
                                .await?;
                            continue;
                        }
                    }
                    Err(failure) => {
                        self.fail_task(&task.id, failure).await?;
                        continue;
                    }
                }
            }

            if !step.scatter.is_empty() {
                self.expand_scatter(task, step, &pre, inline_js, submission).await?;
                continue;
            }

            let job = match inputs::apply_value_from(step, &pre, inline_js) {
                Ok(job) => job,
                Err(failure) => {
                    self.fail_task(&task.id, failure).await?;
                    continue;
                }
            };
            if !inputs::missing_required(step, &job).is_empty() {
                // upstream skip/absence left a required input with no value
                self.tasks
                    .complete(&task.id, TaskState::Skipped, None, None, None, None, None)
                    .await?;
                continue;
            }

            let executor = self.select_executor(step);
            self.tasks.schedule(&task.id, &job, executor).await?;
        }
        Ok(())
    }

    /// Settle a scatter gather node against its children: aggregate outputs
    /// in element order once every child succeeded.
    async fn advance_gather(
        &self,
        gather: &Task,
        step: &Step,
        kids: &[&Task],
    ) -> Result<(), ServerError> {
        if let Some(failed) = kids
            .iter()
            .find(|k| k.state == TaskState::Failed && !will_retry(k))
        {
            let failure = failed.failure.clone().unwrap_or(TaskFailure::Exec {
                message: "scatter element failed".to_string(),
                transient: false,
            });
            self.fail_task(&gather.id, failure).await?;
            return Ok(());
        }
        if !kids.iter().all(|k| k.state == TaskState::Success) {
            return Ok(());
        }

        let method = step.scatter_method.unwrap_or(ScatterMethod::Dotproduct);
        let dims: Vec<usize> = step
            .scatter
            .iter()
            .map(|name| {
                gather
                    .job
                    .as_ref()
                    .and_then(|j| j.get(name))
                    .and_then(Value::as_array)
                    .map(|a| a.len())
                    .unwrap_or(0)
            })
            .collect();

        let mut outputs = Map::new();
        for out in &step.outputs {
            let values: Vec<Value> = kids
                .iter()
                .map(|k| {
                    k.outputs
                        .as_ref()
                        .and_then(|o| o.get(out).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect();
            outputs.insert(out.clone(), scatter::gather(method, &dims, values));
        }
        self.tasks
            .complete(&gather.id, TaskState::Success, Some(&outputs), None, None, None, None)
            .await?;
        Ok(())
    }

    /// First expansion of a scatter step: one child task per element.
    async fn expand_scatter(
        &self,
        gather: &Task,
        step: &Step,
        pre: &Map<String, Value>,
        inline_js: bool,
        submission: &Submission,
    ) -> Result<(), ServerError> {
        let mut lists: Vec<(String, Vec<Value>)> = Vec::new();
        for name in &step.scatter {
            match pre.get(name).and_then(Value::as_array) {
                Some(items) => lists.push((name.clone(), items.clone())),
                None => {
                    let failure = TaskFailure::Expression {
                        expr: format!("scatter({})", name),
                        message: "scattered input did not resolve to an array".to_string(),
                    };
                    self.fail_task(&gather.id, failure).await?;
                    return Ok(());
                }
            }
        }

        let method = step.scatter_method.unwrap_or(ScatterMethod::Dotproduct);
        let elements = match scatter::expand(method, &lists) {
            Ok(elements) => elements,
            Err(failure) => {
                self.fail_task(&gather.id, failure).await?;
                return Ok(());
            }
        };

        self.tasks.set_job(&gather.id, pre).await?;

        if elements.is_empty() {
            let outputs: Map<String, Value> = step
                .outputs
                .iter()
                .map(|out| (out.clone(), Value::Array(Vec::new())))
                .collect();
            self.tasks
                .complete(&gather.id, TaskState::Success, Some(&outputs), None, None, None, None)
                .await?;
            return Ok(());
        }

        let executor = self.select_executor(step);
        let mut depends_on = gather.depends_on.clone();
        for (index, overrides) in elements.into_iter().enumerate() {
            let mut merged = pre.clone();
            for (key, value) in overrides {
                merged.insert(key, value);
            }
            let job = match inputs::apply_value_from(step, &merged, inline_js) {
                Ok(job) => job,
                Err(failure) => {
                    self.fail_task(&gather.id, failure).await?;
                    return Ok(());
                }
            };
            let mut child = Task::new(
                submission.id.clone(),
                step.id.clone(),
                step.run.clone(),
                gather.depends_on.clone(),
                gather.max_retries,
            );
            child.scatter_index = Some(index);
            child.worker_group = gather.worker_group.clone();
            child.needs_container = gather.needs_container;
            self.tasks.save(&child).await?;
            self.tasks.schedule(&child.id, &job, executor).await?;
            depends_on.push(child.id);
        }
        self.tasks.update_depends_on(&gather.id, &depends_on).await?;
        Ok(())
    }

    // ─── Phase 2: dispatch ───────────────────────────────────────────────

    async fn dispatch_scheduled(&self, submission: &Submission) -> Result<(), ServerError> {
        for task in self.tasks.list_by_submission(&submission.id).await? {
            if task.state != TaskState::Scheduled {
                continue;
            }
            let Some(kind) = task.executor_type else {
                continue;
            };
            let Some(executor) = self.registry.get(kind) else {
                let failure = TaskFailure::Exec {
                    message: format!("no '{}' executor registered", kind.as_str()),
                    transient: false,
                };
                self.fail_task(&task.id, failure).await?;
                continue;
            };
            match executor.submit(&task).await {
                Ok(submitted) => {
                    self.tasks
                        .dispatch(&task.id, submitted.state, submitted.external_id.as_deref())
                        .await?;
                }
                Err(failure) => {
                    self.fail_task(&task.id, failure).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Phase 2b: requeue retrying ──────────────────────────────────────

    async fn requeue_retrying(&self, submission: &Submission) -> Result<(), ServerError> {
        for task in self.tasks.list_by_submission(&submission.id).await? {
            if task.state == TaskState::Retrying {
                self.tasks.requeue_retrying(&task.id).await?;
            }
        }
        Ok(())
    }

    // ─── Phase 3: poll ───────────────────────────────────────────────────

    async fn poll_inflight(&self, submission: &Submission) -> Result<(), ServerError> {
        for task in self.tasks.list_by_submission(&submission.id).await? {
            if !matches!(task.state, TaskState::Queued | TaskState::Running) {
                continue;
            }
            let Some(kind) = task.executor_type else {
                continue;
            };
            let Some(executor) = self.registry.get(kind) else {
                continue;
            };
            match executor.status(&task).await {
                Ok(PollStatus::Terminal(result)) => {
                    self.tasks
                        .complete(
                            &task.id,
                            result.state,
                            result.outputs.as_ref(),
                            result.exit_code,
                            result.stdout.as_deref(),
                            result.stderr.as_deref(),
                            result.failure.as_ref(),
                        )
                        .await?;
                }
                Ok(PollStatus::Running) => {
                    if task.state == TaskState::Queued {
                        self.tasks
                            .transition(&task.id, TaskState::Queued, TaskState::Running)
                            .await?;
                    }
                }
                Ok(PollStatus::Queued) => {}
                Err(failure) if !failure.retryable() => {
                    self.fail_task(&task.id, failure).await?;
                }
                Err(failure) => {
                    tracing::warn!("poll of task {} failed transiently: {}", task.id, failure);
                }
            }
        }
        Ok(())
    }

    // ─── Phase 4: finalize submissions ───────────────────────────────────

    async fn finalize(
        &self,
        spec: &WorkflowSpec,
        submission: &Submission,
    ) -> Result<(), ServerError> {
        let tasks = self.tasks.list_by_submission(&submission.id).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        let settled = tasks
            .iter()
            .all(|t| t.state.is_terminal() && !will_retry(t));
        if !settled {
            return Ok(());
        }

        if let Some(failed) = tasks.iter().find(|t| t.state == TaskState::Failed) {
            let reason = failed
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "task failed".to_string());
            self.submissions
                .finalize(
                    &submission.id,
                    SubmissionState::Failed,
                    None,
                    Some(format!("step '{}': {}", failed.step_id, reason)),
                )
                .await?;
            return Ok(());
        }

        // every task SUCCESS or SKIPPED: evaluate declared outputSources
        let wf_inputs = apply_input_defaults(spec, &submission.inputs);
        let step_task: HashMap<&str, &Task> = tasks
            .iter()
            .filter(|t| t.scatter_index.is_none())
            .map(|t| (t.step_id.as_str(), t))
            .collect();
        let upstream = |step_id: &str, out: &str| -> Option<Value> {
            step_task.get(step_id).and_then(|t| {
                if t.state == TaskState::Success {
                    t.outputs.as_ref().and_then(|o| o.get(out).cloned())
                } else {
                    None
                }
            })
        };

        let mut outputs = Map::new();
        for out in &spec.outputs {
            let values: Vec<Value> = out
                .output_source
                .iter()
                .map(|s| inputs::resolve_source(s, &wf_inputs, &upstream))
                .collect();
            let mut value = if out.output_source.len() == 1 && out.link_merge.is_none() {
                values.into_iter().next().unwrap_or(Value::Null)
            } else {
                inputs::link_merge(values, out.link_merge)
            };
            if let Some(policy) = out.pick_value {
                value = inputs::pick_value(value, policy, &out.id).unwrap_or(Value::Null);
            }
            outputs.insert(out.id.clone(), value);
        }

        self.submissions
            .finalize(&submission.id, SubmissionState::Completed, Some(outputs), None)
            .await?;
        Ok(())
    }

    // ─── Phase 5: retry marking ──────────────────────────────────────────

    async fn mark_retries(&self, submission: &Submission) -> Result<(), ServerError> {
        for task in self.tasks.list_by_submission(&submission.id).await? {
            if will_retry(&task) {
                tracing::info!(
                    "task {} ({}): attempt {}/{} failed, retrying",
                    task.id,
                    task.step_id,
                    task.retry_count + 1,
                    task.max_retries + 1
                );
                self.tasks.mark_retrying(&task.id).await?;
            }
        }
        Ok(())
    }

    // ─── shared helpers ──────────────────────────────────────────────────

    async fn fail_task(&self, id: &str, failure: TaskFailure) -> Result<(), ServerError> {
        self.tasks
            .complete(id, TaskState::Failed, None, None, None, None, Some(&failure))
            .await?;
        Ok(())
    }

    /// Executor selection: explicit hint wins, then the remote-service app
    /// hint, then DockerRequirement, then the configured default.
    fn select_executor(&self, step: &Step) -> ExecutorType {
        if let Some(name) = &step.hints.executor {
            if let Some(kind) = ExecutorType::from_str(name) {
                return kind;
            }
            tracing::warn!("step {}: unknown executor hint '{}'", step.id, name);
        }
        if step.hints.bvbrc_app_id.is_some() {
            return ExecutorType::RemoteService;
        }
        if step.run.requirements().docker.is_some() {
            return ExecutorType::Container;
        }
        ExecutorType::from_str(&self.config.default_executor).unwrap_or(ExecutorType::Local)
    }
}

/// A FAILED task that still has budget and a retryable failure class.
pub fn will_retry(task: &Task) -> bool {
    task.state == TaskState::Failed
        && task.retry_count < task.max_retries
        && task.failure.as_ref().map(TaskFailure::retryable).unwrap_or(false)
}

/// Submission inputs with workflow-level defaults filled in.
pub fn apply_input_defaults(
    spec: &WorkflowSpec,
    inputs: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = inputs.clone();
    for input in &spec.inputs {
        let present = merged.get(&input.id).map(|v| !v.is_null()).unwrap_or(false);
        if !present {
            if let Some(default) = &input.default {
                merged.insert(input.id.clone(), default.clone());
            }
        }
    }
    merged
}

/// CWL `when` truthiness: null and false are false, everything else true.
fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}
