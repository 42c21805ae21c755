//! Remote-service executor: maps tasks onto the bioinformatics job service.
//!
//! Submit validates the job against the (cached) app parameter schema, then
//! `start_app` returns the job id used for polling. Output collection reads
//! the service's result-manifest convention: a metadata object at
//! `{output_path}/{output_file}` with the actual files in the hidden sibling
//! folder `{output_path}/.{output_file}/`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::bvbrc::{AppSchemaCache, BvbrcClient};
use crate::cwl::{CwlType, Process};
use crate::error::TaskFailure;
use crate::models::{Task, TaskState};

use super::{Executor, PollStatus, Submitted, TaskResult};

pub struct RemoteServiceExecutor {
    client: Arc<BvbrcClient>,
    schemas: Arc<AppSchemaCache>,
    workspace_path: String,
}

impl RemoteServiceExecutor {
    pub fn new(client: Arc<BvbrcClient>, schemas: Arc<AppSchemaCache>, workspace_path: String) -> Self {
        Self {
            client,
            schemas,
            workspace_path,
        }
    }

    fn app_id(task: &Task) -> Result<String, TaskFailure> {
        task.tool
            .hints()
            .bvbrc_app_id
            .clone()
            .ok_or_else(|| TaskFailure::Remote {
                message: "task routed to the remote service without an app id hint".to_string(),
                transient: false,
            })
    }

    /// CWL job values flatten into app parameters: Files pass their
    /// workspace location, scalars pass through.
    fn build_params(task: &Task) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(job) = &task.job {
            for (key, value) in job {
                params.insert(key.clone(), flatten_value(value));
            }
        }
        params
    }

    async fn collect_outputs(&self, task: &Task) -> Result<Map<String, Value>, TaskFailure> {
        let manifest_path = format!("{}/{}", self.workspace_path, task.id);
        let bytes = self.client.workspace_get(&manifest_path).await?;
        let manifest: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        let names: Vec<String> = match &manifest {
            Value::Array(rows) => rows
                .iter()
                .filter_map(|row| match row {
                    Value::Array(fields) => fields.first().and_then(Value::as_str),
                    Value::Object(m) => m.get("name").and_then(Value::as_str),
                    Value::String(s) => Some(s.as_str()),
                    _ => None,
                })
                .map(str::to_string)
                .collect(),
            Value::Object(m) => m
                .get("files")
                .and_then(Value::as_array)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|f| match f {
                            Value::String(s) => Some(s.clone()),
                            Value::Object(m) => {
                                m.get("name").and_then(Value::as_str).map(str::to_string)
                            }
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let hidden = format!("{}/.{}", self.workspace_path, task.id);
        let files: Vec<Value> = names
            .iter()
            .map(|name| {
                serde_json::json!({
                    "class": "File",
                    "location": format!("ws:{}/{}", hidden, name),
                    "basename": name,
                })
            })
            .collect();

        // One declared File-shaped output takes the list; otherwise the
        // files land under a single well-known key.
        let mut outputs = Map::new();
        let declared = match &task.tool {
            Process::Tool(tool) => tool
                .outputs
                .iter()
                .filter(|o| {
                    matches!(
                        o.r#type.unwrap_optional(),
                        CwlType::File | CwlType::Array(_)
                    )
                })
                .map(|o| (o.id.clone(), o.r#type.clone()))
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        match declared.as_slice() {
            [(id, ty)] => {
                let value = match ty.unwrap_optional() {
                    CwlType::Array(_) => Value::Array(files),
                    _ => files.into_iter().next().unwrap_or(Value::Null),
                };
                outputs.insert(id.clone(), value);
            }
            _ => {
                outputs.insert("files".to_string(), Value::Array(files));
            }
        }
        Ok(outputs)
    }
}

fn flatten_value(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.get("class").and_then(Value::as_str) == Some("File") => map
            .get("location")
            .or_else(|| map.get("path"))
            .cloned()
            .unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(flatten_value).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl Executor for RemoteServiceExecutor {
    async fn submit(&self, task: &Task) -> Result<Submitted, TaskFailure> {
        let app_id = Self::app_id(task)?;
        let mut params = Self::build_params(task);
        params.insert(
            "output_path".to_string(),
            Value::String(self.workspace_path.clone()),
        );
        params.insert("output_file".to_string(), Value::String(task.id.clone()));

        let schema = self.schemas.get(&app_id).await?;
        let errors = schema.validate(&params);
        if !errors.is_empty() {
            // the cached schema may be stale; refetch once before giving up
            self.schemas.invalidate(&app_id).await;
            let fresh = self.schemas.get(&app_id).await?;
            let errors = fresh.validate(&params);
            if !errors.is_empty() {
                return Err(TaskFailure::Remote {
                    message: format!("app '{}' rejected parameters: {}", app_id, errors.join("; ")),
                    transient: false,
                });
            }
        }

        let job_id = self
            .client
            .start_app(&app_id, &Value::Object(params), &self.workspace_path)
            .await?;
        tracing::info!("started remote app {} as job {}", app_id, job_id);
        Ok(Submitted {
            state: TaskState::Queued,
            external_id: Some(job_id),
        })
    }

    async fn status(&self, task: &Task) -> Result<PollStatus, TaskFailure> {
        let Some(job_id) = &task.external_id else {
            return Ok(PollStatus::Queued);
        };
        let statuses = self.client.query_tasks(&[job_id.clone()]).await?;
        let record = statuses.get(job_id).cloned().unwrap_or(Value::Null);
        let status = record
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        match status {
            "queued" | "pending" | "init" => Ok(PollStatus::Queued),
            "in-progress" | "running" => Ok(PollStatus::Running),
            "completed" => {
                let outputs = self.collect_outputs(task).await?;
                Ok(PollStatus::Terminal(TaskResult {
                    state: TaskState::Success,
                    outputs: Some(outputs),
                    exit_code: Some(0),
                    stdout: None,
                    stderr: None,
                    failure: None,
                }))
            }
            "failed" | "deleted" => Ok(PollStatus::Terminal(TaskResult {
                state: TaskState::Failed,
                outputs: None,
                exit_code: None,
                stdout: None,
                stderr: None,
                failure: Some(TaskFailure::Remote {
                    message: format!("remote job {} reported '{}'", job_id, status),
                    transient: false,
                }),
            })),
            other => {
                tracing::debug!("remote job {} in unrecognized state '{}'", job_id, other);
                Ok(PollStatus::Running)
            }
        }
    }

    async fn cancel(&self, task: &Task) -> Result<(), TaskFailure> {
        if let Some(job_id) = &task.external_id {
            self.client.kill_task(job_id).await?;
        }
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

    #[test]
    fn file_values_flatten_to_locations() {
        let file = serde_json::json!({
            "class": "File",
            "location": "ws:/user/home/reads.fq",
            "basename": "reads.fq",
        });
        assert_eq!(flatten_value(&file), serde_json::json!("ws:/user/home/reads.fq"));
        assert_eq!(flatten_value(&serde_json::json!(42)), serde_json::json!(42));
        assert_eq!(
            flatten_value(&serde_json::json!([file, 1])),
            serde_json::json!(["ws:/user/home/reads.fq", 1])
        );
    }
}
