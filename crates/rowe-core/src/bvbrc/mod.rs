//! JSON-RPC 1.1 client for the remote bioinformatics job service.
//!
//! One endpoint per service; bearer-token auth; per-call deadlines with
//! exponential backoff on transport errors. Auth failures are permanent —
//! retrying a bad token never helps.

pub mod apps;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::TaskFailure;

pub use apps::{AppParameter, AppSchema, AppSchemaCache};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSPORT_RETRIES: u32 = 3;

pub struct BvbrcClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    next_id: AtomicU64,
}

impl BvbrcClient {
    pub fn new(endpoint: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            token,
            next_id: AtomicU64::new(1),
        }
    }

    /// One JSON-RPC 1.1 call. Transport errors back off and retry; HTTP and
    /// RPC-level errors classify into [`TaskFailure::Remote`].
    async fn call(&self, method: &str, params: Value) -> Result<Value, TaskFailure> {
        let body = json!({
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
            "version": "1.1",
        });

        let mut delay = Duration::from_secs(1);
        let mut last_error = String::new();
        for attempt in 0..TRANSPORT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            let response = self
                .http
                .post(&self.endpoint)
                .timeout(CALL_TIMEOUT)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await;
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("{} transport: {}", method, e);
                    tracing::warn!("bvbrc call {} attempt {} failed: {}", method, attempt + 1, e);
                    continue;
                }
            };
            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(TaskFailure::Remote {
                    message: format!("{}: HTTP {} (check the service token)", method, status),
                    transient: false,
                });
            }
            if !status.is_success() {
                last_error = format!("{}: HTTP {}", method, status);
                continue;
            }
            let envelope: Value = response.json().await.map_err(|e| TaskFailure::Remote {
                message: format!("{}: malformed response: {}", method, e),
                transient: false,
            })?;
            if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(TaskFailure::Remote {
                    message: format!("{}: {}", method, message),
                    transient: false,
                });
            }
            return Ok(envelope.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(TaskFailure::Remote {
            message: last_error,
            transient: true,
        })
    }

    /// List the apps the service offers.
    pub async fn enumerate_apps(&self) -> Result<Vec<Value>, TaskFailure> {
        let result = self.call("enumerate_apps", json!([])).await?;
        Ok(unwrap_layers(result))
    }

    /// The typed parameter schema for one app.
    pub async fn query_app_description(&self, app_id: &str) -> Result<Value, TaskFailure> {
        let result = self.call("query_app_description", json!([app_id])).await?;
        let mut items = unwrap_layers(result);
        items.pop().ok_or_else(|| TaskFailure::Remote {
            message: format!("query_app_description: no description for '{}'", app_id),
            transient: false,
        })
    }

    /// Start an app run; returns the service's job id.
    pub async fn start_app(
        &self,
        app_id: &str,
        params: &Value,
        workspace_path: &str,
    ) -> Result<String, TaskFailure> {
        let result = self
            .call("start_app", json!([app_id, params, workspace_path]))
            .await?;
        // the job record may come back bare or wrapped in a list
        let record = match &result {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        record
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| TaskFailure::Remote {
                message: "start_app: response carries no job id".to_string(),
                transient: false,
            })
    }

    /// Poll job states; returns a map from job id to the status record.
    pub async fn query_tasks(&self, ids: &[String]) -> Result<Value, TaskFailure> {
        let result = self.call("query_tasks", json!([ids])).await?;
        match result {
            Value::Array(mut items) if items.len() == 1 => Ok(items.remove(0)),
            other => Ok(other),
        }
    }

    pub async fn kill_task(&self, id: &str) -> Result<(), TaskFailure> {
        self.call("kill_task", json!([id])).await.map(|_| ())
    }

    /// Read one object from the service's workspace. The result row carries
    /// the object metadata and its data as the final element.
    pub async fn workspace_get(&self, path: &str) -> Result<Vec<u8>, TaskFailure> {
        let result = self
            .call("Workspace.get", json!([{ "objects": [path] }]))
            .await?;
        let row = result
            .get(0)
            .and_then(|v| v.get(0))
            .cloned()
            .unwrap_or(result.clone());
        let data = match &row {
            Value::Array(fields) => fields.last().and_then(Value::as_str),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        };
        data.map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| TaskFailure::Remote {
                message: format!("Workspace.get: no data for '{}'", path),
                transient: false,
            })
    }
}

/// Service responses often wrap the payload in one or two list layers.
fn unwrap_layers(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => {
            if items.len() == 1 && items[0].is_array() {
                match items.into_iter().next().unwrap() {
                    Value::Array(inner) => inner,
                    _ => unreachable!(),
                }
            } else {
                items
            }
        }
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_layers_flattens_single_nesting() {
        let nested = json!([[{"id": "a"}, {"id": "b"}]]);
        assert_eq!(unwrap_layers(nested).len(), 2);
        let flat = json!([{"id": "a"}]);
        assert_eq!(unwrap_layers(flat).len(), 1);
        assert_eq!(unwrap_layers(Value::Null).len(), 0);
    }
}
