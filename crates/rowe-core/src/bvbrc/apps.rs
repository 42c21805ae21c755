//! App schema cache for the remote-service executor.
//!
//! Schemas are fetched once, persisted with a TTL, and refreshed on expiry.
//! Concurrent fetches of the same uncached app coalesce behind a per-app
//! lock: one request goes out, the rest wait for the stored result.
//! Validation failures invalidate the cached entry so a stale schema cannot
//! keep rejecting good parameters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::TaskFailure;
use crate::store::AppSchemaStore;

use super::BvbrcClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppParameter {
    pub id: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub enum_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSchema {
    pub app_id: String,
    pub parameters: Vec<AppParameter>,
    pub fetched_at: DateTime<Utc>,
}

impl AppSchema {
    /// Parse the service's app description record.
    pub fn from_description(app_id: &str, description: &Value) -> Self {
        let parameters = description
            .get("parameters")
            .and_then(Value::as_array)
            .map(|params| {
                params
                    .iter()
                    .filter_map(|p| {
                        let id = p.get("id").and_then(Value::as_str)?.to_string();
                        Some(AppParameter {
                            id,
                            required: match p.get("required") {
                                Some(Value::Bool(b)) => *b,
                                Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
                                _ => false,
                            },
                            default: p.get("default").filter(|d| !d.is_null()).cloned(),
                            r#type: p
                                .get("type")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            enum_values: p
                                .get("enum")
                                .and_then(Value::as_array)
                                .map(|e| {
                                    e.iter()
                                        .filter_map(Value::as_str)
                                        .map(str::to_string)
                                        .collect()
                                })
                                .unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            app_id: app_id.to_string(),
            parameters,
            fetched_at: Utc::now(),
        }
    }

    /// Check concrete parameters against the schema. Returns every problem.
    pub fn validate(&self, params: &serde_json::Map<String, Value>) -> Vec<String> {
        let mut errors = Vec::new();
        for parameter in &self.parameters {
            let value = params.get(&parameter.id);
            let missing = value.map(Value::is_null).unwrap_or(true);
            if missing && parameter.required && parameter.default.is_none() {
                errors.push(format!("parameter '{}' is required", parameter.id));
                continue;
            }
            if let Some(value) = value {
                if !parameter.enum_values.is_empty() {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    if !parameter.enum_values.contains(&text) {
                        errors.push(format!(
                            "parameter '{}': '{}' is not one of {:?}",
                            parameter.id, text, parameter.enum_values
                        ));
                    }
                }
            }
        }
        errors
    }
}

pub struct AppSchemaCache {
    client: Arc<BvbrcClient>,
    store: AppSchemaStore,
    ttl: Duration,
    /// Per-app fetch locks; holders of the same app's lock coalesce.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppSchemaCache {
    pub fn new(client: Arc<BvbrcClient>, store: AppSchemaStore, ttl_secs: i64) -> Self {
        Self {
            client,
            store,
            ttl: Duration::seconds(ttl_secs.max(1)),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch-or-reuse the schema for one app.
    pub async fn get(&self, app_id: &str) -> Result<AppSchema, TaskFailure> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(app_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Ok(Some(cached)) = self.store.get(app_id).await {
            if Utc::now() - cached.fetched_at < self.ttl {
                return Ok(cached);
            }
        }

        let description = self.client.query_app_description(app_id).await?;
        let schema = AppSchema::from_description(app_id, &description);
        if let Err(e) = self.store.save(&schema).await {
            tracing::warn!("failed to persist app schema for {}: {}", app_id, e);
        }
        Ok(schema)
    }

    /// Drop a cached entry (used when validation against it fails).
    pub async fn invalidate(&self, app_id: &str) {
        if let Err(e) = self.store.delete(app_id).await {
            tracing::warn!("failed to invalidate app schema for {}: {}", app_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> AppSchema {
        AppSchema::from_description(
            "GenomeAssembly",
            &serde_json::json!({
                "id": "GenomeAssembly",
                "parameters": [
                    {"id": "reads", "required": 1, "type": "wsid"},
                    {"id": "recipe", "required": 0, "default": "auto",
                     "enum": ["auto", "unicycler", "spades"]},
                ],
            }),
        )
    }

    #[test]
    fn description_parses_required_and_enum() {
        let schema = schema();
        assert_eq!(schema.parameters.len(), 2);
        assert!(schema.parameters[0].required);
        assert!(!schema.parameters[1].required);
        assert_eq!(schema.parameters[1].enum_values.len(), 3);
    }

    #[test]
    fn validate_reports_missing_required_and_bad_enum() {
        let schema = schema();
        let mut params = serde_json::Map::new();
        params.insert("recipe".to_string(), Value::String("bogus".to_string()));
        let errors = schema.validate(&params);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("reads"));
        assert!(errors[1].contains("bogus"));
    }

    #[test]
    fn valid_params_pass() {
        let schema = schema();
        let mut params = serde_json::Map::new();
        params.insert("reads".to_string(), Value::String("/ws/reads.fq".to_string()));
        params.insert("recipe".to_string(), Value::String("spades".to_string()));
        assert!(schema.validate(&params).is_empty());
    }
}
