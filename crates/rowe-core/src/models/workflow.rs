//! A registered workflow definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cwl::WorkflowSpec;

/// A registered CWL workflow. Immutable after creation; re-register to
/// version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cwl_version: String,
    /// Verbatim document as submitted, for re-display.
    pub raw_cwl: String,
    /// Normalized form: inline tools, computed depends_on, topological order.
    pub parsed: WorkflowSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: String, description: String, raw_cwl: String, parsed: WorkflowSpec) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            description,
            cwl_version: parsed.cwl_version.clone(),
            raw_cwl,
            parsed,
            created_at: now,
            updated_at: now,
        }
    }
}
