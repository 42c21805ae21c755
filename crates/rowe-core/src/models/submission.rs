//! One execution of a workflow with concrete inputs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Pending => "PENDING",
            SubmissionState::Running => "RUNNING",
            SubmissionState::Completed => "COMPLETED",
            SubmissionState::Failed => "FAILED",
            SubmissionState::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SubmissionState::Pending),
            "RUNNING" => Some(SubmissionState::Running),
            "COMPLETED" => Some(SubmissionState::Completed),
            "FAILED" => Some(SubmissionState::Failed),
            "CANCELLED" => Some(SubmissionState::Cancelled),
            _ => None,
        }
    }

    /// Once terminal, no task in the submission may transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Completed | SubmissionState::Failed | SubmissionState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub workflow_id: String,
    pub state: SubmissionState,
    /// Declared input name → resolved value (scalar, File, Directory, array).
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Populated at terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Summary of the first non-retriable failure, when FAILED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(
        workflow_id: String,
        inputs: serde_json::Map<String, serde_json::Value>,
        labels: HashMap<String, String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id,
            state: SubmissionState::Pending,
            inputs,
            outputs: None,
            labels,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
