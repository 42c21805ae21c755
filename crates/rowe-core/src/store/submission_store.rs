use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{OptionalExtension, Row};
use serde_json::Value;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::{Submission, SubmissionState};

#[derive(Clone)]
pub struct SubmissionStore {
    db: Database,
}

impl SubmissionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, submission: &Submission) -> Result<(), ServerError> {
        let s = submission.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO submissions (id, workflow_id, state, inputs_json, outputs_json, labels_json, error, created_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        s.id,
                        s.workflow_id,
                        s.state.as_str(),
                        Value::Object(s.inputs.clone()).to_string(),
                        s.outputs.as_ref().map(|o| Value::Object(o.clone()).to_string()),
                        serde_json::to_string(&s.labels).unwrap_or_default(),
                        s.error,
                        s.created_at.timestamp_millis(),
                        s.completed_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Submission>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT),
                    rusqlite::params![id],
                    row_to_submission,
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Submission>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    SELECT
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit, offset], row_to_submission)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count(&self) -> Result<i64, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                conn.query_row("SELECT count(*) FROM submissions", [], |row| row.get(0))
            })
            .await
    }

    /// All submissions the scheduler still drives.
    pub async fn list_live(&self) -> Result<Vec<Submission>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE state IN ('PENDING', 'RUNNING') ORDER BY created_at",
                    SELECT
                ))?;
                let rows = stmt
                    .query_map([], row_to_submission)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Conditional state transition; false when the expected state no
    /// longer holds.
    pub async fn transition(
        &self,
        id: &str,
        from: SubmissionState,
        to: SubmissionState,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE submissions SET state = ?1 WHERE id = ?2 AND state = ?3",
                    rusqlite::params![to.as_str(), id, from.as_str()],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Terminal write: outputs, error summary, and completion time in one
    /// update, guarded on the submission still running.
    pub async fn finalize(
        &self,
        id: &str,
        state: SubmissionState,
        outputs: Option<serde_json::Map<String, Value>>,
        error: Option<String>,
    ) -> Result<bool, ServerError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE submissions
                     SET state = ?1, outputs_json = ?2, error = ?3, completed_at = ?4
                     WHERE id = ?5 AND state IN ('PENDING', 'RUNNING')",
                    rusqlite::params![
                        state.as_str(),
                        outputs.map(|o| Value::Object(o).to_string()),
                        error,
                        now,
                        id
                    ],
                )
            })
            .await?;
        Ok(changed == 1)
    }
}

const SELECT: &str = "SELECT id, workflow_id, state, inputs_json, outputs_json, labels_json, error, created_at, completed_at FROM submissions";

fn row_to_submission(row: &Row<'_>) -> Result<Submission, rusqlite::Error> {
    let state_text: String = row.get(2)?;
    let inputs_text: String = row.get(3)?;
    let outputs_text: Option<String> = row.get(4)?;
    let labels_text: String = row.get(5)?;
    let created_ms: i64 = row.get(7)?;
    let completed_ms: Option<i64> = row.get(8)?;

    let inputs = serde_json::from_str(&inputs_text).unwrap_or_default();
    let outputs = outputs_text.and_then(|t| serde_json::from_str(&t).ok());
    let labels: HashMap<String, String> = serde_json::from_str(&labels_text).unwrap_or_default();

    Ok(Submission {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        state: SubmissionState::from_str(&state_text).unwrap_or(SubmissionState::Pending),
        inputs,
        outputs,
        labels,
        error: row.get(6)?,
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        completed_at: completed_ms.and_then(chrono::DateTime::from_timestamp_millis),
    })
}
