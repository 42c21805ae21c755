use chrono::Utc;
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::Workflow;

#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, workflow: &Workflow) -> Result<(), ServerError> {
        let w = workflow.clone();
        let parsed = serde_json::to_string(&w.parsed)
            .map_err(|e| ServerError::Internal(format!("serialize workflow: {}", e)))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, description, raw_cwl, parsed_json, cwl_version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       description = excluded.description,
                       raw_cwl = excluded.raw_cwl,
                       parsed_json = excluded.parsed_json,
                       cwl_version = excluded.cwl_version,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        w.id,
                        w.name,
                        w.description,
                        w.raw_cwl,
                        parsed,
                        w.cwl_version,
                        w.created_at.timestamp_millis(),
                        w.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, name, description, raw_cwl, parsed_json, cwl_version, created_at, updated_at
                     FROM workflows WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_workflow,
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Workflow>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, raw_cwl, parsed_json, cwl_version, created_at, updated_at
                     FROM workflows ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![limit, offset], row_to_workflow)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count(&self) -> Result<i64, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                conn.query_row("SELECT count(*) FROM workflows", [], |row| row.get(0))
            })
            .await
    }

    /// Delete one workflow. Refused while live submissions reference it.
    pub async fn delete(&self, id: &str) -> Result<(), ServerError> {
        let id = id.to_string();
        let live: i64 = {
            let id = id.clone();
            self.db
                .with_conn_async(move |conn| {
                    conn.query_row(
                        "SELECT count(*) FROM submissions
                         WHERE workflow_id = ?1 AND state IN ('PENDING', 'RUNNING')",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                })
                .await?
        };
        if live > 0 {
            return Err(ServerError::Conflict(format!(
                "workflow {} has {} live submission(s)",
                id, live
            )));
        }
        let deleted = self
            .db
            .with_conn_async(move |conn| {
                conn.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])
            })
            .await?;
        if deleted == 0 {
            return Err(ServerError::NotFound("workflow not found".to_string()));
        }
        Ok(())
    }
}

fn row_to_workflow(row: &Row<'_>) -> Result<Workflow, rusqlite::Error> {
    let parsed_text: String = row.get(4)?;
    let parsed = serde_json::from_str(&parsed_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_ms: i64 = row.get(6)?;
    let updated_ms: i64 = row.get(7)?;
    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        raw_cwl: row.get(3)?,
        parsed,
        cwl_version: row.get(5)?,
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    })
}
