use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::bvbrc::AppSchema;
use crate::db::Database;
use crate::error::ServerError;

#[derive(Clone)]
pub struct AppSchemaStore {
    db: Database,
}

impl AppSchemaStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, schema: &AppSchema) -> Result<(), ServerError> {
        let app_id = schema.app_id.clone();
        let parameters = serde_json::to_string(&schema.parameters)
            .map_err(|e| ServerError::Internal(format!("serialize app schema: {}", e)))?;
        let fetched_at = schema.fetched_at.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO app_schemas (app_id, parameters_json, fetched_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(app_id) DO UPDATE SET
                       parameters_json = excluded.parameters_json,
                       fetched_at = excluded.fetched_at",
                    rusqlite::params![app_id, parameters, fetched_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, app_id: &str) -> Result<Option<AppSchema>, ServerError> {
        let app_id = app_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT app_id, parameters_json, fetched_at FROM app_schemas WHERE app_id = ?1",
                    rusqlite::params![app_id],
                    |row| {
                        let id: String = row.get(0)?;
                        let parameters_text: String = row.get(1)?;
                        let fetched_ms: i64 = row.get(2)?;
                        Ok(AppSchema {
                            app_id: id,
                            parameters: serde_json::from_str(&parameters_text)
                                .unwrap_or_default(),
                            fetched_at: chrono::DateTime::from_timestamp_millis(fetched_ms)
                                .unwrap_or_else(Utc::now),
                        })
                    },
                )
                .optional()
            })
            .await
    }

    pub async fn delete(&self, app_id: &str) -> Result<(), ServerError> {
        let app_id = app_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM app_schemas WHERE app_id = ?1",
                    rusqlite::params![app_id],
                )?;
                Ok(())
            })
            .await
    }
}
