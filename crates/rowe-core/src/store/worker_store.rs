use chrono::Utc;
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::{Worker, WorkerRuntime, WorkerState};

#[derive(Clone)]
pub struct WorkerStore {
    db: Database,
}

const COLUMNS: &str =
    "id, name, hostname, runtime, cores, memory, group_label, state, last_heartbeat, registered_at";

impl WorkerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, worker: &Worker) -> Result<(), ServerError> {
        let w = worker.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workers (id, name, hostname, runtime, cores, memory, group_label, state, last_heartbeat, registered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        w.id,
                        w.name,
                        w.hostname,
                        w.runtime.as_str(),
                        w.cores,
                        w.memory,
                        w.group,
                        w.state.as_str(),
                        w.last_heartbeat.timestamp_millis(),
                        w.registered_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Worker>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workers WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    row_to_worker,
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Worker>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workers WHERE state != 'DEREGISTERED' ORDER BY registered_at",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_worker)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Heartbeat: refresh the timestamp and revive STALE workers. Returns
    /// false for unknown or deregistered workers.
    pub async fn heartbeat(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workers SET last_heartbeat = ?1, state = 'ACTIVE'
                     WHERE id = ?2 AND state != 'DEREGISTERED'",
                    rusqlite::params![now, id],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Sweep: mark every ACTIVE worker whose heartbeat aged past the grace
    /// window as STALE.
    pub async fn mark_stale(&self, grace_secs: i64) -> Result<usize, ServerError> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(grace_secs)).timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workers SET state = 'STALE'
                     WHERE state = 'ACTIVE' AND last_heartbeat < ?1",
                    rusqlite::params![cutoff],
                )
            })
            .await?;
        Ok(changed)
    }

    pub async fn deregister(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workers SET state = 'DEREGISTERED' WHERE id = ?1",
                    rusqlite::params![id],
                )
            })
            .await?;
        Ok(changed == 1)
    }
}

fn row_to_worker(row: &Row<'_>) -> Result<Worker, rusqlite::Error> {
    let runtime_text: String = row.get(3)?;
    let state_text: String = row.get(7)?;
    let heartbeat_ms: i64 = row.get(8)?;
    let registered_ms: i64 = row.get(9)?;
    Ok(Worker {
        id: row.get(0)?,
        name: row.get(1)?,
        hostname: row.get(2)?,
        runtime: WorkerRuntime::from_str(&runtime_text).unwrap_or(WorkerRuntime::Direct),
        cores: row.get(4)?,
        memory: row.get(5)?,
        group: row.get(6)?,
        state: WorkerState::from_str(&state_text).unwrap_or(WorkerState::Active),
        last_heartbeat: chrono::DateTime::from_timestamp_millis(heartbeat_ms)
            .unwrap_or_else(Utc::now),
        registered_at: chrono::DateTime::from_timestamp_millis(registered_ms)
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_revives_stale_workers() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkerStore::new(db);
        let worker = Worker::new(
            "w".to_string(),
            "host".to_string(),
            WorkerRuntime::Direct,
            2,
            0,
            String::new(),
        );
        store.save(&worker).await.unwrap();

        // nothing is stale yet
        assert_eq!(store.mark_stale(60).await.unwrap(), 0);
        // everything is stale with a zero grace window
        assert_eq!(store.mark_stale(-1).await.unwrap(), 1);
        assert_eq!(
            store.get(&worker.id).await.unwrap().unwrap().state,
            WorkerState::Stale
        );

        assert!(store.heartbeat(&worker.id).await.unwrap());
        assert_eq!(
            store.get(&worker.id).await.unwrap().unwrap().state,
            WorkerState::Active
        );

        assert!(store.deregister(&worker.id).await.unwrap());
        assert!(!store.heartbeat(&worker.id).await.unwrap());
    }
}
