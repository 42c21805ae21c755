//! Durable state lives in one SQLite file.
//!
//! The engine is single-writer by design: one connection behind a mutex, so
//! state transitions never contend on SQLite locks, and WAL keeps reads
//! cheap alongside it. Store code hands closures to [`Database::with_conn_async`],
//! which hops onto the blocking pool before touching the connection, so the
//! async runtime never stalls on SQLite I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::ServerError;

impl From<rusqlite::Error> for ServerError {
    fn from(e: rusqlite::Error) -> Self {
        ServerError::Database(e.to_string())
    }
}

/// Handle to the single writer connection. Cheap to clone; all clones share
/// the connection.
#[derive(Clone)]
pub struct Database {
    writer: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database file, creating it (and its parent directory) on
    /// first use.
    pub fn open(db_path: &str) -> Result<Self, ServerError> {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ServerError::Database(format!("open {}: {}", db_path, e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self::wrap(conn)?;
        tracing::info!("state store ready at {}", db_path);
        Ok(db)
    }

    /// In-memory database for tests. WAL is meaningless without a file, so
    /// only foreign keys are switched on.
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Database(format!("open :memory:: {}", e)))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::wrap(conn)
    }

    fn wrap(conn: Connection) -> Result<Self, ServerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the writer connection. SQLite errors map into the
    /// store error plane; a poisoned mutex is recovered rather than
    /// propagated, since the connection itself is still sound.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&conn)?)
    }

    /// Like [`Self::with_conn`], but from async code: the closure runs on
    /// the blocking pool.
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ServerError::Internal(format!("blocking task died: {}", e)))?
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id              TEXT PRIMARY KEY,
        name            TEXT NOT NULL,
        description     TEXT NOT NULL DEFAULT '',
        raw_cwl         TEXT NOT NULL,
        parsed_json     TEXT NOT NULL,
        cwl_version     TEXT NOT NULL,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS submissions (
        id              TEXT PRIMARY KEY,
        workflow_id     TEXT NOT NULL REFERENCES workflows(id),
        state           TEXT NOT NULL DEFAULT 'PENDING',
        inputs_json     TEXT NOT NULL DEFAULT '{}',
        outputs_json    TEXT,
        labels_json     TEXT NOT NULL DEFAULT '{}',
        error           TEXT,
        created_at      INTEGER NOT NULL,
        completed_at    INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_submissions_workflow ON submissions(workflow_id);
    CREATE INDEX IF NOT EXISTS idx_submissions_state ON submissions(state);

    CREATE TABLE IF NOT EXISTS tasks (
        id                  TEXT PRIMARY KEY,
        submission_id       TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
        step_id             TEXT NOT NULL,
        state               TEXT NOT NULL DEFAULT 'PENDING',
        executor_type       TEXT,
        external_id         TEXT,
        tool_json           TEXT NOT NULL,
        job_json            TEXT,
        depends_on_json     TEXT NOT NULL DEFAULT '[]',
        scatter_index       INTEGER,
        worker_group        TEXT NOT NULL DEFAULT '',
        needs_container     INTEGER NOT NULL DEFAULT 0,
        outputs_json        TEXT,
        exit_code           INTEGER,
        stdout              TEXT,
        stderr              TEXT,
        failure_json        TEXT,
        retry_count         INTEGER NOT NULL DEFAULT 0,
        max_retries         INTEGER NOT NULL DEFAULT 0,
        claimed_by          TEXT,
        lease_expires_at    INTEGER,
        created_at          INTEGER NOT NULL,
        started_at          INTEGER,
        completed_at        INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_submission ON tasks(submission_id);
    CREATE INDEX IF NOT EXISTS idx_tasks_state_executor ON tasks(state, executor_type);

    CREATE TABLE IF NOT EXISTS workers (
        id              TEXT PRIMARY KEY,
        name            TEXT NOT NULL,
        hostname        TEXT NOT NULL DEFAULT '',
        runtime         TEXT NOT NULL DEFAULT 'direct',
        cores           INTEGER NOT NULL DEFAULT 1,
        memory          INTEGER NOT NULL DEFAULT 0,
        group_label     TEXT NOT NULL DEFAULT '',
        state           TEXT NOT NULL DEFAULT 'ACTIVE',
        last_heartbeat  INTEGER NOT NULL,
        registered_at   INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_workers_heartbeat ON workers(last_heartbeat);

    CREATE TABLE IF NOT EXISTS app_schemas (
        app_id          TEXT PRIMARY KEY,
        parameters_json TEXT NOT NULL,
        fetched_at      INTEGER NOT NULL
    );
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_schema_initializes() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!(count >= 5);
    }

    #[test]
    fn errors_carry_the_sqlite_message() {
        let db = Database::open_in_memory().unwrap();
        let result = db.with_conn(|conn| conn.execute("SELECT * FROM no_such_table", []));
        match result {
            Err(ServerError::Database(message)) => assert!(message.contains("no_such_table")),
            other => panic!("expected a database error, got {:?}", other.map(|_| ())),
        }
    }
}
