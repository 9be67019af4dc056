//! SQLite execution store
//!
//! Durable backend. Run records and history batches are stored as bincode
//! blobs; each trait operation runs in a single transaction.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{
    batches_to_append, slice_batches, ExecutionRecord, ExecutionStore, ExecutionWrite,
    UpdateExecution,
};
use crate::error::{Error, Result};
use crate::history::{EventBatch, EventId};
use crate::id::{new_branch_token, RunKey};
use crate::state::MutableState;

/// Execution store backed by SQLite
pub struct SqliteStore {
    /// Database connection
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the store database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Store that lives only as long as the process
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                namespace_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                db_version INTEGER NOT NULL,
                rebuild_count INTEGER NOT NULL DEFAULT 0,
                state BLOB NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace_id, workflow_id, run_id)
            );

            CREATE TABLE IF NOT EXISTS current_runs (
                namespace_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                start_time INTEGER,
                PRIMARY KEY (namespace_id, workflow_id)
            );

            CREATE TABLE IF NOT EXISTS history_batches (
                namespace_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                branch_token BLOB NOT NULL,
                first_event_id INTEGER NOT NULL,
                last_event_id INTEGER NOT NULL,
                batch BLOB NOT NULL,
                PRIMARY KEY (namespace_id, workflow_id, run_id, branch_token, first_event_id)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn read_record(conn: &Connection, key: &RunKey) -> Result<Option<ExecutionRecord>> {
    let row: Option<(i64, i64, Vec<u8>)> = conn
        .query_row(
            r#"
            SELECT db_version, rebuild_count, state FROM executions
            WHERE namespace_id = ?1 AND workflow_id = ?2 AND run_id = ?3
            "#,
            params![key.namespace_id, key.workflow_id, key.run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match row {
        Some((db_version, rebuild_count, blob)) => {
            let state: MutableState = bincode::deserialize(&blob)?;
            Ok(Some(ExecutionRecord {
                state,
                db_version,
                rebuild_count: rebuild_count as u64,
            }))
        }
        None => Ok(None),
    }
}

fn branch_tail(conn: &Connection, key: &RunKey, token: &[u8]) -> Result<EventId> {
    let tail: Option<i64> = conn.query_row(
        r#"
        SELECT MAX(last_event_id) FROM history_batches
        WHERE namespace_id = ?1 AND workflow_id = ?2 AND run_id = ?3 AND branch_token = ?4
        "#,
        params![key.namespace_id, key.workflow_id, key.run_id, token],
        |row| row.get(0),
    )?;
    Ok(tail.unwrap_or(0))
}

fn read_batch(
    conn: &Connection,
    key: &RunKey,
    token: &[u8],
    first_event_id: EventId,
) -> Result<Option<EventBatch>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            r#"
            SELECT batch FROM history_batches
            WHERE namespace_id = ?1 AND workflow_id = ?2 AND run_id = ?3
              AND branch_token = ?4 AND first_event_id = ?5
            "#,
            params![key.namespace_id, key.workflow_id, key.run_id, token, first_event_id],
            |row| row.get(0),
        )
        .optional()?;
    match blob {
        Some(blob) => Ok(Some(bincode::deserialize(&blob)?)),
        None => Ok(None),
    }
}

fn read_branch(conn: &Connection, key: &RunKey, token: &[u8]) -> Result<Vec<EventBatch>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT batch FROM history_batches
        WHERE namespace_id = ?1 AND workflow_id = ?2 AND run_id = ?3 AND branch_token = ?4
        ORDER BY first_event_id
        "#,
    )?;
    let blobs = stmt
        .query_map(
            params![key.namespace_id, key.workflow_id, key.run_id, token],
            |row| row.get::<_, Vec<u8>>(0),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    blobs
        .iter()
        .map(|blob| bincode::deserialize(blob).map_err(Error::from))
        .collect()
}

fn append_batches(
    conn: &Connection,
    key: &RunKey,
    token: &[u8],
    batches: &[EventBatch],
) -> Result<()> {
    let last = branch_tail(conn, key, token)?;
    let pending = batches_to_append(token, last, batches, |first| {
        read_batch(conn, key, token, first)
    })?;

    for batch in pending {
        conn.execute(
            r#"
            INSERT INTO history_batches
                (namespace_id, workflow_id, run_id, branch_token, first_event_id, last_event_id, batch)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                key.namespace_id,
                key.workflow_id,
                key.run_id,
                token,
                batch.first_event_id(),
                batch.last_event_id(),
                bincode::serialize(batch)?,
            ],
        )?;
    }
    Ok(())
}

fn exists(conn: &Connection, key: &RunKey) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            r#"
            SELECT 1 FROM executions
            WHERE namespace_id = ?1 AND workflow_id = ?2 AND run_id = ?3
            "#,
            params![key.namespace_id, key.workflow_id, key.run_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_record(conn: &Connection, write: &ExecutionWrite) -> Result<()> {
    let key = write.key();
    append_batches(conn, key, write.state.current_branch_token(), &write.new_batches)?;

    conn.execute(
        r#"
        INSERT INTO executions (namespace_id, workflow_id, run_id, db_version, state)
        VALUES (?1, ?2, ?3, 1, ?4)
        "#,
        params![
            key.namespace_id,
            key.workflow_id,
            key.run_id,
            bincode::serialize(&write.state)?,
        ],
    )?;

    conn.execute(
        r#"
        INSERT INTO current_runs (namespace_id, workflow_id, run_id, start_time)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(namespace_id, workflow_id) DO UPDATE
            SET run_id = excluded.run_id, start_time = excluded.start_time
            WHERE excluded.start_time >= current_runs.start_time
               OR current_runs.start_time IS NULL
        "#,
        params![
            key.namespace_id,
            key.workflow_id,
            key.run_id,
            write.state.start_time.map(|t| t.timestamp_micros()),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn get_execution(&self, key: &RunKey) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.lock().await;
        read_record(&conn, key)
    }

    async fn get_current_run_id(
        &self,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let run_id = conn
            .query_row(
                "SELECT run_id FROM current_runs WHERE namespace_id = ?1 AND workflow_id = ?2",
                params![namespace_id, workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }

    async fn create_execution(&self, write: ExecutionWrite) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if exists(&tx, write.key())? {
            return Err(Error::AlreadyExists(write.key().to_string()));
        }
        insert_record(&tx, &write)?;
        tx.commit()?;
        Ok(())
    }

    async fn update_execution(&self, update: UpdateExecution) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let key = update.write.key();

        let db_version: Option<i64> = tx
            .query_row(
                r#"
                SELECT db_version FROM executions
                WHERE namespace_id = ?1 AND workflow_id = ?2 AND run_id = ?3
                "#,
                params![key.namespace_id, key.workflow_id, key.run_id],
                |row| row.get(0),
            )
            .optional()?;
        match db_version {
            None => return Err(Error::NotFound(key.to_string())),
            Some(v) if v != update.expected_db_version => {
                return Err(Error::ConditionFailed(format!(
                    "{} is at db version {}, expected {}",
                    key, v, update.expected_db_version
                )))
            }
            Some(_) => {}
        }

        append_batches(
            &tx,
            key,
            update.write.state.current_branch_token(),
            &update.write.new_batches,
        )?;
        tx.execute(
            r#"
            UPDATE executions
            SET db_version = db_version + 1,
                rebuild_count = rebuild_count + ?4,
                state = ?5,
                updated_at = CURRENT_TIMESTAMP
            WHERE namespace_id = ?1 AND workflow_id = ?2 AND run_id = ?3
            "#,
            params![
                key.namespace_id,
                key.workflow_id,
                key.run_id,
                i64::from(update.mode.is_rebuilt()),
                bincode::serialize(&update.write.state)?,
            ],
        )?;

        if let Some(new_run) = &update.new_run {
            if exists(&tx, new_run.key())? {
                return Err(Error::AlreadyExists(new_run.key().to_string()));
            }
            insert_record(&tx, new_run)?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn append_history(
        &self,
        key: &RunKey,
        branch_token: &[u8],
        batches: &[EventBatch],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        append_batches(&tx, key, branch_token, batches)?;
        tx.commit()?;
        Ok(())
    }

    async fn read_history(
        &self,
        key: &RunKey,
        branch_token: &[u8],
        min_event_id: EventId,
        max_event_id: EventId,
    ) -> Result<Vec<EventBatch>> {
        let conn = self.conn.lock().await;
        let batches = read_branch(&conn, key, branch_token)?;
        Ok(slice_batches(batches, min_event_id, max_event_id))
    }

    async fn fork_branch(
        &self,
        key: &RunKey,
        base_branch: &[u8],
        fork_event_id: EventId,
    ) -> Result<Vec<u8>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let copied = slice_batches(read_branch(&tx, key, base_branch)?, 1, fork_event_id);
        if copied.last().map(|b| b.last_event_id()) != Some(fork_event_id) {
            return Err(Error::InvalidSequence(format!(
                "branch of {} does not reach fork point {}",
                key, fork_event_id
            )));
        }

        let token = new_branch_token();
        append_batches(&tx, key, &token, &copied)?;
        tx.commit()?;
        Ok(token)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("SQLite error: {}", e))
    }
}
