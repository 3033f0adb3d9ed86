use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::record::{ExecutionRecord, RunStatus};
use flowgate_core::traits::ExecutionStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_flow
        ON executions(flow_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS node_outputs (
        execution_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        output TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY (execution_id, node_id)
    );";

fn db_err(e: impl std::fmt::Display) -> FlowgateError {
    FlowgateError::Database(e.to_string())
}

/// Brief listing of a stored run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub started_at: String,
    pub duration_ms: u64,
}

/// SQLite-backed execution store: one row per run plus the replay log.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Execution store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn save_sync(&self, record: &ExecutionRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO executions
                 (execution_id, flow_id, status, started_at, finished_at, duration_ms, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.execution_id,
                record.flow_id,
                record.status.as_str(),
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
                record.duration_ms as i64,
                json,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn append_sync(&self, execution_id: &str, node_id: &str, output: &Value) -> Result<()> {
        let json = serde_json::to_string(output)?;
        let conn = self.conn.lock().map_err(db_err)?;
        // First write wins; a node output never changes once logged.
        conn.execute(
            "INSERT OR IGNORE INTO node_outputs (execution_id, node_id, output, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![execution_id, node_id, json, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn load_outputs_sync(&self, execution_id: &str) -> Result<BTreeMap<String, Value>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT node_id, output FROM node_outputs WHERE execution_id = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut outputs = BTreeMap::new();
        for row in rows {
            let (node_id, json) = row.map_err(db_err)?;
            outputs.insert(node_id, serde_json::from_str(&json)?);
        }
        Ok(outputs)
    }

    fn load_record_sync(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record FROM executions WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Most recent runs, newest first, optionally for one flow.
    pub fn list_executions(&self, flow_id: Option<&str>, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, flow_id, status, started_at, duration_ms
                 FROM executions
                 WHERE ?1 IS NULL OR flow_id = ?1
                 ORDER BY started_at DESC
                 LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![flow_id, limit as i64], |row| {
                let status: String = row.get(2)?;
                Ok(ExecutionSummary {
                    execution_id: row.get(0)?,
                    flow_id: row.get(1)?,
                    status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                    started_at: row.get(3)?,
                    duration_ms: row.get::<_, i64>(4)? as u64,
                })
            })
            .map_err(db_err)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.map_err(db_err)?);
        }
        Ok(summaries)
    }

    /// Drop the replay log of a run so a rerun executes every node again.
    pub fn clear_node_outputs(&self, execution_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "DELETE FROM node_outputs WHERE execution_id = ?1",
            params![execution_id],
        )
        .map_err(db_err)
    }
}

impl ExecutionStore for SqliteStore {
    fn save_execution_record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move { self.save_sync(&record) })
    }

    fn append_node_output(
        &self,
        execution_id: &str,
        node_id: &str,
        output: &Value,
    ) -> BoxFuture<'_, Result<()>> {
        let (execution_id, node_id, output) =
            (execution_id.to_string(), node_id.to_string(), output.clone());
        Box::pin(async move { self.append_sync(&execution_id, &node_id, &output) })
    }

    fn load_node_outputs(&self, execution_id: &str) -> BoxFuture<'_, Result<BTreeMap<String, Value>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move { self.load_outputs_sync(&execution_id) })
    }

    fn load_execution_record(
        &self,
        execution_id: &str,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move { self.load_record_sync(&execution_id) })
    }
}
