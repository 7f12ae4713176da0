use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use flowgate_core::error::{FlowgateError, Result};

use crate::graph::WorkflowGraph;

/// Persistent graph snapshots backed by SQLite. One row per graph,
/// replaced on every save.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| db_error("Failed to open snapshot store", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS graph_snapshots (
                 graph_id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 status TEXT NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| db_error("Failed to initialize snapshot schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Save (upsert) a graph's full state.
    pub fn save(&self, graph: &WorkflowGraph) -> Result<()> {
        let json = serde_json::to_string(graph)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO graph_snapshots (graph_id, name, status, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                graph.id(),
                graph.name(),
                graph.status().as_str(),
                json,
                graph.updated_at().to_rfc3339(),
            ],
        )
        .map_err(|e| db_error("Failed to save snapshot", e))?;
        Ok(())
    }

    pub fn load(&self, graph_id: &str) -> Result<Option<WorkflowGraph>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT snapshot_json FROM graph_snapshots WHERE graph_id = ?1")
            .map_err(|e| db_error("Failed to prepare query", e))?;
        let mut rows = stmt
            .query_map(params![graph_id], |row| row.get::<_, String>(0))
            .map_err(|e| db_error("Failed to query snapshot", e))?;

        match rows.next() {
            Some(row) => {
                let json = row.map_err(|e| db_error("Failed to read snapshot", e))?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// All stored graphs, oldest update first. Rows that no longer parse
    /// are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<WorkflowGraph>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT graph_id, snapshot_json FROM graph_snapshots ORDER BY updated_at ASC")
            .map_err(|e| db_error("Failed to prepare query", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| db_error("Failed to query snapshots", e))?;

        let mut graphs = Vec::new();
        for row in rows {
            let (graph_id, json) = row.map_err(|e| db_error("Failed to read snapshot", e))?;
            match serde_json::from_str::<WorkflowGraph>(&json) {
                Ok(graph) => graphs.push(graph),
                Err(e) => tracing::warn!(graph_id = %graph_id, error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(graphs)
    }

    pub fn delete(&self, graph_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM graph_snapshots WHERE graph_id = ?1",
                params![graph_id],
            )
            .map_err(|e| db_error("Failed to delete snapshot", e))?;
        Ok(deleted > 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowgateError::Database(e.to_string()))
    }
}

fn db_error(context: &str, e: rusqlite::Error) -> FlowgateError {
    FlowgateError::Database(format!("{}: {}", context, e))
}
