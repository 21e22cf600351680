//! Durable per-command log records.
//!
//! The engine writes one [`LogRecord`] per remote invocation. Sinks are
//! write-only from the engine's point of view and failures never stop a
//! deployment; see [`append_best_effort`].

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
    Timeout,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
            LogStatus::Timeout => "timeout",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "success" => LogStatus::Success,
            "timeout" => LogStatus::Timeout,
            _ => LogStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub node_id: String,
    pub node_name: String,
    pub operation: String,
    pub command: String,
    pub output: String,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub trait LogSink: Send + Sync {
    fn append(&self, record: &LogRecord) -> Result<()>;
}

/// Append without letting a sink failure reach the caller.
pub fn append_best_effort(sink: &dyn LogSink, record: &LogRecord) {
    if let Err(err) = sink.append(record) {
        log_status!(
            "logs",
            "Failed to record '{}' for {}: {}",
            record.operation,
            record.node_name,
            err
        );
    }
}

/// SQLite-backed sink, one row per remote invocation.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some("create log directory".to_string()))
            })?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS command_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT,
                node_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                operation TEXT NOT NULL,
                command TEXT NOT NULL,
                output TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_command_log_node ON command_log(node_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent records first, optionally filtered to one node.
    pub fn recent(&self, node_id: Option<&str>, limit: usize) -> Result<Vec<LogRecord>> {
        self.query(node_id, None, limit)
    }

    /// Like [`recent`](Self::recent), additionally filtered to one run.
    pub fn query(
        &self,
        node_id: Option<&str>,
        run_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LogRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::internal_unexpected("log database lock poisoned"))?;

        let mut stmt = conn.prepare(
            "SELECT run_id, node_id, node_name, operation, command, output, status,
                    started_at, finished_at
             FROM command_log
             WHERE (?1 IS NULL OR node_id = ?1)
               AND (?2 IS NULL OR run_id = ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![node_id, run_id, limit as i64], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (run_id, node_id, node_name, operation, command, output, status, start, end) =
                row?;
            records.push(LogRecord {
                run_id,
                node_id,
                node_name,
                operation,
                command,
                output,
                status: LogStatus::parse(&status),
                started_at: parse_timestamp(&start)?,
                finished_at: parse_timestamp(&end)?,
            });
        }
        Ok(records)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::internal_database(e.to_string(), Some("parse log timestamp".to_string())))
}

impl LogSink for SqliteLogSink {
    fn append(&self, record: &LogRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::internal_unexpected("log database lock poisoned"))?;
        conn.execute(
            "INSERT INTO command_log
                (run_id, node_id, node_name, operation, command, output, status,
                 started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.run_id,
                record.node_id,
                record.node_name,
                record.operation,
                record.command,
                record.output,
                record.status.as_str(),
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, record: &LogRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| Error::internal_unexpected("log sink lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

/// Discards everything.
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn append(&self, _record: &LogRecord) -> Result<()> {
        Ok(())
    }
}
