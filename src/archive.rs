//! SQLite-backed archive of finished runs and their task instances

use crate::error::Result;
use crate::models::{ActionOutput, RunRecord, RunStatus, TaskInstance, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Run-history archive. Terminal runs are written once and never mutated.
#[derive(Clone)]
pub struct RunArchive {
    conn: Arc<Mutex<Connection>>,
}

impl RunArchive {
    /// Open (or create) the archive database at the given path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let archive = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        archive.init_schema()?;
        Ok(archive)
    }

    /// In-memory archive (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let archive = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        archive.init_schema()?;
        Ok(archive)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                graph_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMP NOT NULL,
                finished_at TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS task_instances (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL,
                node TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                started_at TIMESTAMP,
                finished_at TIMESTAMP,
                output TEXT,
                error TEXT,
                FOREIGN KEY (run_id) REFERENCES runs(run_id)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_graph_started ON runs(graph_name, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_task_instances_run ON task_instances(run_id);
            ",
        )?;

        Ok(())
    }

    /// Archive one finished run with all its task instances
    pub fn record_run(&self, record: &RunRecord, instances: &[TaskInstance]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO runs (run_id, graph_name, status, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.run_id.to_string(),
                record.graph_name,
                record.status.to_string(),
                record.started_at,
                record.finished_at
            ],
        )?;

        for instance in instances {
            let output = instance
                .output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .unwrap_or(None);
            tx.execute(
                "INSERT INTO task_instances
                 (run_id, node, status, attempts, started_at, finished_at, output, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.run_id.to_string(),
                    instance.node,
                    instance.status.to_string(),
                    instance.attempts,
                    instance.started_at,
                    instance.finished_at,
                    output,
                    instance.error
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch one archived run by id
    pub fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock().unwrap();

        let record = conn
            .query_row(
                "SELECT run_id, graph_name, status, started_at, finished_at
                 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok(RunRecord {
                        run_id: parse_run_id(&row.get::<_, String>(0)?),
                        graph_name: row.get(1)?,
                        status: parse_run_status(&row.get::<_, String>(2)?),
                        started_at: row.get(3)?,
                        finished_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    /// Most recent archived runs of a graph, newest first
    pub fn run_history(&self, graph_name: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT run_id, graph_name, status, started_at, finished_at
             FROM runs WHERE graph_name = ?1
             ORDER BY started_at DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![graph_name, limit], |row| {
            Ok(RunRecord {
                run_id: parse_run_id(&row.get::<_, String>(0)?),
                graph_name: row.get(1)?,
                status: parse_run_status(&row.get::<_, String>(2)?),
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Archived task instances of a run, sorted by node id
    pub fn task_instances(&self, run_id: Uuid) -> Result<Vec<TaskInstance>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT node, status, attempts, started_at, finished_at, output, error
             FROM task_instances WHERE run_id = ?1 ORDER BY node",
        )?;

        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            let output: Option<String> = row.get(5)?;
            Ok(TaskInstance {
                node: row.get(0)?,
                status: parse_task_status(&row.get::<_, String>(1)?),
                attempts: row.get(2)?,
                started_at: row.get::<_, Option<DateTime<Utc>>>(3)?,
                finished_at: row.get::<_, Option<DateTime<Utc>>>(4)?,
                output: output.and_then(|s| serde_json::from_str::<ActionOutput>(&s).ok()),
                error: row.get(6)?,
            })
        })?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }
}

fn parse_run_id(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "not_started" => RunStatus::NotStarted,
        "running" => RunStatus::Running,
        "succeeded" => RunStatus::Succeeded,
        _ => RunStatus::Failed,
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "pending" => TaskStatus::Pending,
        "queued" => TaskStatus::Queued,
        "running" => TaskStatus::Running,
        "success" => TaskStatus::Success,
        "skipped" => TaskStatus::Skipped,
        "upstream_failed" => TaskStatus::UpstreamFailed,
        _ => TaskStatus::Failed,
    }
}
