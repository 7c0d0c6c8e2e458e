use crate::undo::{BulkEntry, RunHistory, VanillaEntry};
use crate::{now_ms, now_rfc3339};
use anyhow::Context;
use blockwright_protocol::{
    Blueprint, CheckpointStatus, Counters, ResumableCheckpoint, Vec3,
};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

/// Crash-recovery state: one checkpoint row per run plus its undo log.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    db_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // Durable + fast defaults.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(conn)
    }

    pub fn create(
        &self,
        run_id: &str,
        blueprint: &Blueprint,
        origin: Vec3,
        cursor: Vec3,
        start_index: usize,
        resumed_from: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.open()?;
        let ts = now_rfc3339();
        conn.execute(
            "INSERT INTO checkpoints (run_id, blueprint_json, origin_json, cursor_json, current_step_index,
                                      counters_json, status, resumed_from, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            (
                run_id,
                serde_json::to_string(blueprint)?,
                serde_json::to_string(&origin)?,
                serde_json::to_string(&cursor)?,
                start_index as i64,
                serde_json::to_string(&Counters::default())?,
                CheckpointStatus::InProgress.as_str(),
                resumed_from,
                ts,
            ),
        )
        .with_context(|| format!("create checkpoint {run_id}"))?;
        Ok(())
    }

    /// Records a finished step and the undo entries it produced, atomically.
    pub fn record_step(
        &self,
        run_id: &str,
        next_index: usize,
        cursor: Vec3,
        counters: &Counters,
        vanilla: &[VanillaEntry],
        bulk: &[BulkEntry],
    ) -> anyhow::Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE checkpoints SET current_step_index = ?2, cursor_json = ?3, counters_json = ?4, updated_at = ?5
             WHERE run_id = ?1",
            (
                run_id,
                next_index as i64,
                serde_json::to_string(&cursor)?,
                serde_json::to_string(counters)?,
                now_rfc3339(),
            ),
        )?;
        for entry in vanilla {
            append_undo_tx(&tx, run_id, "vanilla", serde_json::to_value(entry)?)?;
        }
        for entry in bulk {
            append_undo_tx(&tx, run_id, "bulk", serde_json::to_value(entry)?)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_status(&self, run_id: &str, status: CheckpointStatus) -> anyhow::Result<bool> {
        let conn = self.open()?;
        let n = conn.execute(
            "UPDATE checkpoints SET status = ?2, updated_at = ?3 WHERE run_id = ?1",
            (run_id, status.as_str(), now_rfc3339()),
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, run_id: &str) -> anyhow::Result<Option<ResumableCheckpoint>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!("{SELECT_CHECKPOINT} WHERE run_id = ?1"))?;
        let row = stmt.query_row([run_id], read_row).optional()?;
        row.map(decode).transpose()
    }

    /// Checkpoints of runs that stopped before finishing, newest first.
    pub fn list_resumable(&self) -> anyhow::Result<Vec<ResumableCheckpoint>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_CHECKPOINT} WHERE status IN ('in_progress', 'failed') ORDER BY updated_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], read_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(row?)?);
        }
        Ok(out)
    }

    /// Undo entries a run recorded, in recording order.
    pub fn undo_entries(&self, run_id: &str) -> anyhow::Result<RunHistory> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT kind, payload_json FROM undo_log WHERE run_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut history = RunHistory::new(run_id);
        for row in rows {
            let (kind, payload) = row?;
            match kind.as_str() {
                "vanilla" => history.vanilla.push(
                    serde_json::from_str(&payload).context("decode vanilla undo entry")?,
                ),
                "bulk" => history
                    .bulk
                    .push(serde_json::from_str(&payload).context("decode bulk undo entry")?),
                other => anyhow::bail!("unknown undo entry kind {other:?}"),
            }
        }
        Ok(history)
    }
}

const SELECT_CHECKPOINT: &str = "SELECT run_id, blueprint_json, origin_json, cursor_json, current_step_index,
        counters_json, status, resumed_from, created_at, updated_at FROM checkpoints";

struct CheckpointRow {
    run_id: String,
    blueprint_json: String,
    origin_json: String,
    cursor_json: String,
    current_step_index: i64,
    counters_json: String,
    status: String,
    resumed_from: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        run_id: row.get(0)?,
        blueprint_json: row.get(1)?,
        origin_json: row.get(2)?,
        cursor_json: row.get(3)?,
        current_step_index: row.get(4)?,
        counters_json: row.get(5)?,
        status: row.get(6)?,
        resumed_from: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn decode(row: CheckpointRow) -> anyhow::Result<ResumableCheckpoint> {
    let status = CheckpointStatus::parse(&row.status)
        .with_context(|| format!("checkpoint {}: bad status {:?}", row.run_id, row.status))?;
    Ok(ResumableCheckpoint {
        blueprint: serde_json::from_str(&row.blueprint_json)
            .with_context(|| format!("checkpoint {}: blueprint", row.run_id))?,
        origin: serde_json::from_str(&row.origin_json)?,
        cursor: serde_json::from_str(&row.cursor_json)?,
        current_step_index: row.current_step_index.try_into().unwrap_or(0),
        counters: serde_json::from_str(&row.counters_json)?,
        status,
        resumed_from: row.resumed_from,
        created_at: row.created_at,
        updated_at: row.updated_at,
        run_id: row.run_id,
    })
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS checkpoints (
  run_id TEXT PRIMARY KEY,
  blueprint_json TEXT NOT NULL,
  origin_json TEXT NOT NULL,
  cursor_json TEXT NOT NULL DEFAULT '{"x":0,"y":0,"z":0}',
  -- Index of the next step that has not completed.
  current_step_index INTEGER NOT NULL DEFAULT 0,
  counters_json TEXT NOT NULL DEFAULT '{}',
  status TEXT NOT NULL DEFAULT 'in_progress',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);

-- Append-only, replayed on resume.
CREATE TABLE IF NOT EXISTS undo_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES checkpoints(run_id),
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_undo_log_run ON undo_log(run_id);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    // Best-effort column additions for existing DBs.
    ensure_column(conn, "checkpoints", "resumed_from", "TEXT")?;

    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, col: &str, decl: &str) -> anyhow::Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {col} {decl}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(e) => {
            // Ignore "duplicate column name".
            if e.to_string().to_lowercase().contains("duplicate column") {
                return Ok(());
            }
            Err(e).with_context(|| format!("ensure column {table}.{col}"))
        }
    }
}

fn append_undo_tx(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    kind: &str,
    payload: serde_json::Value,
) -> anyhow::Result<i64> {
    let payload_json = payload.to_string();
    tx.execute(
        "INSERT INTO undo_log (run_id, ts_ms, kind, payload_json) VALUES (?1, ?2, ?3, ?4)",
        (run_id, now_ms(), kind, payload_json),
    )?;
    Ok(tx.last_insert_rowid())
}
