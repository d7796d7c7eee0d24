use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ToSql};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Oom,
    Crash,
    UserStopped,
    UserMarkedPreferred,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Oom => "oom",
            RunOutcome::Crash => "crash",
            RunOutcome::UserStopped => "user_stopped",
            RunOutcome::UserMarkedPreferred => "user_marked_preferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunOutcome::Success),
            "oom" => Some(RunOutcome::Oom),
            "crash" => Some(RunOutcome::Crash),
            "user_stopped" => Some(RunOutcome::UserStopped),
            "user_marked_preferred" => Some(RunOutcome::UserMarkedPreferred),
            _ => None,
        }
    }

    /// Outcomes that count as "this configuration worked".
    pub fn is_good(self) -> bool {
        matches!(self, RunOutcome::Success | RunOutcome::UserMarkedPreferred)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoricalRun {
    pub id: i64,
    pub session_id: String,
    pub model_identity: String,
    pub tuning_level: i32,
    pub vram_budget_bytes: u64,
    pub outcome: RunOutcome,
    pub preferred: bool,
    pub observed_vram_used_bytes: Option<u64>,
    pub args: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoricalRun {
    pub fn is_preferred(&self) -> bool {
        self.preferred || self.outcome == RunOutcome::UserMarkedPreferred
    }
}

/// Values for a row about to be appended.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub session_id: &'a str,
    pub model_identity: &'a str,
    pub tuning_level: i32,
    pub vram_budget_bytes: u64,
    pub outcome: RunOutcome,
    pub observed_vram_used_bytes: Option<u64>,
    pub args: &'a [String],
}

const COLUMNS: &str = "id, session_id, model_identity, tuning_level, vram_budget_bytes, outcome, \
                       preferred, observed_vram_used_bytes, args_json, timestamp";

/// Columns added after the first schema, with their ALTER TABLE definitions.
const ADDED_COLUMNS: &[(&str, &str)] = &[
    ("session_id", "TEXT NOT NULL DEFAULT ''"),
    ("preferred", "INTEGER NOT NULL DEFAULT 0"),
    ("observed_vram_used_bytes", "INTEGER"),
    ("args_json", "TEXT NOT NULL DEFAULT '[]'"),
];

/// Append-only launch log. One writer, serialized behind the mutex.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

struct RawRow {
    id: i64,
    session_id: String,
    model_identity: String,
    tuning_level: i64,
    vram_budget_bytes: i64,
    outcome: String,
    preferred: i64,
    observed: Option<i64>,
    args_json: String,
    timestamp: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            model_identity: row.get(2)?,
            tuning_level: row.get(3)?,
            vram_budget_bytes: row.get(4)?,
            outcome: row.get(5)?,
            preferred: row.get(6)?,
            observed: row.get(7)?,
            args_json: row.get(8)?,
            timestamp: row.get(9)?,
        })
    }

    fn into_run(self) -> std::result::Result<HistoricalRun, String> {
        let outcome = RunOutcome::parse(&self.outcome).ok_or_else(|| format!("unknown outcome '{}'", self.outcome))?;
        let tuning_level = i32::try_from(self.tuning_level).map_err(|_| "tuning level out of range".to_string())?;
        let vram_budget_bytes =
            u64::try_from(self.vram_budget_bytes).map_err(|_| "negative vram budget".to_string())?;
        let args: Vec<String> = serde_json::from_str(&self.args_json).map_err(|e| format!("args_json: {}", e))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| format!("timestamp: {}", e))?
            .with_timezone(&Utc);
        Ok(HistoricalRun {
            id: self.id,
            session_id: self.session_id,
            model_identity: self.model_identity,
            tuning_level,
            vram_budget_bytes,
            outcome,
            preferred: self.preferred != 0,
            observed_vram_used_bytes: self.observed.and_then(|v| u64::try_from(v).ok()),
            args,
            timestamp,
        })
    }
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS launch_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL DEFAULT '',
                model_identity TEXT NOT NULL,
                tuning_level INTEGER NOT NULL,
                vram_budget_bytes INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                preferred INTEGER NOT NULL DEFAULT 0,
                observed_vram_used_bytes INTEGER,
                args_json TEXT NOT NULL DEFAULT '[]',
                timestamp TEXT NOT NULL
            )",
            [],
        )?;
        Self::migrate(&conn)?;
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_launch_model_outcome ON launch_history(model_identity, outcome);
             CREATE INDEX IF NOT EXISTS idx_launch_timestamp ON launch_history(timestamp);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let existing: Vec<String> = {
            let mut stmt = conn.prepare("PRAGMA table_info(launch_history)")?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            names.collect::<rusqlite::Result<_>>()?
        };
        for (name, def) in ADDED_COLUMNS {
            if !existing.iter().any(|c| c == name) {
                log::info!("[history] adding column {}", name);
                conn.execute(&format!("ALTER TABLE launch_history ADD COLUMN {} {}", name, def), [])?;
            }
        }
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, run: &NewRun<'_>) -> Result<i64> {
        let conn = self.conn();
        let args_json = serde_json::to_string(run.args)?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute(
            "INSERT INTO launch_history
            (session_id, model_identity, tuning_level, vram_budget_bytes, outcome, preferred, observed_vram_used_bytes, args_json, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8)",
            params![
                run.session_id,
                run.model_identity,
                run.tuning_level,
                run.vram_budget_bytes as i64,
                run.outcome.as_str(),
                run.observed_vram_used_bytes.map(|v| v as i64),
                args_json,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        log::info!(
            "[history] run #{} {} level {} -> {}",
            id,
            run.model_identity,
            run.tuning_level,
            run.outcome.as_str()
        );
        Ok(id)
    }

    /// Sets the preferred flag on a good run. Returns false when the row is
    /// missing or did not succeed.
    pub fn mark_preferred(&self, run_id: i64) -> Result<bool> {
        match self.get(run_id)? {
            Some(run) if run.outcome.is_good() => {}
            _ => return Ok(false),
        }
        let changed = self
            .conn()
            .execute("UPDATE launch_history SET preferred = 1 WHERE id = ?1", [run_id])?;
        Ok(changed > 0)
    }

    fn select(&self, tail: &str, params: &[&dyn ToSql]) -> Result<Vec<HistoricalRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM launch_history {}", COLUMNS, tail))?;
        let rows = stmt.query_map(params, RawRow::from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            let parsed = row.map_err(|e| e.to_string()).and_then(RawRow::into_run);
            match parsed {
                Ok(run) => runs.push(run),
                Err(e) => log::warn!("[history] skipping malformed row: {}", e),
            }
        }
        Ok(runs)
    }

    pub fn get(&self, run_id: i64) -> Result<Option<HistoricalRun>> {
        Ok(self.select("WHERE id = ?1", &[&run_id])?.into_iter().next())
    }

    /// Best remembered configuration: preferred first, then most recent.
    pub fn best_run(&self, model: &str) -> Result<Option<HistoricalRun>> {
        let runs = self.select(
            "WHERE model_identity = ?1 AND outcome IN ('success', 'user_marked_preferred')
             ORDER BY (preferred = 1 OR outcome = 'user_marked_preferred') DESC, timestamp DESC, id DESC",
            &[&model],
        )?;
        Ok(runs.into_iter().next())
    }

    /// Preferred run whose budget is within `tolerance` (relative) of `budget_bytes`.
    /// Closest budget wins, then recency.
    pub fn preferred_near_budget(&self, model: &str, budget_bytes: u64, tolerance: f64) -> Result<Option<HistoricalRun>> {
        let limit = budget_bytes as f64 * tolerance;
        let runs = self.select(
            "WHERE model_identity = ?1 AND outcome IN ('success', 'user_marked_preferred')
             AND (preferred = 1 OR outcome = 'user_marked_preferred')
             ORDER BY timestamp DESC, id DESC",
            &[&model],
        )?;
        Ok(runs
            .into_iter()
            .filter(|r| (r.vram_budget_bytes.abs_diff(budget_bytes) as f64) <= limit)
            .min_by_key(|r| r.vram_budget_bytes.abs_diff(budget_bytes)))
    }

    /// Good runs, highest level first.
    pub fn success_runs(&self, model: &str) -> Result<Vec<HistoricalRun>> {
        self.select(
            "WHERE model_identity = ?1 AND outcome IN ('success', 'user_marked_preferred')
             ORDER BY tuning_level DESC, timestamp DESC, id DESC",
            &[&model],
        )
    }

    pub fn failed_levels(&self, model: &str) -> Result<Vec<HistoricalRun>> {
        self.select(
            "WHERE model_identity = ?1 AND outcome = 'oom' ORDER BY tuning_level DESC, id DESC",
            &[&model],
        )
    }

    pub fn nearest_vram_runs(&self, model: &str, budget_bytes: u64, limit: usize) -> Result<Vec<HistoricalRun>> {
        let budget = budget_bytes as i64;
        let limit = limit as i64;
        self.select(
            "WHERE model_identity = ?1
             ORDER BY ABS(vram_budget_bytes - ?2) ASC, timestamp DESC, id DESC
             LIMIT ?3",
            &[&model, &budget, &limit],
        )
    }

    pub fn recent(&self, model: Option<&str>, limit: usize) -> Result<Vec<HistoricalRun>> {
        let limit = limit as i64;
        match model {
            Some(model) => self.select(
                "WHERE model_identity = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                &[&model, &limit],
            ),
            None => self.select("ORDER BY timestamp DESC, id DESC LIMIT ?1", &[&limit]),
        }
    }
}
