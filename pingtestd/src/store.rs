//! SQLite persistence for scenarios, results and the schedule mirror.
//!
//! Schema:
//! - scenarios: dashboard-owned test definitions (read-only to the daemon)
//! - results: one row per ping run, unique on the run identity
//! - schedules: registered recurring jobs; the running daemon drops any
//!   job whose row disappears, which is how `--stop` reaches it
//! - cache: keyed JSON snapshots with an expiry, read by the dashboard

use crate::registry::{JobSpec, JobTarget};
use chrono::{DateTime, SecondsFormat, Utc};
use pingtest_common::{Outcome, ScenarioArgs, ScenarioRecord, TestResult, truncate_chars};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// Stored statistics are cut to this many characters.
pub const STATISTICS_MAX_CHARS: usize = 500;

/// Stored error messages are cut to this many characters.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 2000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scenarios (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_ip TEXT NOT NULL,
    source_port INTEGER NOT NULL,
    dest_ip TEXT NOT NULL,
    device_name TEXT NOT NULL,
    test_name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    telnet_host TEXT NOT NULL,
    telnet_port INTEGER NOT NULL,
    ping_destination TEXT NOT NULL,
    test_name TEXT NOT NULL DEFAULT '',
    sw_name TEXT NOT NULL,
    test_start TEXT NOT NULL,
    test_end TEXT NOT NULL,
    success TEXT NOT NULL,
    statistics TEXT NOT NULL DEFAULT '',
    error_message TEXT NOT NULL DEFAULT ''
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_results_identity
    ON results(telnet_host, telnet_port, ping_destination, test_name, sw_name, test_start);
CREATE INDEX IF NOT EXISTS idx_results_start ON results(test_start);
CREATE INDEX IF NOT EXISTS idx_results_end ON results(test_end);

CREATE TABLE IF NOT EXISTS schedules (
    name TEXT PRIMARY KEY,
    target TEXT NOT NULL,
    args TEXT NOT NULL,
    cron TEXT NOT NULL,
    repeats INTEGER NOT NULL,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

const RESULT_COLUMNS: &str = "telnet_host, telnet_port, ping_destination, test_name, sw_name, \
                              test_start, test_end, success, statistics, error_message";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid job arguments: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored value {value:?}: {reason}")]
    Decode { value: String, reason: String },

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Fixed-width UTC timestamp; lexical order is chronological order.
pub fn encode_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Shared handle to the database; clones use the same connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        debug!("Opened database at {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run `f` against this store on the blocking pool.
    ///
    /// Every async caller goes through here so SQLite never blocks a
    /// runtime worker.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    // --- results ---

    /// Insert a result, or overwrite the row with the same run identity.
    pub fn upsert_result(&self, result: &TestResult) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO results ({RESULT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(telnet_host, telnet_port, ping_destination, test_name, sw_name, test_start)
                 DO UPDATE SET
                    test_end = excluded.test_end,
                    success = excluded.success,
                    statistics = excluded.statistics,
                    error_message = excluded.error_message"
            ),
            params![
                result.telnet_host,
                result.telnet_port,
                result.ping_destination,
                result.test_name.as_deref().unwrap_or(""),
                result.device_name,
                encode_timestamp(&result.start_time),
                encode_timestamp(&result.end_time),
                result.outcome.code(),
                truncate_chars(&result.statistics, STATISTICS_MAX_CHARS),
                truncate_chars(&result.error, ERROR_MESSAGE_MAX_CHARS),
            ],
        )?;
        Ok(())
    }

    /// Most recent results by end time, newest first.
    pub fn recent_results(&self, limit: usize) -> Result<Vec<TestResult>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM results ORDER BY test_end DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], raw_result)?;
        rows.map(|row| row?.decode()).collect()
    }

    pub fn count_results(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete up to `batch_size` results that started before `cutoff`.
    ///
    /// Each call is its own transaction; returns the number of rows removed.
    pub fn delete_results_before(
        &self,
        cutoff: &DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM results WHERE id IN (
                SELECT id FROM results WHERE test_start < ?1 ORDER BY id LIMIT ?2
             )",
            params![encode_timestamp(cutoff), batch_size as i64],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    // --- scenarios ---

    pub fn list_active_scenarios(&self) -> Result<Vec<ScenarioRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_ip, source_port, dest_ip, device_name, test_name, active
             FROM scenarios WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ScenarioRecord {
                id: row.get(0)?,
                args: ScenarioArgs {
                    host: row.get(1)?,
                    port: row.get(2)?,
                    destination: row.get(3)?,
                    device_name: row.get(4)?,
                    test_name: row.get(5)?,
                },
                active: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

/// Scenario writes belong to the dashboard; the daemon only reads. These
/// stand in for it in tests.
#[cfg(test)]
impl Store {
    pub fn insert_scenario(&self, args: &ScenarioArgs) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scenarios (source_ip, source_port, dest_ip, device_name, test_name, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                args.host,
                args.port,
                args.destination,
                args.device_name,
                args.test_name
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Replace every field of a scenario; false if the id does not exist.
    pub fn update_scenario(&self, id: i64, args: &ScenarioArgs) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE scenarios
             SET source_ip = ?2, source_port = ?3, dest_ip = ?4, device_name = ?5, test_name = ?6
             WHERE id = ?1",
            params![
                id,
                args.host,
                args.port,
                args.destination,
                args.device_name,
                args.test_name
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn set_scenario_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE scenarios SET active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_scenario(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM scenarios WHERE id = ?1", params![id])? > 0)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}

impl Store {
    // --- schedule mirror ---

    pub fn upsert_schedule(&self, spec: &JobSpec) -> Result<(), StoreError> {
        let args = serde_json::to_string(&spec.args)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO schedules (name, target, args, cron, repeats, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                target = excluded.target,
                args = excluded.args,
                cron = excluded.cron,
                repeats = excluded.repeats,
                registered_at = excluded.registered_at",
            params![
                spec.name,
                spec.target.as_str(),
                args,
                spec.cron,
                spec.repeats,
                encode_timestamp(&Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn delete_schedule(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM schedules WHERE name = ?1", params![name])? > 0)
    }

    /// Delete every schedule whose name starts with `prefix`; returns their names.
    ///
    /// Compares with `substr` rather than `LIKE` because job names contain `_`.
    pub fn delete_schedules_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let names = {
            let mut stmt = tx.prepare(
                "SELECT name FROM schedules WHERE substr(name, 1, length(?1)) = ?1 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "DELETE FROM schedules WHERE substr(name, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        tx.commit()?;
        Ok(names)
    }

    pub fn schedule_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM schedules ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_schedules(&self) -> Result<Vec<JobSpec>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, target, args, cron, repeats FROM schedules ORDER BY name")?;
        let rows = stmt.query_map([], raw_schedule)?;
        rows.map(|row| row?.decode()).collect()
    }

    // --- cache ---

    /// Replace the snapshot under `key`; it is served until `expires_at`.
    pub fn put_cached(
        &self,
        key: &str,
        results: &[TestResult],
        expires_at: &DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(results)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache (key, payload, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                expires_at = excluded.expires_at",
            params![key, payload, encode_timestamp(expires_at)],
        )?;
        Ok(())
    }

    /// Snapshot under `key` with its expiry, unless it expired by `now`.
    /// Expired rows are deleted.
    pub fn get_cached(
        &self,
        key: &str,
        now: &DateTime<Utc>,
    ) -> Result<Option<(Vec<TestResult>, DateTime<Utc>)>, StoreError> {
        let conn = self.conn()?;
        let now = encode_timestamp(now);
        conn.execute(
            "DELETE FROM cache WHERE key = ?1 AND expires_at <= ?2",
            params![key, now],
        )?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT payload, expires_at FROM cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((payload, expires_at)) => Ok(Some((
                serde_json::from_str(&payload)?,
                decode_timestamp(&expires_at)?,
            ))),
            None => Ok(None),
        }
    }
}

/// Result columns before text fields are decoded.
struct RawResult {
    telnet_host: String,
    telnet_port: i64,
    ping_destination: String,
    test_name: String,
    device_name: String,
    start: String,
    end: String,
    outcome: String,
    statistics: String,
    error: String,
}

fn raw_result(row: &Row<'_>) -> rusqlite::Result<RawResult> {
    Ok(RawResult {
        telnet_host: row.get(0)?,
        telnet_port: row.get(1)?,
        ping_destination: row.get(2)?,
        test_name: row.get(3)?,
        device_name: row.get(4)?,
        start: row.get(5)?,
        end: row.get(6)?,
        outcome: row.get(7)?,
        statistics: row.get(8)?,
        error: row.get(9)?,
    })
}

impl RawResult {
    fn decode(self) -> Result<TestResult, StoreError> {
        let outcome = self
            .outcome
            .parse::<Outcome>()
            .map_err(|e| StoreError::Decode {
                value: self.outcome.clone(),
                reason: e.to_string(),
            })?;
        Ok(TestResult {
            telnet_host: self.telnet_host,
            telnet_port: self.telnet_port,
            ping_destination: self.ping_destination,
            test_name: (!self.test_name.is_empty()).then_some(self.test_name),
            device_name: self.device_name,
            start_time: decode_timestamp(&self.start)?,
            end_time: decode_timestamp(&self.end)?,
            outcome,
            statistics: self.statistics,
            error: self.error,
        })
    }
}

struct RawSchedule {
    name: String,
    target: String,
    args: String,
    cron: String,
    repeats: i32,
}

fn raw_schedule(row: &Row<'_>) -> rusqlite::Result<RawSchedule> {
    Ok(RawSchedule {
        name: row.get(0)?,
        target: row.get(1)?,
        args: row.get(2)?,
        cron: row.get(3)?,
        repeats: row.get(4)?,
    })
}

impl RawSchedule {
    fn decode(self) -> Result<JobSpec, StoreError> {
        let target = self
            .target
            .parse::<JobTarget>()
            .map_err(|reason| StoreError::Decode {
                value: self.target.clone(),
                reason,
            })?;
        Ok(JobSpec {
            name: self.name,
            target,
            args: serde_json::from_str(&self.args)?,
            cron: self.cron,
            repeats: self.repeats,
        })
    }
}
