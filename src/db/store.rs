//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

/// Format used for every timestamp written to the database. Lexical order
/// matches chronological order, which `ORDER BY created_at` relies on.
const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ids bound per `DELETE ... IN (...)` statement, well under SQLite's
/// host parameter limit.
const DELETE_CHUNK_SIZE: usize = 500;

const SELECT_COLUMNS: &str = "SELECT id, type, ip, port, user, pass, status, message, result, logs, created_at, connected_at FROM connections";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("failed to encode logs: {0}")]
    EncodeLogs(#[source] serde_json::Error),
    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the store at `path` and make sure the schema exists.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            tracing::info!("Database file not found, creating {}", path.display());
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                if let Err(e) = fs::create_dir_all(dir) {
                    tracing::warn!("Failed to create database directory {}: {}", dir.display(), e);
                }
            }
        }

        let conn = Connection::open(&path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };
        store.init()?;
        tracing::info!("Database initialized: {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configure the connection and create the schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;

        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!("SQLite journal mode is {} instead of WAL", mode);
        }
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // ping
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;

        conn.execute_batch(include_str!("../../migrations/000001_connections.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Attempt CRUD ---

    /// Insert a new attempt.
    pub fn insert_attempt(&self, attempt: &ConnectionAttempt) -> Result<(), DbError> {
        let logs = encode_logs(&attempt.logs)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO connections (id, type, ip, port, user, pass, status, message, result, logs, created_at, connected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                attempt.id,
                attempt.kind,
                attempt.host,
                attempt.port,
                attempt.user,
                attempt.pass,
                attempt.status.as_str(),
                attempt.message,
                attempt.result,
                logs,
                format_db_time(&attempt.created_at),
                attempt.connected_at.as_ref().map(format_db_time).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    /// Insert attempts in one transaction: either all rows land or none do.
    pub fn insert_attempts(&self, attempts: &[ConnectionAttempt]) -> Result<(), DbError> {
        if attempts.is_empty() {
            return Ok(());
        }

        let encoded = attempts
            .iter()
            .map(|a| encode_logs(&a.logs))
            .collect::<Result<Vec<_>, _>>()?;

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO connections (id, type, ip, port, user, pass, status, message, result, logs, created_at, connected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for (a, logs) in attempts.iter().zip(&encoded) {
                stmt.execute(params![
                    a.id,
                    a.kind,
                    a.host,
                    a.port,
                    a.user,
                    a.pass,
                    a.status.as_str(),
                    a.message,
                    a.result,
                    logs,
                    format_db_time(&a.created_at),
                    a.connected_at.as_ref().map(format_db_time).unwrap_or_default(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get an attempt by id. `Ok(None)` means no such row.
    pub fn get_attempt(&self, id: &str) -> Result<Option<ConnectionAttempt>, DbError> {
        let conn = self.lock()?;
        let attempt = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                attempt_from_row,
            )
            .optional()?;
        Ok(attempt)
    }

    /// Get all attempts, newest first.
    pub fn get_attempts(&self) -> Result<Vec<ConnectionAttempt>, DbError> {
        self.query_attempts(&format!("{} ORDER BY created_at DESC", SELECT_COLUMNS), None)
    }

    /// Get attempts of one type, newest first.
    pub fn get_attempts_by_type(&self, kind: &str) -> Result<Vec<ConnectionAttempt>, DbError> {
        self.query_attempts(
            &format!("{} WHERE type = ?1 ORDER BY created_at DESC", SELECT_COLUMNS),
            Some(kind),
        )
    }

    /// Get attempts in one status, newest first.
    pub fn get_attempts_by_status(&self, status: &Status) -> Result<Vec<ConnectionAttempt>, DbError> {
        self.query_attempts(
            &format!("{} WHERE status = ?1 ORDER BY created_at DESC", SELECT_COLUMNS),
            Some(status.as_str()),
        )
    }

    fn query_attempts(&self, sql: &str, filter: Option<&str>) -> Result<Vec<ConnectionAttempt>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;

        let attempts = match filter {
            Some(value) => stmt.query_map(params![value], attempt_from_row)?,
            None => stmt.query_map([], attempt_from_row)?,
        }
        .collect::<SqlResult<Vec<_>>>()?;

        Ok(attempts)
    }

    /// Rewrite the outcome fields of an attempt. Returns whether a row matched.
    pub fn update_attempt(&self, attempt: &ConnectionAttempt) -> Result<bool, DbError> {
        let logs = encode_logs(&attempt.logs)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE connections SET status=?1, message=?2, result=?3, logs=?4, connected_at=?5 WHERE id=?6",
            params![
                attempt.status.as_str(),
                attempt.message,
                attempt.result,
                logs,
                attempt.connected_at.as_ref().map(format_db_time).unwrap_or_default(),
                attempt.id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Rewrite the descriptive fields of an attempt. Returns whether a row matched.
    pub fn update_attempt_info(&self, id: &str, info: &NewAttempt) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE connections SET type=?1, ip=?2, port=?3, user=?4, pass=?5 WHERE id=?6",
            params![info.kind, info.host, info.port, info.user, info.pass, id],
        )?;
        Ok(changed > 0)
    }

    /// Delete one attempt. Returns whether a row was removed.
    pub fn delete_attempt(&self, id: &str) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM connections WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Delete every attempt whose id is in `ids` in one transaction.
    /// Returns the number of rows actually removed.
    pub fn delete_attempts(&self, ids: &[String]) -> Result<usize, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let mut removed = 0;
        for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("DELETE FROM connections WHERE id IN ({})", placeholders);
            removed += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }

        tx.commit()?;
        Ok(removed)
    }

    /// Count attempts, for startup logging.
    pub fn count_attempts(&self) -> Result<i64, DbError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM connections", [], |r| r.get(0))?)
    }
}

/// Map one row to an attempt.
///
/// Best-effort decode: unparseable timestamps and logs degrade to their zero
/// values with a warning instead of failing the read. Any other column error
/// (wrong storage type, missing column) is propagated.
fn attempt_from_row(row: &Row<'_>) -> SqlResult<ConnectionAttempt> {
    let id: String = row.get(0)?;
    let logs_raw: Option<String> = row.get(9)?;
    let created_raw: Option<String> = row.get(10)?;
    let connected_raw: Option<String> = row.get(11)?;

    let logs = decode_logs(&id, logs_raw.as_deref());

    let created_at = match created_raw.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => parse_db_time(s).unwrap_or_else(|| {
            tracing::warn!("Attempt {}: unparseable created_at {:?}", id, s);
            DateTime::<Utc>::default()
        }),
        None => DateTime::<Utc>::default(),
    };

    let connected_at = connected_raw
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| {
            let parsed = parse_db_time(s);
            if parsed.is_none() {
                tracing::warn!("Attempt {}: unparseable connected_at {:?}", id, s);
            }
            parsed
        });

    Ok(ConnectionAttempt {
        kind: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        user: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        pass: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        status: Status::from(row.get::<_, String>(6)?),
        message: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        result: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        logs,
        created_at,
        connected_at,
        id,
    })
}

fn encode_logs(logs: &[String]) -> Result<String, DbError> {
    if logs.is_empty() {
        return Ok("[]".to_string());
    }
    serde_json::to_string(logs).map_err(DbError::EncodeLogs)
}

fn decode_logs(id: &str, raw: Option<&str>) -> Vec<String> {
    let raw = match raw {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Vec::new(),
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!("Attempt {}: unreadable logs, using empty list: {}", id, e);
        Vec::new()
    })
}

fn format_db_time(t: &DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // RFC 3339 with an offset, as older rows were written
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
