//! Record store contract and its SQLite implementation
//!
//! The durability layer treats the application database as an opaque
//! record store: statements in, ordered rows out. Rows travel as JSON
//! objects (column name to value) so snapshots can embed them directly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::backup::Backup;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags, TransactionBehavior};
use serde_json::{Map, Number, Value};
use tracing::{debug, info};

use crate::store::is_identifier;

/// One row: column name to value
pub type Record = Map<String, Value>;

/// Errors reported by a record store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record store not found: {0}")]
    NotFound(String),

    #[error("record store permission denied: {0}")]
    PermissionDenied(String),

    #[error("record store disk full: {0}")]
    DiskFull(String),

    #[error("native backup failed: {0}")]
    Backup(String),

    #[error("query failed: {0}")]
    Query(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        match &err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(message),
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DiskFull => Self::DiskFull(message),
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    Self::PermissionDenied(message)
                }
                ErrorCode::CannotOpen => Self::NotFound(message),
                _ => Self::Query(message),
            },
            _ => Self::Query(message),
        }
    }
}

/// Result of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Row id of the last insert on this connection
    pub inserted_id: i64,
    /// Rows changed by the statement
    pub changed: usize,
}

/// A statement with its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Contract consumed by the snapshot, backup and recovery engines
pub trait RecordStore: Send + Sync {
    /// Run a read statement and collect its rows
    fn query(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Record>>;

    /// Run a write statement
    fn run(&self, sql: &str, params: &[Value]) -> StoreResult<RunOutcome>;

    /// Run several reads against one consistent point-in-time view
    fn query_batch(&self, statements: &[Statement]) -> StoreResult<Vec<Vec<Record>>>;

    /// Apply several writes atomically; returns the total rows changed
    fn transaction(&self, statements: &[Statement]) -> StoreResult<usize>;

    /// Native point-in-time copy of the whole store into `destination`
    fn backup_to(&self, destination: &Path) -> StoreResult<()>;

    /// Replace the live contents with the copy at `source`
    fn restore_from(&self, source: &Path) -> StoreResult<()>;

    /// Engine and schema version recorded alongside backups
    fn format_version(&self) -> StoreResult<String>;
}

/// Serializes backup and replay against the live store
///
/// The native backup primitive and a snapshot replay must never run at
/// the same time. Every engine that does either holds a clone of the
/// same gate.
#[derive(Debug, Clone, Default)]
pub struct WriteGate(Arc<Mutex<()>>);

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other backup or replay is running
    pub fn enter(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }
}

/// Pages copied per step of the online backup
const BACKUP_PAGES_PER_STEP: i32 = 256;

/// Pause between steps so writers on the live store can make progress
const BACKUP_STEP_PAUSE: Duration = Duration::from_millis(2);

/// Record store backed by a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    StoreError::PermissionDenied(e.to_string())
                }
                _ => StoreError::NotFound(e.to_string()),
            })?;
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        debug!("Opened record store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests and dry runs
    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Create the application tables when they are absent
    pub fn ensure_schema(&self) -> StoreResult<()> {
        self.conn.lock().execute_batch(APPLICATION_SCHEMA)?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn query(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Record>> {
        query_on(&self.conn.lock(), sql, params)
    }

    fn run(&self, sql: &str, params: &[Value]) -> StoreResult<RunOutcome> {
        let conn = self.conn.lock();
        let changed = conn.execute(sql, rusqlite::params_from_iter(params.iter().map(to_sql)))?;
        Ok(RunOutcome {
            inserted_id: conn.last_insert_rowid(),
            changed,
        })
    }

    fn query_batch(&self, statements: &[Statement]) -> StoreResult<Vec<Vec<Record>>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(query_on(&tx, &statement.sql, &statement.params)?);
        }

        tx.commit()?;
        Ok(results)
    }

    fn transaction(&self, statements: &[Statement]) -> StoreResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut changed = 0;
        for statement in statements {
            changed += tx.execute(
                &statement.sql,
                rusqlite::params_from_iter(statement.params.iter().map(to_sql)),
            )?;
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit()?;
        Ok(changed)
    }

    fn backup_to(&self, destination: &Path) -> StoreResult<()> {
        let conn = self.conn.lock();
        let mut target = Connection::open(destination).map_err(backup_error)?;

        Backup::new(&conn, &mut target)
            .and_then(|backup| {
                backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_STEP_PAUSE, None)
            })
            .map_err(backup_error)?;

        info!("Native backup written to {}", destination.display());
        Ok(())
    }

    fn restore_from(&self, source: &Path) -> StoreResult<()> {
        if !source.is_file() {
            return Err(StoreError::NotFound(source.display().to_string()));
        }

        let source_conn = Connection::open_with_flags(
            source,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // The live database is only overwritten by a source that checks clean
        let source_verdict: String = source_conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(backup_error)?;
        if source_verdict != "ok" {
            return Err(StoreError::Backup(format!(
                "backup source failed integrity check: {source_verdict}"
            )));
        }

        let mut conn = self.conn.lock();
        Backup::new(&source_conn, &mut conn)
            .and_then(|backup| {
                backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_STEP_PAUSE, None)
            })
            .map_err(backup_error)?;

        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(StoreError::Backup(format!(
                "restored database failed integrity check: {verdict}"
            )));
        }

        info!("Record store restored from {}", source.display());
        Ok(())
    }

    fn format_version(&self) -> StoreResult<String> {
        let user_version: i64 = self
            .conn
            .lock()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(format!("sqlite-{}/schema-{}", rusqlite::version(), user_version))
    }
}

fn query_on(conn: &Connection, sql: &str, params: &[Value]) -> StoreResult<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(to_sql)))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.clone(), from_sql(row.get_ref(index)?));
        }
        records.push(record);
    }

    Ok(records)
}

/// Keep disk-full and permission failures distinct, everything else is a
/// backup failure
fn backup_error(err: rusqlite::Error) -> StoreError {
    match StoreError::from(err) {
        StoreError::Query(message) | StoreError::NotFound(message) => StoreError::Backup(message),
        other => other,
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(hex::encode(blob)),
    }
}

/// What one snapshot collection reads from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Key of the collection inside the snapshot document
    pub name: String,
    /// Source table
    pub table: String,
    /// Optional `WHERE` clause body
    pub filter: Option<String>,
    /// Optional `ORDER BY` clause body
    pub order_by: Option<String>,
    /// Row cap
    pub limit: Option<usize>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            filter: None,
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The `SELECT` statement for this collection
    pub fn select_sql(&self) -> StoreResult<String> {
        if !is_identifier(&self.table) {
            return Err(StoreError::Query(format!("invalid table name: {:?}", self.table)));
        }

        let mut sql = format!("SELECT * FROM {}", self.table);
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        if let Some(order_by) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        Ok(sql)
    }

    /// Everything a regular snapshot captures
    pub fn full_set() -> Vec<Self> {
        vec![
            Self::new("projects", "projects").filter("deleted = 0").order_by("id"),
            Self::new("files", "process_files").filter("deleted = 0").order_by("id"),
            Self::new("nodes", "schedule_nodes").filter("deleted = 0").order_by("id"),
            Self::new("settings", "user_settings").order_by("id"),
            Self::new("auditLogs", "audit_logs")
                .order_by("created_at DESC, id DESC")
                .limit(1000),
        ]
    }

    /// Bounded subset written on the emergency path
    pub fn critical_set() -> Vec<Self> {
        vec![
            Self::new("projects", "projects")
                .filter("deleted = 0")
                .order_by("updated_at DESC, id DESC")
                .limit(100),
            Self::new("recentFiles", "process_files")
                .filter("deleted = 0")
                .order_by("upload_date DESC, id DESC")
                .limit(50),
            Self::new("userSettings", "user_settings").order_by("id").limit(10),
        ]
    }
}

const APPLICATION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_code TEXT UNIQUE NOT NULL,
    project_name TEXT NOT NULL,
    project_type TEXT,
    department TEXT,
    start_date DATE,
    end_date DATE,
    status TEXT DEFAULT 'active',
    budget REAL,
    manager TEXT,
    description TEXT,
    tags TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    deleted INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS process_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    file_name TEXT NOT NULL,
    original_name TEXT,
    file_path TEXT NOT NULL,
    file_type TEXT NOT NULL,
    file_size INTEGER,
    file_hash TEXT,
    upload_date DATETIME DEFAULT CURRENT_TIMESTAMP,
    preview_path TEXT,
    thumbnail_path TEXT,
    metadata TEXT,
    deleted INTEGER DEFAULT 0,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS schedule_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    parent_id INTEGER,
    node_name TEXT NOT NULL,
    node_type TEXT NOT NULL,
    planned_start_date DATE,
    planned_end_date DATE,
    status TEXT DEFAULT 'pending',
    completion_rate INTEGER DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    deleted INTEGER DEFAULT 0,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS user_settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT UNIQUE NOT NULL,
    user_name TEXT NOT NULL,
    role TEXT DEFAULT 'user',
    theme TEXT DEFAULT 'light',
    preferences TEXT,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT,
    action_type TEXT NOT NULL,
    action_target TEXT,
    target_id INTEGER,
    details TEXT,
    success INTEGER DEFAULT 1,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

PRAGMA user_version = 1;
"#;
