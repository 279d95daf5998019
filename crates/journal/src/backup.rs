//! Full-store backups
//!
//! Backups use the record store's native point-in-time copy rather than
//! the snapshot document format. Every attempt, successful or not, is
//! logged as a [`BackupRecord`] in the store's `backup_records` table;
//! the newest successful record decides whether a scheduled backup is due.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use keepsake_core::retention::{prune, sort_newest_first};
use keepsake_core::store::{dir_size, scan_artifacts, sync_parent, unique_path, ArtifactKind};
use keepsake_core::{
    atomic_write, hash_tree, hash_tree_excluding, timestamp_id, Candidate, CollectionSpec, Error,
    Layout, Record, RecordStore, RetentionPolicy, SharedClock, Statement, StoreError, WriteGate,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::oplog::OperationLog;
use crate::Result;

/// Sidecar written into every manual backup directory
pub const BACKUP_INFO: &str = "backup_info.json";

/// Name of the native copy inside a manual backup directory
pub const DATABASE_ARTIFACT: &str = "database.artifact";

const BACKUP_PREFIX: &str = "backup_";
const BACKUP_EXT: &str = ".artifact";

const RECORDS_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS backup_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_type TEXT NOT NULL,
    backup_path TEXT NOT NULL,
    backup_size INTEGER,
    database_version TEXT,
    collection_counts TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    success INTEGER NOT NULL DEFAULT 1,
    error_message TEXT
)";

/// Why a backup was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Scheduled,
    Auto,
    /// Safety copy taken right before a restore overwrites the store
    PreRestore,
}

impl BackupKind {
    pub const ALL: [Self; 4] = [Self::Manual, Self::Scheduled, Self::Auto, Self::PreRestore];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Auto => "auto",
            Self::PreRestore => "pre_restore",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown backup type: {s}")))
    }
}

/// One backup attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// Row id in `backup_records`; 0 when the row could not be written
    pub id: i64,
    pub kind: BackupKind,
    pub path: PathBuf,
    pub size: u64,
    pub format_version: String,
    pub counts: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// `backup_info.json` sidecar of a manual backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub artifact_name: String,
    pub config_files: Vec<String>,
    pub total_size: u64,
    pub directory_checksum: String,
}

/// A completed manual backup directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualBackup {
    pub dir: PathBuf,
    pub info: BackupInfo,
}

/// Backup engine settings
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Native backup artifacts kept in `backups/`
    pub keep: usize,
    /// Manual backup directories kept
    pub keep_manual: usize,
    /// A scheduled backup is due once the last success is older than this
    pub interval: Duration,
    /// Application config files copied from `<root>/config/` into manual backups
    pub config_files: Vec<String>,
    /// Collections counted into each record
    pub collections: Vec<CollectionSpec>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            keep: 30,
            keep_manual: 10,
            interval: Duration::hours(24),
            config_files: vec!["settings.json".to_string(), "projects.json".to_string()],
            collections: CollectionSpec::full_set(),
        }
    }
}

/// Native full-store backups and their record log
#[derive(Clone)]
pub struct BackupEngine {
    store: Arc<dyn RecordStore>,
    layout: Layout,
    clock: SharedClock,
    gate: WriteGate,
    oplog: OperationLog,
    config: Arc<BackupConfig>,
}

impl BackupEngine {
    /// Create the engine, creating the `backup_records` table if needed
    pub fn new(
        store: Arc<dyn RecordStore>,
        layout: Layout,
        clock: SharedClock,
        gate: WriteGate,
        oplog: OperationLog,
        config: BackupConfig,
    ) -> Result<Self> {
        store.run(RECORDS_SCHEMA, &[])?;
        Ok(Self {
            store,
            layout,
            clock,
            gate,
            oplog,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Take a native backup into `backups/backup_<type>_<timestamp>.artifact`
    ///
    /// A record is written whether or not the copy succeeds. On success
    /// the oldest artifacts above the retention cap are deleted.
    pub fn backup(&self, kind: BackupKind) -> Result<BackupRecord> {
        let _gate = self.gate.enter();
        self.backup_locked(kind)
    }

    fn backup_locked(&self, kind: BackupKind) -> Result<BackupRecord> {
        let started_at = self.clock.now();
        let dir = self.layout.backups_dir();
        fs::create_dir_all(&dir)?;

        let stem = format!("{BACKUP_PREFIX}{kind}_{}", timestamp_id(started_at));
        let (_, path) = unique_path(&dir, &stem, BACKUP_EXT);

        let outcome = self.copy_store(&path);
        let record = self.log_attempt(kind, &path, started_at, &outcome);
        self.oplog.record(&format!("backup_{kind}"), Some(&path), &outcome);

        outcome?;
        info!("Backup complete: {} ({} bytes)", path.display(), record.size);
        self.enforce_retention();
        Ok(record)
    }

    /// Whether a scheduled backup should run now
    ///
    /// True when no successful backup exists, or the newest one finished
    /// strictly more than the configured interval ago.
    pub fn due_for_backup(&self) -> Result<bool> {
        let rows = self.store.query(
            "SELECT MAX(end_time) AS last_backup FROM backup_records WHERE success = 1",
            &[],
        )?;

        let last = rows
            .first()
            .and_then(|row| row.get("last_backup"))
            .and_then(Value::as_str)
            .map(parse_time)
            .transpose()?;

        Ok(match last {
            None => true,
            Some(last) => self.clock.now() - last > self.config.interval,
        })
    }

    /// Replace the live store with the artifact at `artifact`
    ///
    /// Refuses missing or empty artifacts, and takes a `pre_restore`
    /// backup first; if that safety copy fails, the live store is left
    /// alone. A failed restore copies the safety backup back. Returns the
    /// record of the safety copy.
    pub fn restore(&self, artifact: &Path) -> Result<BackupRecord> {
        let result = self.restore_inner(artifact);
        self.oplog.record("restore_backup", Some(artifact), &result);
        result
    }

    fn restore_inner(&self, artifact: &Path) -> Result<BackupRecord> {
        let meta = fs::metadata(artifact).map_err(|_| Error::missing(artifact))?;
        if !meta.is_file() {
            return Err(Error::missing(artifact));
        }
        if meta.len() == 0 {
            return Err(Error::Integrity {
                artifact: artifact.display().to_string(),
            });
        }

        let _gate = self.gate.enter();
        let safety = self.backup_locked(BackupKind::PreRestore)?;
        let history = self.store.query("SELECT * FROM backup_records", &[])?;
        if let Err(e) = self.store.restore_from(artifact) {
            self.roll_back(&safety.path);
            return Err(native_error(e));
        }

        // The restored store may predate the record table, and its log
        // stops at the artifact's point in time
        self.store.run(RECORDS_SCHEMA, &[])?;
        self.carry_history(&history)?;

        info!(
            "Restored record store from {} (safety copy at {})",
            artifact.display(),
            safety.path.display()
        );
        Ok(safety)
    }

    /// Create `manual_backup/<timestamp>/` with the native copy, the
    /// application config files and a checksummed sidecar
    ///
    /// The directory is assembled under `tmp/` and renamed into place, so
    /// a listed manual backup is always complete.
    pub fn manual_backup(&self) -> Result<ManualBackup> {
        let result = self.manual_backup_inner();
        self.oplog.record(
            "manual_backup",
            result.as_ref().ok().map(|backup| backup.dir.as_path()),
            &result,
        );

        let backup = result?;
        self.enforce_manual_retention();
        Ok(backup)
    }

    fn manual_backup_inner(&self) -> Result<ManualBackup> {
        let started_at = self.clock.now();
        let root = self.layout.manual_backup_dir();
        fs::create_dir_all(&root)?;
        let (id, dir) = unique_path(&root, &timestamp_id(started_at), "");

        let staging = self.layout.tmp_dir().join(format!("manual_{id}.partial"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        // The record is written once the directory is in place, so a
        // failed rename is never logged as a success
        let database = dir.join(DATABASE_ARTIFACT);
        let outcome = self
            .assemble_manual(&staging, started_at)
            .and_then(|info| {
                fs::rename(&staging, &dir)?;
                sync_parent(&dir);
                Ok(info)
            })
            .and_then(|info| Ok((fs::metadata(&database)?.len(), info)));
        if outcome.is_err() && staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }

        let size = match &outcome {
            Ok((size, _)) => Ok(*size),
            Err(e) => Err(Error::Backup(e.to_string())),
        };
        self.log_attempt(BackupKind::Manual, &database, started_at, &size);

        let (_, info) = outcome?;
        info!("Manual backup complete: {}", dir.display());
        Ok(ManualBackup { dir, info })
    }

    fn assemble_manual(&self, staging: &Path, started_at: DateTime<Utc>) -> Result<BackupInfo> {
        let database = staging.join(DATABASE_ARTIFACT);
        {
            let _gate = self.gate.enter();
            self.store.backup_to(&database).map_err(native_error)?;
        }

        let mut config_files = Vec::new();
        for name in &self.config.config_files {
            let source = self.layout.config_dir().join(name);
            if source.is_file() {
                fs::copy(&source, staging.join(name))?;
                config_files.push(name.clone());
            } else {
                debug!("Config file {} not present, skipping", source.display());
            }
        }

        let info = BackupInfo {
            timestamp: started_at,
            kind: BackupKind::Manual,
            artifact_name: DATABASE_ARTIFACT.to_string(),
            config_files,
            total_size: dir_size(staging),
            directory_checksum: hash_tree(staging)?.to_hex(),
        };
        atomic_write(
            &self.layout.tmp_dir(),
            &staging.join(BACKUP_INFO),
            &serde_json::to_vec_pretty(&info)?,
        )?;
        Ok(info)
    }

    /// Recompute a manual backup's directory checksum against its sidecar
    pub fn verify_manual_backup(&self, dir: &Path) -> Result<bool> {
        let sidecar = dir.join(BACKUP_INFO);
        if !sidecar.is_file() {
            return Err(Error::missing(sidecar));
        }

        let info: BackupInfo = serde_json::from_slice(&fs::read(&sidecar)?)?;
        let actual = hash_tree_excluding(dir, &[BACKUP_INFO])?;
        Ok(actual.to_hex() == info.directory_checksum)
    }

    /// Backup records, newest first
    pub fn list_records(&self, limit: usize) -> Result<Vec<BackupRecord>> {
        let rows = self.store.query(
            "SELECT * FROM backup_records ORDER BY start_time DESC, id DESC LIMIT ?1",
            &[json!(limit)],
        )?;
        rows.iter().map(record_from_row).collect()
    }

    /// Native backup artifacts on disk, newest first
    pub fn list_artifacts(&self) -> Result<Vec<Candidate>> {
        let mut artifacts = scan_artifacts(&self.layout.backups_dir(), backup_artifacts())?;
        sort_newest_first(&mut artifacts);
        Ok(artifacts)
    }

    /// Manual backup directories, newest first
    pub fn list_manual_backups(&self) -> Result<Vec<Candidate>> {
        let mut backups = scan_artifacts(&self.layout.manual_backup_dir(), ArtifactKind::Dir)?;
        sort_newest_first(&mut backups);
        Ok(backups)
    }

    fn copy_store(&self, target: &Path) -> Result<u64> {
        let staged = self.layout.tmp_dir().join(format!(
            "{}.partial",
            target.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));
        fs::create_dir_all(self.layout.tmp_dir())?;
        if staged.exists() {
            fs::remove_file(&staged)?;
        }

        let copied = self
            .store
            .backup_to(&staged)
            .map_err(native_error)
            .and_then(|()| {
                fs::File::open(&staged)?.sync_all()?;
                fs::rename(&staged, target)?;
                sync_parent(target);
                Ok(fs::metadata(target)?.len())
            });

        if copied.is_err() {
            let _ = fs::remove_file(&staged);
        }
        copied
    }

    fn collection_counts(&self) -> Result<BTreeMap<String, u64>> {
        let statements = self
            .config
            .collections
            .iter()
            .map(|spec| {
                let mut count = CollectionSpec::new(spec.name.clone(), spec.table.clone());
                count.filter = spec.filter.clone();
                count.select_sql().map(|sql| {
                    Statement::new(sql.replacen("SELECT *", "SELECT COUNT(*) AS count", 1), Vec::new())
                })
            })
            .collect::<keepsake_core::StoreResult<Vec<_>>>()?;

        let results = self.store.query_batch(&statements)?;
        Ok(self
            .config
            .collections
            .iter()
            .zip(results)
            .map(|(spec, rows)| {
                let count = rows
                    .first()
                    .and_then(|row| row.get("count"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                (spec.name.clone(), count)
            })
            .collect())
    }

    /// Put the pre-restore copy back after a failed restore
    fn roll_back(&self, safety: &Path) {
        match self.store.restore_from(safety) {
            Ok(()) => warn!("Restore failed, live store rolled back to {}", safety.display()),
            Err(e) => error!(
                "Restore failed and rollback from {} failed too: {}",
                safety.display(),
                e
            ),
        }
    }

    /// Re-insert record rows missing after a restore; rows are matched by id
    fn carry_history(&self, history: &[Record]) -> Result<()> {
        const COLUMNS: [&str; 10] = [
            "id",
            "backup_type",
            "backup_path",
            "backup_size",
            "database_version",
            "collection_counts",
            "start_time",
            "end_time",
            "success",
            "error_message",
        ];

        let statements: Vec<Statement> = history
            .iter()
            .map(|row| {
                let params = COLUMNS
                    .iter()
                    .map(|column| row.get(*column).cloned().unwrap_or(Value::Null))
                    .collect();
                Statement::new(
                    format!(
                        "INSERT OR IGNORE INTO backup_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        COLUMNS.join(", ")
                    ),
                    params,
                )
            })
            .collect();

        let carried = self.store.transaction(&statements)?;
        debug!("Carried {} backup records across restore", carried);
        Ok(())
    }

    /// Insert the record row; a failure here is logged, never raised
    fn log_attempt(
        &self,
        kind: BackupKind,
        path: &Path,
        started_at: DateTime<Utc>,
        outcome: &Result<u64>,
    ) -> BackupRecord {
        let counts = self.collection_counts().unwrap_or_else(|e| {
            warn!("Could not count collections for backup record: {}", e);
            BTreeMap::new()
        });
        let format_version = self.store.format_version().unwrap_or_else(|_| "unknown".to_string());

        let mut record = BackupRecord {
            id: 0,
            kind,
            path: path.to_path_buf(),
            size: *outcome.as_ref().unwrap_or(&0),
            format_version,
            counts,
            started_at,
            finished_at: self.clock.now(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
        };

        let inserted = self.store.run(
            "INSERT INTO backup_records
             (backup_type, backup_path, backup_size, database_version, collection_counts,
              start_time, end_time, success, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            &[
                json!(record.kind.as_str()),
                json!(record.path.display().to_string()),
                json!(record.size),
                json!(record.format_version),
                json!(serde_json::to_string(&record.counts).unwrap_or_default()),
                json!(format_time(record.started_at)),
                json!(format_time(record.finished_at)),
                json!(record.success),
                json!(record.error),
            ],
        );
        match inserted {
            Ok(outcome) => record.id = outcome.inserted_id,
            Err(e) => warn!("Failed to log backup record for {}: {}", path.display(), e),
        }
        record
    }

    fn enforce_retention(&self) {
        match scan_artifacts(&self.layout.backups_dir(), backup_artifacts()) {
            Ok(candidates) => {
                let decision = RetentionPolicy::KeepCount(self.config.keep).evaluate(candidates);
                if !decision.evict.is_empty() {
                    let report = prune(&decision);
                    info!("Pruned {} old backups ({} bytes)", report.deleted, report.bytes_freed);
                }
            }
            Err(e) => warn!("Backup retention scan failed: {}", e),
        }
    }

    fn enforce_manual_retention(&self) {
        match scan_artifacts(&self.layout.manual_backup_dir(), ArtifactKind::Dir) {
            Ok(candidates) => {
                let decision =
                    RetentionPolicy::KeepCount(self.config.keep_manual).evaluate(candidates);
                if !decision.evict.is_empty() {
                    let report = prune(&decision);
                    info!("Pruned {} old manual backups", report.deleted);
                }
            }
            Err(e) => warn!("Manual backup retention scan failed: {}", e),
        }
    }
}

fn backup_artifacts() -> ArtifactKind<'static> {
    ArtifactKind::File {
        prefix: BACKUP_PREFIX,
        ext: BACKUP_EXT,
    }
}

/// Native backup failures surface as [`Error::Backup`]; disk-full and
/// permission failures keep their own kind
fn native_error(err: StoreError) -> Error {
    match err {
        StoreError::Backup(message) => Error::Backup(message),
        other => Error::Store(other),
    }
}

/// Fixed-width RFC 3339 so text comparison in SQL orders chronologically
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::InvalidArgument(format!("bad timestamp {text:?} in backup_records: {e}")))
}

fn record_from_row(row: &Record) -> Result<BackupRecord> {
    let text = |column: &str| row.get(column).and_then(Value::as_str).unwrap_or_default();

    Ok(BackupRecord {
        id: row.get("id").and_then(Value::as_i64).unwrap_or_default(),
        kind: text("backup_type").parse()?,
        path: PathBuf::from(text("backup_path")),
        size: row.get("backup_size").and_then(Value::as_u64).unwrap_or_default(),
        format_version: text("database_version").to_string(),
        counts: serde_json::from_str(text("collection_counts")).unwrap_or_default(),
        started_at: parse_time(text("start_time"))?,
        finished_at: parse_time(text("end_time"))?,
        success: row.get("success").and_then(Value::as_i64) == Some(1),
        error: row.get("error_message").and_then(Value::as_str).map(str::to_owned),
    })
}
