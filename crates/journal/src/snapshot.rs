//! Snapshot engine
//!
//! A snapshot is one self-verifying document per save: the collections
//! read from the record store, their row counts, and metadata carrying
//! the format version and checksum. Each category lives in its own
//! directory and is capped by its own retention policy.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use keepsake_core::retention::{prune, sort_newest_first};
use keepsake_core::store::{scan_artifacts, unique_path, ArtifactKind};
use keepsake_core::{
    atomic_write, integrity, timestamp_id, CollectionSpec, Error, Layout, Record, RecordStore,
    RetentionPolicy, SharedClock, Statement,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::oplog::OperationLog;
use crate::Result;

/// Current snapshot document format
pub const FORMAT_VERSION: u32 = 1;

/// File extension of snapshot artifacts
pub const SNAPSHOT_EXT: &str = ".snapshot";

/// Plain-text recovery note written next to emergency snapshots
pub const RECOVERY_NOTE: &str = "recovery.readme";

/// Snapshot category; each has its own directory and retention cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotCategory {
    Autosave,
    Manual,
    Scheduled,
    Emergency,
}

impl SnapshotCategory {
    pub const ALL: [Self; 4] = [Self::Autosave, Self::Manual, Self::Scheduled, Self::Emergency];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autosave => "autosave",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Emergency => "emergency",
        }
    }

    /// Storage directory of this category
    pub fn dir(&self, layout: &Layout) -> PathBuf {
        match self {
            Self::Autosave => layout.autosave_dir(),
            Self::Manual => layout.manual_save_dir(),
            Self::Scheduled => layout.scheduled_save_dir(),
            Self::Emergency => layout.emergency_dir(),
        }
    }
}

impl fmt::Display for SnapshotCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown snapshot category: {s}")))
    }
}

/// `metadata` section of a snapshot document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub category: SnapshotCategory,
    pub checksum: Option<String>,
}

/// On-disk snapshot document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub timestamp: DateTime<Utc>,
    pub statistics: BTreeMap<String, usize>,
    pub data: BTreeMap<String, Vec<Record>>,
    pub metadata: SnapshotMetadata,
}

/// Directory listing entry for a snapshot artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: String,
    pub category: SnapshotCategory,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A snapshot that was just written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub info: SnapshotInfo,
    pub checksum: String,
    pub statistics: BTreeMap<String, usize>,
}

/// Snapshot engine settings
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Collections captured by regular snapshots
    pub collections: Vec<CollectionSpec>,
    /// Bounded subset captured on the emergency path
    pub critical: Vec<CollectionSpec>,
    pub keep_autosave: usize,
    pub keep_manual: usize,
    pub keep_scheduled: usize,
    pub keep_emergency: usize,
    /// Upper bound on the emergency path
    pub emergency_budget: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            collections: CollectionSpec::full_set(),
            critical: CollectionSpec::critical_set(),
            keep_autosave: 50,
            keep_manual: 20,
            keep_scheduled: 50,
            keep_emergency: 10,
            emergency_budget: Duration::from_secs(5),
        }
    }
}

impl SnapshotConfig {
    /// Retention cap of `category`
    pub fn retention(&self, category: SnapshotCategory) -> RetentionPolicy {
        RetentionPolicy::KeepCount(match category {
            SnapshotCategory::Autosave => self.keep_autosave,
            SnapshotCategory::Manual => self.keep_manual,
            SnapshotCategory::Scheduled => self.keep_scheduled,
            SnapshotCategory::Emergency => self.keep_emergency,
        })
    }

    fn collections_for(&self, category: SnapshotCategory) -> &[CollectionSpec] {
        match category {
            SnapshotCategory::Emergency => &self.critical,
            _ => &self.collections,
        }
    }
}

/// Writes snapshots and enforces per-category retention
#[derive(Clone)]
pub struct SnapshotEngine {
    store: Arc<dyn RecordStore>,
    layout: Layout,
    clock: SharedClock,
    oplog: OperationLog,
    config: Arc<SnapshotConfig>,
}

impl SnapshotEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        layout: Layout,
        clock: SharedClock,
        oplog: OperationLog,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            store,
            layout,
            clock,
            oplog,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Write a snapshot of `category` and prune older ones above its cap
    ///
    /// A failed write leaves every prior snapshot untouched; retention
    /// only runs after the new artifact is in place.
    pub fn take_snapshot(&self, category: SnapshotCategory) -> Result<Snapshot> {
        let result = self.write_snapshot(category);
        self.oplog.record(
            category.as_str(),
            result.as_ref().ok().map(|s| s.info.path.as_path()),
            &result,
        );

        let snapshot = result?;
        self.enforce_retention(category);
        Ok(snapshot)
    }

    /// Bounded snapshot for abnormal termination
    ///
    /// Captures only the critical subset, writes the recovery note, and
    /// gives up with [`Error::Timeout`] once the emergency budget is spent.
    /// The worker thread may still finish in the background; its artifact
    /// is complete or absent, never truncated.
    pub fn take_emergency_snapshot(&self) -> Result<Snapshot> {
        let budget = self.config.emergency_budget;
        let (tx, rx) = crossbeam_channel::bounded(1);

        let engine = self.clone();
        std::thread::Builder::new()
            .name("keepsake-emergency".to_string())
            .spawn(move || {
                let result = engine.write_snapshot(SnapshotCategory::Emergency).and_then(|snapshot| {
                    engine.write_recovery_note(&snapshot)?;
                    Ok(snapshot)
                });
                let _ = tx.send(result);
            })?;

        let result = match rx.recv_timeout(budget) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(budget)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Io(std::io::Error::other(
                "emergency snapshot worker exited without a result",
            ))),
        };

        self.oplog.record(
            SnapshotCategory::Emergency.as_str(),
            result.as_ref().ok().map(|s| s.info.path.as_path()),
            &result,
        );

        match &result {
            Ok(snapshot) => {
                info!("Emergency snapshot saved: {}", snapshot.info.path.display());
                self.enforce_retention(SnapshotCategory::Emergency);
            }
            Err(e) => error!("Emergency snapshot failed: {}", e),
        }
        result
    }

    /// Snapshots of `category`, newest first
    pub fn list_snapshots(&self, category: SnapshotCategory) -> Result<Vec<SnapshotInfo>> {
        list_category(&self.layout, category)
    }

    fn write_snapshot(&self, category: SnapshotCategory) -> Result<Snapshot> {
        let data = read_collections(&*self.store, self.config.collections_for(category))?;
        let statistics: BTreeMap<String, usize> =
            data.iter().map(|(name, rows)| (name.clone(), rows.len())).collect();

        let now = self.clock.now();
        let document = SnapshotDocument {
            timestamp: now,
            statistics: statistics.clone(),
            data,
            metadata: SnapshotMetadata {
                version: FORMAT_VERSION,
                timestamp: now,
                category,
                checksum: None,
            },
        };
        let (bytes, digest) = integrity::stamp(&document)?;

        let dir = category.dir(&self.layout);
        fs::create_dir_all(&dir)?;
        let (id, path) = unique_path(&dir, &timestamp_id(now), SNAPSHOT_EXT);
        atomic_write(&self.layout.tmp_dir(), &path, &bytes)?;

        debug!("Wrote {} snapshot {} ({} bytes)", category, id, bytes.len());
        Ok(Snapshot {
            info: SnapshotInfo {
                id,
                category,
                path,
                size: bytes.len() as u64,
                modified: now,
            },
            checksum: digest.to_hex(),
            statistics,
        })
    }

    fn write_recovery_note(&self, snapshot: &Snapshot) -> Result<()> {
        let mut note = String::new();
        note.push_str("Keepsake emergency save\n");
        note.push_str("=======================\n\n");
        note.push_str(&format!("Written:   {}\n", self.clock.now().to_rfc3339()));
        note.push_str(&format!("Snapshot:  {}\n", snapshot.info.path.display()));
        note.push_str(&format!("Checksum:  {}\n\n", snapshot.checksum));
        note.push_str("Rows captured:\n");
        for (name, count) in &snapshot.statistics {
            note.push_str(&format!("  {name}: {count}\n"));
        }
        note.push_str("\nTo recover:\n");
        note.push_str("  1. Stop the application.\n");
        note.push_str(&format!("  2. Run `keepsake verify {}`.\n", snapshot.info.id));
        note.push_str(&format!(
            "  3. Run `keepsake restore {}` to replay the saved rows.\n",
            snapshot.info.id
        ));
        note.push_str("  4. Start the application again.\n");

        let target = snapshot.info.category.dir(&self.layout).join(RECOVERY_NOTE);
        atomic_write(&self.layout.tmp_dir(), &target, note.as_bytes())
    }

    fn enforce_retention(&self, category: SnapshotCategory) {
        let dir = category.dir(&self.layout);
        let candidates = match scan_artifacts(&dir, snapshot_artifacts()) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Retention scan of {} failed: {}", dir.display(), e);
                return;
            }
        };

        let decision = self.config.retention(category).evaluate(candidates);
        if !decision.evict.is_empty() {
            let report = prune(&decision);
            info!(
                "Pruned {} {} snapshots ({} bytes)",
                report.deleted, category, report.bytes_freed
            );
        }
    }
}

fn snapshot_artifacts() -> ArtifactKind<'static> {
    ArtifactKind::File {
        prefix: "",
        ext: SNAPSHOT_EXT,
    }
}

/// Read every collection inside one consistent view of the store
fn read_collections(
    store: &dyn RecordStore,
    collections: &[CollectionSpec],
) -> Result<BTreeMap<String, Vec<Record>>> {
    let statements = collections
        .iter()
        .map(|spec| Ok(Statement::new(spec.select_sql()?, Vec::new())))
        .collect::<keepsake_core::StoreResult<Vec<_>>>()?;

    let results = store.query_batch(&statements)?;
    Ok(collections
        .iter()
        .map(|spec| spec.name.clone())
        .zip(results)
        .collect())
}

/// Snapshots of one category, newest first
pub fn list_category(layout: &Layout, category: SnapshotCategory) -> Result<Vec<SnapshotInfo>> {
    let mut candidates = scan_artifacts(&category.dir(layout), snapshot_artifacts())?;
    sort_newest_first(&mut candidates);

    Ok(candidates
        .into_iter()
        .map(|candidate| SnapshotInfo {
            id: candidate.id,
            category,
            path: candidate.path,
            size: candidate.size,
            modified: DateTime::<Utc>::from(candidate.written_at),
        })
        .collect())
}

/// Find a snapshot by id in any category
pub fn locate(layout: &Layout, id: &str) -> Option<SnapshotInfo> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return None;
    }

    SnapshotCategory::ALL.into_iter().find_map(|category| {
        let path = category.dir(layout).join(format!("{id}{SNAPSHOT_EXT}"));
        let meta = fs::metadata(&path).ok().filter(|meta| meta.is_file())?;
        Some(SnapshotInfo {
            id: id.to_string(),
            category,
            size: meta.len(),
            modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            path,
        })
    })
}
