//! Snapshot, backup and recovery engines
//!
//! This crate provides:
//! - Checksummed snapshots of the record store, per category
//! - The bounded emergency snapshot path
//! - Native full-store backups with a BackupRecord log
//! - Manual backup directories with a checksummed sidecar
//! - Verified, idempotent snapshot replay
//! - The bounded operational log

pub mod backup;
pub mod oplog;
pub mod recovery;
pub mod snapshot;

// Re-exports
pub use backup::{BackupConfig, BackupEngine, BackupInfo, BackupKind, BackupRecord, ManualBackup};
pub use oplog::{OperationEntry, OperationLog, SystemInfo};
pub use recovery::{RecoveryCoordinator, RestoreReport};
pub use snapshot::{
    Snapshot, SnapshotCategory, SnapshotConfig, SnapshotDocument, SnapshotEngine, SnapshotInfo,
    SnapshotMetadata,
};

/// Result type for journal operations
pub type Result<T> = keepsake_core::Result<T>;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use keepsake_core::{Layout, ManualClock, RecordStore, SqliteStore};
    use serde_json::json;

    use crate::oplog::OperationLog;

    pub struct Fixture {
        // Held so the directory outlives the test
        pub _temp_dir: tempfile::TempDir,
        pub layout: Layout,
        pub store: Arc<SqliteStore>,
        pub clock: ManualClock,
        pub oplog: OperationLog,
    }

    pub fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp_dir.path().join("root"));
        layout.init().unwrap();

        let store = Arc::new(SqliteStore::open(&layout.database_path()).unwrap());
        store.ensure_schema().unwrap();

        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        let oplog = OperationLog::new(&layout, Arc::new(clock.clone()));
        Fixture {
            _temp_dir: temp_dir,
            layout,
            store,
            clock,
            oplog,
        }
    }

    /// Insert `count` projects with strictly increasing `updated_at`
    pub fn seed_projects(store: &SqliteStore, count: usize) {
        for i in 0..count {
            store
                .run(
                    "INSERT INTO projects (project_code, project_name, updated_at) VALUES (?1, ?2, ?3)",
                    &[
                        json!(format!("P-{i:04}")),
                        json!(format!("Project {i}")),
                        json!(format!("2026-01-01 00:{:02}:{:02}", i / 60, i % 60)),
                    ],
                )
                .unwrap();
        }
    }
}
