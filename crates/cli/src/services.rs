//! Service graph shared by the daemon and one-shot commands

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use keepsake_cache::TieredCache;
use keepsake_core::{system_clock, Layout, RecordStore, SharedClock, SqliteStore, WriteGate};
use keepsake_journal::{
    BackupEngine, BackupKind, OperationLog, RecoveryCoordinator, SnapshotCategory, SnapshotEngine,
};
use tracing::{debug, info};

use crate::config::Config;
use crate::scheduler::{Job, JobRunner};

/// Every component wired to one root directory
pub struct Services {
    pub layout: Layout,
    pub config: Config,
    pub clock: SharedClock,
    pub store: Arc<SqliteStore>,
    pub oplog: OperationLog,
    pub snapshots: SnapshotEngine,
    pub backups: BackupEngine,
    pub recovery: RecoveryCoordinator,
    pub cache: TieredCache,
}

impl Services {
    /// Open the root, reading `config.toml` and the wall clock
    pub fn open(root: &Path) -> Result<Self> {
        let layout = Layout::new(root);
        layout
            .init()
            .with_context(|| format!("Failed to initialize {}", root.display()))?;
        let config = Config::load(&layout.config_file())?;
        Self::with_config(layout, config, system_clock())
    }

    pub fn with_config(layout: Layout, config: Config, clock: SharedClock) -> Result<Self> {
        layout.init()?;

        let store = Arc::new(
            SqliteStore::open(&layout.database_path()).context("Failed to open record store")?,
        );
        store.ensure_schema().context("Failed to prepare record store schema")?;
        let dyn_store: Arc<dyn RecordStore> = store.clone();

        let gate = WriteGate::new();
        let oplog = OperationLog::new(&layout, clock.clone());
        let snapshot_config = config.snapshot_config();

        let recovery = RecoveryCoordinator::new(
            dyn_store.clone(),
            layout.clone(),
            gate.clone(),
            oplog.clone(),
            &[snapshot_config.collections.clone(), snapshot_config.critical.clone()].concat(),
        );
        let snapshots = SnapshotEngine::new(
            dyn_store.clone(),
            layout.clone(),
            clock.clone(),
            oplog.clone(),
            snapshot_config,
        );
        let backups = BackupEngine::new(
            dyn_store,
            layout.clone(),
            clock.clone(),
            gate,
            oplog.clone(),
            config.backup_config(),
        )?;
        let cache = TieredCache::for_layout(&layout, config.cache_config(), clock.clone())?;

        debug!("Services ready at {}", layout.root().display());
        Ok(Self {
            layout,
            config,
            clock,
            store,
            oplog,
            snapshots,
            backups,
            recovery,
            cache,
        })
    }

    /// Record store engine and schema version, for display
    pub fn store_version(&self) -> String {
        self.store
            .format_version()
            .unwrap_or_else(|e| format!("unavailable ({})", e))
    }
}

impl JobRunner for Services {
    fn run(&self, job: Job) -> Result<()> {
        match job {
            Job::Snapshot => {
                let snapshot = self.snapshots.take_snapshot(SnapshotCategory::Autosave)?;
                info!("Autosave {} written", snapshot.info.id);
            }
            Job::Backup => {
                if self.backups.due_for_backup()? {
                    let record = self.backups.backup(BackupKind::Scheduled)?;
                    info!("Scheduled backup {} written", record.path.display());
                } else {
                    debug!("Scheduled backup not due");
                }
            }
            Job::CacheSweep => {
                self.cache.evict_expired();
            }
            Job::CacheOrphans => {
                self.cache.evict_orphans()?;
            }
        }
        Ok(())
    }

    fn emergency(&self) -> Result<()> {
        self.snapshots.take_emergency_snapshot()?;
        Ok(())
    }

    fn final_save(&self) -> Result<()> {
        self.snapshots.take_snapshot(SnapshotCategory::Autosave)?;
        Ok(())
    }
}
