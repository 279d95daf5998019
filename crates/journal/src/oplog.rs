//! Bounded operational log of snapshot, backup and restore attempts
//!
//! Kept separate from diagnostic logging: this file is the durable audit
//! trail an operator reads after a crash. Recording never fails the
//! operation being recorded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keepsake_core::{atomic_write, Layout, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Entries kept; older ones are dropped on overflow
pub const MAX_ENTRIES: usize = 100;

/// Host description attached to each entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub platform: String,
    pub arch: String,
    pub version: String,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One recorded attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: Option<PathBuf>,
    pub success: bool,
    pub error: Option<String>,
    pub system_info: SystemInfo,
}

/// Append-only JSON list at `<root>/backup_log.json`
#[derive(Clone)]
pub struct OperationLog {
    path: PathBuf,
    tmp_dir: PathBuf,
    clock: SharedClock,
    write_lock: Arc<Mutex<()>>,
}

impl OperationLog {
    pub fn new(layout: &Layout, clock: SharedClock) -> Self {
        Self {
            path: layout.oplog_path(),
            tmp_dir: layout.tmp_dir(),
            clock,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Record one attempt
    pub fn append(&self, kind: &str, path: Option<&Path>, error: Option<String>) {
        let entry = OperationEntry {
            timestamp: self.clock.now(),
            kind: kind.to_string(),
            path: path.map(Path::to_path_buf),
            success: error.is_none(),
            error,
            system_info: SystemInfo::current(),
        };

        let _guard = self.write_lock.lock();
        let mut entries = self.entries();
        entries.push(entry);
        if entries.len() > MAX_ENTRIES {
            entries.drain(..entries.len() - MAX_ENTRIES);
        }

        let written = serde_json::to_vec_pretty(&entries)
            .map_err(keepsake_core::Error::from)
            .and_then(|bytes| atomic_write(&self.tmp_dir, &self.path, &bytes));
        if let Err(e) = written {
            warn!("Failed to record {} in operation log: {}", kind, e);
        }
    }

    /// Record the outcome of a fallible operation
    pub fn record<T>(&self, kind: &str, path: Option<&Path>, result: &keepsake_core::Result<T>) {
        self.append(kind, path, result.as_ref().err().map(ToString::to_string));
    }

    /// All entries, oldest first; an unreadable log reads as empty
    pub fn entries(&self) -> Vec<OperationEntry> {
        std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    /// The newest `limit` entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<OperationEntry> {
        self.entries().into_iter().rev().take(limit).collect()
    }
}
