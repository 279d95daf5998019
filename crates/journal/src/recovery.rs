//! Verified snapshot replay
//!
//! Restoring is the one path that fails loudly: a missing snapshot, a
//! corrupt one and a failed replay are distinct errors, and nothing is
//! written to the live store unless the artifact verifies first.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use keepsake_core::store::is_identifier;
use keepsake_core::{
    integrity, CollectionSpec, Error, Layout, Record, RecordStore, Statement, WriteGate,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::oplog::OperationLog;
use crate::snapshot::{self, SnapshotDocument, SnapshotInfo, FORMAT_VERSION};
use crate::Result;

/// What a restore replayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub snapshot: SnapshotInfo,
    pub collections: usize,
    pub records: usize,
    pub changed: usize,
}

/// Locates, verifies and replays snapshots
#[derive(Clone)]
pub struct RecoveryCoordinator {
    store: Arc<dyn RecordStore>,
    layout: Layout,
    gate: WriteGate,
    oplog: OperationLog,
    /// Collection name to table, in replay order
    tables: Vec<(String, String)>,
}

impl RecoveryCoordinator {
    /// `collections` maps snapshot collection names back to tables; the
    /// first spec for a name wins, and replay follows this order
    pub fn new(
        store: Arc<dyn RecordStore>,
        layout: Layout,
        gate: WriteGate,
        oplog: OperationLog,
        collections: &[CollectionSpec],
    ) -> Self {
        let mut seen = HashSet::new();
        let tables = collections
            .iter()
            .filter(|spec| seen.insert(spec.name.clone()))
            .map(|spec| (spec.name.clone(), spec.table.clone()))
            .collect();

        Self {
            store,
            layout,
            gate,
            oplog,
            tables,
        }
    }

    /// Load and verify a snapshot without touching the store
    pub fn verify(&self, id: &str) -> Result<(SnapshotInfo, SnapshotDocument)> {
        let info = snapshot::locate(&self.layout, id)
            .ok_or_else(|| Error::NotFound(format!("snapshot {id}")))?;

        let payload = fs::read(&info.path)?;
        let verified = integrity::claimed_checksum(&payload)
            .is_some_and(|claimed| integrity::verify(&payload, &claimed));
        if !verified {
            return Err(Error::Integrity {
                artifact: info.path.display().to_string(),
            });
        }

        let document = parse_document(&payload)?;
        Ok((info, document))
    }

    /// Replay snapshot `id` into the record store
    ///
    /// Rows are upserted inside one transaction, so a retried restore
    /// converges to the same state and a failed one changes nothing.
    pub fn restore(&self, id: &str) -> Result<RestoreReport> {
        let result = self.restore_inner(id);
        self.oplog.record(
            "restore_snapshot",
            result.as_ref().ok().map(|report| report.snapshot.path.as_path()),
            &result,
        );
        result
    }

    fn restore_inner(&self, id: &str) -> Result<RestoreReport> {
        let (info, document) = self.verify(id)?;
        let statements = self.replay_statements(&document)?;
        let records = statements.len();

        let changed = {
            let _gate = self.gate.enter();
            self.store
                .transaction(&statements)
                .map_err(|e| Error::Replay(e.to_string()))?
        };

        info!(
            "Restored snapshot {} ({} records across {} collections)",
            info.id,
            records,
            document.data.len()
        );
        Ok(RestoreReport {
            snapshot: info,
            collections: document.data.len(),
            records,
            changed,
        })
    }

    fn replay_statements(&self, document: &SnapshotDocument) -> Result<Vec<Statement>> {
        if let Some(unknown) = document
            .data
            .keys()
            .find(|name| !self.tables.iter().any(|(known, _)| known == *name))
        {
            return Err(Error::Replay(format!("no table known for collection {unknown}")));
        }

        let mut statements = Vec::new();
        for (name, table) in &self.tables {
            let Some(rows) = document.data.get(name) else {
                continue;
            };
            for row in rows {
                if let Some(statement) = upsert(table, row)? {
                    statements.push(statement);
                }
            }
        }
        Ok(statements)
    }
}

/// Parse a verified payload, branching on its format version
fn parse_document(payload: &[u8]) -> Result<SnapshotDocument> {
    let value: Value = serde_json::from_slice(payload)?;
    let version = value
        .pointer("/metadata/version")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::InvalidArgument("snapshot has no format version".to_string()))?;

    match u32::try_from(version) {
        Ok(FORMAT_VERSION) => Ok(serde_json::from_value(value)?),
        Ok(other) => Err(Error::UnsupportedVersion(other)),
        Err(_) => Err(Error::UnsupportedVersion(u32::MAX)),
    }
}

/// `INSERT .. ON CONFLICT DO UPDATE` for one row
///
/// An upsert updates in place; `INSERT OR REPLACE` would delete the old
/// row first and fire `ON DELETE CASCADE` on its children.
fn upsert(table: &str, row: &Record) -> Result<Option<Statement>> {
    if row.is_empty() {
        warn!("Skipping empty row in {}", table);
        return Ok(None);
    }
    if !is_identifier(table) {
        return Err(Error::Replay(format!("invalid table name: {table:?}")));
    }
    if let Some(column) = row.keys().find(|column| !is_identifier(column)) {
        return Err(Error::Replay(format!("invalid column name in {table}: {column:?}")));
    }

    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let assignments: Vec<String> = columns
        .iter()
        .map(|column| format!("\"{column}\" = excluded.\"{column}\""))
        .collect();

    let sql = format!(
        "INSERT INTO \"{table}\" ({}) VALUES ({}) ON CONFLICT DO UPDATE SET {}",
        columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", "),
        placeholders.join(", "),
        assignments.join(", "),
    );
    Ok(Some(Statement::new(sql, row.values().cloned().collect())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SnapshotCategory, SnapshotConfig, SnapshotEngine};
    use crate::test_support::{fixture, seed_projects, Fixture};
    use serde_json::json;

    fn engines(fx: &Fixture) -> (SnapshotEngine, RecoveryCoordinator) {
        let config = SnapshotConfig::default();
        let collections: Vec<CollectionSpec> =
            config.collections.iter().chain(&config.critical).cloned().collect();

        let snapshots = SnapshotEngine::new(
            fx.store.clone(),
            fx.layout.clone(),
            Arc::new(fx.clock.clone()),
            fx.oplog.clone(),
            config,
        );
        let recovery = RecoveryCoordinator::new(
            fx.store.clone(),
            fx.layout.clone(),
            WriteGate::new(),
            fx.oplog.clone(),
            &collections,
        );
        (snapshots, recovery)
    }

    fn dump(store: &dyn RecordStore) -> Vec<Record> {
        let mut rows = store.query("SELECT * FROM projects ORDER BY id", &[]).unwrap();
        rows.extend(store.query("SELECT * FROM process_files ORDER BY id", &[]).unwrap());
        rows
    }

    fn seed_file(store: &dyn RecordStore, project_id: i64) {
        store
            .run(
                "INSERT INTO process_files (project_id, file_name, file_path, file_type) VALUES (?1, 'a.pdf', '/a.pdf', 'pdf')",
                &[json!(project_id)],
            )
            .unwrap();
    }

    #[test]
    fn test_restore_replays_and_is_idempotent() {
        let fx = fixture();
        seed_projects(&fx.store, 3);
        seed_file(&*fx.store, 1);
        let (snapshots, recovery) = engines(&fx);
        let snapshot = snapshots.take_snapshot(SnapshotCategory::Autosave).unwrap();
        let saved = dump(&*fx.store);

        // Damage the live store after the snapshot
        fx.store.run("UPDATE projects SET project_name = 'changed' WHERE id = 2", &[]).unwrap();
        fx.store.run("DELETE FROM projects WHERE id = 3", &[]).unwrap();

        let report = recovery.restore(&snapshot.info.id).unwrap();
        assert_eq!(report.records, 4);
        let first = dump(&*fx.store);
        assert_eq!(first, saved);

        recovery.restore(&snapshot.info.id).unwrap();
        assert_eq!(dump(&*fx.store), first, "second replay duplicated or changed rows");
    }

    #[test]
    fn test_replay_keeps_child_rows() {
        let fx = fixture();
        seed_projects(&fx.store, 1);
        seed_file(&*fx.store, 1);
        let (snapshots, recovery) = engines(&fx);
        let snapshot = snapshots.take_snapshot(SnapshotCategory::Manual).unwrap();

        recovery.restore(&snapshot.info.id).unwrap();
        let files = fx.store.query("SELECT * FROM process_files", &[]).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_snapshot_is_not_found() {
        let fx = fixture();
        let (_, recovery) = engines(&fx);
        let err = recovery.restore("2020-01-01T00-00-00-000Z").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_corrupt_snapshot_leaves_store_untouched() {
        let fx = fixture();
        seed_projects(&fx.store, 2);
        let (snapshots, recovery) = engines(&fx);
        let snapshot = snapshots.take_snapshot(SnapshotCategory::Autosave).unwrap();

        // Flip a row value without updating the checksum
        let text = fs::read_to_string(&snapshot.info.path).unwrap();
        fs::write(&snapshot.info.path, text.replace("Project 1", "Project X")).unwrap();

        fx.store.run("DELETE FROM projects", &[]).unwrap();
        let err = recovery.restore(&snapshot.info.id).unwrap_err();
        assert!(err.is_integrity(), "{err:?}");
        assert!(fx.store.query("SELECT * FROM projects", &[]).unwrap().is_empty());

        let last = fx.oplog.recent(1).remove(0);
        assert_eq!(last.kind, "restore_snapshot");
        assert!(!last.success);
    }

    #[test]
    fn test_real_columns_restore_exactly() {
        let fx = fixture();
        let budgets = [1.8333333333333335, 1.0715660391465826e-75, 0.1 + 0.2];
        for (i, budget) in budgets.iter().enumerate() {
            fx.store
                .run(
                    "INSERT INTO projects (project_code, project_name, budget) VALUES (?1, 'p', ?2)",
                    &[json!(format!("R-{i}")), json!(budget)],
                )
                .unwrap();
        }
        let (snapshots, recovery) = engines(&fx);
        let snapshot = snapshots.take_snapshot(SnapshotCategory::Autosave).unwrap();

        fx.store.run("UPDATE projects SET budget = 0", &[]).unwrap();
        recovery.restore(&snapshot.info.id).unwrap();

        let rows = fx.store.query("SELECT budget FROM projects ORDER BY id", &[]).unwrap();
        let restored: Vec<f64> = rows.iter().map(|r| r["budget"].as_f64().unwrap()).collect();
        assert_eq!(restored, budgets);
    }

    #[test]
    fn test_truncated_snapshot_is_integrity_error() {
        let fx = fixture();
        let (snapshots, recovery) = engines(&fx);
        let snapshot = snapshots.take_snapshot(SnapshotCategory::Autosave).unwrap();

        let bytes = fs::read(&snapshot.info.path).unwrap();
        fs::write(&snapshot.info.path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(recovery.verify(&snapshot.info.id).unwrap_err().is_integrity());
    }

    #[test]
    fn test_future_format_is_rejected() {
        let fx = fixture();
        let (_, recovery) = engines(&fx);

        let document = json!({
            "timestamp": "2026-05-04T10:00:00Z",
            "statistics": {},
            "data": {},
            "metadata": {"version": 2, "timestamp": "2026-05-04T10:00:00Z", "category": "manual", "checksum": null},
        });
        let (bytes, _) = integrity::stamp(&document).unwrap();
        fs::write(fx.layout.manual_save_dir().join("future.snapshot"), bytes).unwrap();

        let err = recovery.restore("future").unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(2)));
    }

    #[test]
    fn test_unknown_collection_is_replay_error() {
        let fx = fixture();
        let collections = vec![CollectionSpec::new("projects", "projects")];
        let recovery = RecoveryCoordinator::new(
            fx.store.clone(),
            fx.layout.clone(),
            WriteGate::new(),
            fx.oplog.clone(),
            &collections,
        );
        let (snapshots, _) = engines(&fx);
        let snapshot = snapshots.take_snapshot(SnapshotCategory::Autosave).unwrap();

        let err = recovery.restore(&snapshot.info.id).unwrap_err();
        assert!(matches!(err, Error::Replay(_)));
    }

    #[test]
    fn test_upsert_rejects_hostile_columns() {
        let mut row = Record::new();
        row.insert("id\" = 1; --".to_string(), json!(1));
        assert!(matches!(upsert("projects", &row), Err(Error::Replay(_))));
    }
}
