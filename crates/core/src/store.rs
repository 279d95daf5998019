//! On-disk layout of the durability root and crash-safe write helpers

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;
use crate::retention::Candidate;

/// Directory structure under the durability root
///
/// ```text
/// <root>/
///   config.toml
///   backup_log.json
///   databases/records.db
///   config/               application config files copied into manual backups
///   autosave/<id>.snapshot
///   manual_save/<id>.snapshot
///   scheduled_save/<id>.snapshot
///   emergency_save/<id>.snapshot + recovery.readme
///   manual_backup/<id>/{database.artifact, backup_info.json, ...}
///   backups/backup_<type>_<id>.artifact
///   preview_cache/<fingerprint>.cache
///   thumbnails/
///   locks/daemon.lock
///   logs/
///   tmp/                  staging area for write-then-rename
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Describe the layout rooted at `root` without touching the disk
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every directory of the layout
    pub fn init(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.databases_dir(),
            self.config_dir(),
            self.autosave_dir(),
            self.manual_save_dir(),
            self.scheduled_save_dir(),
            self.emergency_dir(),
            self.manual_backup_dir(),
            self.backups_dir(),
            self.preview_cache_dir(),
            self.thumbnails_dir(),
            self.locks_dir(),
            self.logs_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Root durability directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.root.join("databases")
    }

    /// Live record store file
    pub fn database_path(&self) -> PathBuf {
        self.databases_dir().join("records.db")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn oplog_path(&self) -> PathBuf {
        self.root.join("backup_log.json")
    }

    pub fn autosave_dir(&self) -> PathBuf {
        self.root.join("autosave")
    }

    pub fn manual_save_dir(&self) -> PathBuf {
        self.root.join("manual_save")
    }

    pub fn scheduled_save_dir(&self) -> PathBuf {
        self.root.join("scheduled_save")
    }

    pub fn emergency_dir(&self) -> PathBuf {
        self.root.join("emergency_save")
    }

    pub fn manual_backup_dir(&self) -> PathBuf {
        self.root.join("manual_backup")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn preview_cache_dir(&self) -> PathBuf {
        self.root.join("preview_cache")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join("thumbnails")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

/// Atomic write helper
///
/// Writes data to a temporary file in `tmp_dir`, fsyncs it, then renames
/// it over `target`. A crash at any point leaves either the previous
/// file or the complete new one, never a truncated artifact under the
/// final name. `tmp_dir` must be on the same filesystem as `target`.
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    fs::create_dir_all(tmp_dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(tmp_dir)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(target).map_err(|e| e.error)?;

    sync_parent(target);
    Ok(())
}

/// Fsync the directory containing `path` so a rename into it is durable
///
/// Failures are logged; the renamed file itself is already complete.
pub fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!("Failed to sync directory {}: {}", parent.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Timestamp-derived artifact identifier, e.g. `2026-10-16T08-30-00-125Z`
///
/// Fixed width, so lexicographic order equals chronological order.
pub fn timestamp_id(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

/// First free path `dir/<stem><ext>`, appending `-1`, `-2`, ... on collision
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> (String, PathBuf) {
    let mut id = stem.to_string();
    let mut counter = 0u32;
    loop {
        let path = dir.join(format!("{id}{ext}"));
        if !path.exists() {
            return (id, path);
        }
        counter += 1;
        id = format!("{stem}-{counter}");
    }
}

/// Calculate directory size recursively
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// What counts as an artifact when scanning a directory
#[derive(Debug, Clone, Copy)]
pub enum ArtifactKind<'a> {
    /// Regular files named `<prefix>*<ext>`
    File { prefix: &'a str, ext: &'a str },
    /// Subdirectories
    Dir,
}

/// List the artifacts in `dir` as retention candidates
///
/// The id is the file name minus prefix and extension. A missing
/// directory yields an empty list.
pub fn scan_artifacts(dir: &Path, kind: ArtifactKind<'_>) -> Result<Vec<Candidate>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.metadata()?;

        let (id, size) = match kind {
            ArtifactKind::File { prefix, ext } => {
                if !meta.is_file() {
                    continue;
                }
                let Some(id) = name.strip_prefix(prefix).and_then(|s| s.strip_suffix(ext)) else {
                    continue;
                };
                (id.to_string(), meta.len())
            }
            ArtifactKind::Dir => {
                if !meta.is_dir() || name.starts_with('.') {
                    continue;
                }
                (name.clone(), dir_size(&entry.path()))
            }
        };

        candidates.push(Candidate {
            id,
            path: entry.path(),
            size,
            written_at: meta.modified()?,
        });
    }

    Ok(candidates)
}

/// Check that `name` is safe to splice into SQL as an identifier
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_layout_init_creates_structure() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let layout = Layout::new(temp_dir.path().join("root"));
        layout.init()?;

        for dir in [
            layout.autosave_dir(),
            layout.emergency_dir(),
            layout.manual_backup_dir(),
            layout.backups_dir(),
            layout.preview_cache_dir(),
            layout.thumbnails_dir(),
            layout.tmp_dir(),
        ] {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        Ok(())
    }

    #[test]
    fn test_atomic_write_replaces_and_cleans_up() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let tmp = temp_dir.path().join("tmp");
        let target = temp_dir.path().join("artifact.snapshot");

        atomic_write(&tmp, &target, b"first")?;
        atomic_write(&tmp, &target, b"second")?;

        assert_eq!(fs::read(&target)?, b"second");
        assert_eq!(fs::read_dir(&tmp)?.count(), 0, "staging file left behind");
        Ok(())
    }

    #[test]
    fn test_atomic_write_failure_keeps_previous() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let tmp = temp_dir.path().join("tmp");
        let target = temp_dir.path().join("artifact.snapshot");
        atomic_write(&tmp, &target, b"good")?;

        // Renaming onto a path whose parent does not exist fails after staging
        let bad_target = temp_dir.path().join("missing/artifact.snapshot");
        assert!(atomic_write(&tmp, &bad_target, b"new").is_err());

        assert_eq!(fs::read(&target)?, b"good");
        Ok(())
    }

    #[test]
    fn test_sync_parent_tolerates_missing_directory() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let existing = temp_dir.path().join("present.txt");
        fs::write(&existing, b"x")?;

        sync_parent(&existing);
        sync_parent(&temp_dir.path().join("gone").join("file.txt"));
        assert!(existing.exists());
        Ok(())
    }

    #[test]
    fn test_timestamp_id_is_sortable() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(7);
        assert_eq!(timestamp_id(a), "2026-01-02T03-04-05-000Z");
        assert_eq!(timestamp_id(b), "2026-01-02T03-04-05-007Z");
        assert!(timestamp_id(a) < timestamp_id(b));
    }

    #[test]
    fn test_unique_path_appends_counter() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let (id, path) = unique_path(temp_dir.path(), "stamp", ".snapshot");
        assert_eq!(id, "stamp");
        fs::write(&path, b"x")?;

        let (id, path) = unique_path(temp_dir.path(), "stamp", ".snapshot");
        assert_eq!(id, "stamp-1");
        assert_eq!(path, temp_dir.path().join("stamp-1.snapshot"));
        Ok(())
    }

    #[test]
    fn test_scan_artifacts_filters_by_kind() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let dir = temp_dir.path();
        fs::write(dir.join("backup_auto_1.artifact"), b"12")?;
        fs::write(dir.join("backup_auto_2.artifact"), b"1234")?;
        fs::write(dir.join("notes.txt"), b"ignored")?;
        fs::create_dir_all(dir.join("manual_1"))?;
        fs::write(dir.join("manual_1/database.artifact"), b"123")?;

        let mut files = scan_artifacts(dir, ArtifactKind::File { prefix: "backup_", ext: ".artifact" })?;
        files.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].id, "auto_1");
        assert_eq!(files[1].size, 4);

        let dirs = scan_artifacts(dir, ArtifactKind::Dir)?;
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].size, 3);

        assert!(scan_artifacts(&dir.join("absent"), ArtifactKind::Dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("process_files"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("users; DROP TABLE x"));
        assert!(!is_identifier(""));
    }
}
