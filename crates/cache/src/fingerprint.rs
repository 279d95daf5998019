//! Cache keys derived from file identity

use std::fmt;
use std::fs::Metadata;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use keepsake_core::{hash_bytes, Result};

/// Key of a cached preview
///
/// Derived from the source's path, byte size and modification time, so an
/// edited file is a new entity even when its path is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of the file currently at `path`
    pub fn of_file(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(path, &metadata))
    }

    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Self {
        let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        Self::from_parts(path, metadata.len(), modified)
    }

    pub fn from_parts(path: &Path, size: u64, modified: SystemTime) -> Self {
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let key = format!("{}\0{}\0{}", path.display(), size, nanos);
        Self(hash_bytes(key.as_bytes()).to_hex())
    }

    /// Parse a fingerprint back from a cache file stem
    pub fn from_stem(stem: &str) -> Option<Self> {
        let valid = stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(stem.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::time::Duration;

    #[test]
    fn test_same_identity_same_key() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = Fingerprint::from_parts(Path::new("/data/a.pdf"), 10, at);
        let b = Fingerprint::from_parts(Path::new("/data/a.pdf"), 10, at);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_each_component_changes_key() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let base = Fingerprint::from_parts(Path::new("/data/a.pdf"), 10, at);

        assert_ne!(base, Fingerprint::from_parts(Path::new("/data/b.pdf"), 10, at));
        assert_ne!(base, Fingerprint::from_parts(Path::new("/data/a.pdf"), 11, at));
        assert_ne!(
            base,
            Fingerprint::from_parts(Path::new("/data/a.pdf"), 10, at + Duration::from_secs(1))
        );
    }

    #[test]
    fn test_touching_file_changes_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("drawing.png");
        std::fs::write(&path, b"pixels").unwrap();

        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        let before = Fingerprint::of_file(&path).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_600_000_100, 0)).unwrap();
        let after = Fingerprint::of_file(&path).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_from_stem() {
        let key = Fingerprint::from_parts(Path::new("x"), 1, UNIX_EPOCH);
        assert_eq!(Fingerprint::from_stem(key.as_str()), Some(key));
        assert_eq!(Fingerprint::from_stem("not-a-key"), None);
        assert_eq!(Fingerprint::from_stem(&"g".repeat(64)), None);
    }
}
