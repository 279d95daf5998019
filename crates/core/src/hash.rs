//! BLAKE3 hashing primitives for payload and directory-tree checksums

use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A BLAKE3 hash (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Blake3Hash([u8; 32]);

impl Blake3Hash {
    /// Create a new Blake3Hash from bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the hash as a byte slice
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, as stored in artifact metadata
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64 character hex string
    pub fn from_hex(text: &str) -> Result<Self> {
        if text.len() != 64 {
            return Err(Error::InvalidArgument(format!(
                "invalid digest length: expected 64 characters, got {}",
                text.len()
            )));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| Error::InvalidArgument(format!("invalid digest: {e}")))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blake3Hash({})", self.to_hex())
    }
}

impl std::fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash bytes using BLAKE3
pub fn hash_bytes(data: &[u8]) -> Blake3Hash {
    Blake3Hash::from_bytes(*blake3::hash(data).as_bytes())
}

/// Hash a file using BLAKE3 (streaming for large files)
pub fn hash_file(path: &Path) -> Result<Blake3Hash> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = IncrementalHasher::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Hash a directory tree
///
/// Children are visited sorted by name, so the digest depends only on
/// names and contents, never on the order the filesystem enumerates
/// entries. Each child folds its name and its own digest into the
/// running hash: files contribute the hash of their raw bytes,
/// subdirectories contribute their recursive tree hash. Hidden entries
/// (leading `.`) and symlinks are skipped.
pub fn hash_tree(root: &Path) -> Result<Blake3Hash> {
    hash_tree_excluding(root, &[])
}

/// Same as [`hash_tree`], skipping the named top-level entries
///
/// Used for directories that carry a sidecar describing their own
/// checksum.
pub fn hash_tree_excluding(root: &Path, excluded: &[&str]) -> Result<Blake3Hash> {
    if !root.is_dir() {
        return Err(Error::missing(root));
    }
    hash_dir(root, excluded)
}

fn hash_dir(dir: &Path, excluded: &[&str]) -> Result<Blake3Hash> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || excluded.contains(&name.as_str()) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    let mut hasher = IncrementalHasher::new();
    for name in names {
        let path = dir.join(&name);
        let file_type = fs::symlink_metadata(&path)?.file_type();

        let digest = if file_type.is_dir() {
            hash_dir(&path, &[])?
        } else if file_type.is_file() {
            hash_file(&path)?
        } else {
            continue;
        };

        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(digest.as_bytes());
    }

    Ok(hasher.finalize())
}

/// Incremental hasher for building hashes across multiple chunks
pub struct IncrementalHasher {
    inner: blake3::Hasher,
}

impl IncrementalHasher {
    /// Create a new incremental hasher
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Update the hash with more data
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the hash
    pub fn finalize(self) -> Blake3Hash {
        Blake3Hash::from_bytes(*self.inner.finalize().as_bytes())
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}
