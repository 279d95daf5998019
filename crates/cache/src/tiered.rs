//! Memory + disk preview cache
//!
//! The memory tier is a concurrent map checked first; the disk tier mirrors
//! it under `<dir>/<fingerprint>.cache` and is written by a background
//! thread. Each tier has its own TTL. Ages are measured from the time an
//! entry was written: a hit never refreshes the disk entry, so disk
//! expiry and size eviction are FIFO by write time.
//!
//! Disk entries start with a fixed header (magic, creation time in unix
//! milliseconds, payload length) so the creation time survives restarts
//! and never depends on filesystem metadata.
//!
//! All mutation of the disk directory goes through one `RwLock`: inserts
//! and reads share it, while `clear_all` and `evict_orphans` take it
//! exclusively. Writes land through a temp file and a rename, so a listing
//! never includes a file mid-write.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, TimeZone, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use dashmap::DashMap;
use keepsake_core::{
    atomic_write, prune, Candidate, Error, Layout, Result, RetentionPolicy, SharedClock,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::fingerprint::Fingerprint;

/// Extension of disk-tier entries
pub const CACHE_EXT: &str = "cache";

const MAGIC: &[u8; 4] = b"KPC1";
const HEADER_LEN: usize = 20;

/// Shared, immutable cached bytes
pub type Payload = Arc<Vec<u8>>;

/// Which tier served a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Memory,
    Disk,
}

/// Expiry and size limits
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory entries older than this are misses
    pub memory_ttl: Duration,
    /// Disk entries older than this are misses
    pub disk_ttl: Duration,
    /// Disk entries older than this are deleted by the orphan sweep
    pub hard_ceiling: Duration,
    /// Disk tier budget that triggers size eviction
    pub max_size: u64,
    /// Fraction of `max_size` size eviction shrinks the tier to
    pub eviction_target: f64,
    /// Largest source file `preview` accepts
    pub max_source_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl: Duration::hours(1),
            disk_ttl: Duration::hours(24),
            hard_ceiling: Duration::days(7),
            max_size: 100 * 1024 * 1024,
            eviction_target: 0.8,
            max_source_size: 100 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    fn eviction_budget(&self) -> u64 {
        (self.max_size as f64 * self.eviction_target) as u64
    }
}

/// Current occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

/// Outcome of [`TieredCache::evict_orphans`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    /// Entries past the hard ceiling
    pub expired: usize,
    /// Entries with an unreadable header
    pub corrupt: usize,
    /// Entries evicted to meet the size target
    pub evicted: usize,
    /// Thumbnails past the hard ceiling
    pub thumbnails: usize,
    pub bytes_freed: u64,
    /// Disk tier size after the sweep
    pub remaining_bytes: u64,
}

/// Outcome of [`TieredCache::clear_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub thumbnails: usize,
}

/// Produces preview bytes for a source file
pub trait PreviewRenderer: Send + Sync {
    fn render(&self, source: &Path) -> Result<Vec<u8>>;
}

impl<F> PreviewRenderer for F
where
    F: Fn(&Path) -> Result<Vec<u8>> + Send + Sync,
{
    fn render(&self, source: &Path) -> Result<Vec<u8>> {
        self(source)
    }
}

struct MemoryEntry {
    payload: Payload,
    created_at: DateTime<Utc>,
}

enum Job {
    Write {
        fingerprint: Fingerprint,
        payload: Payload,
        created_at: DateTime<Utc>,
        generation: u64,
    },
    Flush(Sender<()>),
    Shutdown,
}

struct Shared {
    dir: PathBuf,
    thumbnails: PathBuf,
    config: CacheConfig,
    clock: SharedClock,
    memory: DashMap<Fingerprint, MemoryEntry>,
    disk_lock: RwLock<()>,
    /// Bumped by `clear_all`; queued writes from an older generation are dropped
    generation: AtomicU64,
}

impl Shared {
    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.{}", fingerprint, CACHE_EXT))
    }
}

/// Two-tier cache keyed by [`Fingerprint`]
pub struct TieredCache {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl TieredCache {
    /// Open a cache over `dir`, creating it and `thumbnails` when absent
    pub fn open(
        dir: impl Into<PathBuf>,
        thumbnails: impl Into<PathBuf>,
        config: CacheConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let dir = dir.into();
        let thumbnails = thumbnails.into();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&thumbnails)?;

        let shared = Arc::new(Shared {
            dir,
            thumbnails,
            config,
            clock,
            memory: DashMap::new(),
            disk_lock: RwLock::new(()),
            generation: AtomicU64::new(0),
        });

        let (jobs, queue) = unbounded();
        let worker_shared = Arc::clone(&shared);
        let writer = std::thread::Builder::new()
            .name("keepsake-cache-writer".to_string())
            .spawn(move || run_writer(worker_shared, queue))?;

        debug!("Opened preview cache at {}", shared.dir.display());
        Ok(Self {
            shared,
            jobs,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Open the cache at the layout's preview and thumbnail directories
    pub fn for_layout(layout: &Layout, config: CacheConfig, clock: SharedClock) -> Result<Self> {
        Self::open(layout.preview_cache_dir(), layout.thumbnails_dir(), config, clock)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Disk location of an entry, whether or not it exists
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shared.entry_path(fingerprint)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Payload> {
        self.get_with_tier(fingerprint).map(|(payload, _)| payload)
    }

    /// Look up an entry, reporting which tier served it
    ///
    /// A disk hit is promoted into memory with a fresh memory timestamp.
    pub fn get_with_tier(&self, fingerprint: &Fingerprint) -> Option<(Payload, Tier)> {
        let shared = &self.shared;
        let now = shared.clock.now();

        let in_memory = shared
            .memory
            .get(fingerprint)
            .filter(|entry| now - entry.created_at < shared.config.memory_ttl)
            .map(|entry| Arc::clone(&entry.payload));
        if let Some(payload) = in_memory {
            return Some((payload, Tier::Memory));
        }

        let _guard = shared.disk_lock.read();
        match read_entry(&shared.entry_path(fingerprint)) {
            Ok(Some((created_at, payload))) if now - created_at < shared.config.disk_ttl => {
                let payload = Arc::new(payload);
                shared.memory.insert(
                    fingerprint.clone(),
                    MemoryEntry {
                        payload: Arc::clone(&payload),
                        created_at: now,
                    },
                );
                Some((payload, Tier::Disk))
            }
            Ok(_) => None,
            Err(e) => {
                debug!("Cache read of {} failed: {}", fingerprint, e);
                None
            }
        }
    }

    /// Insert into memory and queue the disk write
    ///
    /// Disk failures are logged by the writer; the memory entry stays.
    pub fn put(&self, fingerprint: Fingerprint, payload: impl Into<Payload>) {
        let payload = payload.into();
        let shared = &self.shared;
        let created_at = shared.clock.now();

        let _guard = shared.disk_lock.read();
        let generation = shared.generation.load(Ordering::SeqCst);
        shared.memory.insert(
            fingerprint.clone(),
            MemoryEntry {
                payload: Arc::clone(&payload),
                created_at,
            },
        );

        let job = Job::Write {
            fingerprint,
            payload,
            created_at,
            generation,
        };
        if self.jobs.send(job).is_err() {
            warn!("Cache writer has stopped; entry kept in memory only");
        }
    }

    /// Block until every queued disk write has been attempted
    pub fn flush(&self) {
        let (ack, done) = bounded(1);
        if self.jobs.send(Job::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Drop memory entries older than the memory TTL
    pub fn evict_expired(&self) -> usize {
        let now = self.shared.clock.now();
        let ttl = self.shared.config.memory_ttl;
        let mut removed = 0;

        self.shared.memory.retain(|_, entry| {
            let keep = now - entry.created_at < ttl;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!("Expired {} memory cache entries", removed);
        }
        removed
    }

    /// Sweep the disk tier
    ///
    /// Entries past the hard ceiling or with a corrupt header are deleted
    /// unconditionally. If the remainder exceeds `max_size`, the oldest
    /// entries are evicted until the tier fits `max_size * eviction_target`.
    /// Stale thumbnails are deleted by modification time.
    pub fn evict_orphans(&self) -> Result<OrphanReport> {
        let shared = &self.shared;
        let config = &shared.config;
        let _guard = shared.disk_lock.write();
        let now = shared.clock.now();
        let mut report = OrphanReport::default();
        let mut candidates = Vec::new();

        for (fingerprint, path, size) in list_entries(&shared.dir)? {
            let created_at = match read_created_at(&path) {
                Ok(created_at) => created_at,
                Err(e) => {
                    warn!("Skipping unreadable cache entry {}: {}", path.display(), e);
                    continue;
                }
            };

            let expired = match created_at {
                Some(created_at) if now - created_at <= config.hard_ceiling => {
                    candidates.push(Candidate {
                        id: fingerprint.to_string(),
                        path,
                        size,
                        written_at: to_system_time(created_at),
                    });
                    continue;
                }
                Some(_) => true,
                None => false,
            };

            match fs::remove_file(&path) {
                Ok(()) => {
                    if expired {
                        report.expired += 1;
                    } else {
                        report.corrupt += 1;
                    }
                    report.bytes_freed += size;
                    shared.memory.remove(&fingerprint);
                }
                Err(e) => warn!("Failed to remove cache entry {}: {}", path.display(), e),
            }
        }

        let total: u64 = candidates.iter().map(|c| c.size).sum();
        report.remaining_bytes = total;
        if total > config.max_size {
            let decision = RetentionPolicy::KeepBytes(config.eviction_budget()).evaluate(candidates);
            let pruned = prune(&decision);
            for candidate in &decision.evict {
                if let Some(fingerprint) = Fingerprint::from_stem(&candidate.id) {
                    shared.memory.remove(&fingerprint);
                }
            }
            report.evicted = pruned.deleted;
            report.bytes_freed += pruned.bytes_freed;
            report.remaining_bytes = total - pruned.bytes_freed;
        }

        report.thumbnails = sweep_thumbnails(&shared.thumbnails, now, config.hard_ceiling)?;

        info!(
            "Cache sweep: {} expired, {} corrupt, {} evicted, {} thumbnails, {} bytes remain",
            report.expired, report.corrupt, report.evicted, report.thumbnails, report.remaining_bytes
        );
        Ok(report)
    }

    /// Delete every disk entry and thumbnail, then empty the memory tier
    pub fn clear_all(&self) -> Result<ClearReport> {
        let shared = &self.shared;
        let _guard = shared.disk_lock.write();
        shared.generation.fetch_add(1, Ordering::SeqCst);

        let disk_entries = remove_files(&shared.dir)?;
        let thumbnails = remove_files(&shared.thumbnails)?;
        let memory_entries = shared.memory.len();
        shared.memory.clear();

        info!(
            "Cleared preview cache: {} memory, {} disk, {} thumbnails",
            memory_entries, disk_entries, thumbnails
        );
        Ok(ClearReport {
            memory_entries,
            disk_entries,
            thumbnails,
        })
    }

    pub fn info(&self) -> CacheInfo {
        let _guard = self.shared.disk_lock.read();
        let (disk_entries, disk_bytes) = match list_entries(&self.shared.dir) {
            Ok(entries) => (entries.len(), entries.iter().map(|(_, _, size)| size).sum()),
            Err(e) => {
                warn!("Failed to list preview cache: {}", e);
                (0, 0)
            }
        };

        CacheInfo {
            memory_entries: self.shared.memory.len(),
            disk_entries,
            disk_bytes,
        }
    }

    /// Preview bytes for `source`, rendering and caching on a miss
    pub fn preview(&self, source: &Path, renderer: &dyn PreviewRenderer) -> Result<Payload> {
        let metadata = fs::metadata(source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::missing(source),
            _ => Error::Io(e),
        })?;

        let limit = self.shared.config.max_source_size;
        if metadata.len() > limit {
            return Err(Error::InvalidArgument(format!(
                "{} is {} bytes; previews are limited to {} bytes",
                source.display(),
                metadata.len(),
                limit
            )));
        }

        let fingerprint = Fingerprint::from_metadata(source, &metadata);
        if let Some(payload) = self.get(&fingerprint) {
            return Ok(payload);
        }

        debug!("Rendering preview for {}", source.display());
        let payload: Payload = Arc::new(renderer.render(source)?);
        self.put(fingerprint, Arc::clone(&payload));
        Ok(payload)
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                warn!("Cache writer panicked");
            }
        }
    }
}

fn run_writer(shared: Arc<Shared>, queue: Receiver<Job>) {
    for job in queue {
        match job {
            Job::Write {
                fingerprint,
                payload,
                created_at,
                generation,
            } => {
                let _guard = shared.disk_lock.read();
                if shared.generation.load(Ordering::SeqCst) != generation {
                    continue;
                }
                let bytes = encode_entry(created_at, &payload);
                if let Err(e) = atomic_write(&shared.dir, &shared.entry_path(&fingerprint), &bytes) {
                    warn!("Failed to persist cache entry {}: {}", fingerprint, e);
                }
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
            Job::Shutdown => break,
        }
    }
}

fn encode_entry(created_at: DateTime<Utc>, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&created_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Parse a header into (creation time, payload length)
fn decode_header(header: &[u8]) -> Option<(DateTime<Utc>, u64)> {
    if header.len() < HEADER_LEN || &header[..4] != MAGIC {
        return None;
    }
    let millis = i64::from_le_bytes(header[4..12].try_into().ok()?);
    let len = u64::from_le_bytes(header[12..20].try_into().ok()?);
    Some((Utc.timestamp_millis_opt(millis).single()?, len))
}

/// Read a whole entry; `None` when absent or malformed
fn read_entry(path: &Path) -> io::Result<Option<(DateTime<Utc>, Vec<u8>)>> {
    let mut bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let Some((created_at, len)) = decode_header(&bytes) else {
        return Ok(None);
    };
    if (bytes.len() - HEADER_LEN) as u64 != len {
        return Ok(None);
    }
    bytes.drain(..HEADER_LEN);
    Ok(Some((created_at, bytes)))
}

/// Creation time from the header alone; `None` when malformed
fn read_created_at(path: &Path) -> io::Result<Option<DateTime<Utc>>> {
    let mut header = [0u8; HEADER_LEN];
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    Ok(decode_header(&header)
        .filter(|(_, len)| size == HEADER_LEN as u64 + len)
        .map(|(created_at, _)| created_at))
}

/// Every `<fingerprint>.cache` file with its size
fn list_entries(dir: &Path) -> io::Result<Vec<(Fingerprint, PathBuf, u64)>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(CACHE_EXT) {
            continue;
        }
        let Some(fingerprint) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(Fingerprint::from_stem)
        else {
            continue;
        };
        let size = entry.metadata()?.len();
        entries.push((fingerprint, path, size));
    }
    Ok(entries)
}

/// Delete thumbnails whose modification time is past `ceiling`
fn sweep_thumbnails(dir: &Path, now: DateTime<Utc>, ceiling: Duration) -> io::Result<usize> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let cutoff = to_system_time(now - ceiling);
    let mut removed = 0;
    for entry in read_dir {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() || metadata.modified()? >= cutoff {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove thumbnail {}: {}", entry.path().display(), e),
        }
    }
    Ok(removed)
}

/// Delete every regular file in `dir`, counting all but hidden temp files
fn remove_files(dir: &Path) -> io::Result<usize> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let counted = !entry.file_name().to_string_lossy().starts_with('.');
        match fs::remove_file(&path) {
            Ok(()) if counted => removed += 1,
            Ok(()) => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

fn to_system_time(at: DateTime<Utc>) -> SystemTime {
    UNIX_EPOCH + StdDuration::from_millis(at.timestamp_millis().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use keepsake_core::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn open_cache(root: &Path, config: CacheConfig, clock: &ManualClock) -> TieredCache {
        TieredCache::open(
            root.join("preview_cache"),
            root.join("thumbnails"),
            config,
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    fn key(n: u64) -> Fingerprint {
        Fingerprint::from_parts(Path::new(&format!("/sources/{n}.pdf")), n, UNIX_EPOCH)
    }

    #[test]
    fn test_memory_ttl_boundary() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = CacheConfig {
            memory_ttl: Duration::seconds(60),
            disk_ttl: Duration::hours(1),
            ..CacheConfig::default()
        };
        let cache = open_cache(temp_dir.path(), config, &clock);

        cache.put(key(1), b"preview".to_vec());
        cache.flush();

        clock.set(start() + Duration::seconds(59));
        let (payload, tier) = cache.get_with_tier(&key(1)).unwrap();
        assert_eq!(payload.as_slice(), b"preview");
        assert_eq!(tier, Tier::Memory);

        clock.set(start() + Duration::seconds(61));
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.info().memory_entries, 0);

        // Falls through to the disk tier and is promoted
        let (_, tier) = cache.get_with_tier(&key(1)).unwrap();
        assert_eq!(tier, Tier::Disk);
        let (_, tier) = cache.get_with_tier(&key(1)).unwrap();
        assert_eq!(tier, Tier::Memory);
    }

    #[test]
    fn test_memory_lookup_expires_without_sweep() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = CacheConfig {
            memory_ttl: Duration::seconds(60),
            disk_ttl: Duration::hours(1),
            ..CacheConfig::default()
        };
        let cache = open_cache(temp_dir.path(), config, &clock);

        cache.put(key(1), b"preview".to_vec());
        cache.flush();
        // Only the memory tier can answer from here on
        fs::remove_file(cache.entry_path(&key(1))).unwrap();

        clock.set(start() + Duration::seconds(59));
        let (payload, tier) = cache.get_with_tier(&key(1)).unwrap();
        assert_eq!(payload.as_slice(), b"preview");
        assert_eq!(tier, Tier::Memory);

        clock.set(start() + Duration::seconds(61));
        assert!(cache.get(&key(1)).is_none());
        // Still resident until a sweep, but never served
        assert_eq!(cache.info().memory_entries, 1);
        assert!(cache.get(&key(1)).is_none());
    }

    #[test]
    fn test_disk_ttl_boundary() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = CacheConfig {
            memory_ttl: Duration::seconds(10),
            disk_ttl: Duration::hours(1),
            ..CacheConfig::default()
        };

        {
            let cache = open_cache(temp_dir.path(), config.clone(), &clock);
            cache.put(key(1), b"preview".to_vec());
            cache.flush();
        }

        clock.set(start() + Duration::seconds(3599));
        let cache = open_cache(temp_dir.path(), config.clone(), &clock);
        let (_, tier) = cache.get_with_tier(&key(1)).unwrap();
        assert_eq!(tier, Tier::Disk);
        drop(cache);

        // The promotion above did not refresh the disk entry's age
        clock.set(start() + Duration::seconds(3601));
        let cache = open_cache(temp_dir.path(), config, &clock);
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.entry_path(&key(1)).exists());
    }

    #[test]
    fn test_disk_entry_has_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        cache.put(key(7), vec![9u8; 32]);
        cache.flush();

        let bytes = fs::read(cache.entry_path(&key(7))).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 32);
        assert_eq!(&bytes[..4], MAGIC);
        let (created_at, len) = decode_header(&bytes).unwrap();
        assert_eq!(created_at, start());
        assert_eq!(len, 32);
    }

    #[test]
    fn test_disk_failure_keeps_memory_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        let dir = temp_dir.path().join("preview_cache");
        fs::remove_dir_all(&dir).unwrap();
        fs::write(&dir, b"not a directory").unwrap();

        cache.put(key(1), b"preview".to_vec());
        cache.flush();

        let (payload, tier) = cache.get_with_tier(&key(1)).unwrap();
        assert_eq!(payload.as_slice(), b"preview");
        assert_eq!(tier, Tier::Memory);
    }

    #[test]
    fn test_size_eviction_removes_oldest_to_target() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = CacheConfig {
            max_size: 1000,
            ..CacheConfig::default()
        };
        let cache = open_cache(temp_dir.path(), config, &clock);

        // 10 entries of 120 bytes on disk each
        for n in 0..10 {
            cache.put(key(n), vec![n as u8; 100]);
            clock.advance(Duration::minutes(1));
        }
        cache.flush();
        assert_eq!(cache.info().disk_bytes, 1200);

        let report = cache.evict_orphans().unwrap();
        assert_eq!(report.evicted, 4);
        assert_eq!(report.bytes_freed, 480);
        assert_eq!(report.remaining_bytes, 720);
        assert!(report.remaining_bytes <= 800);

        for n in 0..4 {
            assert!(!cache.entry_path(&key(n)).exists());
            assert!(cache.get(&key(n)).is_none());
        }
        for n in 4..10 {
            assert!(cache.entry_path(&key(n)).exists());
            assert!(cache.get(&key(n)).is_some());
        }
        assert_eq!(cache.info().disk_bytes, 720);
    }

    #[test]
    fn test_under_budget_sweep_evicts_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = CacheConfig {
            max_size: 1000,
            ..CacheConfig::default()
        };
        let cache = open_cache(temp_dir.path(), config, &clock);

        for n in 0..8 {
            cache.put(key(n), vec![0u8; 100]);
        }
        cache.flush();

        // 960 bytes: above the 800 target but below the limit
        let report = cache.evict_orphans().unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(cache.info().disk_entries, 8);
    }

    #[test]
    fn test_hard_ceiling_deletes_regardless_of_size() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        cache.put(key(1), b"old".to_vec());
        clock.advance(Duration::days(6));
        cache.put(key(2), b"new".to_vec());
        cache.flush();

        clock.advance(Duration::days(1) + Duration::minutes(1));
        let report = cache.evict_orphans().unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 0);
        assert!(!cache.entry_path(&key(1)).exists());
        assert!(cache.entry_path(&key(2)).exists());
        assert_eq!(cache.info().memory_entries, 1);
    }

    #[test]
    fn test_corrupt_entry_removed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        let path = cache.entry_path(&key(3));
        fs::write(&path, b"garbage").unwrap();
        assert!(cache.get(&key(3)).is_none());

        let report = cache.evict_orphans().unwrap();
        assert_eq!(report.corrupt, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_thumbnails_swept_by_mtime() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        let thumbnails = temp_dir.path().join("thumbnails");
        let stale = thumbnails.join("stale.png");
        let fresh = thumbnails.join("fresh.png");
        fs::write(&stale, b"x").unwrap();
        fs::write(&fresh, b"y").unwrap();
        let now = start().timestamp();
        filetime::set_file_mtime(&stale, FileTime::from_unix_time(now - 8 * 86_400, 0)).unwrap();
        filetime::set_file_mtime(&fresh, FileTime::from_unix_time(now - 86_400, 0)).unwrap();

        let report = cache.evict_orphans().unwrap();
        assert_eq!(report.thumbnails, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_clear_all() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        for n in 0..3 {
            cache.put(key(n), vec![1u8; 10]);
        }
        cache.flush();
        fs::write(temp_dir.path().join("thumbnails").join("t.png"), b"t").unwrap();

        let report = cache.clear_all().unwrap();
        assert_eq!(
            report,
            ClearReport {
                memory_entries: 3,
                disk_entries: 3,
                thumbnails: 1,
            }
        );
        assert!(cache.get(&key(0)).is_none());
        assert_eq!(cache.info(), CacheInfo::default());
    }

    #[test]
    fn test_queued_write_dropped_after_clear() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        cache.put(key(1), vec![1u8; 10]);
        cache.clear_all().unwrap();
        cache.flush();

        assert_eq!(cache.info().disk_entries, 0);
        assert!(cache.get(&key(1)).is_none());
    }

    #[test]
    fn test_get_during_clear_never_sees_partial_payload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = Arc::new(open_cache(temp_dir.path(), CacheConfig::default(), &clock));

        let workers: Vec<_> = (0..4u64)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for round in 0..200u64 {
                        let n = worker * 1000 + round % 20;
                        cache.put(key(n), vec![(n % 251) as u8; 256]);
                        if let Some(payload) = cache.get(&key(n)) {
                            assert_eq!(payload.len(), 256);
                            assert!(payload.iter().all(|&b| b == (n % 251) as u8));
                        }
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            cache.clear_all().unwrap();
        }
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_preview_renders_once_per_fingerprint() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        let source = temp_dir.path().join("report.pdf");
        fs::write(&source, b"version one").unwrap();

        let calls = AtomicUsize::new(0);
        let renderer = |path: &Path| -> Result<Vec<u8>> {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut preview = b"preview:".to_vec();
            preview.extend(fs::read(path)?);
            Ok(preview)
        };

        let first = cache.preview(&source, &renderer).unwrap();
        let second = cache.preview(&source, &renderer).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        fs::write(&source, b"version two, longer").unwrap();
        let third = cache.preview(&source, &renderer).unwrap();
        assert_eq!(third.as_slice(), b"preview:version two, longer");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_preview_rejects_oversized_and_missing_sources() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = CacheConfig {
            max_source_size: 4,
            ..CacheConfig::default()
        };
        let cache = open_cache(temp_dir.path(), config, &clock);
        let renderer = |_: &Path| -> Result<Vec<u8>> { Ok(Vec::new()) };

        let source = temp_dir.path().join("big.bin");
        fs::write(&source, b"0123456789").unwrap();
        assert!(matches!(
            cache.preview(&source, &renderer),
            Err(Error::InvalidArgument(_))
        ));

        let missing = temp_dir.path().join("missing.bin");
        assert!(matches!(
            cache.preview(&missing, &renderer),
            Err(Error::NotFound(_))
        ));
        assert_eq!(cache.info().memory_entries, 0);
    }

    #[test]
    fn test_renderer_failure_caches_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let cache = open_cache(temp_dir.path(), CacheConfig::default(), &clock);

        let source = temp_dir.path().join("doc.txt");
        fs::write(&source, b"text").unwrap();
        let renderer =
            |_: &Path| -> Result<Vec<u8>> { Err(Error::InvalidArgument("unsupported".into())) };

        assert!(cache.preview(&source, &renderer).is_err());
        cache.flush();
        assert_eq!(cache.info(), CacheInfo::default());
    }
}
