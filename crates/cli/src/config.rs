//! Configuration file at `<root>/config.toml`
//!
//! Every field has a default, so a missing file or a file naming only a
//! few keys is valid. Values are checked by [`Config::validate`] on load
//! and before every save.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use keepsake_cache::CacheConfig;
use keepsake_core::{atomic_write, CollectionSpec, Layout};
use keepsake_journal::{BackupConfig, SnapshotConfig};
use serde::{Deserialize, Serialize};

use crate::scheduler::Schedule;

/// Environment variable overriding the root directory
pub const ROOT_ENV: &str = "KEEPSAKE_ROOT";

/// Root durability directory: `--root`, then `KEEPSAKE_ROOT`, then the
/// platform data directory
pub fn resolve_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(root) = flag {
        return Ok(root);
    }
    if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    dirs::data_dir()
        .map(|dir| dir.join("keepsake"))
        .context("Could not determine the platform data directory; pass --root")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub snapshot_interval_secs: u64,
    pub backup_check_interval_secs: u64,
    pub cache_sweep_interval_secs: u64,
    pub cache_orphan_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 5 * 60,
            backup_check_interval_secs: 60 * 60,
            cache_sweep_interval_secs: 60 * 60,
            cache_orphan_interval_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub keep_autosave: usize,
    pub keep_manual: usize,
    pub keep_scheduled: usize,
    pub keep_emergency: usize,
    pub emergency_budget_secs: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            keep_autosave: 50,
            keep_manual: 20,
            keep_scheduled: 50,
            keep_emergency: 10,
            emergency_budget_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    pub interval_hours: u64,
    pub keep: usize,
    pub keep_manual: usize,
    pub config_files: Vec<String>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            keep: 30,
            keep_manual: 10,
            config_files: vec!["settings.json".to_string(), "projects.json".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub memory_ttl_secs: u64,
    pub disk_ttl_secs: u64,
    pub hard_ceiling_days: u64,
    pub max_size_mb: u64,
    pub eviction_target: f64,
    pub max_source_size_mb: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            memory_ttl_secs: 60 * 60,
            disk_ttl_secs: 24 * 60 * 60,
            hard_ceiling_days: 7,
            max_size_mb: 100,
            eviction_target: 0.8,
            max_source_size_mb: 100,
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerSection,
    pub snapshot: SnapshotSection,
    pub backup: BackupSection,
    pub cache: CacheSection,
}

impl Config {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let config: Self =
            toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Validate and write atomically to the layout's config file
    pub fn save(&self, layout: &Layout) -> Result<()> {
        self.validate()?;
        let text = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        atomic_write(&layout.tmp_dir(), &layout.config_file(), text.as_bytes())
            .context("Failed to write configuration")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        for (key, value) in [
            ("scheduler.snapshot_interval_secs", s.snapshot_interval_secs),
            ("scheduler.backup_check_interval_secs", s.backup_check_interval_secs),
            ("scheduler.cache_sweep_interval_secs", s.cache_sweep_interval_secs),
            ("scheduler.cache_orphan_interval_secs", s.cache_orphan_interval_secs),
            ("snapshot.emergency_budget_secs", self.snapshot.emergency_budget_secs),
            ("backup.interval_hours", self.backup.interval_hours),
            ("cache.memory_ttl_secs", self.cache.memory_ttl_secs),
            ("cache.disk_ttl_secs", self.cache.disk_ttl_secs),
            ("cache.hard_ceiling_days", self.cache.hard_ceiling_days),
            ("cache.max_size_mb", self.cache.max_size_mb),
            ("cache.max_source_size_mb", self.cache.max_source_size_mb),
        ] {
            if value == 0 {
                bail!("{} must be greater than 0", key);
            }
        }

        for (key, value) in [
            ("snapshot.keep_autosave", self.snapshot.keep_autosave),
            ("snapshot.keep_manual", self.snapshot.keep_manual),
            ("snapshot.keep_scheduled", self.snapshot.keep_scheduled),
            ("snapshot.keep_emergency", self.snapshot.keep_emergency),
            ("backup.keep", self.backup.keep),
            ("backup.keep_manual", self.backup.keep_manual),
        ] {
            if value == 0 {
                bail!("{} must keep at least one artifact", key);
            }
        }

        let target = self.cache.eviction_target;
        if !(target > 0.0 && target <= 1.0) {
            bail!("cache.eviction_target must be in (0, 1], got {}", target);
        }
        if self.cache.memory_ttl_secs > self.cache.disk_ttl_secs {
            bail!("cache.memory_ttl_secs must not exceed cache.disk_ttl_secs");
        }

        Ok(())
    }

    /// Value of a `section.field` key, rendered as TOML
    pub fn get(&self, key: &str) -> Result<String> {
        let table = toml::Value::try_from(self)?;
        let value = lookup(&table, key)?;
        Ok(match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Set a `section.field` key from text, keeping the field's type
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut table = toml::Value::try_from(&*self)?;
        let (section, field) = split_key(key)?;
        let current = lookup(&table, key)?.clone();

        let value = match current {
            toml::Value::Integer(_) => toml::Value::Integer(
                raw.parse::<u64>()
                    .with_context(|| format!("{} expects a non-negative integer", key))?
                    .try_into()
                    .with_context(|| format!("{} is out of range", key))?,
            ),
            toml::Value::Float(_) => toml::Value::Float(
                raw.parse()
                    .with_context(|| format!("{} expects a number", key))?,
            ),
            toml::Value::Boolean(_) => toml::Value::Boolean(
                raw.parse()
                    .with_context(|| format!("{} expects 'true' or 'false'", key))?,
            ),
            toml::Value::Array(_) => toml::Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| toml::Value::String(item.to_string()))
                    .collect(),
            ),
            _ => toml::Value::String(raw.to_string()),
        };

        if let Some(section) = table.get_mut(section).and_then(toml::Value::as_table_mut) {
            section.insert(field.to_string(), value);
        }

        let updated: Self = table.try_into().context("Invalid configuration value")?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Every `section.field` key with its current value
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let table = toml::Value::try_from(self)?;
        let mut entries = Vec::new();
        if let Some(sections) = table.as_table() {
            for (section, fields) in sections {
                if let Some(fields) = fields.as_table() {
                    for (field, value) in fields {
                        entries.push((format!("{}.{}", section, field), value.to_string()));
                    }
                }
            }
        }
        Ok(entries)
    }

    pub fn schedule(&self) -> Schedule {
        let s = &self.scheduler;
        Schedule {
            snapshot: Duration::from_secs(s.snapshot_interval_secs),
            backup: Duration::from_secs(s.backup_check_interval_secs),
            cache_sweep: Duration::from_secs(s.cache_sweep_interval_secs),
            cache_orphans: Duration::from_secs(s.cache_orphan_interval_secs),
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        let s = &self.snapshot;
        SnapshotConfig {
            keep_autosave: s.keep_autosave,
            keep_manual: s.keep_manual,
            keep_scheduled: s.keep_scheduled,
            keep_emergency: s.keep_emergency,
            emergency_budget: Duration::from_secs(s.emergency_budget_secs),
            ..SnapshotConfig::default()
        }
    }

    pub fn backup_config(&self) -> BackupConfig {
        let b = &self.backup;
        BackupConfig {
            keep: b.keep,
            keep_manual: b.keep_manual,
            interval: chrono::Duration::hours(b.interval_hours as i64),
            config_files: b.config_files.clone(),
            collections: CollectionSpec::full_set(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        let c = &self.cache;
        CacheConfig {
            memory_ttl: chrono::Duration::seconds(c.memory_ttl_secs as i64),
            disk_ttl: chrono::Duration::seconds(c.disk_ttl_secs as i64),
            hard_ceiling: chrono::Duration::days(c.hard_ceiling_days as i64),
            max_size: c.max_size_mb * 1024 * 1024,
            eviction_target: c.eviction_target,
            max_source_size: c.max_source_size_mb * 1024 * 1024,
        }
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('.')
        .with_context(|| format!("Config keys look like 'section.field', got '{}'", key))
}

fn lookup<'a>(table: &'a toml::Value, key: &str) -> Result<&'a toml::Value> {
    let (section, field) = split_key(key)?;
    table
        .get(section)
        .and_then(|s| s.get(field))
        .with_context(|| {
            format!(
                "Unknown config key: {}. Use 'keepsake config list' to see available keys.",
                key
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::load(&temp_dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.scheduler.snapshot_interval_secs, 300);
        assert_eq!(config.backup.keep, 30);
        assert_eq!(config.cache.eviction_target, 0.8);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[backup]\nkeep = 5\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backup.keep, 5);
        assert_eq!(config.backup.interval_hours, 24);
        assert_eq!(config.snapshot, SnapshotSection::default());
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = Config::default();
        config.scheduler.snapshot_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.eviction_target = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.snapshot.keep_emergency = 0;
        assert!(config.validate().is_err());

        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\neviction_target = 0.0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_get_and_set() {
        let mut config = Config::default();
        assert_eq!(config.get("backup.keep").unwrap(), "30");

        config.set("backup.keep", "12").unwrap();
        config.set("cache.eviction_target", "0.5").unwrap();
        config.set("backup.config_files", "a.json, b.json").unwrap();

        assert_eq!(config.backup.keep, 12);
        assert_eq!(config.cache.eviction_target, 0.5);
        assert_eq!(config.backup.config_files, vec!["a.json", "b.json"]);

        assert!(config.set("backup.keep", "-1").is_err());
        assert!(config.set("backup.keep", "0").is_err());
        assert!(config.set("backup.nope", "1").is_err());
        assert!(config.get("nodots").is_err());
        assert_eq!(config.backup.keep, 12);
    }

    #[test]
    fn test_save_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp_dir.path());
        layout.init().unwrap();

        let mut config = Config::default();
        config.set("scheduler.snapshot_interval_secs", "60").unwrap();
        config.save(&layout).unwrap();

        let loaded = Config::load(&layout.config_file()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.schedule().snapshot, Duration::from_secs(60));
    }

    #[test]
    fn test_engine_configs_follow_file() {
        let mut config = Config::default();
        config.cache.max_size_mb = 2;
        config.snapshot.keep_autosave = 7;

        assert_eq!(config.cache_config().max_size, 2 * 1024 * 1024);
        assert_eq!(config.cache_config().hard_ceiling, chrono::Duration::days(7));
        assert_eq!(config.snapshot_config().keep_autosave, 7);
        assert_eq!(config.backup_config().interval, chrono::Duration::hours(24));
    }

    #[test]
    fn test_root_flag_wins() {
        let root = resolve_root(Some(PathBuf::from("/tmp/keepsake-root"))).unwrap();
        assert_eq!(root, PathBuf::from("/tmp/keepsake-root"));
    }
}
