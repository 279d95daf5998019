//! Retention policies for artifact directories
//!
//! A policy is a pure function over a candidate list: it partitions the
//! candidates into `keep` and `evict` without touching the filesystem.
//! [`prune`] applies a decision by deleting the evicted artifacts.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

/// One artifact considered for retention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Identifier (file or directory name without extension)
    pub id: String,
    /// Location on disk
    pub path: PathBuf,
    /// Size in bytes (recursive for directories)
    pub size: u64,
    /// Creation/write time used for recency ordering
    pub written_at: SystemTime,
}

/// Retention cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the N most recent candidates
    KeepCount(usize),
    /// Keep the most recent candidates whose cumulative size fits the budget
    KeepBytes(u64),
}

/// Disjoint partition produced by [`RetentionPolicy::evaluate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// Candidates to keep, newest first
    pub keep: Vec<Candidate>,
    /// Candidates to delete, newest first
    pub evict: Vec<Candidate>,
}

impl RetentionPolicy {
    /// Partition `candidates` into keep/evict
    ///
    /// Candidates are ordered newest first by write time (ties broken by
    /// id, descending) before the cap is applied, so callers may pass
    /// them in any order. A byte budget keeps the longest run of newest
    /// candidates that fits; once one candidate does not fit, it and
    /// every older candidate are evicted, so no newer entry is ever
    /// evicted while an older one survives.
    pub fn evaluate(&self, mut candidates: Vec<Candidate>) -> Decision {
        sort_newest_first(&mut candidates);

        let keep_len = match *self {
            Self::KeepCount(cap) => cap.min(candidates.len()),
            Self::KeepBytes(budget) => {
                let mut total = 0u64;
                candidates
                    .iter()
                    .take_while(|c| {
                        total = total.saturating_add(c.size);
                        total <= budget
                    })
                    .count()
            }
        };

        let evict = candidates.split_off(keep_len);
        Decision {
            keep: candidates,
            evict,
        }
    }
}

/// Sort candidates newest first
///
/// Equal write times fall back to the id, where a collision suffix
/// (`<stem>-N`) compares numerically, so `-10` is newer than `-9`.
pub fn sort_newest_first(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.written_at
            .cmp(&a.written_at)
            .then_with(|| id_order_key(&b.id).cmp(&id_order_key(&a.id)))
    });
}

/// Split `<stem>-N` into its stem and counter; ids without one count as 0
fn id_order_key(id: &str) -> (&str, u64) {
    match id.rsplit_once('-') {
        Some((stem, counter))
            if !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()) =>
        {
            match counter.parse() {
                Ok(n) => (stem, n),
                Err(_) => (id, 0),
            }
        }
        _ => (id, 0),
    }
}

/// Outcome of applying a decision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Artifacts deleted
    pub deleted: usize,
    /// Bytes released
    pub bytes_freed: u64,
    /// Artifacts that could not be deleted
    pub failed: usize,
}

/// Delete every evicted candidate
///
/// Deletion failures are logged and counted, never propagated: a
/// retention pass must not fail the operation that triggered it.
pub fn prune(decision: &Decision) -> PruneReport {
    let mut report = PruneReport::default();

    for candidate in &decision.evict {
        match remove_artifact(&candidate.path) {
            Ok(()) => {
                debug!("Retention removed {}", candidate.path.display());
                report.deleted += 1;
                report.bytes_freed += candidate.size;
            }
            Err(e) => {
                warn!("Retention failed to remove {}: {}", candidate.path.display(), e);
                report.failed += 1;
            }
        }
    }

    report
}

fn remove_artifact(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn candidate(index: u64, size: u64) -> Candidate {
        Candidate {
            id: format!("artifact-{index:03}"),
            path: PathBuf::from(format!("/tmp/artifact-{index:03}")),
            size,
            written_at: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 + index),
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_count_cap_keeps_newest() {
        // Deliberately shuffled input
        let input = vec![candidate(2, 1), candidate(5, 1), candidate(1, 1), candidate(4, 1), candidate(3, 1)];
        let decision = RetentionPolicy::KeepCount(3).evaluate(input);

        assert_eq!(ids(&decision.keep), vec!["artifact-005", "artifact-004", "artifact-003"]);
        assert_eq!(ids(&decision.evict), vec!["artifact-002", "artifact-001"]);
    }

    #[test]
    fn test_equal_times_order_collision_suffix_numerically() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(5_000);
        let named = |id: &str| Candidate {
            id: id.to_string(),
            path: PathBuf::from(format!("/tmp/{id}")),
            size: 1,
            written_at: at,
        };
        let stem = "2026-05-04T10-00-00-000Z";
        let mut input = vec![
            named(&format!("{stem}-9")),
            named(stem),
            named(&format!("{stem}-10")),
            named(&format!("{stem}-2")),
        ];

        sort_newest_first(&mut input);
        assert_eq!(
            ids(&input),
            vec![
                format!("{stem}-10").as_str(),
                format!("{stem}-9").as_str(),
                format!("{stem}-2").as_str(),
                stem,
            ]
        );

        let decision = RetentionPolicy::KeepCount(1).evaluate(input);
        assert_eq!(ids(&decision.keep), vec![format!("{stem}-10").as_str()]);
    }

    #[test]
    fn test_count_cap_at_or_above_len_keeps_all() {
        let input: Vec<_> = (0..4).map(|i| candidate(i, 1)).collect();
        let decision = RetentionPolicy::KeepCount(4).evaluate(input.clone());
        assert_eq!(decision.keep.len(), 4);
        assert!(decision.evict.is_empty());

        let decision = RetentionPolicy::KeepCount(10).evaluate(input);
        assert_eq!(decision.keep.len(), 4);
        assert!(decision.evict.is_empty());
    }

    #[test]
    fn test_count_cap_zero_evicts_all() {
        let input: Vec<_> = (0..3).map(|i| candidate(i, 1)).collect();
        let decision = RetentionPolicy::KeepCount(0).evaluate(input);
        assert!(decision.keep.is_empty());
        assert_eq!(decision.evict.len(), 3);
    }

    #[test]
    fn test_byte_budget_evicts_oldest_only() {
        // Sizes oldest -> newest: 40, 10, 30, 20, 25 (total 125)
        let input = vec![
            candidate(1, 40),
            candidate(2, 10),
            candidate(3, 30),
            candidate(4, 20),
            candidate(5, 25),
        ];
        let decision = RetentionPolicy::KeepBytes(80).evaluate(input);

        // 25 + 20 + 30 = 75 fits, adding 10 would be 85
        assert_eq!(ids(&decision.keep), vec!["artifact-005", "artifact-004", "artifact-003"]);
        // The small older entry is evicted too: nothing newer than a survivor goes
        assert_eq!(ids(&decision.evict), vec!["artifact-002", "artifact-001"]);

        let kept: u64 = decision.keep.iter().map(|c| c.size).sum();
        assert!(kept <= 80);
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let input: Vec<_> = (0..10).map(|i| candidate(i, i * 3)).collect();
        let decision = RetentionPolicy::KeepBytes(50).evaluate(input);
        assert_eq!(decision.keep.len() + decision.evict.len(), 10);
        for kept in &decision.keep {
            assert!(!decision.evict.contains(kept));
        }
    }

    #[test]
    fn test_prune_deletes_files_and_directories() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("old.snapshot");
        let nested = dir.path().join("old_backup");
        std::fs::write(&file, b"12345")?;
        std::fs::create_dir_all(nested.join("inner"))?;
        std::fs::write(nested.join("inner/db.artifact"), b"1")?;

        let decision = Decision {
            keep: vec![],
            evict: vec![
                Candidate { id: "old".into(), path: file.clone(), size: 5, written_at: SystemTime::now() },
                Candidate { id: "old_backup".into(), path: nested.clone(), size: 1, written_at: SystemTime::now() },
                Candidate { id: "gone".into(), path: dir.path().join("gone"), size: 9, written_at: SystemTime::now() },
            ],
        };

        let report = prune(&decision);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.bytes_freed, 6);
        assert_eq!(report.failed, 1);
        assert!(!file.exists());
        assert!(!nested.exists());
        Ok(())
    }
}
