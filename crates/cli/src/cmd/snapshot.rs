//! Snapshot commands: take, list, verify, restore

use anyhow::{bail, Context, Result};
use keepsake_cli::{locks, util, Services};
use keepsake_journal::SnapshotCategory;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run_take(root: &Path, category: SnapshotCategory) -> Result<()> {
    let services = Services::open(root)?;
    let snapshot = services
        .snapshots
        .take_snapshot(category)
        .with_context(|| format!("Failed to take {} snapshot", category))?;

    println!("{} Snapshot {}", "✓".green(), snapshot.info.id.yellow());
    println!("  Path:       {}", snapshot.info.path.display());
    println!("  Size:       {}", util::format_size(snapshot.info.size));
    println!("  Checksum:   {}", snapshot.checksum.dimmed());
    for (collection, count) in &snapshot.statistics {
        println!("  {:<11} {}", format!("{}:", collection), count);
    }
    Ok(())
}

pub async fn run_emergency(root: &Path) -> Result<()> {
    let services = Services::open(root)?;
    let snapshot = services
        .snapshots
        .take_emergency_snapshot()
        .context("Emergency snapshot failed")?;

    println!("{} Emergency snapshot {}", "✓".green(), snapshot.info.id.yellow());
    println!("  Path:       {}", snapshot.info.path.display());
    Ok(())
}

pub async fn run_list(root: &Path, category: Option<SnapshotCategory>, limit: usize) -> Result<()> {
    let services = Services::open(root)?;
    let now = services.clock.now();
    let categories = match category {
        Some(category) => vec![category],
        None => SnapshotCategory::ALL.to_vec(),
    };

    for category in categories {
        let snapshots = services.snapshots.list_snapshots(category)?;
        println!("{} ({})", category.as_str().bold(), snapshots.len());
        if snapshots.is_empty() {
            println!("  {}", "No snapshots".dimmed());
        }
        for info in snapshots.iter().take(limit) {
            println!(
                "  {}  {:>10}  {}",
                info.id.yellow(),
                util::format_size(info.size),
                util::format_relative_time(info.modified, now).dimmed()
            );
        }
        println!();
    }
    Ok(())
}

pub async fn run_verify(root: &Path, id: &str) -> Result<()> {
    let services = Services::open(root)?;
    let (info, document) = services
        .recovery
        .verify(id)
        .with_context(|| format!("Snapshot {} failed verification", id))?;

    println!("{} Snapshot {} is intact", "✓".green(), info.id.yellow());
    println!("  Category:   {}", info.category);
    println!("  Taken:      {}", util::format_absolute_time(document.timestamp));
    for (collection, count) in &document.statistics {
        println!("  {:<11} {}", format!("{}:", collection), count);
    }
    Ok(())
}

pub async fn run_restore(root: &Path, id: &str, yes: bool) -> Result<()> {
    let services = Services::open(root)?;

    // Verify first so a corrupt snapshot is reported before any prompt
    let (info, _) = services
        .recovery
        .verify(id)
        .with_context(|| format!("Snapshot {} failed verification", id))?;

    if locks::running_daemon(&services.layout).is_some() {
        println!(
            "{}",
            "Note: the daemon is running; its next autosave will capture the restored state."
                .yellow()
        );
    }
    if !yes && !util::confirm(&format!("Replay snapshot {} into the record store?", info.id))? {
        bail!("Restore cancelled");
    }

    let report = services.recovery.restore(id)?;
    println!("{} Restored {}", "✓".green(), report.snapshot.id.yellow());
    println!("  Collections: {}", report.collections);
    println!("  Records:     {}", report.records);
    println!("  Rows changed: {}", report.changed);
    Ok(())
}
