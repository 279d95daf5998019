//! Show daemon, snapshot, backup and cache status

use anyhow::Result;
use keepsake_cli::{locks, util, Services};
use keepsake_journal::SnapshotCategory;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(root: &Path) -> Result<()> {
    let services = Services::open(root)?;
    let now = services.clock.now();

    util::print_header("Keepsake Status");
    println!("Root:          {}", root.display().to_string().cyan());
    println!("Store:         {}", services.store_version());
    println!();

    print!("Daemon:        ");
    match locks::running_daemon(&services.layout) {
        Some(holder) => {
            println!("{}", "Running ✓".green());
            println!("  PID:         {}", holder.pid);
            println!(
                "  Started:     {}",
                util::format_relative_time(holder.started_at, now)
            );
        }
        None => {
            println!("{}", "Not running".yellow());
            println!("  {}", "Tip: Start with 'keepsake start'".dimmed());
        }
    }
    println!();

    println!("Snapshots:");
    for category in SnapshotCategory::ALL {
        let snapshots = services.snapshots.list_snapshots(category)?;
        match snapshots.first() {
            Some(latest) => println!(
                "  {:<12} {:>3} kept, latest {} ({})",
                category.as_str(),
                snapshots.len(),
                latest.id.yellow(),
                util::format_relative_time(latest.modified, now).dimmed()
            ),
            None => println!("  {:<12} {}", category.as_str(), "none".dimmed()),
        }
    }
    println!();

    println!("Backups:");
    match services.backups.list_records(1)?.first() {
        Some(record) if record.success => println!(
            "  Last:        {} {} ({})",
            record.kind.cyan(),
            util::format_relative_time(record.finished_at, now),
            util::format_size(record.size).dimmed()
        ),
        Some(record) => println!(
            "  Last:        {} {} ({})",
            record.kind.cyan(),
            "failed".red(),
            record.error.as_deref().unwrap_or("unknown error")
        ),
        None => println!("  Last:        {}", "never".dimmed()),
    }
    let due = services.backups.due_for_backup()?;
    println!(
        "  Due:         {}",
        if due { "yes".yellow().to_string() } else { "no".green().to_string() }
    );
    println!();

    let cache = services.cache.info();
    println!("Preview cache:");
    println!("  Disk:        {} entries, {}", cache.disk_entries, util::format_size(cache.disk_bytes));
    println!();

    let failures = services
        .oplog
        .recent(20)
        .into_iter()
        .filter(|entry| !entry.success)
        .count();
    if failures > 0 {
        println!(
            "{}",
            format!("Note: {} of the last 20 operations failed; see 'keepsake log'", failures)
                .yellow()
        );
    }

    Ok(())
}
