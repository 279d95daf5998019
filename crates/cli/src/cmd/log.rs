//! Show the operation log

use anyhow::Result;
use keepsake_cli::{util, Services};
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(root: &Path, limit: usize) -> Result<()> {
    let services = Services::open(root)?;
    let entries = services.oplog.recent(limit);

    if entries.is_empty() {
        println!("{}", "No operations recorded".dimmed());
        return Ok(());
    }

    for entry in entries {
        let marker = if entry.success {
            "✓".green().to_string()
        } else {
            "✗".red().to_string()
        };
        println!(
            "{} {}  {:<18} {}",
            marker,
            util::format_absolute_time(entry.timestamp).dimmed(),
            entry.kind.cyan(),
            entry
                .path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        if let Some(error) = entry.error {
            println!("    {}", error.red());
        }
    }
    Ok(())
}
