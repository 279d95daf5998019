//! Initialize a Keepsake root

use anyhow::Result;
use keepsake_cli::Services;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(root: &Path) -> Result<()> {
    let services = Services::open(root)?;
    let layout = &services.layout;

    let config_path = layout.config_file();
    let created_config = !config_path.exists();
    if created_config {
        services.config.save(layout)?;
    }

    println!("{} Keepsake root at {}", "✓".green(), root.display().to_string().cyan());
    println!();
    println!("Layout:");
    println!("  - databases/records.db   (record store)");
    println!("  - autosave/              (periodic snapshots)");
    println!("  - manual_save/           (on-demand snapshots)");
    println!("  - scheduled_save/        (scheduled snapshots)");
    println!("  - emergency_save/        (snapshots taken on abnormal exit)");
    println!("  - backups/               (native store backups)");
    println!("  - manual_backup/         (full backups with sidecar)");
    println!("  - preview_cache/         (cached previews)");
    println!();
    if created_config {
        println!("Wrote default configuration to {}", config_path.display());
    }
    println!("Next steps:");
    println!("  - Run 'keepsake start' to begin automatic snapshots");
    println!("  - Run 'keepsake status' to check durability status");
    Ok(())
}
