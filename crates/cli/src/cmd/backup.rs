//! Backup commands: run, list, manual, verify, restore

use anyhow::{bail, Context, Result};
use keepsake_cli::{util, Services};
use keepsake_journal::BackupKind;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run_backup(root: &Path, kind: BackupKind) -> Result<()> {
    let services = Services::open(root)?;
    let record = services
        .backups
        .backup(kind)
        .with_context(|| format!("{} backup failed", kind))?;

    println!("{} Backup written", "✓".green());
    println!("  Path:       {}", record.path.display());
    println!("  Size:       {}", util::format_size(record.size));
    println!("  Store:      {}", record.format_version);
    Ok(())
}

pub async fn run_list(root: &Path, limit: usize) -> Result<()> {
    let services = Services::open(root)?;
    let records = services.backups.list_records(limit)?;
    let now = services.clock.now();

    util::print_header("Backup Records");
    if records.is_empty() {
        println!("  {}", "No backups yet".dimmed());
    }
    for record in records {
        let status = if record.success {
            "ok".green().to_string()
        } else {
            "failed".red().to_string()
        };
        println!(
            "{:>5}  {:<11} {:<6} {:>10}  {}",
            record.id,
            record.kind.to_string(),
            status,
            util::format_size(record.size),
            util::format_relative_time(record.finished_at, now).dimmed()
        );
        match record.error {
            Some(error) => println!("       {}", error.red()),
            None => println!("       {}", record.path.display().to_string().dimmed()),
        }
    }
    Ok(())
}

pub async fn run_manual(root: &Path) -> Result<()> {
    let services = Services::open(root)?;
    let backup = services.backups.manual_backup().context("Manual backup failed")?;

    println!("{} Manual backup {}", "✓".green(), backup.dir.display());
    println!("  Artifact:   {}", backup.info.artifact_name);
    if !backup.info.config_files.is_empty() {
        println!("  Config:     {}", backup.info.config_files.join(", "));
    }
    println!("  Size:       {}", util::format_size(backup.info.total_size));
    println!("  Checksum:   {}", backup.info.directory_checksum.dimmed());
    Ok(())
}

pub async fn run_verify(root: &Path, dir: &Path) -> Result<()> {
    let services = Services::open(root)?;
    if services.backups.verify_manual_backup(dir)? {
        println!("{} {} matches its recorded checksum", "✓".green(), dir.display());
        Ok(())
    } else {
        bail!("{} does not match its recorded checksum", dir.display())
    }
}

pub async fn run_restore(root: &Path, artifact: &Path, yes: bool) -> Result<()> {
    let services = Services::open(root)?;

    if !yes
        && !util::confirm(&format!(
            "Replace the live record store with {}? A pre-restore backup is taken first.",
            artifact.display()
        ))?
    {
        bail!("Restore cancelled");
    }

    let safety = services
        .backups
        .restore(artifact)
        .with_context(|| format!("Failed to restore {}", artifact.display()))?;

    println!("{} Restored {}", "✓".green(), artifact.display());
    println!("  Pre-restore backup: {}", safety.path.display());
    Ok(())
}
