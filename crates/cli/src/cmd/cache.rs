//! Preview cache commands: info, sweep, clear

use anyhow::{bail, Result};
use keepsake_cli::{util, Services};
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run_info(root: &Path) -> Result<()> {
    let services = Services::open(root)?;
    let info = services.cache.info();
    let config = services.cache.config();

    util::print_header("Preview Cache");
    println!("Location:      {}", services.layout.preview_cache_dir().display());
    println!("Disk entries:  {}", info.disk_entries);
    println!(
        "Disk size:     {} of {}",
        util::format_size(info.disk_bytes),
        util::format_size(config.max_size)
    );
    println!(
        "TTL:           {}h memory, {}h disk, {}d ceiling",
        config.memory_ttl.num_hours(),
        config.disk_ttl.num_hours(),
        config.hard_ceiling.num_days()
    );
    Ok(())
}

pub async fn run_sweep(root: &Path) -> Result<()> {
    let services = Services::open(root)?;
    let report = services.cache.evict_orphans()?;

    println!("{} Cache swept", "✓".green());
    println!("  Expired:    {}", report.expired);
    println!("  Corrupt:    {}", report.corrupt);
    println!("  Evicted:    {}", report.evicted);
    println!("  Thumbnails: {}", report.thumbnails);
    println!("  Freed:      {}", util::format_size(report.bytes_freed));
    println!("  Remaining:  {}", util::format_size(report.remaining_bytes));
    Ok(())
}

pub async fn run_clear(root: &Path, yes: bool) -> Result<()> {
    let services = Services::open(root)?;
    if !yes && !util::confirm("Delete every cached preview and thumbnail?")? {
        bail!("Clear cancelled");
    }

    let report = services.cache.clear_all()?;
    println!(
        "{} Removed {} cache entries and {} thumbnails",
        "✓".green(),
        report.disk_entries,
        report.thumbnails
    );
    Ok(())
}
