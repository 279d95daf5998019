//! Stop the Keepsake daemon

use anyhow::Result;
use keepsake_cli::daemon;
use keepsake_core::Layout;
use owo_colors::OwoColorize;
use std::path::Path;

/// `now` takes an emergency snapshot instead of the final autosave
pub async fn run(root: &Path, now: bool) -> Result<()> {
    let layout = Layout::new(root);
    match daemon::stop(&layout, now).await? {
        Some(pid) => println!("{} Daemon stopped (pid {})", "✓".green(), pid),
        None => println!("{}", "Daemon is not running".yellow()),
    }
    Ok(())
}
