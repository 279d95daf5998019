//! Start the Keepsake daemon

use anyhow::{Context, Result};
use keepsake_cli::{daemon, locks};
use keepsake_core::Layout;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

pub async fn run(root: &Path, foreground: bool) -> Result<()> {
    if foreground {
        daemon::run(root).await
    } else {
        start_background(root).await
    }
}

async fn start_background(root: &Path) -> Result<()> {
    let layout = Layout::new(root);
    layout.init()?;

    if let Some(holder) = locks::running_daemon(&layout) {
        println!("Daemon already running (pid {})", holder.pid);
        return Ok(());
    }

    let log_file = layout.logs_dir().join("daemon.out");
    let exe = std::env::current_exe().context("Failed to get current executable path")?;
    let log_file_writer = std::fs::File::create(&log_file).context("Failed to create log file")?;

    Command::new("nohup")
        .arg(&exe)
        .arg("--root")
        .arg(root)
        .arg("start")
        .arg("--foreground")
        .stdin(Stdio::null())
        .stdout(log_file_writer.try_clone()?)
        .stderr(log_file_writer)
        .spawn()
        .context("Failed to spawn daemon process")?;

    // Give it a moment to take the lock
    tokio::time::sleep(Duration::from_millis(500)).await;

    match locks::running_daemon(&layout) {
        Some(holder) => {
            println!("Daemon started (pid {})", holder.pid);
            println!("Logs: {}", layout.logs_dir().display());
            Ok(())
        }
        None => anyhow::bail!(
            "Daemon failed to start (check logs at {})",
            log_file.display()
        ),
    }
}
