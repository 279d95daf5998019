//! Daemon lifecycle management

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keepsake_core::Layout;
use tracing::{error, info, warn};

use crate::locks::{self, DaemonLock};
use crate::scheduler::{JobRunner, Scheduler};
use crate::services::Services;

/// How the daemon was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGHUP: final autosave
    Graceful,
    /// SIGINT or SIGTERM: emergency snapshot
    Emergency(&'static str),
}

/// Run the scheduler in this process until signalled
pub async fn run(root: &Path) -> Result<()> {
    let services = Arc::new(Services::open(root)?);
    let lock = DaemonLock::acquire(&services.layout)?;
    install_panic_hook(Arc::clone(&services));

    let schedule = services.config.schedule();
    let (handle, task) = Scheduler::new(services.clone(), schedule).spawn();
    info!(
        "Keepsake daemon started (pid {}) at {}",
        std::process::id(),
        services.layout.root().display()
    );

    let outcome = match wait_for_signal().await? {
        StopSignal::Graceful => {
            info!("Stop requested; saving final autosave");
            handle.shutdown().await.context("Final autosave failed")
        }
        StopSignal::Emergency(signal) => {
            warn!("Received {}; saving emergency snapshot", signal);
            handle.emergency().await.context("Emergency snapshot failed")
        }
    };

    if let Err(e) = task.await {
        error!("Scheduler task ended abnormally: {}", e);
    }
    lock.release()?;
    info!("Keepsake daemon stopped");
    outcome
}

/// Signal the running daemon and wait for it to exit
///
/// Returns the pid that was stopped, or `None` if no daemon was running.
pub async fn stop(layout: &Layout, emergency: bool) -> Result<Option<u32>> {
    let Some(holder) = locks::running_daemon(layout) else {
        return Ok(None);
    };

    send_stop(holder.pid, emergency)?;

    for _ in 0..100 {
        if locks::running_daemon(layout).is_none() {
            return Ok(Some(holder.pid));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("Daemon (pid {}) did not stop within 10 seconds", holder.pid)
}

#[cfg(unix)]
fn send_stop(pid: u32, emergency: bool) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if emergency { Signal::SIGTERM } else { Signal::SIGHUP };
    kill(Pid::from_raw(pid as i32), signal)
        .with_context(|| format!("Failed to signal daemon (pid {})", pid))
}

#[cfg(not(unix))]
fn send_stop(pid: u32, _emergency: bool) -> Result<()> {
    anyhow::bail!("Stopping the daemon (pid {}) is only supported on unix", pid)
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<StopSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok(StopSignal::Emergency("SIGINT"))
        }
        _ = terminate.recv() => Ok(StopSignal::Emergency("SIGTERM")),
        _ = hangup.recv() => Ok(StopSignal::Graceful),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<StopSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(StopSignal::Emergency("ctrl-c"))
}

/// Take one emergency snapshot on the first panic, then defer to the
/// previous hook
fn install_panic_hook(services: Arc<Services>) {
    let fired = AtomicBool::new(false);
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic| {
        if !fired.swap(true, Ordering::SeqCst) {
            error!("Panic: {}", panic);
            if let Err(e) = services.emergency() {
                error!("Emergency snapshot after panic failed: {:#}", e);
            }
        }
        previous(panic);
    }));
}
