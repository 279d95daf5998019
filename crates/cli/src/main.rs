//! Keepsake CLI - keepsake command

use anyhow::Result;
use clap::{Parser, Subcommand};
use keepsake_cli::{config, logging};
use keepsake_core::Layout;
use keepsake_journal::{BackupKind, SnapshotCategory};
use std::path::PathBuf;

mod cmd;

/// Keepsake - snapshots, backups and a preview cache for local records
#[derive(Parser)]
#[command(name = "keepsake")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Durability root (default: $KEEPSAKE_ROOT, then the platform data dir)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the root layout and default configuration
    Init,
    /// Show daemon, snapshot, backup and cache status
    Status,
    /// Start the daemon
    Start {
        /// Run in foreground (for debugging and service managers)
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon
    Stop {
        /// Take an emergency snapshot instead of the final autosave
        #[arg(long)]
        now: bool,
    },
    /// Take a snapshot immediately
    Snapshot {
        /// autosave, manual, scheduled or emergency
        #[arg(long, default_value = "manual")]
        category: SnapshotCategory,
    },
    /// Take a bounded emergency snapshot of the critical collections
    Emergency,
    /// List snapshots, newest first
    List {
        #[arg(long)]
        category: Option<SnapshotCategory>,
        /// Snapshots shown per category
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Check a snapshot's checksum without restoring it
    Verify {
        /// Snapshot ID
        id: String,
    },
    /// Replay a verified snapshot into the record store
    Restore {
        /// Snapshot ID
        id: String,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Native full-store backups
    #[command(subcommand)]
    Backup(BackupCommands),
    /// Preview cache maintenance
    #[command(subcommand)]
    Cache(CacheCommands),
    /// Show recent snapshot, backup and restore attempts
    Log {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// View and edit configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Take a backup now
    Run {
        /// manual, scheduled, auto or pre_restore
        #[arg(long, default_value = "manual")]
        kind: BackupKind,
    },
    /// Show the backup record log
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Full backup directory with config files and checksum sidecar
    Manual,
    /// Check a manual backup directory against its sidecar
    Verify {
        dir: PathBuf,
    },
    /// Replace the live store with a backup artifact
    Restore {
        path: PathBuf,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache occupancy and limits
    Info,
    /// Delete expired, corrupt and over-budget entries
    Sweep,
    /// Delete every cached preview and thumbnail
    Clear {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// List all values
    List,
    /// Print one value
    Get {
        /// section.field
        key: String,
    },
    /// Set one value
    Set {
        /// section.field
        key: String,
        value: String,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = config::resolve_root(cli.root)?;

    let _log_guard = match cli.command {
        Commands::Start { foreground: true } => {
            let layout = Layout::new(&root);
            layout.init()?;
            Some(logging::init_daemon(&layout.logs_dir()))
        }
        _ => {
            logging::init_console(cli.verbose);
            None
        }
    };

    match cli.command {
        Commands::Init => cmd::init::run(&root).await,
        Commands::Status => cmd::status::run(&root).await,
        Commands::Start { foreground } => cmd::start::run(&root, foreground).await,
        Commands::Stop { now } => cmd::stop::run(&root, now).await,
        Commands::Snapshot { category } => cmd::snapshot::run_take(&root, category).await,
        Commands::Emergency => cmd::snapshot::run_emergency(&root).await,
        Commands::List { category, limit } => cmd::snapshot::run_list(&root, category, limit).await,
        Commands::Verify { id } => cmd::snapshot::run_verify(&root, &id).await,
        Commands::Restore { id, yes } => cmd::snapshot::run_restore(&root, &id, yes).await,
        Commands::Backup(backup_cmd) => match backup_cmd {
            BackupCommands::Run { kind } => cmd::backup::run_backup(&root, kind).await,
            BackupCommands::List { limit } => cmd::backup::run_list(&root, limit).await,
            BackupCommands::Manual => cmd::backup::run_manual(&root).await,
            BackupCommands::Verify { dir } => cmd::backup::run_verify(&root, &dir).await,
            BackupCommands::Restore { path, yes } => {
                cmd::backup::run_restore(&root, &path, yes).await
            }
        },
        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Info => cmd::cache::run_info(&root).await,
            CacheCommands::Sweep => cmd::cache::run_sweep(&root).await,
            CacheCommands::Clear { yes } => cmd::cache::run_clear(&root, yes).await,
        },
        Commands::Log { limit } => cmd::log::run(&root, limit).await,
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::List => cmd::config::run_list(&root).await,
            ConfigCommands::Get { key } => cmd::config::run_get(&root, &key).await,
            ConfigCommands::Set { key, value } => cmd::config::run_set(&root, &key, &value).await,
            ConfigCommands::Path => cmd::config::run_path(&root).await,
        },
    }
}
