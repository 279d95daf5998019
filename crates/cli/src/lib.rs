//! Keepsake command-line and daemon library
//!
//! This crate provides:
//! - The configuration file and root directory resolution
//! - The service graph wiring every engine to one root
//! - The job scheduler and its control handle
//! - The daemon lifecycle (lock file, signals, panic hook)

pub mod config;
pub mod daemon;
pub mod locks;
pub mod logging;
pub mod scheduler;
pub mod services;
pub mod util;

// Re-exports
pub use config::Config;
pub use scheduler::{Firing, Job, JobRunner, JobState, Schedule, Scheduler, SchedulerHandle};
pub use services::Services;
