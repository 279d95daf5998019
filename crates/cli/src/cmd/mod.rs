//! CLI command implementations

pub mod backup;
pub mod cache;
pub mod config;
pub mod init;
pub mod log;
pub mod snapshot;
pub mod start;
pub mod status;
pub mod stop;
