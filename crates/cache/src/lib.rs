//! Two-tier preview cache for Keepsake
//!
//! This crate provides:
//! - Content fingerprints from (path, size, modification time)
//! - A memory tier with its own TTL
//! - A disk tier written in the background, aged by write time
//! - Hourly expiry and daily orphan/size sweeps
//! - The preview rendering seam

pub mod fingerprint;
pub mod tiered;

pub use fingerprint::Fingerprint;
pub use tiered::{
    CacheConfig, CacheInfo, ClearReport, OrphanReport, Payload, PreviewRenderer, Tier, TieredCache,
};
