//! Keepsake Core - durability primitives for the snapshot and backup engines
//!
//! This crate provides the foundational layer:
//! - BLAKE3 hashing of payloads and directory trees
//! - Checksum stamping and fail-closed verification of artifacts
//! - Count and byte-budget retention policies
//! - The durability root layout and atomic writes
//! - The record store contract and its SQLite implementation
//! - A clock seam for simulated time

pub mod clock;
pub mod error;
pub mod hash;
pub mod integrity;
pub mod records;
pub mod retention;
pub mod store;

// Re-export main types for convenience
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Error, Result};
pub use hash::{hash_bytes, hash_file, hash_tree, hash_tree_excluding, Blake3Hash, IncrementalHasher};
pub use records::{
    CollectionSpec, Record, RecordStore, RunOutcome, SqliteStore, Statement, StoreError,
    StoreResult, WriteGate,
};
pub use retention::{prune, Candidate, Decision, PruneReport, RetentionPolicy};
pub use store::{atomic_write, timestamp_id, Layout};
