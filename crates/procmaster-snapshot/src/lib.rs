//! # procmaster snapshot
//!
//! Persistence of the supervised process set.
//!
//! This crate provides:
//! - The on-disk snapshot format (versioned JSON)
//! - Atomic snapshot writes (temp file, fsync, rename)
//! - Platform-specific snapshot location resolution

mod file;
mod location;

pub use file::{load_snapshot, save_snapshot, Snapshot, SnapshotEntry, SNAPSHOT_VERSION};
pub use location::{ServiceContext, SnapshotFileConfig, SnapshotLocator, DEFAULT_APP_NAME};
