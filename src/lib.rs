//! # Patrimony Snapshots
//!
//! Point-in-time snapshots of the locally persisted state of a fixed-asset
//! management application.
//!
//! ## Core Concepts
//!
//! - **Domains**: the closed set of data categories (assets, people,
//!   accounts, settings, ...) stored under fixed keys
//! - **Snapshots**: immutable captures of every domain, kept in a bounded
//!   list with oldest-first eviction
//! - **Auto-snapshots**: a repeating timer, supplied by a [`Scheduler`],
//!   that captures a snapshot at a configurable interval
//!
//! ## Example
//!
//! ```ignore
//! use patrimony_snapshots::{FileStore, SnapshotManager, ThreadScheduler};
//! use std::sync::Arc;
//!
//! let store = Arc::new(FileStore::open("./app-data", 64)?);
//! let manager = SnapshotManager::new(store, Arc::new(ThreadScheduler::new()));
//! manager.init()?;
//!
//! let id = manager.create_backup(Some("before year-end close"))?;
//! let exported = manager.export_backup(&id)?;
//!
//! manager.restore_backup(&id);
//! manager.cleanup();
//! ```

pub mod config;
pub mod error;
pub mod kv;
pub mod manager;
pub mod timer;
pub mod types;

// Re-exports
pub use config::{ConfigUpdate, ManagerOptions, SnapshotConfig};
pub use error::{Result, SnapshotError};
pub use kv::{FileStore, KeyValueStore, MemoryStore};
pub use manager::{SnapshotManager, AUTO_BACKUP_DESCRIPTION};
pub use timer::{ManualScheduler, Scheduler, ThreadScheduler, TickFn, TimerHandle};
pub use types::*;
