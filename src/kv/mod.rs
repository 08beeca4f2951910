//! Key-value storage backing the snapshot manager.
//!
//! The manager only needs a synchronous string-keyed `get`/`set` with no
//! transactions. Two backends are provided:
//!
//! - [`MemoryStore`]: in-process map, used by tests and ephemeral hosts
//! - [`FileStore`]: durable one-file-per-key store with checksums

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;

/// The persistent storage medium supplied by the hosting environment.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrite the value stored under `key`.
    fn set(&self, key: &str, value: &str) -> Result<()>;
}
