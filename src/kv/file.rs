//! Durable key-value store, one checksummed file per key.

use super::KeyValueStore;
use crate::error::{Result, SnapshotError};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for entry files.
const ENTRY_MAGIC: &[u8; 4] = b"KVE\0";

/// Current entry format version.
const ENTRY_VERSION: u8 = 1;

/// Bytes before the key: magic, version and key length.
const ENTRY_HEADER_LEN: u64 = 4 + 1 + 2;

/// Extension of fully written entry files.
const ENTRY_EXT: &str = "kv";

/// File-backed store.
///
/// Layout:
/// - `LOCK`: held exclusively while the store is open
/// - `entries/<shard>/<sha256(key)>.kv`: one file per key
///
/// Each entry is written to a temporary file, synced, then renamed over
/// the previous version, so a crash leaves either the old or the new value.
pub struct FileStore {
    /// Base directory.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Recently read or written values.
    cache: Mutex<LruCache<String, String>>,

    /// Serializes writers and cache fills.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `path`.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(path.join("entries"))?;

        let lock_file = Self::acquire_lock(&path)?;
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
            write_lock: Mutex::new(()),
        })
    }

    /// Base directory of the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List every stored key.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for shard in fs::read_dir(self.path.join("entries"))? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry_path = entry?.path();
                if entry_path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                    continue;
                }
                let (key, _) = Self::read_entry(&entry_path)?;
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SnapshotError::Locked)?;

        Ok(lock_file)
    }

    fn key_hash(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let hash = Self::key_hash(key);
        self.path
            .join("entries")
            .join(&hash[..2])
            .join(format!("{}.{}", hash, ENTRY_EXT))
    }

    fn write_entry(path: &Path, key: &str, value: &str) -> Result<()> {
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }

        let key_bytes = key.as_bytes();
        let key_len = u16::try_from(key_bytes.len())
            .map_err(|_| SnapshotError::storage(key, "key longer than 65535 bytes"))?;

        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;

        // Header
        file.write_all(ENTRY_MAGIC)?;
        file.write_all(&[ENTRY_VERSION])?;

        // Key
        file.write_all(&key_len.to_le_bytes())?;
        file.write_all(key_bytes)?;

        // Value
        let value_bytes = value.as_bytes();
        file.write_all(&(value_bytes.len() as u64).to_le_bytes())?;
        file.write_all(value_bytes)?;

        // Checksum
        file.write_all(&crc32fast::hash(value_bytes).to_le_bytes())?;

        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_entry(path: &Path) -> Result<(String, String)> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ENTRY_MAGIC {
            return Err(SnapshotError::InvalidFormat("Invalid entry magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ENTRY_VERSION {
            return Err(SnapshotError::InvalidFormat(format!(
                "Unsupported entry version: {}",
                version[0]
            )));
        }

        // Length fields are not checksummed; bound them by the file size
        let file_len = file.metadata()?.len();

        let mut key_len_bytes = [0u8; 2];
        file.read_exact(&mut key_len_bytes)?;
        let key_len = u64::from(u16::from_le_bytes(key_len_bytes));
        let value_len_offset = ENTRY_HEADER_LEN + key_len;
        if value_len_offset + 8 + 4 > file_len {
            return Err(SnapshotError::InvalidFormat(format!(
                "Entry key length {} exceeds file size {}",
                key_len, file_len
            )));
        }
        let mut key_bytes = vec![0u8; key_len as usize];
        file.read_exact(&mut key_bytes)?;

        let mut value_len_bytes = [0u8; 8];
        file.read_exact(&mut value_len_bytes)?;
        let value_len = u64::from_le_bytes(value_len_bytes);
        let expected_len = value_len
            .checked_add(value_len_offset + 8 + 4)
            .filter(|&len| len == file_len);
        if expected_len.is_none() {
            return Err(SnapshotError::InvalidFormat(format!(
                "Entry value length {} does not match file size {}",
                value_len, file_len
            )));
        }
        let mut value_bytes = vec![0u8; value_len as usize];
        file.read_exact(&mut value_bytes)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&value_bytes);
        if stored_checksum != computed_checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let key = String::from_utf8(key_bytes)
            .map_err(|e| SnapshotError::Corruption(format!("entry key is not UTF-8: {}", e)))?;
        let value = String::from_utf8(value_bytes)
            .map_err(|e| SnapshotError::Corruption(format!("entry value is not UTF-8: {}", e)))?;

        Ok((key, value))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Ok(Some(cached));
        }

        // Fill the cache under the writer lock so a concurrent `set` cannot
        // be overwritten by the value read here.
        let _lock = self.write_lock.lock();
        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Ok(Some(cached));
        }

        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let (stored_key, value) = Self::read_entry(&path)?;
        if stored_key != key {
            return Err(SnapshotError::Corruption(format!(
                "entry for '{}' holds key '{}'",
                key, stored_key
            )));
        }

        self.cache.lock().put(key.to_string(), value.clone());
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _lock = self.write_lock.lock();

        Self::write_entry(&self.entry_path(key), key, value)?;
        self.cache.lock().put(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_get() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("kv"), 16).unwrap();

        assert_eq!(store.get("assets").unwrap(), None);
        store.set("assets", r#"[{"tag":"PAT-001"}]"#).unwrap();
        assert_eq!(
            store.get("assets").unwrap().as_deref(),
            Some(r#"[{"tag":"PAT-001"}]"#)
        );
    }

    #[test]
    fn test_overwrite_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv");

        {
            let store = FileStore::open(&path, 16).unwrap();
            store.set("people", "[]").unwrap();
            store.set("people", "[\"Joana\"]").unwrap();
            store.set("sectors", "[\"TI\"]").unwrap();
        }

        let store = FileStore::open(&path, 16).unwrap();
        assert_eq!(store.get("people").unwrap().as_deref(), Some("[\"Joana\"]"));
        assert_eq!(store.keys().unwrap(), vec!["people", "sectors"]);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv");

        let _store = FileStore::open(&path, 16).unwrap();
        let result = FileStore::open(&path, 16);
        assert!(matches!(result, Err(SnapshotError::Locked)));
    }

    #[test]
    fn test_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv");

        {
            let store = FileStore::open(&path, 16).unwrap();
            store.set("rentals", "[1,2,3]").unwrap();
        }

        // Flip the last byte of the value, leaving the checksum intact
        let probe = FileStore::open(&path, 16).unwrap();
        let entry = probe.entry_path("rentals");
        drop(probe);

        let mut bytes = fs::read(&entry).unwrap();
        let value_end = bytes.len() - 4;
        bytes[value_end - 1] ^= 0xFF;
        fs::write(&entry, bytes).unwrap();

        let store = FileStore::open(&path, 16).unwrap();
        assert!(matches!(
            store.get("rentals"),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_lengths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv");

        let entry = {
            let store = FileStore::open(&path, 16).unwrap();
            store.set("assets", "[\"PAT-001\"]").unwrap();
            store.set("people", "[]").unwrap();
            (store.entry_path("assets"), store.entry_path("people"))
        };

        // Value length of "assets" sits right after the 6-byte key
        let mut bytes = fs::read(&entry.0).unwrap();
        let offset = ENTRY_HEADER_LEN as usize + "assets".len();
        bytes[offset..offset + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&entry.0, bytes).unwrap();

        // Key length of "people"
        let mut bytes = fs::read(&entry.1).unwrap();
        bytes[5..7].copy_from_slice(&u16::MAX.to_le_bytes());
        fs::write(&entry.1, bytes).unwrap();

        let store = FileStore::open(&path, 16).unwrap();
        assert!(matches!(
            store.get("assets"),
            Err(SnapshotError::InvalidFormat(_))
        ));
        assert!(matches!(
            store.get("people"),
            Err(SnapshotError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_concurrent_reads_never_cache_stale_values() {
        let dir = TempDir::new().unwrap();
        // One slot, so the reader keeps evicting and refilling
        let store = Arc::new(FileStore::open(dir.path().join("kv"), 1).unwrap());
        store.set("system-backups", "0").unwrap();
        store.set("assets", "[]").unwrap();

        let reader_store = Arc::clone(&store);
        let done = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::clone(&done);
        let reader = thread::spawn(move || {
            while !reader_done.load(Ordering::SeqCst) {
                reader_store.get("system-backups").unwrap();
                reader_store.get("assets").unwrap();
            }
        });

        for i in 1..=200 {
            store.set("system-backups", &i.to_string()).unwrap();
            let expected = i.to_string();
            assert_eq!(store.get("system-backups").unwrap(), Some(expected));
        }

        done.store(true, Ordering::SeqCst);
        reader.join().unwrap();
        assert_eq!(store.get("system-backups").unwrap().as_deref(), Some("200"));
    }
}
