//! Snapshot manager: capture, retention, restore, export and import.

use crate::config::{ConfigUpdate, ManagerOptions, SnapshotConfig};
use crate::error::{Result, SnapshotError};
use crate::kv::KeyValueStore;
use crate::timer::{Scheduler, TickFn, TimerHandle};
use crate::types::{Domain, Snapshot, SnapshotId, SnapshotPayload, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Description given to snapshots taken by the timer.
pub const AUTO_BACKUP_DESCRIPTION: &str = "Automatic backup";

/// Currently scheduled auto-snapshot timer.
#[derive(Default)]
struct TimerSlot {
    /// Bumped on every reschedule or stop; ticks carrying an older value are ignored.
    generation: u64,
    handle: Option<TimerHandle>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    scheduler: Arc<dyn Scheduler>,
    options: ManagerOptions,
    config: RwLock<SnapshotConfig>,
    timer: Mutex<TimerSlot>,
    /// Serializes every read-modify-write of the snapshot list and store.
    write_lock: Mutex<()>,
}

/// Manages point-in-time snapshots of every [`Domain`] in a key-value store.
///
/// Construction has no side effects. Call [`init`](Self::init) to load the
/// persisted settings and start the auto-snapshot timer, and
/// [`cleanup`](Self::cleanup) to stop it. Clones share the same state.
#[derive(Clone)]
pub struct SnapshotManager {
    inner: Arc<Inner>,
}

impl SnapshotManager {
    /// Create a manager with default storage keys.
    pub fn new(store: Arc<dyn KeyValueStore>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_options(store, scheduler, ManagerOptions::default())
    }

    /// Create a manager with explicit options.
    pub fn with_options(
        store: Arc<dyn KeyValueStore>,
        scheduler: Arc<dyn Scheduler>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                scheduler,
                options,
                config: RwLock::new(SnapshotConfig::default()),
                timer: Mutex::new(TimerSlot::default()),
                write_lock: Mutex::new(()),
            }),
        }
    }

    // --- Lifecycle ---

    /// Load settings from the store and start the timer if enabled.
    ///
    /// Missing or invalid settings fall back to defaults, which are not
    /// written back until the first [`update_config`](Self::update_config).
    pub fn init(&self) -> Result<()> {
        let config = self.load_config();
        *self.inner.config.write() = config.clone();
        self.apply_timer(&config)
    }

    /// Stop the auto-snapshot timer. Safe to call at any time.
    pub fn cleanup(&self) {
        let mut slot = self.inner.timer.lock();
        slot.generation += 1;
        if let Some(mut handle) = slot.handle.take() {
            handle.cancel();
            debug!("auto-snapshot timer stopped");
        }
    }

    /// Whether the auto-snapshot timer is scheduled.
    pub fn is_auto_snapshot_running(&self) -> bool {
        self.inner.timer.lock().handle.is_some()
    }

    // --- Configuration ---

    /// Copy of the current settings.
    pub fn get_config(&self) -> SnapshotConfig {
        self.inner.config.read().clone()
    }

    /// Merge `update` into the settings, persist them, and reschedule the timer.
    ///
    /// Invalid values are rejected and a failed write leaves the settings
    /// unchanged.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        let merged = {
            let _lock = self.inner.write_lock.lock();

            let merged = self.get_config().merged(&update);
            merged.validate()?;

            let key = &self.inner.options.config_key;
            let encoded = serde_json::to_string(&merged)?;
            self.inner.store.set(key, &encoded).map_err(|e| {
                let e = e.at_key(key);
                error!(error = %e, "failed to persist snapshot settings");
                e
            })?;

            *self.inner.config.write() = merged.clone();
            merged
        };

        info!(
            auto_snapshot = merged.auto_snapshot_enabled,
            interval_minutes = merged.auto_snapshot_interval_minutes,
            max_retained = merged.max_retained_snapshots,
            "snapshot settings updated"
        );

        self.apply_timer(&merged)
    }

    // --- Snapshots ---

    /// Capture every domain currently in the store and return the new id.
    ///
    /// Absent domains are skipped. The oldest snapshots are evicted so the
    /// list never exceeds `max_retained_snapshots`.
    pub fn create_backup(&self, description: Option<&str>) -> Result<SnapshotId> {
        let _lock = self.inner.write_lock.lock();

        let payload = self.collect_payload().map_err(|e| {
            error!(error = %e, "failed to read domain data for snapshot");
            e
        })?;

        let mut snapshots = self.read_snapshots().map_err(|e| {
            error!(error = %e, "failed to read snapshot list");
            e
        })?;
        let created_at = Timestamp::now();
        let id = Self::fresh_id(&snapshots, created_at);

        let snapshot = Snapshot {
            id: id.clone(),
            created_at,
            description: description.map(str::to_string),
            payload,
            schema_version: self.inner.options.schema_version.clone(),
        };
        let domains = snapshot.payload.len();
        let bytes = snapshot.payload_bytes();

        snapshots.push(snapshot);
        self.retain_and_persist(snapshots)?;

        info!(snapshot_id = %id, domains, bytes, "snapshot created");
        Ok(id)
    }

    /// All retained snapshots, oldest first.
    ///
    /// A missing or unreadable list yields an empty result.
    pub fn get_backups(&self) -> Vec<Snapshot> {
        self.load_snapshots()
    }

    /// Look up one retained snapshot.
    pub fn get_backup(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.load_snapshots().into_iter().find(|s| &s.id == id)
    }

    /// Write every domain captured by snapshot `id` back to the store.
    ///
    /// Returns `false` if the snapshot does not exist (the store is left
    /// untouched) or if a write fails. Writes are not rolled back, so a
    /// failed restore may have overwritten some domains already.
    pub fn restore_backup(&self, id: &SnapshotId) -> bool {
        let _lock = self.inner.write_lock.lock();

        let snapshot = match self.load_snapshots().into_iter().find(|s| &s.id == id) {
            Some(s) => s,
            None => {
                warn!(snapshot_id = %id, "restore requested for unknown snapshot");
                return false;
            }
        };

        for (written, (domain, value)) in snapshot.payload.iter().enumerate() {
            if let Err(e) = self.inner.store.set(domain.storage_key(), value) {
                error!(
                    snapshot_id = %id,
                    domain = %domain,
                    restored = written,
                    error = %e,
                    "restore aborted, store partially overwritten"
                );
                return false;
            }
        }

        info!(snapshot_id = %id, domains = snapshot.payload.len(), "snapshot restored");
        true
    }

    /// Remove snapshot `id`. Deleting an absent id is a no-op that returns `true`.
    ///
    /// Returns `false` when the list cannot be read or the shortened list
    /// cannot be written.
    pub fn delete_backup(&self, id: &SnapshotId) -> bool {
        let _lock = self.inner.write_lock.lock();

        let mut snapshots = match self.read_snapshots() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(snapshot_id = %id, error = %e, "failed to read snapshot list for deletion");
                return false;
            }
        };
        let before = snapshots.len();
        snapshots.retain(|s| &s.id != id);

        if snapshots.len() == before {
            debug!(snapshot_id = %id, "delete requested for absent snapshot");
            return true;
        }

        match self.persist_snapshots(&snapshots) {
            Ok(()) => {
                info!(snapshot_id = %id, "snapshot deleted");
                true
            }
            Err(e) => {
                error!(snapshot_id = %id, error = %e, "failed to persist snapshot deletion");
                false
            }
        }
    }

    /// Serialize snapshot `id` as JSON suitable for [`import_backup`](Self::import_backup).
    pub fn export_backup(&self, id: &SnapshotId) -> Result<String> {
        let snapshot = self
            .get_backup(id)
            .ok_or_else(|| SnapshotError::NotFound(id.clone()))?;
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Add a previously exported snapshot under a fresh id and timestamp.
    ///
    /// The text must be a JSON object with `id`, `createdAt` (or
    /// `timestamp`) and a `payload` mapping known domains to strings.
    pub fn import_backup(&self, text: &str) -> Result<SnapshotId> {
        let (payload, description, schema_version) = self.parse_import(text).map_err(|e| {
            warn!(error = %e, "rejected snapshot import");
            e
        })?;

        let _lock = self.inner.write_lock.lock();

        let mut snapshots = self.read_snapshots().map_err(|e| {
            error!(error = %e, "failed to read snapshot list");
            e
        })?;
        let created_at = Timestamp::now();
        let id = Self::fresh_id(&snapshots, created_at);

        snapshots.push(Snapshot {
            id: id.clone(),
            created_at,
            description,
            payload,
            schema_version,
        });
        self.retain_and_persist(snapshots)?;

        info!(snapshot_id = %id, "snapshot imported");
        Ok(id)
    }

    // --- Internals ---

    fn parse_import(&self, text: &str) -> Result<(SnapshotPayload, Option<String>, String)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SnapshotError::Validation(format!("backup is not valid JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| SnapshotError::Validation("backup must be a JSON object".into()))?;

        let present = |field: &str| object.get(field).map_or(false, |v| !v.is_null());

        if !present("id") {
            return Err(SnapshotError::Validation("backup is missing 'id'".into()));
        }
        if !present("createdAt") && !present("timestamp") {
            return Err(SnapshotError::Validation(
                "backup is missing 'createdAt'".into(),
            ));
        }
        let payload = match object.get("payload") {
            Some(p) if !p.is_null() => p.clone(),
            _ => return Err(SnapshotError::Validation("backup is missing 'payload'".into())),
        };

        let payload: SnapshotPayload = serde_json::from_value(payload)
            .map_err(|e| SnapshotError::Validation(format!("invalid payload: {}", e)))?;

        let description = object
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let schema_version = object
            .get("schemaVersion")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.inner.options.schema_version.clone());

        Ok((payload, description, schema_version))
    }

    /// Read the current value of every known domain.
    fn collect_payload(&self) -> Result<SnapshotPayload> {
        let mut payload = SnapshotPayload::new();
        for domain in Domain::ALL {
            let key = domain.storage_key();
            if let Some(value) = self.inner.store.get(key).map_err(|e| e.at_key(key))? {
                payload.insert(domain, value);
            }
        }
        Ok(payload)
    }

    fn fresh_id(existing: &[Snapshot], at: Timestamp) -> SnapshotId {
        loop {
            let id = SnapshotId::generate(at);
            if !existing.iter().any(|s| s.id == id) {
                return id;
            }
        }
    }

    /// Evict the oldest snapshots beyond the retention limit, then overwrite the list.
    fn retain_and_persist(&self, mut snapshots: Vec<Snapshot>) -> Result<()> {
        let max = self.inner.config.read().max_retained_snapshots.max(1);
        let excess = snapshots.len().saturating_sub(max);
        if excess > 0 {
            debug!(evicted = excess, max, "pruning oldest snapshots");
            snapshots.drain(..excess);
        }

        self.persist_snapshots(&snapshots).map_err(|e| {
            error!(error = %e, "failed to persist snapshot list");
            e
        })
    }

    fn persist_snapshots(&self, snapshots: &[Snapshot]) -> Result<()> {
        let key = &self.inner.options.snapshots_key;
        let encoded = serde_json::to_string(snapshots)?;
        self.inner.store.set(key, &encoded).map_err(|e| e.at_key(key))
    }

    /// Read the snapshot list for a write path.
    ///
    /// A store failure is returned so the caller never overwrites a list it
    /// could not see. A corrupt list reads as empty and is replaced on write.
    fn read_snapshots(&self) -> Result<Vec<Snapshot>> {
        let key = &self.inner.options.snapshots_key;
        let text = match self.inner.store.get(key).map_err(|e| e.at_key(key))? {
            Some(text) => text,
            None => return Ok(Vec::new()),
        };

        let snapshots = serde_json::from_str(&text)
            .map_err(|e| SnapshotError::Deserialization(e.to_string()))
            .unwrap_or_else(|e| {
                warn!(error = %e, "snapshot list is corrupt, treating as empty");
                Vec::new()
            });
        Ok(snapshots)
    }

    /// Best-effort list for enumeration: any failure reads as empty.
    fn load_snapshots(&self) -> Vec<Snapshot> {
        self.read_snapshots().unwrap_or_else(|e| {
            warn!(error = %e, "snapshot list unreadable, treating as empty");
            Vec::new()
        })
    }

    fn load_config(&self) -> SnapshotConfig {
        let key = &self.inner.options.config_key;
        let text = match self.inner.store.get(key) {
            Ok(Some(text)) => text,
            Ok(None) => return SnapshotConfig::default(),
            Err(e) => {
                warn!(error = %e, "snapshot settings unreadable, using defaults");
                return SnapshotConfig::default();
            }
        };

        // Fields missing from the stored object keep their defaults
        let config = serde_json::from_str::<ConfigUpdate>(&text)
            .map_err(|e| SnapshotError::Deserialization(e.to_string()))
            .map(|update| SnapshotConfig::default().merged(&update))
            .and_then(|config| config.validate().map(|()| config));

        config.unwrap_or_else(|e| {
            warn!(error = %e, "snapshot settings invalid, using defaults");
            SnapshotConfig::default()
        })
    }

    /// Cancel any running timer and start a new one if `config` enables it.
    fn apply_timer(&self, config: &SnapshotConfig) -> Result<()> {
        let mut slot = self.inner.timer.lock();
        slot.generation += 1;
        if let Some(mut handle) = slot.handle.take() {
            handle.cancel();
        }

        if !config.auto_snapshot_enabled {
            debug!("auto-snapshot disabled");
            return Ok(());
        }

        let generation = slot.generation;
        let weak = Arc::downgrade(&self.inner);
        let tick: TickFn = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                SnapshotManager { inner }.run_tick(generation);
            }
        });

        let interval = config.interval();
        slot.handle = Some(self.inner.scheduler.schedule_repeating(interval, tick)?);
        debug!(interval_secs = interval.as_secs(), "auto-snapshot timer scheduled");
        Ok(())
    }

    /// One timer tick. Failures are logged and never stop the schedule.
    fn run_tick(&self, generation: u64) {
        let slot = self.inner.timer.lock();
        if slot.generation != generation || slot.handle.is_none() {
            return;
        }

        match self.create_backup(Some(AUTO_BACKUP_DESCRIPTION)) {
            Ok(id) => debug!(snapshot_id = %id, "automatic snapshot taken"),
            Err(e) => warn!(error = %e, "automatic snapshot failed"),
        }
        drop(slot);
    }
}
