//! Persistence for sightings, periodic keys and exposure results.
//!
//! The engine talks to storage only through the [`ContactStore`] trait. Two
//! backends ship with the crate:
//!
//! - [`MemoryStore`] keeps everything in process memory.
//! - [`JsonFileStore`] keeps the same state as one pretty-printed JSON document
//!   and rewrites it once per mutation, batch inserts included.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::exposure::{ContactDetail, ContactSketch, ContactWindow};
use crate::scan::Sighting;
use crate::types::{AppId, Identifier};

/// File name of the JSON snapshot inside the data directory.
pub const STORE_FILE_NAME: &str = "contact-store.json";

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The snapshot file could not be read or written.
    #[error("store I/O failed for {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The snapshot could not be encoded or decoded.
    #[error("store snapshot is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A periodic key as persisted for the owning app.
///
/// Content is kept as raw bytes so that damaged rows can be detected and
/// skipped on read instead of failing the whole query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    /// Owning app.
    pub app: AppId,
    /// Secret key bytes.
    pub content: Vec<u8>,
    /// Interval number at which the key became valid.
    pub interval: i64,
}

/// A persisted contact sketch for one (app, token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SketchRecord {
    /// Stable identity, assigned when the placeholder is created.
    pub id: Uuid,
    /// Owning app.
    pub app: AppId,
    /// Caller token grouping one diagnosis.
    pub token: String,
    /// Aggregate values.
    pub sketch: ContactSketch,
    /// Interval number of the last write.
    pub last_update_interval: i64,
}

/// A persisted contact detail, owned by a sketch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    /// Sketch this detail belongs to.
    pub sketch_id: Uuid,
    /// Per-key exposure values.
    pub detail: ContactDetail,
}

/// A persisted contact window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    /// Owning app.
    pub app: AppId,
    /// Window contents.
    pub window: ContactWindow,
    /// Interval number of the write.
    pub last_update_interval: i64,
}

/// Operations the engine needs from its persistence collaborator.
///
/// All interval ranges are inclusive at the start. Where a range has an end it
/// is documented per method.
pub trait ContactStore: Send + Sync {
    // Sightings

    /// Persist a batch of sightings as one write.
    fn insert_sightings(&self, sightings: &[Sighting]) -> StoreResult<()>;

    /// Persist one sighting.
    fn insert_sighting(&self, sighting: &Sighting) -> StoreResult<()> {
        self.insert_sightings(std::slice::from_ref(sighting))
    }

    /// Sightings of `identifier` recorded in `[start, end]`.
    fn sightings_for(&self, identifier: &Identifier, start: i64, end: i64)
        -> StoreResult<Vec<Sighting>>;

    /// Number of sightings recorded in `[start, end)`.
    fn count_sightings_in_range(&self, start: i64, end: i64) -> StoreResult<u64>;

    /// Delete sightings recorded before `interval`; returns how many were removed.
    fn delete_sightings_before(&self, interval: i64) -> StoreResult<usize>;

    /// Delete every sighting.
    fn delete_all_sightings(&self) -> StoreResult<()>;

    // Periodic keys

    /// Persist a periodic key.
    fn insert_periodic_key(&self, key: &StoredKey) -> StoreResult<()>;

    /// The app's most recent periodic key.
    fn latest_periodic_key(&self, app: &AppId) -> StoreResult<Option<StoredKey>>;

    /// All periodic keys of the app, oldest first.
    fn periodic_keys(&self, app: &AppId) -> StoreResult<Vec<StoredKey>>;

    /// Delete all periodic keys of the app.
    fn delete_periodic_keys(&self, app: &AppId) -> StoreResult<()>;

    /// Delete the app's periodic keys valid before `interval`.
    fn delete_periodic_keys_before(&self, app: &AppId, interval: i64) -> StoreResult<usize>;

    // Sketches and details

    /// Store a sketch, replacing any existing one for the same (app, token) and
    /// deleting that sketch's details.
    fn insert_sketch(&self, record: &SketchRecord) -> StoreResult<()>;

    /// Overwrite the values of an existing sketch, keeping its details.
    fn update_sketch(&self, record: &SketchRecord) -> StoreResult<()>;

    /// The sketch for (app, token), if any.
    fn sketch(&self, app: &AppId, token: &str) -> StoreResult<Option<SketchRecord>>;

    /// Append details.
    fn insert_details(&self, records: &[DetailRecord]) -> StoreResult<()>;

    /// Details owned by `sketch_id`, in insertion order.
    fn details(&self, sketch_id: Uuid) -> StoreResult<Vec<DetailRecord>>;

    /// Delete every sketch of the app along with their details.
    fn delete_sketches(&self, app: &AppId) -> StoreResult<()>;

    /// Delete the app's sketches last written before `interval`, with their details.
    fn delete_sketches_before(&self, app: &AppId, interval: i64) -> StoreResult<usize>;

    // Windows

    /// Append a window.
    fn insert_window(&self, record: &WindowRecord) -> StoreResult<()>;

    /// All windows of the app, in insertion order.
    fn windows(&self, app: &AppId) -> StoreResult<Vec<WindowRecord>>;

    /// Delete all windows of the app.
    fn delete_windows(&self, app: &AppId) -> StoreResult<()>;

    /// Delete the app's windows written before `interval`.
    fn delete_windows_before(&self, app: &AppId, interval: i64) -> StoreResult<usize>;
}

/// Everything a store holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    /// Flushed sightings.
    pub sightings: Vec<Sighting>,
    /// Own periodic keys of every app.
    pub periodic_keys: Vec<StoredKey>,
    /// Contact sketches.
    pub sketches: Vec<SketchRecord>,
    /// Contact details.
    pub details: Vec<DetailRecord>,
    /// Contact windows.
    pub windows: Vec<WindowRecord>,
}

impl StoreState {
    fn sightings_for(&self, identifier: &Identifier, start: i64, end: i64) -> Vec<Sighting> {
        self.sightings
            .iter()
            .filter(|s| &s.identifier == identifier)
            .filter(|s| s.interval_number >= start && s.interval_number <= end)
            .cloned()
            .collect()
    }

    fn count_sightings_in_range(&self, start: i64, end: i64) -> u64 {
        self.sightings
            .iter()
            .filter(|s| s.interval_number >= start && s.interval_number < end)
            .count() as u64
    }

    fn insert_sightings(&mut self, sightings: &[Sighting]) {
        self.sightings.extend_from_slice(sightings);
    }

    fn delete_sightings_before(&mut self, interval: i64) -> usize {
        let before = self.sightings.len();
        self.sightings.retain(|s| s.interval_number >= interval);
        before - self.sightings.len()
    }

    fn delete_all_sightings(&mut self) {
        self.sightings.clear();
    }

    fn insert_periodic_key(&mut self, key: &StoredKey) {
        self.periodic_keys.push(key.clone());
    }

    fn delete_periodic_keys(&mut self, app: &AppId) {
        self.periodic_keys.retain(|k| &k.app != app);
    }

    fn latest_periodic_key(&self, app: &AppId) -> Option<StoredKey> {
        self.periodic_keys
            .iter()
            .filter(|k| &k.app == app)
            .max_by_key(|k| k.interval)
            .cloned()
    }

    fn periodic_keys(&self, app: &AppId) -> Vec<StoredKey> {
        let mut keys: Vec<StoredKey> = self
            .periodic_keys
            .iter()
            .filter(|k| &k.app == app)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.interval);
        keys
    }

    fn delete_periodic_keys_before(&mut self, app: &AppId, interval: i64) -> usize {
        let before = self.periodic_keys.len();
        self.periodic_keys
            .retain(|k| &k.app != app || k.interval >= interval);
        before - self.periodic_keys.len()
    }

    fn insert_sketch(&mut self, record: &SketchRecord) {
        let replaced: Vec<Uuid> = self
            .sketches
            .iter()
            .filter(|s| s.app == record.app && s.token == record.token)
            .map(|s| s.id)
            .collect();
        self.remove_sketches(&replaced);
        self.sketches.push(record.clone());
    }

    fn update_sketch(&mut self, record: &SketchRecord) {
        if let Some(existing) = self
            .sketches
            .iter_mut()
            .find(|s| s.app == record.app && s.token == record.token)
        {
            existing.sketch = record.sketch.clone();
            existing.last_update_interval = record.last_update_interval;
        } else {
            self.sketches.push(record.clone());
        }
    }

    fn sketch(&self, app: &AppId, token: &str) -> Option<SketchRecord> {
        self.sketches
            .iter()
            .find(|s| &s.app == app && s.token == token)
            .cloned()
    }

    fn insert_details(&mut self, records: &[DetailRecord]) {
        self.details.extend_from_slice(records);
    }

    fn details(&self, sketch_id: Uuid) -> Vec<DetailRecord> {
        self.details
            .iter()
            .filter(|d| d.sketch_id == sketch_id)
            .cloned()
            .collect()
    }

    fn delete_sketches_where(&mut self, predicate: impl Fn(&SketchRecord) -> bool) -> usize {
        let doomed: Vec<Uuid> = self
            .sketches
            .iter()
            .filter(|s| predicate(s))
            .map(|s| s.id)
            .collect();
        self.remove_sketches(&doomed);
        doomed.len()
    }

    fn remove_sketches(&mut self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        self.sketches.retain(|s| !ids.contains(&s.id));
        self.details.retain(|d| !ids.contains(&d.sketch_id));
    }

    fn windows(&self, app: &AppId) -> Vec<WindowRecord> {
        self.windows
            .iter()
            .filter(|w| &w.app == app)
            .cloned()
            .collect()
    }

    fn insert_window(&mut self, record: &WindowRecord) {
        self.windows.push(record.clone());
    }

    fn delete_windows(&mut self, app: &AppId) {
        self.windows.retain(|w| &w.app != app);
    }

    fn delete_windows_before(&mut self, app: &AppId, interval: i64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|w| &w.app != app || w.last_update_interval >= interval);
        before - self.windows.len()
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `state`.
    #[must_use]
    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> StoreState {
        self.state.read().clone()
    }

    fn replace(&self, state: StoreState) {
        *self.state.write() = state;
    }
}

impl ContactStore for MemoryStore {
    fn insert_sightings(&self, sightings: &[Sighting]) -> StoreResult<()> {
        self.state.write().insert_sightings(sightings);
        Ok(())
    }

    fn sightings_for(
        &self,
        identifier: &Identifier,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<Sighting>> {
        Ok(self.state.read().sightings_for(identifier, start, end))
    }

    fn count_sightings_in_range(&self, start: i64, end: i64) -> StoreResult<u64> {
        Ok(self.state.read().count_sightings_in_range(start, end))
    }

    fn delete_sightings_before(&self, interval: i64) -> StoreResult<usize> {
        Ok(self.state.write().delete_sightings_before(interval))
    }

    fn delete_all_sightings(&self) -> StoreResult<()> {
        self.state.write().delete_all_sightings();
        Ok(())
    }

    fn insert_periodic_key(&self, key: &StoredKey) -> StoreResult<()> {
        self.state.write().insert_periodic_key(key);
        Ok(())
    }

    fn latest_periodic_key(&self, app: &AppId) -> StoreResult<Option<StoredKey>> {
        Ok(self.state.read().latest_periodic_key(app))
    }

    fn periodic_keys(&self, app: &AppId) -> StoreResult<Vec<StoredKey>> {
        Ok(self.state.read().periodic_keys(app))
    }

    fn delete_periodic_keys(&self, app: &AppId) -> StoreResult<()> {
        self.state.write().delete_periodic_keys(app);
        Ok(())
    }

    fn delete_periodic_keys_before(&self, app: &AppId, interval: i64) -> StoreResult<usize> {
        Ok(self.state.write().delete_periodic_keys_before(app, interval))
    }

    fn insert_sketch(&self, record: &SketchRecord) -> StoreResult<()> {
        self.state.write().insert_sketch(record);
        Ok(())
    }

    fn update_sketch(&self, record: &SketchRecord) -> StoreResult<()> {
        self.state.write().update_sketch(record);
        Ok(())
    }

    fn sketch(&self, app: &AppId, token: &str) -> StoreResult<Option<SketchRecord>> {
        Ok(self.state.read().sketch(app, token))
    }

    fn insert_details(&self, records: &[DetailRecord]) -> StoreResult<()> {
        self.state.write().insert_details(records);
        Ok(())
    }

    fn details(&self, sketch_id: Uuid) -> StoreResult<Vec<DetailRecord>> {
        Ok(self.state.read().details(sketch_id))
    }

    fn delete_sketches(&self, app: &AppId) -> StoreResult<()> {
        self.state.write().delete_sketches_where(|s| &s.app == app);
        Ok(())
    }

    fn delete_sketches_before(&self, app: &AppId, interval: i64) -> StoreResult<usize> {
        Ok(self
            .state
            .write()
            .delete_sketches_where(|s| &s.app == app && s.last_update_interval < interval))
    }

    fn insert_window(&self, record: &WindowRecord) -> StoreResult<()> {
        self.state.write().insert_window(record);
        Ok(())
    }

    fn windows(&self, app: &AppId) -> StoreResult<Vec<WindowRecord>> {
        Ok(self.state.read().windows(app))
    }

    fn delete_windows(&self, app: &AppId) -> StoreResult<()> {
        self.state.write().delete_windows(app);
        Ok(())
    }

    fn delete_windows_before(&self, app: &AppId, interval: i64) -> StoreResult<usize> {
        Ok(self.state.write().delete_windows_before(app, interval))
    }
}

/// Store persisted as a single JSON document.
///
/// Reads are served from memory. A mutation is applied to a copy of the state,
/// the copy is written through a temporary file and a rename, and only then
/// does it replace the in-memory state. A failed write leaves memory and disk
/// unchanged; a crash leaves either the old or the new snapshot on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    memory: MemoryStore,
    path: PathBuf,
    write_lock: Mutex<()>,
    writes: AtomicU64,
}

impl JsonFileStore {
    /// Open the store at `path`, loading an existing snapshot if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing snapshot cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let state: StoreState = serde_json::from_str(&content)?;
            info!(
                path = %path.display(),
                sightings = state.sightings.len(),
                sketches = state.sketches.len(),
                "loaded contact store"
            );
            state
        } else {
            debug!(path = %path.display(), "no contact store snapshot, starting empty");
            StoreState::default()
        };
        Ok(Self {
            memory: MemoryStore::with_state(state),
            path,
            write_lock: Mutex::new(()),
            writes: AtomicU64::new(0),
        })
    }

    /// Open the store file inside `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing snapshot cannot be read or parsed.
    pub fn open_in(data_dir: &Path) -> StoreResult<Self> {
        Self::open(data_dir.join(STORE_FILE_NAME))
    }

    /// Location of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshots written since the store was opened.
    #[must_use]
    pub fn snapshot_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn commit<T>(&self, mutation: impl FnOnce(&mut StoreState) -> T) -> StoreResult<T> {
        let _guard = self.write_lock.lock();
        let mut staged = self.memory.snapshot();
        let value = mutation(&mut staged);
        self.write_snapshot(&staged)?;
        self.memory.replace(staged);
        Ok(value)
    }

    fn write_snapshot(&self, state: &StoreState) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl ContactStore for JsonFileStore {
    fn insert_sightings(&self, sightings: &[Sighting]) -> StoreResult<()> {
        if sightings.is_empty() {
            return Ok(());
        }
        self.commit(|state| state.insert_sightings(sightings))
    }

    fn sightings_for(
        &self,
        identifier: &Identifier,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<Sighting>> {
        self.memory.sightings_for(identifier, start, end)
    }

    fn count_sightings_in_range(&self, start: i64, end: i64) -> StoreResult<u64> {
        self.memory.count_sightings_in_range(start, end)
    }

    fn delete_sightings_before(&self, interval: i64) -> StoreResult<usize> {
        self.commit(|state| state.delete_sightings_before(interval))
    }

    fn delete_all_sightings(&self) -> StoreResult<()> {
        self.commit(StoreState::delete_all_sightings)
    }

    fn insert_periodic_key(&self, key: &StoredKey) -> StoreResult<()> {
        self.commit(|state| state.insert_periodic_key(key))
    }

    fn latest_periodic_key(&self, app: &AppId) -> StoreResult<Option<StoredKey>> {
        self.memory.latest_periodic_key(app)
    }

    fn periodic_keys(&self, app: &AppId) -> StoreResult<Vec<StoredKey>> {
        self.memory.periodic_keys(app)
    }

    fn delete_periodic_keys(&self, app: &AppId) -> StoreResult<()> {
        self.commit(|state| state.delete_periodic_keys(app))
    }

    fn delete_periodic_keys_before(&self, app: &AppId, interval: i64) -> StoreResult<usize> {
        self.commit(|state| state.delete_periodic_keys_before(app, interval))
    }

    fn insert_sketch(&self, record: &SketchRecord) -> StoreResult<()> {
        self.commit(|state| state.insert_sketch(record))
    }

    fn update_sketch(&self, record: &SketchRecord) -> StoreResult<()> {
        self.commit(|state| state.update_sketch(record))
    }

    fn sketch(&self, app: &AppId, token: &str) -> StoreResult<Option<SketchRecord>> {
        self.memory.sketch(app, token)
    }

    fn insert_details(&self, records: &[DetailRecord]) -> StoreResult<()> {
        self.commit(|state| state.insert_details(records))
    }

    fn details(&self, sketch_id: Uuid) -> StoreResult<Vec<DetailRecord>> {
        self.memory.details(sketch_id)
    }

    fn delete_sketches(&self, app: &AppId) -> StoreResult<()> {
        self.commit(|state| {
            state.delete_sketches_where(|s| &s.app == app);
        })
    }

    fn delete_sketches_before(&self, app: &AppId, interval: i64) -> StoreResult<usize> {
        self.commit(|state| {
            state.delete_sketches_where(|s| &s.app == app && s.last_update_interval < interval)
        })
    }

    fn insert_window(&self, record: &WindowRecord) -> StoreResult<()> {
        self.commit(|state| state.insert_window(record))
    }

    fn windows(&self, app: &AppId) -> StoreResult<Vec<WindowRecord>> {
        self.memory.windows(app)
    }

    fn delete_windows(&self, app: &AppId) -> StoreResult<()> {
        self.commit(|state| state.delete_windows(app))
    }

    fn delete_windows_before(&self, app: &AppId, interval: i64) -> StoreResult<usize> {
        self.commit(|state| state.delete_windows_before(app, interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::ScanInfo;

    fn app(name: &str) -> AppId {
        AppId::new(name).unwrap()
    }

    fn sighting(identifier: u8, interval: i64) -> Sighting {
        Sighting {
            identifier: [identifier; 16],
            encrypted_metadata: [0; 4],
            max_rssi: -60,
            average_rssi: -65,
            interval_number: interval,
            seconds_since_last_scan: 300,
        }
    }

    fn sketch_record(app: &AppId, token: &str, hits: i32, interval: i64) -> SketchRecord {
        SketchRecord {
            id: Uuid::new_v4(),
            app: app.clone(),
            token: token.to_string(),
            sketch: ContactSketch {
                number_of_hits: hits,
                ..ContactSketch::default()
            },
            last_update_interval: interval,
        }
    }

    fn detail_for(sketch_id: Uuid) -> DetailRecord {
        DetailRecord {
            sketch_id,
            detail: ContactDetail::default(),
        }
    }

    #[test]
    fn test_sighting_range_queries() {
        let store = MemoryStore::new();
        store.insert_sighting(&sighting(1, 100)).unwrap();
        store.insert_sighting(&sighting(1, 110)).unwrap();
        store.insert_sighting(&sighting(2, 105)).unwrap();

        assert_eq!(store.sightings_for(&[1; 16], 100, 110).unwrap().len(), 2);
        assert_eq!(store.sightings_for(&[1; 16], 101, 109).unwrap().len(), 0);
        assert_eq!(store.count_sightings_in_range(100, 110).unwrap(), 2);
        assert_eq!(store.delete_sightings_before(106).unwrap(), 2);
        assert_eq!(store.count_sightings_in_range(0, 1000).unwrap(), 1);
    }

    #[test]
    fn test_latest_periodic_key() {
        let store = MemoryStore::new();
        let a = app("org.example.a");
        for interval in [144, 432, 288] {
            store
                .insert_periodic_key(&StoredKey {
                    app: a.clone(),
                    content: vec![0; 16],
                    interval,
                })
                .unwrap();
        }
        assert_eq!(store.latest_periodic_key(&a).unwrap().unwrap().interval, 432);
        assert_eq!(
            store
                .periodic_keys(&a)
                .unwrap()
                .iter()
                .map(|k| k.interval)
                .collect::<Vec<_>>(),
            vec![144, 288, 432]
        );
        assert_eq!(store.delete_periodic_keys_before(&a, 288).unwrap(), 1);
        assert!(store.latest_periodic_key(&app("org.example.b")).unwrap().is_none());
    }

    #[test]
    fn test_insert_sketch_cascades_details_but_update_keeps_them() {
        let store = MemoryStore::new();
        let a = app("org.example.a");
        let record = sketch_record(&a, "t1", 0, 10);
        store.insert_sketch(&record).unwrap();
        store.insert_details(&[detail_for(record.id)]).unwrap();

        let mut updated = record.clone();
        updated.sketch.number_of_hits = 1;
        store.update_sketch(&updated).unwrap();
        assert_eq!(store.details(record.id).unwrap().len(), 1);
        assert_eq!(store.sketch(&a, "t1").unwrap().unwrap().sketch.number_of_hits, 1);

        let replacement = sketch_record(&a, "t1", 0, 11);
        store.insert_sketch(&replacement).unwrap();
        assert!(store.details(record.id).unwrap().is_empty());
        assert_eq!(store.sketch(&a, "t1").unwrap().unwrap().id, replacement.id);
    }

    #[test]
    fn test_sketch_eviction_by_age_cascades() {
        let store = MemoryStore::new();
        let a = app("org.example.a");
        let old = sketch_record(&a, "old", 1, 10);
        let fresh = sketch_record(&a, "fresh", 1, 500);
        store.insert_sketch(&old).unwrap();
        store.insert_sketch(&fresh).unwrap();
        store
            .insert_details(&[detail_for(old.id), detail_for(fresh.id)])
            .unwrap();

        assert_eq!(store.delete_sketches_before(&a, 100).unwrap(), 1);
        assert!(store.sketch(&a, "old").unwrap().is_none());
        assert!(store.details(old.id).unwrap().is_empty());
        assert_eq!(store.details(fresh.id).unwrap().len(), 1);
    }

    #[test]
    fn test_window_queries_are_per_app() {
        let store = MemoryStore::new();
        let a = app("org.example.a");
        let b = app("org.example.b");
        let window = ContactWindow {
            date_millis: 0,
            report_type: 1,
            scan_infos: vec![ScanInfo {
                average_attenuation: 50,
                minimum_attenuation: 40,
                seconds_since_last_scan: 300,
            }],
        };
        for (owner, interval) in [(&a, 10), (&a, 200), (&b, 10)] {
            store
                .insert_window(&WindowRecord {
                    app: owner.clone(),
                    window: window.clone(),
                    last_update_interval: interval,
                })
                .unwrap();
        }
        assert_eq!(store.windows(&a).unwrap().len(), 2);
        assert_eq!(store.delete_windows_before(&a, 100).unwrap(), 1);
        assert_eq!(store.windows(&b).unwrap().len(), 1);
        store.delete_windows(&a).unwrap();
        assert!(store.windows(&a).unwrap().is_empty());
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = app("org.example.a");
        {
            let store = JsonFileStore::open_in(dir.path()).unwrap();
            store.insert_sighting(&sighting(3, 42)).unwrap();
            store
                .insert_periodic_key(&StoredKey {
                    app: a.clone(),
                    content: vec![7; 16],
                    interval: 144,
                })
                .unwrap();
        }
        let store = JsonFileStore::open_in(dir.path()).unwrap();
        assert_eq!(store.sightings_for(&[3; 16], 0, 100).unwrap().len(), 1);
        assert_eq!(
            store.latest_periodic_key(&a).unwrap().unwrap().content,
            vec![7; 16]
        );
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_store_batch_insert_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open_in(dir.path()).unwrap();
        let batch: Vec<Sighting> = (0..200u8).map(|i| sighting(i, i64::from(i))).collect();
        store.insert_sightings(&batch).unwrap();
        store.insert_sightings(&[]).unwrap();
        assert_eq!(store.snapshot_writes(), 1);

        let reopened = JsonFileStore::open_in(dir.path()).unwrap();
        assert_eq!(reopened.count_sightings_in_range(0, 1000).unwrap(), 200);
    }

    #[test]
    fn test_json_store_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let store = JsonFileStore::open(blocker.join(STORE_FILE_NAME)).unwrap();

        assert!(matches!(
            store.insert_sighting(&sighting(1, 10)),
            Err(StoreError::Io { .. })
        ));
        assert_eq!(store.count_sightings_in_range(0, 100).unwrap(), 0);
        assert_eq!(store.snapshot_writes(), 0);
        assert!(store
            .insert_periodic_key(&StoredKey {
                app: app("org.example.a"),
                content: vec![1; 16],
                interval: 5,
            })
            .is_err());
        assert!(store.latest_periodic_key(&app("org.example.a")).unwrap().is_none());
    }

    #[test]
    fn test_json_store_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
