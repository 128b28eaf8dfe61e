use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::store::{FavoriteRecord, FavoritesStore};
use crate::types::PathKey;

/// Persisted order plus membership index. Both are only ever changed together
/// under the overlay lock.
#[derive(Debug, Default)]
struct FavoritesSet {
    records: Vec<FavoriteRecord>,
    index: HashSet<PathKey>,
    version: u64,
}

impl FavoritesSet {
    fn rebuild(&mut self, records: Vec<FavoriteRecord>) {
        let mut index = HashSet::with_capacity(records.len());
        let records: Vec<FavoriteRecord> = records
            .into_iter()
            .filter(|r| !r.path.is_empty() && index.insert(PathKey::new(&r.path)))
            .collect();
        self.records = records;
        self.index = index;
        self.version += 1;
    }
}

/// In-memory favorites membership, persisted best-effort.
///
/// Persistence failures are logged and leave the in-memory set untouched;
/// search never depends on a save succeeding.
pub struct FavoritesOverlay {
    set: Arc<Mutex<FavoritesSet>>,
    store: Option<Arc<dyn FavoritesStore>>,
    last_saved: Arc<Mutex<u64>>,
    pending_save: Mutex<Option<JoinHandle<()>>>,
}

impl FavoritesOverlay {
    pub fn new(store: Arc<dyn FavoritesStore>) -> Self {
        Self {
            set: Arc::default(),
            store: Some(store),
            last_saved: Arc::new(Mutex::new(0)),
            pending_save: Mutex::new(None),
        }
    }

    /// Overlay without a backing store.
    pub fn in_memory() -> Self {
        Self {
            set: Arc::default(),
            store: None,
            last_saved: Arc::new(Mutex::new(0)),
            pending_save: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FavoritesSet> {
        lock_set(&self.set)
    }

    /// Replaces the whole set with a freshly loaded sequence.
    pub fn load(&self, records: Vec<FavoriteRecord>) {
        let mut set = self.lock();
        set.rebuild(records);
        debug!("favorites index rebuilt with {} entries", set.records.len());
    }

    /// Loads from the store, drops favorites that no longer exist on disk and
    /// writes the pruned list back. A failed load leaves the overlay empty.
    pub async fn load_from_store(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };

        let loaded = tokio::task::spawn_blocking(move || {
            store.load_favorites().map(|records| {
                let before = records.len();
                let refreshed = refresh_records(records);
                (before, refreshed)
            })
        })
        .await;

        match loaded {
            Ok(Ok((before, records))) => {
                let pruned = before - records.len();
                info!("loaded {} favorites ({} missing pruned)", records.len(), pruned);
                self.load(records);
                if pruned > 0 {
                    self.schedule_save(None);
                }
            }
            Ok(Err(e)) => {
                error!("failed to read favorites: {}", e);
                self.load(Vec::new());
            }
            Err(e) => {
                error!("favorites load task failed: {}", e);
                self.load(Vec::new());
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        self.lock().index.contains(&PathKey::new(path))
    }

    /// Adds `path` and schedules a save. Size and dates are filled in by the
    /// save task. Returns false if it was already present.
    pub fn add(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        {
            let mut set = self.lock();
            if !set.index.insert(PathKey::new(path)) {
                return false;
            }
            set.records.push(FavoriteRecord::new(path));
            set.version += 1;
        }
        self.schedule_save(Some(path.to_string()));
        true
    }

    /// Removes `path` and schedules a save. Returns false if it was not present.
    pub fn remove(&self, path: &str) -> bool {
        let key = PathKey::new(path);
        {
            let mut set = self.lock();
            if !set.index.remove(&key) {
                return false;
            }
            set.records.retain(|r| PathKey::new(&r.path) != key);
            set.version += 1;
        }
        self.schedule_save(None);
        true
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().records.iter().map(|r| r.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the most recently scheduled save.
    pub async fn flush(&self) {
        let handle = self
            .pending_save
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Writes the current set in the background, first stat'ing `added` so its
    /// record carries size and dates.
    fn schedule_save(&self, added: Option<String>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let set = self.set.clone();
        let last_saved = self.last_saved.clone();
        let write = move || {
            if let Some(path) = added {
                fill_snapshot(&set, &path);
            }

            // Saves are serialized and write the latest set; a save that finds
            // its version already written does nothing.
            let mut saved = last_saved.lock().unwrap_or_else(|p| p.into_inner());
            let (version, records) = {
                let set = lock_set(&set);
                (set.version, set.records.clone())
            };
            if *saved >= version {
                return;
            }
            match store.save_favorites(&records) {
                Ok(()) => *saved = version,
                Err(e) => error!("failed to write favorites: {}", e),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn_blocking(write);
                *self.pending_save.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
            }
            Err(_) => write(),
        }
    }
}

fn lock_set(set: &Mutex<FavoritesSet>) -> MutexGuard<'_, FavoritesSet> {
    set.lock().unwrap_or_else(|p| p.into_inner())
}

/// Stats `path` and stores the result on its record, if it is still a
/// favorite. A path that cannot be stat'ed keeps its empty columns.
fn fill_snapshot(set: &Mutex<FavoritesSet>, path: &str) {
    let Some(fresh) = snapshot_record(FavoriteRecord::new(path)) else {
        debug!("no metadata for new favorite {}", path);
        return;
    };
    let key = PathKey::new(path);
    let mut set = lock_set(set);
    let Some(record) = set.records.iter_mut().find(|r| PathKey::new(&r.path) == key) else {
        return;
    };
    record.size = fresh.size;
    record.date_modified = fresh.date_modified;
    record.date_created = fresh.date_created;
    set.version += 1;
}

/// Size and date columns for `record`, or `None` when the path is gone.
fn snapshot_record(mut record: FavoriteRecord) -> Option<FavoriteRecord> {
    let meta = std::fs::metadata(&record.path).ok()?;
    record.size = meta.is_file().then(|| meta.len());
    record.date_modified = meta.modified().ok().and_then(unix_secs);
    record.date_created = meta.created().ok().and_then(unix_secs);
    Some(record)
}

/// Refreshes size/date columns and drops favorites that cannot be stat'ed.
fn refresh_records(records: Vec<FavoriteRecord>) -> Vec<FavoriteRecord> {
    records.into_iter().filter_map(snapshot_record).collect()
}

fn unix_secs(t: std::time::SystemTime) -> Option<i64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
}
