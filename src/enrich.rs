use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::types::{split_path, Metadata, PathKey, ResultMetadata, SearchResult};

/// Blocking source of per-path display metadata.
pub trait MetadataProbe: Send + Sync {
    fn probe(&self, path: &str, is_directory: bool) -> Result<ResultMetadata, ProbeError>;
}

/// Reads size and modification time from the filesystem.
pub struct FsProbe;

impl MetadataProbe for FsProbe {
    fn probe(&self, path: &str, is_directory: bool) -> Result<ResultMetadata, ProbeError> {
        let meta =
            std::fs::metadata(path).map_err(|e| ProbeError::from_io(PathBuf::from(path), e))?;
        let modified = meta
            .modified()
            .map_err(|e| ProbeError::from_io(PathBuf::from(path), e))?;
        Ok(ResultMetadata {
            size_display: if is_directory {
                String::new()
            } else {
                format_size(meta.len())
            },
            modified_display: format_modified(modified),
            icon: Some(icon_for(path, is_directory)),
        })
    }
}

/// Human readable size: bytes below 1 KiB, otherwise up to three decimals.
pub fn format_size(len: u64) -> String {
    let (suffix, readable) = if len >= 1 << 60 {
        ("EB", (len >> 50) as f64)
    } else if len >= 1 << 50 {
        ("PB", (len >> 40) as f64)
    } else if len >= 1 << 40 {
        ("TB", (len >> 30) as f64)
    } else if len >= 1 << 30 {
        ("GB", (len >> 20) as f64)
    } else if len >= 1 << 20 {
        ("MB", (len >> 10) as f64)
    } else if len >= 1 << 10 {
        ("KB", len as f64)
    } else {
        return format!("{} B", len);
    };

    let value = format!("{:.3}", readable / 1024.0);
    let value = value.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", value, suffix)
}

pub fn format_modified(t: SystemTime) -> String {
    chrono::DateTime::<chrono::Local>::from(t)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

/// Glyph standing in for the shell icon of a path.
pub fn icon_for(path: &str, is_directory: bool) -> &'static str {
    if is_directory {
        return "📁";
    }
    let (_, name) = split_path(path);
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => return "📄",
    };
    match ext.as_str() {
        "rs" => "🦀",
        "py" => "🐍",
        "js" | "ts" | "jsx" | "tsx" => "📜",
        "html" | "htm" | "css" | "scss" => "🌐",
        "json" | "yaml" | "yml" | "toml" | "xml" | "ini" => "⚙",
        "md" | "txt" | "doc" | "docx" | "rtf" => "📝",
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "bmp" | "ico" => "🖼",
        "mp3" | "wav" | "flac" | "m4a" | "ogg" | "wma" => "🎵",
        "mp4" | "avi" | "mkv" | "wmv" | "mov" | "webm" => "🎬",
        "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" => "📦",
        "exe" | "msi" | "lnk" | "bat" | "cmd" => "⚡",
        "pdf" => "📕",
        "ppt" | "pptx" => "📊",
        "xls" | "xlsx" | "csv" => "📈",
        _ => "📄",
    }
}

/// A path currently being probed. The latest request that arrived while the
/// probe ran is kept in `pending`; earlier unstarted requests move to
/// `superseded` and receive whatever the pending probe produces.
#[derive(Default)]
struct Slot {
    pending: Option<Arc<SearchResult>>,
    superseded: Vec<Arc<SearchResult>>,
}

struct Inner {
    probe: Arc<dyn MetadataProbe>,
    slots: Mutex<HashMap<PathKey, Slot>>,
    denied: Mutex<HashSet<PathKey>>,
    permits: Arc<Semaphore>,
    idle: Notify,
}

/// Populates result metadata off the caller's thread, never running two
/// probes for the same path at once.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    inner: Arc<Inner>,
    handle: Handle,
}

impl EnrichmentPipeline {
    pub fn new(probe: Arc<dyn MetadataProbe>, workers: usize, handle: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                probe,
                slots: Mutex::new(HashMap::new()),
                denied: Mutex::new(HashSet::new()),
                permits: Arc::new(Semaphore::new(workers.max(1))),
                idle: Notify::new(),
            }),
            handle,
        }
    }

    /// Schedules metadata population for `result` and returns immediately.
    pub fn enrich(&self, result: Arc<SearchResult>) {
        let key = result.key().clone();

        {
            // lock order: slots, then denied
            let mut slots = lock(&self.inner.slots);
            if lock(&self.inner.denied).contains(&key) {
                drop(slots);
                result.set_metadata(ResultMetadata::unavailable());
                return;
            }
            if let Some(slot) = slots.get_mut(&key) {
                if let Some(replaced) = slot.pending.replace(result) {
                    slot.superseded.push(replaced);
                }
                return;
            }
            slots.insert(key.clone(), Slot::default());
        }

        let inner = self.inner.clone();
        self.handle.spawn(run_slot(inner, key, result));
    }

    /// Number of paths with a probe running or queued.
    pub fn active(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    /// Resolves once no probe is running or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if lock(&self.inner.slots).is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn run_slot(inner: Arc<Inner>, key: PathKey, first: Arc<SearchResult>) {
    let mut current = first;
    let mut followers: Vec<Arc<SearchResult>> = Vec::new();
    loop {
        let denied = probe_one(&inner, &current).await;
        if let Metadata::Fetched(metadata) = current.metadata() {
            for follower in followers.drain(..) {
                follower.set_metadata(metadata.clone());
            }
        }

        let next = {
            let mut slots = lock(&inner.slots);
            // recorded under the slots lock so no new probe can start in between
            if denied {
                lock(&inner.denied).insert(key.clone());
            }
            let (pending, superseded) = match slots.get_mut(&key) {
                Some(slot) => (slot.pending.take(), std::mem::take(&mut slot.superseded)),
                None => (None, Vec::new()),
            };
            match pending {
                Some(next) if !denied => {
                    followers = superseded;
                    Some(next)
                }
                skipped => {
                    for result in skipped.into_iter().chain(superseded) {
                        result.set_metadata(ResultMetadata::unavailable());
                    }
                    slots.remove(&key);
                    if slots.is_empty() {
                        inner.idle.notify_waiters();
                    }
                    None
                }
            }
        };

        match next {
            Some(next) => current = next,
            None => return,
        }
    }
}

/// Runs one probe and stores its outcome. Returns true on access denied.
async fn probe_one(inner: &Inner, result: &Arc<SearchResult>) -> bool {
    let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
        return false;
    };

    let probe = inner.probe.clone();
    let path = result.path.clone();
    let is_directory = result.is_directory;
    let outcome = tokio::task::spawn_blocking(move || probe.probe(&path, is_directory)).await;

    match outcome {
        Ok(Ok(metadata)) => {
            result.set_metadata(metadata);
            false
        }
        Ok(Err(ProbeError::AccessDenied(path))) => {
            debug!("access denied while probing {}", path.display());
            result.set_metadata(ResultMetadata::unavailable());
            true
        }
        Ok(Err(e)) => {
            warn!("metadata probe failed: {}", e);
            result.set_metadata(ResultMetadata::unavailable());
            false
        }
        Err(e) => {
            warn!("metadata probe for {} aborted: {}", result.path, e);
            result.set_metadata(ResultMetadata::unavailable());
            false
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
