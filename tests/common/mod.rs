#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use starquery::backend::SearchBackend;
use starquery::config::SearchSettings;
use starquery::coordinator::QueryCoordinator;
use starquery::enrich::{EnrichmentPipeline, MetadataProbe};
use starquery::error::{ProbeError, SearchError};
use starquery::favorites::FavoritesOverlay;
use starquery::store::FavoriteRecord;
use starquery::types::{BackendRequest, RawMatch, ResultMetadata, ResultPage};

/// Serves fixed row lists keyed by search expression.
#[derive(Default)]
pub struct FakeBackend {
    rows: Mutex<HashMap<String, Vec<RawMatch>>>,
    delays: Mutex<HashMap<String, Duration>>,
    failure: Mutex<Option<SearchError>>,
    requests: Mutex<Vec<BackendRequest>>,
    calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_rows(&self, expression: &str, paths: &[&str]) {
        let rows = paths.iter().map(|p| RawMatch::plain(*p, false)).collect();
        self.rows.lock().unwrap().insert(expression.to_string(), rows);
    }

    pub fn with_delay(&self, expression: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(expression.to_string(), delay);
    }

    pub fn fail_with(&self, error: Option<SearchError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl SearchBackend for FakeBackend {
    fn query(&self, request: &BackendRequest) -> Result<ResultPage, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let delay = self.delays.lock().unwrap().get(&request.expression).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }

        let rows = self
            .rows
            .lock()
            .unwrap()
            .get(&request.expression)
            .cloned()
            .unwrap_or_default();
        let start = (request.offset as usize).min(rows.len());
        let end = (start + request.limit as usize).min(rows.len());
        Ok(ResultPage {
            entries: rows[start..end].to_vec(),
            total_available: rows.len() as u32,
        })
    }
}

/// Probe with a fixed delay that records per-path concurrency.
#[derive(Default)]
pub struct FakeProbe {
    delay: Duration,
    denied: Mutex<Vec<String>>,
    broken: Mutex<Vec<String>>,
    active: Mutex<HashMap<String, usize>>,
    max_active_per_path: AtomicUsize,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeProbe {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn deny(&self, path: &str) {
        self.denied.lock().unwrap().push(path.to_string());
    }

    pub fn break_path(&self, path: &str) {
        self.broken.lock().unwrap().push(path.to_string());
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn max_active_per_path(&self) -> usize {
        self.max_active_per_path.load(Ordering::SeqCst)
    }
}

impl MetadataProbe for FakeProbe {
    fn probe(&self, path: &str, _is_directory: bool) -> Result<ResultMetadata, ProbeError> {
        *self.calls.lock().unwrap().entry(path.to_string()).or_default() += 1;
        {
            let mut active = self.active.lock().unwrap();
            let n = active.entry(path.to_string()).or_default();
            *n += 1;
            self.max_active_per_path.fetch_max(*n, Ordering::SeqCst);
        }

        std::thread::sleep(self.delay);

        *self.active.lock().unwrap().get_mut(path).unwrap() -= 1;

        if self.denied.lock().unwrap().iter().any(|p| p == path) {
            return Err(ProbeError::AccessDenied(PathBuf::from(path)));
        }
        if self.broken.lock().unwrap().iter().any(|p| p == path) {
            return Err(ProbeError::Io {
                path: PathBuf::from(path),
                source: std::io::Error::new(std::io::ErrorKind::Other, "device not ready"),
            });
        }
        Ok(ResultMetadata {
            size_display: "1 KB".to_string(),
            modified_display: "2024-01-01 00:00".to_string(),
            icon: Some("📄"),
        })
    }
}

pub struct Harness {
    pub coordinator: QueryCoordinator,
    pub backend: Arc<FakeBackend>,
    pub probe: Arc<FakeProbe>,
    pub favorites: Arc<FavoritesOverlay>,
}

pub fn harness(settings: SearchSettings, favorites: &[&str]) -> Harness {
    let backend = FakeBackend::new();
    let probe = FakeProbe::new(Duration::from_millis(1));
    let overlay = Arc::new(FavoritesOverlay::in_memory());
    overlay.load(favorites.iter().map(|p| FavoriteRecord::new(*p)).collect());

    let handle = tokio::runtime::Handle::current();
    let enrichment = EnrichmentPipeline::new(probe.clone(), 4, handle.clone());
    let coordinator = QueryCoordinator::new(
        backend.clone(),
        overlay.clone(),
        enrichment,
        settings,
        None,
        handle,
    );

    Harness {
        coordinator,
        backend,
        probe,
        favorites: overlay,
    }
}

pub fn paths(coordinator: &QueryCoordinator) -> Vec<String> {
    coordinator
        .snapshot()
        .iter()
        .map(|r| r.path.clone())
        .collect()
}
