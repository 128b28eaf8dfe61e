//! Live query pipeline: owns the current query, pages results in from the
//! backend, pins favorites to the head and hands new rows to enrichment.
//!
//! Every term or filter change starts a new generation. A fetch captures the
//! generation it was started for and publishes only while that generation is
//! still current, so late pages of a superseded query are dropped. The
//! blocking backend call itself cannot be interrupted; the per-generation
//! cancellation token only stops the row loop and publication.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::SearchBackend;
use crate::config::{OffsetPolicy, SearchSettings};
use crate::cycler;
use crate::enrich::EnrichmentPipeline;
use crate::error::SearchError;
use crate::favorites::FavoritesOverlay;
use crate::filters::{FilterCatalog, FilterSpec};
use crate::store::FilterStore;
use crate::types::{BackendRequest, PathKey, QueryState, RawMatch, SearchResult};

const EVENT_CAPACITY: usize = 256;

/// Change notifications for the published result sequence.
#[derive(Debug, Clone)]
pub enum ResultEvent {
    Cleared {
        generation: u64,
    },
    /// Rows appended after the current tail
    Appended {
        generation: u64,
        entries: Vec<Arc<SearchResult>>,
    },
    /// Favorites inserted as one block starting at index `at`
    HeadInserted {
        generation: u64,
        at: usize,
        entries: Vec<Arc<SearchResult>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStatus {
    Idle,
    Searching { generation: u64 },
    /// All pages of the generation have been published
    Exhausted { generation: u64 },
    /// The backend refused or failed; published rows are kept
    Failed { generation: u64, error: SearchError },
}

struct QueryControl {
    query: QueryState,
    generation: u64,
    cancel: CancellationToken,
    in_flight: bool,
    /// No further pages for this generation, either the backend ran out or
    /// a fetch failed
    exhausted: bool,
    seen: HashSet<PathKey>,
}

#[derive(Default)]
struct ResultList {
    entries: Vec<Arc<SearchResult>>,
    /// Length of the favorites block at the head of `entries`
    favorites_count: usize,
}

struct Shared {
    backend: Arc<dyn SearchBackend>,
    favorites: Arc<FavoritesOverlay>,
    enrichment: EnrichmentPipeline,
    settings: RwLock<SearchSettings>,
    imported_filters: Mutex<Option<Vec<FilterSpec>>>,
    filter_store: Mutex<Option<Arc<dyn FilterStore>>>,
    filter_save: Mutex<Option<JoinHandle<()>>>,
    catalog: RwLock<FilterCatalog>,
    // lock order: control, then settings or results
    control: Mutex<QueryControl>,
    results: Mutex<ResultList>,
    events: broadcast::Sender<ResultEvent>,
    status: watch::Sender<SearchStatus>,
    running_fetches: AtomicUsize,
    fetches_done: Notify,
    handle: Handle,
}

/// Parameters captured when a fetch starts.
struct FetchJob {
    generation: u64,
    cancel: CancellationToken,
    request: BackendRequest,
    policy: OffsetPolicy,
}

/// Decrements the running fetch count when a fetch task ends, however it ends.
struct RunningFetch(Arc<Shared>);

impl Drop for RunningFetch {
    fn drop(&mut self) {
        if self.0.running_fetches.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.fetches_done.notify_waiters();
        }
    }
}

/// Handle to the query pipeline. Cloning shares the same pipeline.
#[derive(Clone)]
pub struct QueryCoordinator {
    shared: Arc<Shared>,
}

impl QueryCoordinator {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        favorites: Arc<FavoritesOverlay>,
        enrichment: EnrichmentPipeline,
        settings: SearchSettings,
        imported_filters: Option<Vec<FilterSpec>>,
        handle: Handle,
    ) -> Self {
        let catalog = FilterCatalog::new(&settings, imported_filters.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(SearchStatus::Idle);

        Self {
            shared: Arc::new(Shared {
                backend,
                favorites,
                enrichment,
                control: Mutex::new(QueryControl {
                    query: QueryState::new("", catalog.first_default()),
                    generation: 0,
                    cancel: CancellationToken::new(),
                    in_flight: false,
                    exhausted: false,
                    seen: HashSet::new(),
                }),
                settings: RwLock::new(settings),
                imported_filters: Mutex::new(imported_filters),
                filter_store: Mutex::new(None),
                filter_save: Mutex::new(None),
                catalog: RwLock::new(catalog),
                results: Mutex::new(ResultList::default()),
                events,
                status,
                running_fetches: AtomicUsize::new(0),
                fetches_done: Notify::new(),
                handle,
            }),
        }
    }

    /// Replaces the term, keeping the filter, and starts a fresh fetch.
    pub fn set_term(&self, term: &str) {
        let filter = lock(&self.shared.control).query.filter.clone();
        self.start_generation(QueryState::new(term, filter));
    }

    /// Replaces the filter, keeping the term, and starts a fresh fetch.
    pub fn set_filter(&self, filter: FilterSpec) {
        let term = lock(&self.shared.control).query.term.clone();
        self.start_generation(QueryState::new(term, filter));
    }

    /// Replaces term and filter together as a single generation.
    pub fn set_query(&self, term: &str, filter: FilterSpec) {
        self.start_generation(QueryState::new(term, filter));
    }

    /// Empty term and the first default filter.
    pub fn reset(&self) {
        let filter = read(&self.shared.catalog).first_default();
        self.start_generation(QueryState::new("", filter));
    }

    /// Moves `direction` steps around the filter ring and selects the filter
    /// reached. Returns it, or `None` when there are no filters at all.
    pub fn cycle_filter(&self, direction: isize) -> Option<FilterSpec> {
        let current = lock(&self.shared.control).query.filter.clone();
        let next = cycler::cycle(&read(&self.shared.catalog), &current, direction)?;
        debug!("cycling filter {} -> {}", current.name, next.name);
        self.set_filter(next.clone());
        Some(next)
    }

    /// Runs the current term and filter again as a new generation.
    pub fn refresh(&self) {
        let query = lock(&self.shared.control).query.clone();
        self.start_generation(QueryState::new(query.term, query.filter));
    }

    /// Installs new settings. Changes that affect matching or paging re-run
    /// the query; toggling regex mode also rebuilds the filter ring and
    /// falls back to its first default.
    pub fn apply_settings(&self, settings: SearchSettings) {
        let previous = std::mem::replace(&mut *write(&self.shared.settings), settings.clone());

        let regex_toggled = previous.use_regex != settings.use_regex;
        if regex_toggled || previous.import_filters != settings.import_filters {
            self.rebuild_catalog();
        }

        if regex_toggled {
            let term = lock(&self.shared.control).query.term.clone();
            let filter = read(&self.shared.catalog).first_default();
            info!("regex mode {}, filter reset to {}", settings.use_regex, filter.name);
            self.start_generation(QueryState::new(term, filter));
        } else if previous.requires_requery(&settings) {
            self.refresh();
        }
    }

    /// Persists user filter definitions passed to [`Self::set_user_filters`].
    pub fn attach_filter_store(&self, store: Arc<dyn FilterStore>) {
        *lock(&self.shared.filter_store) = Some(store);
    }

    /// Replaces the imported user filter definitions and writes them to the
    /// attached store in the background. A failed write is only logged.
    pub fn set_user_filters(&self, filters: Option<Vec<FilterSpec>>) {
        *lock(&self.shared.imported_filters) = filters.clone();
        self.rebuild_catalog();

        let store = lock(&self.shared.filter_store).clone();
        let (Some(filters), Some(store)) = (filters, store) else {
            return;
        };
        let task = self.shared.handle.spawn_blocking(move || {
            match store.save_filters(&filters) {
                Ok(()) => debug!("saved {} user filters", filters.len()),
                Err(e) => error!("failed to write filters: {}", e),
            }
        });
        *lock(&self.shared.filter_save) = Some(task);
    }

    fn rebuild_catalog(&self) {
        let imported = lock(&self.shared.imported_filters).clone();
        let catalog = FilterCatalog::new(&read(&self.shared.settings), imported);
        *write(&self.shared.catalog) = catalog;
    }

    fn start_generation(&self, query: QueryState) {
        {
            let mut control = lock(&self.shared.control);
            control.cancel.cancel();
            control.cancel = CancellationToken::new();
            control.generation += 1;
            control.in_flight = false;
            control.exhausted = false;
            control.seen.clear();
            info!(
                "generation {}: term '{}' filter {}",
                control.generation, query.term, query.filter.name
            );
            control.query = query;

            let mut results = lock(&self.shared.results);
            results.entries.clear();
            results.favorites_count = 0;
            let _ = self.shared.events.send(ResultEvent::Cleared {
                generation: control.generation,
            });
            self.shared.status.send_replace(SearchStatus::Idle);
        }
        self.fetch_next_batch();
    }

    /// Requests the next page for the current query. Does nothing while a
    /// fetch for this generation is in flight, after the last page, or when
    /// the term is empty and empty terms hide results.
    pub fn fetch_next_batch(&self) {
        let job = {
            let mut control = lock(&self.shared.control);
            if control.in_flight || control.exhausted {
                return;
            }
            // read under the control lock so a job never pairs a new
            // generation with the settings it replaced
            let settings = read(&self.shared.settings).clone();
            if control.query.term.is_empty() && settings.hide_empty_results {
                return;
            }
            control.in_flight = true;
            // counted before the lock is released so wait_idle cannot miss it
            self.shared.running_fetches.fetch_add(1, Ordering::AcqRel);

            let query = &control.query;
            let job = FetchJob {
                generation: control.generation,
                cancel: control.cancel.clone(),
                request: BackendRequest {
                    expression: query.search_expression(),
                    term: query.term.clone(),
                    flags: query.filter.flags(&settings),
                    offset: query.offset,
                    limit: settings.effective_batch_size(),
                },
                policy: settings.offset_policy,
            };
            self.shared.status.send_replace(SearchStatus::Searching {
                generation: job.generation,
            });
            job
        };

        let guard = RunningFetch(self.shared.clone());
        self.shared.handle.spawn(async move {
            let shared = guard.0.clone();
            run_fetch(&shared, job).await;
            drop(guard);
        });
    }

    /// Current published sequence, favorites block first.
    pub fn snapshot(&self) -> Vec<Arc<SearchResult>> {
        lock(&self.shared.results).entries.clone()
    }

    pub fn favorites_count(&self) -> usize {
        lock(&self.shared.results).favorites_count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> SearchStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SearchStatus> {
        self.shared.status.subscribe()
    }

    pub fn query(&self) -> QueryState {
        lock(&self.shared.control).query.clone()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.shared.control).generation
    }

    pub fn catalog(&self) -> FilterCatalog {
        read(&self.shared.catalog).clone()
    }

    pub fn settings(&self) -> SearchSettings {
        read(&self.shared.settings).clone()
    }

    pub fn favorites(&self) -> &Arc<FavoritesOverlay> {
        &self.shared.favorites
    }

    /// Waits until no fetch task is running, including superseded ones, all
    /// scheduled enrichment has finished and the last filter save is done.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.fetches_done.notified();
            if self.shared.running_fetches.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        self.shared.enrichment.wait_idle().await;

        let save = lock(&self.shared.filter_save).take();
        if let Some(save) = save {
            let _ = save.await;
        }
    }

    /// Cancels the current generation; nothing more is published until the
    /// next term or filter change.
    pub fn shutdown(&self) {
        let mut control = lock(&self.shared.control);
        control.cancel.cancel();
        control.generation += 1;
        control.in_flight = false;
        control.exhausted = true;
        debug!("coordinator shut down at generation {}", control.generation);
    }
}

async fn run_fetch(shared: &Arc<Shared>, job: FetchJob) {
    let backend = shared.backend.clone();
    let request = job.request.clone();
    let outcome = tokio::task::spawn_blocking(move || backend.query(&request)).await;

    let page = match outcome {
        Ok(Ok(page)) => page,
        Ok(Err(e)) => return report_failure(shared, job.generation, e),
        Err(e) => {
            return report_failure(
                shared,
                job.generation,
                SearchError::BackendUnavailable(format!("backend task failed: {}", e)),
            )
        }
    };

    let row_count = page.entries.len() as u32;
    let Some((mut favorite_rows, mut main_rows)) =
        partition_page(page.entries, &job.cancel, |path| shared.favorites.contains(path))
    else {
        debug!("generation {} superseded, dropping page", job.generation);
        return;
    };
    let non_favorite_rows = main_rows.len() as u32;

    let published = {
        let mut control = lock(&shared.control);
        if control.generation != job.generation || job.cancel.is_cancelled() {
            debug!("generation {} superseded, dropping page", job.generation);
            return;
        }

        main_rows.retain(|r| control.seen.insert(r.key().clone()));
        favorite_rows.retain(|r| control.seen.insert(r.key().clone()));

        let mut results = lock(&shared.results);
        if !main_rows.is_empty() {
            results.entries.extend(main_rows.iter().cloned());
            let _ = shared.events.send(ResultEvent::Appended {
                generation: job.generation,
                entries: main_rows.clone(),
            });
        }
        if !favorite_rows.is_empty() {
            let at = results.favorites_count;
            results
                .entries
                .splice(at..at, favorite_rows.iter().cloned());
            results.favorites_count += favorite_rows.len();
            let _ = shared.events.send(ResultEvent::HeadInserted {
                generation: job.generation,
                at,
                entries: favorite_rows.clone(),
            });
        }
        drop(results);

        let advance = match job.policy {
            OffsetPolicy::AllRows => row_count,
            // A full page of favorites must still move the cursor
            OffsetPolicy::NonFavoriteRows if non_favorite_rows == 0 => row_count,
            OffsetPolicy::NonFavoriteRows => non_favorite_rows,
        };
        control.query.offset = job.request.offset.saturating_add(advance);
        control.exhausted =
            row_count < job.request.limit || control.query.offset >= page.total_available;
        control.in_flight = false;

        debug!(
            "generation {}: {} rows ({} favorites), offset now {}",
            job.generation,
            row_count,
            favorite_rows.len(),
            control.query.offset
        );
        shared.status.send_replace(if control.exhausted {
            SearchStatus::Exhausted {
                generation: job.generation,
            }
        } else {
            SearchStatus::Idle
        });

        favorite_rows.into_iter().chain(main_rows)
    };

    for result in published {
        shared.enrichment.enrich(result);
    }
}

type Partitioned = (Vec<Arc<SearchResult>>, Vec<Arc<SearchResult>>);

/// Splits a page into favorites and other rows, each in backend order.
/// Cancellation is checked before every row; `None` means the page was
/// abandoned part way.
fn partition_page(
    rows: Vec<RawMatch>,
    cancel: &CancellationToken,
    is_favorite: impl Fn(&str) -> bool,
) -> Option<Partitioned> {
    let mut favorites = Vec::new();
    let mut others = Vec::with_capacity(rows.len());
    for raw in rows {
        if cancel.is_cancelled() {
            return None;
        }
        let favorite = is_favorite(&raw.path);
        let result = Arc::new(SearchResult::from_raw(raw, favorite));
        if favorite {
            favorites.push(result);
        } else {
            others.push(result);
        }
    }
    Some((favorites, others))
}

fn report_failure(shared: &Shared, generation: u64, error: SearchError) {
    let mut control = lock(&shared.control);
    if control.generation != generation {
        debug!("ignoring failure of superseded generation {}: {}", generation, error);
        return;
    }
    error!("search failed for '{}': {}", control.query.term, error);
    control.in_flight = false;
    control.exhausted = true;
    shared
        .status
        .send_replace(SearchStatus::Failed { generation, error });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}
