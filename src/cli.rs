use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use starquery::backend::{open_in_everything_command, EsBackend};
use starquery::config;
use starquery::coordinator::{QueryCoordinator, SearchStatus};
use starquery::enrich::{EnrichmentPipeline, FsProbe};
use starquery::favorites::FavoritesOverlay;
use starquery::filters::{FilterCatalog, FilterSpec};
use starquery::store::{FilterStore, JsonFileStore};
use starquery::types::{Metadata, ResultMetadata};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "StarQuery live search over the Everything index",
    long_about = None
)]
pub struct CliArgs {
    /// Search term
    #[arg(short = 'q', long = "query", default_value = "")]
    pub query: String,

    /// Filter name or macro (e.g. "Files", "doc")
    #[arg(short = 'f', long = "filter")]
    pub filter: Option<String>,

    /// Pages to fetch
    #[arg(short = 'p', long = "pages", default_value_t = 1)]
    pub pages: u32,

    /// Rows per page (overrides settings)
    #[arg(short = 'b', long = "batch-size")]
    pub batch_size: Option<u32>,

    /// Everything sort code, 1..=26
    #[arg(long = "sort")]
    pub sort: Option<u32>,

    #[arg(long = "case")]
    pub match_case: bool,

    #[arg(long = "whole-word")]
    pub match_whole_word: bool,

    #[arg(long = "match-path")]
    pub match_path: bool,

    #[arg(long = "regex")]
    pub regex: bool,

    /// Show every row even when the term is empty
    #[arg(long = "show-empty")]
    pub show_empty: bool,

    /// Path to es.exe
    #[arg(long = "es-path")]
    pub es_path: Option<PathBuf>,

    /// Everything instance name
    #[arg(long = "instance")]
    pub instance: Option<String>,

    #[arg(long = "add-favorite")]
    pub add_favorite: Vec<String>,

    #[arg(long = "remove-favorite")]
    pub remove_favorite: Vec<String>,

    /// Print the command line that opens this search in Everything instead
    /// of searching
    #[arg(long = "open-in-everything")]
    pub open_in_everything: bool,

    /// JSON list of user filters to import; enables filter import and
    /// replaces the stored list
    #[arg(long = "import-filters")]
    pub import_filters: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long = "save-settings")]
    pub save_settings: bool,

    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl CliArgs {
    fn settings(&self) -> config::SearchSettings {
        let mut settings = config::load_settings(&config::settings_path());
        settings.match_case |= self.match_case;
        settings.match_whole_word |= self.match_whole_word;
        settings.match_path |= self.match_path;
        settings.use_regex |= self.regex;
        if self.show_empty {
            settings.hide_empty_results = false;
        }
        if let Some(sort) = self.sort {
            settings.sort = sort;
        }
        if let Some(batch) = self.batch_size {
            settings.batch_size = batch;
        }
        if self.es_path.is_some() {
            settings.es_path = self.es_path.clone();
        }
        if let Some(instance) = &self.instance {
            settings.es_instance = instance.clone();
        }
        if self.import_filters.is_some() {
            settings.import_filters = true;
        }
        settings
    }
}

fn read_filter_file(path: &Path) -> anyhow::Result<Vec<FilterSpec>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read filters from {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("malformed filter list in {}", path.display()))
}

pub async fn run_cli(args: CliArgs) -> anyhow::Result<()> {
    let settings = args.settings();
    if args.save_settings {
        config::save_settings(&config::settings_path(), &settings)?;
        info!("settings saved");
    }
    let store = Arc::new(JsonFileStore::in_data_dir());
    let from_file = args.import_filters.as_deref().map(read_filter_file).transpose()?;

    let imported = if from_file.is_some() {
        from_file.clone()
    } else if settings.import_filters {
        match store.load_filters() {
            Ok(filters) => Some(filters),
            Err(e) => {
                warn!("falling back to built-in filters: {}", e);
                None
            }
        }
    } else {
        None
    };

    let catalog = FilterCatalog::new(&settings, imported.clone());
    let filter = match &args.filter {
        Some(name) => catalog
            .find(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown filter '{}'", name))?,
        None => catalog.first_default(),
    };

    if args.open_in_everything {
        let exe = settings
            .everything_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("Everything.exe"));
        let output = json!({
            "code": 0,
            "msg": "success",
            "command": open_in_everything_command(&exe, &settings, &filter, &args.query, None),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let favorites = Arc::new(FavoritesOverlay::new(store.clone()));
    favorites.load_from_store().await;
    for path in &args.add_favorite {
        if favorites.add(path) {
            info!("added favorite {}", path);
        }
    }
    for path in &args.remove_favorite {
        if favorites.remove(path) {
            info!("removed favorite {}", path);
        }
    }
    favorites.flush().await;

    let backend = EsBackend::locate(&settings)?;
    if let Err(e) = tokio::task::block_in_place(|| backend.ensure_running()) {
        warn!("{}", e);
    }

    let handle = tokio::runtime::Handle::current();
    let workers = settings.enrichment_workers;
    let enrichment = EnrichmentPipeline::new(Arc::new(FsProbe), workers, handle.clone());
    let coordinator = QueryCoordinator::new(
        Arc::new(backend),
        favorites,
        enrichment,
        settings,
        imported,
        handle,
    );
    coordinator.attach_filter_store(store.clone());
    if let Some(filters) = from_file {
        info!("importing {} user filters", filters.len());
        coordinator.set_user_filters(Some(filters));
    }

    coordinator.set_query(&args.query, filter);
    coordinator.wait_idle().await;
    for _ in 1..args.pages {
        coordinator.fetch_next_batch();
        coordinator.wait_idle().await;
    }

    let results: Vec<_> = coordinator
        .snapshot()
        .iter()
        .map(|r| {
            let metadata = match r.metadata() {
                Metadata::Fetched(m) => m,
                Metadata::Unfetched => ResultMetadata::unavailable(),
            };
            json!({
                "name": r.name,
                "path": r.path,
                "is_dir": r.is_directory,
                "favorite": r.is_favorite,
                "highlighted_name": r.highlighted_name,
                "size": metadata.size_display,
                "modified": metadata.modified_display,
                "icon": metadata.icon,
            })
        })
        .collect();

    let query = coordinator.query();
    let (code, msg) = match coordinator.status() {
        SearchStatus::Failed { error, .. } => (1, error.to_string()),
        _ => (0, "success".to_string()),
    };

    let output = json!({
        "code": code,
        "msg": msg,
        "query": query.term,
        "filter": query.filter.name,
        "favorites": coordinator.favorites_count(),
        "results": results,
    });

    // JSON on stdout, logs go to stderr
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
