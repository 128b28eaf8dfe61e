mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use starquery::config::{OffsetPolicy, SearchSettings};
use starquery::coordinator::{ResultEvent, SearchStatus};
use starquery::error::SearchError;
use starquery::filters::{FilterSpec, DEFAULT_FILTERS};
use starquery::store::{FilterStore, JsonFileStore};
use starquery::types::{Metadata, SortKey};

use common::{harness, paths};

fn settings(batch_size: u32, offset_policy: OffsetPolicy) -> SearchSettings {
    SearchSettings {
        batch_size,
        offset_policy,
        ..Default::default()
    }
}

async fn fetch_all(h: &common::Harness) {
    for _ in 0..20 {
        h.coordinator.wait_idle().await;
        if matches!(
            h.coordinator.status(),
            SearchStatus::Exhausted { .. } | SearchStatus::Failed { .. }
        ) {
            return;
        }
        h.coordinator.fetch_next_batch();
    }
    panic!("paging did not finish");
}

#[tokio::test]
async fn only_the_last_term_is_published() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("x", &["C:\\x-only.txt"]);
    h.backend.with_delay("x", Duration::from_millis(150));
    h.backend.with_rows("xy", &["C:\\xy.txt"]);
    let mut events = h.coordinator.subscribe();

    h.coordinator.set_term("x");
    h.coordinator.set_term("xy");
    h.coordinator.wait_idle().await;

    assert_eq!(h.backend.calls(), 2);
    assert_eq!(paths(&h.coordinator), vec!["C:\\xy.txt"]);

    let latest = h.coordinator.generation();
    while let Ok(event) = events.try_recv() {
        if let ResultEvent::Appended { generation, entries } = event {
            assert_eq!(generation, latest);
            assert!(entries.iter().all(|r| r.path != "C:\\x-only.txt"));
        }
    }
}

#[tokio::test]
async fn rapid_term_changes_publish_only_the_final_generation() {
    let h = harness(SearchSettings::default(), &[]);
    let terms = ["a", "ab", "abc", "abcd", "abcde"];
    for (i, term) in terms.iter().enumerate() {
        let path = format!("C:\\{}.txt", term);
        h.backend.with_rows(term, &[path.as_str()]);
        h.backend
            .with_delay(term, Duration::from_millis(20 * (terms.len() - i) as u64));
    }

    for term in terms {
        h.coordinator.set_term(term);
    }
    h.coordinator.wait_idle().await;

    assert_eq!(paths(&h.coordinator), vec!["C:\\abcde.txt"]);
    assert_eq!(h.coordinator.query().term, "abcde");
}

#[tokio::test]
async fn favorites_are_pinned_to_the_head_in_backend_order() {
    let h = harness(SearchSettings::default(), &["C:\\A", "C:\\C"]);
    h.backend.with_rows("q", &["C:\\A", "C:\\B", "C:\\C"]);

    h.coordinator.set_term("q");
    h.coordinator.wait_idle().await;

    assert_eq!(paths(&h.coordinator), vec!["C:\\A", "C:\\C", "C:\\B"]);
    assert_eq!(h.coordinator.favorites_count(), 2);
    let flags: Vec<bool> = h.coordinator.snapshot().iter().map(|r| r.is_favorite).collect();
    assert_eq!(flags, vec![true, true, false]);
}

#[tokio::test]
async fn favorites_from_later_pages_join_the_head_block() {
    let h = harness(settings(3, OffsetPolicy::NonFavoriteRows), &["c:\\r4", "C:\\R1"]);
    h.backend
        .with_rows("q", &["C:\\r0", "C:\\r1", "C:\\r2", "C:\\r3", "C:\\r4", "C:\\r5"]);
    let mut events = h.coordinator.subscribe();

    h.coordinator.set_term("q");
    h.coordinator.wait_idle().await;
    assert_eq!(paths(&h.coordinator), vec!["C:\\r1", "C:\\r0", "C:\\r2"]);

    h.coordinator.fetch_next_batch();
    h.coordinator.wait_idle().await;
    assert_eq!(
        paths(&h.coordinator),
        vec!["C:\\r1", "C:\\r4", "C:\\r0", "C:\\r2", "C:\\r3"]
    );

    let mut head_inserts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ResultEvent::HeadInserted { at, entries, .. } = event {
            head_inserts.push((at, entries.len()));
        }
    }
    assert_eq!(head_inserts, vec![(0, 1), (1, 1)]);
}

#[tokio::test]
async fn back_to_back_fetches_issue_one_backend_call() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("q", &["C:\\one"]);
    h.backend.with_delay("q", Duration::from_millis(50));

    h.coordinator.set_term("q");
    h.coordinator.fetch_next_batch();
    h.coordinator.fetch_next_batch();
    h.coordinator.wait_idle().await;

    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn empty_term_hides_results() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("", &["C:\\everything"]);

    h.coordinator.fetch_next_batch();
    h.coordinator.set_term("");
    h.coordinator.reset();
    h.coordinator.wait_idle().await;

    assert_eq!(h.backend.calls(), 0);
    assert!(h.coordinator.snapshot().is_empty());
}

#[tokio::test]
async fn empty_term_is_searched_when_not_hidden() {
    let h = harness(
        SearchSettings {
            hide_empty_results: false,
            ..Default::default()
        },
        &[],
    );
    h.backend.with_rows("", &["C:\\everything"]);

    h.coordinator.set_term("");
    h.coordinator.wait_idle().await;

    assert_eq!(h.backend.calls(), 1);
    assert_eq!(paths(&h.coordinator), vec!["C:\\everything"]);
}

#[tokio::test]
async fn backend_failure_keeps_published_rows() {
    let h = harness(settings(2, OffsetPolicy::NonFavoriteRows), &[]);
    h.backend.with_rows("q", &["C:\\1", "C:\\2", "C:\\3", "C:\\4"]);

    h.coordinator.set_term("q");
    h.coordinator.wait_idle().await;
    assert_eq!(paths(&h.coordinator), vec!["C:\\1", "C:\\2"]);

    h.backend
        .fail_with(Some(SearchError::QueryRejected("bad expression".to_string())));
    h.coordinator.fetch_next_batch();
    h.coordinator.wait_idle().await;

    assert_eq!(paths(&h.coordinator), vec!["C:\\1", "C:\\2"]);
    assert!(matches!(
        h.coordinator.status(),
        SearchStatus::Failed {
            error: SearchError::QueryRejected(_),
            ..
        }
    ));

    // no automatic retry
    h.coordinator.fetch_next_batch();
    h.coordinator.wait_idle().await;
    assert_eq!(h.backend.calls(), 2);

    h.backend.fail_with(None);
    h.coordinator.refresh();
    h.coordinator.wait_idle().await;
    assert_eq!(h.backend.calls(), 3);
    assert_eq!(paths(&h.coordinator), vec!["C:\\1", "C:\\2"]);
    assert_eq!(h.coordinator.status(), SearchStatus::Idle);
}

#[tokio::test]
async fn offset_counts_only_non_favorite_rows() {
    let h = harness(settings(4, OffsetPolicy::NonFavoriteRows), &["C:\\r1", "C:\\r2"]);
    let rows: Vec<String> = (0..10).map(|i| format!("C:\\r{}", i)).collect();
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    h.backend.with_rows("q", &rows);

    h.coordinator.set_term("q");
    fetch_all(&h).await;

    let offsets: Vec<u32> = h.backend.requests().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 2, 5, 9]);
    assert_eq!(
        paths(&h.coordinator),
        vec![
            "C:\\r1", "C:\\r2", "C:\\r0", "C:\\r3", "C:\\r4", "C:\\r5", "C:\\r6", "C:\\r7",
            "C:\\r8", "C:\\r9"
        ]
    );
}

#[tokio::test]
async fn offset_can_count_all_rows() {
    let h = harness(settings(4, OffsetPolicy::AllRows), &["C:\\r1", "C:\\r2"]);
    let rows: Vec<String> = (0..10).map(|i| format!("C:\\r{}", i)).collect();
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    h.backend.with_rows("q", &rows);

    h.coordinator.set_term("q");
    fetch_all(&h).await;

    let offsets: Vec<u32> = h.backend.requests().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
    assert_eq!(h.coordinator.snapshot().len(), 10);
    assert_eq!(h.coordinator.favorites_count(), 2);
}

#[tokio::test]
async fn page_of_only_favorites_still_advances() {
    let h = harness(settings(2, OffsetPolicy::NonFavoriteRows), &["C:\\f1", "C:\\f2"]);
    h.backend.with_rows("q", &["C:\\f1", "C:\\f2", "C:\\n1"]);

    h.coordinator.set_term("q");
    fetch_all(&h).await;

    let offsets: Vec<u32> = h.backend.requests().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 2]);
    assert_eq!(paths(&h.coordinator), vec!["C:\\f1", "C:\\f2", "C:\\n1"]);
}

#[tokio::test]
async fn published_rows_are_enriched() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("q", &["C:\\a.txt", "C:\\b.txt"]);

    h.coordinator.set_term("q");
    h.coordinator.wait_idle().await;

    for result in h.coordinator.snapshot() {
        assert!(matches!(result.metadata(), Metadata::Fetched(_)));
        assert_eq!(h.probe.calls_for(&result.path), 1);
    }
}

#[tokio::test]
async fn filter_prefix_is_joined_with_the_term() {
    let h = harness(SearchSettings::default(), &[]);
    let files = h.coordinator.catalog().find("Files").cloned().unwrap();

    h.coordinator.set_term("report");
    h.coordinator.wait_idle().await;
    h.coordinator.set_filter(files);
    h.coordinator.wait_idle().await;

    let expressions: Vec<String> = h
        .backend
        .requests()
        .iter()
        .map(|r| r.expression.clone())
        .collect();
    assert_eq!(expressions, vec!["report", "file: report"]);
}

#[tokio::test]
async fn term_and_filter_set_together_run_once() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("file: report", &["C:\\report.pdf"]);
    let files = h.coordinator.catalog().find("Files").cloned().unwrap();
    let before = h.coordinator.generation();

    h.coordinator.set_query("report", files);
    h.coordinator.wait_idle().await;

    assert_eq!(h.coordinator.generation(), before + 1);
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(h.backend.requests()[0].expression, "file: report");
    assert_eq!(paths(&h.coordinator), vec!["C:\\report.pdf"]);
}

#[tokio::test]
async fn cycling_and_reset_move_through_the_ring() {
    let h = harness(SearchSettings::default(), &[]);

    let next = h.coordinator.cycle_filter(1).unwrap();
    assert_eq!(next.name, "Files");
    assert_eq!(h.coordinator.query().filter.name, "Files");

    let back = h.coordinator.cycle_filter(-2).unwrap();
    assert_eq!(back.name, "Video");

    h.coordinator.set_term("something");
    h.coordinator.reset();
    let query = h.coordinator.query();
    assert_eq!(query.term, "");
    assert_eq!(query.filter, DEFAULT_FILTERS[0]);
}

#[tokio::test]
async fn regex_toggle_restricts_filters_and_requeries() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("^a", &["C:\\abc"]);
    let video = h.coordinator.catalog().find("video").cloned().unwrap();
    h.coordinator.set_filter(video);
    h.coordinator.set_term("^a");
    h.coordinator.wait_idle().await;
    let before = h.coordinator.generation();

    h.coordinator.apply_settings(SearchSettings {
        use_regex: true,
        ..Default::default()
    });
    h.coordinator.wait_idle().await;

    assert!(h.coordinator.generation() > before);
    assert_eq!(h.coordinator.query().filter.name, "All");
    assert_eq!(h.coordinator.catalog().len(), 1);
    let last = h.backend.requests().pop().unwrap();
    assert!(last.flags.use_regex);
    assert_eq!(last.expression, "^a");
    assert_eq!(paths(&h.coordinator), vec!["C:\\abc"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requery_always_carries_the_settings_that_triggered_it() {
    let h = harness(SearchSettings::default(), &[]);
    // no rows, so every generation ends after its first page
    h.coordinator.set_term("q");
    h.coordinator.wait_idle().await;

    let stop = Arc::new(AtomicBool::new(false));
    let pager = {
        let coordinator = h.coordinator.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::Relaxed) {
                coordinator.fetch_next_batch();
            }
        })
    };

    for round in 0..200u32 {
        let sort = 2 + round % 25;
        h.coordinator.apply_settings(SearchSettings {
            sort,
            ..Default::default()
        });
        h.coordinator.wait_idle().await;
        let last = h.backend.requests().pop().unwrap();
        assert_eq!(last.flags.sort, SortKey::from_code(sort));
    }

    stop.store(true, Ordering::Relaxed);
    pager.await.unwrap();
}

#[tokio::test]
async fn imported_filters_are_written_to_the_filter_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::new(
        dir.path().join("favorites.json"),
        dir.path().join("filters.json"),
    ));
    let h = harness(
        SearchSettings {
            import_filters: true,
            ..Default::default()
        },
        &[],
    );
    h.coordinator.attach_filter_store(store.clone());

    let logs = FilterSpec::new("Logs", "ext:log", "log");
    h.coordinator.set_user_filters(Some(vec![logs.clone()]));
    h.coordinator.wait_idle().await;

    assert!(h.coordinator.catalog().find("Logs").is_some());
    let saved = store.load_filters().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].name, "Logs");
    assert_eq!(saved[0].search_prefix, logs.search_prefix);
}

#[tokio::test]
async fn unrelated_settings_do_not_requery() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("q", &["C:\\q"]);
    h.coordinator.set_term("q");
    h.coordinator.wait_idle().await;
    let generation = h.coordinator.generation();

    h.coordinator.apply_settings(SearchSettings {
        enrichment_workers: 8,
        ..Default::default()
    });
    h.coordinator.wait_idle().await;

    assert_eq!(h.coordinator.generation(), generation);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn duplicate_rows_are_published_once() {
    let h = harness(SearchSettings::default(), &[]);
    h.backend.with_rows("q", &["C:\\Dup.txt", "c:\\dup.TXT", "C:\\other"]);

    h.coordinator.set_term("q");
    h.coordinator.wait_idle().await;

    assert_eq!(paths(&h.coordinator), vec!["C:\\Dup.txt", "C:\\other"]);
}
