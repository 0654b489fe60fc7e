use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use lotsync_adapters::{ChangeRecord, ListingApi, ScriptedListingApi};
use lotsync_core::{
    ChangeKind, DictionaryTranslator, IdentityTranslator, IngestionSource, OperationKind,
    OperationStatus, RawRecord,
};
use lotsync_storage::{LockError, MemoryStore, RawWrite, RunLock, Store};
use lotsync_sync::{
    build_api, run_bulk_load, run_daily_update, run_normalization, status_report, ChangeApplier,
    ChangeWalker, Normalizer, SyncConfig, WalkOutcome, INGEST_LOCK,
};
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn test_config(dir: &TempDir) -> SyncConfig {
    SyncConfig {
        lock_dir: dir.path().to_path_buf(),
        bulk_page_delay: Duration::ZERO,
        change_page_delay: Duration::ZERO,
        normalization_batch_size: 2,
        ..Default::default()
    }
}

fn change(value: JsonValue) -> ChangeRecord {
    serde_json::from_value(value).expect("change record")
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("date")
}

async fn seed_raw(store: &MemoryStore, id: &str, payload: JsonValue) {
    let now = Utc::now();
    store
        .commit_raw_page(vec![RawWrite::Insert(RawRecord::first_sight(
            id,
            ChangeKind::Added,
            now,
            payload,
            IngestionSource::Incremental,
            now,
        ))])
        .await
        .expect("seed");
}

#[tokio::test]
async fn repeated_added_change_is_a_duplicate() {
    let store = MemoryStore::new();
    let applier = ChangeApplier::new(&store, IngestionSource::Incremental);
    let added = [change(json!({"inner_id": "a", "change_type": "added", "data": {"price": 1}}))];

    let first = applier.apply_page(&added, Utc::now()).await.expect("first");
    let second = applier.apply_page(&added, Utc::now()).await.expect("second");

    assert_eq!(first.loaded, 1);
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.updated, 0);
    assert_eq!(store.raw_records().await.len(), 1);
}

#[tokio::test]
async fn delta_only_change_touches_only_mapped_fields() {
    let store = MemoryStore::new();
    let applier = ChangeApplier::new(&store, IngestionSource::Incremental);
    applier
        .apply_page(
            &[change(json!({"inner_id": "a", "data": {"price": 100, "mark": "BYD", "year": 2019}}))],
            Utc::now(),
        )
        .await
        .expect("seed");
    applier
        .apply_page(
            &[change(json!({"inner_id": "a", "change_type": "changed", "data": {"new_price": 95, "new_color": "red"}}))],
            Utc::now(),
        )
        .await
        .expect("change");

    let a = store.get_raw("a").await.expect("get").expect("a");
    assert_eq!(
        a.payload,
        json!({"price": 95, "mark": "BYD", "year": 2019, "color": "red"})
    );
}

#[tokio::test]
async fn failed_page_commit_leaves_watermark_and_records_error() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = MemoryStore::new();
    let date = day(2024, 3, 1);
    let api = ScriptedListingApi::default()
        .with_change_cursor(date, 10)
        .with_changes(10, json!([{"inner_id": "a"}, {"inner_id": "b"}]), 10, None);
    store.fail_next_commits(1);

    let report = run_daily_update(&store, &api, &config, Some(date))
        .await
        .expect("run");
    assert!(matches!(report.outcome, WalkOutcome::Failed(_)));
    assert_eq!(report.stats.errors, 2);
    assert!(store.load_watermark().await.expect("load").is_none());
    assert!(store.raw_records().await.is_empty());

    let ops = store.operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::DataFetch);
    assert_eq!(ops[0].status, OperationStatus::Error);

    // The retry of the same date starts from scratch and succeeds.
    let retry = run_daily_update(&store, &api, &config, Some(date))
        .await
        .expect("retry");
    assert_eq!(retry.outcome, WalkOutcome::Completed);
    assert_eq!(retry.stats.loaded, 2);
    let mark = store.load_watermark().await.expect("load").expect("watermark");
    assert_eq!(mark.last_successful_date, date);
    assert_eq!(mark.last_cursor, Some(10));
}

#[tokio::test]
async fn empty_page_with_next_cursor_keeps_walking() {
    let store = MemoryStore::new();
    let date = day(2024, 3, 1);
    let api = ScriptedListingApi::default()
        .with_change_cursor(date, 1)
        .with_changes(1, json!([]), 1, Some(2))
        .with_changes(2, json!([{"inner_id": "late"}]), 2, None);

    let report = ChangeWalker::new(&api, &store, Duration::ZERO)
        .drain(date)
        .await
        .expect("drain");
    assert_eq!(report.pages, 2);
    assert_eq!(report.stats.loaded, 1);
    assert_eq!(report.last_cursor, Some(2));
}

#[tokio::test]
async fn year_boundary_accepts_next_year_only() {
    let store = MemoryStore::new();
    let year = Utc::now().year();
    seed_raw(&store, "next", json!({"year": year + 1})).await;
    seed_raw(&store, "after", json!({"year": year + 2})).await;

    let stats = Normalizer::new(&store, &IdentityTranslator, 10)
        .run(None)
        .await
        .expect("run");
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.errors, 1);
    assert!(store.get_processed("next").await.expect("get").is_some());
    assert!(store.get_processed("after").await.expect("get").is_none());
    assert!(!store.get_raw("after").await.expect("get").expect("after").processed);
}

#[tokio::test]
async fn failed_batch_commit_leaves_every_record_unprocessed() {
    let store = MemoryStore::new();
    seed_raw(&store, "a", json!({"year": 2019})).await;
    seed_raw(&store, "b", json!({"year": 2020})).await;
    store.fail_next_commits(1);

    let normalizer = Normalizer::new(&store, &IdentityTranslator, 10);
    let stats = normalizer.run(None).await.expect("run");
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.errors, 2);
    for record in store.raw_records().await {
        assert!(!record.processed, "{} should stay unprocessed", record.external_id);
    }
    assert!(store.get_processed("a").await.expect("get").is_none());

    let again = normalizer.run(None).await.expect("rerun");
    assert_eq!(again.processed, 2);
    assert_eq!(store.count_unprocessed().await.expect("count"), 0);
}

#[tokio::test]
async fn truncated_registration_date_completes_to_first_of_month() {
    let store = MemoryStore::new();
    seed_raw(&store, "d", json!({"first_registration": "2020-05"})).await;
    Normalizer::new(&store, &IdentityTranslator, 10)
        .run(None)
        .await
        .expect("run");
    let processed = store.get_processed("d").await.expect("get").expect("d");
    assert_eq!(processed.fields.first_registration, Some(day(2020, 5, 1)));
}

#[tokio::test]
async fn identically_translated_options_appear_once() {
    let store = MemoryStore::new();
    seed_raw(
        &store,
        "o",
        json!({"extra": {"option": {
            "displayopts": [{"optionname": "ABS防抱死"}],
            "moreoptions": [{"opts": [{"optionname": "abs防抱死"}, {"optionname": "定速巡航"}]}]
        }}}),
    )
    .await;
    let dict = DictionaryTranslator::from([
        ("ABS防抱死", "ABS"),
        ("abs防抱死", "ABS"),
        ("定速巡航", "Cruise control"),
    ]);
    Normalizer::new(&store, &dict, 10)
        .run(None)
        .await
        .expect("run");
    let processed = store.get_processed("o").await.expect("get").expect("o");
    assert_eq!(processed.fields.options, vec!["ABS", "Cruise control"]);
}

#[tokio::test]
async fn seeded_record_normalizes_end_to_end() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = MemoryStore::new();
    seed_raw(&store, "e2e", json!({"year": "2 019", "price": 150000})).await;

    let stats = run_normalization(&store, &IdentityTranslator, &config, None)
        .await
        .expect("normalize");
    assert_eq!(stats.created, 1);

    let processed = store.get_processed("e2e").await.expect("get").expect("e2e");
    assert_eq!(processed.fields.year, Some(2019));
    assert_eq!(processed.fields.price, Some(150_000));
    assert!(processed.active);
    assert!(store.get_raw("e2e").await.expect("get").expect("raw").processed);

    let ops = store.operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Normalization);
    assert_eq!(ops[0].status, OperationStatus::Ok);
}

#[tokio::test]
async fn fixture_replay_runs_the_full_pipeline() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(&dir);
    config.translations_path = Some(fixture("dictionary.json"));
    let store = MemoryStore::new();
    let feed = fixture("feed_2024_03_01.json");
    let api = build_api(&config, Some(feed.as_path())).expect("api");
    let translator = lotsync_sync::load_translator(&config).expect("translator");

    let bulk = run_bulk_load(&store, api.as_ref(), &config, None)
        .await
        .expect("bulk");
    assert_eq!(bulk.loaded, 2);

    let walk = run_daily_update(&store, api.as_ref(), &config, Some(day(2024, 3, 1)))
        .await
        .expect("update");
    assert_eq!(walk.outcome, WalkOutcome::Completed);
    assert_eq!((walk.stats.loaded, walk.stats.updated, walk.stats.removed), (1, 1, 1));

    let normalized = run_normalization(&store, translator.as_ref(), &config, None)
        .await
        .expect("normalize");
    assert_eq!(normalized.created, 3);
    assert_eq!(normalized.errors, 0);

    let byd = store.get_processed("1001").await.expect("get").expect("1001");
    assert_eq!(byd.fields.mark.as_deref(), Some("BYD"));
    assert_eq!(byd.fields.year, Some(2019));
    assert_eq!(byd.fields.price, Some(142_000));
    assert_eq!(byd.fields.km_age, Some(36_000));
    assert_eq!(
        byd.source_created_at,
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).single().expect("ts")
    );

    let geely = store.get_processed("1002").await.expect("get").expect("1002");
    assert!(!geely.active);
    assert_eq!(geely.fields.mark.as_deref(), Some("Geely"));

    let changan = store.get_processed("1003").await.expect("get").expect("1003");
    assert_eq!(changan.fields.first_registration, Some(day(2022, 6, 1)));

    let status = status_report(&store, 10).await.expect("status");
    assert_eq!(status.raw_total, 3);
    assert_eq!(status.raw_unprocessed, 0);
    assert_eq!(status.raw_inactive, 1);
    assert_eq!(status.processed_total, 3);
    assert_eq!(status.recent_operations.len(), 3);
    assert_eq!(status.recent_operations[0].kind, OperationKind::Normalization);
    assert_eq!(
        status.watermark.map(|w| w.last_successful_date),
        Some(day(2024, 3, 1))
    );

    let offer = api.offer("1001").await.expect("offer");
    assert_eq!(offer["inner_id"], "1001");
}

#[tokio::test]
async fn held_ingest_lock_refuses_a_second_run() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = MemoryStore::new();
    let api = ScriptedListingApi::default();
    let _held = RunLock::acquire(dir.path(), INGEST_LOCK).expect("lock");

    let err = run_daily_update(&store, &api, &config, Some(day(2024, 3, 1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LockError>(),
        Some(LockError::Held { .. })
    ));
    assert!(api.calls().await.is_empty());
    assert!(store.operations().await.is_empty());

    // Normalization uses its own lock and is unaffected.
    run_normalization(&store, &IdentityTranslator, &config, None)
        .await
        .expect("normalize");
}
