//! End-to-end pipeline tests against the in-memory reference warehouse.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use warehouse_migrate::staging::partition_path;
use warehouse_migrate::{
    idempotency_key, ColumnSpec, ColumnType, Extractor, JobState, JobStatus, Loader,
    MemoryStagingStore, MemoryWarehouse, MigrationJob, PipelineOptions, PipelineState, Row,
    StateStore, TableSpec, TaskKind, Validator, Value, Verdict, Window, WorkflowCoordinator,
};

fn window() -> Window {
    Window {
        start: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap(),
    }
}

fn event_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec {
            name: "event_id".into(),
            data_type: ColumnType::Int,
        },
        ColumnSpec {
            name: "user_id".into(),
            data_type: ColumnType::Int,
        },
        ColumnSpec {
            name: "event_type".into(),
            data_type: ColumnType::Text,
        },
        ColumnSpec {
            name: "event_ts".into(),
            data_type: ColumnType::Timestamp,
        },
    ]
}

fn column_names() -> Vec<String> {
    event_columns().into_iter().map(|c| c.name).collect()
}

fn event_rows(n: i64) -> Vec<Row> {
    let kinds = ["read_online", "download", "review", "search"];
    (0..n)
        .map(|i| {
            let ts = Utc
                .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
                .unwrap()
                + chrono::Duration::seconds(i % 86_400);
            vec![
                Value::Int(i),
                Value::Int(i % 137),
                Value::Text(kinds[(i % 4) as usize].into()),
                Value::Timestamp(ts),
            ]
        })
        .collect()
}

fn table_spec(source: &str, target: &str) -> TableSpec {
    TableSpec {
        source: source.into(),
        target: target.into(),
        partition_column: "event_ts".into(),
        columns: event_columns(),
        tolerance: None,
    }
}

fn job_for(tables: Vec<TableSpec>) -> MigrationJob {
    MigrationJob {
        tables,
        window: window(),
        options: PipelineOptions {
            backoff_base_ms: Some(10),
            ..Default::default()
        },
    }
}

struct Harness {
    staging: Arc<MemoryStagingStore>,
    source: Arc<MemoryWarehouse>,
    target: Arc<MemoryWarehouse>,
    state: Arc<StateStore>,
    coordinator: Arc<WorkflowCoordinator>,
}

fn harness_with_state(state: StateStore) -> Harness {
    let staging = Arc::new(MemoryStagingStore::new());
    let source = Arc::new(MemoryWarehouse::new(staging.clone()));
    let target = Arc::new(MemoryWarehouse::new(staging.clone()));
    let state = Arc::new(state);
    let coordinator = Arc::new(WorkflowCoordinator::new(
        source.clone(),
        target.clone(),
        staging.clone(),
        state.clone(),
    ));
    Harness {
        staging,
        source,
        target,
        state,
        coordinator,
    }
}

fn harness() -> Harness {
    harness_with_state(StateStore::in_memory())
}

/// Seed a source table with `n` rows and create its empty target twin.
fn seed(h: &Harness, source: &str, target: &str, n: i64) {
    h.source.create_table(source, column_names());
    h.source.insert_rows(source, event_rows(n)).unwrap();
    h.target.create_table(target, column_names());
}

#[tokio::test]
async fn test_happy_path_single_table() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 1000);

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    let outcome = h.coordinator.run(&job_id).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.tables_passed, 1);
    assert_eq!(h.target.row_count("analytics.events"), 1000);

    let report = h
        .coordinator
        .report(&job_id, "analytics.events")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.verdict, Verdict::Pass);
    assert_eq!(report.source_rows, 1000);
    assert_eq!(report.target_rows, 1000);

    // Staged data is garbage-collected after a PASS.
    let path = partition_path("library.events", &window());
    assert!(h.staging.rows_at(&path).is_none());
}

#[tokio::test]
async fn test_validation_is_idempotent() {
    let h = harness();
    h.source.create_table("t", column_names());
    h.target.create_table("t2", column_names());
    let rows = event_rows(200);
    h.source.insert_rows("t", rows.clone()).unwrap();
    h.target.insert_rows("t2", rows).unwrap();

    let validator = Validator::new(h.source.clone(), h.target.clone());
    let spec = table_spec("t", "t2");

    let first = validator.validate(&spec, &window(), 0.0).await.unwrap();
    let second = validator.validate(&spec, &window(), 0.0).await.unwrap();

    assert_eq!(first.verdict, Verdict::Pass);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn test_re_extract_overwrites_staged_data() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 300);

    let extractor = Extractor::new(h.source.clone(), h.staging.clone());
    let spec = table_spec("library.events", "analytics.events");

    let first = extractor.extract(&spec, &window()).await.unwrap();
    let second = extractor.extract(&spec, &window()).await.unwrap();

    assert_eq!(first.row_count, 300);
    assert_eq!(second.row_count, 300);
    assert_eq!(first.checksum, second.checksum);

    let staged = h.staging.rows_at(&first.location).unwrap();
    assert_eq!(staged.len(), 300);
}

#[tokio::test]
async fn test_load_twice_is_exactly_once() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 250);

    let extractor = Extractor::new(h.source.clone(), h.staging.clone());
    let loader = Loader::new(h.target.clone());
    let spec = table_spec("library.events", "analytics.events");

    let staged = extractor.extract(&spec, &window()).await.unwrap();
    let key = idempotency_key(&spec.source, &window(), TaskKind::Load);

    loader.load(&staged, &spec, &key).await.unwrap();
    loader.load(&staged, &spec, &key).await.unwrap();

    assert_eq!(h.target.row_count("analytics.events"), 250);
}

#[tokio::test]
async fn test_row_count_mismatch_never_passes() {
    let h = harness();
    h.source.create_table("t", column_names());
    h.target.create_table("t2", column_names());
    h.source.insert_rows("t", event_rows(1000)).unwrap();
    h.target.insert_rows("t2", event_rows(999)).unwrap();

    let validator = Validator::new(h.source.clone(), h.target.clone());
    let spec = table_spec("t", "t2");

    // Exact-match tolerance: FAIL.
    let strict = validator.validate(&spec, &window(), 0.0).await.unwrap();
    assert_eq!(strict.verdict, Verdict::Fail);
    assert!(!strict.row_count_match);

    // Even a fully permissive tolerance flags the mismatch for review.
    let lax = validator.validate(&spec, &window(), 1.0).await.unwrap();
    assert_eq!(lax.verdict, Verdict::Inconclusive);
}

#[tokio::test]
async fn test_matching_aggregates_pass_at_zero_tolerance() {
    let h = harness();
    h.source.create_table("t", column_names());
    h.target.create_table("t2", column_names());
    let rows = event_rows(1000);
    h.source.insert_rows("t", rows.clone()).unwrap();
    h.target.insert_rows("t2", rows).unwrap();

    let validator = Validator::new(h.source.clone(), h.target.clone());
    let report = validator
        .validate(&table_spec("t", "t2"), &window(), 0.0)
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Pass);
    assert_eq!(report.checks_mismatched, 0);
    assert!(report.columns.values().all(|c| c.matches));
}

#[tokio::test]
async fn test_transient_extract_failures_are_retried() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 400);
    h.source.fail_next_extracts(2);

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    let outcome = h.coordinator.run(&job_id).await.unwrap();

    // Attempts 1 and 2 fail, attempt 3 succeeds; the pipeline proceeds all
    // the way through validation without intervention.
    assert_eq!(outcome.tables_passed, 1);

    let snapshot = h.state.snapshot(&job_id).await.unwrap();
    let progress = snapshot.tables.get("analytics.events").unwrap();
    assert_eq!(progress.tasks.get(&TaskKind::Extract).unwrap().attempts, 3);
    assert_eq!(progress.pipeline, PipelineState::Passed);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_task() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 100);
    h.source.fail_next_extracts(5);

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    let outcome = h.coordinator.run(&job_id).await.unwrap();

    assert_eq!(outcome.tables_failed_task, 1);
    let states = h.coordinator.status(&job_id).await.unwrap();
    assert_eq!(
        states.get("analytics.events").copied().unwrap(),
        PipelineState::FailedTask
    );
}

#[tokio::test]
async fn test_partial_load_rolls_back_before_retry() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 500);
    h.target.fail_next_load_partial("analytics.events");

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    let outcome = h.coordinator.run(&job_id).await.unwrap();

    // The retry must first remove the partially applied batch: the final
    // row count equals the staged count exactly, no duplicates.
    assert_eq!(outcome.tables_passed, 1);
    assert_eq!(h.target.row_count("analytics.events"), 500);

    let snapshot = h.state.snapshot(&job_id).await.unwrap();
    let progress = snapshot.tables.get("analytics.events").unwrap();
    assert_eq!(progress.tasks.get(&TaskKind::Load).unwrap().attempts, 2);
}

#[tokio::test]
async fn test_lossy_load_is_caught_by_validation() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 600);
    h.target.lose_rows_on_load("analytics.events", 7);

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    let outcome = h.coordinator.run(&job_id).await.unwrap();

    assert_eq!(outcome.tables_failed_validation, 1);
    let report = outcome.reports.get("analytics.events").unwrap();
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(report.target_rows, 593);

    // Failed validation retains the staged partition for diagnosis.
    let path = partition_path("library.events", &window());
    assert!(h.staging.rows_at(&path).is_some());
}

#[tokio::test]
async fn test_coordinator_default_tolerance_applies() {
    let staging = Arc::new(MemoryStagingStore::new());
    let source = Arc::new(MemoryWarehouse::new(staging.clone()));
    let target = Arc::new(MemoryWarehouse::new(staging.clone()));
    let state = Arc::new(StateStore::in_memory());
    let coordinator = Arc::new(
        WorkflowCoordinator::new(
            source.clone(),
            target.clone(),
            staging.clone(),
            state.clone(),
        )
        .with_options(PipelineOptions {
            default_tolerance: Some(1.0),
            ..Default::default()
        }),
    );

    source.create_table("library.events", column_names());
    source.insert_rows("library.events", event_rows(50)).unwrap();
    target.create_table("analytics.events", column_names());
    target.lose_rows_on_load("analytics.events", 3);

    let job_id = coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    let outcome = coordinator.run(&job_id).await.unwrap();

    // Within tolerance means flagged for review, never a silent pass.
    assert_eq!(outcome.tables_failed_validation, 1);
    assert_eq!(
        outcome.reports.get("analytics.events").unwrap().verdict,
        Verdict::Inconclusive
    );
}

#[tokio::test]
async fn test_tables_progress_independently() {
    let h = harness();
    seed(&h, "library.fast", "analytics.fast", 100);
    seed(&h, "library.slow", "analytics.slow", 100);
    h.target
        .set_load_delay("analytics.slow", Duration::from_millis(700));

    let job_id = h
        .coordinator
        .submit(job_for(vec![
            table_spec("library.slow", "analytics.slow"),
            table_spec("library.fast", "analytics.fast"),
        ]))
        .await
        .unwrap();

    let run_task = tokio::spawn({
        let coordinator = h.coordinator.clone();
        let job_id = job_id.clone();
        async move { coordinator.run(&job_id).await }
    });

    // The fast table must pass while the slow table's loader is blocked.
    let mut observed_overlap = false;
    for _ in 0..200 {
        let states = h.coordinator.status(&job_id).await.unwrap();
        let fast = states.get("analytics.fast").copied();
        let slow = states.get("analytics.slow").copied();
        if fast == Some(PipelineState::Passed)
            && slow.map(|s| !s.is_terminal()).unwrap_or(false)
        {
            observed_overlap = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let outcome = run_task.await.unwrap().unwrap();
    assert!(observed_overlap, "fast table should finish while slow loads");
    assert_eq!(outcome.tables_passed, 2);
}

#[tokio::test]
async fn test_cancel_stops_further_stages() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 200);
    h.target
        .set_load_delay("analytics.events", Duration::from_millis(800));

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();

    let run_task = tokio::spawn({
        let coordinator = h.coordinator.clone();
        let job_id = job_id.clone();
        async move { coordinator.run(&job_id).await }
    });

    // Let the pipeline reach the (slow) load stage, then cancel.
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.coordinator.cancel(&job_id).await.unwrap();

    let outcome = run_task.await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(outcome.tables_cancelled, 1);
    assert_eq!(outcome.reports.len(), 0);
}

#[tokio::test]
async fn test_submit_rejects_malformed_jobs() {
    let h = harness();

    let empty = job_for(vec![]);
    assert!(h.coordinator.submit(empty).await.is_err());

    let duplicate = job_for(vec![
        table_spec("library.a", "analytics.same"),
        table_spec("library.b", "analytics.same"),
    ]);
    assert!(h.coordinator.submit(duplicate).await.is_err());

    let mut inverted = job_for(vec![table_spec("library.a", "analytics.a")]);
    std::mem::swap(&mut inverted.window.start, &mut inverted.window.end);
    assert!(h.coordinator.submit(inverted).await.is_err());
}

#[tokio::test]
async fn test_rerun_skips_completed_tables() {
    let h = harness();
    seed(&h, "library.events", "analytics.events", 150);

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    let first = h.coordinator.run(&job_id).await.unwrap();
    assert_eq!(first.tables_passed, 1);

    let attempts_before = h
        .state
        .snapshot(&job_id)
        .await
        .unwrap()
        .tables
        .get("analytics.events")
        .unwrap()
        .tasks
        .get(&TaskKind::Extract)
        .unwrap()
        .attempts;

    let second = h.coordinator.run(&job_id).await.unwrap();
    assert_eq!(second.tables_passed, 1);
    assert_eq!(h.target.row_count("analytics.events"), 150);

    let attempts_after = h
        .state
        .snapshot(&job_id)
        .await
        .unwrap()
        .tables
        .get("analytics.events")
        .unwrap()
        .tasks
        .get(&TaskKind::Extract)
        .unwrap()
        .attempts;
    assert_eq!(attempts_before, attempts_after);
}

#[tokio::test]
async fn test_failed_table_does_not_abort_siblings() {
    let h = harness();
    seed(&h, "library.good", "analytics.good", 120);
    // No source table for the bad spec: permanent extraction error.
    h.target.create_table("analytics.bad", column_names());

    let job_id = h
        .coordinator
        .submit(job_for(vec![
            table_spec("library.missing", "analytics.bad"),
            table_spec("library.good", "analytics.good"),
        ]))
        .await
        .unwrap();
    let outcome = h.coordinator.run(&job_id).await.unwrap();

    assert_eq!(outcome.tables_failed_task, 1);
    assert_eq!(outcome.tables_passed, 1);
    assert_eq!(outcome.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_state_survives_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with_state(StateStore::with_dir(dir.path()).unwrap());
    seed(&h, "library.events", "analytics.events", 80);

    let job_id = h
        .coordinator
        .submit(job_for(vec![table_spec("library.events", "analytics.events")]))
        .await
        .unwrap();
    h.coordinator.run(&job_id).await.unwrap();

    let loaded = JobState::load(dir.path().join(format!("{}.json", job_id))).unwrap();
    assert_eq!(loaded.status, JobStatus::Completed);
    assert_eq!(
        loaded.tables.get("analytics.events").unwrap().pipeline,
        PipelineState::Passed
    );
    assert!(loaded.hmac.is_some());
}
