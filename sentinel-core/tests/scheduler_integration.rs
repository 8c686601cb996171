//! Scheduler timer tests against a real SQLite source.

#![cfg(feature = "sqlite")]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use sentinel_core::store::{JobFilter, JobStore};
use sentinel_core::{
    ColumnConfig, DataSource, DatabaseType, EngineSettings, JobStatus, MemoryStore, Schedule,
    Scheduler, SyncConfig, SyncExecutor, TableConfig, TriggerSource,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn scheduler_with_configs(dir: &TempDir) -> (Arc<MemoryStore>, Scheduler) {
    let path = dir.path().join("source.db");
    let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .unwrap();
    sqlx::query("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO events (kind) VALUES ('login'), ('logout')")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let store = Arc::new(MemoryStore::new());
    store
        .insert_data_source(DataSource::new(
            "ds",
            "events",
            DatabaseType::Sqlite,
            "",
            path.display().to_string(),
        ))
        .await;

    let out = dir.path().join("out").display().to_string();
    let configs = [
        SyncConfig::new("every-second", "Every second", "ds", out.clone(), "a.jsonl").with_schedule(
            Schedule::Cron {
                expression: "* * * * * *".to_string(),
            },
        ),
        SyncConfig::new("nightly", "Nightly", "ds", out.clone(), "b.jsonl")
            .with_schedule(Schedule::Daily),
        SyncConfig::new("manual", "Manual", "ds", out, "c.jsonl"),
    ];
    for config in configs {
        let table = TableConfig::new(format!("{}-events", config.id), config.id.clone(), "events")
            .with_column(ColumnConfig::new(format!("{}-id", config.id), "", "id").primary_key())
            .with_column(ColumnConfig::new(format!("{}-kind", config.id), "", "kind"));
        store.insert_sync_config(config).await;
        store.insert_table_config(table).await;
    }

    let executor = Arc::new(SyncExecutor::new(store.clone(), EngineSettings::default()));
    (store, Scheduler::new(executor))
}

#[tokio::test]
async fn test_scheduler_initialize_and_unschedule() {
    let dir = TempDir::new().unwrap();
    let (_store, scheduler) = scheduler_with_configs(&dir).await;

    assert_eq!(scheduler.initialize().await, 2);
    let status = scheduler.status();
    assert_eq!(status.total_scheduled, 2);
    let ids: Vec<&str> = status.schedules.iter().map(|s| s.config_id.as_str()).collect();
    assert_eq!(ids, vec!["every-second", "nightly"]);
    assert_eq!(status.schedules[1].cron_expression, "0 0 * * *");

    scheduler.unschedule("nightly");
    let status = scheduler.status();
    assert_eq!(status.total_scheduled, 1);
    assert!(status.schedules.iter().all(|s| s.config_id != "nightly"));

    scheduler.unschedule("nightly");
    scheduler.stop();
    assert_eq!(scheduler.status().total_scheduled, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scheduler_timer_fires() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = scheduler_with_configs(&dir).await;
    scheduler.initialize().await;

    let mut scheduled = Vec::new();
    for _ in 0..60 {
        scheduled = store
            .jobs(&JobFilter::for_config("every-second").with_status(JobStatus::Completed))
            .await
            .unwrap();
        if !scheduled.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    scheduler.stop();

    assert!(!scheduled.is_empty(), "timer never produced a completed job");
    assert!(
        scheduled
            .iter()
            .all(|job| job.triggered_by == TriggerSource::Schedule && job.rows_processed == 2)
    );
    assert!(
        store
            .jobs(&JobFilter::for_config("manual"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timer_skips_firing_while_run_in_flight() {
    let dir = TempDir::new().unwrap();
    let (store, scheduler) = scheduler_with_configs(&dir).await;

    // A manual run of the same configuration holds the slot across several firings.
    let permit = scheduler.guard().admit("every-second").unwrap();
    scheduler.initialize().await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(
        store
            .jobs(&JobFilter::for_config("every-second"))
            .await
            .unwrap()
            .is_empty(),
        "a skipped firing created a job"
    );

    drop(permit);
    let mut fired = false;
    for _ in 0..60 {
        if !store
            .jobs(&JobFilter::for_config("every-second"))
            .await
            .unwrap()
            .is_empty()
        {
            fired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    scheduler.stop();
    assert!(fired, "timer stopped firing after the slot was released");
}
