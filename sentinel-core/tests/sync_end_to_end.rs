//! End-to-end sync runs against real SQLite source databases.
//!
//! This test suite covers:
//! - Row caps, column masking, and projection into the artifact
//! - Incremental watermark round trips
//! - Admission rejection for back-to-back manual triggers
//! - Failed jobs for unreachable sources
//! - Configuration persisted through the SQLite store

#![cfg(feature = "sqlite")]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use sentinel_core::output::{ArtifactLine, read_artifact};
use sentinel_core::store::{BundledSyncConfig, ConfigStore, JobFilter, JobStore};
use sentinel_core::{
    ColumnConfig, ConfigBundle, DataSource, DatabaseType, EngineSettings, JobStatus, MaskingType,
    MemoryStore, Result, Scheduler, SentinelError, SqliteStore, SyncConfig, SyncExecutor,
    SyncMode, TableConfig,
};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Creates `source.db` with a three-row `users` table.
async fn seed_source(dir: &Path) -> (SqlitePool, String) {
    let path = dir.join("source.db");
    let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            email TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await
    .unwrap();
    for (id, email, updated_at) in [
        (1, "ada@example.com", "2024-01-01 09:00:00"),
        (2, "grace@example.com", "2024-01-02 09:00:00"),
        (3, "linus@example.com", "2024-01-03 09:00:00"),
    ] {
        sqlx::query("INSERT INTO users (id, email, updated_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(email)
            .bind(updated_at)
            .execute(&pool)
            .await
            .unwrap();
    }
    (pool, path.display().to_string())
}

fn users_table(row_limit: Option<u64>) -> TableConfig {
    let mut table = TableConfig::new("t-users", "cfg", "users")
        .with_column(ColumnConfig::new("c-id", "t-users", "id").primary_key())
        .with_column(
            ColumnConfig::new("c-email", "t-users", "email")
                .with_masking(MaskingType::Redact, None),
        );
    table.row_limit = row_limit;
    table
}

fn rows(lines: &[ArtifactLine<'_>]) -> Vec<Vec<Value>> {
    lines
        .iter()
        .filter_map(|line| match line {
            ArtifactLine::Row { values, .. } => Some(values.to_vec()),
            _ => None,
        })
        .collect()
}

async fn memory_scheduler(
    dir: &Path,
    source_path: String,
    config: SyncConfig,
    table: TableConfig,
) -> (Arc<MemoryStore>, Scheduler) {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_data_source(DataSource::new(
            "ds",
            "local",
            DatabaseType::Sqlite,
            "",
            source_path,
        ))
        .await;
    store.insert_sync_config(config).await;
    store.insert_table_config(table).await;

    let settings = EngineSettings::default()
        .with_hash_secret("integration-pepper")
        .with_default_output_dir(dir.join("fallback"));
    let executor = Arc::new(SyncExecutor::new(store.clone(), settings));
    (store, Scheduler::new(executor))
}

#[tokio::test]
async fn test_end_to_end_row_cap_and_redaction() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let (_pool, source_path) = seed_source(dir.path()).await;
    let out = dir.path().join("out");
    let config = SyncConfig::new("cfg", "Users", "ds", out.display().to_string(), "users.jsonl");
    let (store, scheduler) =
        memory_scheduler(dir.path(), source_path, config, users_table(Some(2))).await;

    let job = scheduler.trigger_and_wait("cfg", None).await?;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.rows_processed, 2);
    assert_eq!(job.tables_processed, 1);
    assert_eq!(store.job(&job.id).await?.unwrap().status, JobStatus::Completed);

    let path = out.join("users.jsonl");
    assert_eq!(job.output_file_path.as_deref(), Some(path.display().to_string().as_str()));
    let lines = read_artifact(&path, None).await?;
    assert_eq!(
        rows(&lines),
        vec![
            vec![json!(1), json!("***REDACTED***")],
            vec![json!(2), json!("***REDACTED***")],
        ]
    );
    assert!(
        matches!(&lines[1], ArtifactLine::Table { columns, .. } if columns.as_ref() == ["id".to_string(), "email".to_string()])
    );
    Ok(())
}

#[tokio::test]
async fn test_end_to_end_hash_is_stable_across_runs() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let (_pool, source_path) = seed_source(dir.path()).await;
    let config = SyncConfig::new("cfg", "Users", "ds", "", "hashed.jsonl");
    let table = TableConfig::new("t-users", "cfg", "users")
        .with_column(ColumnConfig::new("c-id", "t-users", "id").primary_key())
        .with_column(
            ColumnConfig::new("c-email", "t-users", "email")
                .with_target("email_hash")
                .with_masking(MaskingType::Hash, None),
        );
    let (_store, scheduler) = memory_scheduler(dir.path(), source_path, config, table).await;

    let first = scheduler.trigger_and_wait("cfg", None).await?;
    let path = dir.path().join("fallback").join("hashed.jsonl");
    let first_rows = rows(&read_artifact(&path, None).await?);

    let second = scheduler.trigger_and_wait("cfg", None).await?;
    let second_rows = rows(&read_artifact(&path, None).await?);

    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(first_rows.len(), 3);
    assert_eq!(first_rows, second_rows);
    let digest = first_rows[0][1].as_str().unwrap();
    assert_eq!(digest.len(), 64);
    assert_ne!(digest, "ada@example.com");
    Ok(())
}

#[tokio::test]
async fn test_end_to_end_incremental_round_trip() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let (pool, source_path) = seed_source(dir.path()).await;
    let out = dir.path().join("out");
    let config = SyncConfig::new("cfg", "Users", "ds", out.display().to_string(), "delta.jsonl")
        .with_sync_mode(SyncMode::Incremental);
    let table = users_table(None).with_incremental_column("updated_at");
    let (store, scheduler) = memory_scheduler(dir.path(), source_path, config, table).await;

    let first = scheduler.trigger_and_wait("cfg", None).await?;
    assert_eq!(first.status, JobStatus::Completed, "{:?}", first.error_message);
    assert_eq!(first.rows_processed, 3);
    let watermark = store.table_configs("cfg").await?[0].last_sync_value.clone();
    assert_eq!(watermark.as_deref(), Some("2024-01-03 09:00:00"));

    let second = scheduler.trigger_and_wait("cfg", None).await?;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.rows_processed, 0);
    assert_eq!(
        store.table_configs("cfg").await?[0].last_sync_value,
        watermark
    );
    assert!(rows(&read_artifact(&out.join("delta.jsonl"), None).await?).is_empty());

    sqlx::query("INSERT INTO users (id, email, updated_at) VALUES (4, 'new@example.com', '2024-02-01 00:00:00')")
        .execute(&pool)
        .await
        .unwrap();

    let third = scheduler.trigger_and_wait("cfg", None).await?;
    assert_eq!(third.rows_processed, 1);
    let third_rows = rows(&read_artifact(&out.join("delta.jsonl"), None).await?);
    assert_eq!(third_rows, vec![vec![json!(4), json!("***REDACTED***")]]);
    assert_eq!(
        store.table_configs("cfg").await?[0].last_sync_value.as_deref(),
        Some("2024-02-01 00:00:00")
    );
    Ok(())
}

#[tokio::test]
async fn test_capped_incremental_reads_rows_tied_past_the_cap() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let (pool, source_path) = seed_source(dir.path()).await;
    for id in [4, 5] {
        sqlx::query("INSERT INTO users (id, email, updated_at) VALUES (?, 'tie@example.com', '2024-01-03 09:00:00')")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
    }
    let out = dir.path().join("out");
    let config = SyncConfig::new("cfg", "Users", "ds", out.display().to_string(), "delta.jsonl")
        .with_sync_mode(SyncMode::Incremental);
    let table = users_table(Some(4)).with_incremental_column("updated_at");
    let (store, scheduler) = memory_scheduler(dir.path(), source_path, config, table).await;

    let mut seen = Vec::new();
    for _ in 0..2 {
        let job = scheduler.trigger_and_wait("cfg", None).await?;
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
        let batch = rows(&read_artifact(&out.join("delta.jsonl"), None).await?);
        seen.extend(batch.iter().filter_map(|row| row[0].as_i64()));
    }
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        store.table_configs("cfg").await?[0].last_sync_value.as_deref(),
        Some("2024-01-03 09:00:00")
    );
    Ok(())
}

#[tokio::test]
async fn test_back_to_back_trigger_rejected() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let (_pool, source_path) = seed_source(dir.path()).await;
    let config = SyncConfig::new("cfg", "Users", "ds", "", "users.jsonl");
    let (store, scheduler) =
        memory_scheduler(dir.path(), source_path, config, users_table(None)).await;

    let job_id = scheduler.trigger_immediate("cfg", None).await?;
    let second = scheduler.trigger_immediate("cfg", None).await;
    assert!(matches!(
        second,
        Err(SentinelError::JobAlreadyRunning { .. })
    ));

    let mut finished = None;
    for _ in 0..200 {
        let job = store.job(&job_id).await?.unwrap();
        if job.status.is_terminal() {
            finished = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(finished.unwrap().status, JobStatus::Completed);
    assert_eq!(store.jobs(&JobFilter::for_config("cfg")).await?.len(), 1);

    // The slot is free again once the run is over.
    for _ in 0..200 {
        if !scheduler.guard().is_running("cfg") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(scheduler.trigger_immediate("cfg", None).await.is_ok());
    Ok(())
}

#[cfg(feature = "postgresql")]
#[tokio::test]
async fn test_unreachable_source_fails_job() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .insert_data_source(
            DataSource::new("pg", "down", DatabaseType::PostgreSql, "127.0.0.1", "app")
                .with_port(1)
                .with_credentials("reader", "hunter2"),
        )
        .await;
    store
        .insert_sync_config(SyncConfig::new(
            "cfg",
            "Down",
            "pg",
            dir.path().display().to_string(),
            "down.jsonl",
        ))
        .await;
    store.insert_table_config(users_table(None)).await;

    let settings = EngineSettings::default().with_connect_timeout(Duration::from_secs(2));
    let scheduler = Scheduler::new(Arc::new(SyncExecutor::new(store.clone(), settings)));

    let job = scheduler.trigger_and_wait("cfg", None).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.tables_processed, 0);
    assert_eq!(job.rows_processed, 0);
    let message = job.error_message.unwrap();
    assert!(!message.is_empty());
    assert!(!message.contains("hunter2"));
    assert!(!dir.path().join("down.jsonl").exists());
    Ok(())
}

#[cfg(feature = "compression")]
#[tokio::test]
async fn test_end_to_end_with_sqlite_store() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let (_pool, source_path) = seed_source(dir.path()).await;
    let store = Arc::new(SqliteStore::open(&dir.path().join("meta.db").display().to_string()).await?);

    let out = dir.path().join("out");
    let bundle = ConfigBundle {
        data_sources: vec![DataSource::new(
            "ds",
            "local",
            DatabaseType::Sqlite,
            "",
            source_path,
        )],
        sync_configs: vec![BundledSyncConfig {
            config: SyncConfig::new("cfg", "Users", "ds", out.display().to_string(), "users.jsonl")
                .with_sync_mode(SyncMode::Incremental)
                .with_compression(true),
            tables: vec![users_table(None).with_incremental_column("updated_at")],
        }],
    };
    bundle.validate()?;
    store.import_bundle(bundle).await?;

    let executor = Arc::new(SyncExecutor::new(store.clone(), EngineSettings::default()));
    let scheduler = Scheduler::new(executor);
    let job = scheduler.trigger_and_wait("cfg", None).await?;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);

    let stored = store.job(&job.id).await?.unwrap();
    assert_eq!(stored.rows_processed, 3);
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(
        store.table_configs("cfg").await?[0].last_sync_value.as_deref(),
        Some("2024-01-03 09:00:00")
    );

    let path = out.join("users.jsonl.zst");
    assert_eq!(stored.output_file_path.as_deref(), Some(path.display().to_string().as_str()));
    assert_eq!(rows(&read_artifact(&path, None).await?).len(), 3);
    Ok(())
}
