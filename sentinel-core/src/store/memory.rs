//! In-memory store.

use super::{
    AuditFilter, AuditSink, ConfigBundle, ConfigStore, ImportSummary, JobFilter, JobStore,
    finalized_error,
};
use crate::models::{
    AuditEntry, ColumnConfig, ConnectionStatus, DataSource, SyncConfig, SyncJob, TableConfig,
};
use crate::{Result, SentinelError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    data_sources: HashMap<String, DataSource>,
    /// Insertion order is the scheduling order
    sync_configs: Vec<SyncConfig>,
    /// Insertion order is the extraction order
    table_configs: Vec<TableConfig>,
    jobs: Vec<SyncJob>,
    audit: Vec<AuditEntry>,
}

/// A [`super::SyncStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a data source.
    pub async fn insert_data_source(&self, source: DataSource) {
        self.state
            .write()
            .await
            .data_sources
            .insert(source.id.clone(), source);
    }

    /// Inserts or replaces a sync configuration.
    pub async fn insert_sync_config(&self, config: SyncConfig) {
        let mut state = self.state.write().await;
        match state.sync_configs.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config,
            None => state.sync_configs.push(config),
        }
    }

    /// Inserts or replaces a table configuration.
    pub async fn insert_table_config(&self, table: TableConfig) {
        let mut state = self.state.write().await;
        match state.table_configs.iter_mut().find(|t| t.id == table.id) {
            Some(existing) => *existing = table,
            None => state.table_configs.push(table),
        }
    }

    /// Appends a column to an existing table configuration.
    ///
    /// # Errors
    /// Returns `NotFound` when the table configuration does not exist.
    pub async fn insert_column_config(&self, column: ColumnConfig) -> Result<()> {
        let mut state = self.state.write().await;
        let table = state
            .table_configs
            .iter_mut()
            .find(|t| t.id == column.table_config_id)
            .ok_or_else(|| {
                SentinelError::not_found("Table configuration", column.table_config_id.clone())
            })?;
        table.columns.push(column);
        Ok(())
    }

    /// Imports every entity of a validated bundle.
    ///
    /// # Errors
    /// Returns `NotFound` when a sync configuration references a data source
    /// that is neither in the bundle nor already stored.
    pub async fn import_bundle(&self, bundle: ConfigBundle) -> Result<ImportSummary> {
        let summary = bundle.summary();
        {
            let state = self.state.read().await;
            if let Some(missing) = bundle
                .external_sources()
                .into_iter()
                .find(|id| !state.data_sources.contains_key(*id))
            {
                return Err(SentinelError::not_found("Data source", missing));
            }
        }

        for source in bundle.data_sources {
            self.insert_data_source(source).await;
        }
        for bundled in bundle.sync_configs {
            self.insert_sync_config(bundled.config).await;
            for table in bundled.tables {
                self.insert_table_config(table).await;
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn sync_config(&self, id: &str) -> Result<Option<SyncConfig>> {
        let state = self.state.read().await;
        Ok(state.sync_configs.iter().find(|c| c.id == id).cloned())
    }

    async fn data_source(&self, id: &str) -> Result<Option<DataSource>> {
        Ok(self.state.read().await.data_sources.get(id).cloned())
    }

    async fn table_configs(&self, sync_config_id: &str) -> Result<Vec<TableConfig>> {
        let state = self.state.read().await;
        Ok(state
            .table_configs
            .iter()
            .filter(|t| t.sync_config_id == sync_config_id)
            .cloned()
            .collect())
    }

    async fn scheduled_configs(&self) -> Result<Vec<SyncConfig>> {
        let state = self.state.read().await;
        Ok(state
            .sync_configs
            .iter()
            .filter(|c| c.wants_timer())
            .cloned()
            .collect())
    }

    async fn record_watermark(&self, table_config_id: &str, value: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let table = state
            .table_configs
            .iter_mut()
            .find(|t| t.id == table_config_id)
            .ok_or_else(|| SentinelError::not_found("Table configuration", table_config_id))?;
        table.last_sync_value = Some(value.to_string());
        Ok(())
    }

    async fn record_connection_status(
        &self,
        data_source_id: &str,
        status: ConnectionStatus,
        tested_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let source = state
            .data_sources
            .get_mut(data_source_id)
            .ok_or_else(|| SentinelError::not_found("Data source", data_source_id))?;
        source.connection_status = status;
        source.last_tested_at = Some(tested_at);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &SyncJob) -> Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.iter().any(|j| j.id == job.id) {
            return Err(SentinelError::configuration(format!(
                "Sync job {} already exists",
                job.id
            )));
        }
        state.jobs.push(job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &SyncJob) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| SentinelError::not_found("Sync job", job.id.clone()))?;
        if stored.status.is_terminal() {
            return Err(finalized_error(stored));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn job(&self, id: &str) -> Result<Option<SyncJob>> {
        let state = self.state.read().await;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .iter()
            .rev()
            .filter(|j| filter.matches(j))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.state.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseType, JobStatus, Schedule, TriggerSource};

    #[tokio::test]
    async fn test_terminal_job_is_immutable() -> Result<()> {
        let store = MemoryStore::new();
        let mut job = SyncJob::start("cfg", TriggerSource::Manual);
        store.create_job(&job).await?;

        job.rows_processed = 5;
        store.update_job(&job).await?;

        job.finish(JobStatus::Completed, None);
        store.update_job(&job).await?;

        job.rows_processed = 99;
        let result = store.update_job(&job).await;
        assert!(matches!(result, Err(SentinelError::JobFinalized { .. })));

        let stored = store.job(&job.id).await?.unwrap();
        assert_eq!(stored.rows_processed, 5);
        assert_eq!(stored.status, JobStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduled_configs_skip_manual_and_inactive() -> Result<()> {
        let store = MemoryStore::new();
        store
            .insert_sync_config(SyncConfig::new("a", "A", "ds", "out", "a.jsonl"))
            .await;
        store
            .insert_sync_config(
                SyncConfig::new("b", "B", "ds", "out", "b.jsonl").with_schedule(Schedule::Hourly),
            )
            .await;
        let mut inactive =
            SyncConfig::new("c", "C", "ds", "out", "c.jsonl").with_schedule(Schedule::Daily);
        inactive.is_active = false;
        store.insert_sync_config(inactive).await;

        let scheduled = store.scheduled_configs().await?;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].id, "b");
        Ok(())
    }

    #[tokio::test]
    async fn test_jobs_filter_newest_first() -> Result<()> {
        let store = MemoryStore::new();
        let first = SyncJob::start("cfg", TriggerSource::Manual);
        let second = SyncJob::start("cfg", TriggerSource::Schedule);
        let other = SyncJob::start("other", TriggerSource::Manual);
        for job in [&first, &second, &other] {
            store.create_job(job).await?;
        }

        let jobs = store.jobs(&JobFilter::for_config("cfg")).await?;
        assert_eq!(
            jobs.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
            vec![second.id.as_str(), first.id.as_str()]
        );
        let limited = store.jobs(&JobFilter::default().with_limit(1)).await?;
        assert_eq!(limited[0].id, other.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_watermark_and_status_write_back() -> Result<()> {
        let store = MemoryStore::new();
        store
            .insert_data_source(DataSource::new(
                "ds",
                "db",
                DatabaseType::Sqlite,
                "",
                "x.db",
            ))
            .await;
        store
            .insert_table_config(TableConfig::new("t", "cfg", "users"))
            .await;

        store.record_watermark("t", "42").await?;
        let now = Utc::now();
        store
            .record_connection_status("ds", ConnectionStatus::Connected, now)
            .await?;

        let tables = store.table_configs("cfg").await?;
        assert_eq!(tables[0].last_sync_value.as_deref(), Some("42"));
        let source = store.data_source("ds").await?.unwrap();
        assert_eq!(source.connection_status, ConnectionStatus::Connected);
        assert_eq!(source.last_tested_at, Some(now));

        assert!(store.record_watermark("missing", "1").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_import_requires_known_sources() {
        let store = MemoryStore::new();
        let mut bundle = ConfigBundle::default();
        bundle.sync_configs.push(super::super::BundledSyncConfig {
            config: SyncConfig::new("cfg", "C", "nowhere", "out", "c.jsonl"),
            tables: Vec::new(),
        });
        let result = store.import_bundle(bundle).await;
        assert!(matches!(result, Err(SentinelError::NotFound { .. })));
    }
}
