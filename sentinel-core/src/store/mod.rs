//! Persistence interfaces the engine reads configuration from and writes
//! job history to.
//!
//! The engine only ever talks to these traits. Two implementations ship with
//! the crate: [`MemoryStore`] for tests and embedding, and `SqliteStore`
//! (feature `sqlite`) used by the `sentinel-sync` binary.

use crate::Result;
use crate::models::{
    AuditEntry, ConnectionStatus, DataSource, JobStatus, SyncConfig, SyncJob, TableConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod bundle;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use bundle::{BundledSyncConfig, ConfigBundle, ImportSummary};
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Selects job records. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub sync_config_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Jobs of one sync configuration.
    pub fn for_config(sync_config_id: impl Into<String>) -> Self {
        Self {
            sync_config_id: Some(sync_config_id.into()),
            ..Self::default()
        }
    }

    /// Caps the number of returned jobs.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Keeps only jobs in `status`.
    #[must_use]
    pub const fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn matches(&self, job: &SyncJob) -> bool {
        self.sync_config_id
            .as_deref()
            .is_none_or(|id| job.sync_config_id == id)
            && self.status.is_none_or(|status| job.status == status)
    }
}

/// Selects audit entries. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<String>,
    pub resource_id: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub(crate) fn matches(&self, entry: &AuditEntry) -> bool {
        self.event_type
            .as_deref()
            .is_none_or(|event| entry.event_type == event)
            && self
                .resource_id
                .as_deref()
                .is_none_or(|id| entry.resource_id.as_deref() == Some(id))
    }
}

/// Read access to operator-authored configuration, plus the two fields the
/// engine writes back.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn sync_config(&self, id: &str) -> Result<Option<SyncConfig>>;

    async fn data_source(&self, id: &str) -> Result<Option<DataSource>>;

    /// All table configurations of a sync configuration, active or not, in
    /// their authored order with columns in projection order.
    async fn table_configs(&self, sync_config_id: &str) -> Result<Vec<TableConfig>>;

    /// Active configurations with a non-manual schedule.
    async fn scheduled_configs(&self) -> Result<Vec<SyncConfig>>;

    /// Persists a table's new watermark.
    async fn record_watermark(&self, table_config_id: &str, value: &str) -> Result<()>;

    /// Persists the outcome of a connectivity probe.
    async fn record_connection_status(
        &self,
        data_source_id: &str,
        status: ConnectionStatus,
        tested_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Job history.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &SyncJob) -> Result<()>;

    /// Overwrites a job record.
    ///
    /// # Errors
    /// Returns [`crate::SentinelError::JobFinalized`] when the stored record is
    /// already terminal, and `NotFound` when it does not exist.
    async fn update_job(&self, job: &SyncJob) -> Result<()>;

    async fn job(&self, id: &str) -> Result<Option<SyncJob>>;

    async fn jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;
}

/// Everything the engine needs from persistence.
pub trait SyncStore: ConfigStore + JobStore + AuditSink {}

impl<T> SyncStore for T where T: ConfigStore + JobStore + AuditSink {}

pub(crate) fn finalized_error(job: &SyncJob) -> crate::SentinelError {
    crate::SentinelError::JobFinalized {
        job_id: job.id.clone(),
        status: job.status.as_str().to_string(),
    }
}
