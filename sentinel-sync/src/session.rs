//! Store, executor, and scheduler wiring shared by every subcommand.

use sentinel_core::connectors::SourceTable;
use sentinel_core::store::{ImportSummary, JobFilter, JobStore};
use sentinel_core::{
    Actor, ConfigBundle, EngineSettings, ProbeReport, Result, Scheduler, SchedulerStatus,
    SentinelError, SqliteStore, SyncExecutor, SyncJob,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long `serve` waits for in-flight runs after shutdown is requested.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// An open metadata store plus the engine components built on it.
pub struct Session {
    store: Arc<SqliteStore>,
    scheduler: Scheduler,
    actor: Option<Actor>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("scheduler", &self.scheduler)
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens the store at `path` and builds the engine on it.
    ///
    /// # Errors
    /// Returns a store error when the file cannot be opened.
    pub async fn open(path: &Path, settings: EngineSettings, actor: Option<String>) -> Result<Self> {
        let store = SqliteStore::open(&path.display().to_string()).await?;
        info!("Opened metadata store {}", path.display());
        Ok(Self::with_store(Arc::new(store), settings, actor))
    }

    /// Builds the engine on an already open store.
    pub fn with_store(store: Arc<SqliteStore>, settings: EngineSettings, actor: Option<String>) -> Self {
        let executor = Arc::new(SyncExecutor::new(store.clone(), settings));
        Self {
            store,
            scheduler: Scheduler::new(executor),
            actor: actor.map(Actor::new),
        }
    }

    /// The scheduler backing `serve` and `run`.
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Schedules every active configuration, waits for `shutdown`, then
    /// stops the timers and waits up to [`DRAIN_TIMEOUT`] for in-flight runs.
    ///
    /// Returns the scheduler status as it was right before shutdown.
    pub async fn serve<F>(&self, shutdown: F) -> SchedulerStatus
    where
        F: Future<Output = ()>,
    {
        let scheduled = self.scheduler.initialize().await;
        info!("Serving {} scheduled configurations", scheduled);

        shutdown.await;
        let status = self.scheduler.status();
        info!("Shutdown requested");
        self.scheduler.stop();
        self.drain(DRAIN_TIMEOUT).await;
        status
    }

    async fn drain(&self, timeout: Duration) {
        let started = Instant::now();
        loop {
            let running = self.scheduler.guard().running();
            if running.is_empty() {
                return;
            }
            if started.elapsed() >= timeout {
                warn!(
                    "Leaving {} runs in flight after {:?}: {}",
                    running.len(),
                    timeout,
                    running.join(", ")
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Runs one configuration to completion.
    ///
    /// # Errors
    /// Returns `JobAlreadyRunning`, configuration errors, and connector
    /// construction errors. A job that ran and failed is returned as `Ok`.
    pub async fn run(&self, config_id: &str) -> Result<SyncJob> {
        self.scheduler
            .trigger_and_wait(config_id, self.actor.as_ref())
            .await
    }

    /// Probes a data source and records its connection status.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown data sources and store failures.
    pub async fn test_source(&self, data_source_id: &str) -> Result<ProbeReport> {
        self.scheduler
            .executor()
            .probe_data_source(data_source_id, self.actor.as_ref())
            .await
    }

    /// Lists the tables of a data source.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown data sources and connection errors.
    pub async fn tables(&self, data_source_id: &str) -> Result<Vec<SourceTable>> {
        self.scheduler
            .executor()
            .describe_data_source(data_source_id)
            .await
    }

    /// Imports a JSON configuration bundle from `file`.
    ///
    /// # Errors
    /// Returns I/O errors, bundle validation errors, and store failures.
    pub async fn import(&self, file: &Path) -> Result<ImportSummary> {
        let text = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| SentinelError::io(format!("Failed to read bundle {}", file.display()), e))?;
        let bundle = ConfigBundle::from_json(&text)?;
        let summary = self.store.import_bundle(bundle).await?;
        info!(
            "Imported {} data sources and {} sync configurations from {}",
            summary.data_sources,
            summary.sync_configs,
            file.display()
        );
        Ok(summary)
    }

    /// Recent jobs, newest first.
    ///
    /// # Errors
    /// Returns store failures.
    pub async fn jobs(&self, config_id: Option<&str>, limit: usize) -> Result<Vec<SyncJob>> {
        let filter = config_id
            .map_or_else(JobFilter::default, JobFilter::for_config)
            .with_limit(limit);
        self.store.jobs(&filter).await
    }

    /// Closes the store.
    pub async fn close(&self) {
        self.store.close().await;
    }
}
