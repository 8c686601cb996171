//! Sync execution: extract, mask, and write one configuration's tables.
//!
//! A run is split in two phases. [`SyncExecutor::prepare`] snapshots the
//! configuration into a [`RunPlan`] and creates the job record, so callers
//! can hand out the job id before any source I/O happens.
//! [`SyncExecutor::run`] then drives the job to a terminal state.
//!
//! Tables are processed in their configured order. A failing table is
//! dropped from the artifact, keeps its previous watermark, and does not
//! stop the remaining tables; the job then ends `failed`.

use crate::config::EngineSettings;
use crate::connectors::{
    ConnectorFactory, DialectConnectorFactory, ExtractionQuery, SourceConnector, SourceRow,
};
use crate::masking::{self, MaskingRule};
use crate::models::{
    Actor, AuditEntry, AuditEvent, DataSource, JobStatus, SyncConfig, SyncJob, SyncMode,
    TableConfig, TriggerSource,
};
use crate::output::{ArtifactOptions, ArtifactWriter};
use crate::store::{AuditSink, ConfigStore, JobStore, SyncStore};
use crate::watermark::WatermarkTracker;
use crate::{Result, SentinelError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Point-in-time snapshot of everything a run needs.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub config: SyncConfig,
    pub source: DataSource,
    /// Active tables in extraction order
    pub tables: Vec<TableConfig>,
    /// Who asked for the run; `None` for scheduled runs
    pub actor: Option<Actor>,
}

/// Builds the read for one table.
///
/// The select list is the included columns followed by any ordering or
/// watermark column not already projected. Incremental tables are ordered by
/// their watermark, then primary key, and bounded below by the last recorded
/// value; other tables are ordered by primary key when one is declared.
pub fn extraction_query(
    table: &TableConfig,
    mode: SyncMode,
    default_row_limit: Option<u64>,
) -> ExtractionQuery {
    let mut columns: Vec<String> = table
        .included_columns()
        .map(|c| c.source_column.clone())
        .collect();

    let watermark = match mode {
        SyncMode::Incremental => table.incremental_column.clone(),
        SyncMode::Full => None,
    };
    let mut order_by: Vec<String> = watermark.iter().cloned().collect();
    for key in table.primary_key_columns() {
        if !order_by.iter().any(|c| c == key) {
            order_by.push(key.to_string());
        }
    }
    for column in &order_by {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }

    let lower_bound = watermark
        .zip(table.last_sync_value.clone())
        .filter(|_| mode == SyncMode::Incremental);

    ExtractionQuery {
        schema: table.source_schema.clone(),
        table: table.source_table.clone(),
        columns,
        filter: table.where_clause.clone(),
        lower_bound,
        order_by,
        limit: table.row_limit.or(default_row_limit),
    }
}

struct ProjectedColumn {
    source: String,
    target: String,
    rule: MaskingRule,
}

struct TablePlan<'a> {
    config: &'a TableConfig,
    query: ExtractionQuery,
    watermark: Option<String>,
    columns: Vec<ProjectedColumn>,
}

impl TablePlan<'_> {
    fn target_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.target.clone()).collect()
    }
}

enum TableRun {
    Committed {
        rows: u64,
        watermark: Option<String>,
    },
    Cancelled,
}

#[derive(Debug, Serialize)]
struct TableFailure {
    table: String,
    error: String,
}

struct RunOutcome {
    status: JobStatus,
    message: Option<String>,
    details: Option<Value>,
}

impl RunOutcome {
    fn failed(message: String, details: Value) -> Self {
        Self {
            status: JobStatus::Failed,
            message: Some(message),
            details: Some(details),
        }
    }
}

/// Looks a column up by exact name, then case-insensitively for dialects that
/// fold identifiers.
fn column_value<'r>(row: &'r SourceRow, column: &str) -> Option<&'r Value> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

/// Runs sync jobs against a store.
pub struct SyncExecutor {
    store: Arc<dyn SyncStore>,
    connectors: Arc<dyn ConnectorFactory>,
    settings: EngineSettings,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for SyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncExecutor {
    /// Creates an executor that picks connectors by dialect.
    pub fn new(store: Arc<dyn SyncStore>, settings: EngineSettings) -> Self {
        Self::with_connector_factory(store, settings, Arc::new(DialectConnectorFactory))
    }

    /// Creates an executor with a custom connector factory.
    pub fn with_connector_factory(
        store: Arc<dyn SyncStore>,
        settings: EngineSettings,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self {
            store,
            connectors,
            settings,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// The store runs read from and record to.
    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub(crate) fn connectors(&self) -> &Arc<dyn ConnectorFactory> {
        &self.connectors
    }

    /// Engine settings applied to every run.
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn cancellations(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.cancellations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Loads and checks the run plan for a configuration.
    ///
    /// # Errors
    /// Returns a configuration error when the configuration or its data
    /// source is missing, the data source is inactive, an incremental table
    /// has no watermark column, a table projects no columns, or encrypted
    /// output is requested without a passphrase.
    pub async fn load_plan(&self, config_id: &str) -> Result<RunPlan> {
        let config = self
            .store
            .sync_config(config_id)
            .await?
            .ok_or_else(|| SentinelError::not_found("Sync configuration", config_id))?;
        let source = self
            .store
            .data_source(&config.data_source_id)
            .await?
            .ok_or_else(|| SentinelError::not_found("Data source", config.data_source_id.clone()))?;
        if !source.is_active {
            return Err(SentinelError::configuration(format!(
                "Data source '{}' is inactive",
                source.name
            )));
        }

        let output_name = config.output_file_name.trim();
        if output_name.is_empty() || output_name.contains(['/', '\\']) {
            return Err(SentinelError::configuration(format!(
                "Sync configuration '{}' needs a plain output file name",
                config.name
            )));
        }
        if config.encrypt_output && self.settings.encryption_passphrase.is_none() {
            return Err(SentinelError::configuration(format!(
                "Sync configuration '{}' requests encrypted output but no passphrase is configured",
                config.name
            )));
        }

        let tables: Vec<TableConfig> = self
            .store
            .table_configs(config_id)
            .await?
            .into_iter()
            .filter(|t| t.is_active)
            .collect();
        for table in &tables {
            if config.sync_mode == SyncMode::Incremental && table.incremental_column.is_none() {
                return Err(SentinelError::configuration(format!(
                    "Table '{}' has no watermark column for incremental sync",
                    table.qualified_name()
                )));
            }
            if table.included_columns().next().is_none() {
                return Err(SentinelError::configuration(format!(
                    "Table '{}' has no included columns",
                    table.qualified_name()
                )));
            }
        }

        Ok(RunPlan {
            config,
            source,
            tables,
            actor: None,
        })
    }

    /// Snapshots the configuration and creates a running job for it.
    ///
    /// # Errors
    /// Returns the [`SyncExecutor::load_plan`] errors and store failures.
    pub async fn prepare(
        &self,
        config_id: &str,
        trigger: TriggerSource,
        actor: Option<&Actor>,
    ) -> Result<(RunPlan, SyncJob)> {
        let mut plan = self.load_plan(config_id).await?;
        plan.actor = actor.cloned();

        let job = SyncJob::start(config_id, trigger);
        self.store.create_job(&job).await?;

        self.audit(
            AuditEntry::new(
                AuditEvent::SyncTriggered,
                json!({
                    "job_id": job.id,
                    "sync_config_id": plan.config.id,
                    "triggered_by": trigger.as_str(),
                }),
            )
            .with_actor(actor)
            .with_resource("sync_config", plan.config.id.clone())
            .with_data_source(plan.source.id.clone()),
        )
        .await;

        Ok((plan, job))
    }

    /// Prepares and runs a job to completion, returning its id.
    ///
    /// # Errors
    /// Fails only when the configuration cannot be loaded or the connector
    /// cannot be constructed. Every other failure is recorded on the job.
    pub async fn execute(&self, config_id: &str, trigger: TriggerSource) -> Result<String> {
        let (plan, job) = self.prepare(config_id, trigger, None).await?;
        let job = self.run(plan, job).await?;
        Ok(job.id)
    }

    /// Drives a prepared job to a terminal state and returns it.
    ///
    /// # Errors
    /// Returns the connector construction error, after recording the job as
    /// failed.
    pub async fn run(&self, plan: RunPlan, mut job: SyncJob) -> Result<SyncJob> {
        let token = CancellationToken::new();
        self.cancellations().insert(job.id.clone(), token.clone());
        let result = self.run_job(&plan, &mut job, &token).await;
        self.cancellations().remove(&job.id);
        result.map(|()| job)
    }

    /// Asks a running job to stop. Returns `false` when no such job is running
    /// in this executor.
    pub fn request_cancel(&self, job_id: &str) -> bool {
        match self.cancellations().get(job_id) {
            Some(token) => {
                tracing::info!("Cancellation requested for job {}", job_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_job(
        &self,
        plan: &RunPlan,
        job: &mut SyncJob,
        token: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            "Starting sync job {} for '{}' ({} tables, {} mode, source {})",
            job.id,
            plan.config.name,
            plan.tables.len(),
            plan.config.sync_mode.as_str(),
            plan.source.display_target()
        );

        let connector = match self
            .connectors
            .create(&plan.source, &self.settings.connection)
            .await
        {
            Ok(connector) => connector,
            Err(e) => {
                tracing::error!("Failed to create connector for job {}: {}", job.id, e);
                let outcome = RunOutcome::failed(e.to_string(), json!({ "stage": "connector" }));
                self.finalize(plan, job, outcome).await;
                return Err(e);
            }
        };

        let outcome = self
            .extract_all(plan, job, token, connector.as_ref())
            .await;
        connector.close().await;
        self.finalize(plan, job, outcome).await;
        Ok(())
    }

    async fn extract_all(
        &self,
        plan: &RunPlan,
        job: &mut SyncJob,
        token: &CancellationToken,
        connector: &dyn SourceConnector,
    ) -> RunOutcome {
        if let Err(e) = connector.test_connection().await {
            tracing::error!(
                "Job {} could not connect to {}: {}",
                job.id,
                plan.source.display_target(),
                e
            );
            return RunOutcome::failed(e.to_string(), json!({ "stage": "connect" }));
        }

        let tables = self.resolve_tables(plan, job);
        let mut writer =
            match ArtifactWriter::create(self.artifact_options(&plan.config), &job.id, &plan.config.id)
                .await
            {
                Ok(writer) => writer,
                Err(e) => {
                    tracing::error!("Job {} could not open its artifact: {}", job.id, e);
                    return RunOutcome::failed(e.to_string(), json!({ "stage": "output" }));
                }
            };

        let mut rng = StdRng::from_os_rng();
        let mut failures: Vec<TableFailure> = Vec::new();
        // Held back until the artifact holding those rows is published.
        let mut pending_watermarks: Vec<(&str, String, String)> = Vec::new();
        let mut cancelled = token.is_cancelled();

        for table in &tables {
            if cancelled {
                break;
            }
            let name = table.config.qualified_name();
            match self
                .extract_table(connector, table, &mut writer, token, &mut rng)
                .await
            {
                Ok(TableRun::Committed { rows, watermark }) => {
                    job.rows_processed = job.rows_processed.saturating_add(rows);
                    job.tables_processed = job.tables_processed.saturating_add(1);
                    tracing::info!("Extracted {} rows from {}", rows, name);
                    if let Some(value) = watermark {
                        pending_watermarks.push((table.config.id.as_str(), name, value));
                    }
                }
                Ok(TableRun::Cancelled) => {
                    writer.abort_table().await;
                    cancelled = true;
                }
                Err(e) => {
                    writer.abort_table().await;
                    tracing::error!("Table {} failed in job {}: {}", name, job.id, e);
                    failures.push(TableFailure {
                        table: name,
                        error: e.to_string(),
                    });
                }
            }
            self.record_progress(job).await;
        }

        if cancelled {
            writer.discard().await;
            tracing::warn!(
                "Job {} cancelled; artifact discarded, {} watermarks left unchanged",
                job.id,
                pending_watermarks.len()
            );
            return RunOutcome {
                status: JobStatus::Cancelled,
                message: Some(
                    SentinelError::Cancelled {
                        job_id: job.id.clone(),
                    }
                    .to_string(),
                ),
                details: (!failures.is_empty()).then(|| json!({ "failed_tables": failures })),
            };
        }

        let mut artifact_error = None;
        match writer.finish().await {
            Ok(info) => {
                job.output_file_path = Some(info.path.display().to_string());
                job.output_file_size = Some(info.size);
                self.persist_watermarks(pending_watermarks, &mut failures).await;
            }
            Err(e) => {
                tracing::error!(
                    "Job {} could not finalize its artifact; {} watermarks left unchanged: {}",
                    job.id,
                    pending_watermarks.len(),
                    e
                );
                artifact_error = Some(e.to_string());
            }
        }

        if failures.is_empty() && artifact_error.is_none() {
            return RunOutcome {
                status: JobStatus::Completed,
                message: None,
                details: None,
            };
        }

        let message = match (&artifact_error, failures.first()) {
            (Some(error), _) => error.clone(),
            (None, Some(first)) => format!(
                "{} of {} tables failed; first failure in {}: {}",
                failures.len(),
                tables.len(),
                first.table,
                first.error
            ),
            (None, None) => "Sync failed".to_string(),
        };
        RunOutcome::failed(
            message,
            json!({ "failed_tables": failures, "artifact_error": artifact_error }),
        )
    }

    async fn persist_watermarks(
        &self,
        pending: Vec<(&str, String, String)>,
        failures: &mut Vec<TableFailure>,
    ) {
        for (table_id, name, value) in pending {
            match self.store.record_watermark(table_id, &value).await {
                Ok(()) => tracing::debug!("Watermark for {} advanced to {}", name, value),
                Err(e) => {
                    tracing::error!("Failed to record watermark for {}: {}", name, e);
                    failures.push(TableFailure {
                        table: name,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Resolves masking rules once per column and records their warnings.
    fn resolve_tables<'a>(&self, plan: &'a RunPlan, job: &mut SyncJob) -> Vec<TablePlan<'a>> {
        plan.tables
            .iter()
            .map(|table| {
                let columns = table
                    .included_columns()
                    .map(|column| {
                        let resolution = masking::resolve_rule(column, &self.settings);
                        if let Some(warning) = resolution.warning {
                            tracing::warn!("{}: {}", table.qualified_name(), warning);
                            job.warnings
                                .push(format!("{}: {}", table.qualified_name(), warning));
                        }
                        ProjectedColumn {
                            source: column.source_column.clone(),
                            target: column.target_name().to_string(),
                            rule: resolution.rule,
                        }
                    })
                    .collect();

                TablePlan {
                    config: table,
                    query: extraction_query(
                        table,
                        plan.config.sync_mode,
                        self.settings.default_row_limit,
                    ),
                    watermark: match plan.config.sync_mode {
                        SyncMode::Incremental => table.incremental_column.clone(),
                        SyncMode::Full => None,
                    },
                    columns,
                }
            })
            .collect()
    }

    async fn extract_table(
        &self,
        connector: &dyn SourceConnector,
        table: &TablePlan<'_>,
        writer: &mut ArtifactWriter,
        token: &CancellationToken,
        rng: &mut StdRng,
    ) -> Result<TableRun> {
        writer
            .begin_table(
                &table.config.qualified_name(),
                table.config.target_name(),
                &table.target_columns(),
            )
            .await?;

        tracing::debug!(
            "Extracting {}: {}",
            table.config.qualified_name(),
            connector.dialect().build_select(&table.query)
        );
        let mut cursor = connector
            .open_cursor(&table.query, self.settings.batch_size)
            .await?;
        let mut tracker = WatermarkTracker::new(table.config.last_sync_value.clone());

        loop {
            let batch = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(TableRun::Cancelled),
                batch = cursor.next_batch() => batch?,
            };
            let Some(batch) = batch else {
                break;
            };

            for row in batch {
                if let Some(column) = &table.watermark {
                    tracker.observe(column_value(&row, column).unwrap_or(&Value::Null));
                }
                let values: Vec<Value> = table
                    .columns
                    .iter()
                    .map(|c| {
                        let value = column_value(&row, &c.source)
                            .cloned()
                            .unwrap_or(Value::Null);
                        c.rule.apply(value, rng)
                    })
                    .collect();
                writer.write_row(&values).await?;
            }
        }

        let rows = writer.commit_table().await?;
        let capped = table.query.limit.is_some_and(|limit| rows >= limit);
        let watermark = if capped {
            let settled = tracker.advanced_within_cap();
            if settled.is_none() && tracker.advanced().is_some() {
                tracing::warn!(
                    "{} hit its row limit with every row sharing one watermark value; \
                     watermark left unchanged, raise the row limit",
                    table.config.qualified_name()
                );
            }
            settled
        } else {
            tracker.advanced()
        };
        Ok(TableRun::Committed {
            rows,
            watermark: watermark.map(str::to_string),
        })
    }

    fn artifact_options(&self, config: &SyncConfig) -> ArtifactOptions {
        let directory = if config.output_path.trim().is_empty() {
            self.settings.default_output_dir.clone()
        } else {
            PathBuf::from(config.output_path.trim())
        };
        ArtifactOptions {
            directory,
            file_name: config.output_file_name.trim().to_string(),
            compress: config.compress_output,
            passphrase: if config.encrypt_output {
                self.settings.encryption_passphrase.clone()
            } else {
                None
            },
        }
    }

    async fn record_progress(&self, job: &mut SyncJob) {
        job.updated_at = chrono::Utc::now();
        if let Err(e) = self.store.update_job(job).await {
            tracing::warn!("Failed to record progress of job {}: {}", job.id, e);
        }
    }

    async fn finalize(&self, plan: &RunPlan, job: &mut SyncJob, outcome: RunOutcome) {
        job.error_details = outcome.details;
        job.finish(outcome.status, outcome.message);
        if let Err(e) = self.store.update_job(job).await {
            tracing::error!("Failed to record final state of job {}: {}", job.id, e);
        }

        let event = match job.status {
            JobStatus::Completed => AuditEvent::SyncCompleted,
            JobStatus::Cancelled => AuditEvent::SyncCancelled,
            _ => AuditEvent::SyncFailed,
        };
        self.audit(
            AuditEntry::new(
                event,
                json!({
                    "job_id": job.id,
                    "sync_config_id": job.sync_config_id,
                    "status": job.status.as_str(),
                    "rows_processed": job.rows_processed,
                    "tables_processed": job.tables_processed,
                    "output_file_path": job.output_file_path,
                    "error": job.error_message,
                }),
            )
            .with_actor(plan.actor.as_ref())
            .with_resource("sync_job", job.id.clone())
            .with_data_source(plan.source.id.clone()),
        )
        .await;

        let millis = job.duration().map_or(0, |d| d.num_milliseconds());
        match job.status {
            JobStatus::Completed => tracing::info!(
                "Sync job {} completed: {} tables, {} rows in {}ms",
                job.id,
                job.tables_processed,
                job.rows_processed,
                millis
            ),
            status => tracing::warn!(
                "Sync job {} ended {}: {}",
                job.id,
                status,
                job.error_message.as_deref().unwrap_or("no details")
            ),
        }
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append(&entry).await {
            tracing::warn!("Failed to append {} audit entry: {}", entry.event_type, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{RowCursor, SourceTable};
    use crate::config::ConnectionSettings;
    use crate::models::{ColumnConfig, DatabaseType, MaskingType};
    use crate::output::{ArtifactLine, read_artifact};
    use crate::store::{AuditFilter, AuditSink, JobStore, MemoryStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn row(id: i64, email: &str) -> SourceRow {
        let mut map = SourceRow::new();
        map.insert("id".to_string(), json!(id));
        map.insert("email".to_string(), json!(email));
        map.insert("updated_at".to_string(), json!(format!("2024-01-0{id}")));
        map
    }

    /// Serves a fixed set of rows; the stream for the `hang` table never ends.
    struct FakeConnector {
        rows: Vec<SourceRow>,
        hang: Option<&'static str>,
        reachable: bool,
    }

    #[async_trait]
    impl SourceConnector for FakeConnector {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Sqlite
        }

        async fn test_connection(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(SentinelError::connection_timeout(
                    "fake:5432/app",
                    std::time::Duration::from_secs(1),
                ))
            }
        }

        async fn list_tables(&self) -> Result<Vec<SourceTable>> {
            Ok(Vec::new())
        }

        async fn open_cursor(&self, query: &ExtractionQuery, batch_size: usize) -> Result<RowCursor> {
            if query.table == "missing" {
                return Err(SentinelError::query_failed("no such table: missing"));
            }
            let rows = self.rows.clone();
            let hang = self.hang == Some(query.table.as_str());
            Ok(RowCursor::spawn(batch_size, move |mut tx| async move {
                for row in rows {
                    if !tx.push(row).await {
                        return Ok(());
                    }
                }
                tx.flush().await;
                if hang {
                    std::future::pending::<()>().await;
                }
                Ok(())
            }))
        }
    }

    struct FakeFactory {
        hang: Option<&'static str>,
        reachable: bool,
    }

    #[async_trait]
    impl ConnectorFactory for FakeFactory {
        async fn create(
            &self,
            _source: &DataSource,
            _settings: &ConnectionSettings,
        ) -> Result<Box<dyn SourceConnector>> {
            Ok(Box::new(FakeConnector {
                rows: vec![row(1, "a@x.io"), row(2, "b@x.io"), row(3, "c@x.io")],
                hang: self.hang,
                reachable: self.reachable,
            }))
        }
    }

    fn users_table(id: &str, source_table: &str) -> TableConfig {
        TableConfig::new(id, "cfg", source_table)
            .with_column(ColumnConfig::new(format!("{id}-id"), id, "id").primary_key())
            .with_column(
                ColumnConfig::new(format!("{id}-email"), id, "email")
                    .with_masking(MaskingType::Redact, None),
            )
    }

    async fn setup(
        dir: &TempDir,
        factory: FakeFactory,
        tables: Vec<TableConfig>,
    ) -> (Arc<MemoryStore>, SyncExecutor) {
        setup_with_mode(dir, factory, tables, SyncMode::Full).await
    }

    async fn setup_with_mode(
        dir: &TempDir,
        factory: FakeFactory,
        tables: Vec<TableConfig>,
        mode: SyncMode,
    ) -> (Arc<MemoryStore>, SyncExecutor) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_data_source(DataSource::new("ds", "fake", DatabaseType::Sqlite, "", "fake.db"))
            .await;
        store
            .insert_sync_config(SyncConfig::new(
                "cfg",
                "Fake",
                "ds",
                dir.path().display().to_string(),
                "fake.jsonl",
            )
            .with_sync_mode(mode))
            .await;
        for table in tables {
            store.insert_table_config(table).await;
        }
        let executor = SyncExecutor::with_connector_factory(
            store.clone(),
            EngineSettings::default().with_batch_size(1),
            Arc::new(factory),
        );
        (store, executor)
    }

    #[test]
    fn test_extraction_query_incremental() {
        let mut table = users_table("t", "users")
            .with_incremental_column("updated_at")
            .with_where_clause("active = 1");
        table.last_sync_value = Some("2024-01-01".to_string());

        let query = extraction_query(&table, SyncMode::Incremental, Some(100));
        assert_eq!(query.columns, vec!["id", "email", "updated_at"]);
        assert_eq!(query.order_by, vec!["updated_at", "id"]);
        assert_eq!(
            query.lower_bound,
            Some(("updated_at".to_string(), "2024-01-01".to_string()))
        );
        assert_eq!(query.limit, Some(100));
        assert_eq!(query.filter.as_deref(), Some("active = 1"));
    }

    #[test]
    fn test_extraction_query_full_orders_by_primary_key() {
        let mut table = users_table("t", "users")
            .with_incremental_column("updated_at")
            .with_row_limit(5);
        table.last_sync_value = Some("7".to_string());

        let query = extraction_query(&table, SyncMode::Full, Some(100));
        assert_eq!(query.columns, vec!["id", "email"]);
        assert_eq!(query.order_by, vec!["id"]);
        assert_eq!(query.lower_bound, None);
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn test_extraction_query_adds_unprojected_key() {
        let table = TableConfig::new("t", "cfg", "users")
            .with_column(ColumnConfig::new("c1", "t", "id").primary_key().excluded())
            .with_column(ColumnConfig::new("c2", "t", "name"));
        let query = extraction_query(&table, SyncMode::Full, None);
        assert_eq!(query.columns, vec!["name", "id"]);
        assert_eq!(query.limit, None);
    }

    #[tokio::test]
    async fn test_failed_table_does_not_stop_others() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (store, executor) = setup(
            &dir,
            FakeFactory {
                hang: None,
                reachable: true,
            },
            vec![users_table("t1", "missing"), users_table("t2", "users")],
        )
        .await;

        let job_id = executor.execute("cfg", TriggerSource::Manual).await?;
        let job = store.job(&job_id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.tables_processed, 1);
        assert_eq!(job.rows_processed, 3);
        assert!(job.error_message.unwrap().contains("missing"));
        assert_eq!(job.error_details.unwrap()["failed_tables"][0]["table"], "missing");

        let lines = read_artifact(dir.path().join("fake.jsonl").as_path(), None).await?;
        let tables: Vec<_> = lines
            .iter()
            .filter_map(|l| match l {
                ArtifactLine::Table { target, .. } => Some(target.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(tables, vec!["users"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_job() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (store, executor) = setup(
            &dir,
            FakeFactory {
                hang: None,
                reachable: false,
            },
            vec![users_table("t1", "users")],
        )
        .await;

        let job_id = executor.execute("cfg", TriggerSource::Schedule).await?;
        let job = store.job(&job_id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.tables_processed, 0);
        assert_eq!(job.rows_processed, 0);
        assert!(job.error_message.unwrap().contains("timed out"));
        assert!(!dir.path().join("fake.jsonl").exists());

        let failed = store
            .entries(&AuditFilter {
                event_type: Some("sync_failed".to_string()),
                ..AuditFilter::default()
            })
            .await?;
        assert_eq!(failed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_discards_artifact() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (store, executor) = setup(
            &dir,
            FakeFactory {
                hang: Some("users"),
                reachable: true,
            },
            vec![users_table("t1", "users")],
        )
        .await;
        let executor = Arc::new(executor);

        let (plan, job) = executor.prepare("cfg", TriggerSource::Manual, None).await?;
        let job_id = job.id.clone();
        let handle = tokio::spawn({
            let executor = Arc::clone(&executor);
            async move { executor.run(plan, job).await }
        });

        while !executor.request_cancel(&job_id) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let job = handle.await.unwrap()?;

        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(store.job(&job_id).await?.unwrap().status, JobStatus::Cancelled);
        assert!(!dir.path().join("fake.jsonl").exists());
        assert!(!executor.request_cancel(&job_id));
        Ok(())
    }

    async fn watermark(store: &MemoryStore, table_id: &str) -> Option<String> {
        store
            .table_configs("cfg")
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.id == table_id)
            .and_then(|t| t.last_sync_value)
    }

    #[tokio::test]
    async fn test_watermarks_advance_after_artifact_is_published() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (store, executor) = setup_with_mode(
            &dir,
            FakeFactory {
                hang: None,
                reachable: true,
            },
            vec![users_table("t1", "users").with_incremental_column("updated_at")],
            SyncMode::Incremental,
        )
        .await;

        let job_id = executor.execute("cfg", TriggerSource::Manual).await?;
        let job = store.job(&job_id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(dir.path().join("fake.jsonl").exists());
        assert_eq!(watermark(&store, "t1").await.as_deref(), Some("2024-01-03"));
        Ok(())
    }

    #[tokio::test]
    async fn test_capped_read_stops_watermark_below_last_value() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (store, executor) = setup_with_mode(
            &dir,
            FakeFactory {
                hang: None,
                reachable: true,
            },
            vec![
                users_table("t1", "users")
                    .with_incremental_column("updated_at")
                    .with_row_limit(3),
            ],
            SyncMode::Incremental,
        )
        .await;

        let job_id = executor.execute("cfg", TriggerSource::Manual).await?;
        assert_eq!(store.job(&job_id).await?.unwrap().status, JobStatus::Completed);
        assert_eq!(watermark(&store, "t1").await.as_deref(), Some("2024-01-02"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_leaves_committed_table_watermarks_unchanged() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (store, executor) = setup_with_mode(
            &dir,
            FakeFactory {
                hang: Some("users"),
                reachable: true,
            },
            vec![
                users_table("t1", "orders").with_incremental_column("updated_at"),
                users_table("t2", "users").with_incremental_column("updated_at"),
            ],
            SyncMode::Incremental,
        )
        .await;
        let executor = Arc::new(executor);

        let (plan, job) = executor.prepare("cfg", TriggerSource::Manual, None).await?;
        let job_id = job.id.clone();
        let handle = tokio::spawn({
            let executor = Arc::clone(&executor);
            async move { executor.run(plan, job).await }
        });

        // Cancel only once the first table has committed into the artifact.
        while store
            .job(&job_id)
            .await?
            .is_none_or(|j| j.tables_processed < 1)
        {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(executor.request_cancel(&job_id));
        let job = handle.await.unwrap()?;

        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!dir.path().join("fake.jsonl").exists());
        assert_eq!(watermark(&store, "t1").await, None);
        assert_eq!(watermark(&store, "t2").await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_artifact_failure_leaves_watermarks_unchanged() -> Result<()> {
        let dir = TempDir::new().unwrap();
        // A non-empty directory where the artifact should land makes the final rename fail.
        let blocker = dir.path().join("fake.jsonl");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let (store, executor) = setup_with_mode(
            &dir,
            FakeFactory {
                hang: None,
                reachable: true,
            },
            vec![users_table("t1", "users").with_incremental_column("updated_at")],
            SyncMode::Incremental,
        )
        .await;

        let job_id = executor.execute("cfg", TriggerSource::Manual).await?;
        let job = store.job(&job_id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.output_file_path.is_none());
        assert!(!job.error_details.unwrap()["artifact_error"].is_null());
        assert_eq!(watermark(&store, "t1").await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_plan_rejects_unusable_configs() {
        let dir = TempDir::new().unwrap();
        let no_columns = TableConfig::new("t", "cfg", "users");
        let (store, executor) = setup(
            &dir,
            FakeFactory {
                hang: None,
                reachable: true,
            },
            vec![no_columns],
        )
        .await;
        assert!(executor.load_plan("cfg").await.unwrap_err().is_configuration());
        assert!(matches!(
            executor.load_plan("nope").await,
            Err(SentinelError::NotFound { .. })
        ));

        let mut inactive = DataSource::new("ds", "fake", DatabaseType::Sqlite, "", "fake.db");
        inactive.is_active = false;
        store.insert_data_source(inactive).await;
        assert!(executor.load_plan("cfg").await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_randomized_primary_key_warns() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let table = TableConfig::new("t", "cfg", "users").with_column(
            ColumnConfig::new("c", "t", "id")
                .primary_key()
                .with_masking(MaskingType::Randomize, None),
        );
        let (store, executor) = setup(
            &dir,
            FakeFactory {
                hang: None,
                reachable: true,
            },
            vec![table],
        )
        .await;

        let job_id = executor.execute("cfg", TriggerSource::Manual).await?;
        let job = store.job(&job_id).await?.unwrap();
        // No hash secret is configured, so the upgraded rule fails closed.
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.warnings.len(), 1);

        let lines = read_artifact(dir.path().join("fake.jsonl").as_path(), None).await?;
        let first_row = lines.iter().find_map(|l| match l {
            ArtifactLine::Row { values, .. } => Some(values.to_vec()),
            _ => None,
        });
        assert_eq!(first_row, Some(vec![json!(masking::REDACTED)]));
        Ok(())
    }
}
