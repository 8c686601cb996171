//! SQLite-backed store used by the `sentinel-sync` daemon.
//!
//! The schema is created on open. Timestamps are stored as RFC 3339 text,
//! job error details and warnings as JSON text.

use super::{
    AuditFilter, AuditSink, ConfigBundle, ConfigStore, ImportSummary, JobFilter, JobStore,
    finalized_error,
};
use crate::error::redact_database_url;
use crate::models::{
    AuditEntry, ColumnConfig, ConnectionStatus, DataSource, DatabaseType, JobStatus, MaskingType,
    Schedule, SyncConfig, SyncJob, SyncMode, TableConfig, TriggerSource,
};
use crate::{Result, SentinelError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS data_sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    db_type TEXT NOT NULL,
    host TEXT NOT NULL DEFAULT '',
    port INTEGER,
    database_name TEXT NOT NULL,
    username TEXT,
    password TEXT,
    ssl_enabled INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_tested_at TEXT,
    connection_status TEXT NOT NULL DEFAULT 'untested'
);

CREATE TABLE IF NOT EXISTS sync_configs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    data_source_id TEXT NOT NULL REFERENCES data_sources(id),
    is_active INTEGER NOT NULL DEFAULT 1,
    sync_mode TEXT NOT NULL DEFAULT 'full',
    schedule_type TEXT NOT NULL DEFAULT 'manual',
    cron_expression TEXT,
    output_path TEXT NOT NULL,
    output_file_name TEXT NOT NULL,
    compress_output INTEGER NOT NULL DEFAULT 0,
    encrypt_output INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS table_configs (
    id TEXT PRIMARY KEY,
    sync_config_id TEXT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    source_schema TEXT,
    source_table TEXT NOT NULL,
    target_table TEXT,
    where_clause TEXT,
    row_limit INTEGER,
    incremental_column TEXT,
    last_sync_value TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_table_configs_sync ON table_configs(sync_config_id);

CREATE TABLE IF NOT EXISTS column_configs (
    id TEXT PRIMARY KEY,
    table_config_id TEXT NOT NULL REFERENCES table_configs(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    source_column TEXT NOT NULL,
    target_column TEXT,
    data_type TEXT,
    masking_type TEXT NOT NULL DEFAULT 'none',
    masking_config TEXT,
    is_included INTEGER NOT NULL DEFAULT 1,
    is_primary_key INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_column_configs_table ON column_configs(table_config_id);

CREATE TABLE IF NOT EXISTS sync_jobs (
    id TEXT PRIMARY KEY,
    sync_config_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    rows_processed INTEGER NOT NULL DEFAULT 0,
    tables_processed INTEGER NOT NULL DEFAULT 0,
    output_file_size INTEGER,
    output_file_path TEXT,
    error_message TEXT,
    error_details TEXT,
    warnings TEXT NOT NULL DEFAULT '[]',
    triggered_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_config ON sync_jobs(sync_config_id, created_at);

CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    event_details TEXT NOT NULL,
    user_id TEXT,
    user_email TEXT,
    ip_address TEXT,
    resource_type TEXT,
    resource_id TEXT,
    data_source_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs(created_at);
";

/// A [`super::SyncStore`] persisted in a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn store_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> SentinelError {
    move |e| SentinelError::store_failed(context, e)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

impl SqliteStore {
    /// Opens (creating if needed) the store at `path` and ensures the schema.
    ///
    /// # Errors
    /// Returns a store error when the file cannot be opened or migrated.
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                SentinelError::store_failed(
                    format!("Failed to open store {}", redact_database_url(&url)),
                    e,
                )
            })?;
        Self::with_pool(pool).await
    }

    /// In-memory store, mainly for tests.
    ///
    /// # Errors
    /// Returns a store error when the schema cannot be created.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err("Failed to open in-memory store"))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(INIT_SQL)
            .execute(&pool)
            .await
            .map_err(store_err("Failed to initialize store schema"))?;
        Ok(Self { pool })
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Upserts every entity of a validated bundle in one transaction.
    ///
    /// # Errors
    /// Returns `NotFound` when a sync configuration references an unknown
    /// data source, or a store error.
    pub async fn import_bundle(&self, bundle: ConfigBundle) -> Result<ImportSummary> {
        for missing in bundle.external_sources() {
            if self.data_source(missing).await?.is_none() {
                return Err(SentinelError::not_found("Data source", missing));
            }
        }

        let summary = bundle.summary();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("Failed to begin import"))?;

        for source in &bundle.data_sources {
            upsert_data_source(&mut tx, source).await?;
        }
        for bundled in &bundle.sync_configs {
            upsert_sync_config(&mut tx, &bundled.config).await?;
            sqlx::query("DELETE FROM column_configs WHERE table_config_id IN (SELECT id FROM table_configs WHERE sync_config_id = ?)")
                .bind(&bundled.config.id)
                .execute(&mut *tx)
                .await
                .map_err(store_err("Failed to replace column configurations"))?;
            sqlx::query("DELETE FROM table_configs WHERE sync_config_id = ?")
                .bind(&bundled.config.id)
                .execute(&mut *tx)
                .await
                .map_err(store_err("Failed to replace table configurations"))?;
            for (position, table) in bundled.tables.iter().enumerate() {
                insert_table_config(&mut tx, table, position).await?;
            }
        }

        tx.commit().await.map_err(store_err("Failed to commit import"))?;
        tracing::info!(
            "Imported {} data sources, {} sync configurations, {} tables",
            summary.data_sources,
            summary.sync_configs,
            summary.tables
        );
        Ok(summary)
    }

    /// All sync configurations, active or not.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn sync_configs(&self) -> Result<Vec<SyncConfig>> {
        let rows = sqlx::query("SELECT * FROM sync_configs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to list sync configurations"))?;
        rows.iter().map(sync_config_from_row).collect()
    }

    /// All data sources.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn data_sources(&self) -> Result<Vec<DataSource>> {
        let rows = sqlx::query("SELECT * FROM data_sources ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to list data sources"))?;
        rows.iter().map(data_source_from_row).collect()
    }
}

async fn upsert_data_source(tx: &mut Transaction<'_, Sqlite>, source: &DataSource) -> Result<()> {
    sqlx::query(
        "INSERT INTO data_sources (id, name, description, db_type, host, port, database_name, \
         username, password, ssl_enabled, is_active, last_tested_at, connection_status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description, \
         db_type = excluded.db_type, host = excluded.host, port = excluded.port, \
         database_name = excluded.database_name, username = excluded.username, \
         password = COALESCE(excluded.password, data_sources.password), \
         ssl_enabled = excluded.ssl_enabled, is_active = excluded.is_active",
    )
    .bind(&source.id)
    .bind(&source.name)
    .bind(&source.description)
    .bind(source.db_type.as_str())
    .bind(&source.host)
    .bind(source.port.map(i64::from))
    .bind(&source.database)
    .bind(&source.username)
    .bind(&source.password)
    .bind(source.ssl_enabled)
    .bind(source.is_active)
    .bind(source.last_tested_at)
    .bind(source.connection_status.as_str())
    .execute(&mut **tx)
    .await
    .map_err(store_err("Failed to save data source"))?;
    Ok(())
}

async fn upsert_sync_config(tx: &mut Transaction<'_, Sqlite>, config: &SyncConfig) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_configs (id, name, description, data_source_id, is_active, sync_mode, \
         schedule_type, cron_expression, output_path, output_file_name, compress_output, \
         encrypt_output) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description, \
         data_source_id = excluded.data_source_id, is_active = excluded.is_active, \
         sync_mode = excluded.sync_mode, schedule_type = excluded.schedule_type, \
         cron_expression = excluded.cron_expression, output_path = excluded.output_path, \
         output_file_name = excluded.output_file_name, \
         compress_output = excluded.compress_output, encrypt_output = excluded.encrypt_output",
    )
    .bind(&config.id)
    .bind(&config.name)
    .bind(&config.description)
    .bind(&config.data_source_id)
    .bind(config.is_active)
    .bind(config.sync_mode.as_str())
    .bind(config.schedule.kind())
    .bind(config.schedule.stored_expression())
    .bind(&config.output_path)
    .bind(&config.output_file_name)
    .bind(config.compress_output)
    .bind(config.encrypt_output)
    .execute(&mut **tx)
    .await
    .map_err(store_err("Failed to save sync configuration"))?;
    Ok(())
}

async fn insert_table_config(
    tx: &mut Transaction<'_, Sqlite>,
    table: &TableConfig,
    position: usize,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO table_configs (id, sync_config_id, position, source_schema, source_table, \
         target_table, where_clause, row_limit, incremental_column, last_sync_value, is_active) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&table.id)
    .bind(&table.sync_config_id)
    .bind(i64::try_from(position).unwrap_or(i64::MAX))
    .bind(&table.source_schema)
    .bind(&table.source_table)
    .bind(&table.target_table)
    .bind(&table.where_clause)
    .bind(table.row_limit.map(to_i64))
    .bind(&table.incremental_column)
    .bind(&table.last_sync_value)
    .bind(table.is_active)
    .execute(&mut **tx)
    .await
    .map_err(store_err("Failed to save table configuration"))?;

    for (position, column) in table.columns.iter().enumerate() {
        sqlx::query(
            "INSERT INTO column_configs (id, table_config_id, position, source_column, \
             target_column, data_type, masking_type, masking_config, is_included, is_primary_key) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&column.id)
        .bind(&table.id)
        .bind(i64::try_from(position).unwrap_or(i64::MAX))
        .bind(&column.source_column)
        .bind(&column.target_column)
        .bind(&column.data_type)
        .bind(column.masking_type.as_str())
        .bind(&column.masking_config)
        .bind(column.is_included)
        .bind(column.is_primary_key)
        .execute(&mut **tx)
        .await
        .map_err(store_err("Failed to save column configuration"))?;
    }
    Ok(())
}

fn data_source_from_row(row: &SqliteRow) -> Result<DataSource> {
    let read = || -> std::result::Result<DataSource, sqlx::Error> {
        let db_type: String = row.try_get("db_type")?;
        let db_type = DatabaseType::from_str(&db_type)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let port: Option<i64> = row.try_get("port")?;
        Ok(DataSource {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            db_type,
            host: row.try_get("host")?,
            port: port.and_then(|p| u16::try_from(p).ok()),
            database: row.try_get("database_name")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            ssl_enabled: row.try_get("ssl_enabled")?,
            is_active: row.try_get("is_active")?,
            last_tested_at: row.try_get("last_tested_at")?,
            connection_status: ConnectionStatus::parse(
                &row.try_get::<String, _>("connection_status")?,
            ),
        })
    };
    read().map_err(store_err("Failed to decode data source"))
}

fn sync_config_from_row(row: &SqliteRow) -> Result<SyncConfig> {
    let read = || -> std::result::Result<(SyncConfig, String, Option<String>), sqlx::Error> {
        let sync_mode: String = row.try_get("sync_mode")?;
        let sync_mode =
            SyncMode::from_str(&sync_mode).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let config = SyncConfig {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            data_source_id: row.try_get("data_source_id")?,
            is_active: row.try_get("is_active")?,
            sync_mode,
            schedule: Schedule::Manual,
            output_path: row.try_get("output_path")?,
            output_file_name: row.try_get("output_file_name")?,
            compress_output: row.try_get("compress_output")?,
            encrypt_output: row.try_get("encrypt_output")?,
        };
        Ok((
            config,
            row.try_get("schedule_type")?,
            row.try_get("cron_expression")?,
        ))
    };
    let (mut config, kind, expression) =
        read().map_err(store_err("Failed to decode sync configuration"))?;
    config.schedule = Schedule::from_parts(&kind, expression.as_deref())?;
    Ok(config)
}

fn table_config_from_row(row: &SqliteRow) -> std::result::Result<TableConfig, sqlx::Error> {
    let row_limit: Option<i64> = row.try_get("row_limit")?;
    Ok(TableConfig {
        id: row.try_get("id")?,
        sync_config_id: row.try_get("sync_config_id")?,
        source_schema: row.try_get("source_schema")?,
        source_table: row.try_get("source_table")?,
        target_table: row.try_get("target_table")?,
        where_clause: row.try_get("where_clause")?,
        row_limit: row_limit.map(to_u64),
        incremental_column: row.try_get("incremental_column")?,
        last_sync_value: row.try_get("last_sync_value")?,
        is_active: row.try_get("is_active")?,
        columns: Vec::new(),
    })
}

fn column_config_from_row(row: &SqliteRow) -> std::result::Result<ColumnConfig, sqlx::Error> {
    Ok(ColumnConfig {
        id: row.try_get("id")?,
        table_config_id: row.try_get("table_config_id")?,
        source_column: row.try_get("source_column")?,
        target_column: row.try_get("target_column")?,
        data_type: row.try_get("data_type")?,
        masking_type: MaskingType::parse(&row.try_get::<String, _>("masking_type")?),
        masking_config: row.try_get("masking_config")?,
        is_included: row.try_get("is_included")?,
        is_primary_key: row.try_get("is_primary_key")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<SyncJob> {
    let read = || -> std::result::Result<SyncJob, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = JobStatus::from_str(&status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let error_details: Option<String> = row.try_get("error_details")?;
        let warnings: String = row.try_get("warnings")?;
        let output_file_size: Option<i64> = row.try_get("output_file_size")?;
        let rows_processed: i64 = row.try_get("rows_processed")?;
        Ok(SyncJob {
            id: row.try_get("id")?,
            sync_config_id: row.try_get("sync_config_id")?,
            status,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            rows_processed: to_u64(rows_processed),
            tables_processed: row.try_get("tables_processed")?,
            output_file_size: output_file_size.map(to_u64),
            output_file_path: row.try_get("output_file_path")?,
            error_message: row.try_get("error_message")?,
            error_details: error_details.and_then(|d| serde_json::from_str(&d).ok()),
            warnings: serde_json::from_str(&warnings).unwrap_or_default(),
            triggered_by: TriggerSource::parse(&row.try_get::<String, _>("triggered_by")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    };
    read().map_err(store_err("Failed to decode sync job"))
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let read = || -> std::result::Result<AuditEntry, sqlx::Error> {
        let details: String = row.try_get("event_details")?;
        Ok(AuditEntry {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            event_details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
            user_id: row.try_get("user_id")?,
            user_email: row.try_get("user_email")?,
            ip_address: row.try_get("ip_address")?,
            resource_type: row.try_get("resource_type")?,
            resource_id: row.try_get("resource_id")?,
            data_source_id: row.try_get("data_source_id")?,
            created_at: row.try_get("created_at")?,
        })
    };
    read().map_err(store_err("Failed to decode audit entry"))
}

fn json_text<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| SentinelError::serialization("Failed to encode job field", e))
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn sync_config(&self, id: &str) -> Result<Option<SyncConfig>> {
        let row = sqlx::query("SELECT * FROM sync_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to load sync configuration"))?;
        row.as_ref().map(sync_config_from_row).transpose()
    }

    async fn data_source(&self, id: &str) -> Result<Option<DataSource>> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to load data source"))?;
        row.as_ref().map(data_source_from_row).transpose()
    }

    async fn table_configs(&self, sync_config_id: &str) -> Result<Vec<TableConfig>> {
        let table_rows =
            sqlx::query("SELECT * FROM table_configs WHERE sync_config_id = ? ORDER BY position")
                .bind(sync_config_id)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err("Failed to load table configurations"))?;
        let column_rows = sqlx::query(
            "SELECT c.* FROM column_configs c JOIN table_configs t ON t.id = c.table_config_id \
             WHERE t.sync_config_id = ? ORDER BY c.table_config_id, c.position",
        )
        .bind(sync_config_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("Failed to load column configurations"))?;

        let mut tables = table_rows
            .iter()
            .map(table_config_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err("Failed to decode table configuration"))?;
        for row in &column_rows {
            let column =
                column_config_from_row(row).map_err(store_err("Failed to decode column"))?;
            if let Some(table) = tables.iter_mut().find(|t| t.id == column.table_config_id) {
                table.columns.push(column);
            }
        }
        Ok(tables)
    }

    async fn scheduled_configs(&self) -> Result<Vec<SyncConfig>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_configs WHERE is_active = 1 AND schedule_type != 'manual' \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("Failed to load scheduled configurations"))?;

        // A bad row must not keep the other configurations from scheduling.
        Ok(rows
            .iter()
            .filter_map(|row| match sync_config_from_row(row) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::error!("Skipping unreadable sync configuration: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn record_watermark(&self, table_config_id: &str, value: &str) -> Result<()> {
        let result = sqlx::query("UPDATE table_configs SET last_sync_value = ? WHERE id = ?")
            .bind(value)
            .bind(table_config_id)
            .execute(&self.pool)
            .await
            .map_err(store_err("Failed to record watermark"))?;
        if result.rows_affected() == 0 {
            return Err(SentinelError::not_found("Table configuration", table_config_id));
        }
        Ok(())
    }

    async fn record_connection_status(
        &self,
        data_source_id: &str,
        status: ConnectionStatus,
        tested_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE data_sources SET connection_status = ?, last_tested_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(tested_at)
        .bind(data_source_id)
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to record connection status"))?;
        if result.rows_affected() == 0 {
            return Err(SentinelError::not_found("Data source", data_source_id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_jobs (id, sync_config_id, status, started_at, completed_at, \
             rows_processed, tables_processed, output_file_size, output_file_path, error_message, \
             error_details, warnings, triggered_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.sync_config_id)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i64(job.rows_processed))
        .bind(job.tables_processed)
        .bind(job.output_file_size.map(to_i64))
        .bind(&job.output_file_path)
        .bind(&job.error_message)
        .bind(job.error_details.as_ref().map(json_text).transpose()?)
        .bind(json_text(&job.warnings)?)
        .bind(job.triggered_by.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to create sync job"))?;
        Ok(())
    }

    async fn update_job(&self, job: &SyncJob) -> Result<()> {
        // The status guard in the WHERE clause keeps terminal rows immutable
        // even when two writers race.
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = ?, started_at = ?, completed_at = ?, \
             rows_processed = ?, tables_processed = ?, output_file_size = ?, \
             output_file_path = ?, error_message = ?, error_details = ?, warnings = ?, \
             updated_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i64(job.rows_processed))
        .bind(job.tables_processed)
        .bind(job.output_file_size.map(to_i64))
        .bind(&job.output_file_path)
        .bind(&job.error_message)
        .bind(job.error_details.as_ref().map(json_text).transpose()?)
        .bind(json_text(&job.warnings)?)
        .bind(job.updated_at)
        .bind(&job.id)
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to update sync job"))?;

        if result.rows_affected() == 0 {
            return match self.job(&job.id).await? {
                Some(stored) => Err(finalized_error(&stored)),
                None => Err(SentinelError::not_found("Sync job", job.id.clone())),
            };
        }
        Ok(())
    }

    async fn job(&self, id: &str) -> Result<Option<SyncJob>> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to load sync job"))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        let limit = filter.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "SELECT * FROM sync_jobs \
             WHERE (?1 IS NULL OR sync_config_id = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
        )
        .bind(&filter.sync_config_id)
        .bind(filter.status.map(JobStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("Failed to list sync jobs"))?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (id, event_type, event_details, user_id, user_email, \
             ip_address, resource_type, resource_id, data_source_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.event_type)
        .bind(json_text(&entry.event_details)?)
        .bind(&entry.user_id)
        .bind(&entry.user_email)
        .bind(&entry.ip_address)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.data_source_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to append audit entry"))?;
        Ok(())
    }

    async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let limit = filter.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "SELECT * FROM audit_logs \
             WHERE (?1 IS NULL OR event_type = ?1) AND (?2 IS NULL OR resource_id = ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
        )
        .bind(&filter.event_type)
        .bind(&filter.resource_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("Failed to list audit entries"))?;
        rows.iter().map(audit_from_row).collect()
    }
}
