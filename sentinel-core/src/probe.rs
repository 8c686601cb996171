//! Connectivity probes and catalog listing for data sources.

use crate::connectors::SourceTable;
use crate::executor::SyncExecutor;
use crate::models::{Actor, AuditEntry, AuditEvent, ConnectionStatus, DataSource};
use crate::store::{AuditSink, ConfigStore};
use crate::{Result, SentinelError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

/// Outcome of [`SyncExecutor::probe_data_source`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub data_source_id: String,
    pub status: ConnectionStatus,
    pub tested_at: DateTime<Utc>,
    pub latency_ms: u64,
    /// Connection error, credentials redacted
    pub error: Option<String>,
}

impl SyncExecutor {
    async fn load_source(&self, data_source_id: &str) -> Result<DataSource> {
        self.store()
            .data_source(data_source_id)
            .await?
            .ok_or_else(|| SentinelError::not_found("Data source", data_source_id))
    }

    /// Tests connectivity to a data source and records the result on it.
    ///
    /// A failed connection is a successful probe with status `failed`.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown data sources and store failures.
    pub async fn probe_data_source(
        &self,
        data_source_id: &str,
        actor: Option<&Actor>,
    ) -> Result<ProbeReport> {
        let source = self.load_source(data_source_id).await?;
        let started = Instant::now();

        let result = match self
            .connectors()
            .create(&source, &self.settings().connection)
            .await
        {
            Ok(connector) => {
                let result = connector.test_connection().await;
                connector.close().await;
                result
            }
            Err(e) => Err(e),
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let tested_at = Utc::now();

        let (status, error) = match result {
            Ok(()) => {
                tracing::info!(
                    "Data source '{}' reachable at {} ({}ms)",
                    source.name,
                    source.display_target(),
                    latency_ms
                );
                (ConnectionStatus::Connected, None)
            }
            Err(e) => {
                tracing::warn!("Data source '{}' unreachable: {}", source.name, e);
                (ConnectionStatus::Failed, Some(e.to_string()))
            }
        };

        self.store()
            .record_connection_status(&source.id, status, tested_at)
            .await?;

        let entry = AuditEntry::new(
            AuditEvent::DataSourceTested,
            serde_json::json!({
                "status": status.as_str(),
                "latency_ms": latency_ms,
                "error": error,
            }),
        )
        .with_actor(actor)
        .with_resource("data_source", source.id.clone())
        .with_data_source(source.id.clone());
        if let Err(e) = self.store().append(&entry).await {
            tracing::warn!("Failed to append probe audit entry: {}", e);
        }

        Ok(ProbeReport {
            data_source_id: source.id,
            status,
            tested_at,
            latency_ms,
            error,
        })
    }

    /// Lists the tables and columns visible through a data source.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown data sources, and connection or query
    /// errors from the source.
    pub async fn describe_data_source(&self, data_source_id: &str) -> Result<Vec<SourceTable>> {
        let source = self.load_source(data_source_id).await?;
        let connector = self
            .connectors()
            .create(&source, &self.settings().connection)
            .await?;
        let tables = connector.list_tables().await;
        connector.close().await;
        let tables = tables?;
        tracing::debug!("Data source '{}' exposes {} tables", source.name, tables.len());
        Ok(tables)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::models::DatabaseType;
    use crate::store::{AuditFilter, MemoryStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn seeded_db(dir: &TempDir) -> String {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        let path = dir.path().join("probe.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        sqlx::query("CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_probe_records_status() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = seeded_db(&dir).await;
        let store = Arc::new(MemoryStore::new());
        store
            .insert_data_source(DataSource::new("ok", "ok", DatabaseType::Sqlite, "", path))
            .await;
        store
            .insert_data_source(DataSource::new(
                "gone",
                "gone",
                DatabaseType::Sqlite,
                "",
                dir.path().join("absent.db").display().to_string(),
            ))
            .await;
        let executor = SyncExecutor::new(store.clone(), EngineSettings::default());

        let report = executor.probe_data_source("ok", None).await?;
        assert_eq!(report.status, ConnectionStatus::Connected);
        assert!(report.error.is_none());

        let report = executor.probe_data_source("gone", None).await?;
        assert_eq!(report.status, ConnectionStatus::Failed);
        assert!(report.error.is_some());

        let stored = store.data_source("gone").await?.unwrap();
        assert_eq!(stored.connection_status, ConnectionStatus::Failed);
        assert!(stored.last_tested_at.is_some());

        let entries = store
            .entries(&AuditFilter {
                event_type: Some("data_source_tested".to_string()),
                ..AuditFilter::default()
            })
            .await?;
        assert_eq!(entries.len(), 2);

        assert!(executor.probe_data_source("missing", None).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_describe_lists_tables() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = seeded_db(&dir).await;
        let store = Arc::new(MemoryStore::new());
        store
            .insert_data_source(DataSource::new("ds", "ds", DatabaseType::Sqlite, "", path))
            .await;
        let executor = SyncExecutor::new(store, EngineSettings::default());

        let tables = executor.describe_data_source("ds").await?;
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "accounts");
        let columns: Vec<&str> = tables[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["id", "owner"]);
        Ok(())
    }
}
