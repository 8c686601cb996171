//! PostgreSQL source connector.
//!
//! Every pooled connection is put into a read-only, UTC session with a
//! statement timeout before first use. Rows are converted server-side with
//! `row_to_json` so every PostgreSQL type arrives as JSON.

use super::{
    BatchSender, ExtractionQuery, RowCursor, SourceConnector, SourceTable, group_catalog_rows,
    require_network_target,
};
use crate::config::ConnectionSettings;
use crate::models::{DataSource, DatabaseType};
use crate::{Result, SentinelError};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::Row;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};

/// Connector for PostgreSQL sources.
pub struct PostgresConnector {
    pool: PgPool,
    target: String,
}

impl std::fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl PostgresConnector {
    /// Prepares a lazily connecting pool. No network I/O happens here.
    ///
    /// # Errors
    /// Returns a configuration error when the data source lacks a host or
    /// database name.
    pub fn new(source: &DataSource, settings: &ConnectionSettings) -> Result<Self> {
        use sqlx::Executor;

        require_network_target(source)?;

        let mut options = PgConnectOptions::new()
            .host(&source.host)
            .port(source.effective_port().unwrap_or(5432))
            .database(&source.database)
            .ssl_mode(if source.ssl_enabled {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if let Some(username) = &source.username {
            options = options.username(username);
        }
        if let Some(password) = &source.password {
            options = options.password(password);
        }

        let query_timeout_secs = settings.query_timeout_secs;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.connect_timeout())
            .test_before_acquire(true)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute(
                        format!("SET statement_timeout = '{query_timeout_secs}s'").as_str(),
                    )
                    .await?;
                    let app_name = format!("sentinel-sync-{}", env!("CARGO_PKG_VERSION"));
                    conn.execute(format!("SET application_name = '{app_name}'").as_str())
                        .await?;
                    conn.execute("SET default_transaction_read_only = on").await?;
                    conn.execute("SET timezone = 'UTC'").await?;
                    Ok(())
                })
            })
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            target: source.display_target(),
        })
    }

    /// Wraps the dialect SELECT so each row comes back as one JSON object.
    fn row_json_query(&self, query: &ExtractionQuery) -> String {
        let inner = self.dialect().build_select(query);
        let mut sql = format!("SELECT row_to_json(t.*) AS row_data FROM ({inner}) t");
        if let Some(order) = self.dialect().order_clause(query, Some("t")) {
            sql.push(' ');
            sql.push_str(&order);
        }
        sql
    }
}

#[async_trait]
impl SourceConnector for PostgresConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSql
    }

    async fn test_connection(&self) -> Result<()> {
        let result: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                SentinelError::connection_failed(
                    format!("Failed to connect to PostgreSQL at {}", self.target),
                    e,
                )
            })?;

        if result != 1 {
            return Err(SentinelError::query_failed(
                "Basic connectivity test failed: unexpected result",
            ));
        }
        tracing::debug!("PostgreSQL connection to {} verified", self.target);
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<SourceTable>> {
        let rows = sqlx::query(
            "SELECT c.table_schema, c.table_name, c.column_name, c.data_type \
             FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
             WHERE t.table_type = 'BASE TABLE' \
               AND c.table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY c.table_schema, c.table_name, c.ordinal_position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SentinelError::extraction_failed("Failed to list PostgreSQL tables", e))?;

        let catalog = rows
            .iter()
            .map(|row| {
                Ok((
                    Some(row.try_get::<String, _>("table_schema")?),
                    row.try_get::<String, _>("table_name")?,
                    row.try_get::<String, _>("column_name")?,
                    row.try_get::<String, _>("data_type")?,
                ))
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| {
                SentinelError::extraction_failed("Failed to read PostgreSQL catalog", e)
            })?;

        Ok(group_catalog_rows(catalog))
    }

    async fn open_cursor(&self, query: &ExtractionQuery, batch_size: usize) -> Result<RowCursor> {
        let sql = self.row_json_query(query);
        let table = query.table.clone();
        let pool = self.pool.clone();
        tracing::debug!("Extracting from PostgreSQL {}: {}", self.target, sql);

        Ok(RowCursor::spawn(batch_size, move |mut tx: BatchSender| async move {
            let mut rows = sqlx::query_scalar::<_, JsonValue>(&sql).fetch(&pool);
            while let Some(value) = rows.try_next().await.map_err(|e| {
                SentinelError::extraction_failed(format!("Failed to read rows from '{table}'"), e)
            })? {
                let JsonValue::Object(row) = value else {
                    return Err(SentinelError::query_failed(format!(
                        "Unexpected row shape from '{table}'"
                    )));
                };
                if !tx.push(row).await {
                    return Ok(());
                }
            }
            tx.flush().await;
            Ok(())
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
