//! MySQL source connector.

use super::{
    BatchSender, ExtractionQuery, RowCursor, SourceConnector, SourceRow, SourceTable,
    group_catalog_rows, require_network_target,
};
use crate::config::ConnectionSettings;
use crate::models::{DataSource, DatabaseType};
use crate::{Result, SentinelError};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, Row};

/// Connector for MySQL and MariaDB sources.
pub struct MySqlConnector {
    pool: MySqlPool,
    target: String,
}

impl std::fmt::Debug for MySqlConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnector")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl MySqlConnector {
    /// Prepares a lazily connecting pool.
    ///
    /// # Errors
    /// Returns a configuration error when the data source lacks a host or
    /// database name.
    pub fn new(source: &DataSource, settings: &ConnectionSettings) -> Result<Self> {
        use sqlx::Executor;

        require_network_target(source)?;

        let mut options = MySqlConnectOptions::new()
            .host(&source.host)
            .port(source.effective_port().unwrap_or(3306))
            .database(&source.database)
            .ssl_mode(if source.ssl_enabled {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Preferred
            })
            .timezone(Some("+00:00".to_string()));
        if let Some(username) = &source.username {
            options = options.username(username);
        }
        if let Some(password) = &source.password {
            options = options.password(password);
        }

        let query_timeout_ms = settings.query_timeout_secs.saturating_mul(1000);
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.connect_timeout())
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute(
                        format!("SET SESSION MAX_EXECUTION_TIME = {query_timeout_ms}").as_str(),
                    )
                    .await?;
                    conn.execute("SET SESSION TRANSACTION READ ONLY").await?;
                    Ok(())
                })
            })
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            target: source.display_target(),
        })
    }
}

#[async_trait]
impl SourceConnector for MySqlConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    async fn test_connection(&self) -> Result<()> {
        let result: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                SentinelError::connection_failed(
                    format!("Failed to connect to MySQL at {}", self.target),
                    e,
                )
            })?;

        if result != 1 {
            return Err(SentinelError::query_failed(
                "Basic connectivity test failed: unexpected result",
            ));
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<SourceTable>> {
        // information_schema columns are VARBINARY on some server versions.
        let rows = sqlx::query(
            "SELECT CAST(c.TABLE_SCHEMA AS CHAR) AS table_schema, \
                    CAST(c.TABLE_NAME AS CHAR) AS table_name, \
                    CAST(c.COLUMN_NAME AS CHAR) AS column_name, \
                    CAST(c.DATA_TYPE AS CHAR) AS data_type \
             FROM information_schema.COLUMNS c \
             JOIN information_schema.TABLES t \
               ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
             WHERE t.TABLE_TYPE = 'BASE TABLE' AND c.TABLE_SCHEMA = DATABASE() \
             ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SentinelError::extraction_failed("Failed to list MySQL tables", e))?;

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
            .map_err(|e| SentinelError::extraction_failed("Failed to read MySQL catalog", e))?;

        Ok(group_catalog_rows(catalog))
    }

    async fn open_cursor(&self, query: &ExtractionQuery, batch_size: usize) -> Result<RowCursor> {
        let sql = self.dialect().build_select(query);
        let table = query.table.clone();
        let pool = self.pool.clone();
        tracing::debug!("Extracting from MySQL {}: {}", self.target, sql);

        Ok(RowCursor::spawn(batch_size, move |mut tx: BatchSender| async move {
            let mut rows = sqlx::query(&sql).fetch(&pool);
            while let Some(row) = rows.try_next().await.map_err(|e| {
                SentinelError::extraction_failed(format!("Failed to read rows from '{table}'"), e)
            })? {
                if !tx.push(row_to_json(&row)).await {
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

fn row_to_json(row: &MySqlRow) -> SourceRow {
    let mut map = SourceRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), extract_column_value(row, index));
    }
    map
}

/// Extracts a column value as JSON, trying types in order of likelihood.
fn extract_column_value(row: &MySqlRow, index: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(JsonValue::Null, |n| JsonValue::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map_or(JsonValue::Null, |n| JsonValue::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map_or(JsonValue::Null, JsonValue::Number);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::Bool);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return v.map_or(JsonValue::Null, |t| JsonValue::String(t.to_rfc3339()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return v.map_or(JsonValue::Null, |t| {
            JsonValue::String(t.format("%Y-%m-%d %H:%M:%S%.f").to_string())
        });
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v.map_or(JsonValue::Null, |d| JsonValue::String(d.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<JsonValue>, _>(index) {
        return v.unwrap_or(JsonValue::Null);
    }
    // DECIMAL and other textual wire types
    if let Ok(v) = row.try_get_unchecked::<Option<String>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::String);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(JsonValue::Null, |bytes| {
            use base64::Engine;
            JsonValue::String(format!(
                "base64:{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            ))
        });
    }
    JsonValue::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database_rejected() {
        let source = DataSource::new("ds", "shop", DatabaseType::MySql, "db", "");
        let result = MySqlConnector::new(&source, &ConnectionSettings::default());
        assert!(matches!(result, Err(SentinelError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_connector_reports_dialect() -> Result<()> {
        let source = DataSource::new("ds", "shop", DatabaseType::MySql, "db", "shop")
            .with_credentials("reader", "pw");
        let connector = MySqlConnector::new(&source, &ConnectionSettings::default())?;
        assert_eq!(connector.database_type(), DatabaseType::MySql);
        assert_eq!(connector.dialect(), super::super::Dialect::MySql);
        assert!(format!("{connector:?}").contains("db:3306/shop"));
        Ok(())
    }
}
