//! SQL Server source connector over `tiberius`.
//!
//! `tiberius` has no pool, so each operation opens its own client. Cursor
//! clients live inside the producer task and close when it finishes.

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
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type MssqlClient = Client<Compat<TcpStream>>;

/// Connector for Microsoft SQL Server sources.
pub struct SqlServerConnector {
    config: Config,
    connect_timeout: Duration,
    target: String,
}

impl std::fmt::Debug for SqlServerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerConnector")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SqlServerConnector {
    /// Builds the client configuration. No network I/O happens here.
    ///
    /// # Errors
    /// Returns a configuration error when the data source lacks a host or
    /// database name.
    pub fn new(source: &DataSource, settings: &ConnectionSettings) -> Result<Self> {
        require_network_target(source)?;

        let mut config = Config::new();
        config.host(&source.host);
        config.port(source.effective_port().unwrap_or(1433));
        config.database(&source.database);
        config.application_name(format!("sentinel-sync-{}", env!("CARGO_PKG_VERSION")));
        config.authentication(AuthMethod::sql_server(
            source.username.as_deref().unwrap_or_default(),
            source.password.as_deref().unwrap_or_default(),
        ));
        if source.ssl_enabled {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::Off);
            config.trust_cert();
        }

        Ok(Self {
            config,
            connect_timeout: settings.connect_timeout(),
            target: source.display_target(),
        })
    }

    async fn connect(&self) -> Result<MssqlClient> {
        connect_client(self.config.clone(), self.connect_timeout, &self.target).await
    }
}

async fn connect_client(config: Config, timeout: Duration, target: &str) -> Result<MssqlClient> {
    let attempt = async {
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            SentinelError::connection_failed(format!("Failed to reach SQL Server at {target}"), e)
        })?;
        tcp.set_nodelay(true).map_err(|e| {
            SentinelError::connection_failed(format!("Failed to configure socket for {target}"), e)
        })?;
        Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| {
                SentinelError::connection_failed(
                    format!("Failed to log in to SQL Server at {target}"),
                    e,
                )
            })
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| SentinelError::connection_timeout(target, timeout))?
}

#[async_trait]
impl SourceConnector for SqlServerConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    async fn test_connection(&self) -> Result<()> {
        let mut client = self.connect().await?;
        let row = client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| SentinelError::connection_failed("SQL Server connectivity test", e))?
            .into_row()
            .await
            .map_err(|e| SentinelError::connection_failed("SQL Server connectivity test", e))?;

        match row.and_then(|r| r.get::<i32, _>(0)) {
            Some(1) => Ok(()),
            _ => Err(SentinelError::query_failed(
                "Basic connectivity test failed: unexpected result",
            )),
        }
    }

    async fn list_tables(&self) -> Result<Vec<SourceTable>> {
        let mut client = self.connect().await?;
        let rows = client
            .simple_query(
                "SELECT c.TABLE_SCHEMA, c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS c \
                 JOIN INFORMATION_SCHEMA.TABLES t \
                   ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
                 WHERE t.TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION",
            )
            .await
            .map_err(|e| SentinelError::extraction_failed("Failed to list SQL Server tables", e))?
            .into_first_result()
            .await
            .map_err(|e| SentinelError::extraction_failed("Failed to read SQL Server catalog", e))?;

        let catalog = rows.iter().filter_map(|row| {
            Some((
                row.get::<&str, _>(0).map(str::to_string),
                row.get::<&str, _>(1)?.to_string(),
                row.get::<&str, _>(2)?.to_string(),
                row.get::<&str, _>(3).unwrap_or_default().to_string(),
            ))
        });
        Ok(group_catalog_rows(catalog.collect::<Vec<_>>()))
    }

    async fn open_cursor(&self, query: &ExtractionQuery, batch_size: usize) -> Result<RowCursor> {
        let sql = self.dialect().build_select(query);
        let table = query.table.clone();
        let config = self.config.clone();
        let timeout = self.connect_timeout;
        let target = self.target.clone();
        tracing::debug!("Extracting from SQL Server {}: {}", self.target, sql);

        Ok(RowCursor::spawn(batch_size, move |mut tx: BatchSender| async move {
            let mut client = connect_client(config, timeout, &target).await?;
            let mut rows = client
                .simple_query(sql)
                .await
                .map_err(|e| {
                    SentinelError::extraction_failed(format!("Failed to query '{table}'"), e)
                })?
                .into_row_stream();

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
}

fn row_to_json(row: &Row) -> SourceRow {
    row.cells()
        .map(|(column, data)| (column.name().to_string(), cell_to_json(data)))
        .collect()
}

fn cell_to_json(data: &ColumnData<'static>) -> JsonValue {
    match data {
        ColumnData::U8(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I16(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I32(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I64(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::F32(v) => v
            .and_then(|n| serde_json::Number::from_f64(f64::from(n)))
            .map_or(JsonValue::Null, JsonValue::Number),
        ColumnData::F64(v) => v
            .and_then(serde_json::Number::from_f64)
            .map_or(JsonValue::Null, JsonValue::Number),
        ColumnData::Bit(v) => v.map_or(JsonValue::Null, JsonValue::Bool),
        ColumnData::String(v) => v
            .as_ref()
            .map_or(JsonValue::Null, |s| JsonValue::String(s.to_string())),
        ColumnData::Guid(v) => v.map_or(JsonValue::Null, |g| JsonValue::String(g.to_string())),
        ColumnData::Numeric(v) => v.map_or(JsonValue::Null, |n| JsonValue::String(n.to_string())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map_or(JsonValue::Null, |x| JsonValue::String(x.to_string())),
        ColumnData::Binary(v) => v.as_ref().map_or(JsonValue::Null, |bytes| {
            use base64::Engine;
            JsonValue::String(format!(
                "base64:{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            ))
        }),
        _ => temporal_to_json(data),
    }
}

/// Date and time columns, rendered in ISO-8601.
fn temporal_to_json(data: &ColumnData<'static>) -> JsonValue {
    if let Ok(v) = chrono::DateTime::<chrono::FixedOffset>::from_sql(data) {
        return v.map_or(JsonValue::Null, |t| JsonValue::String(t.to_rfc3339()));
    }
    if let Ok(v) = chrono::NaiveDateTime::from_sql(data) {
        return v.map_or(JsonValue::Null, |t| {
            JsonValue::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        });
    }
    if let Ok(v) = chrono::NaiveDate::from_sql(data) {
        return v.map_or(JsonValue::Null, |d| JsonValue::String(d.to_string()));
    }
    if let Ok(v) = chrono::NaiveTime::from_sql(data) {
        return v.map_or(JsonValue::Null, |t| JsonValue::String(t.to_string()));
    }
    JsonValue::Null
}
