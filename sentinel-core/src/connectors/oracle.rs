//! Oracle source connector.
//!
//! The `oracle` crate wraps the synchronous ODPI-C library, so all driver
//! calls run on tokio's blocking pool. Requires Oracle Instant Client at
//! runtime.

use super::{
    ExtractionQuery, RowCursor, SourceConnector, SourceRow, SourceTable, group_catalog_rows,
    require_network_target,
};
use crate::config::ConnectionSettings;
use crate::models::{DataSource, DatabaseType};
use crate::{Result, SentinelError};
use async_trait::async_trait;
use oracle::sql_type::OracleType;
use oracle::{Connection, SqlValue};
use serde_json::Value as JsonValue;
use std::time::Duration;

#[derive(Clone)]
struct Credentials {
    username: String,
    password: zeroize::Zeroizing<String>,
    connect_string: String,
}

impl Credentials {
    fn connect(&self) -> Result<Connection> {
        Connection::connect(&self.username, self.password.as_str(), &self.connect_string).map_err(
            |e| {
                SentinelError::connection_failed(
                    format!("Failed to connect to Oracle at {}", self.connect_string),
                    e,
                )
            },
        )
    }
}

/// Connector for Oracle sources.
pub struct OracleConnector {
    credentials: Credentials,
    connect_timeout: Duration,
}

impl std::fmt::Debug for OracleConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleConnector")
            .field("target", &self.credentials.connect_string)
            .finish_non_exhaustive()
    }
}

/// EZConnect string `//host:port/service`.
fn connect_string(source: &DataSource) -> String {
    format!(
        "//{}:{}/{}",
        source.host,
        source.effective_port().unwrap_or(1521),
        source.database
    )
}

impl OracleConnector {
    /// Captures the connection parameters. No network I/O happens here.
    ///
    /// # Errors
    /// Returns a configuration error when the data source lacks a host or
    /// service name.
    pub fn new(source: &DataSource, settings: &ConnectionSettings) -> Result<Self> {
        require_network_target(source)?;
        Ok(Self {
            credentials: Credentials {
                username: source.username.clone().unwrap_or_default(),
                password: zeroize::Zeroizing::new(source.password.clone().unwrap_or_default()),
                connect_string: connect_string(source),
            },
            connect_timeout: settings.connect_timeout(),
        })
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Credentials) -> Result<T> + Send + 'static,
    {
        let credentials = self.credentials.clone();
        let target = credentials.connect_string.clone();
        let task = tokio::task::spawn_blocking(move || work(credentials));
        match tokio::time::timeout(self.connect_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SentinelError::connection_failed(
                "Oracle driver task failed",
                e,
            )),
            Err(_) => Err(SentinelError::connection_timeout(target, self.connect_timeout)),
        }
    }
}

#[async_trait]
impl SourceConnector for OracleConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Oracle
    }

    async fn test_connection(&self) -> Result<()> {
        self.blocking(|credentials| {
            let conn = credentials.connect()?;
            let one: i64 = conn
                .query_row_as("SELECT 1 FROM DUAL", &[])
                .map_err(|e| SentinelError::connection_failed("Oracle connectivity test", e))?;
            if one != 1 {
                return Err(SentinelError::query_failed(
                    "Basic connectivity test failed: unexpected result",
                ));
            }
            Ok(())
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<SourceTable>> {
        self.blocking(|credentials| {
            let conn = credentials.connect()?;
            let rows = conn
                .query_as::<(String, String, String, String)>(
                    "SELECT c.owner, c.table_name, c.column_name, c.data_type \
                     FROM all_tab_columns c \
                     JOIN all_tables t ON t.owner = c.owner AND t.table_name = c.table_name \
                     WHERE c.owner = SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA') \
                     ORDER BY c.owner, c.table_name, c.column_id",
                    &[],
                )
                .map_err(|e| SentinelError::extraction_failed("Failed to list Oracle tables", e))?;

            let mut catalog = Vec::new();
            for row in rows {
                let (owner, table, column, data_type) = row.map_err(|e| {
                    SentinelError::extraction_failed("Failed to read Oracle catalog", e)
                })?;
                catalog.push((Some(owner), table, column, data_type));
            }
            Ok(group_catalog_rows(catalog))
        })
        .await
    }

    async fn open_cursor(&self, query: &ExtractionQuery, batch_size: usize) -> Result<RowCursor> {
        let sql = self.dialect().build_select(query);
        let table = query.table.clone();
        let credentials = self.credentials.clone();
        tracing::debug!(
            "Extracting from Oracle {}: {}",
            credentials.connect_string,
            sql
        );

        Ok(RowCursor::spawn_blocking(batch_size, move |tx| {
            let conn = credentials.connect()?;
            let result_set = conn.query(&sql, &[]).map_err(|e| {
                SentinelError::extraction_failed(format!("Failed to query '{table}'"), e)
            })?;
            let names: Vec<String> = result_set
                .column_info()
                .iter()
                .map(|c| c.name().to_string())
                .collect();

            for row in result_set {
                let row = row.map_err(|e| {
                    SentinelError::extraction_failed(
                        format!("Failed to read rows from '{table}'"),
                        e,
                    )
                })?;
                let values: SourceRow = names
                    .iter()
                    .cloned()
                    .zip(row.sql_values().iter().map(value_to_json))
                    .collect();
                if !tx.blocking_push(values) {
                    return Ok(());
                }
            }
            tx.blocking_flush();
            Ok(())
        }))
    }
}

fn value_to_json(value: &SqlValue) -> JsonValue {
    if value.is_null().unwrap_or(true) {
        return JsonValue::Null;
    }
    let Ok(oracle_type) = value.oracle_type() else {
        return JsonValue::Null;
    };
    match oracle_type {
        OracleType::Number(_, _) | OracleType::Float(_) | OracleType::Int64 => value
            .get::<String>()
            .map_or(JsonValue::Null, |text| number_or_text(&text)),
        OracleType::BinaryFloat | OracleType::BinaryDouble => value
            .get::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or(JsonValue::Null, JsonValue::Number),
        OracleType::Date | OracleType::Timestamp(_) => value
            .get::<chrono::NaiveDateTime>()
            .map_or(JsonValue::Null, |t| {
                JsonValue::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }),
        OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => value
            .get::<chrono::DateTime<chrono::FixedOffset>>()
            .map_or(JsonValue::Null, |t| JsonValue::String(t.to_rfc3339())),
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
            value.get::<Vec<u8>>().map_or(JsonValue::Null, |bytes| {
                use base64::Engine;
                JsonValue::String(format!(
                    "base64:{}",
                    base64::engine::general_purpose::STANDARD.encode(bytes)
                ))
            })
        }
        _ => value
            .get::<String>()
            .map_or(JsonValue::Null, JsonValue::String),
    }
}

/// Oracle NUMBER arrives as text; keep integers and finite decimals numeric.
fn number_or_text(text: &str) -> JsonValue {
    if let Ok(n) = text.parse::<i64>() {
        return JsonValue::from(n);
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map_or_else(|| JsonValue::String(text.to_string()), JsonValue::Number)
}
