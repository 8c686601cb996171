//! Source connector abstraction and per-dialect implementations.
//!
//! A [`SourceConnector`] is the only thing the executor knows about a source
//! database: it can test connectivity, list tables, and open a streaming
//! [`RowCursor`] over an [`ExtractionQuery`]. The concrete connector is
//! chosen once per run by a [`ConnectorFactory`].
//!
//! # Module Structure
//! - `dialect`: identifier quoting, literal escaping, and SELECT assembly
//! - `cursor`: bounded-channel row cursor fed by a producer task
//! - Database-specific modules (postgres, mysql, sqlite, mssql, oracle)

use crate::config::ConnectionSettings;
use crate::models::{DataSource, DatabaseType};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod cursor;
pub mod dialect;

#[cfg(feature = "mssql")]
pub mod mssql;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "oracle")]
pub mod oracle;
#[cfg(feature = "postgresql")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cursor::{BatchSender, RowCursor};
pub use dialect::Dialect;

/// One extracted row keyed by source column name.
pub type SourceRow = serde_json::Map<String, serde_json::Value>;

/// A column as reported by the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// A table as reported by the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTable {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<SourceColumn>,
}

/// Groups catalog rows `(schema, table, column, type)`, already ordered by
/// table and column position, into tables.
pub(crate) fn group_catalog_rows<I>(rows: I) -> Vec<SourceTable>
where
    I: IntoIterator<Item = (Option<String>, String, String, String)>,
{
    let mut tables: Vec<SourceTable> = Vec::new();
    for (schema, table, column, data_type) in rows {
        let column = SourceColumn {
            name: column,
            data_type,
        };
        match tables.last_mut() {
            Some(last) if last.schema == schema && last.name == table => last.columns.push(column),
            _ => tables.push(SourceTable {
                schema,
                name: table,
                columns: vec![column],
            }),
        }
    }
    tables
}

/// What to read from one table.
///
/// `columns` is the full select list, which may include the watermark and
/// ordering columns even when they are not projected into the output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractionQuery {
    pub schema: Option<String>,
    pub table: String,
    pub columns: Vec<String>,
    /// Raw SQL boolean expression, AND-ed with the watermark bound
    pub filter: Option<String>,
    /// Strict lower bound `(column, value)` for incremental extraction
    pub lower_bound: Option<(String, String)>,
    /// Ascending sort columns
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
}

/// Capability interface every source dialect implements.
///
/// # Object Safety
/// The executor holds connectors as `Box<dyn SourceConnector>`.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Dialect tag of the source.
    fn database_type(&self) -> DatabaseType;

    /// SQL dialect used to build extraction queries.
    fn dialect(&self) -> Dialect {
        Dialect::for_database(self.database_type())
    }

    /// Opens (or verifies) connectivity to the source.
    ///
    /// # Errors
    /// Returns a connection error when the source is unreachable or rejects
    /// the credentials.
    async fn test_connection(&self) -> Result<()>;

    /// Lists user tables with their columns.
    async fn list_tables(&self) -> Result<Vec<SourceTable>>;

    /// Starts streaming the rows selected by `query` in batches of at most
    /// `batch_size`. Query errors surface from [`RowCursor::next_batch`].
    async fn open_cursor(&self, query: &ExtractionQuery, batch_size: usize) -> Result<RowCursor>;

    /// Releases pooled connections.
    async fn close(&self) {}
}

/// Builds the connector for a data source.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Constructs a connector without necessarily connecting yet.
    ///
    /// # Errors
    /// Returns a configuration error when the data source cannot be
    /// expressed as a connection, or the dialect is compiled out.
    async fn create(
        &self,
        source: &DataSource,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn SourceConnector>>;
}

/// Factory selecting the connector by the data source's dialect tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialectConnectorFactory;

#[async_trait]
impl ConnectorFactory for DialectConnectorFactory {
    async fn create(
        &self,
        source: &DataSource,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn SourceConnector>> {
        create_connector(source, settings)
    }
}

/// Selects and constructs the connector for `source`.
///
/// # Errors
/// Returns `UnsupportedFeature` when the dialect's driver is not compiled in.
pub fn create_connector(
    source: &DataSource,
    settings: &ConnectionSettings,
) -> Result<Box<dyn SourceConnector>> {
    tracing::debug!(
        "Creating {} connector for {}",
        source.db_type,
        source.display_target()
    );

    match source.db_type {
        #[cfg(feature = "postgresql")]
        DatabaseType::PostgreSql => Ok(Box::new(postgres::PostgresConnector::new(
            source, settings,
        )?)),
        #[cfg(not(feature = "postgresql"))]
        DatabaseType::PostgreSql => Err(crate::SentinelError::unsupported_feature(
            "PostgreSQL connector",
            "Compile with --features postgresql to enable PostgreSQL support",
        )),
        #[cfg(feature = "mysql")]
        DatabaseType::MySql => Ok(Box::new(mysql::MySqlConnector::new(source, settings)?)),
        #[cfg(not(feature = "mysql"))]
        DatabaseType::MySql => Err(crate::SentinelError::unsupported_feature(
            "MySQL connector",
            "Compile with --features mysql to enable MySQL support",
        )),
        #[cfg(feature = "sqlite")]
        DatabaseType::Sqlite => Ok(Box::new(sqlite::SqliteConnector::new(source, settings)?)),
        #[cfg(not(feature = "sqlite"))]
        DatabaseType::Sqlite => Err(crate::SentinelError::unsupported_feature(
            "SQLite connector",
            "Compile with --features sqlite to enable SQLite support",
        )),
        #[cfg(feature = "mssql")]
        DatabaseType::SqlServer => Ok(Box::new(mssql::SqlServerConnector::new(
            source, settings,
        )?)),
        #[cfg(not(feature = "mssql"))]
        DatabaseType::SqlServer => Err(crate::SentinelError::unsupported_feature(
            "SQL Server connector",
            "Compile with --features mssql to enable SQL Server support",
        )),
        #[cfg(feature = "oracle")]
        DatabaseType::Oracle => Ok(Box::new(oracle::OracleConnector::new(source, settings)?)),
        #[cfg(not(feature = "oracle"))]
        DatabaseType::Oracle => Err(crate::SentinelError::unsupported_feature(
            "Oracle connector",
            "Compile with --features oracle to enable Oracle support",
        )),
    }
}

/// Rejects data sources that cannot describe a network connection.
pub(crate) fn require_network_target(source: &DataSource) -> Result<()> {
    if source.host.trim().is_empty() {
        return Err(crate::SentinelError::configuration(format!(
            "Data source '{}' has no host",
            source.name
        )));
    }
    if source.effective_port() == Some(0) {
        return Err(crate::SentinelError::configuration(format!(
            "Data source '{}' has an invalid port",
            source.name
        )));
    }
    if source.database.trim().is_empty() {
        return Err(crate::SentinelError::configuration(format!(
            "Data source '{}' has no database name",
            source.name
        )));
    }
    Ok(())
}
