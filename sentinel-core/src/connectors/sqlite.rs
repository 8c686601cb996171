//! SQLite source connector.
//!
//! The data source's `database` field is the database file path (or
//! `:memory:`). The file is opened read-only and must already exist.

use super::{
    BatchSender, ExtractionQuery, RowCursor, SourceConnector, SourceRow, SourceTable,
    group_catalog_rows,
};
use crate::config::ConnectionSettings;
use crate::models::{DataSource, DatabaseType};
use crate::{Result, SentinelError};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use std::str::FromStr;

/// Read-only connector over a SQLite file.
pub struct SqliteConnector {
    pool: SqlitePool,
    path: String,
}

impl std::fmt::Debug for SqliteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnector")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConnector {
    /// Prepares a lazily connecting pool for the data source's file.
    ///
    /// # Errors
    /// Returns a configuration error when the path is empty or malformed.
    pub fn new(source: &DataSource, settings: &ConnectionSettings) -> Result<Self> {
        let path = source.database.trim();
        if path.is_empty() {
            return Err(SentinelError::configuration(format!(
                "Data source '{}' has no SQLite database path",
                source.name
            )));
        }

        let options = SqliteConnectOptions::from_str(&normalize_connection_string(path))
            .map_err(|e| {
                SentinelError::configuration(format!("Invalid SQLite database path: {e}"))
            })?
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.connect_timeout())
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }
}

/// Normalizes a path or URL to a `sqlite:` URL.
fn normalize_connection_string(path: &str) -> String {
    if path == ":memory:" {
        return "sqlite::memory:".to_string();
    }
    if path.starts_with("sqlite:") {
        return path.to_string();
    }
    format!("sqlite://{path}")
}

#[async_trait]
impl SourceConnector for SqliteConnector {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    async fn test_connection(&self) -> Result<()> {
        let result: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                SentinelError::connection_failed(
                    format!("Failed to open SQLite database {}", self.path),
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
        let rows = sqlx::query(
            "SELECT m.name AS table_name, p.name AS column_name, p.type AS data_type \
             FROM sqlite_master m JOIN pragma_table_info(m.name) p \
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' \
             ORDER BY m.name, p.cid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SentinelError::extraction_failed("Failed to list SQLite tables", e))?;

        let catalog = rows
            .iter()
            .map(|row| {
                Ok((
                    None,
                    row.try_get::<String, _>("table_name")?,
                    row.try_get::<String, _>("column_name")?,
                    row.try_get::<String, _>("data_type")?,
                ))
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| SentinelError::extraction_failed("Failed to read SQLite catalog", e))?;

        Ok(group_catalog_rows(catalog))
    }

    async fn open_cursor(&self, query: &ExtractionQuery, batch_size: usize) -> Result<RowCursor> {
        let sql = self.dialect().build_select(query);
        let table = query.table.clone();
        let pool = self.pool.clone();
        tracing::debug!("Extracting from SQLite {}: {}", self.path, sql);

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

fn row_to_json(row: &SqliteRow) -> SourceRow {
    let mut map = SourceRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), extract_column_value(row, index));
    }
    map
}

/// Extracts a column value as JSON, trying types in order of likelihood.
fn extract_column_value(row: &SqliteRow, index: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(JsonValue::Null, |n| JsonValue::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map_or(JsonValue::Null, JsonValue::Number);
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
    use tempfile::TempDir;

    async fn seeded_source(dir: &TempDir) -> DataSource {
        let path = dir.path().join("source.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await.unwrap();
        sqlx::query(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, score REAL, avatar BLOB, note TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO users VALUES (1, 'a@example.com', 1.5, x'0102', NULL), \
             (2, 'b@example.com', 2.5, NULL, 'vip'), (3, 'c@example.com', 3.5, NULL, NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;

        DataSource::new(
            "ds",
            "local",
            DatabaseType::Sqlite,
            "",
            path.to_string_lossy().to_string(),
        )
    }

    #[test]
    fn test_normalize_connection_string() {
        assert_eq!(normalize_connection_string(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_connection_string("/path/to/db.sqlite"),
            "sqlite:///path/to/db.sqlite"
        );
        assert_eq!(normalize_connection_string("sqlite://x.db"), "sqlite://x.db");
    }

    #[test]
    fn test_empty_path_rejected() {
        let source = DataSource::new("ds", "local", DatabaseType::Sqlite, "", " ");
        assert!(SqliteConnector::new(&source, &ConnectionSettings::default()).is_err());
    }

    #[tokio::test]
    async fn test_sqlite_connector_streams_rows() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let source = seeded_source(&dir).await;
        let connector = SqliteConnector::new(&source, &ConnectionSettings::default())?;
        connector.test_connection().await?;

        let query = ExtractionQuery {
            table: "users".to_string(),
            columns: vec![
                "id".to_string(),
                "email".to_string(),
                "score".to_string(),
                "avatar".to_string(),
                "note".to_string(),
            ],
            order_by: vec!["id".to_string()],
            ..Default::default()
        };
        let mut cursor = connector.open_cursor(&query, 2).await?;
        let mut rows = Vec::new();
        while let Some(batch) = cursor.next_batch().await? {
            assert!(batch.len() <= 2);
            rows.extend(batch);
        }

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], serde_json::json!(1));
        assert_eq!(rows[0]["email"], serde_json::json!("a@example.com"));
        assert_eq!(rows[0]["score"], serde_json::json!(1.5));
        assert_eq!(rows[0]["avatar"], serde_json::json!("base64:AQI="));
        assert_eq!(rows[0]["note"], JsonValue::Null);
        assert_eq!(rows[1]["note"], serde_json::json!("vip"));

        connector.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_connector_lists_tables() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let source = seeded_source(&dir).await;
        let connector = SqliteConnector::new(&source, &ConnectionSettings::default())?;

        let tables = connector.list_tables().await?;
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "users");
        let names: Vec<&str> = tables[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "email", "score", "avatar", "note"]);
        assert_eq!(tables[0].columns[0].data_type, "INTEGER");
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_missing_file_fails_connection() {
        let dir = TempDir::new().unwrap();
        let source = DataSource::new(
            "ds",
            "missing",
            DatabaseType::Sqlite,
            "",
            dir.path().join("nope.db").to_string_lossy().to_string(),
        );
        let connector = SqliteConnector::new(&source, &ConnectionSettings::default()).unwrap();
        let result = connector.test_connection().await;
        assert!(matches!(result, Err(SentinelError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_sqlite_missing_table_surfaces_in_cursor() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let source = seeded_source(&dir).await;
        let connector = SqliteConnector::new(&source, &ConnectionSettings::default())?;
        let query = ExtractionQuery {
            table: "ghosts".to_string(),
            ..Default::default()
        };
        let mut cursor = connector.open_cursor(&query, 10).await?;
        assert!(cursor.next_batch().await.is_err());
        Ok(())
    }
}
