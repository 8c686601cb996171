//! SQL dialect differences that matter for extraction.
//!
//! Table and column names come from administrator configuration and are
//! always quoted. Row filters are raw SQL and are inserted as given.
//! Watermark values are inlined as literals so one query text works across
//! drivers with different placeholder syntaxes. Oracle and SQL Server do not
//! reliably convert ISO-8601 strings, so temporal bounds get typed literals
//! there.

use super::ExtractionQuery;
use crate::models::DatabaseType;
use crate::watermark::{TimePoint, parse_time_point};
use chrono::{NaiveDateTime, Timelike};

/// SQL flavour of a source database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
    SqlServer,
    Oracle,
}

impl Dialect {
    /// Dialect spoken by a database type.
    pub const fn for_database(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::PostgreSql => Self::Postgres,
            DatabaseType::MySql => Self::MySql,
            DatabaseType::Sqlite => Self::Sqlite,
            DatabaseType::SqlServer => Self::SqlServer,
            DatabaseType::Oracle => Self::Oracle,
        }
    }

    /// Quotes an identifier, doubling embedded quote characters.
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::SqlServer => format!("[{}]", ident.replace(']', "]]")),
            Self::Postgres | Self::Sqlite | Self::Oracle => {
                format!("\"{}\"", ident.replace('"', "\"\""))
            }
        }
    }

    /// Quotes a string literal.
    pub fn quote_literal(self, value: &str) -> String {
        let escaped = value.replace('\'', "''");
        match self {
            // MySQL treats backslash as an escape character by default.
            Self::MySql => format!("'{}'", escaped.replace('\\', "\\\\")),
            Self::SqlServer => format!("N'{escaped}'"),
            _ => format!("'{escaped}'"),
        }
    }

    /// Literal for a watermark lower bound.
    pub fn bound_literal(self, value: &str) -> String {
        let point = match self {
            Self::Oracle | Self::SqlServer => parse_time_point(value),
            _ => None,
        };
        match (self, point) {
            (Self::Oracle, Some(TimePoint::Local(t))) => format!(
                "TO_TIMESTAMP('{}', 'YYYY-MM-DD HH24:MI:SS.FF')",
                t.format("%Y-%m-%d %H:%M:%S%.9f")
            ),
            (Self::Oracle, Some(TimePoint::Zoned(t))) => format!(
                "TO_TIMESTAMP_TZ('{}', 'YYYY-MM-DD HH24:MI:SS.FF TZH:TZM')",
                t.format("%Y-%m-%d %H:%M:%S%.9f %:z")
            ),
            (Self::SqlServer, Some(TimePoint::Local(t))) => {
                format!("CONVERT(datetime2, '{}', 126)", iso_ticks(&t))
            }
            (Self::SqlServer, Some(TimePoint::Zoned(t))) => format!(
                "CONVERT(datetimeoffset, '{}{}', 127)",
                iso_ticks(&t.naive_local()),
                t.format("%:z")
            ),
            _ => self.quote_literal(value),
        }
    }

    /// `schema.table` or `table`, quoted.
    pub fn qualified_table(self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) if !schema.is_empty() => {
                format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
            }
            _ => self.quote_ident(table),
        }
    }

    /// `ORDER BY` clause for the query, optionally qualifying columns with
    /// a table alias.
    pub fn order_clause(self, query: &ExtractionQuery, alias: Option<&str>) -> Option<String> {
        if query.order_by.is_empty() {
            return None;
        }
        let columns: Vec<String> = query
            .order_by
            .iter()
            .map(|c| match alias {
                Some(alias) => format!("{alias}.{} ASC", self.quote_ident(c)),
                None => format!("{} ASC", self.quote_ident(c)),
            })
            .collect();
        Some(format!("ORDER BY {}", columns.join(", ")))
    }

    /// `WHERE` clause combining the row filter and the watermark bound.
    pub fn where_clause(self, query: &ExtractionQuery) -> Option<String> {
        let mut predicates = Vec::new();
        if let Some(filter) = query.filter.as_deref().map(str::trim)
            && !filter.is_empty()
        {
            predicates.push(format!("({filter})"));
        }
        if let Some((column, value)) = &query.lower_bound {
            predicates.push(format!(
                "{} > {}",
                self.quote_ident(column),
                self.bound_literal(value)
            ));
        }
        if predicates.is_empty() {
            None
        } else {
            Some(format!("WHERE {}", predicates.join(" AND ")))
        }
    }

    /// Builds the full extraction SELECT.
    ///
    /// # Example
    /// ```rust
    /// use sentinel_core::connectors::{Dialect, ExtractionQuery};
    ///
    /// let query = ExtractionQuery {
    ///     table: "users".to_string(),
    ///     columns: vec!["id".to_string(), "email".to_string()],
    ///     order_by: vec!["id".to_string()],
    ///     limit: Some(10),
    ///     ..Default::default()
    /// };
    /// assert_eq!(
    ///     Dialect::Sqlite.build_select(&query),
    ///     r#"SELECT "id", "email" FROM "users" ORDER BY "id" ASC LIMIT 10"#
    /// );
    /// ```
    pub fn build_select(self, query: &ExtractionQuery) -> String {
        let columns = if query.columns.is_empty() {
            "*".to_string()
        } else {
            query
                .columns
                .iter()
                .map(|c| self.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = match (self, query.limit) {
            (Self::SqlServer, Some(limit)) => format!("SELECT TOP ({limit}) {columns}"),
            _ => format!("SELECT {columns}"),
        };
        sql.push_str(" FROM ");
        sql.push_str(&self.qualified_table(query.schema.as_deref(), &query.table));

        if let Some(clause) = self.where_clause(query) {
            sql.push(' ');
            sql.push_str(&clause);
        }
        if let Some(clause) = self.order_clause(query, None) {
            sql.push(' ');
            sql.push_str(&clause);
        }
        if let Some(limit) = query.limit {
            match self {
                Self::Postgres | Self::MySql | Self::Sqlite => {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                Self::Oracle => sql.push_str(&format!(" FETCH FIRST {limit} ROWS ONLY")),
                Self::SqlServer => {}
            }
        }
        sql
    }
}

/// ISO-8601 with the 7 fractional digits (100ns ticks) `datetime2` holds.
fn iso_ticks(t: &NaiveDateTime) -> String {
    format!(
        "{}.{:07}",
        t.format("%Y-%m-%dT%H:%M:%S"),
        (t.nanosecond() / 100).min(9_999_999)
    )
}
