//! Data model shared by the engine, the stores, and the CLI.
//!
//! These are the entities an administrator authors (data sources, sync
//! configurations, table and column rules) and the records the engine
//! produces (jobs and audit entries). Identifiers are opaque strings; the
//! engine mints UUID v4 identifiers for the records it creates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported source database dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// PostgreSQL
    PostgreSql,
    /// MySQL / MariaDB
    MySql,
    /// Microsoft SQL Server
    #[serde(rename = "mssql")]
    SqlServer,
    /// Oracle Database
    Oracle,
    /// SQLite (the `database` field is a file path)
    Sqlite,
}

impl DatabaseType {
    /// Tag used in stored configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PostgreSql => "postgresql",
            Self::MySql => "mysql",
            Self::SqlServer => "mssql",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
        }
    }

    /// Default TCP port for network dialects.
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Self::PostgreSql => Some(5432),
            Self::MySql => Some(3306),
            Self::SqlServer => Some(1433),
            Self::Oracle => Some(1521),
            Self::Sqlite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PostgreSql => write!(f, "PostgreSQL"),
            Self::MySql => write!(f, "MySQL"),
            Self::SqlServer => write!(f, "SQL Server"),
            Self::Oracle => write!(f, "Oracle"),
            Self::Sqlite => write!(f, "SQLite"),
        }
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = crate::SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Self::PostgreSql),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "mssql" | "sqlserver" => Ok(Self::SqlServer),
            "oracle" => Ok(Self::Oracle),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(crate::SentinelError::configuration(format!(
                "Unknown database type: {other}"
            ))),
        }
    }
}

/// Last known result of a connectivity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The last probe succeeded
    Connected,
    /// The last probe failed
    Failed,
    /// Never probed
    #[default]
    Untested,
}

impl ConnectionStatus {
    /// Tag used in stored configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Untested => "untested",
        }
    }

    /// Parses a stored tag; unknown tags read as untested.
    pub fn parse(s: &str) -> Self {
        match s {
            "connected" => Self::Connected,
            "failed" => Self::Failed,
            _ => Self::Untested,
        }
    }
}

/// A remote SQL database the engine extracts from.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub db_type: DatabaseType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Never serialized; accepted on import only.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_tested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connection_status: ConnectionStatus,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("ssl_enabled", &self.ssl_enabled)
            .field("is_active", &self.is_active)
            .field("connection_status", &self.connection_status)
            // password intentionally omitted
            .finish_non_exhaustive()
    }
}

impl DataSource {
    /// Creates an active, untested data source.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        db_type: DatabaseType,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            db_type,
            host: host.into(),
            port: db_type.default_port(),
            database: database.into(),
            username: None,
            password: None,
            ssl_enabled: false,
            is_active: true,
            last_tested_at: None,
            connection_status: ConnectionStatus::Untested,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets login credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Enables TLS for the connection.
    #[must_use]
    pub const fn with_ssl(mut self, enabled: bool) -> Self {
        self.ssl_enabled = enabled;
        self
    }

    /// Effective port: the configured one or the dialect default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.db_type.default_port())
    }

    /// Human-readable connection target without credentials.
    pub fn display_target(&self) -> String {
        match (self.db_type, self.effective_port()) {
            (DatabaseType::Sqlite, _) => format!("sqlite:{}", self.database),
            (_, Some(port)) => format!("{}:{}/{}", self.host, port, self.database),
            (_, None) => format!("{}/{}", self.host, self.database),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Full re-extraction or watermark-bounded extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every run extracts all rows (subject to filter and cap)
    #[default]
    Full,
    /// Each run extracts rows past the table's watermark
    Incremental,
}

impl SyncMode {
    /// Tag used in stored configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = crate::SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(crate::SentinelError::configuration(format!(
                "Unknown sync mode: {other}"
            ))),
        }
    }
}

/// When a sync configuration runs on its own
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Only on explicit trigger
    #[default]
    Manual,
    /// Top of every hour
    Hourly,
    /// Midnight every day
    Daily,
    /// Midnight every Sunday
    Weekly,
    /// Arbitrary cron expression
    Cron {
        /// Five-field (or six-field with seconds) cron expression
        expression: String,
    },
}

impl Schedule {
    /// Stored tag of the schedule kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Cron { .. } => "cron",
        }
    }

    /// Rebuilds a schedule from its stored kind and optional expression.
    pub fn from_parts(kind: &str, expression: Option<&str>) -> crate::Result<Self> {
        match kind {
            "manual" => Ok(Self::Manual),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "cron" => match expression.map(str::trim) {
                Some(expr) if !expr.is_empty() => Ok(Self::Cron {
                    expression: expr.to_string(),
                }),
                _ => Err(crate::SentinelError::invalid_schedule(
                    "",
                    "cron schedule requires an expression",
                )),
            },
            other => Err(crate::SentinelError::configuration(format!(
                "Unknown schedule type: {other}"
            ))),
        }
    }

    /// The five-field cron recurrence for this schedule, `None` for manual.
    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Self::Manual => None,
            Self::Hourly => Some("0 * * * *"),
            Self::Daily => Some("0 0 * * *"),
            Self::Weekly => Some("0 0 * * 0"),
            Self::Cron { expression } => Some(expression.as_str()),
        }
    }

    /// Stored expression for `cron` schedules only.
    pub fn stored_expression(&self) -> Option<&str> {
        match self {
            Self::Cron { expression } => Some(expression.as_str()),
            _ => None,
        }
    }

    /// True for schedules that never fire on their own.
    pub const fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }
}

/// Which tables to extract from a data source, how, and where to write them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub data_source_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub schedule: Schedule,
    /// Output directory
    pub output_path: String,
    /// Base file name; stage suffixes are appended when compressing or encrypting
    pub output_file_name: String,
    #[serde(default)]
    pub compress_output: bool,
    #[serde(default)]
    pub encrypt_output: bool,
}

impl SyncConfig {
    /// Creates an active, manual, full-mode configuration.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        data_source_id: impl Into<String>,
        output_path: impl Into<String>,
        output_file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            data_source_id: data_source_id.into(),
            is_active: true,
            sync_mode: SyncMode::Full,
            schedule: Schedule::Manual,
            output_path: output_path.into(),
            output_file_name: output_file_name.into(),
            compress_output: false,
            encrypt_output: false,
        }
    }

    /// Sets the schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Sets the sync mode.
    #[must_use]
    pub const fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Enables or disables the compression stage.
    #[must_use]
    pub const fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_output = enabled;
        self
    }

    /// Enables or disables the encryption stage.
    #[must_use]
    pub const fn with_encryption(mut self, enabled: bool) -> Self {
        self.encrypt_output = enabled;
        self
    }

    /// True when the scheduler should keep a timer for this configuration.
    pub const fn wants_timer(&self) -> bool {
        self.is_active && !self.schedule.is_manual()
    }
}

/// Per-table extraction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub id: String,
    /// Filled from the parent configuration when imported from a bundle
    #[serde(default)]
    pub sync_config_id: String,
    #[serde(default)]
    pub source_schema: Option<String>,
    pub source_table: String,
    #[serde(default)]
    pub target_table: Option<String>,
    /// Raw SQL boolean expression, trusted administrator input
    #[serde(default)]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub row_limit: Option<u64>,
    #[serde(default)]
    pub incremental_column: Option<String>,
    /// Canonical text of the highest watermark value seen by a successful run
    #[serde(default)]
    pub last_sync_value: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
}

impl TableConfig {
    /// Creates an active table rule with no columns.
    pub fn new(
        id: impl Into<String>,
        sync_config_id: impl Into<String>,
        source_table: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sync_config_id: sync_config_id.into(),
            source_schema: None,
            source_table: source_table.into(),
            target_table: None,
            where_clause: None,
            row_limit: None,
            incremental_column: None,
            last_sync_value: None,
            is_active: true,
            columns: Vec::new(),
        }
    }

    /// Sets the source schema.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.source_schema = Some(schema.into());
        self
    }

    /// Sets the row cap.
    #[must_use]
    pub const fn with_row_limit(mut self, limit: u64) -> Self {
        self.row_limit = Some(limit);
        self
    }

    /// Sets the row filter predicate.
    #[must_use]
    pub fn with_where_clause(mut self, predicate: impl Into<String>) -> Self {
        self.where_clause = Some(predicate.into());
        self
    }

    /// Sets the incremental watermark column.
    #[must_use]
    pub fn with_incremental_column(mut self, column: impl Into<String>) -> Self {
        self.incremental_column = Some(column.into());
        self
    }

    /// Appends a column rule.
    #[must_use]
    pub fn with_column(mut self, column: ColumnConfig) -> Self {
        self.columns.push(column);
        self
    }

    /// Name the table is written under in the artifact.
    pub fn target_name(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.source_table)
    }

    /// `schema.table` for log messages.
    pub fn qualified_name(&self) -> String {
        match &self.source_schema {
            Some(schema) => format!("{schema}.{}", self.source_table),
            None => self.source_table.clone(),
        }
    }

    /// Included columns in projection order.
    pub fn included_columns(&self) -> impl Iterator<Item = &ColumnConfig> {
        self.columns.iter().filter(|c| c.is_included)
    }

    /// Primary-key columns in declaration order.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.source_column.as_str())
            .collect()
    }
}

/// How a column's values are transformed before leaving the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingType {
    /// Pass through unchanged
    #[default]
    None,
    /// Replace with a fixed placeholder
    Redact,
    /// Keyed deterministic hash
    Hash,
    /// Same-type synthetic value
    Randomize,
    /// Keep a prefix and suffix, mask the middle
    Partial,
    /// A tag this engine does not know; masked as redact
    #[serde(other)]
    Unrecognized,
}

impl MaskingType {
    /// Tag used in stored configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Redact => "redact",
            Self::Hash => "hash",
            Self::Randomize => "randomize",
            Self::Partial => "partial",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Parses a stored tag; unknown tags become [`MaskingType::Unrecognized`].
    pub fn parse(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "redact" => Self::Redact,
            "hash" => Self::Hash,
            "randomize" => Self::Randomize,
            "partial" => Self::Partial,
            _ => Self::Unrecognized,
        }
    }
}

/// Per-column projection and masking rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub id: String,
    #[serde(default)]
    pub table_config_id: String,
    pub source_column: String,
    #[serde(default)]
    pub target_column: Option<String>,
    /// Declared type, used to pick the synthetic value kind
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub masking_type: MaskingType,
    /// Opaque JSON parameters for the masking type
    #[serde(default)]
    pub masking_config: Option<String>,
    #[serde(default = "default_true")]
    pub is_included: bool,
    #[serde(default)]
    pub is_primary_key: bool,
}

impl ColumnConfig {
    /// Creates an included, unmasked column rule.
    pub fn new(
        id: impl Into<String>,
        table_config_id: impl Into<String>,
        source_column: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            table_config_id: table_config_id.into(),
            source_column: source_column.into(),
            target_column: None,
            data_type: None,
            masking_type: MaskingType::None,
            masking_config: None,
            is_included: true,
            is_primary_key: false,
        }
    }

    /// Sets the masking type and its parameters.
    #[must_use]
    pub fn with_masking(mut self, masking: MaskingType, params: Option<&str>) -> Self {
        self.masking_type = masking;
        self.masking_config = params.map(str::to_string);
        self
    }

    /// Sets the declared data type.
    #[must_use]
    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    /// Marks the column as part of the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    /// Excludes the column from the output projection.
    #[must_use]
    pub const fn excluded(mut self) -> Self {
        self.is_included = false;
        self
    }

    /// Renames the column in the output.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_column = Some(target.into());
        self
    }

    /// Name the column is written under in the artifact.
    pub fn target_name(&self) -> &str {
        self.target_column.as_deref().unwrap_or(&self.source_column)
    }
}

/// Lifecycle state of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never mutated again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Tag used in stored records.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::SentinelError::configuration(format!(
                "Unknown job status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Schedule,
}

impl TriggerSource {
    /// Tag used in stored records.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
        }
    }

    /// Parses a stored tag; unknown tags read as manual.
    pub fn parse(s: &str) -> Self {
        if s == "schedule" {
            Self::Schedule
        } else {
            Self::Manual
        }
    }
}

/// One execution of a sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub sync_config_id: String,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_processed: u64,
    pub tables_processed: u32,
    pub output_file_size: Option<u64>,
    pub output_file_path: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub triggered_by: TriggerSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// Creates a job that is already running, as admission does.
    pub fn start(sync_config_id: impl Into<String>, triggered_by: TriggerSource) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sync_config_id: sync_config_id.into(),
            status: JobStatus::Running,
            started_at: Some(now),
            completed_at: None,
            rows_processed: 0,
            tables_processed: 0,
            output_file_size: None,
            output_file_path: None,
            error_message: None,
            error_details: None,
            warnings: Vec::new(),
            triggered_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the job into a terminal state and stamps completion.
    pub fn finish(&mut self, status: JobStatus, error_message: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error_message = error_message;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Wall-clock duration, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start)),
            _ => None,
        }
    }
}

/// Authenticated principal a request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl Actor {
    /// Creates an actor with only an identifier.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            ip_address: None,
        }
    }

    /// Sets the email address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Audit event kinds the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    SyncTriggered,
    SyncCompleted,
    SyncFailed,
    SyncCancelled,
    DataSourceTested,
    ConfigurationImported,
}

impl AuditEvent {
    /// Stored event type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyncTriggered => "sync_triggered",
            Self::SyncCompleted => "sync_completed",
            Self::SyncFailed => "sync_failed",
            Self::SyncCancelled => "sync_cancelled",
            Self::DataSourceTested => "data_source_tested",
            Self::ConfigurationImported => "configuration_imported",
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub event_type: String,
    pub event_details: serde_json::Value,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub ip_address: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub data_source_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Creates an unattributed entry for an event.
    pub fn new(event: AuditEvent, event_details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event.as_str().to_string(),
            event_details,
            user_id: None,
            user_email: None,
            ip_address: None,
            resource_type: None,
            resource_id: None,
            data_source_id: None,
            created_at: Utc::now(),
        }
    }

    /// Attributes the entry to an actor, if any.
    #[must_use]
    pub fn with_actor(mut self, actor: Option<&Actor>) -> Self {
        if let Some(actor) = actor {
            self.user_id = Some(actor.user_id.clone());
            self.user_email.clone_from(&actor.email);
            self.ip_address.clone_from(&actor.ip_address);
        }
        self
    }

    /// Links the entry to the resource it concerns.
    #[must_use]
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Links the entry to a data source.
    #[must_use]
    pub fn with_data_source(mut self, data_source_id: impl Into<String>) -> Self {
        self.data_source_id = Some(data_source_id.into());
        self
    }
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
