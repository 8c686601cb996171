//! Sync scheduling and execution engine for SentinelConnect.
//!
//! The engine extracts rows from operator-configured SQL sources, masks
//! sensitive columns, and writes the result to a local artifact file, either
//! on demand or on a cron recurrence.
//!
//! # Guarantees
//! - Source databases are only ever read
//! - At most one run per sync configuration is in flight in a process
//! - Incremental watermarks only advance after a table is fully written
//! - Credentials and masking secrets never reach logs, job records, or artifacts
//!
//! # Architecture
//! - [`store`]: configuration, job history, and audit trail behind async traits
//! - [`connectors`]: one [`connectors::SourceConnector`] per SQL dialect, chosen by a factory
//! - [`executor`]: runs one job from configuration snapshot to terminal state
//! - [`scheduler`]: per-configuration cron timers and the manual trigger path
//! - [`masking`], [`watermark`], [`output`]: the per-row pipeline stages

pub mod config;
pub mod connectors;
pub mod error;
pub mod executor;
pub mod guard;
pub mod logging;
pub mod masking;
pub mod models;
pub mod output;
pub mod probe;
pub mod scheduler;
pub mod store;
pub mod watermark;

// Re-export commonly used types
pub use config::{ConnectionSettings, EngineSettings, SecretString};
pub use connectors::{ConnectorFactory, ExtractionQuery, SourceConnector, SourceTable};
pub use error::{Result, SentinelError};
pub use executor::{RunPlan, SyncExecutor};
pub use guard::{AdmissionPermit, ConcurrencyGuard};
pub use models::{
    Actor, AuditEntry, ColumnConfig, ConnectionStatus, DataSource, DatabaseType, JobStatus,
    MaskingType, Schedule, SyncConfig, SyncJob, SyncMode, TableConfig, TriggerSource,
};
pub use probe::ProbeReport;
pub use scheduler::{ScheduleInfo, Scheduler, SchedulerStatus};
pub use store::{ConfigBundle, MemoryStore, SyncStore};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

#[cfg(feature = "encryption")]
pub use output::encryption;
