//! Library half of the `sentinel-sync` binary.
//!
//! The argument structures and the [`session::Session`] that backs each
//! subcommand live here so they can be exercised without spawning the
//! binary. `main.rs` only parses, initializes logging, and prints.

pub mod session;

use clap::{Args, Parser, Subcommand};
use sentinel_core::{EngineSettings, SecretString};
use std::path::PathBuf;
use std::time::Duration;

pub use session::Session;

#[derive(Parser)]
#[command(name = "sentinel-sync")]
#[command(about = "SentinelConnect sync scheduler and runner")]
#[command(version)]
#[command(long_about = "
SentinelConnect Sync - scheduled extraction of masked database snapshots

Runs operator-defined sync configurations: rows are read from a source
database, sensitive columns are masked, and the result is written to a local
artifact file. Configurations live in a SQLite metadata store and are
authored with `sentinel-sync import`.

SECURITY FEATURES:
- Source databases are only ever read
- Credentials are never logged or written to artifacts
- Optional Zstandard compression and AES-GCM encryption of artifacts

EXAMPLES:
  sentinel-sync import configs.json
  sentinel-sync run crm-nightly
  sentinel-sync --hash-secret \"$PEPPER\" serve
  sentinel-sync jobs --config crm-nightly --limit 5
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Metadata store
    #[arg(
        long,
        env = "SENTINEL_STORE",
        default_value = "sentinel.db",
        help = "Path to the SQLite metadata store (created if missing)"
    )]
    pub store: PathBuf,

    /// Actor recorded in the audit trail
    #[arg(long, env = "SENTINEL_ACTOR", help = "User id recorded on audit entries")]
    pub actor: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the scheduler until interrupted
    Serve,
    /// Run one sync configuration now and wait for it
    Run(RunArgs),
    /// Test connectivity to a data source
    TestSource(SourceArgs),
    /// List tables visible through a data source
    Tables(SourceArgs),
    /// Import data sources and sync configurations from a JSON bundle
    Import(ImportArgs),
    /// Show recent jobs
    Jobs(JobsArgs),
}

#[derive(Args, Debug, PartialEq, Eq)]
pub struct RunArgs {
    #[arg(help = "Sync configuration id")]
    pub config: String,
}

#[derive(Args, Debug, PartialEq, Eq)]
pub struct SourceArgs {
    #[arg(help = "Data source id")]
    pub data_source: String,
}

#[derive(Args, Debug, PartialEq, Eq)]
pub struct ImportArgs {
    #[arg(help = "Configuration bundle (JSON)")]
    pub file: PathBuf,
}

#[derive(Args, Debug, PartialEq, Eq)]
pub struct JobsArgs {
    /// Only jobs of this configuration
    #[arg(long, help = "Only show jobs of this sync configuration")]
    pub config: Option<String>,

    #[arg(long, default_value = "20", help = "Maximum number of jobs to show")]
    pub limit: usize,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all output except errors")]
    pub quiet: bool,

    #[arg(long, help = "Emit logs as JSON lines")]
    pub json_logs: bool,
}

/// Engine settings taken from flags and environment variables.
#[derive(Args)]
pub struct EngineArgs {
    #[arg(
        long,
        env = "SENTINEL_HASH_SECRET",
        hide_env_values = true,
        help = "Key for the hash masking rule"
    )]
    pub hash_secret: Option<String>,

    #[arg(
        long,
        env = "SENTINEL_ENCRYPTION_KEY",
        hide_env_values = true,
        help = "Passphrase for encrypted artifacts"
    )]
    pub encryption_key: Option<String>,

    #[arg(
        long,
        conflicts_with = "encryption_key",
        help = "Prompt for the artifact passphrase instead of reading it from the environment"
    )]
    pub prompt_encryption_key: bool,

    #[arg(
        long,
        env = "SENTINEL_BATCH_SIZE",
        default_value_t = sentinel_core::config::DEFAULT_BATCH_SIZE,
        help = "Rows fetched per batch"
    )]
    pub batch_size: usize,

    #[arg(
        long,
        env = "SENTINEL_OUTPUT_DIR",
        default_value = "./output",
        help = "Output directory for configurations that leave theirs empty"
    )]
    pub output_dir: PathBuf,

    #[arg(long, help = "Row cap for tables without their own")]
    pub row_limit: Option<u64>,

    #[arg(long, default_value = "30", help = "Source connect timeout in seconds")]
    pub connect_timeout: u64,

    #[arg(
        long,
        help = "Keep randomize on primary-key columns instead of upgrading it to hash"
    )]
    pub allow_random_pk: bool,
}

impl EngineArgs {
    /// Builds validated engine settings. `prompted` is a passphrase read
    /// interactively, used when none was supplied through the environment.
    ///
    /// # Errors
    /// Returns a configuration error for out-of-range values.
    pub fn settings(&self, prompted: Option<SecretString>) -> sentinel_core::Result<EngineSettings> {
        let mut settings = EngineSettings::default()
            .with_batch_size(self.batch_size)
            .with_default_output_dir(self.output_dir.clone())
            .with_default_row_limit(self.row_limit)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .allow_nondeterministic_pk_masking(self.allow_random_pk);

        if let Some(secret) = &self.hash_secret {
            settings = settings.with_hash_secret(secret.as_str());
        }
        if let Some(key) = &self.encryption_key {
            settings = settings.with_encryption_passphrase(key.as_str());
        } else if let Some(key) = prompted {
            settings.encryption_passphrase = Some(key);
        }

        settings.validate()?;
        Ok(settings)
    }
}
