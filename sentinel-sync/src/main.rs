//! SentinelConnect sync scheduler and runner.
//!
//! Connects operator-defined sync configurations to their source databases,
//! either on a cron schedule (`serve`) or on demand (`run`).
//!
//! # Security Guarantees
//! - Read-only database operations only
//! - No credentials or masking secrets logged
//! - Optional AES-GCM encryption for artifacts

use anyhow::{Context, Result, bail};
use clap::Parser;
use sentinel_core::logging::init_logging;
use sentinel_core::{JobStatus, SecretString};
use sentinel_sync::{Cli, Command, Session};
use serde::Serialize;
use std::io::{self, Write};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.json_logs)?;

    let prompted = if cli.engine.prompt_encryption_key {
        Some(prompt_passphrase()?)
    } else {
        None
    };
    let settings = cli.engine.settings(prompted)?;

    let session = Session::open(&cli.store, settings, cli.actor.clone())
        .await
        .with_context(|| format!("Failed to open store {}", cli.store.display()))?;

    let outcome = dispatch(&session, &cli.command).await;
    session.close().await;
    outcome
}

async fn dispatch(session: &Session, command: &Command) -> Result<()> {
    match command {
        Command::Serve => {
            let status = session
                .serve(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await;
            info!(
                "Scheduler exited with {} configurations scheduled",
                status.total_scheduled
            );
            Ok(())
        }
        Command::Run(args) => {
            let job = session
                .run(&args.config)
                .await
                .with_context(|| format!("Sync '{}' could not start", args.config))?;
            print_json(&job)?;
            if job.status != JobStatus::Completed {
                bail!(
                    "Sync '{}' finished {}: {}",
                    args.config,
                    job.status,
                    job.error_message.as_deref().unwrap_or("no details")
                );
            }
            Ok(())
        }
        Command::TestSource(args) => {
            let report = session.test_source(&args.data_source).await?;
            print_json(&report)?;
            if let Some(message) = &report.error {
                bail!("Data source '{}' unreachable: {}", args.data_source, message);
            }
            Ok(())
        }
        Command::Tables(args) => {
            let tables = session
                .tables(&args.data_source)
                .await
                .with_context(|| format!("Failed to list tables of '{}'", args.data_source))?;
            print_json(&tables)
        }
        Command::Import(args) => {
            let summary = session.import(&args.file).await?;
            print_json(&summary)
        }
        Command::Jobs(args) => {
            let jobs = session.jobs(args.config.as_deref(), args.limit).await?;
            print_json(&jobs)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{text}");
    Ok(())
}

/// Reads the artifact passphrase from the terminal, with confirmation.
fn prompt_passphrase() -> Result<SecretString> {
    print!("Enter artifact passphrase: ");
    io::stdout()
        .flush()
        .context("Failed to flush stdout before reading passphrase")?;
    let passphrase = SecretString::new(
        rpassword::read_password().context("Failed to read passphrase")?,
    );
    if passphrase.is_empty() {
        bail!("Passphrase cannot be empty");
    }

    print!("Confirm artifact passphrase: ");
    io::stdout()
        .flush()
        .context("Failed to flush stdout before reading passphrase confirmation")?;
    let confirm = SecretString::new(
        rpassword::read_password().context("Failed to read passphrase confirmation")?,
    );
    if passphrase.expose() != confirm.expose() {
        bail!("Passphrases do not match");
    }

    Ok(passphrase)
}
