// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! beacond - the beacon uploader.
//!
//! Drains a beacon store directory to the configured collection endpoint.
//! Host applications write events into the same directory; queues they
//! create are picked up on the next evaluation tick. One beacond per
//! directory is enforced with a lock file.
//!
//! Usage:
//!   beacond --config <file> [--state-dir <path>] [--connection wifi|cellular|none]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use beacon::{
    Config, ConditionsSnapshot, ConnectionClass, HttpTransport, Report, SystemClock, Telemetry,
};

mod env;

/// Log filename within the state directory.
const LOG_NAME: &str = "beacond.log";
/// Lock filename for single instance guarantee.
const LOCK_NAME: &str = "beacond.lock";

#[derive(Parser, Debug)]
#[command(name = "beacond", version, about = "Upload queued telemetry events")]
struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store directory; overrides storage.dir
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Network connection to assume (wifi, cellular, none)
    #[arg(long, default_value = "wifi")]
    connection: ConnectionClass,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
    .unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(2);
    });

    let state_dir = resolve_state_dir(args.state_dir.clone(), config.storage.dir.take());
    if let Err(e) = fs::create_dir_all(&state_dir) {
        eprintln!("error: failed to create {}: {e}", state_dir.display());
        std::process::exit(1);
    }
    config.storage.dir = Some(state_dir.clone());

    setup_logging(&state_dir.join(LOG_NAME));
    tracing::info!("beacond starting, state_dir={}", state_dir.display());

    let lock_file = match acquire_lock(&state_dir.join(LOCK_NAME)) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("failed to acquire lock: {}", e);
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&config, args.connection).await {
        tracing::error!("beacond failed: {}", e);
        eprintln!("error: {e}");
        drop(lock_file);
        std::process::exit(1);
    }

    drop(lock_file);
    tracing::info!("beacond stopped");
}

async fn run(config: &Config, connection: ConnectionClass) -> beacon::Result<()> {
    let transport = HttpTransport::new(&config.upload.endpoint, config.upload_timeout())?;
    tracing::info!("uploading to {}", transport.endpoint());

    let telemetry = Telemetry::start(config, Arc::new(transport), Arc::new(SystemClock))?;
    let mut reports = telemetry.subscribe();
    telemetry.conditions().update(snapshot(connection));

    // Signal readiness to a supervising process
    println!("READY");
    let _ = std::io::stdout().flush();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("shutting down");
                break;
            }
            report = reports.recv() => match report {
                Ok(report) => log_report(&report),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("skipped {} reports", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    telemetry.shutdown().await;
    match telemetry.metrics() {
        Ok(metrics) => tracing::info!(
            dropped = metrics.total_dropped(),
            stored_bytes = metrics.current_storage_bytes,
            "final metrics"
        ),
        Err(e) => tracing::warn!("failed to read metrics: {}", e),
    }
    Ok(())
}

/// Fixed conditions for the assumed connection.
fn snapshot(connection: ConnectionClass) -> ConditionsSnapshot {
    match connection {
        ConnectionClass::None => ConditionsSnapshot::offline(),
        class => ConditionsSnapshot::online(class),
    }
}

fn log_report(report: &Report) {
    match report {
        Report::Uploaded { target, batch_id, events } => {
            tracing::info!("uploaded batch {} for {} ({} events)", batch_id, target, events)
        }
        Report::Requeued { target, batch_id, events, retry_at_ms } => tracing::warn!(
            "batch {} for {} requeued ({} events, retry at {})",
            batch_id,
            target,
            events,
            retry_at_ms
        ),
        Report::DataLoss { target, batch_id, events, reason } => match batch_id {
            Some(batch_id) => tracing::error!(
                "dropped {} events of batch {} for {}: {}",
                events,
                batch_id,
                target,
                reason
            ),
            None => tracing::error!("dropped {} events for {}: {}", events, target, reason),
        },
        Report::StoreReset { target: Some(target), reason } => {
            tracing::error!("queue for {} was corrupt and has been reset: {}", target, reason)
        }
        Report::StoreReset { target: None, reason } => {
            tracing::error!("metrics database was corrupt and has been reset: {}", reason)
        }
    }
}

/// Flag, then config, then environment, then `~/.local/state/beacon`.
fn resolve_state_dir(flag: Option<PathBuf>, configured: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag.or(configured) {
        return dir;
    }
    if let Some(dir) = env::state_dir() {
        return dir;
    }
    if let Some(dir) = env::xdg_state_home() {
        return dir.join("beacon");
    }
    dirs::home_dir()
        .map(|h| h.join(".local/state/beacon"))
        .unwrap_or_else(|| PathBuf::from(".local/state/beacon"))
}

fn setup_logging(log_path: &Path) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env(env::names::RUST_LOG).unwrap_or_else(|_| EnvFilter::new("info"));

    // Try to open log file, fall back to stderr
    if let Ok(file) = fs::OpenOptions::new().create(true).append(true).open(log_path) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }
}

fn acquire_lock(lock_path: &Path) -> std::io::Result<fs::File> {
    use fs2::FileExt;

    let file = fs::OpenOptions::new().create(true).write(true).truncate(true).open(lock_path)?;
    file.try_lock_exclusive().map_err(|_| {
        std::io::Error::other(format!(
            "another beacond is already draining {}",
            lock_path.parent().unwrap_or(lock_path).display()
        ))
    })?;
    Ok(file)
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
