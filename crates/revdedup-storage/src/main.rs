#![warn(missing_docs)]
//! RevDedup bucket reclamation job

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use revdedup_storage::{compact, MetadataLog, StoreConfig, CONFIG_ENV};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 1 {
        eprintln!("Usage: rdd-reclaim");
        return ExitCode::from(2);
    }

    tracing::info!("RevDedup bucket reclamation starting...");

    // Errors abort; on-disk state is left as-is for a re-run.
    if let Err(e) = run() {
        tracing::error!("bucket reclamation failed: {:#}", e);
        std::process::abort();
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            StoreConfig::from_file(&path)
                .with_context(|| format!("loading config {}", path.display()))?
        }
        None => {
            tracing::warn!("{} not set, using default configuration", CONFIG_ENV);
            StoreConfig::default()
        }
    };
    tracing::info!("Data directory: {}", config.data_dir.display());

    let mut log = MetadataLog::open(&config).context("opening metadata log")?;
    tracing::info!(
        "Segment map: {}/{} used, bucket map: {}/{} used",
        log.segment_high_water().into_inner(),
        log.segment_capacity(),
        log.bucket_high_water().into_inner(),
        log.bucket_capacity()
    );
    let report = compact(&mut log, &config).context("compacting buckets")?;

    tracing::info!(
        "reclaimed {} buckets ({} bytes, {} resumed), wrote {} new buckets",
        report.driver.buckets_reclaimed,
        report.driver.bytes_freed,
        report.driver.buckets_resumed,
        report.writer.buckets_sealed
    );
    Ok(())
}
