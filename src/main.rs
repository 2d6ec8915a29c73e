// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! index-sync - copy or synchronize documents between search clusters.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use index_sync::{Migrator, SyncConfig, SyncMode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Copy or synchronize documents between two search clusters
#[derive(Parser, Debug)]
#[command(name = "index-sync")]
#[command(author, version, about)]
struct Args {
    /// TOML config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source cluster URL (e.g., http://localhost:9200)
    #[arg(long)]
    source_url: Option<String>,

    /// Target cluster URL
    #[arg(long)]
    target_url: Option<String>,

    /// Source indices, comma list or pattern
    #[arg(long)]
    indices: Option<String>,

    /// Write into this index instead of the source index name
    #[arg(long)]
    target_index: Option<String>,

    /// Run mode
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Documents per scroll page
    #[arg(long)]
    page_size: Option<usize>,

    /// Bulk workers (copy mode)
    #[arg(long)]
    workers: Option<usize>,

    /// Bulk request ceiling in MB
    #[arg(long)]
    bulk_size: Option<usize>,

    /// Require green cluster health before starting
    #[arg(long)]
    wait_for_green: bool,

    /// Gzip request bodies sent to both clusters
    #[arg(long)]
    compress: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    /// Bulk-index every source document
    Copy,
    /// Apply only the differences, including deletes
    Sync,
}

impl From<ModeArg> for SyncMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Copy => SyncMode::Copy,
            ModeArg::Sync => SyncMode::Sync,
        }
    }
}

impl Args {
    fn into_config(self) -> index_sync::Result<SyncConfig> {
        let mut config = match self.config {
            Some(ref path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };
        if let Some(url) = self.source_url {
            config.source.url = url;
        }
        if let Some(url) = self.target_url {
            config.target.url = url;
        }
        if let Some(indices) = self.indices {
            config.target.indices = indices.clone();
            config.source.indices = indices;
        }
        if let Some(index) = self.target_index {
            config.target.indices = index.clone();
            config.transform.target_index = Some(index);
        }
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(page_size) = self.page_size {
            config.scan.doc_buffer_count = page_size;
        }
        if let Some(workers) = self.workers {
            config.bulk.workers = workers;
        }
        if let Some(bulk_size) = self.bulk_size {
            config.bulk.bulk_size_mb = bulk_size;
        }
        if self.wait_for_green {
            config.wait_for_green = true;
        }
        if self.compress {
            config.source.compress = true;
            config.target.compress = true;
        }
        Ok(config)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let migrator = match Migrator::new(config) {
        Ok(migrator) => migrator,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match migrator.run().await {
        Ok(report) => {
            info!(
                upserts = report.upserts,
                deletes = report.deletes,
                skipped = report.skipped,
                elapsed = %humantime::format_duration(report.elapsed),
                "Done"
            );
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
