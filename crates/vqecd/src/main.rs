//! VQE-C Daemon - configuration and channel lineup updates
//!
//! Loads the client configuration, restores the cached channel lineup and
//! keeps both in step with the VCDS servers.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vqec_common::syscfg::DEFAULT_CONFIG_PATH;
use vqec_common::{ChannelDb, ConfigLoader, LiveSystem, SharedSystem, SysConfig};
use vqecd::{Updater, UpdaterDeps, UpdaterStatus};

/// Interval of the periodic status log line
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "vqecd")]
#[command(about = "VQE-C configuration update daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Startup configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, overrides the configured log level (RUST_LOG wins)
    #[arg(long)]
    log_level: Option<String>,

    /// Run the startup update and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = Arc::new(ConfigLoader::new(Some(cli.config.clone())));
    let config = loader
        .read_merged_config()
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("VQE-C Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let system = LiveSystem::new(config.clone()).into_shared();
    let mut updater = Updater::new(UpdaterDeps::new(Arc::clone(&system), Arc::clone(&loader)));
    updater.init(&config)?;
    restore_cached_lineup(&loader, &config, &system);

    // The startup pass does blocking network I/O
    let (mut updater, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = updater.startup_update();
        (updater, outcome)
    })
    .await?;
    let outcome = outcome?;
    info!(
        "Startup update: index {}, attributes {}, channels {}",
        outcome.index, outcome.attr, outcome.chan
    );

    if cli.once {
        log_status(&updater.status());
        updater.deinit();
        return Ok(());
    }

    updater.start()?;
    info!("VQE-C Daemon ready");

    let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = ticker.tick() => log_status(&updater.status()),
        }
    }

    info!("Shutting down gracefully");
    updater.deinit();
    Ok(())
}

/// Load the lineup cached by a previous run into the channel database
fn restore_cached_lineup(loader: &ConfigLoader, config: &SysConfig, system: &SharedSystem) {
    let Some(buf) = loader.read_cached_lineup(config) else {
        info!("No cached channel lineup");
        return;
    };
    let staged = match ChannelDb::validate_and_stage(&buf, config.max_channels) {
        Ok(staged) => staged,
        Err(e) => {
            warn!("Cached channel lineup rejected: {}", e);
            return;
        }
    };
    let mut live = system.write().unwrap_or_else(PoisonError::into_inner);
    match live.channels_mut().commit_staged(staged) {
        Ok(stats) => info!("Restored {} cached channels", stats.total),
        Err(e) => warn!("Cached channel lineup rejected: {}", e),
    }
}

fn log_status(status: &UpdaterStatus) {
    let next = status
        .seconds_until_next_update
        .map(|s| format!("{}s", s))
        .unwrap_or_else(|| "not scheduled".to_string());
    let server = status
        .last_index_request
        .server
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string());
    info!(
        "Updater {}: next update {}, index {} from {} ({}/{} failed), attributes {} ({}), channels {} ({})",
        status.state,
        next,
        status.last_index_request.result,
        server,
        status.total_index_failures,
        status.total_index_attempts,
        status.attr.version,
        status.attr.last_update_result,
        status.chan.version,
        status.chan.last_update_result
    );
}
