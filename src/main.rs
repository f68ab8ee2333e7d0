//! N-Defender Aggregator daemon
//!
//! # Usage
//!
//! ```bash
//! # Defaults, or ./aggregator.toml when present
//! ndefender-aggregator
//!
//! # Explicit config file and verbose logging
//! ndefender-aggregator --config /etc/ndefender/aggregator.toml --log-level debug
//! ```
//!
//! # Environment Variables
//!
//! - `NDEFENDER_CONFIG`: Path to the TOML config (when `--config` is absent)
//! - `RUST_LOG`: Logging filter, takes precedence over the configured level

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ndefender_aggregator::config::defaults::HEALTH_LOG_INTERVAL_SECS;
use ndefender_aggregator::config::{ConfigSearch, ConfigSource};
use ndefender_aggregator::{
    build_command_router, build_default_orchestrator, clock, AggregatorConfig, ContactFusion, EventBus,
    HealthStatus, StateStore,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "ndefender-aggregator")]
#[command(about = "N-Defender sensor aggregation backend")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file (skips the standard search order)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level / filter directive, overrides `logging.level`
    #[arg(long, env = "NDEFENDER_LOG_LEVEL")]
    log_level: Option<String>,
}

/// `--log-level` wins over the configured `logging.level`.
fn log_directive<'a>(cli: Option<&'a str>, config: &'a AggregatorConfig) -> &'a str {
    cli.unwrap_or(&config.logging.level)
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let search = match &args.config {
        Some(path) => ConfigSearch {
            config: AggregatorConfig::load_from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            source: ConfigSource::File(path.clone()),
            skipped: Vec::new(),
        },
        None => AggregatorConfig::load(),
    };
    init_logging(log_directive(args.log_level.as_deref(), &search.config));
    search.log();
    let config = search.config;

    info!("Starting N-Defender aggregator v{}", env!("CARGO_PKG_VERSION"));

    let clock = clock::system();
    let bus = Arc::new(EventBus::new(config.bus.max_queue_size).context("creating event bus")?);
    let state = Arc::new(StateStore::new(Arc::clone(&clock)));
    let fusion = Arc::new(ContactFusion::new(Arc::clone(&state)));

    let runtime = build_default_orchestrator(
        &config,
        Arc::clone(&state),
        Arc::clone(&bus),
        fusion,
        Arc::clone(&clock),
    )
    .context("building ingestors")?;
    let router = build_command_router(&config, &runtime, Arc::clone(&clock));
    info!(
        ingestors = runtime.orchestrator.ingestors().len(),
        command_handlers = router.handler_count(),
        "Runtime assembled"
    );

    if let Err(e) = runtime.orchestrator.start().await {
        warn!(error = %e, "Some ingestors failed to start");
    }

    let mut health_tick = tokio::time::interval(Duration::from_secs(HEALTH_LOG_INTERVAL_SECS));
    health_tick.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = health_tick.tick() => {
                for (name, health) in runtime.orchestrator.health().await {
                    if health.status == HealthStatus::Ok {
                        info!(ingestor = %name, status = %health.status, "Ingestor health");
                    } else {
                        warn!(
                            ingestor = %name,
                            status = %health.status,
                            last_error = health.last_error.as_deref().unwrap_or("-"),
                            "Ingestor health"
                        );
                    }
                }
                let snapshot = state.snapshot().await;
                info!(
                    contacts = snapshot.contacts.as_array().map_or(0, Vec::len),
                    subscribers = bus.subscriber_count(),
                    "Status"
                );
            }
        }
    }

    runtime
        .orchestrator
        .stop()
        .await
        .context("stopping ingestors")?;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_used_without_flag() {
        let mut config = AggregatorConfig::default();
        config.logging.level = "debug".into();
        assert_eq!(log_directive(None, &config), "debug");
        assert_eq!(log_directive(Some("trace"), &config), "trace");
    }

    #[test]
    fn test_searched_config_level_reaches_logging() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(ndefender_aggregator::config::LOCAL_CONFIG_FILE),
            "[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();
        let search = AggregatorConfig::search(None, dir.path());
        assert_eq!(log_directive(None, &search.config), "warn");
    }
}
