//! notifyd - Notification Dispatch Service
//!
//! Routes published notifications to subscribed delivery channels with
//! bounded queues, retries and graceful shutdown.

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use notifyd::{
    app::App,
    channels::ChannelConfig,
    cli::Cli,
    config::Config,
    internal_metrics, logging,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = Config::load(&cli).unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {err:#}");
        std::process::exit(1);
    });

    if cli.check_config {
        println!(
            "Configuration OK: {} channel(s), {} subscription(s)",
            config.channels.len(),
            config.subscriptions.len()
        );
        return Ok(());
    }

    logging::init(&config.log_level, config.log_format)?;

    info!("notifyd starting up...");
    log_config(&config);

    // =========================================================================
    // Metrics
    // =========================================================================
    let prometheus = if config.metrics.enabled {
        match internal_metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Metrics disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    // =========================================================================
    // Build and run
    // =========================================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut builder = App::builder(config);
    if let Some(handle) = prometheus {
        builder = builder.prometheus(handle);
    }
    let app = builder.build(shutdown_rx).await.map_err(|e| {
        error!("Failed to start: {:#}", e);
        e
    })?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down."),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let report = app.run().await?;
    if report.timed_out {
        warn!(
            discarded = report.discarded,
            "Shutdown deadline passed before all deliveries finished"
        );
    }
    info!("notifyd stopped.");
    Ok(())
}

fn log_config(config: &Config) {
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Queue Capacity: {}", config.engine.queue_capacity);
    info!("Workers Per Channel: {}", config.engine.workers_per_channel);
    info!(
        "Retry: {} attempts, {}ms initial backoff, {}ms max",
        config.engine.retry.max_attempts,
        config.engine.retry.initial_backoff_ms,
        config.engine.retry.max_backoff_ms
    );
    info!("Shutdown Timeout: {}ms", config.engine.shutdown_timeout_ms);
    if config.api.enabled {
        info!("API Listen Address: {}", config.api.listen_address);
    } else {
        info!("API: Disabled");
    }
    info!(
        "Metrics: {}",
        if config.metrics.enabled {
            "Enabled"
        } else {
            "Disabled"
        }
    );
    for channel in &config.channels {
        match channel {
            ChannelConfig::Webhook(c) => info!("Channel {}: webhook -> {}", c.id, c.url),
            ChannelConfig::Log(c) => info!("Channel {}: log ({:?})", c.id, c.level),
        }
    }
    info!("Subscriptions: {}", config.subscriptions.len());
    info!("-------------------------------------------------------");
}
