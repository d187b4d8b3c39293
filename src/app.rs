//! The main application logic, decoupled from the entry point.

use crate::{
    api::{router, ApiServer},
    config::Config,
    core::{ChannelId, ChannelSender},
    engine::{Engine, ShutdownReport},
    filter::Filter,
    sink::ErrorSink,
    task_manager::TaskManager,
};
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// A handle to the running application.
pub struct App {
    engine: Arc<Engine>,
    task_manager: TaskManager,
    api_addr: Option<SocketAddr>,
    shutdown_rx: watch::Receiver<bool>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    /// The address the API is bound to, if enabled.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    /// Waits for the external shutdown signal, drains the engine, then stops
    /// the API.
    pub async fn run(self) -> Result<ShutdownReport> {
        let mut shutdown_rx = self.shutdown_rx;
        // A dropped sender is treated as a shutdown request.
        let _ = shutdown_rx.wait_for(|v| *v).await;
        info!("Shutdown signal received. Draining deliveries...");

        let report = self.engine.shutdown().await;

        self.task_manager.trigger_shutdown();
        self.task_manager.join_all().await;

        info!(
            timed_out = report.timed_out,
            discarded = report.discarded,
            "All tasks shut down."
        );
        Ok(report)
    }
}

/// Builder for the main application.
///
/// This pattern allows for a clean separation of concerns between constructing
/// the application's components and running the application. It also provides
/// a convenient way to override components for testing purposes.
pub struct AppBuilder {
    config: Config,
    sender_overrides: HashMap<ChannelId, Arc<dyn ChannelSender>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    prometheus: Option<PrometheusHandle>,
}

impl AppBuilder {
    /// Creates a new `AppBuilder` with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sender_overrides: HashMap::new(),
            error_sink: None,
            prometheus: None,
        }
    }

    /// Replaces the transport of a configured channel. Used by tests.
    pub fn sender_override(
        mut self,
        channel: impl Into<ChannelId>,
        sender: Arc<dyn ChannelSender>,
    ) -> Self {
        self.sender_overrides.insert(channel.into(), sender);
        self
    }

    /// Replaces the default dead-letter sink.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Serves this handle's exposition under `/metrics`.
    pub fn prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Builds and initializes all application components, returning a runnable `App`.
    #[instrument(skip_all)]
    pub async fn build(mut self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;

        // =========================================================================
        // 1. Engine and channels
        // =========================================================================
        let mut builder = Engine::builder(config.engine.clone());
        for channel in &config.channels {
            let id = channel.id();
            let sender = match self.sender_overrides.remove(&id) {
                Some(sender) => sender,
                None => channel
                    .build_sender()
                    .with_context(|| format!("failed to build channel '{id}'"))?,
            };
            builder = builder.channel_with(id, sender, channel.options());
        }
        if let Some(sink) = self.error_sink {
            builder = builder.error_sink(sink);
        }
        let engine = Arc::new(builder.build()?);

        // =========================================================================
        // 2. Startup subscriptions
        // =========================================================================
        for subscription in &config.subscriptions {
            let filter = Filter::compile(subscription.filter.clone())?;
            let id = engine.subscribe(
                subscription.topic.clone(),
                filter,
                subscription.channel.as_str(),
            )?;
            debug!(subscription_id = %id, topic = %subscription.topic, "Registered startup subscription");
        }

        // =========================================================================
        // 3. HTTP API
        // =========================================================================
        let task_manager = TaskManager::new();
        let api_addr = if config.api.enabled {
            let prometheus = if config.metrics.enabled {
                self.prometheus
            } else {
                None
            };
            let server = ApiServer::bind(
                config.api.listen_address,
                router(engine.clone(), prometheus),
                task_manager.shutdown_signal(),
            )
            .await?;
            let addr = server.local_addr()?;
            task_manager.spawn("ApiServer", server.run());
            Some(addr)
        } else {
            None
        };

        info!(
            channels = config.channels.len(),
            subscriptions = config.subscriptions.len(),
            api = ?api_addr,
            "notifyd started"
        );

        Ok(App {
            engine,
            task_manager,
            api_addr,
            shutdown_rx,
        })
    }
}
