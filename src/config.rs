//! Configuration management for notifyd
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer, in increasing priority: built-in defaults, a
//! `notifyd.toml` file, `NOTIFYD_`-prefixed environment variables, and
//! command-line arguments.

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::channels::ChannelConfig;
use crate::core::ChannelId;
use crate::cli::Cli;
use crate::engine::EngineConfig;
use crate::filter::{Filter, FilterSpec};
use crate::retry::MAX_RETRY_DELAY;

/// Config file read when `--config` is not given. Missing is fine.
pub const DEFAULT_CONFIG_FILE: &str = "notifyd.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level, or any `tracing` filter directive.
    pub log_level: String,
    /// Human-readable text or one JSON object per line.
    pub log_format: LogFormat,
    /// Queueing, concurrency, retry and shutdown settings.
    pub engine: EngineConfig,
    /// The HTTP API.
    pub api: ApiConfig,
    /// Prometheus metrics exposed on the API under `/metrics`.
    pub metrics: MetricsConfig,
    /// Delivery channels, built once at startup.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Subscriptions registered at startup.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Configuration for the HTTP API.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_address: SocketAddr,
}

/// Configuration for metrics collection.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    pub enabled: bool,
}

/// A `[[subscriptions]]` entry.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub topic: String,
    pub channel: String,
    #[serde(default)]
    pub filter: FilterSpec,
}

impl Config {
    /// Loads the configuration, applying every layer the CLI allows.
    pub fn load(cli: &Cli) -> Result<Self> {
        let path = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    bail!("config file not found: {}", path.display());
                }
                path.clone()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        let config = Self::figment(&path).merge(cli.clone()).extract::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a file plus environment overrides, without CLI arguments.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            // e.g. NOTIFYD_ENGINE__QUEUE_CAPACITY=64
            .merge(Env::prefixed("NOTIFYD_").split("__"))
    }

    /// Checks the cross-field rules serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.engine.queue_capacity == 0 {
            bail!("engine.queue_capacity must be greater than 0");
        }
        if self.engine.workers_per_channel == 0 {
            bail!("engine.workers_per_channel must be greater than 0");
        }
        if self.engine.retry.max_attempts == 0 {
            bail!("engine.retry.max_attempts must be greater than 0");
        }
        if self.engine.requeue_delay_ms == 0 {
            bail!("engine.requeue_delay_ms must be greater than 0");
        }
        let max_delay_ms = MAX_RETRY_DELAY.as_millis() as u64;
        for (key, value) in [
            ("engine.requeue_delay_ms", self.engine.requeue_delay_ms),
            ("engine.retry.initial_backoff_ms", self.engine.retry.initial_backoff_ms),
            ("engine.retry.max_backoff_ms", self.engine.retry.max_backoff_ms),
            ("engine.retry.jitter_ms", self.engine.retry.jitter_ms),
        ] {
            if value > max_delay_ms {
                bail!("{} must not exceed {} ms", key, max_delay_ms);
            }
        }
        if self.engine.event_buffer == 0 {
            bail!("engine.event_buffer must be greater than 0");
        }
        if self.engine.dead_letter_capacity == 0 {
            bail!("engine.dead_letter_capacity must be greater than 0");
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            let id = channel.id();
            if id.as_str().is_empty() {
                bail!("channel id must not be empty");
            }
            if !ids.insert(id.clone()) {
                bail!("duplicate channel id '{}'", id);
            }
            let options = channel.options();
            if options.queue_capacity == Some(0) {
                bail!("channel '{}': queue_capacity must be greater than 0", id);
            }
            if options.workers == Some(0) {
                bail!("channel '{}': workers must be greater than 0", id);
            }
            if let ChannelConfig::Webhook(webhook) = channel {
                if webhook.url.trim().is_empty() {
                    bail!("channel '{}': webhook url must not be empty", id);
                }
                if let Err(e) = reqwest::Url::parse(&webhook.url) {
                    bail!("channel '{}': invalid webhook url: {}", id, e);
                }
            }
        }

        for (i, subscription) in self.subscriptions.iter().enumerate() {
            if subscription.topic.is_empty() {
                bail!("subscriptions[{}]: topic must not be empty", i);
            }
            if !ids.contains(&ChannelId::from(subscription.channel.as_str())) {
                bail!(
                    "subscriptions[{}]: unknown channel '{}'",
                    i,
                    subscription.channel
                );
            }
            if let Err(e) = Filter::compile(subscription.filter.clone()) {
                bail!("subscriptions[{}]: {}", i, e);
            }
        }
        Ok(())
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            engine: EngineConfig::default(),
            api: ApiConfig {
                enabled: true,
                listen_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            },
            metrics: MetricsConfig { enabled: true },
            channels: Vec::new(),
            subscriptions: Vec::new(),
        }
    }
}
