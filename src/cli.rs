//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged with
//! the configuration from the `notifyd.toml` file and environment variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::net::SocketAddr;
use std::path::PathBuf;

/// A topic-based notification dispatch service.
#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level or filter directive (e.g. "debug", "notifyd=trace").
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_name = "text|json")]
    pub log_format: Option<String>,

    /// Address the HTTP API listens on.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Default capacity of each channel queue.
    #[arg(long, value_name = "N")]
    pub queue_capacity: Option<usize>,

    /// Default number of workers per channel.
    #[arg(long, value_name = "N")]
    pub workers_per_channel: Option<usize>,

    /// Maximum send attempts per delivery, first attempt included.
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub check_config: bool,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }
        if let Some(format) = &self.log_format {
            dict.insert("log_format".into(), Value::from(format.clone()));
        }

        let mut api = Dict::new();
        if let Some(listen) = self.listen {
            api.insert("listen_address".into(), Value::from(listen.to_string()));
        }
        if !api.is_empty() {
            dict.insert("api".into(), Value::from(api));
        }

        let mut engine = Dict::new();
        if let Some(capacity) = self.queue_capacity {
            engine.insert("queue_capacity".into(), Value::from(capacity));
        }
        if let Some(workers) = self.workers_per_channel {
            engine.insert("workers_per_channel".into(), Value::from(workers));
        }
        if let Some(attempts) = self.max_attempts {
            let mut retry = Dict::new();
            retry.insert("max_attempts".into(), Value::from(attempts));
            engine.insert("retry".into(), Value::from(retry));
        }
        if !engine.is_empty() {
            dict.insert("engine".into(), Value::from(engine));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
