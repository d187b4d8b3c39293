//! notifyd - a topic-based notification dispatch engine
//!
//! Producers publish notifications to topics; the engine matches them
//! against subscriptions and delivers a copy to each subscriber's channel
//! through a bounded per-channel queue, retrying transient failures with
//! exponential backoff and reporting terminal failures to an error sink.

pub mod api;
pub mod app;
pub mod channels;
pub mod cli;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod filter;
pub mod internal_metrics;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod sink;
pub mod task_manager;
pub mod tracker;
pub mod worker;

// Re-export core types for convenience
pub use crate::core::*;
pub use dispatcher::{ChannelOutcome, PublishReport};
pub use engine::{Engine, EngineBuilder, EngineConfig, ShutdownReport};
pub use error::{EngineError, SendError};
pub use filter::{Condition, Filter, FilterSpec};
pub use retry::RetryPolicy;
pub use sink::{ErrorSink, FailedDelivery};
pub use tracker::DeliveryEvent;
