// Core Module - Shared types, config, logging, events

pub mod types;
pub mod config;
pub mod logger;
pub mod events;

pub use types::*;
pub use config::{ConfigError, ConfigManager, LoggingConfig, PipelineConfig};
pub use logger::setup_logging;
pub use events::{Event, EventBus, EventBusStatsSnapshot, EventKind, EventPriority};
