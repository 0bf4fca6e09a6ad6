// Structured Logging for the Trade-Cost Pipeline
// tracing + tracing-subscriber, initialized once per process

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;
use std::sync::Once;

use crate::core::config::LoggingConfig;

static INIT: Once = Once::new();

/// Noisy dependencies capped at warn
const QUIET_TARGETS: &[&str] = &["tokio_tungstenite=warn", "tungstenite=warn", "native_tls=warn"];

/// Parse a textual level, falling back to INFO
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Setup structured logging for the whole process.
///
/// Later calls are no-ops, as is a call made after another subscriber was
/// installed (tests, embedding applications).
pub fn setup_logging(config: &LoggingConfig) {
    let level = parse_level(&config.log_level);

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());
        for target in QUIET_TARGETS {
            if let Ok(directive) = target.parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }

        let result = if !config.console_output {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::sink)
                .try_init()
        } else if config.json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_thread_names(true)
                .with_env_filter(filter)
                .try_init()
        };

        if result.is_ok() {
            tracing::info!(
                log_level = %config.log_level,
                json = config.json_format,
                "Logging initialized"
            );
        }
    });
}
