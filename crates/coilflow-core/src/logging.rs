/*!
 * Logging functionality for CoilFlow.
 *
 * This module provides tracing setup and span helpers for consistent logging
 * across the CoilFlow crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence over `filter` when it is set.
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_from_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_format {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };

    result.map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second global subscriber in the same process is rejected, which is fine here
        let _ = init();
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "coilflow=loudest".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_from_config(&config), Err(Error::Config(_))));
    }

    #[test_log::test]
    fn test_spans() {
        let component = component_span("poller", Some("plc-1"));
        let _entered = component.enter();
        let operation = operation_span("pulse", "commands");
        let _inner = operation.enter();
        tracing::debug!("inside nested spans");
    }
}
