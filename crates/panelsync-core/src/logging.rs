/*!
 * Logging setup for PanelSync.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize logging at `info`
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize logging from the `[logging]` section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_with_filter(&config.level)
}

/// Initialize logging with a specific filter
///
/// `RUST_LOG`, when set, takes precedence over `filter`.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "panelsync_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span for a long-running component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance, such as a device serial
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_fails_cleanly() {
        let _ = init();
        // a global subscriber is already installed by now
        assert!(matches!(init_with_filter("debug"), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_component_span() {
        let span = component_span("device-worker", Some("ABC123"));
        let _guard = span.enter();
        let span = component_span("coordinator", None);
        let _guard = span.enter();
    }
}
