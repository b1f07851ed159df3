/*!
 * PanelSync Core
 *
 * Shared plumbing for the PanelSync crates: the error type, the typed event
 * bus, layered configuration, logging setup, keyed debouncing and a few
 * async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod debounce;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// PanelSync core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with logging at `info`
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("PanelSync Core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
