/*!
 * PanelSync Engine
 *
 * Detects operating-system power transitions and keeps the registered
 * devices in step with them: dark before suspend and shutdown, restored
 * after resume.
 */

#![warn(missing_docs)]

pub use panelsync_core::prelude;

pub mod coordinator;
pub mod error;
pub mod power;

pub use coordinator::{CoordinatorTimings, PowerEventCoordinator};
pub use error::{Error, Result};
pub use power::{
    select_source, shutdown_source, DisabledPowerSource, LinuxPowerMonitor, PowerEvent,
    PowerEventSink, PowerEventSource,
};

/// PanelSync engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("PanelSync Engine {} initialized", VERSION);
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
