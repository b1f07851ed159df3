/*!
 * PanelSync Devices
 *
 * Device identities, the per-device command worker and the registry that
 * tracks devices through hot-plug, rescans and shutdown.
 */

#![warn(missing_docs)]

pub use panelsync_core::prelude;

pub mod connection;
pub mod device;
pub mod registry;
pub mod watch;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::DeviceConnection;
pub use device::{
    CommandPriority, DeviceCommand, DeviceConnected, DeviceDisconnected, DeviceError,
    DeviceHandle, DeviceIdentity, DeviceType,
};
pub use registry::{DeviceRegistry, Registration};
pub use watch::{HardwareWatcher, HotplugEvent, NullWatcher};

/// PanelSync devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), panelsync_core::error::Error> {
    tracing::info!("PanelSync Devices {} initialized", VERSION);
    Ok(())
}
