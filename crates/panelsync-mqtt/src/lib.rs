/*!
 * PanelSync MQTT
 *
 * Keeps one broker session in line with the configured settings, publishes
 * retained and debounced state, clears retained topics by wildcard, and
 * mirrors device presence to status topics.
 */

#![warn(missing_docs)]

pub use panelsync_core::prelude;

pub mod broker;
pub mod error;
pub mod gateway;
pub mod status;
pub mod topic;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use broker::{BrokerConnector, BrokerSession, IncomingMessage, RumqttConnector, SessionOptions};
pub use error::{MqttError, Result};
pub use gateway::{BrokerStatus, MessagingGateway};
pub use status::{DeviceStatus, StatusMirror};
pub use topic::{TopicFilter, Topics};

/// PanelSync MQTT crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the MQTT system
pub fn init() -> std::result::Result<(), panelsync_core::error::Error> {
    tracing::info!("PanelSync MQTT {} initialized", VERSION);
    Ok(())
}
