/*!
 * Error types for the PanelSync MQTT crate.
 */
use thiserror::Error;

/// Error type for broker operations
#[derive(Error, Debug)]
pub enum MqttError {
    /// The broker could not be reached or refused the connection
    #[error("Connect error: {0}")]
    Connect(String),

    /// No broker session is active
    #[error("Not connected to a broker")]
    NotConnected,

    /// The client rejected a request
    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// A payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A topic or topic filter is malformed
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] panelsync_core::error::Error),
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, MqttError>;
