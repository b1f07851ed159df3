/*!
 * Error types for the PanelSync engine crate.
 */
use thiserror::Error;

/// Error type for engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// A monitored subprocess could not be run
    #[error("Subprocess error: {0}")]
    Subprocess(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] panelsync_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] panelsync_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new subprocess error
    pub fn subprocess<S: AsRef<str>>(msg: S) -> Self {
        Error::Subprocess(msg.as_ref().to_string())
    }

    /// Create a new uncategorized error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}
