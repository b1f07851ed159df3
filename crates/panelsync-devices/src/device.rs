/*!
 * Device model for PanelSync.
 *
 * A device is anything behind a [`DeviceHandle`]. The handle knows how to
 * open the hardware and turn a [`DeviceCommand`] into output reports; the
 * rest of the crate only deals with identities, queues and lifecycle.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use panelsync_core::types::LightingConfig;

/// Device error
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A caller passed a missing or blank argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The hardware could not be opened
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    /// No connection is registered for the serial
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// The device's command queue is full
    #[error("Command queue full for device {0}")]
    QueueFull(String),

    /// Communication error with the device
    #[error("Communication error: {0}")]
    Communication(String),

    /// Listing attached hardware failed
    #[error("Enumeration error: {0}")]
    Enumeration(String),

    /// The hardware watcher failed
    #[error("Watcher error: {0}")]
    Watch(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] panelsync_core::error::Error),

    /// Other error
    #[error("Device error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Known device models
///
/// Classification walks [`DeviceType::ALL`] in order and takes the first
/// model whose vendor and product id match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Four knobs
    PcPanelMini,
    /// Five knobs, four sliders
    PcPanelPro,
    /// Four knobs, RGB
    PcPanelRgb,
}

impl DeviceType {
    /// Every known model, in classification order
    pub const ALL: [DeviceType; 3] = [
        DeviceType::PcPanelMini,
        DeviceType::PcPanelPro,
        DeviceType::PcPanelRgb,
    ];

    /// USB vendor id
    pub const fn vendor_id(self) -> u16 {
        match self {
            DeviceType::PcPanelMini | DeviceType::PcPanelPro => 0x0483,
            DeviceType::PcPanelRgb => 0x04d8,
        }
    }

    /// USB product id
    pub const fn product_id(self) -> u16 {
        match self {
            DeviceType::PcPanelMini => 0xa3c4,
            DeviceType::PcPanelPro => 0xa3c5,
            DeviceType::PcPanelRgb => 0xeb42,
        }
    }

    /// Number of analog controls (knobs plus sliders)
    pub const fn analog_count(self) -> usize {
        match self {
            DeviceType::PcPanelMini | DeviceType::PcPanelRgb => 4,
            DeviceType::PcPanelPro => 9,
        }
    }

    /// Match a vendor/product pair against the known models
    pub fn classify(vendor_id: u16, product_id: u16) -> Option<DeviceType> {
        Self::ALL
            .into_iter()
            .find(|t| t.vendor_id() == vendor_id && t.product_id() == product_id)
    }

    /// Classify whatever sits behind a handle
    pub fn of(handle: &dyn DeviceHandle) -> Option<DeviceType> {
        Self::classify(handle.vendor_id(), handle.product_id())
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::PcPanelMini => "PCPanel Mini",
            DeviceType::PcPanelPro => "PCPanel Pro",
            DeviceType::PcPanelRgb => "PCPanel RGB",
        };
        f.write_str(name)
    }
}

/// Identity of an opened device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Serial number, unique per physical device
    pub serial: String,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Classified model
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    /// Identity for a known model
    pub fn new(serial: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            serial: serial.into(),
            vendor_id: device_type.vendor_id(),
            product_id: device_type.product_id(),
            device_type,
        }
    }
}

/// Something the device should do
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Apply a lighting configuration
    Lighting(LightingConfig),
    /// Write a pre-encoded output report
    Raw(Vec<u8>),
}

impl DeviceCommand {
    /// Whether this is a lighting command
    pub fn is_lighting(&self) -> bool {
        matches!(self, DeviceCommand::Lighting(_))
    }
}

/// Queue priority of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandPriority {
    /// Queued behind earlier commands, subject to batching
    Normal,
    /// Dequeued before every normal command
    Immediate,
}

impl CommandPriority {
    /// Priority for an `immediate` flag
    pub fn from_immediate(immediate: bool) -> Self {
        if immediate {
            CommandPriority::Immediate
        } else {
            CommandPriority::Normal
        }
    }
}

/// An attached piece of hardware
///
/// Implementations are blocking; the command worker calls [`send`] on the
/// blocking thread pool.
///
/// [`send`]: DeviceHandle::send
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    /// Serial number, if the hardware reports one
    fn serial_number(&self) -> Option<String>;

    /// USB vendor id
    fn vendor_id(&self) -> u16;

    /// USB product id
    fn product_id(&self) -> u16;

    /// Whether [`open`](DeviceHandle::open) already succeeded
    fn is_open(&self) -> bool;

    /// Open the hardware for output
    fn open(&self) -> Result<()>;

    /// Execute one command
    fn send(&self, command: &DeviceCommand) -> Result<()>;
}

/// Published when a device connection becomes visible in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnected {
    /// Device serial
    pub serial: String,
    /// Device model
    pub device_type: DeviceType,
}

/// Published when a registered device goes away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDisconnected {
    /// Device serial
    pub serial: String,
}

/// Returns the serial if it is present and not blank
pub(crate) fn usable_serial(serial: Option<String>) -> Option<String> {
    serial.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(DeviceType::classify(0x0483, 0xa3c4), Some(DeviceType::PcPanelMini));
        assert_eq!(DeviceType::classify(0x0483, 0xa3c5), Some(DeviceType::PcPanelPro));
        assert_eq!(DeviceType::classify(0x04d8, 0xeb42), Some(DeviceType::PcPanelRgb));
        assert_eq!(DeviceType::classify(0x04d8, 0xa3c4), None);
        assert_eq!(DeviceType::classify(0x1d6b, 0x0002), None);
    }

    #[test]
    fn test_identity_uses_model_ids() {
        let identity = DeviceIdentity::new("XYZ", DeviceType::PcPanelPro);
        assert_eq!(identity.vendor_id, 0x0483);
        assert_eq!(identity.product_id, 0xa3c5);
        assert_eq!(identity.device_type.analog_count(), 9);
    }

    #[test]
    fn test_priority() {
        assert!(CommandPriority::Immediate > CommandPriority::Normal);
        assert_eq!(CommandPriority::from_immediate(true), CommandPriority::Immediate);
    }

    #[test]
    fn test_usable_serial() {
        assert_eq!(usable_serial(Some("A1".into())), Some("A1".to_string()));
        assert_eq!(usable_serial(Some("  ".into())), None);
        assert_eq!(usable_serial(None), None);
    }

    #[test]
    fn test_device_type_serde() {
        assert_eq!(
            serde_json::to_string(&DeviceType::PcPanelRgb).unwrap(),
            "\"pc_panel_rgb\""
        );
        assert_eq!(DeviceType::PcPanelMini.to_string(), "PCPanel Mini");
    }
}
