/*!
 * Hardware watch interface.
 *
 * The watcher is the only part of the system that talks to the USB stack.
 * It lists what is attached and forwards attach/detach notifications as
 * [`HotplugEvent`]s over a channel; the registry consumes them on its own
 * task so notifications for one serial are handled in arrival order.
 */
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::device::{DeviceHandle, Result};

/// Notification from the hardware watcher
#[derive(Clone)]
pub enum HotplugEvent {
    /// A device appeared
    Attached(Arc<dyn DeviceHandle>),
    /// A device went away
    Detached(Arc<dyn DeviceHandle>),
    /// The watcher lost a device because of an error
    Failure(Arc<dyn DeviceHandle>),
}

impl HotplugEvent {
    /// The affected device
    pub fn handle(&self) -> &Arc<dyn DeviceHandle> {
        match self {
            HotplugEvent::Attached(h) | HotplugEvent::Detached(h) | HotplugEvent::Failure(h) => h,
        }
    }
}

impl fmt::Debug for HotplugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            HotplugEvent::Attached(_) => "Attached",
            HotplugEvent::Detached(_) => "Detached",
            HotplugEvent::Failure(_) => "Failure",
        };
        let handle = self.handle();
        write!(
            f,
            "{}({:04x}:{:04x})",
            kind,
            handle.vendor_id(),
            handle.product_id()
        )
    }
}

/// Sender half the watcher reports into
pub type HotplugSender = mpsc::UnboundedSender<HotplugEvent>;

/// Receiver half consumed by the registry
pub type HotplugReceiver = mpsc::UnboundedReceiver<HotplugEvent>;

/// Source of attached hardware
pub trait HardwareWatcher: Send + Sync + fmt::Debug {
    /// Begin reporting attach/detach notifications into `events`
    fn start(&self, events: HotplugSender) -> Result<()>;

    /// Every currently attached device, classified or not
    fn attached_devices(&self) -> Result<Vec<Arc<dyn DeviceHandle>>>;

    /// Stop watching and release the USB stack
    fn shutdown(&self) -> Result<()>;
}

/// A watcher with no hardware behind it
#[derive(Debug, Default)]
pub struct NullWatcher;

impl HardwareWatcher for NullWatcher {
    fn start(&self, _events: HotplugSender) -> Result<()> {
        warn!("No hardware backend configured, devices will not be detected");
        Ok(())
    }

    fn attached_devices(&self) -> Result<Vec<Arc<dyn DeviceHandle>>> {
        Ok(Vec::new())
    }

    fn shutdown(&self) -> Result<()> {
        debug!("Null watcher shut down");
        Ok(())
    }
}
