/*!
 * A live, opened device.
 */
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::debug;

use panelsync_core::types::LightingConfig;

use crate::device::{
    CommandPriority, DeviceCommand, DeviceError, DeviceHandle, DeviceIdentity, DeviceType, Result,
};
use crate::worker::{spawn_worker, CommandQueue};

/// An opened device with its command worker and lighting state
///
/// The stored lighting is what the device should show when nothing special
/// is going on. Transient output such as the all-off sent before suspend
/// goes through [`send_lighting`](DeviceConnection::send_lighting) and leaves
/// it untouched. A device without a lighting profile has no stored lighting.
#[derive(Debug)]
pub struct DeviceConnection {
    identity: DeviceIdentity,
    handle: Arc<dyn DeviceHandle>,
    queue: Arc<CommandQueue>,
    lighting: RwLock<Option<LightingConfig>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceConnection {
    /// Wrap an opened handle
    pub fn new(
        identity: DeviceIdentity,
        handle: Arc<dyn DeviceHandle>,
        queue_capacity: usize,
        lighting: Option<LightingConfig>,
    ) -> Self {
        let queue = Arc::new(CommandQueue::new(identity.serial.clone(), queue_capacity));
        Self {
            identity,
            handle,
            queue,
            lighting: RwLock::new(lighting),
            worker: Mutex::new(None),
        }
    }

    /// Start the command worker; calling it again does nothing
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().map_err(|_| {
            DeviceError::Other(format!("Failed to lock worker for {}", self.identity.serial))
        })?;
        if worker.is_none() {
            *worker = Some(spawn_worker(self.queue.clone(), self.handle.clone()));
            debug!("Started command worker for {}", self.identity.serial);
        }
        Ok(())
    }

    /// Device identity
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Device serial
    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    /// Device model
    pub fn device_type(&self) -> DeviceType {
        self.identity.device_type
    }

    /// The underlying handle
    pub fn handle(&self) -> &Arc<dyn DeviceHandle> {
        &self.handle
    }

    /// Stored lighting
    pub fn lighting_config(&self) -> Option<LightingConfig> {
        self.lighting.read().ok().and_then(|l| l.clone())
    }

    /// Replace the stored lighting and send it
    pub fn set_lighting_config(&self, config: LightingConfig, immediate: bool) -> Result<()> {
        {
            let mut lighting = self.lighting.write().map_err(|_| {
                DeviceError::Other(format!("Failed to lock lighting for {}", self.identity.serial))
            })?;
            *lighting = Some(config.clone());
        }
        self.send_lighting(config, immediate)
    }

    /// Send lighting without storing it
    pub fn send_lighting(&self, config: LightingConfig, immediate: bool) -> Result<()> {
        self.send(DeviceCommand::Lighting(config), immediate)
    }

    /// Queue any command
    pub fn send(&self, command: DeviceCommand, immediate: bool) -> Result<()> {
        self.queue.push(command, CommandPriority::from_immediate(immediate))
    }

    /// Nothing queued and nothing being written
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stop the worker once the current command finishes
    pub fn shutdown(&self) {
        self.queue.close();
        debug!("Shut down connection for {}", self.identity.serial);
    }

    /// Whether [`shutdown`](DeviceConnection::shutdown) was called
    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.queue.close();
    }
}
