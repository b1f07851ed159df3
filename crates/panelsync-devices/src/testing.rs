/*!
 * In-memory devices for tests.
 */
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::{DeviceCommand, DeviceError, DeviceHandle, DeviceType, Result};
use crate::watch::{HardwareWatcher, HotplugEvent, HotplugSender};

/// A device that records what it is sent
#[derive(Debug)]
pub struct FakeHandle {
    serial: Option<String>,
    vendor_id: u16,
    product_id: u16,
    open: AtomicBool,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
    open_calls: AtomicUsize,
    send_delay_ms: AtomicU64,
    open_delay_ms: AtomicU64,
    sent: Mutex<Vec<DeviceCommand>>,
}

impl FakeHandle {
    /// A closed device of a known model
    pub fn new(serial: &str, device_type: DeviceType) -> Self {
        Self::with_ids(Some(serial), device_type.vendor_id(), device_type.product_id())
    }

    /// A closed device with arbitrary ids
    pub fn with_ids(serial: Option<&str>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            serial: serial.map(str::to_string),
            vendor_id,
            product_id,
            open: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
            send_delay_ms: AtomicU64::new(0),
            open_delay_ms: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Make `open` fail
    pub fn fail_opens(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make `send` fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Make every `send` block for `delay` first
    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every `open` block for `delay` first
    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// How often `open` was called
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Commands sent so far
    pub fn sent(&self) -> Vec<DeviceCommand> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Forget recorded commands
    pub fn clear_sent(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

impl DeviceHandle for FakeHandle {
    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn open(&self) -> Result<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Communication("permission denied".to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, command: &DeviceCommand) -> Result<()> {
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(DeviceError::Communication("write failed".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| DeviceError::Other("poisoned".to_string()))?
            .push(command.clone());
        Ok(())
    }
}

/// A watcher over a mutable list of fake devices
#[derive(Debug, Default)]
pub struct FakeWatcher {
    attached: Mutex<Vec<Arc<FakeHandle>>>,
    events: Mutex<Option<HotplugSender>>,
    fail_enumeration: AtomicBool,
    shutdowns: AtomicUsize,
}

impl FakeWatcher {
    /// An empty watcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device without notifying anyone
    pub fn insert(&self, handle: Arc<FakeHandle>) {
        if let Ok(mut attached) = self.attached.lock() {
            attached.push(handle);
        }
    }

    /// Attach a device and send an attach notification
    pub fn plug(&self, handle: Arc<FakeHandle>) {
        self.insert(handle.clone());
        self.notify(HotplugEvent::Attached(handle));
    }

    /// Detach a device and send a detach notification
    pub fn unplug(&self, serial: &str) {
        let removed = self.attached.lock().ok().and_then(|mut attached| {
            let index = attached
                .iter()
                .position(|h| h.serial_number().as_deref() == Some(serial))?;
            Some(attached.remove(index))
        });
        if let Some(handle) = removed {
            self.notify(HotplugEvent::Detached(handle));
        }
    }

    /// Forward an arbitrary notification
    pub fn notify(&self, event: HotplugEvent) {
        if let Ok(events) = self.events.lock() {
            if let Some(tx) = events.as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    /// Make enumeration fail
    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// How often `shutdown` was called
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl HardwareWatcher for FakeWatcher {
    fn start(&self, events: HotplugSender) -> Result<()> {
        let mut slot = self
            .events
            .lock()
            .map_err(|_| DeviceError::Watch("poisoned".to_string()))?;
        *slot = Some(events);
        Ok(())
    }

    fn attached_devices(&self) -> Result<Vec<Arc<dyn DeviceHandle>>> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(DeviceError::Enumeration("bus unavailable".to_string()));
        }
        let attached = self
            .attached
            .lock()
            .map_err(|_| DeviceError::Enumeration("poisoned".to_string()))?;
        Ok(attached
            .iter()
            .map(|h| h.clone() as Arc<dyn DeviceHandle>)
            .collect())
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut events) = self.events.lock() {
            events.take();
        }
        Ok(())
    }
}
