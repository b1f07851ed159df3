/*!
 * Device registry for PanelSync.
 *
 * The registry owns every [`DeviceConnection`], keyed by serial. Hot-plug
 * notifications, rescans and the power coordinator all go through it, and it
 * announces connections and disconnections on the event bus.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

use panelsync_core::config::{DevicesConfig, LightingProfile, SettingsChanged};
use panelsync_core::event::SharedEventBus;
use panelsync_core::logging::component_span;
use panelsync_core::types::LightingConfig;

use crate::connection::DeviceConnection;
use crate::device::{
    usable_serial, DeviceConnected, DeviceDisconnected, DeviceError, DeviceHandle,
    DeviceIdentity, DeviceType, Result,
};
use crate::watch::{HardwareWatcher, HotplugEvent, HotplugReceiver};

/// Outcome of [`DeviceRegistry::device_added_if_absent`]
#[derive(Debug, Clone)]
pub enum Registration {
    /// A new connection was opened and announced
    Added(Arc<DeviceConnection>),
    /// The serial was already registered; nothing was opened or announced
    Existing(Arc<DeviceConnection>),
}

impl Registration {
    /// The registered connection
    pub fn connection(&self) -> &Arc<DeviceConnection> {
        match self {
            Registration::Added(c) | Registration::Existing(c) => c,
        }
    }

    /// Whether this call registered the device
    pub fn is_added(&self) -> bool {
        matches!(self, Registration::Added(_))
    }
}

/// Registry of live device connections
#[derive(Debug)]
pub struct DeviceRegistry {
    connections: RwLock<HashMap<String, Arc<DeviceConnection>>>,
    // Serializes registrations so opening a handle and inserting it is one step
    attach: Mutex<()>,
    profiles: RwLock<HashMap<String, LightingConfig>>,
    watcher: Arc<dyn HardwareWatcher>,
    event_bus: SharedEventBus,
    queue_capacity: usize,
}

impl DeviceRegistry {
    /// Create a registry over a hardware watcher
    pub fn new(
        watcher: Arc<dyn HardwareWatcher>,
        event_bus: SharedEventBus,
        config: &DevicesConfig,
    ) -> Self {
        let registry = Self {
            connections: RwLock::new(HashMap::new()),
            attach: Mutex::new(()),
            profiles: RwLock::new(HashMap::new()),
            watcher,
            event_bus,
            queue_capacity: config.command_queue_capacity,
        };
        registry.store_profiles(&config.profiles);
        registry
    }

    fn read_connections(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<DeviceConnection>>>> {
        self.connections.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })
    }

    fn write_connections(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<DeviceConnection>>>> {
        self.connections.write().map_err(|_| {
            DeviceError::Other("Failed to acquire write lock on device registry".to_string())
        })
    }

    fn stored_lighting(&self, serial: &str) -> Option<LightingConfig> {
        self.profiles
            .read()
            .ok()
            .and_then(|p| p.get(serial).cloned())
    }

    fn store_profiles(&self, profiles: &[LightingProfile]) {
        match self.profiles.write() {
            Ok(mut stored) => {
                for profile in profiles {
                    stored.insert(profile.serial.clone(), profile.lighting.clone());
                }
            }
            Err(_) => warn!("Failed to acquire write lock on lighting profiles"),
        }
    }

    /// Register a newly attached device
    ///
    /// Opens the handle if needed, starts the command worker, queues the
    /// stored lighting and publishes [`DeviceConnected`]. A connection that
    /// already exists for the serial over another handle is shut down and
    /// replaced; one over this very handle is returned untouched. Nothing is
    /// registered if the handle cannot be opened.
    pub fn device_added(
        &self,
        serial: &str,
        handle: Arc<dyn DeviceHandle>,
        device_type: DeviceType,
    ) -> Result<Arc<DeviceConnection>> {
        self.register(serial, handle, device_type, true)
            .map(|r| r.connection().clone())
    }

    /// Register a device unless its serial is already registered
    ///
    /// An existing connection is returned as is: the handle is not opened
    /// and nothing is published. Rescans and hot-plug attach go through here.
    pub fn device_added_if_absent(
        &self,
        serial: &str,
        handle: Arc<dyn DeviceHandle>,
        device_type: DeviceType,
    ) -> Result<Registration> {
        self.register(serial, handle, device_type, false)
    }

    fn register(
        &self,
        serial: &str,
        handle: Arc<dyn DeviceHandle>,
        device_type: DeviceType,
        replace: bool,
    ) -> Result<Registration> {
        if serial.trim().is_empty() {
            return Err(DeviceError::InvalidArgument(
                "device serial must not be empty".to_string(),
            ));
        }

        let _attach = self.attach.lock().map_err(|_| {
            DeviceError::Other("Failed to acquire device registration lock".to_string())
        })?;

        if let Some(existing) = self.read_connections()?.get(serial) {
            if !replace || same_handle(existing.handle(), &handle) {
                trace!("{} {} already registered", device_type, serial);
                return Ok(Registration::Existing(existing.clone()));
            }
        }

        if !handle.is_open() {
            handle.open().map_err(|e| {
                error!("Failed to open {} {}: {}", device_type, serial, e);
                DeviceError::OpenFailed(format!("{}: {}", serial, e))
            })?;
        }

        let identity = DeviceIdentity {
            serial: serial.to_string(),
            vendor_id: handle.vendor_id(),
            product_id: handle.product_id(),
            device_type,
        };
        let lighting = self.stored_lighting(serial);
        let connection = Arc::new(DeviceConnection::new(
            identity,
            handle,
            self.queue_capacity,
            lighting.clone(),
        ));
        connection.start()?;

        let previous = self
            .write_connections()?
            .insert(serial.to_string(), connection.clone());
        if let Some(previous) = previous {
            debug!("Replacing existing connection for {}", serial);
            previous.shutdown();
        }

        match lighting {
            Some(lighting) => {
                if let Err(e) = connection.send_lighting(lighting, false) {
                    warn!("Failed to queue initial lighting for {}: {}", serial, e);
                }
            }
            None => debug!("No lighting profile for {}", serial),
        }

        self.event_bus.emit(DeviceConnected {
            serial: serial.to_string(),
            device_type,
        });
        info!("{} {} connected", device_type, serial);

        Ok(Registration::Added(connection))
    }

    /// Unregister a device that went away
    ///
    /// Returns whether a connection was registered. Only then is
    /// [`DeviceDisconnected`] published.
    pub fn device_removed(&self, serial: &str, handle: &dyn DeviceHandle) -> Result<bool> {
        if serial.trim().is_empty() {
            return Err(DeviceError::InvalidArgument(
                "device serial must not be empty".to_string(),
            ));
        }

        let removed = self.write_connections()?.remove(serial);
        match removed {
            Some(connection) => {
                connection.shutdown();
                self.event_bus.emit(DeviceDisconnected {
                    serial: serial.to_string(),
                });
                info!(
                    "{} {} disconnected ({:04x}:{:04x})",
                    connection.device_type(),
                    serial,
                    handle.vendor_id(),
                    handle.product_id()
                );
                Ok(true)
            }
            None => {
                debug!("Ignoring removal of unregistered device {}", serial);
                Ok(false)
            }
        }
    }

    /// Look up a connection by serial
    pub fn lookup(&self, serial: &str) -> Option<Arc<DeviceConnection>> {
        self.read_connections()
            .ok()
            .and_then(|c| c.get(serial).cloned())
    }

    /// Whether a serial is registered
    pub fn contains(&self, serial: &str) -> bool {
        self.read_connections()
            .map(|c| c.contains_key(serial))
            .unwrap_or(false)
    }

    /// Snapshot of every connection
    pub fn connections(&self) -> Vec<Arc<DeviceConnection>> {
        self.read_connections()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every registered serial
    pub fn serials(&self) -> Vec<String> {
        self.read_connections()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.read_connections().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every attached, known device that is not registered yet
    ///
    /// Returns how many devices were added. Failures are logged; a device
    /// that fails is simply picked up by a later rescan or hot-plug.
    pub fn rescan(&self) -> usize {
        let attached = match self.watcher.attached_devices() {
            Ok(attached) => attached,
            Err(e) => {
                error!("Failed to enumerate attached devices: {}", e);
                return 0;
            }
        };

        let mut added = 0;
        for handle in attached {
            let Some(device_type) = DeviceType::of(handle.as_ref()) else {
                trace!(
                    "Skipping unknown device {:04x}:{:04x}",
                    handle.vendor_id(),
                    handle.product_id()
                );
                continue;
            };
            let Some(serial) = usable_serial(handle.serial_number()) else {
                warn!("Skipping {} without a serial number", device_type);
                continue;
            };
            if self.contains(&serial) {
                continue;
            }

            match self.device_added_if_absent(&serial, handle, device_type) {
                Ok(Registration::Added(_)) => added += 1,
                Ok(Registration::Existing(_)) => {}
                Err(e) => error!("Failed to add {} {}: {}", device_type, serial, e),
            }
        }

        debug!("Rescan added {} devices", added);
        added
    }

    /// Send lighting to a registered device
    pub fn send_lighting_config(
        &self,
        serial: &str,
        device_type: DeviceType,
        config: LightingConfig,
        immediate: bool,
    ) -> Result<()> {
        let connection = self
            .lookup(serial)
            .ok_or_else(|| DeviceError::NotConnected(serial.to_string()))?;
        if connection.device_type() != device_type {
            warn!(
                "Lighting for {} addressed to {}, device is a {}",
                serial,
                device_type,
                connection.device_type()
            );
        }
        connection.send_lighting(config, immediate)
    }

    /// Take new lighting profiles into use
    ///
    /// Connected devices whose stored lighting changed get the new lighting
    /// right away; the rest is remembered for when they connect.
    pub fn apply_lighting_profiles(&self, profiles: &[LightingProfile]) {
        self.store_profiles(profiles);
        for profile in profiles {
            let Some(connection) = self.lookup(&profile.serial) else {
                continue;
            };
            if connection.lighting_config().as_ref() == Some(&profile.lighting) {
                continue;
            }
            if let Err(e) = connection.set_lighting_config(profile.lighting.clone(), false) {
                warn!("Failed to apply lighting profile to {}: {}", profile.serial, e);
            }
        }
    }

    /// Turn one watcher notification into a registry change
    pub fn handle_hotplug(&self, event: HotplugEvent) {
        let handle = event.handle().clone();
        let Some(device_type) = DeviceType::of(handle.as_ref()) else {
            trace!("Ignoring {:?} for unknown device", event);
            return;
        };
        let Some(serial) = usable_serial(handle.serial_number()) else {
            warn!("Ignoring {:?} for {} without a serial number", event, device_type);
            return;
        };

        match event {
            HotplugEvent::Attached(handle) => {
                if let Err(e) = self.device_added_if_absent(&serial, handle, device_type) {
                    error!("Failed to add {} {}: {}", device_type, serial, e);
                }
            }
            HotplugEvent::Detached(handle) | HotplugEvent::Failure(handle) => {
                if let Err(e) = self.device_removed(&serial, handle.as_ref()) {
                    error!("Failed to remove {} {}: {}", device_type, serial, e);
                }
            }
        }
    }

    /// Start the watcher and consume its notifications on a task
    pub fn start_watching(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watcher.start(tx)?;
        Ok(self.spawn_hotplug_listener(rx))
    }

    /// Consume watcher notifications until the watcher goes away
    pub fn spawn_hotplug_listener(self: &Arc<Self>, mut events: HotplugReceiver) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    registry.handle_hotplug(event);
                }
                debug!("Hot-plug listener stopped");
            }
            .instrument(component_span("hotplug", None)),
        )
    }

    /// Follow [`SettingsChanged`] events and apply lighting profiles
    pub fn spawn_settings_listener(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut changes = self.event_bus.subscribe::<SettingsChanged>()?;
        let registry: Weak<Self> = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        registry.apply_lighting_profiles(&change.config.get().devices.profiles);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} settings changes", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Stop the hardware watcher
    pub fn close(&self) {
        match self.watcher.shutdown() {
            Ok(()) => info!("Device registry closed"),
            Err(e) => error!("Failed to shut down hardware watcher: {}", e),
        }
    }
}

fn same_handle(a: &Arc<dyn DeviceHandle>, b: &Arc<dyn DeviceHandle>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCommand;
    use crate::testing::{FakeHandle, FakeWatcher};
    use panelsync_core::config::{Config, DevicesConfig};
    use panelsync_core::types::Rgb;
    use panelsync_core::utils::poll_until;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn registry() -> (Arc<DeviceRegistry>, Arc<FakeWatcher>, SharedEventBus) {
        let watcher = Arc::new(FakeWatcher::new());
        let bus = SharedEventBus::new();
        let registry = Arc::new(DeviceRegistry::new(
            watcher.clone(),
            bus.clone(),
            &DevicesConfig::default(),
        ));
        (registry, watcher, bus)
    }

    fn fake(serial: &str) -> Arc<FakeHandle> {
        Arc::new(FakeHandle::new(serial, DeviceType::PcPanelMini))
    }

    #[tokio::test]
    async fn test_device_added_opens_and_publishes() -> Result<()> {
        let (registry, _, bus) = registry();
        let mut connected = bus.subscribe::<DeviceConnected>()?;
        let handle = fake("A1");

        let connection = registry.device_added("A1", handle.clone(), DeviceType::PcPanelMini)?;

        assert!(handle.is_open());
        assert_eq!(connection.serial(), "A1");
        assert!(registry.contains("A1"));
        let event = assert_ok!(connected.try_recv());
        assert_eq!(
            event,
            DeviceConnected {
                serial: "A1".to_string(),
                device_type: DeviceType::PcPanelMini
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_device_added_does_not_reopen() -> Result<()> {
        let (registry, _, _) = registry();
        let handle = fake("A1");
        handle.open()?;
        registry.device_added("A1", handle.clone(), DeviceType::PcPanelMini)?;
        assert_eq!(handle.open_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_device_added_rejects_blank_serial() {
        let (registry, _, _) = registry();
        let result = registry.device_added("  ", fake("A1"), DeviceType::PcPanelMini);
        assert!(matches!(result, Err(DeviceError::InvalidArgument(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_skips_registration() -> Result<()> {
        let (registry, _, bus) = registry();
        let mut connected = bus.subscribe::<DeviceConnected>()?;
        let handle = fake("A1");
        handle.fail_opens(true);

        let result = registry.device_added("A1", handle, DeviceType::PcPanelMini);

        assert!(matches!(result, Err(DeviceError::OpenFailed(_))));
        assert!(registry.is_empty());
        assert!(connected.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_readd_replaces_connection() -> Result<()> {
        let (registry, _, _) = registry();
        let first = registry.device_added("A1", fake("A1"), DeviceType::PcPanelMini)?;
        let second = registry.device_added("A1", fake("A1"), DeviceType::PcPanelMini)?;

        assert_eq!(registry.len(), 1);
        assert!(first.is_shut_down());
        assert!(!second.is_shut_down());
        assert!(Arc::ptr_eq(&registry.lookup("A1").unwrap(), &second));
        Ok(())
    }

    #[tokio::test]
    async fn test_device_added_if_absent_keeps_existing() -> Result<()> {
        let (registry, _, bus) = registry();
        let mut connected = bus.subscribe::<DeviceConnected>()?;
        let first = registry.device_added_if_absent("A1", fake("A1"), DeviceType::PcPanelMini)?;
        assert!(first.is_added());
        assert_ok!(connected.try_recv());

        let other = fake("A1");
        let second = registry.device_added_if_absent("A1", other.clone(), DeviceType::PcPanelMini)?;

        assert!(!second.is_added());
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert!(!first.connection().is_shut_down());
        assert_eq!(other.open_calls(), 0);
        assert!(connected.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_attach_registers_once() -> Result<()> {
        let (registry, _, bus) = registry();
        let mut connected = bus.subscribe::<DeviceConnected>()?;
        let handle = fake("A1");
        handle.set_open_delay(Duration::from_millis(50));

        let hotplug = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::task::spawn_blocking(move || {
                registry.handle_hotplug(HotplugEvent::Attached(handle));
            })
        };
        let direct = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::task::spawn_blocking(move || {
                registry.device_added_if_absent("A1", handle, DeviceType::PcPanelMini)
            })
        };
        let (hotplug, direct) = tokio::join!(hotplug, direct);
        assert_ok!(hotplug);
        let direct = assert_ok!(assert_ok!(direct));

        assert_eq!(registry.len(), 1);
        assert_eq!(handle.open_calls(), 1);
        assert!(Arc::ptr_eq(&registry.lookup("A1").unwrap(), direct.connection()));
        assert_ok!(connected.try_recv());
        assert!(connected.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hotplug_and_device_added_share_handle() -> Result<()> {
        let (registry, _, bus) = registry();
        let mut connected = bus.subscribe::<DeviceConnected>()?;
        let handle = fake("A1");
        handle.set_open_delay(Duration::from_millis(50));

        let hotplug = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::task::spawn_blocking(move || {
                registry.handle_hotplug(HotplugEvent::Attached(handle));
            })
        };
        let direct = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::task::spawn_blocking(move || {
                registry.device_added("A1", handle, DeviceType::PcPanelMini)
            })
        };
        let (hotplug, direct) = tokio::join!(hotplug, direct);
        assert_ok!(hotplug);
        let direct = assert_ok!(assert_ok!(direct));

        assert_eq!(registry.len(), 1);
        assert_eq!(handle.open_calls(), 1);
        assert!(!direct.is_shut_down());
        assert_ok!(connected.try_recv());
        assert!(connected.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rescan_races_hotplug() -> Result<()> {
        let (registry, watcher, bus) = registry();
        let mut connected = bus.subscribe::<DeviceConnected>()?;
        let handle = fake("A1");
        handle.set_open_delay(Duration::from_millis(50));
        watcher.insert(handle.clone());

        let rescan = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || registry.rescan())
        };
        let hotplug = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::task::spawn_blocking(move || {
                registry.handle_hotplug(HotplugEvent::Attached(handle));
            })
        };
        let (rescan, hotplug) = tokio::join!(rescan, hotplug);
        assert!(assert_ok!(rescan) <= 1);
        assert_ok!(hotplug);

        assert_eq!(registry.len(), 1);
        assert_eq!(handle.open_calls(), 1);
        assert_ok!(connected.try_recv());
        assert!(connected.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_device_removed() -> Result<()> {
        let (registry, _, bus) = registry();
        let mut disconnected = bus.subscribe::<DeviceDisconnected>()?;
        let handle = fake("A1");
        let connection = registry.device_added("A1", handle.clone(), DeviceType::PcPanelMini)?;

        assert!(registry.device_removed("A1", &*handle)?);
        assert!(connection.is_shut_down());
        assert_eq!(
            assert_ok!(disconnected.try_recv()),
            DeviceDisconnected { serial: "A1".to_string() }
        );

        assert!(!registry.device_removed("A1", &*handle)?);
        assert!(disconnected.try_recv().is_err());

        assert!(matches!(
            registry.device_removed("", &*handle),
            Err(DeviceError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let (registry, watcher, _) = registry();
        watcher.insert(fake("A1"));
        watcher.insert(Arc::new(FakeHandle::new("B2", DeviceType::PcPanelPro)));
        watcher.insert(Arc::new(FakeHandle::with_ids(Some("X"), 0x1d6b, 0x0002)));
        watcher.insert(Arc::new(FakeHandle::with_ids(
            None,
            DeviceType::PcPanelRgb.vendor_id(),
            DeviceType::PcPanelRgb.product_id(),
        )));

        assert_eq!(registry.rescan(), 2);
        assert_eq!(registry.rescan(), 0);

        let mut serials = registry.serials();
        serials.sort();
        assert_eq!(serials, vec!["A1".to_string(), "B2".to_string()]);
        assert_eq!(
            registry.lookup("B2").map(|c| c.device_type()),
            Some(DeviceType::PcPanelPro)
        );
    }

    #[tokio::test]
    async fn test_rescan_survives_failures() {
        let (registry, watcher, _) = registry();
        let broken = fake("A1");
        broken.fail_opens(true);
        watcher.insert(broken.clone());
        watcher.insert(fake("B2"));

        assert_eq!(registry.rescan(), 1);
        assert!(!registry.contains("A1"));

        broken.fail_opens(false);
        assert_eq!(registry.rescan(), 1);
        assert!(registry.contains("A1"));

        watcher.fail_enumeration(true);
        assert_eq!(registry.rescan(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_hotplug_listener() -> Result<()> {
        let (registry, watcher, bus) = registry();
        let mut disconnected = bus.subscribe::<DeviceDisconnected>()?;
        let _listener = registry.start_watching()?;

        watcher.plug(fake("A1"));
        watcher.plug(Arc::new(FakeHandle::with_ids(Some("X"), 0x1234, 0x5678)));
        assert!(poll_until(Duration::from_millis(5), 200, || registry.contains("A1")).await);

        watcher.unplug("A1");
        assert!(poll_until(Duration::from_millis(5), 200, || registry.is_empty()).await);
        assert_eq!(
            assert_ok!(disconnected.recv().await),
            DeviceDisconnected { serial: "A1".to_string() }
        );

        // unknown serial: no event
        watcher.notify(HotplugEvent::Failure(fake("Z9")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(disconnected.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_initial_lighting_and_profiles() -> Result<()> {
        let red = LightingConfig::all_color(Rgb::new(255, 0, 0));
        let green = LightingConfig::all_color(Rgb::new(0, 255, 0));

        let watcher = Arc::new(FakeWatcher::new());
        let bus = SharedEventBus::new();
        let config = DevicesConfig {
            profiles: vec![LightingProfile {
                serial: "A1".to_string(),
                lighting: red.clone(),
            }],
            ..DevicesConfig::default()
        };
        let registry = Arc::new(DeviceRegistry::new(watcher, bus.clone(), &config));
        let _settings = registry.spawn_settings_listener()?;

        let handle = fake("A1");
        let connection = registry.device_added("A1", handle.clone(), DeviceType::PcPanelMini)?;
        assert_eq!(connection.lighting_config(), Some(red.clone()));
        assert!(poll_until(Duration::from_millis(5), 200, || connection.queue_is_empty()).await);
        assert_eq!(handle.sent(), vec![DeviceCommand::Lighting(red)]);

        let mut reloaded = Config::default();
        reloaded.devices.profiles = vec![LightingProfile {
            serial: "A1".to_string(),
            lighting: green.clone(),
        }];
        bus.publish(SettingsChanged::new(reloaded))?;

        assert!(
            poll_until(Duration::from_millis(5), 200, || {
                connection.lighting_config() == Some(green.clone())
            })
            .await
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_device_without_profile_gets_no_lighting() -> Result<()> {
        let (registry, _, _) = registry();
        let handle = fake("A1");
        let connection = registry.device_added("A1", handle.clone(), DeviceType::PcPanelMini)?;

        assert_eq!(connection.lighting_config(), None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.sent().is_empty());

        let blue = LightingConfig::all_color(Rgb::new(0, 0, 255));
        registry.apply_lighting_profiles(&[LightingProfile {
            serial: "A1".to_string(),
            lighting: blue.clone(),
        }]);
        assert!(poll_until(Duration::from_millis(5), 200, || connection.queue_is_empty()).await);
        assert_eq!(connection.lighting_config(), Some(blue.clone()));
        assert_eq!(handle.sent(), vec![DeviceCommand::Lighting(blue)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_lighting_config() -> Result<()> {
        let (registry, _, _) = registry();
        let handle = fake("A1");
        let connection = registry.device_added("A1", handle.clone(), DeviceType::PcPanelMini)?;
        assert!(poll_until(Duration::from_millis(5), 200, || connection.queue_is_empty()).await);
        handle.clear_sent();

        registry.send_lighting_config("A1", DeviceType::PcPanelMini, LightingConfig::all_off(), true)?;
        assert!(poll_until(Duration::from_millis(5), 200, || connection.queue_is_empty()).await);
        assert_eq!(
            handle.sent(),
            vec![DeviceCommand::Lighting(LightingConfig::all_off())]
        );

        assert!(matches!(
            registry.send_lighting_config("B2", DeviceType::PcPanelMini, LightingConfig::all_off(), true),
            Err(DeviceError::NotConnected(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_stops_watcher() {
        let (registry, watcher, _) = registry();
        registry.close();
        registry.close();
        assert_eq!(watcher.shutdowns(), 2);
    }
}
