/*!
 * Mirrors device presence to retained status topics.
 */
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use panelsync_core::event::SharedEventBus;
use panelsync_core::logging::component_span;
use panelsync_devices::{DeviceConnected, DeviceDisconnected, DeviceRegistry, DeviceType};

use crate::error::Result;
use crate::gateway::{BrokerStatus, MessagingGateway};

/// Retained payload of `{base}/device/{serial}/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device serial
    pub serial: String,
    /// Device model
    pub device_type: DeviceType,
    /// Whether the device is connected
    pub online: bool,
    /// When this status started
    pub since: DateTime<Utc>,
}

impl DeviceStatus {
    fn now(serial: &str, device_type: DeviceType, online: bool) -> Self {
        Self {
            serial: serial.to_string(),
            device_type,
            online,
            since: Utc::now(),
        }
    }
}

/// Publishes a status topic per device and rebuilds them after reconnects
#[derive(Debug)]
pub struct StatusMirror {
    gateway: Arc<MessagingGateway>,
    registry: Arc<DeviceRegistry>,
    known: HashMap<String, DeviceType>,
}

impl StatusMirror {
    /// A mirror over the registry's devices
    pub fn new(gateway: Arc<MessagingGateway>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            gateway,
            registry,
            known: HashMap::new(),
        }
    }

    /// Follow device and broker events on a task
    pub fn spawn(mut self, bus: &SharedEventBus) -> Result<JoinHandle<()>> {
        let mut connected = bus.subscribe::<DeviceConnected>()?;
        let mut disconnected = bus.subscribe::<DeviceDisconnected>()?;
        let mut broker = bus.subscribe::<BrokerStatus>()?;

        Ok(tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        event = connected.recv() => match event {
                            Ok(event) => self.device_connected(event).await,
                            Err(RecvError::Lagged(n)) => warn!("Missed {} connect events", n),
                            Err(RecvError::Closed) => break,
                        },
                        event = disconnected.recv() => match event {
                            Ok(event) => self.device_disconnected(event).await,
                            Err(RecvError::Lagged(n)) => warn!("Missed {} disconnect events", n),
                            Err(RecvError::Closed) => break,
                        },
                        event = broker.recv() => match event {
                            Ok(BrokerStatus { connected: true }) => self.republish().await,
                            Ok(_) => {}
                            Err(RecvError::Lagged(n)) => warn!("Missed {} broker status events", n),
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
                debug!("Status mirror stopped");
            }
            .instrument(component_span("status-mirror", None)),
        ))
    }

    async fn device_connected(&mut self, event: DeviceConnected) {
        self.known.insert(event.serial.clone(), event.device_type);
        self.publish(DeviceStatus::now(&event.serial, event.device_type, true), false)
            .await;
    }

    async fn device_disconnected(&mut self, event: DeviceDisconnected) {
        let Some(device_type) = self.known.get(&event.serial).copied() else {
            debug!("No status for unknown device {}", event.serial);
            return;
        };
        self.publish(DeviceStatus::now(&event.serial, device_type, false), false)
            .await;
    }

    async fn republish(&mut self) {
        let filter = self.gateway.topics().device_status_filter();
        match self.gateway.remove_all_matching(&filter).await {
            Ok(cleared) => debug!("Cleared {} stale device status topics", cleared),
            Err(e) => error!("Failed to clear device status topics: {}", e),
        }

        let connections = self.registry.connections();
        info!("Publishing status of {} connected devices", connections.len());
        for connection in connections {
            self.known
                .insert(connection.serial().to_string(), connection.device_type());
            self.publish(
                DeviceStatus::now(connection.serial(), connection.device_type(), true),
                true,
            )
            .await;
        }
    }

    async fn publish(&self, status: DeviceStatus, immediate: bool) {
        let topic = self.gateway.topics().device_status(&status.serial);
        self.gateway.publish_json(&topic, &status, immediate).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;
    use panelsync_core::config::{BrokerSettings, DevicesConfig, TopicsConfig};
    use panelsync_core::utils::poll_until;
    use panelsync_devices::testing::{FakeHandle, FakeWatcher};
    use std::time::Duration;

    struct Fixture {
        broker: MemoryBroker,
        bus: SharedEventBus,
        gateway: Arc<MessagingGateway>,
        registry: Arc<DeviceRegistry>,
    }

    fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let bus = SharedEventBus::new();
        let gateway = Arc::new(MessagingGateway::new(
            Arc::new(broker.clone()),
            bus.clone(),
            &TopicsConfig::default(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(FakeWatcher::new()),
            bus.clone(),
            &DevicesConfig::default(),
        ));
        Fixture {
            broker,
            bus,
            gateway,
            registry,
        }
    }

    fn settings() -> BrokerSettings {
        BrokerSettings {
            enabled: true,
            ..BrokerSettings::default()
        }
    }

    fn status(broker: &MemoryBroker, serial: &str) -> Option<DeviceStatus> {
        broker
            .retained(&format!("panelsync/device/{}/status", serial))
            .and_then(|payload| serde_json::from_slice(&payload).ok())
    }

    async fn wait_for(check: impl FnMut() -> bool) -> bool {
        poll_until(Duration::from_millis(10), 100, check).await
    }

    #[tokio::test]
    async fn test_device_presence_is_mirrored() -> Result<()> {
        let f = fixture();
        f.gateway.apply_settings(settings()).await?;
        let _mirror = StatusMirror::new(f.gateway.clone(), f.registry.clone()).spawn(&f.bus)?;

        let handle = Arc::new(FakeHandle::new("A1", DeviceType::PcPanelPro));
        f.registry
            .device_added("A1", handle.clone(), DeviceType::PcPanelPro)
            .expect("device added");

        assert!(wait_for(|| status(&f.broker, "A1").is_some()).await);
        let online = status(&f.broker, "A1").expect("status");
        assert_eq!(online.device_type, DeviceType::PcPanelPro);
        assert!(online.online);

        f.registry
            .device_removed("A1", &*handle)
            .expect("device removed");

        assert!(wait_for(|| status(&f.broker, "A1").map_or(false, |s| !s.online)).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_broker_connect_rebuilds_statuses() -> Result<()> {
        let f = fixture();
        f.broker.inject("panelsync/device/GONE/status", "{}", true);
        f.broker.inject("panelsync/other", "keep", true);

        let handle = Arc::new(FakeHandle::new("B2", DeviceType::PcPanelMini));
        f.registry
            .device_added("B2", handle, DeviceType::PcPanelMini)
            .expect("device added");
        let _mirror = StatusMirror::new(f.gateway.clone(), f.registry.clone()).spawn(&f.bus)?;

        f.gateway.apply_settings(settings()).await?;

        assert!(wait_for(|| status(&f.broker, "B2").is_some()).await);
        assert_eq!(f.broker.retained("panelsync/device/GONE/status"), None);
        assert!(f.broker.retained("panelsync/other").is_some());
        Ok(())
    }
}
