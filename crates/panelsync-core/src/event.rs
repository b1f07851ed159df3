/*!
 * Typed event bus for PanelSync.
 *
 * Components never call each other to announce state changes. The device
 * registry, the power monitor and the broker gateway each publish plain
 * event structs here, and whoever cares subscribes by type. Every event type
 * gets its own broadcast channel, created lazily on first use from either
 * side.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Maximum number of events buffered per event type
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type EventSender<T> = broadcast::Sender<T>;

/// Receiver half handed out by [`EventBus::subscribe`]
pub type EventReceiver<T> = broadcast::Receiver<T>;

/// Marker for anything that can travel over the bus
pub trait BusEvent: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> BusEvent for T {}

/// Event bus keyed by event type
#[derive(Debug)]
pub struct EventBus {
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific per-type channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity.max(1),
        }
    }

    fn sender<T: BusEvent>(&self) -> Result<EventSender<T>> {
        let type_id = TypeId::of::<T>();
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::event("Failed to lock event channels"))?;

        if let Some(sender) = channels.get(&type_id) {
            return sender
                .downcast_ref::<EventSender<T>>()
                .cloned()
                .ok_or_else(|| Error::event("Event channel registered with a different type"));
        }

        let (sender, _) = broadcast::channel(self.channel_capacity);
        channels.insert(type_id, Box::new(sender.clone()));
        Ok(sender)
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish<T: BusEvent>(&self, event: T) -> Result<usize> {
        let sender = self.sender::<T>()?;
        if sender.receiver_count() == 0 {
            trace!("No subscribers for {}", std::any::type_name::<T>());
            return Ok(0);
        }

        sender
            .send(event)
            .map_err(|e| Error::event(format!("Failed to publish event: {}", e)))
    }

    /// Publish an event and log instead of failing
    ///
    /// Producers that sit on a hardware or subprocess thread use this, since
    /// a missing subscriber must never stall detection.
    pub fn emit<T: BusEvent>(&self, event: T) {
        match self.publish(event) {
            Ok(n) => trace!("Delivered {} to {} subscribers", std::any::type_name::<T>(), n),
            Err(e) => warn!("Dropping {}: {}", std::any::type_name::<T>(), e),
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: BusEvent>(&self) -> Result<EventReceiver<T>> {
        Ok(self.sender::<T>()?.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable handle to one [`EventBus`]
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// Publish an event
    pub fn publish<T: BusEvent>(&self, event: T) -> Result<usize> {
        self.0.publish(event)
    }

    /// Publish an event, logging failures
    pub fn emit<T: BusEvent>(&self, event: T) {
        self.0.emit(event)
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: BusEvent>(&self) -> Result<EventReceiver<T>> {
        self.0.subscribe()
    }
}

impl AsRef<EventBus> for SharedEventBus {
    fn as_ref(&self) -> &EventBus {
        &self.0
    }
}
