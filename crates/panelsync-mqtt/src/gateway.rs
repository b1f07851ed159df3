/*!
 * The messaging gateway.
 *
 * [`MessagingGateway`] owns at most one broker session and keeps it in line
 * with the current [`BrokerSettings`]. Everything it publishes is retained.
 * Non-immediate publishes are debounced per topic so that bursts of updates
 * reach the broker as one message carrying the latest payload.
 */
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

use panelsync_core::config::{BrokerSettings, SettingsChanged, TopicsConfig};
use panelsync_core::debounce::Debouncer;
use panelsync_core::event::SharedEventBus;
use panelsync_core::logging::component_span;

use crate::broker::{BrokerConnector, BrokerSession, SessionOptions};
use crate::error::{MqttError, Result};
use crate::topic::{TopicFilter, Topics};

/// How long `remove_all_matching` waits for each further retained message
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ONLINE: &[u8] = b"online";

/// Broker connection state, published on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStatus {
    /// Whether a session is up
    pub connected: bool,
}

/// Debounce key: one pending publish per topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey(pub String);

type SessionSlot = Arc<RwLock<Option<Arc<dyn BrokerSession>>>>;

/// Gateway between PanelSync and an MQTT broker
pub struct MessagingGateway {
    connector: Arc<dyn BrokerConnector>,
    topics: Topics,
    window: Duration,
    event_bus: SharedEventBus,
    settings: tokio::sync::Mutex<BrokerSettings>,
    session: SessionSlot,
    debouncer: Debouncer<TopicKey>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingGateway {
    /// Create a gateway with no session
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        event_bus: SharedEventBus,
        topics: &TopicsConfig,
    ) -> Self {
        Self {
            connector,
            topics: Topics::new(topics.base_topic.clone()),
            window: topics.publish_window(),
            event_bus,
            settings: tokio::sync::Mutex::new(BrokerSettings::disabled()),
            session: Arc::new(RwLock::new(None)),
            debouncer: Debouncer::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Topic layout
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Whether a broker session exists and its link is up
    pub fn is_connected(&self) -> bool {
        current_session(&self.session).is_some_and(|session| session.is_connected())
    }

    /// Settings the gateway currently runs with
    pub async fn settings(&self) -> BrokerSettings {
        self.settings.lock().await.clone()
    }

    /// Bring the broker session in line with `settings`
    ///
    /// Identical settings are a no-op. A failed connection leaves the gateway
    /// disconnected and is returned to the caller.
    pub async fn apply_settings(&self, settings: BrokerSettings) -> Result<()> {
        let mut current = self.settings.lock().await;
        if *current == settings {
            debug!("Broker settings unchanged");
            return Ok(());
        }

        self.teardown().await;

        if !settings.enabled {
            info!("MQTT disabled");
            *current = settings;
            self.event_bus.emit(BrokerStatus { connected: false });
            return Ok(());
        }

        let options = SessionOptions {
            client_id: format!("panelsync-{}", Uuid::new_v4().simple()),
            last_will_topic: self.topics.availability(),
            keep_alive: KEEP_ALIVE,
            connect_timeout: CONNECT_TIMEOUT,
        };

        match self.connector.connect(&settings, &options).await {
            Ok(session) => {
                if let Err(e) = session
                    .publish(&self.topics.availability(), Bytes::from_static(ONLINE), true)
                    .await
                {
                    warn!("Failed to publish availability: {}", e);
                }
                self.install(Some(session));
                *current = settings;
                self.event_bus.emit(BrokerStatus { connected: true });
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to MQTT broker {}:{}: {}", settings.host, settings.port, e);
                *current = BrokerSettings::disabled();
                self.event_bus.emit(BrokerStatus { connected: false });
                Err(e)
            }
        }
    }

    fn install(&self, session: Option<Arc<dyn BrokerSession>>) -> Option<Arc<dyn BrokerSession>> {
        match self.session.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, session),
            Err(_) => {
                error!("Failed to acquire write lock on broker session");
                None
            }
        }
    }

    async fn teardown(&self) {
        self.debouncer.cancel_all();
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            for task in subscriptions.drain(..) {
                task.abort();
            }
        }
        if let Some(session) = self.install(None) {
            if let Err(e) = session.disconnect().await {
                warn!("Error while disconnecting from MQTT broker: {}", e);
            }
            info!("Disconnected from MQTT broker");
        }
    }

    /// Publish raw bytes, retained
    ///
    /// `immediate` sends before returning and drops any pending debounced
    /// payload for the topic. Otherwise the publish waits out the window and
    /// only the latest payload for the topic is sent.
    pub async fn publish_bytes(&self, topic: &str, payload: impl Into<Bytes>, immediate: bool) {
        let payload = payload.into();
        let key = TopicKey(topic.to_string());

        if immediate {
            if self.debouncer.cancel(&key) {
                trace!("Dropped pending publish to {}", topic);
            }
            send(&self.session, topic, payload).await;
            return;
        }

        let session = self.session.clone();
        let target = topic.to_string();
        let scheduled = self.debouncer.debounce(key, self.window, async move {
            send(&session, &target, payload).await;
        });
        if let Err(e) = scheduled {
            error!("Failed to schedule publish to {}: {}", topic, e);
        }
    }

    /// Publish a string, retained
    pub async fn publish_str(&self, topic: &str, payload: &str, immediate: bool) {
        self.publish_bytes(topic, Bytes::copy_from_slice(payload.as_bytes()), immediate)
            .await;
    }

    /// Publish a value as JSON, retained
    ///
    /// A value that fails to serialize is logged and dropped.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T, immediate: bool) {
        match serde_json::to_vec(value) {
            Ok(payload) => self.publish_bytes(topic, payload, immediate).await,
            Err(e) => error!("Failed to serialize payload for {}: {}", topic, e),
        }
    }

    /// Clear the retained message of one topic
    pub async fn remove(&self, topic: &str) {
        self.publish_bytes(topic, Bytes::new(), true).await;
    }

    /// Clear every retained topic matching `pattern`
    ///
    /// The broker cannot delete by pattern, so this subscribes, collects the
    /// retained topics it is sent until none arrives for [`DRAIN_TIMEOUT`],
    /// unsubscribes and clears each one. Returns how many were cleared.
    pub async fn remove_all_matching(&self, pattern: &str) -> Result<usize> {
        let filter = TopicFilter::parse(pattern)?;
        let session = current_session(&self.session).ok_or(MqttError::NotConnected)?;

        let mut messages = session.messages();
        session.subscribe(filter.as_str()).await?;

        let mut found = BTreeSet::new();
        let mut deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, messages.recv()).await {
                Ok(Ok(message)) => {
                    if filter.matches(&message.topic) {
                        deadline = Instant::now() + DRAIN_TIMEOUT;
                        if !message.payload.is_empty() {
                            found.insert(message.topic);
                        }
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!("Missed {} messages while collecting {}", n, pattern);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }

        if let Err(e) = session.unsubscribe(filter.as_str()).await {
            warn!("Failed to unsubscribe from {}: {}", pattern, e);
        }

        debug!("Clearing {} retained topics matching {}", found.len(), pattern);
        join_all(found.iter().map(|topic| self.remove(topic))).await;
        Ok(found.len())
    }

    /// Run `handler` for every message on topics matching `filter`
    ///
    /// Retained messages are delivered as well as live ones. A payload that
    /// `decode` rejects is logged and skipped. The subscription ends with the
    /// session.
    pub async fn subscribe<T, D, H, Fut>(&self, filter: &str, decode: D, handler: H) -> Result<()>
    where
        T: Send + 'static,
        D: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
        H: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let filter = TopicFilter::parse(filter)?;
        let session = current_session(&self.session).ok_or(MqttError::NotConnected)?;

        let mut messages = session.messages();
        session.subscribe(filter.as_str()).await?;

        let span = component_span("mqtt-subscription", Some(filter.as_str()));
        let task = tokio::spawn(
            async move {
                loop {
                    match messages.recv().await {
                        Ok(message) => {
                            if !filter.matches(&message.topic) {
                                continue;
                            }
                            match decode(&message.payload[..]) {
                                Ok(value) => handler(message.topic, value).await,
                                Err(e) => warn!("Failed to decode message on {}: {}", message.topic, e),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Subscription lagged by {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            .instrument(span),
        );

        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.retain(|t| !t.is_finished());
            subscriptions.push(task);
        }
        Ok(())
    }

    /// Subscribe with payloads decoded from JSON
    pub async fn subscribe_json<T, H, Fut>(&self, filter: &str, handler: H) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(
            filter,
            |payload| serde_json::from_slice(payload).map_err(MqttError::from),
            handler,
        )
        .await
    }

    /// Subscribe with payloads passed through as text
    pub async fn subscribe_string<H, Fut>(&self, filter: &str, handler: H) -> Result<()>
    where
        H: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(
            filter,
            |payload| Ok(String::from_utf8_lossy(payload).into_owned()),
            handler,
        )
        .await
    }

    /// Follow [`SettingsChanged`] events and re-apply the broker settings
    pub fn spawn_settings_listener(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut changes = self.event_bus.subscribe::<SettingsChanged>()?;
        let gateway: Weak<Self> = Arc::downgrade(self);
        Ok(tokio::spawn(
            async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => {
                            let Some(gateway) = gateway.upgrade() else {
                                break;
                            };
                            let settings = change.config.get().mqtt.clone();
                            if let Err(e) = gateway.apply_settings(settings).await {
                                error!("Failed to apply broker settings: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Missed {} settings changes", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            .instrument(component_span("mqtt-settings", None)),
        ))
    }

    /// Clear availability and disconnect
    pub async fn shutdown(&self) {
        let mut current = self.settings.lock().await;
        if self.is_connected() {
            self.remove(&self.topics.availability()).await;
        }
        self.teardown().await;
        *current = BrokerSettings::disabled();
        self.event_bus.emit(BrokerStatus { connected: false });
    }
}

impl std::fmt::Debug for MessagingGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingGateway")
            .field("topics", &self.topics)
            .field("window", &self.window)
            .field("connected", &self.is_connected())
            .field("debouncer", &self.debouncer)
            .finish()
    }
}

fn current_session(slot: &SessionSlot) -> Option<Arc<dyn BrokerSession>> {
    slot.read().ok().and_then(|session| session.clone())
}

async fn send(slot: &SessionSlot, topic: &str, payload: Bytes) {
    let Some(session) = current_session(slot) else {
        debug!("Not connected, dropping publish to {}", topic);
        return;
    };
    if let Err(e) = session.publish(topic, payload, true).await {
        warn!("Failed to publish to {}: {}", topic, e);
    }
}
