/*!
 * In-memory broker for tests.
 */
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use panelsync_core::config::BrokerSettings;

use crate::broker::{BrokerConnector, BrokerSession, IncomingMessage, SessionOptions};
use crate::error::{MqttError, Result};
use crate::topic::TopicFilter;

/// A publish recorded by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic
    pub topic: String,
    /// Payload
    pub payload: Bytes,
    /// Retain flag
    pub retain: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    retained: BTreeMap<String, Bytes>,
    published: Vec<PublishedMessage>,
    connects: Vec<SessionOptions>,
    fail_connect: bool,
    sessions: Vec<Arc<MemorySession>>,
}

/// Broker that keeps everything in memory and delivers synchronously
#[derive(Debug, Default, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// An empty broker
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Refuse new connections
    pub fn fail_connects(&self, fail: bool) {
        self.with_state(|s| s.fail_connect = fail);
    }

    /// How many sessions were opened
    pub fn connects(&self) -> usize {
        self.with_state(|s| s.connects.len())
    }

    /// Options of every session opened so far
    pub fn session_options(&self) -> Vec<SessionOptions> {
        self.with_state(|s| s.connects.clone())
    }

    /// Sessions still connected
    pub fn live_sessions(&self) -> usize {
        self.with_state(|s| s.sessions.len())
    }

    /// Every publish received from clients
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.with_state(|s| s.published.clone())
    }

    /// Payloads published to one topic, oldest first
    pub fn published_to(&self, topic: &str) -> Vec<Bytes> {
        self.with_state(|s| {
            s.published
                .iter()
                .filter(|m| m.topic == topic)
                .map(|m| m.payload.clone())
                .collect()
        })
    }

    /// Current retained payload of a topic
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.with_state(|s| s.retained.get(topic).cloned())
    }

    /// Topics with a retained payload
    pub fn retained_topics(&self) -> Vec<String> {
        self.with_state(|s| s.retained.keys().cloned().collect())
    }

    /// Drop or restore the network link of every live session
    ///
    /// Sessions stay registered while the link is down, as a client that
    /// keeps retrying would.
    pub fn set_link(&self, up: bool) {
        let sessions = self.with_state(|s| s.sessions.clone());
        for session in sessions {
            session.link_up.store(up, Ordering::SeqCst);
        }
    }

    /// Forget the publish log
    pub fn clear_published(&self) {
        self.with_state(|s| s.published.clear());
    }

    /// Publish as some other client
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) {
        self.route(topic, payload.into(), retain, false);
    }

    fn route(&self, topic: &str, payload: Bytes, retain: bool, record: bool) {
        let sessions = self.with_state(|s| {
            if record {
                s.published.push(PublishedMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    retain,
                });
            }
            if retain {
                if payload.is_empty() {
                    s.retained.remove(topic);
                } else {
                    s.retained.insert(topic.to_string(), payload.clone());
                }
            }
            s.sessions.clone()
        });
        for session in sessions {
            if session.accepts(topic) {
                session.deliver(topic, payload.clone(), false);
            }
        }
    }

    fn detach(&self, session: &MemorySession) {
        self.with_state(|s| s.sessions.retain(|other| !std::ptr::eq(other.as_ref(), session)));
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(
        &self,
        settings: &BrokerSettings,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrokerSession>> {
        let session = self.with_state(|s| {
            if s.fail_connect {
                return Err(MqttError::Connect(format!(
                    "connection to {}:{} refused",
                    settings.host, settings.port
                )));
            }
            s.connects.push(options.clone());
            let session = Arc::new(MemorySession::new(self.clone()));
            s.sessions.push(session.clone());
            Ok(session)
        })?;
        Ok(session)
    }
}

/// Session on a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemorySession {
    broker: MemoryBroker,
    filters: Mutex<Vec<TopicFilter>>,
    messages: broadcast::Sender<IncomingMessage>,
    connected: AtomicBool,
    link_up: AtomicBool,
}

impl MemorySession {
    fn new(broker: MemoryBroker) -> Self {
        let (messages, _) = broadcast::channel(256);
        Self {
            broker,
            filters: Mutex::new(Vec::new()),
            messages,
            connected: AtomicBool::new(true),
            link_up: AtomicBool::new(true),
        }
    }

    fn accepts(&self, topic: &str) -> bool {
        self.filters
            .lock()
            .map(|filters| filters.iter().any(|f| f.matches(topic)))
            .unwrap_or(false)
    }

    fn deliver(&self, topic: &str, payload: Bytes, retained: bool) {
        let _ = self.messages.send(IncomingMessage {
            topic: topic.to_string(),
            payload,
            retained,
        });
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.ensure_connected()?;
        self.broker.route(topic, payload, retain, true);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.ensure_connected()?;
        let parsed = TopicFilter::parse(filter)?;
        let retained: Vec<(String, Bytes)> = self.broker.with_state(|s| {
            s.retained
                .iter()
                .filter(|(topic, _)| parsed.matches(topic))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect()
        });
        if let Ok(mut filters) = self.filters.lock() {
            filters.push(parsed);
        }
        for (topic, payload) in retained {
            self.deliver(&topic, payload, true);
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.ensure_connected()?;
        if let Ok(mut filters) = self.filters.lock() {
            filters.retain(|f| f.as_str() != filter);
        }
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<IncomingMessage> {
        self.messages.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.link_up.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.detach(self);
        }
        Ok(())
    }
}
