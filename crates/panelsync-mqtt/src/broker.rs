/*!
 * Broker sessions.
 *
 * A [`BrokerSession`] is one live connection. It is never reconfigured: new
 * settings mean a new session from the [`BrokerConnector`]. The rumqttc
 * implementation drives its event loop on a tokio task, re-issues
 * subscriptions after every reconnect, and fans incoming publishes out on a
 * broadcast channel.
 */
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, QoS,
    Transport,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use panelsync_core::config::BrokerSettings;

use crate::error::{MqttError, Result};

const MESSAGE_BUFFER: usize = 256;
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A publish received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Topic it was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
    /// Whether the broker delivered it from its retained store
    pub retained: bool,
}

/// Per-session connection options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Client identifier, unique per session
    pub client_id: String,
    /// Topic the broker clears (retained, empty) if the session dies
    pub last_will_topic: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// How long to wait for the broker to accept the connection
    pub connect_timeout: Duration,
}

/// Opens broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync + fmt::Debug {
    /// Connect and wait until the broker accepted the session
    async fn connect(
        &self,
        settings: &BrokerSettings,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrokerSession>>;
}

/// One live broker connection
#[async_trait]
pub trait BrokerSession: Send + Sync + fmt::Debug {
    /// Publish at least once
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Drop a subscription
    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Every publish received from now on, for all subscriptions
    fn messages(&self) -> broadcast::Receiver<IncomingMessage>;

    /// Whether the broker link is up right now
    fn is_connected(&self) -> bool;

    /// Disconnect gracefully
    async fn disconnect(&self) -> Result<()>;
}

/// Connector backed by rumqttc
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

impl RumqttConnector {
    /// A new connector
    pub fn new() -> Self {
        Self
    }

    fn options(settings: &BrokerSettings, options: &SessionOptions) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), settings.host.clone(), settings.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_last_will(LastWill::new(
                options.last_will_topic.clone(),
                Vec::<u8>::new(),
                QoS::AtLeastOnce,
                true,
            ));
        if settings.has_credentials() {
            mqtt_options.set_credentials(settings.username.clone(), settings.password.clone());
        }
        if settings.secure {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        mqtt_options
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(MqttError::Connect(format!("broker refused session: {:?}", code))),
                };
            }
            Ok(event) => trace!("MQTT event before ConnAck: {:?}", event),
            Err(e) => return Err(MqttError::Connect(e.to_string())),
        }
    }
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(
        &self,
        settings: &BrokerSettings,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrokerSession>> {
        let (client, mut eventloop) =
            AsyncClient::new(Self::options(settings, options), REQUEST_CAPACITY);

        match tokio::time::timeout(options.connect_timeout, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(MqttError::Connect(format!(
                    "timed out connecting to {}:{}",
                    settings.host, settings.port
                )))
            }
        }
        info!("Connected to MQTT broker at {}:{}", settings.host, settings.port);

        Ok(Arc::new(RumqttSession::spawn(client, eventloop)))
    }
}

/// Session backed by rumqttc
pub struct RumqttSession {
    client: AsyncClient,
    messages: broadcast::Sender<IncomingMessage>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttSession {
    fn spawn(client: AsyncClient, mut eventloop: EventLoop) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        let subscriptions = Arc::new(Mutex::new(BTreeSet::new()));
        // only spawned once the first ConnAck arrived
        let connected = Arc::new(AtomicBool::new(true));
        let stopping = Arc::new(AtomicBool::new(false));

        let task = {
            let client = client.clone();
            let messages = messages.clone();
            let subscriptions = subscriptions.clone();
            let connected = connected.clone();
            let stopping = stopping.clone();
            tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(msg))) => {
                            let _ = messages.send(IncomingMessage {
                                topic: msg.topic.clone(),
                                payload: msg.payload.clone(),
                                retained: msg.retain,
                            });
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            connected.store(true, Ordering::SeqCst);
                            info!("Reconnected to MQTT broker");
                            let filters: Vec<String> = subscriptions
                                .lock()
                                .map(|s| s.iter().cloned().collect())
                                .unwrap_or_default();
                            for filter in filters {
                                if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                                    warn!("Failed to resubscribe to {}: {}", filter, e);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            connected.store(false, Ordering::SeqCst);
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!("MQTT connection error: {}", e);
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
                debug!("MQTT event loop stopped");
            })
        };

        Self {
            client,
            messages,
            subscriptions,
            connected,
            stopping,
            task: Mutex::new(Some(task)),
        }
    }
}

impl fmt::Debug for RumqttSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RumqttSession")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.insert(filter.to_string());
        }
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.remove(filter);
        }
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<IncomingMessage> {
        self.messages.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let result = self.client.disconnect().await;

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(mut task) = task {
            // give the event loop a moment to flush the DISCONNECT packet
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }

        result?;
        Ok(())
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelsync_core::utils::poll_until;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_test::assert_ok;

    fn session_options() -> SessionOptions {
        SessionOptions {
            client_id: "panelsync-test".to_string(),
            last_will_topic: "panelsync/availability".to_string(),
            keep_alive: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_options() {
        let settings = BrokerSettings {
            enabled: true,
            host: "broker.lan".to_string(),
            port: 1884,
            username: "panel".to_string(),
            password: "secret".to_string(),
            secure: false,
        };
        let options = RumqttConnector::options(&settings, &session_options());

        assert_eq!(options.broker_address(), ("broker.lan".to_string(), 1884));
        assert_eq!(options.client_id(), "panelsync-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(5));
        assert_eq!(
            options.credentials(),
            Some(("panel".to_string(), "secret".to_string()))
        );
        let will = options.last_will().expect("last will");
        assert_eq!(will.topic, "panelsync/availability");
        assert!(will.message.is_empty());
        assert!(will.retain);
    }

    #[test]
    fn test_anonymous_options() {
        let settings = BrokerSettings {
            enabled: true,
            ..BrokerSettings::default()
        };
        let options = RumqttConnector::options(&settings, &session_options());
        assert_eq!(options.credentials(), None);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // nothing listens on port 1 of the loopback interface
        let settings = BrokerSettings {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1,
            ..BrokerSettings::default()
        };
        let result = RumqttConnector::new()
            .connect(&settings, &session_options())
            .await;
        assert!(matches!(result, Err(MqttError::Connect(_))));
    }

    #[tokio::test]
    async fn test_session_tracks_link_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (drop_link, link_dropped) = oneshot::channel::<()>();
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut connect = [0u8; 256];
            let _ = socket.read(&mut connect).await;
            // CONNACK: no session present, accepted
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            let _ = link_dropped.await;
            drop(socket);
            // keep the port bound without answering reconnects
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let settings = BrokerSettings {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            ..BrokerSettings::default()
        };
        let session = assert_ok!(
            RumqttConnector::new()
                .connect(&settings, &session_options())
                .await
        );
        assert!(session.is_connected());

        let _ = drop_link.send(());
        assert!(poll_until(Duration::from_millis(10), 200, || !session.is_connected()).await);

        let _ = session.disconnect().await;
        assert!(!session.is_connected());
        broker.abort();
    }
}
