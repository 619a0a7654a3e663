pub mod models;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex, RwLock},
    time,
};
use tracing::{debug, info, warn};

use self::models::{DeviceCommand, InboundMessage, Topics};

/// Capacity of the channel between the event loop and the dispatcher.
const INBOUND_CAPACITY: usize = 1000;

/// Capacity of rumqttc's request channel.
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// `(username, password)`
    pub credentials: Option<(String, String)>,
    pub topic_prefix: String,
    pub keep_alive: Duration,
    /// Upper bound for TCP connect plus CONNACK.
    pub connect_timeout: Duration,
    /// Upper bound for handing a publish to the client.
    pub publish_timeout: Duration,
    /// Fixed delay before a reconnect attempt.
    pub reconnect_backoff: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("not connected to the MQTT broker")]
    NotConnected,

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("publish rejected by client: {0}")]
    Publish(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection manager is shutting down")]
    ShuttingDown,

    #[error("failed to serialise command: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transport-level events that end a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker closed the session.
    Closed,
    /// The network went away.
    Offline,
    Error(String),
}

/// Anything that can deliver a command envelope to a device.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn send_command(&self, device_id: &str, command: &DeviceCommand) -> Result<(), MqttError>;
}

/// Owner of the single broker connection.
///
/// Cheap to clone; all clones drive the same connection. Connection attempts
/// are serialised so concurrent `connect` calls never open a second socket,
/// and at most one reconnect timer is pending at any time.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: MqttConfig,
    topics: Topics,
    state: watch::Sender<ConnectionState>,
    client: RwLock<Option<AsyncClient>>,
    connect_lock: Mutex<()>,
    /// Bumped whenever a connection is superseded; event loops from older
    /// generations stop reporting.
    generation: AtomicU64,
    reconnect_pending: AtomicBool,
    reconnects_scheduled: AtomicU64,
    shutting_down: AtomicBool,
    inbound: mpsc::Sender<InboundMessage>,
}

impl ConnectionManager {
    /// Build a manager and the receiving end of its inbound message stream.
    pub fn new(config: MqttConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let topics = Topics::new(config.topic_prefix.clone());
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                topics,
                state,
                client: RwLock::new(None),
                connect_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                reconnect_pending: AtomicBool::new(false),
                reconnects_scheduled: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                inbound: tx,
            }),
        };
        (manager, rx)
    }

    pub fn topics(&self) -> &Topics {
        &self.inner.topics
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of reconnect timers armed since start.
    pub fn reconnects_scheduled(&self) -> u64 {
        self.inner.reconnects_scheduled.load(Ordering::Acquire)
    }

    pub fn reconnect_pending(&self) -> bool {
        self.inner.reconnect_pending.load(Ordering::Acquire)
    }

    /// Connect and subscribe to every inbound topic at QoS 2.
    ///
    /// A caller arriving while another attempt is in flight waits for that
    /// attempt and returns immediately if it succeeded. A failed attempt arms
    /// the reconnect timer before returning the error.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(MqttError::ShuttingDown);
        }

        self.set_state(ConnectionState::Connecting);
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cfg = &self.inner.config;
        info!(host = %cfg.host, port = cfg.port, client_id = %cfg.client_id, "Connecting to MQTT broker");

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = tokio::spawn(self.clone().drive(eventloop, generation, ready_tx));

        let outcome = match time::timeout(cfg.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => self.subscribe_all(&client).await,
            Ok(Ok(Err(reason))) => Err(MqttError::Connect(reason)),
            Ok(Err(_)) => Err(MqttError::Connect("event loop stopped before CONNACK".into())),
            Err(_) => Err(MqttError::Connect(format!(
                "no CONNACK within {:?}",
                cfg.connect_timeout
            ))),
        };

        let outcome = outcome.and_then(|()| {
            if self.inner.generation.load(Ordering::Acquire) == generation {
                Ok(())
            } else {
                Err(MqttError::Connect("connection dropped while subscribing".into()))
            }
        });

        match outcome {
            Ok(()) => {
                *self.inner.client.write().await = Some(client);
                self.set_state(ConnectionState::Connected);
                info!(topics = ?self.inner.topics.subscriptions(), "MQTT connected and subscribed");
                Ok(())
            }
            Err(e) => {
                driver.abort();
                self.inner.generation.fetch_add(1, Ordering::AcqRel);
                self.set_state(ConnectionState::Disconnected);
                warn!(error = %e, "MQTT connect attempt failed");
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Close the connection for good. No reconnect is scheduled afterwards.
    pub async fn disconnect(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(client) = self.inner.client.write().await.take() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "MQTT disconnect request failed");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT connection closed");
    }

    /// Publish `payload` to `topic`, waiting at most the configured publish
    /// timeout for the client to accept it.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        let client = match (self.state(), self.inner.client.read().await.clone()) {
            (ConnectionState::Connected, Some(client)) => client,
            _ => return Err(MqttError::NotConnected),
        };

        let timeout = self.inner.config.publish_timeout;
        match time::timeout(timeout, client.publish(topic, qos, false, payload)).await {
            Ok(Ok(())) => {
                debug!(topic = %topic, "Published");
                Ok(())
            }
            Ok(Err(e)) => Err(MqttError::Publish(e.to_string())),
            Err(_) => Err(MqttError::Timeout(timeout)),
        }
    }

    /// React to the end of a connection: clear the connected flag and arm a
    /// reconnect unless one is already pending or a connect is in flight.
    ///
    /// Returns `true` if this call armed the reconnect timer.
    pub async fn on_connection_event(&self, event: ConnectionEvent) -> bool {
        let previous = self.state();
        if previous == ConnectionState::Connecting {
            debug!(event = ?event, "Connect attempt in flight; it will handle the failure");
            return false;
        }

        self.inner.client.write().await.take();
        self.set_state(ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            warn!(event = ?event, "MQTT connection lost");
        }
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&self) -> bool {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        if self
            .inner
            .reconnect_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconnect already scheduled");
            return false;
        }
        self.inner.reconnects_scheduled.fetch_add(1, Ordering::AcqRel);

        let backoff = self.inner.config.reconnect_backoff;
        info!(backoff_secs = backoff.as_secs(), "Scheduling MQTT reconnect");
        let this = self.clone();
        tokio::spawn(async move {
            time::sleep(backoff).await;
            this.inner.reconnect_pending.store(false, Ordering::Release);
            if let Err(e) = this.connect().await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        });
        true
    }

    async fn subscribe_all(&self, client: &AsyncClient) -> Result<(), MqttError> {
        let filters = self
            .inner
            .topics
            .subscriptions()
            .into_iter()
            .map(|topic| SubscribeFilter::new(topic, QoS::ExactlyOnce));
        client
            .subscribe_many(filters)
            .await
            .map_err(|e| MqttError::Connect(format!("subscribe failed: {e}")))
    }

    /// Poll the event loop of one connection generation until it ends.
    async fn drive(
        self,
        mut eventloop: EventLoop,
        generation: u64,
        ready: oneshot::Sender<Result<(), String>>,
    ) {
        let mut ready = Some(ready);
        loop {
            let event = eventloop.poll().await;
            if self.inner.generation.load(Ordering::Acquire) != generation {
                debug!(generation, "Superseded event loop stopping");
                break;
            }

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if self.inner.inbound.send(message).await.is_err() {
                        warn!(topic = %publish.topic, "Inbound channel closed; dropping message");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connection_lost(generation, ConnectionEvent::Closed).await;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(e.to_string()));
                        }
                        None => {
                            let event = match e {
                                rumqttc::ConnectionError::Io(_) => ConnectionEvent::Offline,
                                other => ConnectionEvent::Error(other.to_string()),
                            };
                            self.connection_lost(generation, event).await;
                        }
                    }
                    break;
                }
            }
        }
    }

    async fn connection_lost(&self, generation: u64, event: ConnectionEvent) {
        let current = self.inner.generation.compare_exchange(
            generation,
            generation + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if current.is_ok() {
            self.on_connection_event(event).await;
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let cfg = &self.inner.config;
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(cfg.keep_alive);
        options.set_clean_session(false);
        if let Some((user, pass)) = &cfg.credentials {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "MQTT connection state changed");
        }
    }
}

#[async_trait]
impl CommandPublisher for ConnectionManager {
    async fn send_command(&self, device_id: &str, command: &DeviceCommand) -> Result<(), MqttError> {
        let payload = serde_json::to_vec(command)?;
        let topic = self.inner.topics.control(device_id);
        self.publish(&topic, payload, QoS::ExactlyOnce).await?;
        info!(device_id = %device_id, command = command.name(), "Command published");
        Ok(())
    }
}
