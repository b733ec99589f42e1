//! External broker client
//!
//! A hand-written MQTT 3.1.1 client that bridges the [`Publisher`] /
//! [`Subscriber`] contract to a third-party broker over TCP, TLS or
//! WebSocket.
//!
//! The handler map (filter -> subscription id -> handler) is the source of
//! truth for subscriptions: every (re)connect sends one SUBSCRIBE per filter
//! in it. Inbound PUBLISH packets are dispatched on the read-loop task, in
//! order, so a slow handler slows down the connection it runs on.
//!
//! Connection state lives behind one `std::sync::Mutex` that is never held
//! across an `.await`; the writer half sits behind its own `tokio::sync::Mutex`.
//! Every established connection gets a generation number so that a stale
//! read loop cannot tear down its successor.

mod config;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, trace, warn};

use super::topic::{matches, validate_filter};
use super::{Delivery, Message, MessageHandler, Publisher, SessionController, Subscriber, Subscription};
use crate::client::{Client, ConnectInfo};
use crate::protocol::{Connect, KEEP_ALIVE_SECS, Packet, Publish, QoS, Subscribe, Unsubscribe};
use crate::transport::{self, ConnWriter, Endpoint, PacketReader};
use crate::utils::{Error, Result};

pub use config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PING_INTERVAL, ExternalConfig};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CLOSING_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Clone)]
pub struct ExternalBroker {
    inner: Arc<Inner>,
}

struct Inner {
    config: ExternalConfig,
    endpoint: Endpoint,
    client: Arc<Client>,
    state: Mutex<State>,
    writer: tokio::sync::Mutex<Option<(u64, ConnWriter)>>,
    next_packet_id: AtomicU16,
}

#[derive(Default)]
struct State {
    started: bool,
    connected: bool,
    closing: bool,
    reconnecting: bool,
    generation: u64,
    read_task: Option<JoinHandle<()>>,
    handlers: BTreeMap<String, BTreeMap<u64, MessageHandler>>,
}

impl ExternalBroker {
    /// Validates `config`. No connection is made until [`ExternalBroker::start`].
    pub fn new(config: ExternalConfig) -> Result<Self> {
        let endpoint = config.validate()?;

        let mut info = ConnectInfo::new(config.client_id.clone());
        info.username = config.username.clone();
        info.clean_session = config.clean_session;
        info.keep_alive = KEEP_ALIVE_SECS;
        info.remote_addr = Some(endpoint.to_string());

        Ok(Self {
            inner: Arc::new(Inner {
                client: Arc::new(Client::synthetic(info)),
                config,
                endpoint,
                state: Mutex::new(State::default()),
                writer: tokio::sync::Mutex::new(None),
                next_packet_id: AtomicU16::new(1),
            }),
        })
    }

    pub fn config(&self) -> &ExternalConfig {
        &self.inner.config
    }

    /// The client handlers see as the sender of inbound messages.
    pub fn client(&self) -> Arc<Client> {
        self.inner.client.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        let state = self.state();
        if state.connected {
            ConnectionState::Connected
        } else if state.closing {
            ConnectionState::Closed
        } else if state.reconnecting {
            ConnectionState::Reconnecting
        } else if state.started {
            ConnectionState::Closed
        } else {
            ConnectionState::Idle
        }
    }

    /// Connects, then subscribes every registered filter. A no-op when
    /// already connected.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.closing = false;
            state.started = true;
            if state.connected {
                return Ok(());
            }
        }

        self.connect_once().await?;
        if let Err(e) = self.resubscribe_all().await {
            self.drop_connection().await;
            return Err(e);
        }

        info!(
            endpoint = %self.inner.endpoint,
            client_id = %self.inner.config.client_id,
            "connected to external broker"
        );
        Ok(())
    }

    /// Sends DISCONNECT (best effort) and closes the connection. Stops any
    /// reconnect attempt. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let read_task = {
            let mut state = self.state();
            state.closing = true;
            state.connected = false;
            state.generation += 1;
            state.read_task.take()
        };

        if let Some((_, mut writer)) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.send(&Packet::Disconnect).await {
                debug!(error = %e, "failed to send DISCONNECT");
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "failed to close connection");
            }
            info!(endpoint = %self.inner.endpoint, "disconnected from external broker");
        }

        if let Some(task) = read_task {
            task.abort();
        }
        Ok(())
    }

    async fn handshake(&self) -> Result<(PacketReader, ConnWriter)> {
        let timeout = self.inner.config.connect_timeout;
        tokio::time::timeout(timeout, self.open_session())
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))?
    }

    /// Opens the transport, sends CONNECT and waits for an accepting CONNACK.
    async fn open_session(&self) -> Result<(PacketReader, ConnWriter)> {
        let config = &self.inner.config;
        let (reader, mut writer) =
            transport::connect(&self.inner.endpoint, config.tls_config.clone()).await?;

        writer
            .send(&Packet::Connect(Connect {
                client_id: config.client_id.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
                clean_session: config.clean_session,
                keep_alive: KEEP_ALIVE_SECS,
            }))
            .await?;

        let mut reader = PacketReader::new(reader).with_max_packet_size(config.max_packet_size);
        match reader.next().await? {
            Packet::ConnAck(ack) if ack.return_code == 0 => Ok((reader, writer)),
            Packet::ConnAck(ack) => Err(Error::ConnectionRefused(ack.return_code)),
            other => Err(Error::UnexpectedPacket(format!(
                "expected CONNACK, got {}",
                other.name()
            ))),
        }
    }

    /// Opens a new connection and installs it. Fails with
    /// [`Error::ConnectionClosed`] if `stop` (or another connect) ran while the
    /// handshake was in flight; the new connection is closed in that case.
    async fn connect_once(&self) -> Result<()> {
        let expected = {
            let state = self.state();
            if state.closing {
                return Err(Error::ConnectionClosed);
            }
            state.generation
        };

        let (reader, mut writer) = self.handshake().await?;

        let generation = {
            let mut slot = self.inner.writer.lock().await;
            let generation = {
                let mut state = self.state();
                if state.closing || state.generation != expected {
                    None
                } else {
                    state.generation += 1;
                    state.connected = true;
                    Some(state.generation)
                }
            };
            match generation {
                Some(generation) => {
                    *slot = Some((generation, writer));
                    generation
                }
                None => {
                    drop(slot);
                    if let Err(e) = writer.shutdown().await {
                        debug!(error = %e, "failed to close superseded connection");
                    }
                    return Err(Error::ConnectionClosed);
                }
            }
        };

        let task = tokio::spawn(self.clone().read_loop(generation, reader));

        let mut state = self.state();
        if state.generation != generation {
            task.abort();
            return Err(Error::ConnectionClosed);
        }
        if let Some(previous) = state.read_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn resubscribe_all(&self) -> Result<()> {
        let filters: Vec<String> = self.state().handlers.keys().cloned().collect();
        for filter in filters {
            self.send_subscribe(&filter).await?;
        }
        Ok(())
    }

    async fn send_subscribe(&self, filter: &str) -> Result<()> {
        let packet = Packet::Subscribe(Subscribe {
            packet_id: self.packet_id(),
            filters: vec![(filter.to_string(), QoS::AtLeastOnce)],
        });
        self.send(&packet).await?;
        debug!(filter, "subscribed on external broker");
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some((_, writer)) => writer.send(packet).await,
            None => Err(Error::ExternalBrokerNotConnected),
        }
    }

    fn packet_id(&self) -> u16 {
        loop {
            let id = self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn read_loop(self, generation: u64, mut reader: PacketReader) {
        let period = self.inner.config.ping_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        let mut awaiting_pong = false;

        let err = loop {
            tokio::select! {
                packet = reader.next() => {
                    let result = match packet {
                        Ok(Packet::PingResp) => {
                            awaiting_pong = false;
                            Ok(())
                        }
                        Ok(packet) => self.handle_packet(packet).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        break e;
                    }
                }
                _ = keepalive.tick() => {
                    if awaiting_pong {
                        break Error::KeepaliveTimeout(period);
                    }
                    if let Err(e) = self.send(&Packet::PingReq).await {
                        break e;
                    }
                    awaiting_pong = true;
                }
            }
        };

        self.connection_lost(generation, err).await;
    }

    async fn handle_packet(&self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => {
                let ack = match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => Some(packet_id),
                    _ => None,
                };
                self.dispatch(Message::from(publish)).await;
                if let Some(packet_id) = ack {
                    self.send(&Packet::PubAck { packet_id }).await?;
                }
            }
            Packet::PingReq => self.send(&Packet::PingResp).await?,
            Packet::SubAck(ack) if ack.has_failure() => {
                warn!(
                    packet_id = ack.packet_id,
                    return_codes = ?ack.return_codes,
                    "external broker refused subscription"
                );
            }
            Packet::Disconnect => return Err(Error::ConnectionClosed),
            other => trace!(packet = other.name(), "ignoring packet"),
        }
        Ok(())
    }

    async fn dispatch(&self, message: Message) {
        let handlers: Vec<(Subscription, MessageHandler)> = self
            .state()
            .handlers
            .iter()
            .filter(|(filter, _)| matches(&message.topic, filter))
            .flat_map(|(filter, handlers)| {
                handlers
                    .iter()
                    .map(move |(id, h)| (Subscription::new(filter.clone(), *id), h.clone()))
            })
            .collect();

        for (subscription, handler) in handlers {
            handler(Delivery {
                client: Some(self.inner.client.clone()),
                subscription,
                message: message.clone(),
            })
            .await;
        }
    }

    async fn connection_lost(&self, generation: u64, err: Error) {
        let reconnect = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.connected = false;
            state.read_task = None;
            let reconnect = !state.closing && !state.reconnecting;
            if reconnect {
                state.reconnecting = true;
            }
            reconnect
        };

        {
            let mut writer = self.inner.writer.lock().await;
            if matches!(writer.as_ref(), Some((g, _)) if *g == generation) {
                if let Some((_, mut writer)) = writer.take() {
                    let _ = writer.shutdown().await;
                }
            }
        }

        warn!(endpoint = %self.inner.endpoint, error = %err, "external broker connection lost");
        if reconnect {
            tokio::spawn(self.clone().reconnect_loop());
        }
    }

    /// Boxed so the read loop, which spawns it, and `connect_once`, which it
    /// calls, do not form a cycle of opaque future types.
    fn reconnect_loop(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut delay = INITIAL_BACKOFF;
            loop {
                if !self.sleep_unless_closing(delay).await {
                    break;
                }

                if let Err(e) = self.connect_once().await {
                    warn!(endpoint = %self.inner.endpoint, error = %e, ?delay, "reconnect failed");
                    delay = (delay * 2).min(MAX_BACKOFF);
                    continue;
                }

                if self.state().closing {
                    self.drop_connection().await;
                    break;
                }

                if let Err(e) = self.resubscribe_all().await {
                    warn!(endpoint = %self.inner.endpoint, error = %e, "resubscribe after reconnect failed");
                    self.drop_connection().await;
                    continue;
                }

                let mut state = self.state();
                if state.connected || state.closing {
                    state.reconnecting = false;
                    drop(state);
                    info!(endpoint = %self.inner.endpoint, "reconnected to external broker");
                    return;
                }
            }
            self.state().reconnecting = false;
        })
    }

    /// Sleeps for `delay`, waking early if the client is being stopped.
    /// Returns `false` when it should give up.
    async fn sleep_unless_closing(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.state().closing {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(CLOSING_POLL.min(deadline - now)).await;
        }
    }

    async fn drop_connection(&self) {
        let read_task = {
            let mut state = self.state();
            state.generation += 1;
            state.connected = false;
            state.read_task.take()
        };
        if let Some(task) = read_task {
            task.abort();
        }
        if let Some((_, mut writer)) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn remove_handler(&self, filter: &str, subscription_id: u64) -> bool {
        let mut state = self.state();
        let Some(handlers) = state.handlers.get_mut(filter) else {
            return false;
        };
        handlers.remove(&subscription_id);
        if handlers.is_empty() {
            state.handlers.remove(filter);
            return true;
        }
        false
    }
}

impl std::fmt::Debug for ExternalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBroker")
            .field("endpoint", &self.inner.endpoint)
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.connection_state())
            .finish()
    }
}

#[async_trait]
impl Publisher for ExternalBroker {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool, qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ExternalBrokerNotConnected);
        }
        let packet_id = (qos > QoS::AtMostOnce).then(|| self.packet_id());
        self.send(&Packet::Publish(Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            dup: false,
            packet_id,
        }))
        .await
    }
}

#[async_trait]
impl Subscriber for ExternalBroker {
    async fn subscribe(&self, filter: &str, subscription_id: u64, handler: MessageHandler) -> Result<()> {
        validate_filter(filter)?;

        let live = {
            let mut state = self.state();
            let handlers = state.handlers.entry(filter.to_string()).or_default();
            let first = handlers.is_empty();
            handlers.insert(subscription_id, handler);
            first && state.connected
        };

        if live {
            if let Err(e) = self.send_subscribe(filter).await {
                self.remove_handler(filter, subscription_id);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, subscription_id: u64) -> Result<()> {
        let last = self.remove_handler(filter, subscription_id);
        if !last || !self.is_connected() {
            return Ok(());
        }

        self.send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: self.packet_id(),
            filters: vec![filter.to_string()],
        }))
        .await?;
        debug!(filter, "unsubscribed on external broker");
        Ok(())
    }
}

#[async_trait]
impl SessionController for ExternalBroker {
    async fn disconnect_client(&self, _client_id: &str, _reason: &str) -> Result<()> {
        Err(Error::SessionControlUnsupported)
    }
}
