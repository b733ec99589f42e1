//! Embedded broker
//!
//! Adapts the in-process [`Engine`] to the [`Publisher`], [`Subscriber`] and
//! [`SessionController`] contract. Transport adapters feed it through
//! [`EmbeddedBroker::connect`], [`EmbeddedBroker::subscribe_client`] and
//! [`EmbeddedBroker::inject`]; in-process code uses the trait methods.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::engine::{Engine, EngineHook, Route};
use super::topic::validate_filter;
use super::{Delivery, Message, MessageHandler, Publisher, SessionController, Subscriber};
use crate::client::{Client, ConnectInfo};
use crate::protocol::{Packet, QoS};
use crate::utils::{Error, Result};

#[derive(Clone, Debug)]
pub struct EmbeddedBroker {
    engine: Arc<Mutex<Engine>>,
    next_packet_id: Arc<AtomicU16>,
}

impl Default for EmbeddedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedBroker {
    pub fn new() -> Self {
        Self {
            engine: Arc::new(Mutex::new(Engine::new())),
            next_packet_id: Arc::new(AtomicU16::new(1)),
        }
    }

    fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_hook(&self, hook: Arc<dyn EngineHook>) {
        self.engine().add_hook(hook);
    }

    /// Registers a new client session and returns the receiving side of its
    /// outbound packet channel.
    ///
    /// A session already registered under the same client id is stopped with
    /// [`Error::SessionTakenOver`]. The session is released (subscriptions
    /// dropped, disconnect hooks fired) as soon as the client is stopped,
    /// whoever stops it. Must be called within a tokio runtime.
    pub fn connect(&self, info: ConnectInfo) -> (Arc<Client>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Client::new(info, tx));

        let (previous, hooks) = {
            let mut engine = self.engine();
            let previous = engine.register_client(client.clone());
            (previous, engine.hooks())
        };

        if let Some(previous) = previous {
            previous.stop(Error::SessionTakenOver);
            for hook in &hooks {
                hook.on_disconnect(&previous, previous.stop_cause().as_deref());
            }
        }
        for hook in &hooks {
            hook.on_connect(&client);
        }
        info!(client_id = %client.id, username = client.username(), "client connected");

        let broker = self.clone();
        let watched = client.clone();
        tokio::spawn(async move {
            watched.stopped().await;
            broker.release(&watched);
        });

        (client, rx)
    }

    /// Stops and releases a client session; returns `false` for unknown ids.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let Some(client) = self.client(client_id) else {
            return false;
        };
        client.stop(Error::ConnectionClosed);
        self.release(&client);
        true
    }

    /// Removes `client` from the registry if it is still the registered
    /// session for its id, and fires the disconnect hooks once.
    fn release(&self, client: &Arc<Client>) {
        let hooks = {
            let mut engine = self.engine();
            match engine.clients.get(&client.id) {
                Some(current) if Arc::ptr_eq(current, client) => {
                    engine.cleanup_client(&client.id);
                    engine.hooks()
                }
                _ => return,
            }
        };

        let cause = client.stop_cause();
        for hook in &hooks {
            hook.on_disconnect(client, cause.as_deref());
        }
        info!(client_id = %client.id, "client disconnected");
    }

    pub fn client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.engine().client(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.engine().clients.len()
    }

    pub fn subscribe_client(&self, client_id: &str, filter: &str, qos: QoS) -> Result<()> {
        validate_filter(filter)?;
        let mut engine = self.engine();
        if !engine.clients.contains_key(client_id) {
            return Err(Error::ClientNotFound(client_id.to_string()));
        }
        engine.subscribe(filter, client_id.to_string(), qos);
        debug!(client_id, filter, "client subscribed");
        Ok(())
    }

    pub fn unsubscribe_client(&self, client_id: &str, filter: &str) {
        self.engine().unsubscribe(filter, &client_id.to_string());
    }

    /// Routes a PUBLISH received from `client`. Inline handlers see `client`
    /// as the sender.
    pub async fn inject(&self, client: &Arc<Client>, message: Message) -> Result<()> {
        if client.is_stopped() {
            return Err(Error::ConnectionClosed);
        }
        self.route(message, Some(client.clone())).await;
        Ok(())
    }

    async fn route(&self, message: Message, origin: Option<Arc<Client>>) {
        let Route { clients, handlers } = self.engine().route(&message);

        for (client, qos) in clients {
            let packet_id = (qos > QoS::AtMostOnce).then(|| self.packet_id());
            let publish = message.clone().with_qos(qos).into_publish(packet_id);
            if let Err(e) = client.deliver(Packet::Publish(publish)) {
                warn!(client_id = %client.id, topic = %message.topic, error = %e, "failed to deliver message");
            }
        }

        for (subscription, handler) in handlers {
            handler(Delivery {
                client: origin.clone(),
                subscription,
                message: message.clone(),
            })
            .await;
        }
    }

    fn packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

#[async_trait]
impl Publisher for EmbeddedBroker {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool, qos: QoS) -> Result<()> {
        let message = Message::new(topic, payload).with_qos(qos).with_retain(retain);
        self.route(message, None).await;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for EmbeddedBroker {
    async fn subscribe(&self, filter: &str, subscription_id: u64, handler: MessageHandler) -> Result<()> {
        validate_filter(filter)?;
        self.engine().add_inline(filter, subscription_id, handler);
        debug!(filter, subscription_id, "inline subscription added");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, subscription_id: u64) -> Result<()> {
        if self.engine().remove_inline(filter, subscription_id) {
            debug!(filter, subscription_id, "inline subscription removed");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionController for EmbeddedBroker {
    async fn disconnect_client(&self, client_id: &str, reason: &str) -> Result<()> {
        let client = self
            .client(client_id)
            .ok_or_else(|| Error::ClientNotFound(client_id.to_string()))?;
        client.stop(Error::SessionDisconnected {
            reason: reason.to_string(),
        });
        self.release(&client);
        Ok(())
    }
}
