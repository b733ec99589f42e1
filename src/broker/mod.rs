//! The `broker` module defines the publish/subscribe contract shared by the
//! two broker flavours and contains both of them:
//!
//! - `embedded`: an in-process broker built on the routing `engine`.
//! - `external`: an MQTT client bridging to a third-party broker.
//!
//! Anything that implements [`Publisher`] and [`Subscriber`] is a [`Broker`];
//! [`SessionController`] is the optional capability to kick a client.

pub mod embedded;
pub mod engine;
pub mod external;
pub mod message;
pub mod topic;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::client::Client;
use crate::protocol::QoS;
use crate::utils::Result;

pub use embedded::EmbeddedBroker;
pub use engine::{Engine, EngineHook};
pub use external::{ExternalBroker, ExternalConfig};
pub use message::Message;
pub use topic::{matches, validate_filter};

/// A filter registered under a subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub filter: String,
    pub id: u64,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, id: u64) -> Self {
        Self {
            filter: filter.into(),
            id,
        }
    }
}

/// One message handed to an inline subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The client the message came from, if the broker knows one.
    pub client: Option<Arc<Client>>,
    pub subscription: Subscription,
    pub message: Message,
}

/// Inline subscription callback. Brokers await it before delivering the next
/// message from the same source.
pub type MessageHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |delivery: Delivery| -> BoxFuture<'static, ()> {
        Box::pin(f(delivery))
    })
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool, qos: QoS) -> Result<()>;
}

/// JSON and string helpers available on every [`Publisher`].
#[async_trait]
pub trait PublisherExt: Publisher {
    async fn publish_json<T>(&self, topic: &str, value: &T, retain: bool, qos: QoS) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, Bytes::from(payload), retain, qos).await
    }

    async fn publish_string(&self, topic: &str, payload: &str, retain: bool, qos: QoS) -> Result<()> {
        self.publish(topic, Bytes::copy_from_slice(payload.as_bytes()), retain, qos)
            .await
    }
}

impl<P: Publisher + ?Sized> PublisherExt for P {}

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, filter: &str, subscription_id: u64, handler: MessageHandler)
    -> Result<()>;

    async fn unsubscribe(&self, filter: &str, subscription_id: u64) -> Result<()>;
}

pub trait Broker: Publisher + Subscriber {}

impl<T: Publisher + Subscriber + ?Sized> Broker for T {}

/// Capability to forcibly end another client's session.
///
/// Implementations that cannot do this return
/// [`Error::SessionControlUnsupported`](crate::utils::Error::SessionControlUnsupported).
#[async_trait]
pub trait SessionController: Send + Sync {
    async fn disconnect_client(&self, client_id: &str, reason: &str) -> Result<()>;
}
