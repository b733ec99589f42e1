use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broker::{Delivery, Message, Publisher, PublisherExt, SessionController, Subscription};
use crate::client::Client;
use crate::protocol::QoS;
use crate::session::{ClientIdentity, ConnectContext, IdentityStore};
use crate::utils::{Error, Result};

const DEFAULT_DISCONNECT_REASON: &str = "disconnected by handler";

/// Cancellation scope a handler runs under, with an optional deadline.
///
/// Derived contexts are cancelled with their parent and never outlive its
/// deadline. Cancellation is cooperative: handlers observe it through
/// [`TopicContext::done`] or [`TopicContext::err`].
#[derive(Debug, Clone)]
pub struct TopicContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for TopicContext {
    fn default() -> Self {
        Self::background()
    }
}

impl TopicContext {
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<Error> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Error::DeadlineExceeded)
        } else if self.token.is_cancelled() {
            Some(Error::Canceled)
        } else {
            None
        }
    }
}

/// Everything a topic handler gets for one inbound message.
///
/// A `Ctx` is built per delivery and is cheap to clone. Middleware may
/// attach data to it (identity, connect context, a bounded
/// [`TopicContext`]) before passing it on.
#[derive(Clone)]
pub struct Ctx {
    client: Option<Arc<Client>>,
    subscription: Subscription,
    message: Message,
    publisher: Option<Arc<dyn Publisher>>,
    session: Option<Arc<dyn SessionController>>,
    identities: Option<Arc<IdentityStore>>,
    context: TopicContext,
    identity: Option<Arc<ClientIdentity>>,
    connect_context: Option<Arc<ConnectContext>>,
}

impl Ctx {
    pub fn new(subscription: Subscription, message: Message) -> Self {
        Self {
            client: None,
            subscription,
            message,
            publisher: None,
            session: None,
            identities: None,
            context: TopicContext::background(),
            identity: None,
            connect_context: None,
        }
    }

    pub fn from_delivery(delivery: Delivery) -> Self {
        let mut ctx = Self::new(delivery.subscription, delivery.message);
        ctx.client = delivery.client;
        ctx
    }

    pub fn with_client(mut self, client: Arc<Client>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_publisher(mut self, publisher: Option<Arc<dyn Publisher>>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_session_controller(mut self, session: Option<Arc<dyn SessionController>>) -> Self {
        self.session = session;
        self
    }

    pub fn with_identities(mut self, identities: Option<Arc<IdentityStore>>) -> Self {
        self.identities = identities;
        self
    }

    pub fn client(&self) -> Option<&Arc<Client>> {
        self.client.as_ref()
    }

    fn stored_identity(&self) -> Option<Arc<ClientIdentity>> {
        if let Some(identity) = &self.identity {
            return Some(identity.clone());
        }
        let client = self.client.as_ref()?;
        self.identities.as_ref()?.get(&client.id)
    }

    /// The sender's client id, preferring the resolved identity.
    pub fn client_id(&self) -> Option<String> {
        match self.stored_identity() {
            Some(identity) => Some(identity.client_id.clone()),
            None => self.client.as_ref().map(|c| c.id.clone()),
        }
    }

    /// The sender's username, preferring the resolved identity.
    pub fn username(&self) -> Option<String> {
        match self.stored_identity() {
            Some(identity) => Some(identity.username.clone()),
            None => self.client.as_ref().map(|c| c.username().to_string()),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn filter(&self) -> &str {
        &self.subscription.filter
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.message.payload)?)
    }

    fn publisher(&self) -> Result<&Arc<dyn Publisher>> {
        self.publisher.as_ref().ok_or(Error::TopicCtxNoPublisher)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        retain: bool,
        qos: QoS,
    ) -> Result<()> {
        self.publisher()?
            .publish(topic, payload.into(), retain, qos)
            .await
    }

    pub async fn publish_json<T>(&self, topic: &str, value: &T, retain: bool, qos: QoS) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publisher()?.publish_json(topic, value, retain, qos).await
    }

    pub async fn publish_string(&self, topic: &str, payload: &str, retain: bool, qos: QoS) -> Result<()> {
        self.publisher()?
            .publish_string(topic, payload, retain, qos)
            .await
    }

    pub fn context(&self) -> &TopicContext {
        &self.context
    }

    pub fn set_context(&mut self, context: TopicContext) {
        self.context = context;
    }

    pub async fn done(&self) {
        self.context.done().await
    }

    pub fn err(&self) -> Option<Error> {
        self.context.err()
    }

    pub fn identity(&self) -> Option<&Arc<ClientIdentity>> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: Arc<ClientIdentity>) {
        self.identity = Some(identity);
    }

    pub fn connect_context(&self) -> Option<&Arc<ConnectContext>> {
        self.connect_context.as_ref()
    }

    pub fn set_connect_context(&mut self, context: Arc<ConnectContext>) {
        self.connect_context = Some(context);
    }

    /// Ends the sender's session.
    pub async fn disconnect(&self) -> Result<()> {
        self.end_session(
            DEFAULT_DISCONNECT_REASON,
            Error::TopicClientDisconnectedByHandler,
        )
        .await
    }

    /// Ends the sender's session, recording `reason`.
    pub async fn reject(&self, reason: &str) -> Result<()> {
        self.end_session(
            reason,
            Error::TopicClientRejectedByHandler {
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn end_session(&self, reason: &str, cause: Error) -> Result<()> {
        let client = self.client.as_ref().ok_or(Error::TopicCtxNoClient)?;
        match &self.session {
            Some(session) => session
                .disconnect_client(&client.id, reason)
                .await
                .map_err(|e| match e {
                    Error::SessionControlUnsupported => Error::TopicCtxSessionControlUnsupported,
                    other => other,
                }),
            None => {
                client.stop(cause);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("client_id", &self.client.as_ref().map(|c| &c.id))
            .field("subscription", &self.subscription)
            .field("topic", &self.message.topic)
            .field("payload_len", &self.message.payload.len())
            .field("has_publisher", &self.publisher.is_some())
            .field("has_session_controller", &self.session.is_some())
            .finish()
    }
}
