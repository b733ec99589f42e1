use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{Connect, Packet};
use crate::utils::{Error, Result};

/// What a client presented when it connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub remote_addr: Option<String>,
}

impl ConnectInfo {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            ..Default::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

impl From<Connect> for ConnectInfo {
    fn from(connect: Connect) -> Self {
        Self {
            client_id: connect.client_id,
            username: connect.username,
            password: connect.password,
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
            remote_addr: None,
        }
    }
}

/// A connected client session.
///
/// Synthetic clients (see [`Client::synthetic`]) have no outbound channel;
/// they stand in for "whoever sent this" when messages arrive from a remote
/// broker.
#[derive(Debug)]
pub struct Client {
    pub id: String,
    pub connect: ConnectInfo,
    sender: Option<UnboundedSender<Packet>>,
    stop_cause: Mutex<Option<Arc<Error>>>,
    stopped: CancellationToken,
}

impl Client {
    /// Create a client with an outbound packet channel. An empty client id
    /// is replaced by a generated UUID.
    pub fn new(connect: ConnectInfo, sender: UnboundedSender<Packet>) -> Self {
        Self::build(connect, Some(sender))
    }

    pub fn synthetic(connect: ConnectInfo) -> Self {
        Self::build(connect, None)
    }

    fn build(mut connect: ConnectInfo, sender: Option<UnboundedSender<Packet>>) -> Self {
        if connect.client_id.is_empty() {
            connect.client_id = Uuid::new_v4().to_string();
        }
        Self {
            id: connect.client_id.clone(),
            connect,
            sender,
            stop_cause: Mutex::new(None),
            stopped: CancellationToken::new(),
        }
    }

    pub fn username(&self) -> &str {
        self.connect.username.as_deref().unwrap_or_default()
    }

    pub fn is_synthetic(&self) -> bool {
        self.sender.is_none()
    }

    /// Queue a packet for this client.
    pub fn deliver(&self, packet: Packet) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ConnectionClosed);
        }
        let Some(sender) = &self.sender else {
            return Err(Error::TopicCtxNoClient);
        };
        sender.send(packet).map_err(|_| Error::ConnectionClosed)
    }

    /// Stop the session, recording `cause`. Only the first cause is kept;
    /// returns `false` if the client was already stopped.
    pub fn stop(&self, cause: Error) -> bool {
        let mut slot = self
            .stop_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return false;
        }
        tracing::debug!(client_id = %self.id, cause = %cause, "stopping client");
        *slot = Some(Arc::new(cause));
        drop(slot);
        self.stopped.cancel();
        true
    }

    pub fn stop_cause(&self) -> Option<Arc<Error>> {
        self.stop_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once [`Client::stop`] has been called.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }
}
