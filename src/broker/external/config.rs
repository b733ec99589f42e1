use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{DEFAULT_MAX_PACKET_SIZE, KEEP_ALIVE_SECS};
use crate::transport::Endpoint;
use crate::utils::{Error, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Half the keepalive advertised in CONNECT.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(KEEP_ALIVE_SECS as u64 / 2);
const KEEP_ALIVE: Duration = Duration::from_secs(KEEP_ALIVE_SECS as u64);

/// Connection settings for [`ExternalBroker`](super::ExternalBroker).
#[derive(Clone)]
pub struct ExternalConfig {
    pub endpoint: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    /// PINGREQ goes out this often while connected; a PINGRESP must arrive
    /// before the next one is due.
    pub ping_interval: Duration,
    /// Largest inbound packet accepted, fixed header included.
    pub max_packet_size: usize,
    /// Overrides the webpki-roots configuration for TLS and `wss` endpoints.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl ExternalConfig {
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            clean_session: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            tls_config: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_tls_config(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls);
        self
    }

    /// Checks required fields and parses the endpoint.
    pub fn validate(&self) -> Result<Endpoint> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "external broker endpoint is required".to_string(),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "external broker client id is required".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        if self.ping_interval.is_zero() || self.ping_interval > KEEP_ALIVE {
            return Err(Error::InvalidConfig(format!(
                "ping interval must be greater than zero and at most {KEEP_ALIVE:?}"
            )));
        }
        if self.max_packet_size == 0 {
            return Err(Error::InvalidConfig(
                "max packet size must be greater than zero".to_string(),
            ));
        }
        Endpoint::parse(&self.endpoint)
    }
}

impl fmt::Debug for ExternalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalConfig")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("clean_session", &self.clean_session)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("max_packet_size", &self.max_packet_size)
            .field("tls_config", &self.tls_config.is_some())
            .finish()
    }
}
