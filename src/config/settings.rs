use std::time::Duration;

use serde::Deserialize;

use crate::broker::ExternalConfig;
use crate::broker::external::DEFAULT_PING_INTERVAL;
use crate::protocol::DEFAULT_MAX_PACKET_SIZE;
use crate::router::TopicAclConfig;

/// Top-level configuration for the `topicbus` binary.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log: LogSettings,
    pub external: ExternalSettings,
    pub acl: TopicAclConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
}

/// Connection settings for the external broker client.
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalSettings {
    pub endpoint: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub max_packet_size: usize,
}

impl std::fmt::Debug for ExternalSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSettings")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("clean_session", &self.clean_session)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("ping_interval_ms", &self.ping_interval_ms)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

/// Partial configuration loaded from files or environment.
///
/// Every field is optional; missing values are filled from [`Settings::default`].
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub log: Option<PartialLogSettings>,
    pub external: Option<PartialExternalSettings>,
    pub acl: Option<PartialAclSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialExternalSettings {
    pub endpoint: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub max_packet_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialAclSettings {
    pub enabled: Option<bool>,
    pub allowed_prefixes: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogSettings {
                level: "info".to_string(),
            },
            external: ExternalSettings {
                endpoint: "mqtt://127.0.0.1:1883".to_string(),
                client_id: String::new(),
                username: None,
                password: None,
                clean_session: true,
                connect_timeout_ms: 10_000,
                ping_interval_ms: DEFAULT_PING_INTERVAL.as_millis() as u64,
                max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            },
            acl: TopicAclConfig::default(),
        }
    }
}

impl Settings {
    /// Fills every missing value of `partial` from the defaults.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let log = partial.log;
        let external = partial.external;
        let acl = partial.acl;

        Settings {
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
            external: match external {
                Some(e) => ExternalSettings {
                    endpoint: e.endpoint.unwrap_or(default.external.endpoint),
                    client_id: e.client_id.unwrap_or(default.external.client_id),
                    username: e.username.or(default.external.username),
                    password: e.password.or(default.external.password),
                    clean_session: e.clean_session.unwrap_or(default.external.clean_session),
                    connect_timeout_ms: e
                        .connect_timeout_ms
                        .unwrap_or(default.external.connect_timeout_ms),
                    ping_interval_ms: e
                        .ping_interval_ms
                        .unwrap_or(default.external.ping_interval_ms),
                    max_packet_size: e
                        .max_packet_size
                        .unwrap_or(default.external.max_packet_size),
                },
                None => default.external,
            },
            acl: match acl {
                Some(a) => TopicAclConfig {
                    enabled: a.enabled.unwrap_or(default.acl.enabled),
                    allowed_prefixes: a
                        .allowed_prefixes
                        .unwrap_or(default.acl.allowed_prefixes),
                },
                None => default.acl,
            },
        }
    }

    /// Builds the external client configuration. `client_id` falls back to
    /// the configured one when `None`.
    pub fn external_config(&self, client_id: Option<&str>) -> ExternalConfig {
        let external = &self.external;
        let mut config = ExternalConfig::new(
            external.endpoint.clone(),
            client_id.unwrap_or(&external.client_id),
        )
        .with_clean_session(external.clean_session)
        .with_connect_timeout(Duration::from_millis(external.connect_timeout_ms))
        .with_ping_interval(Duration::from_millis(external.ping_interval_ms))
        .with_max_packet_size(external.max_packet_size);
        if let Some(username) = &external.username {
            config = config.with_credentials(username.clone(), external.password.clone());
        }
        config
    }

    pub fn acl_config(&self) -> TopicAclConfig {
        self.acl.clone()
    }
}
