use std::fmt;

use url::Url;

use crate::utils::{Error, Result};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// A parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16 },
    WebSocket { url: Url },
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::InvalidConfig("endpoint is required".to_string()));
        }

        if !endpoint.contains("://") {
            let (host, port) = split_host_port(endpoint)?;
            return Ok(Endpoint::Tcp {
                host,
                port: port.unwrap_or(DEFAULT_PORT),
            });
        }

        let url = Url::parse(endpoint)?;
        match url.scheme() {
            "ws" | "wss" => Ok(Endpoint::WebSocket { url }),
            "mqtt" | "tcp" => Ok(Endpoint::Tcp {
                host: host_of(&url)?,
                port: url.port().unwrap_or(DEFAULT_PORT),
            }),
            "mqtts" | "ssl" | "tls" => Ok(Endpoint::Tls {
                host: host_of(&url)?,
                port: url.port().unwrap_or(DEFAULT_TLS_PORT),
            }),
            other => Err(Error::InvalidEndpoint(format!(
                "unsupported scheme {other:?} in {endpoint}"
            ))),
        }
    }

    pub fn is_secure(&self) -> bool {
        match self {
            Endpoint::Tcp { .. } => false,
            Endpoint::Tls { .. } => true,
            Endpoint::WebSocket { url } => url.scheme() == "wss",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "mqtt://{host}:{port}"),
            Endpoint::Tls { host, port } => write!(f, "mqtts://{host}:{port}"),
            Endpoint::WebSocket { url } => write!(f, "{url}"),
        }
    }
}

fn host_of(url: &Url) -> Result<String> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| Error::InvalidEndpoint(format!("{url} has no host")))
}

fn split_host_port(endpoint: &str) -> Result<(String, Option<u16>)> {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
            let port = port
                .parse()
                .map_err(|_| Error::InvalidEndpoint(format!("invalid port in {endpoint}")))?;
            Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), Some(port)))
        }
        _ => Ok((endpoint.to_string(), None)),
    }
}
