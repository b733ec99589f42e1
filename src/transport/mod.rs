//! The `transport` module opens the byte pipe an MQTT client talks over.
//!
//! Endpoints are parsed from URLs (`mqtt://`, `tcp://`, `mqtts://`, `ssl://`,
//! `tls://`, `ws://`, `wss://`, or a bare `host:port`). Stream transports
//! (TCP, TLS) and the WebSocket transport, where MQTT packets travel in
//! binary frames, are both exposed as a [`ConnReader`]/[`ConnWriter`] pair so
//! the client never needs to know which one it is using.

pub mod conn;
pub mod endpoint;
pub mod websocket;

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

use crate::utils::{Error, Result};

pub use conn::{ConnReader, ConnWriter, PacketReader};
pub use endpoint::Endpoint;

/// Opens a connection to `endpoint`. `tls` overrides the default
/// webpki-roots client configuration for TLS and `wss` endpoints.
pub async fn connect(
    endpoint: &Endpoint,
    tls: Option<Arc<ClientConfig>>,
) -> Result<(ConnReader, ConnWriter)> {
    match endpoint {
        Endpoint::Tcp { host, port } => conn::connect_tcp(host, *port).await,
        Endpoint::Tls { host, port } => {
            let tls = match tls {
                Some(tls) => tls,
                None => default_tls_config()?,
            };
            conn::connect_tls(host, *port, tls).await
        }
        Endpoint::WebSocket { url } => {
            let tls = match (url.scheme(), tls) {
                ("wss", Some(tls)) => Some(tls),
                ("wss", None) => Some(default_tls_config()?),
                _ => None,
            };
            websocket::connect(url, tls).await
        }
    }
}

/// Client TLS configuration trusting the Mozilla root set.
pub fn default_tls_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
