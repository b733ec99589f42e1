//! # topicbus
//!
//! `topicbus` is topic-based publish/subscribe messaging over MQTT. Handlers
//! can run against an in-process embedded broker or against a third-party
//! MQTT broker reached over TCP, TLS or WebSocket.
//!
//! ## Core Modules
//!
//! - `broker`: the broker roles (publisher, subscriber, session control), the
//!   topic matcher, the in-process engine and the external MQTT client.
//! - `client`: a connection handle as seen by the engine.
//! - `config`: layered configuration loading.
//! - `protocol`: the MQTT 3.1.1 packet codec.
//! - `router`: the managed topic registrar, per-message [`router::Ctx`] and
//!   middleware.
//! - `session`: identity and connect-context stores fed by engine hooks.
//! - `transport`: endpoint parsing and TCP/TLS/WebSocket connections.
//! - `utils`: the crate error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;
