//! The `client` module defines the representation of an MQTT client session.
//!
//! A [`Client`] carries the identity the client presented in CONNECT, the
//! channel used to push packets to it, and a stop switch that records why the
//! session ended so the cause is observable by tests and logs.

pub mod pubsub_client;
pub use pubsub_client::{Client, ConnectInfo};
