//! The `error` module defines the error type shared by every layer of `topicbus`.
//!
//! Lower layers (codec, transport) surface raw errors; the external client
//! decides which of them mean "connection lost"; the topic registrar turns
//! handler failures into log lines.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    // connectivity
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no PINGRESP within {0:?}")]
    KeepaliveTimeout(Duration),

    #[error("connection refused by broker (return code {0})")]
    ConnectionRefused(u8),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("external broker not connected")]
    ExternalBrokerNotConnected,

    // protocol
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // session control
    #[error("session control not supported")]
    SessionControlUnsupported,

    #[error("client {0} not found")]
    ClientNotFound(String),

    #[error("session disconnected: {reason}")]
    SessionDisconnected { reason: String },

    #[error("session taken over by a new connection")]
    SessionTakenOver,

    // topic registration
    #[error("invalid topic registration arguments: {0}")]
    InvalidTopicRegistrationArgs(String),

    #[error("topic registrar stopped")]
    TopicRegistrarStopped,

    #[error("topic {0} not allowed")]
    TopicNotAllowed(String),

    // ctx
    #[error("topic ctx has no publisher")]
    TopicCtxNoPublisher,

    #[error("topic ctx has no client")]
    TopicCtxNoClient,

    #[error("topic ctx session control not supported")]
    TopicCtxSessionControlUnsupported,

    #[error("client disconnected by handler")]
    TopicClientDisconnectedByHandler,

    #[error("client rejected by handler: {reason}")]
    TopicClientRejectedByHandler { reason: String },

    // handlers
    #[error("topic handler timed out after {0:?}")]
    TopicHandlerTimeout(Duration),

    #[error("topic handler panicked: {0}")]
    TopicHandlerPanic(String),

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("{} errors: {}", .0.len(), join(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Collapses a list of errors: none is `Ok`, one is itself, more is `Multiple`.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_collapses_single_error() {
        assert!(Error::aggregate(Vec::new()).is_ok());
        assert!(matches!(
            Error::aggregate(vec![Error::ConnectionClosed]),
            Err(Error::ConnectionClosed)
        ));
        let err = Error::aggregate(vec![Error::ConnectionClosed, Error::Canceled]).unwrap_err();
        assert_eq!(err.to_string(), "2 errors: connection closed; context canceled");
    }
}
