//! The `protocol` module implements the slice of MQTT 3.1.1 (protocol level 4)
//! a client needs: CONNECT/CONNACK, PUBLISH/PUBACK, SUBSCRIBE/SUBACK,
//! UNSUBSCRIBE, PINGREQ/PINGRESP and DISCONNECT.
//!
//! Packets are decoded incrementally from a `BytesMut` buffer so the same code
//! serves stream transports (TCP, TLS) and message transports (WebSocket).

pub mod codec;
pub mod packet;

pub use packet::{
    ConnAck, Connect, Packet, PacketType, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Keepalive advertised in every CONNECT, in seconds.
pub const KEEP_ALIVE_SECS: u16 = 30;

/// Largest value the remaining-length varint can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Inbound packet size limit used unless a connection configures its own.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;
