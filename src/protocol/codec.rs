//! Byte-level encoding and decoding of [`Packet`]s.
//!
//! Every packet is a fixed header (type nibble + flags nibble, then the
//! remaining length as a 1-4 byte varint) followed by the packet body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{
    ConnAck, Connect, Packet, PacketType, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};
use super::{DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH, PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::utils::{Error, Result};

const CONNECT_CLEAN_SESSION: u8 = 0x02;
const CONNECT_WILL: u8 = 0x04;
const CONNECT_WILL_QOS: u8 = 0x18;
const CONNECT_WILL_RETAIN: u8 = 0x20;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_USERNAME: u8 = 0x80;

impl Packet {
    /// Appends the wire form of this packet to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let first_byte = match self {
            Packet::Connect(connect) => {
                encode_connect(connect, &mut body)?;
                (PacketType::Connect as u8) << 4
            }
            Packet::ConnAck(ack) => {
                body.put_u8(u8::from(ack.session_present));
                body.put_u8(ack.return_code);
                (PacketType::ConnAck as u8) << 4
            }
            Packet::Publish(publish) => {
                write_string(&publish.topic, &mut body)?;
                if publish.qos > QoS::AtMostOnce {
                    let packet_id = publish.packet_id.ok_or_else(|| {
                        Error::MalformedPacket("publish with qos > 0 needs a packet id".into())
                    })?;
                    body.put_u16(packet_id);
                }
                body.extend_from_slice(&publish.payload);
                ((PacketType::Publish as u8) << 4)
                    | (u8::from(publish.dup) << 3)
                    | ((publish.qos as u8) << 1)
                    | u8::from(publish.retain)
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                (PacketType::PubAck as u8) << 4
            }
            Packet::Subscribe(subscribe) => {
                body.put_u16(subscribe.packet_id);
                for (filter, qos) in &subscribe.filters {
                    write_string(filter, &mut body)?;
                    body.put_u8(*qos as u8);
                }
                ((PacketType::Subscribe as u8) << 4) | 0x02
            }
            Packet::SubAck(ack) => {
                body.put_u16(ack.packet_id);
                body.extend_from_slice(&ack.return_codes);
                (PacketType::SubAck as u8) << 4
            }
            Packet::Unsubscribe(unsubscribe) => {
                body.put_u16(unsubscribe.packet_id);
                for filter in &unsubscribe.filters {
                    write_string(filter, &mut body)?;
                }
                ((PacketType::Unsubscribe as u8) << 4) | 0x02
            }
            Packet::PingReq => (PacketType::PingReq as u8) << 4,
            Packet::PingResp => (PacketType::PingResp as u8) << 4,
            Packet::Disconnect => (PacketType::Disconnect as u8) << 4,
            Packet::Unknown { packet_type } => {
                return Err(Error::MalformedPacket(format!(
                    "cannot encode unknown packet type {packet_type}"
                )));
            }
        };

        dst.reserve(1 + 4 + body.len());
        dst.put_u8(first_byte);
        write_remaining_length(body.len(), dst)?;
        dst.extend_from_slice(&body);
        Ok(())
    }

    /// Convenience wrapper around [`Packet::encode`] for a single packet.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes one packet from the front of `src`, accepting packets up to
    /// [`DEFAULT_MAX_PACKET_SIZE`] bytes.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the packet is still
    /// incomplete; on success the packet's bytes are consumed.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Packet>> {
        Self::decode_with_limit(src, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Like [`Packet::decode`], rejecting any packet whose announced size
    /// (fixed header included) exceeds `max_packet_size` before buffering its
    /// body.
    pub fn decode_with_limit(src: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>> {
        let Some((remaining, header_len)) = read_remaining_length(&src[..])? else {
            return Ok(None);
        };
        let total = header_len + remaining;
        if total > max_packet_size {
            return Err(Error::MalformedPacket(format!(
                "packet of {total} bytes exceeds the {max_packet_size} byte limit"
            )));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total).freeze();
        let first_byte = frame.get_u8();
        frame.advance(header_len - 1);

        let flags = first_byte & 0x0F;
        let packet_type = first_byte >> 4;
        let Some(kind) = PacketType::from_u8(packet_type) else {
            return Ok(Some(Packet::Unknown { packet_type }));
        };

        let packet = match kind {
            PacketType::Connect => Packet::Connect(decode_connect(&mut frame)?),
            PacketType::ConnAck => {
                let flags = read_u8(&mut frame)?;
                let return_code = read_u8(&mut frame)?;
                Packet::ConnAck(ConnAck {
                    session_present: flags & 0x01 == 0x01,
                    return_code,
                })
            }
            PacketType::Publish => Packet::Publish(decode_publish(flags, frame)?),
            PacketType::PubAck => Packet::PubAck {
                packet_id: read_u16(&mut frame)?,
            },
            PacketType::Subscribe => {
                let packet_id = read_u16(&mut frame)?;
                let mut filters = Vec::new();
                while frame.has_remaining() {
                    let filter = read_string(&mut frame)?;
                    let qos = QoS::try_from(read_u8(&mut frame)? & 0x03)?;
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(Error::MalformedPacket("subscribe without filters".into()));
                }
                Packet::Subscribe(Subscribe { packet_id, filters })
            }
            PacketType::SubAck => {
                let packet_id = read_u16(&mut frame)?;
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes: frame.to_vec(),
                })
            }
            PacketType::Unsubscribe => {
                let packet_id = read_u16(&mut frame)?;
                let mut filters = Vec::new();
                while frame.has_remaining() {
                    filters.push(read_string(&mut frame)?);
                }
                Packet::Unsubscribe(Unsubscribe { packet_id, filters })
            }
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        Ok(Some(packet))
    }
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<()> {
    write_string(PROTOCOL_NAME, body)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= CONNECT_CLEAN_SESSION;
    }
    if connect.username.is_some() {
        flags |= CONNECT_USERNAME;
    }
    if connect.password.is_some() {
        flags |= CONNECT_PASSWORD;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    write_string(&connect.client_id, body)?;
    if let Some(username) = &connect.username {
        write_string(username, body)?;
    }
    if let Some(password) = &connect.password {
        write_string(password, body)?;
    }
    Ok(())
}

fn decode_connect(frame: &mut Bytes) -> Result<Connect> {
    let protocol = read_string(frame)?;
    if protocol != PROTOCOL_NAME {
        return Err(Error::MalformedPacket(format!(
            "unsupported protocol name {protocol:?}"
        )));
    }
    let level = read_u8(frame)?;
    if level != PROTOCOL_LEVEL {
        return Err(Error::MalformedPacket(format!(
            "unsupported protocol level {level}"
        )));
    }
    let flags = read_u8(frame)?;
    let keep_alive = read_u16(frame)?;
    let client_id = read_string(frame)?;

    if flags & CONNECT_WILL != 0 {
        // will messages are not supported; skip topic and payload
        let _topic = read_string(frame)?;
        let _payload = read_binary(frame)?;
    } else if flags & (CONNECT_WILL_QOS | CONNECT_WILL_RETAIN) != 0 {
        return Err(Error::MalformedPacket("will flags set without will".into()));
    }

    let username = if flags & CONNECT_USERNAME != 0 {
        Some(read_string(frame)?)
    } else {
        None
    };
    let password = if flags & CONNECT_PASSWORD != 0 {
        Some(String::from_utf8_lossy(&read_binary(frame)?).into_owned())
    } else {
        None
    };

    Ok(Connect {
        client_id,
        username,
        password,
        clean_session: flags & CONNECT_CLEAN_SESSION != 0,
        keep_alive,
    })
}

fn decode_publish(flags: u8, mut frame: Bytes) -> Result<Publish> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let topic = read_string(&mut frame)?;
    let packet_id = if qos > QoS::AtMostOnce {
        Some(read_u16(&mut frame)?)
    } else {
        None
    };
    Ok(Publish {
        topic,
        payload: frame,
        qos,
        retain: flags & 0x01 == 0x01,
        dup: flags & 0x08 == 0x08,
        packet_id,
    })
}

/// Reads the remaining-length varint that follows the first header byte.
///
/// Returns `(remaining_length, header_len)` where `header_len` counts the
/// first byte too, or `None` if more bytes are needed.
fn read_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for pos in 1..=4 {
        let Some(&byte) = src.get(pos) else {
            return Ok(None);
        };
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, pos + 1)));
        }
        multiplier *= 128;
    }
    Err(Error::MalformedPacket(
        "remaining length exceeds 4 bytes".into(),
    ))
}

fn write_remaining_length(len: usize, dst: &mut BytesMut) -> Result<()> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::MalformedPacket(format!(
            "packet body of {len} bytes is too large"
        )));
    }
    let mut value = len;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

fn write_string(s: &str, dst: &mut BytesMut) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::MalformedPacket(format!("string of {} bytes too long", s.len())))?;
    dst.put_u16(len);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_u8(src: &mut Bytes) -> Result<u8> {
    if !src.has_remaining() {
        return Err(Error::MalformedPacket("truncated packet".into()));
    }
    Ok(src.get_u8())
}

fn read_u16(src: &mut Bytes) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(Error::MalformedPacket("truncated packet".into()));
    }
    Ok(src.get_u16())
}

fn read_binary(src: &mut Bytes) -> Result<Bytes> {
    let len = read_u16(src)? as usize;
    if src.remaining() < len {
        return Err(Error::MalformedPacket("truncated string".into()));
    }
    Ok(src.split_to(len))
}

fn read_string(src: &mut Bytes) -> Result<String> {
    let raw = read_binary(src)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::MalformedPacket("string is not valid utf-8".into()))
}
