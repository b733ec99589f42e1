//! WebSocket transport
//!
//! MQTT over WebSocket sends every control packet in binary frames and the
//! client offers the `mqtt` subprotocol during the upgrade. A single frame may
//! carry several packets or part of one; the reader simply appends frame
//! payloads to the packet buffer.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tungstenite::protocol::Message as WsMessage;
use url::Url;

use super::conn::{ConnReader, ConnWriter};
use crate::utils::{Error, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SUBPROTOCOL: &str = "mqtt";

pub(crate) async fn connect(
    url: &Url,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<(ConnReader, ConnWriter)> {
    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

    let connector = tls.map(Connector::Rustls);
    let (ws_stream, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector).await?;
    tracing::debug!(%url, "websocket connected");

    let (sink, stream) = ws_stream.split();
    Ok((ConnReader::WebSocket(stream), ConnWriter::WebSocket(sink)))
}

pub(crate) async fn read_binary(
    stream: &mut SplitStream<WsStream>,
    buf: &mut BytesMut,
) -> Result<usize> {
    loop {
        let Some(message) = stream.next().await else {
            return Ok(0);
        };
        match message? {
            WsMessage::Binary(data) if data.is_empty() => continue,
            WsMessage::Binary(data) => {
                buf.extend_from_slice(&data);
                return Ok(data.len());
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            WsMessage::Close(_) => return Ok(0),
            other => {
                return Err(Error::UnexpectedPacket(format!(
                    "unexpected websocket message: {other:?}"
                )));
            }
        }
    }
}
