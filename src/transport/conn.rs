use std::sync::Arc;

use bytes::BytesMut;
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tungstenite::protocol::Message as WsMessage;

use super::websocket::{self, WsStream};
use crate::protocol::{DEFAULT_MAX_PACKET_SIZE, Packet};
use crate::utils::{Error, Result};

/// Any byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

pub enum ConnReader {
    Stream(ReadHalf<BoxStream>),
    WebSocket(SplitStream<WsStream>),
}

pub enum ConnWriter {
    Stream(WriteHalf<BoxStream>),
    WebSocket(SplitSink<WsStream, WsMessage>),
}

impl ConnReader {
    /// Appends whatever arrives next to `buf`. `Ok(0)` means the peer closed
    /// the connection.
    pub async fn fill(&mut self, buf: &mut BytesMut) -> Result<usize> {
        match self {
            ConnReader::Stream(reader) => Ok(reader.read_buf(buf).await?),
            ConnReader::WebSocket(stream) => websocket::read_binary(stream, buf).await,
        }
    }
}

impl ConnWriter {
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        match self {
            ConnWriter::Stream(writer) => {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            // MQTT Control Packets MUST be sent in WebSocket binary data frames [MQTT-6.0.0-1].
            ConnWriter::WebSocket(sink) => sink.send(WsMessage::binary(bytes)).await?,
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            ConnWriter::Stream(writer) => writer.shutdown().await?,
            ConnWriter::WebSocket(sink) => sink.close().await?,
        }
        Ok(())
    }
}

/// Decodes packets from a [`ConnReader`], buffering partial reads.
pub struct PacketReader {
    inner: ConnReader,
    buf: BytesMut,
    max_packet_size: usize,
}

impl PacketReader {
    pub fn new(inner: ConnReader) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Packets announcing more than `max_packet_size` bytes fail with
    /// [`Error::MalformedPacket`].
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Returns the next complete packet. Cancel-safe: bytes already read stay
    /// buffered for the next call.
    pub async fn next(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = Packet::decode_with_limit(&mut self.buf, self.max_packet_size)? {
                return Ok(packet);
            }
            if self.inner.fill(&mut self.buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<(ConnReader, ConnWriter)> {
    let stream = open_tcp(host, port).await?;
    Ok(split_stream(Box::new(stream)))
}

pub(crate) async fn connect_tls(
    host: &str,
    port: u16,
    tls: Arc<rustls::ClientConfig>,
) -> Result<(ConnReader, ConnWriter)> {
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| Error::Tls(e.to_string()))?;
    let stream = open_tcp(host, port).await?;
    let stream = TlsConnector::from(tls)
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(split_stream(Box::new(stream)))
}

async fn open_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    // Disable Nagle's algorithm since we always send complete packets.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(?e, "error setting TCP_NODELAY on socket");
    }
    Ok(stream)
}

fn split_stream(stream: BoxStream) -> (ConnReader, ConnWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (ConnReader::Stream(reader), ConnWriter::Stream(writer))
}
