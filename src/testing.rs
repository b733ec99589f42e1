//! In-process MQTT server used by the external client tests.
//!
//! It accepts any number of connections, answers CONNECT, SUBSCRIBE and
//! PINGREQ, and reports every packet it receives on one channel. Replies can
//! be delayed or withheld to script slow or half-open brokers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ConnAck, Packet, Publish, QoS, SubAck};

const WAIT: Duration = Duration::from_secs(5);

enum Command {
    Send(Packet),
    Close,
}

#[derive(Default)]
struct Behaviour {
    connack_code: AtomicU8,
    connack_delay_ms: AtomicU64,
    silent: AtomicBool,
    ignore_pings: AtomicBool,
    connections: AtomicUsize,
    disconnects: AtomicUsize,
}

pub struct FakeBroker {
    addr: SocketAddr,
    behaviour: Arc<Behaviour>,
    conns: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let behaviour = Arc::new(Behaviour::default());
        let conns = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let accept_task = {
            let behaviour = behaviour.clone();
            let conns = conns.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let (tx, rx) = mpsc::unbounded_channel();
                    conns.lock().unwrap().push(tx);
                    let behaviour = behaviour.clone();
                    let events_tx = events_tx.clone();
                    tokio::spawn(async move {
                        serve(socket, rx, events_tx, behaviour.clone()).await;
                        behaviour.disconnects.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            addr,
            behaviour,
            conns,
            events: tokio::sync::Mutex::new(events_rx),
            accept_task,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn set_connack_code(&self, code: u8) {
        self.behaviour.connack_code.store(code, Ordering::SeqCst);
    }

    /// Holds every CONNACK back for `delay`.
    pub fn set_connack_delay(&self, delay: Duration) {
        self.behaviour
            .connack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// When set, PINGREQ is recorded but never answered.
    pub fn set_ignore_pings(&self, ignore: bool) {
        self.behaviour.ignore_pings.store(ignore, Ordering::SeqCst);
    }

    /// Number of connections that have ended, from either side.
    pub fn disconnects(&self) -> usize {
        self.behaviour.disconnects.load(Ordering::SeqCst)
    }

    /// Polls until `disconnects()` reaches `count`. Panics after five seconds.
    pub async fn wait_for_disconnects(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.disconnects() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for disconnect")
    }

    /// When set, CONNECT is never answered.
    pub fn set_silent(&self, silent: bool) {
        self.behaviour.silent.store(silent, Ordering::SeqCst);
    }

    /// Number of CONNECT packets received so far.
    pub fn connections(&self) -> usize {
        self.behaviour.connections.load(Ordering::SeqCst)
    }

    fn broadcast(&self, make: impl Fn() -> Command) {
        self.conns
            .lock()
            .unwrap()
            .retain(|conn| conn.send(make()).is_ok());
    }

    pub fn send(&self, packet: Packet) {
        self.broadcast(|| Command::Send(packet.clone()));
    }

    pub fn publish(&self, topic: &str, payload: &'static [u8], qos: QoS) {
        self.send(Packet::Publish(Publish {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            qos,
            retain: false,
            dup: false,
            packet_id: (qos > QoS::AtMostOnce).then_some(7),
        }));
    }

    /// Drops every open connection.
    pub fn close_all(&self) {
        self.broadcast(|| Command::Close);
        self.conns.lock().unwrap().clear();
    }

    /// Waits for the next received packet accepted by `pred`, skipping the
    /// others. Panics after five seconds.
    pub async fn expect<F>(&self, pred: F) -> Packet
    where
        F: Fn(&Packet) -> bool,
    {
        let mut events = self.events.lock().await;
        tokio::time::timeout(WAIT, async {
            loop {
                let packet = events.recv().await.expect("fake broker stopped");
                if pred(&packet) {
                    return packet;
                }
            }
        })
        .await
        .expect("timed out waiting for packet")
    }

    /// Returns the packets received so far without waiting.
    pub async fn drain(&self) -> Vec<Packet> {
        let mut events = self.events.lock().await;
        let mut packets = Vec::new();
        while let Ok(packet) = events.try_recv() {
            packets.push(packet);
        }
        packets
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.close_all();
    }
}

async fn serve(
    socket: TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Packet>,
    behaviour: Arc<Behaviour>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let mut buf = BytesMut::new();
    loop {
        loop {
            match Packet::decode(&mut buf) {
                Ok(Some(packet)) => {
                    if answer(&mut writer, packet, &events, &behaviour).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if !matches!(read, Ok(n) if n > 0) {
                    return;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Send(packet)) => {
                    if write(&mut writer, &packet).await.is_err() {
                        return;
                    }
                }
                Some(Command::Close) | None => return,
            },
        }
    }
}

async fn answer(
    socket: &mut OwnedWriteHalf,
    packet: Packet,
    events: &mpsc::UnboundedSender<Packet>,
    behaviour: &Behaviour,
) -> std::io::Result<()> {
    let _ = events.send(packet.clone());
    let reply = match &packet {
        Packet::Connect(_) => {
            behaviour.connections.fetch_add(1, Ordering::SeqCst);
            if behaviour.silent.load(Ordering::SeqCst) {
                None
            } else {
                let delay = behaviour.connack_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Some(Packet::ConnAck(ConnAck {
                    session_present: false,
                    return_code: behaviour.connack_code.load(Ordering::SeqCst),
                }))
            }
        }
        Packet::Subscribe(subscribe) => Some(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: subscribe.filters.iter().map(|(_, qos)| *qos as u8).collect(),
        })),
        Packet::PingReq if behaviour.ignore_pings.load(Ordering::SeqCst) => None,
        Packet::PingReq => Some(Packet::PingResp),
        _ => None,
    };

    match reply {
        Some(reply) => write(socket, &reply).await,
        None => Ok(()),
    }
}

async fn write(socket: &mut OwnedWriteHalf, packet: &Packet) -> std::io::Result<()> {
    let bytes = packet.to_bytes().map_err(std::io::Error::other)?;
    socket.write_all(&bytes).await
}
