//! Cross-instance broadcast of finalized changes and presence.
//!
//! ```text
//!  instance A                         instance B
//! ┌──────────┐  BusMessage{origin:A} ┌──────────┐
//! │ Room.doc │ ─────► bus ─────────► │ Room.doc │ integrate_remote()
//! └──────────┘                       └──────────┘
//! ```
//!
//! Publishing never blocks the caller. Every message carries its origin
//! instance, and subscribers drop their own messages.
//!
//! Two transports:
//! - [`InProcessHub`] / [`InProcessBus`]: several servers in one process.
//! - [`RelayHub`] / [`RelayBus`]: bincode frames over WebSocket between
//!   processes. The hub forwards every frame to every other peer.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::operation::{Change, DocumentId};
use crate::presence::PresenceEvent;
use crate::session::DocumentSnapshot;

pub type InstanceId = Uuid;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusPayload {
    Change { document_id: DocumentId, change: Change },
    Presence { document_id: DocumentId, event: PresenceEvent },
    /// Ask the instance that owns the latest state to publish a snapshot.
    SnapshotRequest { document_id: DocumentId },
    Snapshot { document_id: DocumentId, snapshot: DocumentSnapshot },
}

impl BusPayload {
    pub fn document_id(&self) -> &str {
        match self {
            Self::Change { document_id, .. }
            | Self::Presence { document_id, .. }
            | Self::SnapshotRequest { document_id }
            | Self::Snapshot { document_id, .. } => document_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub origin: InstanceId,
    pub payload: BusPayload,
}

impl BusMessage {
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BusError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BusError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay bind failed: {0}")]
    Bind(#[from] std::io::Error),
    #[error("bus encode error: {0}")]
    Encode(String),
    #[error("bus decode error: {0}")]
    Decode(String),
}

pub trait BroadcastBus: Send + Sync {
    fn instance_id(&self) -> InstanceId;

    /// Fire-and-forget. Never blocks.
    fn publish(&self, payload: BusPayload);

    /// Every message on the bus, including this instance's own.
    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>>;
}

// ─── In-process ──────────────────────────────────────────────────────

/// Shared channel that any number of [`InProcessBus`] handles join.
#[derive(Clone)]
pub struct InProcessHub {
    sender: broadcast::Sender<Arc<BusMessage>>,
}

impl Default for InProcessHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }
}

impl InProcessHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus handle for a new instance.
    pub fn connect(&self) -> InProcessBus {
        self.connect_as(Uuid::new_v4())
    }

    pub fn connect_as(&self, instance_id: InstanceId) -> InProcessBus {
        InProcessBus {
            instance_id,
            sender: self.sender.clone(),
        }
    }
}

pub struct InProcessBus {
    instance_id: InstanceId,
    sender: broadcast::Sender<Arc<BusMessage>>,
}

impl InProcessBus {
    /// A bus with nobody else on it.
    pub fn standalone() -> Self {
        InProcessHub::new().connect()
    }
}

impl BroadcastBus for InProcessBus {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn publish(&self, payload: BusPayload) {
        let _ = self.sender.send(Arc::new(BusMessage {
            origin: self.instance_id,
            payload,
        }));
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>> {
        self.sender.subscribe()
    }
}

// ─── WebSocket relay ─────────────────────────────────────────────────

/// Frame forwarder between server processes.
pub struct RelayHub {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayHub {
    pub async fn bind(addr: &str) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (frames, _) = broadcast::channel::<(u64, Vec<u8>)>(BUS_CAPACITY);
        log::info!("Relay hub listening on {local_addr}");

        let task = tokio::spawn(async move {
            let mut next_peer = 0u64;
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        next_peer += 1;
                        log::debug!("Relay peer {next_peer} connected from {addr}");
                        tokio::spawn(relay_peer(stream, next_peer, frames.clone()));
                    }
                    Err(e) => log::warn!("Relay accept failed: {e}"),
                }
            }
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }
}

impl Drop for RelayHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay_peer(stream: TcpStream, peer: u64, frames: broadcast::Sender<(u64, Vec<u8>)>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Relay handshake failed: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let mut rx = frames.subscribe();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = frames.send((peer, bytes.to_vec()));
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Ok((from, bytes)) if from != peer => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Relay peer {peer} lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    log::debug!("Relay peer {peer} disconnected");
}

/// Bus handle that talks to a [`RelayHub`]. Reconnects on its own; messages
/// published while disconnected are dropped and recovered through snapshot
/// requests.
pub struct RelayBus {
    instance_id: InstanceId,
    local: broadcast::Sender<Arc<BusMessage>>,
    outgoing: mpsc::Sender<Arc<BusMessage>>,
    task: JoinHandle<()>,
}

impl RelayBus {
    /// Connect to the hub at `url`; returns once the first connection is up.
    pub async fn connect(url: &str, instance_id: InstanceId) -> Result<Self, BusError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let (local, _) = broadcast::channel(BUS_CAPACITY);
        let (outgoing, out_rx) = mpsc::channel(BUS_CAPACITY);

        let task = tokio::spawn(relay_client(url.to_string(), ws, local.clone(), out_rx));
        log::info!("Instance {instance_id} joined relay {url}");

        Ok(Self {
            instance_id,
            local,
            outgoing,
            task,
        })
    }
}

impl Drop for RelayBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type ClientStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn relay_client(
    url: String,
    first: ClientStream,
    local: broadcast::Sender<Arc<BusMessage>>,
    mut out_rx: mpsc::Receiver<Arc<BusMessage>>,
) {
    let mut ws = Some(first);
    loop {
        let stream = match ws.take() {
            Some(stream) => stream,
            None => match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    log::info!("Reconnected to relay {url}");
                    stream
                }
                Err(e) => {
                    log::warn!("Relay {url} unreachable: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
        };

        let (mut sink, mut incoming) = stream.split();
        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { return };
                    match msg.encode() {
                        Ok(bytes) => {
                            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::error!("Dropping bus message: {e}"),
                    }
                }
                frame = incoming.next() => match frame {
                    Some(Ok(Message::Binary(bytes))) => match BusMessage::decode(&bytes) {
                        Ok(msg) => {
                            let _ = local.send(Arc::new(msg));
                        }
                        Err(e) => log::warn!("Bad relay frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        log::warn!("Lost relay connection to {url}");
    }
}

impl BroadcastBus for RelayBus {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn publish(&self, payload: BusPayload) {
        let msg = Arc::new(BusMessage {
            origin: self.instance_id,
            payload,
        });
        // Local subscribers see their own messages too, as with InProcessBus.
        let _ = self.local.send(msg.clone());
        if let Err(e) = self.outgoing.try_send(msg) {
            log::warn!("Relay queue full, dropping message: {e}");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>> {
        self.local.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use tokio::time::timeout;

    fn change_payload() -> BusPayload {
        let mut change = Change::new("alice", Uuid::new_v4(), 1, 0, vec![Operation::insert("s", 0, "x")]);
        change.sequence = 1;
        BusPayload::Change {
            document_id: "doc".into(),
            change,
        }
    }

    async fn next_foreign(rx: &mut broadcast::Receiver<Arc<BusMessage>>, me: InstanceId) -> Arc<BusMessage> {
        loop {
            let msg = rx.recv().await.unwrap();
            if msg.origin != me {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_in_process_delivery() {
        let hub = InProcessHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let mut rx_b = b.subscribe();

        a.publish(change_payload());
        let msg = next_foreign(&mut rx_b, b.instance_id()).await;
        assert_eq!(msg.origin, a.instance_id());
        assert_eq!(msg.payload.document_id(), "doc");
    }

    #[tokio::test]
    async fn test_own_messages_identifiable() {
        let bus = InProcessBus::standalone();
        let mut rx = bus.subscribe();
        bus.publish(BusPayload::SnapshotRequest {
            document_id: "doc".into(),
        });
        assert_eq!(rx.recv().await.unwrap().origin, bus.instance_id());
    }

    #[tokio::test]
    async fn test_relay_forwards_between_instances() {
        let hub = RelayHub::bind("127.0.0.1:0").await.unwrap();
        let a = RelayBus::connect(&hub.url(), Uuid::new_v4()).await.unwrap();
        let b = RelayBus::connect(&hub.url(), Uuid::new_v4()).await.unwrap();
        let mut rx_b = b.subscribe();
        // Let the hub register both peers.
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.publish(change_payload());
        let msg = timeout(Duration::from_secs(2), next_foreign(&mut rx_b, b.instance_id()))
            .await
            .expect("relay delivery timed out");
        assert_eq!(msg.origin, a.instance_id());
        assert!(matches!(msg.payload, BusPayload::Change { .. }));
    }

    #[test]
    fn test_bus_message_codec() {
        let msg = BusMessage {
            origin: Uuid::new_v4(),
            payload: change_payload(),
        };
        assert_eq!(BusMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }
}
