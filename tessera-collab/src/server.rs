//! WebSocket gateway: authentication, document routing and fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                               ┌── DocumentStore (Memory / RocksDB)
//!             ├── reader ── RoomManager ── DocumentRoom ── DocumentSession
//! Client B ──┘     │              │              │
//!                  │              │              ├── BroadcastGroup ──► writers
//!                  ▼              ▼              └── BroadcastBus ────► other instances
//!            RateLimiter   PresenceRegistry
//! ```
//!
//! Each connection runs one reader (this module's `Connection`) and one
//! writer task. The writer owns the socket sink and selects over a direct
//! outbound queue and the room's ordered event receiver; changes that came
//! from its own connection are turned into acknowledgements there.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{Access, AuthError, IdentityService};
use crate::broadcast::RoomEvent;
use crate::bus::{BroadcastBus, BusPayload};
use crate::config::ServerConfig;
use crate::operation::{unix_timestamp, Change, DocumentId, UserId};
use crate::presence::{ConnectionId, PresenceEvent, PresenceRegistry, PresenceUpdate};
use crate::protocol::{
    close, close_message, AckStatus, Envelope, ErrorCode, Framing, Payload, ProtocolError,
    SnapshotReason, SyncBody,
};
use crate::rate_limit::RateLimiter;
use crate::room::{DocumentRoom, RoomManager, RoomSettings};
use crate::session::{SessionError, Submission};
use crate::storage::{DocumentStore, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Close code for transient server-side failures; clients retry.
const INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection writer has stopped")]
    WriterClosed,
    #[error("illegal connection transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },
}

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Authenticated,
    /// A document is open.
    Active,
    Disconnected,
}

impl ConnectionPhase {
    pub fn can_advance(self, to: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, to),
            (Connecting, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticated, Active)
                | (Active, Authenticated)
                | (Connecting | Authenticating | Authenticated | Active, Disconnected)
        )
    }

    pub fn advance(&mut self, to: ConnectionPhase) -> Result<(), ServerError> {
        if !self.can_advance(to) {
            return Err(ServerError::IllegalTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rate_limited: u64,
    pub rejected_frames: u64,
}

/// The sync server. Cheap to clone; every clone shares state.
#[derive(Clone)]
pub struct SyncServer {
    config: Arc<ServerConfig>,
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceRegistry>,
    identity: Arc<dyn IdentityService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityService>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Self {
        let rooms = RoomManager::new(store, bus, RoomSettings::from(&config));
        Self {
            config: Arc::new(config),
            rooms,
            presence: Arc::new(PresenceRegistry::new()),
            identity,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Bind an address and serve in the background. Handy with port 0.
    pub async fn start(&self, addr: &str) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let server = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                log::error!("Server on {local} stopped: {e}");
            }
        });
        Ok((local, handle))
    }

    /// Accept connections on `listener`, with the background tasks running.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        log::info!(
            "Sync server {} listening on {local}",
            self.rooms.instance_id()
        );

        let background = [
            self.rooms.spawn_autosave(),
            self.spawn_bus_listener(),
            self.spawn_presence_sweep(),
        ];
        let _guard = AbortOnDrop(background.into());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_bus_listener(&self) -> JoinHandle<()> {
        let rooms = self.rooms.clone();
        let presence = self.presence.clone();
        let mut rx = rooms.bus().subscribe();
        tokio::spawn(async move {
            let own = rooms.instance_id();
            loop {
                let msg = match rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Bus listener lagged by {n} messages");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if msg.origin == own {
                    continue;
                }
                match &msg.payload {
                    BusPayload::Presence { document_id, event } => {
                        presence.apply_remote(event).await;
                        if let Some(room) = rooms.get(document_id).await {
                            room.relay_presence(event.clone());
                        }
                    }
                    _ => rooms.handle_bus_message(&msg).await,
                }
            }
        })
    }

    fn spawn_presence_sweep(&self) -> JoinHandle<()> {
        let rooms = self.rooms.clone();
        let presence = self.presence.clone();
        let typing = self.config.typing_timeout();
        let idle = self.config.presence_idle();
        let period = (typing / 2).max(Duration::from_millis(250));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for (document_id, event) in presence.sweep(unix_timestamp(), typing, idle).await {
                    if let Some(room) = rooms.get(&document_id).await {
                        room.publish_presence(event);
                    }
                }
            }
        })
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (sink, source) = ws_stream.split();
        let id = Uuid::new_v4();
        log::info!("WebSocket connection {id} established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.broadcast_capacity);
        let mut writer = tokio::spawn(write_loop(sink, outbound_rx, id));

        let mut conn = Connection {
            id,
            addr,
            phase: ConnectionPhase::Connecting,
            user: None,
            framing: None,
            open: None,
            limiter: RateLimiter::new(self.config.rate_limit),
            outbound: outbound_tx,
            server: self.clone(),
        };
        conn.phase.advance(ConnectionPhase::Authenticating)?;
        let result = conn.read_loop(source).await;
        conn.cleanup().await;
        drop(conn);

        if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
            writer.abort();
        }

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {id} from {addr} closed");
        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// Save every dirty document. Call before shutdown.
    pub async fn shutdown(&self) -> usize {
        let saved = self.rooms.flush_all().await;
        log::info!("Flushed {saved} documents");
        saved
    }
}

struct AbortOnDrop(Vec<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Commands from the reader to the writer task.
enum Outbound {
    Envelope(Envelope),
    Attach {
        room: Arc<DocumentRoom>,
        events: broadcast::Receiver<Arc<RoomEvent>>,
    },
    Detach,
    Framing(Framing),
    Close { code: u16, reason: String },
}

enum Flow {
    Continue,
    Close(u16, String),
    Disconnected,
}

struct OpenDocument {
    document_id: DocumentId,
    room: Arc<DocumentRoom>,
    access: Access,
}

struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    phase: ConnectionPhase,
    user: Option<UserId>,
    framing: Option<Framing>,
    open: Option<OpenDocument>,
    limiter: RateLimiter,
    outbound: mpsc::Sender<Outbound>,
    server: SyncServer,
}

impl Connection {
    async fn read_loop(&mut self, mut source: WsSource) -> Result<(), ServerError> {
        loop {
            let (limit, on_timeout) = if self.phase == ConnectionPhase::Authenticating {
                (
                    self.server.config.auth_timeout(),
                    (close::UNAUTHENTICATED, ErrorCode::Unauthenticated, "authentication timed out"),
                )
            } else {
                (
                    self.server.config.idle_timeout(),
                    (close::IDLE_TIMEOUT, ErrorCode::IdleTimeout, "no heartbeat received"),
                )
            };

            let msg = match tokio::time::timeout(limit, source.next()).await {
                Err(_) => {
                    let (code, error, reason) = on_timeout;
                    log::info!("Connection {} timed out ({reason})", self.id);
                    if self.send(Payload::error(error, reason), None).await.is_ok() {
                        self.close(code, reason).await;
                    }
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    log::warn!("WebSocket error from {}: {e}", self.addr);
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            let flow = match self.handle_frame(msg).await {
                Ok(flow) => flow,
                Err(ServerError::WriterClosed) => {
                    log::debug!("Writer for {} is gone, stopping reader", self.id);
                    break;
                }
                Err(e) => return Err(e),
            };
            match flow {
                Flow::Continue => {}
                Flow::Disconnected => break,
                Flow::Close(code, reason) => {
                    self.close(code, &reason).await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, msg: Message) -> Result<Flow, ServerError> {
        let size = msg.len();
        {
            let mut s = self.server.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += size as u64;
        }

        match &msg {
            Message::Close(_) => return Ok(Flow::Disconnected),
            Message::Text(_) => self.observe_framing(Framing::Text).await?,
            Message::Binary(_) => self.observe_framing(Framing::Binary).await?,
            _ => return Ok(Flow::Continue),
        }

        let limit = self.server.config.max_message_bytes;
        if size > limit {
            return self.reject(ProtocolError::TooLarge { size, limit }).await;
        }

        let envelope = match Envelope::from_message(&msg) {
            Ok(Some((envelope, _))) => envelope,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => return self.reject(e).await,
        };
        log::trace!("{} <- {}", self.id, envelope.payload.kind());
        self.handle_envelope(envelope).await
    }

    async fn observe_framing(&mut self, framing: Framing) -> Result<(), ServerError> {
        if self.framing.is_none() {
            self.framing = Some(framing);
            self.forward(Outbound::Framing(framing)).await?;
        }
        Ok(())
    }

    /// Undecodable frame: report, then close with the matching code.
    async fn reject(&mut self, error: ProtocolError) -> Result<Flow, ServerError> {
        self.server.stats.write().await.rejected_frames += 1;
        let code = error.error_code();
        log::warn!("Rejecting frame from {}: {error}", self.addr);
        self.send(Payload::error(code, error.to_string()), None).await?;
        let close_code = code.close_code().unwrap_or(close::MALFORMED);
        Ok(Flow::Close(close_code, error.to_string()))
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<Flow, ServerError> {
        let correlation = envelope.metadata.correlation_id;

        if self.phase == ConnectionPhase::Authenticating {
            return self.authenticate(envelope.payload, correlation).await;
        }

        if !matches!(envelope.payload, Payload::Heartbeat) {
            if let Err(throttled) = self.limiter.check_and_record() {
                self.server.stats.write().await.rate_limited += 1;
                log::debug!("Connection {} throttled: {throttled}", self.id);
                let notice = Payload::Error {
                    code: ErrorCode::RateLimited,
                    message: throttled.to_string(),
                    retry_after_ms: Some(throttled.retry_after_ms()),
                    fatal: false,
                };
                self.send(notice, correlation).await?;
                return Ok(Flow::Continue);
            }
        }

        match envelope.payload {
            Payload::Heartbeat => {
                self.send(Payload::Heartbeat, correlation).await?;
                Ok(Flow::Continue)
            }
            Payload::Open { document_id, access } => self.open(document_id, access, correlation).await,
            Payload::Close { document_id } => {
                if self.is_open(&document_id) {
                    self.close_document().await?;
                }
                Ok(Flow::Continue)
            }
            Payload::Change { document_id, change } => self.submit(document_id, change, correlation).await,
            Payload::SyncRequest {
                document_id,
                last_sequence,
            } => {
                let Some(open) = self.open_document(&document_id) else {
                    return self.not_open(&document_id, correlation).await;
                };
                let body = open.room.catch_up(last_sequence).await;
                self.send(Payload::SyncResponse { document_id, body }, correlation).await?;
                Ok(Flow::Continue)
            }
            Payload::Cursor { document_id, cursor } => {
                self.update_presence(&document_id, PresenceUpdate::Cursor(cursor), correlation)
                    .await
            }
            Payload::Selection {
                document_id,
                selection,
            } => {
                self.update_presence(&document_id, PresenceUpdate::Selection(selection), correlation)
                    .await
            }
            Payload::Presence {
                document_id,
                event: PresenceEvent::Activity(activity),
            } => {
                self.update_presence(&document_id, PresenceUpdate::Activity(activity), correlation)
                    .await
            }
            other => {
                log::debug!("Ignoring {} from {}", other.kind(), self.id);
                self.send(
                    Payload::Error {
                        code: ErrorCode::Malformed,
                        message: format!("unexpected {} from client", other.kind()),
                        retry_after_ms: None,
                        fatal: false,
                    },
                    correlation,
                )
                .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn authenticate(&mut self, payload: Payload, correlation: Option<String>) -> Result<Flow, ServerError> {
        let Payload::Auth { token } = payload else {
            let reason = format!("expected system.auth, got {}", payload.kind());
            self.send(Payload::error(ErrorCode::Unauthenticated, &reason), correlation).await?;
            return Ok(Flow::Close(close::UNAUTHENTICATED, reason));
        };

        match self.server.identity.authenticate(&token).await {
            Ok(user) => {
                self.phase.advance(ConnectionPhase::Authenticated)?;
                log::info!("Connection {} authenticated as {user}", self.id);
                let welcome = Payload::Welcome {
                    user_id: user.clone(),
                    connection_id: self.id,
                    instance_id: self.server.rooms.instance_id(),
                };
                self.user = Some(user);
                self.send(welcome, correlation).await?;
                Ok(Flow::Continue)
            }
            Err(AuthError::InvalidToken) => {
                log::info!("Connection {} from {} failed authentication", self.id, self.addr);
                let reason = AuthError::InvalidToken.to_string();
                self.send(Payload::error(ErrorCode::Unauthenticated, &reason), correlation).await?;
                Ok(Flow::Close(close::UNAUTHENTICATED, reason))
            }
            Err(e) => {
                log::error!("Identity service failed for {}: {e}", self.id);
                self.send(Payload::error(ErrorCode::Internal, e.to_string()), correlation).await?;
                Ok(Flow::Close(INTERNAL_ERROR, e.to_string()))
            }
        }
    }

    async fn open(
        &mut self,
        document_id: DocumentId,
        access: Access,
        correlation: Option<String>,
    ) -> Result<Flow, ServerError> {
        let Some(user) = self.user.clone() else {
            return Ok(Flow::Close(close::UNAUTHENTICATED, "not authenticated".into()));
        };

        match self.authorize(&user, &document_id, access).await {
            Ok(true) => {}
            Ok(false) => {
                log::info!("{user} denied {access:?} access to '{document_id}'");
                let reason = format!("{access:?} access to '{document_id}' denied");
                self.send(Payload::error(ErrorCode::Forbidden, &reason), correlation).await?;
                return Ok(Flow::Close(close::FORBIDDEN, reason));
            }
            Err(e) => {
                log::error!("Authorization failed for {user}: {e}");
                self.send(Payload::error(ErrorCode::Internal, e.to_string()), correlation).await?;
                return Ok(Flow::Close(INTERNAL_ERROR, e.to_string()));
            }
        }

        if self.open.is_some() {
            self.close_document().await?;
        }

        let room = match self.server.rooms.attach(&document_id).await {
            Ok(room) => room,
            Err(e) => {
                log::error!("Cannot open '{document_id}': {e}");
                let error = Payload::Error {
                    code: ErrorCode::Internal,
                    message: e.to_string(),
                    retry_after_ms: None,
                    fatal: false,
                };
                self.send(error, correlation).await?;
                return Ok(Flow::Continue);
            }
        };

        let (snapshot, events) = room.join(self.id, user.clone()).await;
        // Recorded before anything can fail, so cleanup always detaches.
        self.open = Some(OpenDocument {
            document_id: document_id.clone(),
            room: room.clone(),
            access,
        });
        let sequence = snapshot.sequence;
        let initial = Envelope::new(Payload::SyncResponse {
            document_id: document_id.clone(),
            body: SyncBody::Snapshot {
                snapshot,
                reason: SnapshotReason::Open,
            },
        })
        .with_sequence(sequence)
        .with_correlation(correlation);
        // Snapshot first, so the writer forwards events strictly after it.
        self.forward(Outbound::Envelope(initial)).await?;
        self.forward(Outbound::Attach { room: room.clone(), events }).await?;

        if let Some(joined) = self.server.presence.join(self.id, &document_id, &user).await {
            room.publish_presence(joined);
        }
        let roster = self.server.presence.list_active(&document_id).await;
        self.send(
            Payload::Presence {
                document_id: document_id.clone(),
                event: PresenceEvent::Roster(roster),
            },
            None,
        )
        .await?;

        log::info!(
            "{user} ({}) opened '{document_id}' for {access:?} at sequence {sequence}",
            self.id
        );
        self.phase.advance(ConnectionPhase::Active)?;
        Ok(Flow::Continue)
    }

    async fn authorize(&self, user: &str, document_id: &str, access: Access) -> Result<bool, AuthError> {
        let identity = &self.server.identity;
        if !identity.authorize(user, document_id, Access::Read).await? {
            return Ok(false);
        }
        match access {
            Access::Read => Ok(true),
            Access::Write => identity.authorize(user, document_id, Access::Write).await,
        }
    }

    async fn submit(
        &mut self,
        document_id: DocumentId,
        mut change: Change,
        correlation: Option<String>,
    ) -> Result<Flow, ServerError> {
        let Some(open) = self.open_document(&document_id) else {
            return self.not_open(&document_id, correlation).await;
        };
        if open.access != Access::Write {
            let reason = format!("read-only connection cannot edit '{document_id}'");
            self.send(Payload::error(ErrorCode::Forbidden, &reason), correlation).await?;
            return Ok(Flow::Close(close::FORBIDDEN, reason));
        }
        let room = open.room.clone();

        if let Some(user) = &self.user {
            change.origin_user = user.clone();
            for op in &mut change.ops {
                op.origin_user = user.clone();
            }
        }
        let client_seq = change.client_seq;
        let base = change.base_sequence;

        match room.submit(change, self.id).await {
            // The writer acknowledges applied changes in sequence order.
            Ok(Submission::Applied { .. }) => {}
            Ok(Submission::Duplicate { sequence }) => {
                let ack = Payload::Ack {
                    document_id,
                    client_seq,
                    sequence,
                    status: AckStatus::Duplicate,
                };
                self.send(ack, correlation).await?;
            }
            Err(SessionError::StaleSequence { .. } | SessionError::FutureSequence { .. }) => {
                log::debug!("{}: base {base} out of range, sending snapshot", self.id);
                let body = room.catch_up(base).await;
                self.send(Payload::SyncResponse { document_id, body }, correlation).await?;
            }
            Err(e @ SessionError::ForeignClient { .. }) => {
                log::warn!("{}: {e}", self.id);
                let reason = e.to_string();
                self.send(Payload::error(ErrorCode::Forbidden, &reason), correlation).await?;
                return Ok(Flow::Close(close::FORBIDDEN, reason));
            }
            Err(SessionError::InvalidOperation(e)) => {
                log::warn!("{}: rejected change {client_seq}: {e}", self.id);
                let error = Payload::Error {
                    code: ErrorCode::InvalidOperation,
                    message: e.to_string(),
                    retry_after_ms: None,
                    fatal: false,
                };
                self.send(error, correlation.clone()).await?;
                let snapshot = room.snapshot().await;
                let body = SyncBody::Snapshot {
                    snapshot,
                    reason: SnapshotReason::Reset,
                };
                self.send(Payload::SyncResponse { document_id, body }, correlation).await?;
            }
            Err(e @ SessionError::Integrity { .. }) => {
                log::error!("{e}");
                if let Err(e) = self.server.rooms.reset_from_store(&document_id).await {
                    log::error!("Reset of '{document_id}' failed: {e}");
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn update_presence(
        &mut self,
        document_id: &str,
        update: PresenceUpdate,
        correlation: Option<String>,
    ) -> Result<Flow, ServerError> {
        let Some(open) = self.open_document(document_id) else {
            return self.not_open(document_id, correlation).await;
        };
        let room = open.room.clone();
        if let Some((_, event)) = self.server.presence.update_presence(&self.id, update).await {
            room.publish_presence(event);
        }
        Ok(Flow::Continue)
    }

    fn is_open(&self, document_id: &str) -> bool {
        self.open_document(document_id).is_some()
    }

    fn open_document(&self, document_id: &str) -> Option<&OpenDocument> {
        self.open.as_ref().filter(|o| o.document_id == document_id)
    }

    async fn not_open(&self, document_id: &str, correlation: Option<String>) -> Result<Flow, ServerError> {
        self.send(
            Payload::error(ErrorCode::NotOpen, format!("'{document_id}' is not open")),
            correlation,
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn close_document(&mut self) -> Result<(), ServerError> {
        self.leave_document().await;
        self.phase.advance(ConnectionPhase::Authenticated)
    }

    async fn leave_document(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        // The writer may already be gone; presence and the room still need the leave.
        let _ = self.forward(Outbound::Detach).await;
        if let Some((_, left)) = self.server.presence.leave(&self.id).await {
            open.room.publish_presence(left);
        }
        open.room.leave(&self.id).await;
        self.server.rooms.detach(&open.room);
        log::debug!("{} left '{}'", self.id, open.document_id);
    }

    async fn cleanup(&mut self) {
        self.leave_document().await;
        if self.phase != ConnectionPhase::Disconnected {
            self.phase = ConnectionPhase::Disconnected;
        }
    }

    async fn forward(&self, cmd: Outbound) -> Result<(), ServerError> {
        self.outbound.send(cmd).await.map_err(|_| ServerError::WriterClosed)
    }

    async fn send(&self, payload: Payload, correlation: Option<String>) -> Result<(), ServerError> {
        let envelope = Envelope::new(payload).with_correlation(correlation);
        self.forward(Outbound::Envelope(envelope)).await
    }

    async fn close(&self, code: u16, reason: &str) {
        let cmd = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        if self.forward(cmd).await.is_err() {
            log::debug!("{}: writer gone before close {code}", self.id);
        }
    }
}

async fn next_event(
    room: &mut Option<(Arc<DocumentRoom>, broadcast::Receiver<Arc<RoomEvent>>)>,
) -> Result<Arc<RoomEvent>, broadcast::error::RecvError> {
    match room {
        Some((_, events)) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_loop(mut sink: WsSink, mut outbound: mpsc::Receiver<Outbound>, connection: ConnectionId) {
    let mut framing = Framing::default();
    let mut room: Option<(Arc<DocumentRoom>, broadcast::Receiver<Arc<RoomEvent>>)> = None;

    loop {
        let envelopes = tokio::select! {
            cmd = outbound.recv() => match cmd {
                None => break,
                Some(Outbound::Envelope(envelope)) => vec![envelope],
                Some(Outbound::Attach { room: r, events }) => {
                    room = Some((r, events));
                    continue;
                }
                Some(Outbound::Detach) => {
                    room = None;
                    continue;
                }
                Some(Outbound::Framing(f)) => {
                    framing = f;
                    continue;
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink.send(close_message(code, reason)).await;
                    break;
                }
            },
            event = next_event(&mut room) => match event {
                Ok(event) => match &room {
                    Some((r, _)) => room_event_envelopes(r.document_id(), &event, connection),
                    None => continue,
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let Some((r, _)) = &room else { continue };
                    log::warn!("Connection {connection} lagged by {n} events on '{}'", r.document_id());
                    let snapshot = r.snapshot().await;
                    let sequence = snapshot.sequence;
                    vec![Envelope::new(Payload::SyncResponse {
                        document_id: r.document_id().to_string(),
                        body: SyncBody::Snapshot { snapshot, reason: SnapshotReason::Reset },
                    })
                    .with_sequence(sequence)]
                }
                Err(broadcast::error::RecvError::Closed) => {
                    room = None;
                    continue;
                }
            },
        };

        for envelope in envelopes {
            let msg = match envelope.to_message(framing) {
                Ok(msg) => msg,
                Err(e) => {
                    log::error!("Cannot encode {} for {connection}: {e}", envelope.payload.kind());
                    continue;
                }
            };
            if let Err(e) = sink.send(msg).await {
                log::debug!("Writer for {connection} stopped: {e}");
                return;
            }
        }
    }
    let _ = sink.close().await;
}

/// What one room event looks like on this connection's wire.
fn room_event_envelopes(document_id: &str, event: &RoomEvent, connection: ConnectionId) -> Vec<Envelope> {
    let document_id = document_id.to_string();
    match event {
        RoomEvent::Change {
            change,
            origin: Some(origin),
            transformed,
        } if *origin == connection => {
            let status = if *transformed {
                AckStatus::Transformed
            } else {
                AckStatus::Applied
            };
            let mut out = vec![Envelope::new(Payload::Ack {
                document_id: document_id.clone(),
                client_seq: change.client_seq,
                sequence: change.sequence,
                status,
            })
            .with_sequence(change.sequence)];
            if *transformed {
                out.push(
                    Envelope::new(Payload::Conflict {
                        document_id,
                        client_seq: change.client_seq,
                        sequence: change.sequence,
                        message: "change was rebased onto concurrent edits".into(),
                    })
                    .with_sequence(change.sequence),
                );
            }
            out
        }
        RoomEvent::Change { change, .. } => vec![Envelope::new(Payload::Change {
            document_id,
            change: change.clone(),
        })
        .with_sequence(change.sequence)
        .with_sender(change.origin_user.clone(), change.origin_client)],
        RoomEvent::Presence(event) => vec![Envelope::new(Payload::Presence {
            document_id,
            event: event.clone(),
        })],
        RoomEvent::Reset(snapshot) => vec![Envelope::new(Payload::SyncResponse {
            document_id,
            body: SyncBody::Snapshot {
                snapshot: snapshot.clone(),
                reason: SnapshotReason::Reset,
            },
        })
        .with_sequence(snapshot.sequence)],
    }
}
