//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle with a supervisor task (connect, auth, open, retry)
//! - Optimistic local edits through a [`ClientDocument`] replica
//! - Catch-up after reconnect with `sync.request`
//! - Cursor, selection and activity updates
//!
//! Authorization closes (4401, 4403) and version rejections (4426) stop the
//! client for good; everything else takes the backoff path.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::auth::Access;
use crate::operation::{Change, DocumentId, Operation, OperationError, UserId};
use crate::presence::{Activity, CursorPosition, PresenceEvent, Selection};
use crate::protocol::{close, AckStatus, Envelope, ErrorCode, Framing, Payload, ProtocolError, SnapshotReason, SyncBody};
use crate::recovery::{Backoff, ClientDocument, Resync};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid edit: {0}")]
    InvalidEdit(#[from] OperationError),
    #[error("pending queue is full ({limit} changes)")]
    QueueFull { limit: usize },
    #[error("replica diverged at sequence {sequence}: {detail}")]
    Diverged { sequence: u64, detail: String },
    #[error("server closed the connection ({code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("client stopped")]
    Stopped,
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: rejected by the server or out of retries.
    Failed,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected { user_id: UserId, connection_id: Uuid },
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected,
    Fatal { code: u16, reason: String },
    /// A change from someone else, as applied to the local replica.
    RemoteChange(Change),
    Acked { client_seq: u64, sequence: u64, status: AckStatus },
    Conflict { client_seq: u64, sequence: u64, message: String },
    Presence(PresenceEvent),
    Resynced(Resync),
    Throttled { retry_after_ms: u64 },
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub url: String,
    pub token: String,
    pub document_id: DocumentId,
    pub access: Access,
    pub heartbeat_interval: Duration,
    pub backoff: Backoff,
    pub framing: Framing,
    /// Edits that may queue while offline.
    pub max_pending: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>, document_id: impl Into<DocumentId>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            document_id: document_id.into(),
            access: Access::Write,
            heartbeat_interval: Duration::from_secs(30),
            backoff: Backoff::default(),
            framing: Framing::Binary,
            max_pending: 10_000,
        }
    }
}

enum Command {
    /// Local edits are waiting.
    Flush,
    Send(Payload),
    /// Drop the transport and take the reconnect path.
    Interrupt,
    Stop,
}

/// The sync client.
///
/// Owns a supervisor task that keeps one connection alive and a local
/// replica that edits apply to immediately.
pub struct SyncClient {
    document_id: DocumentId,
    document: Arc<Mutex<ClientDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    supervisor: JoinHandle<()>,
}

impl SyncClient {
    /// Start connecting in the background. `client_id` should be stable
    /// across restarts of the same editor so replays de-duplicate.
    pub fn connect(config: ClientConfig, user: impl Into<UserId>, client_id: Uuid) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(256);
        let document = Arc::new(Mutex::new(ClientDocument::with_capacity(
            config.document_id.clone(),
            user,
            client_id,
            config.max_pending,
        )));
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let supervisor = Supervisor {
            document: document.clone(),
            state: state.clone(),
            events: event_tx,
            commands: command_rx,
            backoff: config.backoff.clone(),
            initialized: false,
            opened: false,
            hold_until: None,
            config: config.clone(),
        };

        Self {
            document_id: config.document_id,
            document,
            state,
            commands: command_tx,
            event_rx: Some(event_rx),
            supervisor: tokio::spawn(supervisor.run()),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Apply an edit locally and queue it for the server.
    pub async fn edit(&self, op: Operation) -> Result<u64, ClientError> {
        let client_seq = self.document.lock().await.local_edit(op)?;
        let _ = self.commands.send(Command::Flush).await;
        Ok(client_seq)
    }

    /// Cursor updates are dropped while offline.
    pub async fn set_cursor(&self, cursor: Option<CursorPosition>) {
        self.send(Payload::Cursor {
            document_id: self.document_id.clone(),
            cursor,
        })
        .await;
    }

    pub async fn set_selection(&self, selection: Option<Selection>) {
        self.send(Payload::Selection {
            document_id: self.document_id.clone(),
            selection,
        })
        .await;
    }

    pub async fn set_activity(&self, activity: Activity) {
        self.send(Payload::Presence {
            document_id: self.document_id.clone(),
            event: PresenceEvent::Activity(activity),
        })
        .await;
    }

    async fn send(&self, payload: Payload) {
        let _ = self.commands.send(Command::Send(payload)).await;
    }

    /// Drop the current connection as if the network failed.
    pub async fn interrupt(&self) {
        let _ = self.commands.send(Command::Interrupt).await;
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(self) {
        let _ = self.commands.send(Command::Stop).await;
        let _ = self.supervisor.await;
    }

    pub async fn text(&self, segment: &str) -> Option<String> {
        self.document.lock().await.text(segment).map(str::to_string)
    }

    pub async fn known_sequence(&self) -> u64 {
        self.document.lock().await.known_sequence()
    }

    pub async fn pending_len(&self) -> usize {
        self.document.lock().await.pending().len()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

enum SessionEnd {
    Stopped,
    Dropped,
}

struct Supervisor {
    config: ClientConfig,
    document: Arc<Mutex<ClientDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::Sender<SyncEvent>,
    commands: mpsc::Receiver<Command>,
    backoff: Backoff,
    /// The replica has adopted server state at least once.
    initialized: bool,
    /// The current connection has the document open.
    opened: bool,
    /// Pause submissions after a rate-limit notice.
    hold_until: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            self.set_state(if self.initialized {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            })
            .await;

            let outcome = self.session().await;
            self.opened = false;
            self.hold_until = None;
            self.document.lock().await.on_disconnect();

            match outcome {
                Ok(SessionEnd::Stopped) => {
                    self.set_state(ConnectionState::Disconnected).await;
                    self.emit(SyncEvent::Disconnected);
                    return;
                }
                Err(ClientError::Closed { code, reason }) if close::is_fatal(code) => {
                    log::error!("Server rejected client ({code}): {reason}");
                    self.fail(code, reason).await;
                    return;
                }
                Ok(SessionEnd::Dropped) => log::info!("Connection to {} dropped", self.config.url),
                Err(e) => log::warn!("Connection to {} failed: {e}", self.config.url),
            }
            self.emit(SyncEvent::Disconnected);

            let Some(delay) = self.backoff.next_delay() else {
                self.fail(0, "reconnect attempts exhausted".into()).await;
                return;
            };
            self.set_state(ConnectionState::Reconnecting).await;
            self.emit(SyncEvent::Reconnecting {
                attempt: self.backoff.attempts(),
                delay,
            });
            if self.wait(delay).await.is_err() {
                self.set_state(ConnectionState::Disconnected).await;
                return;
            }
        }
    }

    /// Sleep out a backoff delay; edits keep queueing locally meanwhile.
    async fn wait(&mut self, delay: Duration) -> Result<(), ClientError> {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Stop) => return Err(ClientError::Stopped),
                    Some(_) => {}
                },
            }
        }
    }

    async fn fail(&mut self, code: u16, reason: String) {
        self.set_state(ConnectionState::Failed).await;
        self.emit(SyncEvent::Fatal { code, reason });
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.try_send(event).is_err() {
            log::debug!("Sync event dropped, receiver full or gone");
        }
    }

    async fn session(&mut self) -> Result<SessionEnd, ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        let (mut sink, mut source): (WsSink, WsSource) = ws.split();

        self.write(&mut sink, Payload::Auth {
            token: self.config.token.clone(),
        })
        .await?;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            let hold = self.hold_until;
            tokio::select! {
                msg = source.next() => {
                    let msg = match msg {
                        None => return Ok(SessionEnd::Dropped),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(msg)) => msg,
                    };
                    if let Message::Close(frame) = &msg {
                        let (code, reason) = frame
                            .as_ref()
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or((1005, String::new()));
                        return Err(ClientError::Closed { code, reason });
                    }
                    if let Some((envelope, _)) = Envelope::from_message(&msg)? {
                        self.handle(&mut sink, envelope).await?;
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Stop) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Stopped);
                    }
                    Some(Command::Interrupt) => return Ok(SessionEnd::Dropped),
                    Some(Command::Flush) => {}
                    Some(Command::Send(payload)) => {
                        if self.opened {
                            self.write(&mut sink, payload).await?;
                        }
                    }
                },
                _ = heartbeat.tick() => self.write(&mut sink, Payload::Heartbeat).await?,
                _ = sleep_until(hold) => self.hold_until = None,
            }
            self.flush(&mut sink).await?;
        }
    }

    async fn handle(&mut self, sink: &mut WsSink, envelope: Envelope) -> Result<(), ClientError> {
        let correlation = envelope.metadata.correlation_id;
        match envelope.payload {
            Payload::Welcome {
                user_id,
                connection_id,
                ..
            } => {
                self.backoff.reset();
                self.set_state(ConnectionState::Connected).await;
                log::info!("Connected as {user_id} ({connection_id})");
                self.emit(SyncEvent::Connected {
                    user_id,
                    connection_id,
                });
                let document_id = self.config.document_id.clone();
                self.write(sink, Payload::Open {
                    document_id: document_id.clone(),
                    access: self.config.access,
                })
                .await?;
                if self.initialized {
                    let last_sequence = self.document.lock().await.sync_request();
                    self.write(sink, Payload::SyncRequest {
                        document_id,
                        last_sequence,
                    })
                    .await?;
                }
            }
            Payload::SyncResponse { body, .. } => {
                let reopen = matches!(
                    body,
                    SyncBody::Snapshot {
                        reason: SnapshotReason::Open,
                        ..
                    }
                );
                // After a reconnect the sync.request reply carries the gap.
                if reopen && self.initialized {
                    return Ok(());
                }
                self.opened = true;
                let outcome = self.document.lock().await.on_sync_response(body)?;
                self.initialized = true;
                self.emit(SyncEvent::Resynced(outcome));
            }
            Payload::Change { change, .. } => {
                let applied = self.document.lock().await.on_remote_change(change)?;
                for change in applied {
                    self.emit(SyncEvent::RemoteChange(change));
                }
            }
            Payload::Ack {
                client_seq,
                sequence,
                status,
                ..
            } => {
                if self.document.lock().await.on_ack(client_seq, sequence, status)? {
                    self.emit(SyncEvent::Acked {
                        client_seq,
                        sequence,
                        status,
                    });
                }
            }
            Payload::Conflict {
                client_seq,
                sequence,
                message,
                ..
            } => self.emit(SyncEvent::Conflict {
                client_seq,
                sequence,
                message,
            }),
            Payload::Presence { event, .. } => self.emit(SyncEvent::Presence(event)),
            Payload::Error {
                code: ErrorCode::RateLimited,
                retry_after_ms,
                ..
            } => {
                let retry_after_ms = retry_after_ms.unwrap_or(1000);
                log::debug!("Throttled, holding submissions for {retry_after_ms}ms");
                // Only a throttled change needs resending; other frames are lost.
                if let Some(client_seq) = throttled_change(correlation.as_deref()) {
                    self.document.lock().await.on_rejected(client_seq);
                }
                self.hold_until = Some(Instant::now() + Duration::from_millis(retry_after_ms));
                self.emit(SyncEvent::Throttled { retry_after_ms });
            }
            Payload::Error { code, message, .. } => {
                log::warn!("Server error {code:?}: {message}");
                self.emit(SyncEvent::Error { code, message });
            }
            Payload::Heartbeat => {}
            other => log::debug!("Ignoring {} from server", other.kind()),
        }
        Ok(())
    }

    /// Send the next pending change if the document is open and nothing is
    /// in flight.
    async fn flush(&mut self, sink: &mut WsSink) -> Result<(), ClientError> {
        if !self.opened || self.hold_until.is_some() {
            return Ok(());
        }
        let next = self.document.lock().await.next_outgoing();
        if let Some(change) = next {
            let correlation = change_correlation(change.client_seq);
            let envelope = Envelope::new(Payload::Change {
                document_id: self.config.document_id.clone(),
                change,
            })
            .with_correlation(Some(correlation));
            self.write_envelope(sink, envelope).await?;
        }
        Ok(())
    }

    async fn write(&self, sink: &mut WsSink, payload: Payload) -> Result<(), ClientError> {
        self.write_envelope(sink, Envelope::new(payload)).await
    }

    async fn write_envelope(&self, sink: &mut WsSink, envelope: Envelope) -> Result<(), ClientError> {
        let msg = envelope.to_message(self.config.framing)?;
        sink.send(msg).await?;
        Ok(())
    }
}

fn change_correlation(client_seq: u64) -> String {
    format!("change-{client_seq}")
}

/// The `client_seq` a correlation id names, if it tagged a change.
fn throttled_change(correlation: Option<&str>) -> Option<u64> {
    correlation?.strip_prefix("change-")?.parse().ok()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
