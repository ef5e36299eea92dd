//! Wire protocol for document sync, presence and session control.
//!
//! Every frame is an [`Envelope`]:
//! ```text
//! ┌─────────┬──────────────────────────────┬──────────────────────────┐
//! │ version │ payload (tagged by type)     │ metadata                 │
//! │ u16     │ "document.change", ...       │ timestamp, sequence, ... │
//! └─────────┴──────────────────────────────┴──────────────────────────┘
//! ```
//!
//! Binary WebSocket frames carry bincode (standard config); text frames
//! carry JSON. The version is read before the rest of the frame so that a
//! client speaking a newer protocol gets a clean rejection instead of a
//! garbled decode.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::Access;
use crate::operation::{unix_timestamp, Change, DocumentId, UserId};
use crate::presence::{CursorPosition, PresenceEvent, Selection};
use crate::session::DocumentSnapshot;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MIN_SUPPORTED_VERSION: u16 = 1;

/// WebSocket close codes used by the gateway.
pub mod close {
    pub const MALFORMED: u16 = 4400;
    pub const UNAUTHENTICATED: u16 = 4401;
    pub const FORBIDDEN: u16 = 4403;
    pub const IDLE_TIMEOUT: u16 = 4408;
    pub const TOO_LARGE: u16 = 4409;
    pub const UNSUPPORTED_VERSION: u16 = 4426;

    /// Codes after which a client must not reconnect.
    pub fn is_fatal(code: u16) -> bool {
        matches!(code, UNAUTHENTICATED | FORBIDDEN | UNSUPPORTED_VERSION)
    }
}

/// Which encoding a peer speaks. The server replies in kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Binary,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    /// Applied exactly as submitted.
    Applied,
    /// Applied after transformation against concurrent changes.
    Transformed,
    /// Already applied earlier; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotReason {
    /// Initial state on `document.open`.
    Open,
    /// The requested base is older than retained history.
    TooOld,
    /// The server discarded its state after an integrity failure.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncBody {
    /// Every change after the requested sequence.
    Changes { latest: u64, changes: Vec<Change> },
    Snapshot {
        snapshot: DocumentSnapshot,
        reason: SnapshotReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Malformed,
    UnsupportedVersion,
    Unauthenticated,
    Forbidden,
    RateLimited,
    StaleSequence,
    InvalidOperation,
    NotOpen,
    Lagged,
    TooLarge,
    IdleTimeout,
    Internal,
}

impl ErrorCode {
    /// Close code for errors that end the connection.
    pub fn close_code(self) -> Option<u16> {
        match self {
            Self::Malformed => Some(close::MALFORMED),
            Self::UnsupportedVersion => Some(close::UNSUPPORTED_VERSION),
            Self::Unauthenticated => Some(close::UNAUTHENTICATED),
            Self::Forbidden => Some(close::FORBIDDEN),
            Self::TooLarge => Some(close::TOO_LARGE),
            Self::IdleTimeout => Some(close::IDLE_TIMEOUT),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    #[serde(rename = "system.auth")]
    Auth { token: String },
    #[serde(rename = "system.welcome")]
    Welcome {
        user_id: UserId,
        connection_id: Uuid,
        instance_id: Uuid,
    },
    #[serde(rename = "document.open")]
    Open { document_id: DocumentId, access: Access },
    #[serde(rename = "document.close")]
    Close { document_id: DocumentId },
    #[serde(rename = "document.change")]
    Change { document_id: DocumentId, change: Change },
    #[serde(rename = "document.ack")]
    Ack {
        document_id: DocumentId,
        client_seq: u64,
        sequence: u64,
        status: AckStatus,
    },
    #[serde(rename = "cursor.position")]
    Cursor {
        document_id: DocumentId,
        cursor: Option<CursorPosition>,
    },
    #[serde(rename = "selection.change")]
    Selection {
        document_id: DocumentId,
        selection: Option<Selection>,
    },
    #[serde(rename = "user.presence")]
    Presence {
        document_id: DocumentId,
        event: PresenceEvent,
    },
    #[serde(rename = "sync.request")]
    SyncRequest {
        document_id: DocumentId,
        last_sequence: u64,
    },
    #[serde(rename = "sync.response")]
    SyncResponse { document_id: DocumentId, body: SyncBody },
    #[serde(rename = "conflict.detected")]
    Conflict {
        document_id: DocumentId,
        client_seq: u64,
        sequence: u64,
        message: String,
    },
    #[serde(rename = "system.heartbeat")]
    Heartbeat,
    #[serde(rename = "system.error")]
    Error {
        code: ErrorCode,
        message: String,
        retry_after_ms: Option<u64>,
        fatal: bool,
    },
}

impl Payload {
    /// Dotted message type, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "system.auth",
            Self::Welcome { .. } => "system.welcome",
            Self::Open { .. } => "document.open",
            Self::Close { .. } => "document.close",
            Self::Change { .. } => "document.change",
            Self::Ack { .. } => "document.ack",
            Self::Cursor { .. } => "cursor.position",
            Self::Selection { .. } => "selection.change",
            Self::Presence { .. } => "user.presence",
            Self::SyncRequest { .. } => "sync.request",
            Self::SyncResponse { .. } => "sync.response",
            Self::Conflict { .. } => "conflict.detected",
            Self::Heartbeat => "system.heartbeat",
            Self::Error { .. } => "system.error",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            retry_after_ms: None,
            fatal: code.close_code().is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Unix seconds at the sender.
    pub timestamp: f64,
    /// Document sequence the message refers to, 0 if none.
    pub sequence: u64,
    pub user_id: Option<UserId>,
    pub connection_id: Option<Uuid>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub payload: Payload,
    pub metadata: Metadata,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u16,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

impl ProtocolError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            Self::TooLarge { .. } => ErrorCode::TooLarge,
            _ => ErrorCode::Malformed,
        }
    }
}

fn check_version(version: u16) -> Result<(), ProtocolError> {
    if (MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedVersion(version))
    }
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
            metadata: Metadata {
                timestamp: unix_timestamp(),
                ..Metadata::default()
            },
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.metadata.sequence = sequence;
        self
    }

    pub fn with_sender(mut self, user_id: impl Into<UserId>, connection_id: Uuid) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self.metadata.connection_id = Some(connection_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.metadata.correlation_id = correlation_id;
        self
    }

    pub fn encode_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (version, _): (u16, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        check_version(version)?;
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }

    pub fn encode_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        let header: VersionHeader =
            serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        check_version(header.version)?;
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Encode into a WebSocket message of the given framing.
    pub fn to_message(&self, framing: Framing) -> Result<Message, ProtocolError> {
        Ok(match framing {
            Framing::Binary => Message::Binary(self.encode_binary()?.into()),
            Framing::Text => Message::Text(self.encode_text()?.into()),
        })
    }

    /// Decode a data frame. Control frames yield `Ok(None)`.
    pub fn from_message(msg: &Message) -> Result<Option<(Self, Framing)>, ProtocolError> {
        match msg {
            Message::Binary(bytes) => Ok(Some((Self::decode_binary(bytes)?, Framing::Binary))),
            Message::Text(text) => Ok(Some((Self::decode_text(text.as_str())?, Framing::Text))),
            _ => Ok(None),
        }
    }
}

/// Close frame with one of the [`close`] codes.
pub fn close_message(code: u16, reason: impl Into<String>) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into().into(),
    }))
}
