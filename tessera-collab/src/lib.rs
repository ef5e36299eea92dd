//! # tessera-collab: real-time document sync core
//!
//! Keeps a structured document (a set of named text segments) consistent
//! across concurrent editors. The server is authoritative and orders every
//! change; concurrent edits are reconciled with Operational Transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐     BroadcastBus     ┌──────────────┐
//! │ SyncClient   │ ◄────────────────► │ SyncServer   │ ◄──────────────────► │ SyncServer   │
//! │ (per editor) │  bincode / JSON    │ (instance A) │   InProcess / Relay  │ (instance B) │
//! └──────┬───────┘                    └──────┬───────┘                      └──────────────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐      ┌───────────────┐
//! │ClientDocument│                    │ DocumentRoom │ ───► │ DocumentStore │
//! │ (replica)    │                    │ session+fanout│     │ Memory / Rocks│
//! └──────────────┘                    └──────────────┘      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] / [`transform`]: edit model and the OT transform
//! - [`session`]: per-document sequencing, history and de-duplication
//! - [`room`]: document lifecycle, autosave and eviction
//! - [`presence`]: who is where, cursors and activity
//! - [`rate_limit`]: per-connection sliding windows
//! - [`protocol`] / [`server`] / [`auth`]: the WebSocket gateway
//! - [`recovery`] / [`client`]: client replica and reconnect driver
//! - [`bus`]: fan-out between server instances
//! - [`storage`] / [`config`]: persistence adapters and settings

pub mod auth;
pub mod broadcast;
pub mod bus;
pub mod client;
pub mod config;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod rate_limit;
pub mod recovery;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod transform;

// Re-exports for convenience
pub use auth::{Access, AuthError, IdentityService, StaticIdentity, UserEntry};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomEvent};
pub use bus::{BroadcastBus, BusError, BusMessage, BusPayload, InProcessBus, InProcessHub, RelayBus, RelayHub};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, RelayConfig, ServerConfig};
pub use operation::{Change, DocumentId, OpKind, Operation, OperationError, SegmentId, UserId};
pub use presence::{
    Activity, ConnectionId, CursorColor, CursorPosition, PresenceEvent, PresenceRegistry, PresenceState,
    PresenceUpdate, Selection,
};
pub use protocol::{AckStatus, Envelope, ErrorCode, Framing, Payload, ProtocolError, SyncBody};
pub use rate_limit::{RateLimiter, RateLimits, Throttled};
pub use recovery::{Backoff, ClientDocument, PendingQueue, Resync};
pub use room::{DocumentRoom, RoomManager, RoomSettings};
pub use server::{ConnectionPhase, ServerError, ServerStats, SyncServer};
pub use session::{DocumentSession, DocumentSnapshot, Integration, SessionError, Submission};
pub use storage::{DocumentMetadata, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transform::{transform, transform_many};
