//! Live presence: who is in a document, where their cursor is, and whether
//! they are typing.
//!
//! ## Architecture
//!
//! ```text
//! cursor.position / selection.change / user.presence
//!       │
//!       ▼
//! PresenceRegistry::update_presence()   (owning connection only)
//!       │
//!       ▼
//! PresenceEvent::Updated ──► room broadcast ──► local connections
//!                        └─► BroadcastBus    ──► other instances
//!                                                  │
//!                                                  ▼
//!                                   PresenceRegistry::apply_remote()
//! ```
//!
//! Entries are keyed `document -> connection -> state` with a reverse index
//! from connection to document. Each connection owns exactly one entry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::operation::{unix_timestamp, DocumentId, SegmentId, UserId};

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Active,
    Idle,
    Typing,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub segment: SegmentId,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub segment: SegmentId,
    pub start: usize,
    pub end: usize,
}

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color for a user, identical on every instance.
    pub fn for_user(user: &str) -> Self {
        Self::from_uuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, user.as_bytes()))
    }

    /// HSL with fixed saturation and lightness; hue from the UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
    pub activity: Activity,
    /// Unix seconds of the last update from the owner.
    pub last_activity: f64,
    pub color: CursorColor,
}

impl PresenceState {
    pub fn new(connection_id: ConnectionId, document_id: impl Into<DocumentId>, user_id: impl Into<UserId>) -> Self {
        let user_id = user_id.into();
        Self {
            connection_id,
            color: CursorColor::for_user(&user_id),
            user_id,
            document_id: document_id.into(),
            cursor: None,
            selection: None,
            activity: Activity::Active,
            last_activity: unix_timestamp(),
        }
    }
}

/// A change to a connection's own presence.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    Cursor(Option<CursorPosition>),
    Selection(Option<Selection>),
    Activity(Activity),
}

/// Presence traffic, as carried by `user.presence` and the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Joined(PresenceState),
    Left {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Updated(PresenceState),
    /// Full list of entries, sent to a connection when it opens a document.
    Roster(Vec<PresenceState>),
    /// Client-reported activity change (client to server only).
    Activity(Activity),
}

#[derive(Default)]
struct Entries {
    by_document: HashMap<DocumentId, HashMap<ConnectionId, PresenceState>>,
    by_connection: HashMap<ConnectionId, DocumentId>,
}

impl Entries {
    fn insert(&mut self, state: PresenceState) {
        self.by_connection
            .insert(state.connection_id, state.document_id.clone());
        self.by_document
            .entry(state.document_id.clone())
            .or_default()
            .insert(state.connection_id, state);
    }

    fn remove(&mut self, connection: &ConnectionId) -> Option<PresenceState> {
        let document = self.by_connection.remove(connection)?;
        let states = self.by_document.get_mut(&document)?;
        let removed = states.remove(connection);
        if states.is_empty() {
            self.by_document.remove(&document);
        }
        removed
    }
}

/// Join table between connections and documents.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<Entries>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection in a document. `Some(Joined)` only the first time.
    pub async fn join(
        &self,
        connection: ConnectionId,
        document_id: &str,
        user_id: &str,
    ) -> Option<PresenceEvent> {
        let mut entries = self.entries.write().await;
        if entries.by_connection.contains_key(&connection) {
            return None;
        }
        let state = PresenceState::new(connection, document_id, user_id);
        entries.insert(state.clone());
        Some(PresenceEvent::Joined(state))
    }

    /// Remove a connection. `Some` exactly once per join.
    pub async fn leave(&self, connection: &ConnectionId) -> Option<(DocumentId, PresenceEvent)> {
        let state = self.entries.write().await.remove(connection)?;
        Some((
            state.document_id,
            PresenceEvent::Left {
                connection_id: state.connection_id,
                user_id: state.user_id,
            },
        ))
    }

    /// Last-write-wins update of the connection's own entry.
    pub async fn update_presence(
        &self,
        connection: &ConnectionId,
        update: PresenceUpdate,
    ) -> Option<(DocumentId, PresenceEvent)> {
        let mut entries = self.entries.write().await;
        let document = entries.by_connection.get(connection)?.clone();
        let state = entries
            .by_document
            .get_mut(&document)?
            .get_mut(connection)?;

        match update {
            PresenceUpdate::Cursor(cursor) => {
                state.cursor = cursor;
                if state.activity == Activity::Idle {
                    state.activity = Activity::Active;
                }
            }
            PresenceUpdate::Selection(selection) => state.selection = selection,
            PresenceUpdate::Activity(activity) => state.activity = activity,
        }
        state.last_activity = unix_timestamp();
        Some((document, PresenceEvent::Updated(state.clone())))
    }

    /// Current entries for a document, ordered by user then connection.
    pub async fn list_active(&self, document_id: &str) -> Vec<PresenceState> {
        let entries = self.entries.read().await;
        let mut out: Vec<_> = entries
            .by_document
            .get(document_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        out
    }

    /// Record presence reported by another instance.
    pub async fn apply_remote(&self, event: &PresenceEvent) {
        let mut entries = self.entries.write().await;
        match event {
            PresenceEvent::Joined(state) | PresenceEvent::Updated(state) => {
                entries.insert(state.clone());
            }
            PresenceEvent::Left { connection_id, .. } => {
                entries.remove(connection_id);
            }
            PresenceEvent::Roster(_) | PresenceEvent::Activity(_) => {}
        }
    }

    pub async fn document_of(&self, connection: &ConnectionId) -> Option<DocumentId> {
        self.entries.read().await.by_connection.get(connection).cloned()
    }

    /// Demote `Typing` to `Active` and `Active` to `Idle` after inactivity.
    pub async fn sweep(
        &self,
        now: f64,
        typing_timeout: Duration,
        idle_after: Duration,
    ) -> Vec<(DocumentId, PresenceEvent)> {
        let mut entries = self.entries.write().await;
        let mut events = Vec::new();
        for (document, states) in entries.by_document.iter_mut() {
            for state in states.values_mut() {
                let quiet = now - state.last_activity;
                let next = match state.activity {
                    Activity::Typing if quiet >= typing_timeout.as_secs_f64() => Activity::Active,
                    Activity::Active if quiet >= idle_after.as_secs_f64() => Activity::Idle,
                    _ => continue,
                };
                state.activity = next;
                events.push((document.clone(), PresenceEvent::Updated(state.clone())));
            }
        }
        events
    }
}
