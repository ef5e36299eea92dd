//! Ordered fan-out of room events to every local connection.
//!
//! One tokio broadcast channel per document. Events are sent while the
//! document's session lock is held, so every receiver observes changes in
//! sequence order. A receiver that falls more than `capacity` events behind
//! gets `Lagged` and must resynchronise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::operation::{Change, UserId};
use crate::presence::{ConnectionId, PresenceEvent};
use crate::session::DocumentSnapshot;

/// What a room tells its connections.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A finalized change. `origin` is the submitting local connection, if any.
    Change {
        change: Change,
        origin: Option<ConnectionId>,
        transformed: bool,
    },
    Presence(PresenceEvent),
    /// State was replaced; everyone must adopt this snapshot.
    Reset(DocumentSnapshot),
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_undelivered: u64,
    pub members: usize,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    members: RwLock<HashMap<ConnectionId, UserId>>,
    capacity: usize,
    events_sent: AtomicU64,
    events_undelivered: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many events a slow receiver may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            events_sent: AtomicU64::new(0),
            events_undelivered: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand back its receiver.
    pub async fn add_member(&self, connection: ConnectionId, user: UserId) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.members.write().await.insert(connection, user);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, connection: &ConnectionId) -> Option<UserId> {
        self.members.write().await.remove(connection)
    }

    /// Receiver without membership, for observers such as tests.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.sender.subscribe()
    }

    /// Send to every receiver. Lock-free; returns the receiver count.
    pub fn send(&self, event: RoomEvent) -> usize {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(event)) {
            Ok(n) => n,
            Err(_) => {
                self.events_undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_undelivered: self.events_undelivered.load(Ordering::Relaxed),
            members: self.members.read().await.len(),
        }
    }
}
