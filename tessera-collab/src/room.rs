//! Document lifecycle: one `DocumentRoom` per resident document.
//!
//! ```text
//!            RoomManager (RwLock<HashMap<id, Arc<DocumentRoom>>>)
//!                 │ open / attach / detach / autosave / flush
//!                 ▼
//! DocumentRoom ── Mutex<RoomState{ DocumentSession, .. }>   single writer per doc
//!              ── BroadcastGroup                             ordered local fan-out
//!              ── BroadcastBus                               other instances
//! ```
//!
//! The map lock is only held for lookup and insertion, never across store
//! I/O. Each room's session lock is held across transform, apply, local
//! broadcast and bus publish, so all observers see one sequence order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomEvent};
use crate::bus::{BroadcastBus, BusMessage, BusPayload, InstanceId};
use crate::config::ServerConfig;
use crate::operation::{Change, DocumentId, Operation, SegmentId, UserId};
use crate::presence::{ConnectionId, PresenceEvent};
use crate::protocol::{SnapshotReason, SyncBody};
use crate::session::{DocumentSession, DocumentSnapshot, Integration, SessionError, Submission};
use crate::storage::{DocumentStore, StoreError};
use crate::transform::transform_many;

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub broadcast_capacity: usize,
    pub history_limit: usize,
    pub grace_period: Duration,
    pub autosave_interval: Duration,
}

impl From<&ServerConfig> for RoomSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            broadcast_capacity: config.broadcast_capacity,
            history_limit: config.history_limit,
            grace_period: config.grace_period(),
            autosave_interval: config.autosave_interval(),
        }
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Whose snapshot a room is waiting for after losing track of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Nothing,
    /// A gap: any newer snapshot will do.
    Newer,
    /// Lost a sequence collision at `from` to this instance.
    Winner { instance: InstanceId, from: u64 },
}

struct RoomState {
    session: DocumentSession,
    awaiting: Awaiting,
    /// The winner's changes from the collision on, for rebasing ours.
    rivals: BTreeMap<u64, Change>,
    /// Instances that lost a collision against local state. Their changes
    /// are ignored until they republish the snapshot they adopted.
    fenced: HashSet<InstanceId>,
}

pub struct DocumentRoom {
    document_id: DocumentId,
    state: Mutex<RoomState>,
    events: BroadcastGroup,
    bus: Arc<dyn BroadcastBus>,
    connections: AtomicUsize,
    /// Bumped on every attach; an eviction only proceeds if unchanged.
    epoch: AtomicU64,
    saved_sequence: AtomicU64,
}

impl DocumentRoom {
    fn new(
        document_id: DocumentId,
        snapshot: DocumentSnapshot,
        settings: &RoomSettings,
        bus: Arc<dyn BroadcastBus>,
    ) -> Self {
        let saved = snapshot.sequence;
        let session = DocumentSession::from_snapshot(
            document_id.clone(),
            bus.instance_id(),
            snapshot,
            settings.history_limit,
        );
        Self {
            document_id,
            state: Mutex::new(RoomState {
                session,
                awaiting: Awaiting::Nothing,
                rivals: BTreeMap::new(),
                fenced: HashSet::new(),
            }),
            events: BroadcastGroup::new(settings.broadcast_capacity),
            bus,
            connections: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            saved_sequence: AtomicU64::new(saved),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &BroadcastGroup {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.events.subscribe()
    }

    pub async fn sequence(&self) -> u64 {
        self.state.lock().await.session.sequence()
    }

    pub async fn snapshot(&self) -> DocumentSnapshot {
        self.state.lock().await.session.snapshot()
    }

    pub async fn is_dirty(&self) -> bool {
        self.sequence().await > self.saved_sequence.load(Ordering::SeqCst)
    }

    /// Initial state plus a receiver positioned right after it.
    pub async fn join(
        &self,
        connection: ConnectionId,
        user: UserId,
    ) -> (DocumentSnapshot, broadcast::Receiver<Arc<RoomEvent>>) {
        let state = self.state.lock().await;
        let rx = self.events.add_member(connection, user).await;
        (state.session.snapshot(), rx)
    }

    pub async fn leave(&self, connection: &ConnectionId) {
        self.events.remove_member(connection).await;
    }

    /// Sequence, broadcast and publish a client change.
    pub async fn submit(&self, change: Change, origin: ConnectionId) -> Result<Submission, SessionError> {
        let mut state = self.state.lock().await;
        let outcome = state.session.submit(change)?;
        if let Submission::Applied { change, transformed } = &outcome {
            log::debug!(
                "{}: seq {} from {} ({} ops{})",
                self.document_id,
                change.sequence,
                change.origin_user,
                change.ops.len(),
                if *transformed { ", transformed" } else { "" }
            );
            self.events.send(RoomEvent::Change {
                change: change.clone(),
                origin: Some(origin),
                transformed: *transformed,
            });
            self.bus.publish(BusPayload::Change {
                document_id: self.document_id.clone(),
                change: change.clone(),
            });
        }
        Ok(outcome)
    }

    /// Answer `sync.request`: the missed changes, or a snapshot when they
    /// are no longer retained.
    pub async fn catch_up(&self, last_sequence: u64) -> SyncBody {
        let state = self.state.lock().await;
        match state.session.changes_since(last_sequence) {
            Ok(changes) => SyncBody::Changes {
                latest: state.session.sequence(),
                changes,
            },
            Err(SessionError::FutureSequence { .. }) => SyncBody::Snapshot {
                snapshot: state.session.snapshot(),
                reason: SnapshotReason::Reset,
            },
            Err(_) => SyncBody::Snapshot {
                snapshot: state.session.snapshot(),
                reason: SnapshotReason::TooOld,
            },
        }
    }

    /// Fan a local presence event out to connections and other instances.
    pub fn publish_presence(&self, event: PresenceEvent) {
        self.events.send(RoomEvent::Presence(event.clone()));
        self.bus.publish(BusPayload::Presence {
            document_id: self.document_id.clone(),
            event,
        });
    }

    /// Presence from another instance: local fan-out only.
    pub fn relay_presence(&self, event: PresenceEvent) {
        self.events.send(RoomEvent::Presence(event));
    }

    /// Replace state and force every connection to resync.
    pub async fn reset(&self, snapshot: DocumentSnapshot) {
        let mut state = self.state.lock().await;
        self.reset_locked(&mut state, snapshot);
    }

    fn reset_locked(&self, state: &mut RoomState, snapshot: DocumentSnapshot) {
        log::warn!("{}: reset to sequence {}", self.document_id, snapshot.sequence);
        state.session.restore(snapshot.clone());
        state.awaiting = Awaiting::Nothing;
        state.rivals.clear();
        self.events.send(RoomEvent::Reset(snapshot));
    }

    /// Mirror a change finalized on another instance.
    pub async fn integrate_remote(&self, change: Change) {
        let mut state = self.state.lock().await;
        let remote_instance = change.origin_instance;
        let sequence = change.sequence;
        if state.fenced.contains(&remote_instance) {
            log::debug!(
                "{}: dropping seq {sequence} from fenced instance {remote_instance}",
                self.document_id
            );
            return;
        }
        let awaiting = state.awaiting;
        if let Awaiting::Winner { instance, from } = awaiting {
            if instance == remote_instance {
                if sequence >= from {
                    state.rivals.insert(sequence, change);
                }
                return;
            }
        }
        match state.session.integrate_remote(change.clone()) {
            Ok(Integration::Applied(changes)) => {
                for change in changes {
                    self.events.send(RoomEvent::Change {
                        change,
                        origin: None,
                        transformed: false,
                    });
                }
            }
            Ok(Integration::Duplicate) => {}
            Ok(Integration::Gap { missing_from }) => {
                if state.awaiting == Awaiting::Nothing {
                    log::info!(
                        "{}: gap at {missing_from} (got {sequence}), requesting snapshot",
                        self.document_id
                    );
                    state.awaiting = Awaiting::Newer;
                    self.request_snapshot();
                }
            }
            Ok(Integration::Collision { local_instance }) => {
                if remote_instance < local_instance {
                    log::error!(
                        "{}: sequence {sequence} collision, yielding to instance {remote_instance}",
                        self.document_id
                    );
                    state.awaiting = Awaiting::Winner {
                        instance: remote_instance,
                        from: sequence,
                    };
                    state.rivals.clear();
                    state.rivals.insert(sequence, change);
                    self.request_snapshot();
                } else {
                    log::error!(
                        "{}: sequence {sequence} collision, keeping local state over {remote_instance}",
                        self.document_id
                    );
                    state.fenced.insert(remote_instance);
                }
            }
            Err(e) => {
                log::error!("{}: cannot mirror remote change: {e}", self.document_id);
                state.awaiting = Awaiting::Newer;
                self.request_snapshot();
            }
        }
    }

    fn request_snapshot(&self) {
        self.bus.publish(BusPayload::SnapshotRequest {
            document_id: self.document_id.clone(),
        });
    }

    /// Another instance asked for our state.
    pub async fn answer_snapshot_request(&self) {
        let state = self.state.lock().await;
        if state.awaiting != Awaiting::Nothing {
            return;
        }
        self.bus.publish(BusPayload::Snapshot {
            document_id: self.document_id.clone(),
            snapshot: state.session.snapshot(),
        });
    }

    /// A snapshot published by another instance. Adopted when it is the
    /// collision winner's, or when it is newer than local state.
    pub async fn adopt_remote_snapshot(&self, origin: InstanceId, snapshot: DocumentSnapshot) -> bool {
        let mut state = self.state.lock().await;
        if state.fenced.remove(&origin) {
            log::info!(
                "{}: instance {origin} resynced at sequence {}",
                self.document_id,
                snapshot.sequence
            );
        }
        let awaiting = state.awaiting;
        match awaiting {
            Awaiting::Winner { instance, from } if instance == origin => {
                self.rebase_onto(&mut state, snapshot, from);
                true
            }
            Awaiting::Winner { .. } => false,
            _ if snapshot.sequence > state.session.sequence() => {
                self.reset_locked(&mut state, snapshot);
                true
            }
            _ => false,
        }
    }

    /// Adopt the collision winner's snapshot, then sequence the changes this
    /// instance finalized since `from` again on top of it.
    fn rebase_onto(&self, state: &mut RoomState, snapshot: DocumentSnapshot, from: u64) {
        let own = self.bus.instance_id();
        let lost: Vec<Change> = state
            .session
            .history_since(from)
            .filter(|c| c.origin_instance == own)
            .filter(|c| snapshot.clients.get(&c.origin_client).map_or(true, |&seq| c.client_seq > seq))
            .cloned()
            .collect();
        let mut theirs = rival_ops(&state.rivals, from, snapshot.sequence);
        if theirs.is_none() && !lost.is_empty() {
            log::warn!(
                "{}: winner history incomplete, replaying {} changes clamped",
                self.document_id,
                lost.len()
            );
        }

        self.saved_sequence.fetch_min(snapshot.sequence, Ordering::SeqCst);
        self.reset_locked(state, snapshot.clone());

        let mut rebased = Vec::with_capacity(lost.len());
        for change in lost {
            let ops = match theirs.take() {
                Some(concurrent) => {
                    let (mine, concurrent) = transform_many(&change.ops, &concurrent);
                    theirs = Some(concurrent);
                    mine
                }
                None => clamp_ops(state.session.segments(), &change.ops),
            };
            let client_seq = change.client_seq;
            let resubmitted = Change {
                sequence: 0,
                base_sequence: state.session.sequence(),
                origin_instance: Uuid::nil(),
                ops,
                ..change
            };
            match state.session.submit(resubmitted) {
                Ok(Submission::Applied { change, .. }) => {
                    self.events.send(RoomEvent::Change {
                        change: change.clone(),
                        origin: None,
                        transformed: true,
                    });
                    rebased.push(change);
                }
                Ok(Submission::Duplicate { .. }) => {}
                Err(e) => log::error!(
                    "{}: cannot rebase change {client_seq}: {e}",
                    self.document_id
                ),
            }
        }
        log::warn!(
            "{}: rebased {} changes onto sequence {}",
            self.document_id,
            rebased.len(),
            snapshot.sequence
        );

        // The adopted snapshot lifts the winner's fence before our changes land.
        self.bus.publish(BusPayload::Snapshot {
            document_id: self.document_id.clone(),
            snapshot,
        });
        for change in rebased {
            self.bus.publish(BusPayload::Change {
                document_id: self.document_id.clone(),
                change,
            });
        }
    }

    async fn save_to(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        let snapshot = self.snapshot().await;
        let sequence = snapshot.sequence;
        store.save(&self.document_id, &snapshot).await?;
        self.saved_sequence.fetch_max(sequence, Ordering::SeqCst);
        Ok(())
    }
}

/// Every winner change in `from..=to`, concatenated. `None` if any is missing.
fn rival_ops(rivals: &BTreeMap<u64, Change>, from: u64, to: u64) -> Option<Vec<Operation>> {
    let mut ops = Vec::new();
    for sequence in from..=to {
        ops.extend(rivals.get(&sequence)?.ops.iter().cloned());
    }
    Some(ops)
}

fn clamp_ops(segments: &BTreeMap<SegmentId, String>, ops: &[Operation]) -> Vec<Operation> {
    let mut lens: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        let len = lens
            .entry(op.segment.as_str())
            .or_insert_with(|| segments.get(&op.segment).map_or(0, |t| t.chars().count()));
        let mut op = op.clone();
        op.clamp_to(*len);
        *len = op.length_after(*len);
        out.push(op);
    }
    out
}

pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn BroadcastBus>,
    settings: RoomSettings,
}

impl RoomManager {
    pub fn new(store: Arc<dyn DocumentStore>, bus: Arc<dyn BroadcastBus>, settings: RoomSettings) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            bus,
            settings,
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.bus.instance_id()
    }

    pub fn bus(&self) -> &Arc<dyn BroadcastBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Resident room for a document, loading it from the store if needed.
    pub async fn open(&self, document_id: &str) -> Result<Arc<DocumentRoom>, StoreError> {
        if let Some(room) = self.get(document_id).await {
            return Ok(room);
        }

        let snapshot = self.store.load(document_id).await?.unwrap_or_default();

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            return Ok(room.clone());
        }
        log::info!("Opened '{document_id}' at sequence {}", snapshot.sequence);
        let room = Arc::new(DocumentRoom::new(
            document_id.to_string(),
            snapshot,
            &self.settings,
            self.bus.clone(),
        ));
        rooms.insert(document_id.to_string(), room.clone());
        Ok(room)
    }

    /// Open and count a connection against the room.
    pub async fn attach(&self, document_id: &str) -> Result<Arc<DocumentRoom>, StoreError> {
        loop {
            let room = self.open(document_id).await?;
            let rooms = self.rooms.read().await;
            // The room may have been evicted between open and here.
            if rooms.get(document_id).is_some_and(|r| Arc::ptr_eq(r, &room)) {
                room.connections.fetch_add(1, Ordering::SeqCst);
                room.epoch.fetch_add(1, Ordering::SeqCst);
                return Ok(room);
            }
        }
    }

    /// Release a connection; the last one schedules eviction.
    pub fn detach(self: &Arc<Self>, room: &Arc<DocumentRoom>) {
        let remaining = room.connections.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 {
            return;
        }
        let epoch = room.epoch.load(Ordering::SeqCst);
        let manager = self.clone();
        let room = room.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.settings.grace_period).await;
            manager.evict(&room, epoch).await;
        });
    }

    async fn evict(&self, room: &Arc<DocumentRoom>, epoch: u64) {
        if room.connection_count() > 0 || room.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if room.is_dirty().await {
            if let Err(e) = room.save_to(self.store.as_ref()).await {
                log::error!("Keeping '{}' resident, save failed: {e}", room.document_id);
                return;
            }
        }

        let mut rooms = self.rooms.write().await;
        let unchanged = room.connection_count() == 0
            && room.epoch.load(Ordering::SeqCst) == epoch
            && !room.is_dirty().await;
        if unchanged && rooms.get(&room.document_id).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(&room.document_id);
            log::info!("Evicted '{}' after grace period", room.document_id);
        }
    }

    /// Discard in-memory state after an integrity failure.
    pub async fn reset_from_store(&self, document_id: &str) -> Result<(), StoreError> {
        let Some(room) = self.get(document_id).await else {
            return Ok(());
        };
        let snapshot = self.store.load(document_id).await?.unwrap_or_default();
        log::error!(
            "Resetting '{document_id}' from store at sequence {}",
            snapshot.sequence
        );
        room.saved_sequence.store(snapshot.sequence, Ordering::SeqCst);
        room.reset(snapshot).await;
        Ok(())
    }

    /// Save every dirty room. Returns the number saved.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut saved = 0;
        for room in rooms {
            if !room.is_dirty().await {
                continue;
            }
            match room.save_to(self.store.as_ref()).await {
                Ok(()) => saved += 1,
                Err(e) => log::error!("Saving '{}' failed: {e}", room.document_id),
            }
        }
        saved
    }

    /// Periodic debounced save of dirty rooms.
    pub fn spawn_autosave(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.autosave_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let saved = manager.flush_all().await;
                if saved > 0 {
                    log::debug!("Autosaved {saved} documents");
                }
            }
        })
    }

    /// Document-level bus traffic. Presence is handled by the gateway.
    pub async fn handle_bus_message(&self, msg: &BusMessage) {
        if msg.origin == self.instance_id() {
            return;
        }
        let Some(room) = self.get(msg.payload.document_id()).await else {
            return;
        };
        match &msg.payload {
            BusPayload::Change { change, .. } => room.integrate_remote(change.clone()).await,
            BusPayload::SnapshotRequest { .. } => room.answer_snapshot_request().await,
            BusPayload::Snapshot { snapshot, .. } => {
                room.adopt_remote_snapshot(msg.origin, snapshot.clone()).await;
            }
            BusPayload::Presence { .. } => {}
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
