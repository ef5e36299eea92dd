//! Client-side replica and reconnection state, independent of transport.
//!
//! A `ClientDocument` applies local edits optimistically and keeps them in a
//! pending queue until the server acknowledges them. Only the front change
//! is ever in flight; the rest wait behind it. Incoming changes are
//! transformed against everything still pending so the local replica
//! converges with the server's order.
//!
//! De-duplication is by sequence number: anything at or below the known
//! sequence is ignored, so replaying a sync response is harmless.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use crate::client::ClientError;
use crate::operation::{apply_ops, unix_timestamp, Change, DocumentId, Operation, SegmentId, UserId};
use crate::protocol::{AckStatus, SyncBody};
use crate::session::DocumentSnapshot;
use crate::transform::transform_many;

/// Unacknowledged local changes. The front one may be in flight.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    changes: VecDeque<Change>,
    in_flight: bool,
    max_len: usize,
}

impl PendingQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            changes: VecDeque::with_capacity(max_len.min(1024)),
            in_flight: false,
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.changes.len() >= self.max_len
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn front(&self) -> Option<&Change> {
        self.changes.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    fn push(&mut self, change: Change) {
        self.changes.push_back(change);
    }

    /// Pop the front change if it is the one identified by `client_seq`.
    fn settle(&mut self, client_seq: u64) -> Option<Change> {
        if self.changes.front()?.client_seq != client_seq {
            return None;
        }
        self.in_flight = false;
        self.changes.pop_front()
    }
}

/// What a sync response did to the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum Resync {
    /// Missed changes were applied; these are the local forms.
    CaughtUp(Vec<Change>),
    /// State was replaced. `replayed` pending changes survived on top.
    Snapshot { sequence: u64, replayed: usize },
}

pub struct ClientDocument {
    document_id: DocumentId,
    user: UserId,
    client_id: Uuid,
    segments: BTreeMap<SegmentId, String>,
    known_seq: u64,
    next_client_seq: u64,
    pending: PendingQueue,
    /// Sequenced changes that arrived ahead of a gap.
    reorder: BTreeMap<u64, Change>,
}

impl ClientDocument {
    pub fn new(document_id: impl Into<DocumentId>, user: impl Into<UserId>, client_id: Uuid) -> Self {
        Self::with_capacity(document_id, user, client_id, 10_000)
    }

    /// `max_pending` bounds how many edits may queue while offline.
    pub fn with_capacity(
        document_id: impl Into<DocumentId>,
        user: impl Into<UserId>,
        client_id: Uuid,
        max_pending: usize,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            user: user.into(),
            client_id,
            segments: BTreeMap::new(),
            known_seq: 0,
            next_client_seq: 1,
            pending: PendingQueue::new(max_pending),
            reorder: BTreeMap::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn known_sequence(&self) -> u64 {
        self.known_seq
    }

    pub fn text(&self, segment: &str) -> Option<&str> {
        self.segments.get(segment).map(String::as_str)
    }

    pub fn segments(&self) -> &BTreeMap<SegmentId, String> {
        &self.segments
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    fn segment_len(&self, segment: &str) -> usize {
        self.segments.get(segment).map_or(0, |t| t.chars().count())
    }

    /// Apply an edit locally and queue it for the server.
    pub fn local_edit(&mut self, op: Operation) -> Result<u64, ClientError> {
        if self.pending.is_full() {
            return Err(ClientError::QueueFull {
                limit: self.pending.max_len,
            });
        }
        let client_seq = self.next_client_seq;
        let op = op.with_origin(self.user.clone(), client_seq, unix_timestamp());
        apply_ops(&mut self.segments, std::slice::from_ref(&op))?;
        self.next_client_seq += 1;
        self.pending.push(Change::new(
            self.user.clone(),
            self.client_id,
            client_seq,
            self.known_seq,
            vec![op],
        ));
        Ok(client_seq)
    }

    /// The next change to send, if nothing is in flight.
    pub fn next_outgoing(&mut self) -> Option<Change> {
        if self.pending.in_flight {
            return None;
        }
        let known = self.known_seq;
        let front = self.pending.changes.front_mut()?;
        front.base_sequence = known;
        self.pending.in_flight = true;
        Some(front.clone())
    }

    /// Server acknowledged a submission. Returns whether it was ours to settle.
    pub fn on_ack(&mut self, client_seq: u64, sequence: u64, status: AckStatus) -> Result<bool, ClientError> {
        if self.pending.settle(client_seq).is_none() {
            return Ok(false);
        }
        if status != AckStatus::Duplicate && sequence > self.known_seq {
            self.known_seq = sequence;
            self.drain_reorder()?;
        }
        Ok(true)
    }

    /// A sequenced change from the server. Returns what was applied locally.
    pub fn on_remote_change(&mut self, change: Change) -> Result<Vec<Change>, ClientError> {
        if change.sequence <= self.known_seq {
            return Ok(Vec::new());
        }
        if change.sequence > self.known_seq + 1 {
            self.reorder.insert(change.sequence, change);
            return Ok(Vec::new());
        }
        let mut applied = Vec::new();
        applied.extend(self.integrate(change)?);
        applied.extend(self.drain_reorder()?);
        Ok(applied)
    }

    fn drain_reorder(&mut self) -> Result<Vec<Change>, ClientError> {
        self.reorder.retain(|seq, _| *seq > self.known_seq);
        let mut applied = Vec::new();
        while let Some(next) = self.reorder.remove(&(self.known_seq + 1)) {
            applied.extend(self.integrate(next)?);
        }
        Ok(applied)
    }

    fn integrate(&mut self, mut change: Change) -> Result<Option<Change>, ClientError> {
        self.known_seq = change.sequence;

        // Our own change seen through catch-up settles it like an ack. One we
        // no longer hold was re-sequenced by the server and applies as remote.
        if change.origin_client == self.client_id && self.pending.settle(change.client_seq).is_some() {
            return Ok(None);
        }

        let mut remote = std::mem::take(&mut change.ops);
        for pending in self.pending.changes.iter_mut() {
            let (mine, theirs) = transform_many(&pending.ops, &remote);
            pending.ops = mine;
            remote = theirs;
        }
        apply_ops(&mut self.segments, &remote).map_err(|e| ClientError::Diverged {
            sequence: change.sequence,
            detail: e.to_string(),
        })?;
        change.ops = remote;
        Ok(Some(change))
    }

    /// Apply a `sync.response`.
    pub fn on_sync_response(&mut self, body: SyncBody) -> Result<Resync, ClientError> {
        match body {
            SyncBody::Changes { changes, .. } => {
                let mut applied = Vec::new();
                for change in changes {
                    applied.extend(self.on_remote_change(change)?);
                }
                Ok(Resync::CaughtUp(applied))
            }
            SyncBody::Snapshot { snapshot, .. } => {
                let sequence = snapshot.sequence;
                let replayed = self.adopt_snapshot(snapshot);
                Ok(Resync::Snapshot { sequence, replayed })
            }
        }
    }

    /// Replace local state, then replay surviving pending edits clamped to
    /// the new content.
    fn adopt_snapshot(&mut self, snapshot: DocumentSnapshot) -> usize {
        let applied = snapshot.clients.get(&self.client_id).copied().unwrap_or(0);
        self.pending.changes.retain(|c| c.client_seq > applied);
        self.pending.in_flight = false;
        self.segments = snapshot.segments;
        self.known_seq = snapshot.sequence;
        self.reorder.retain(|seq, _| *seq > snapshot.sequence);
        self.next_client_seq = self.next_client_seq.max(applied + 1);

        let mut changes = std::mem::take(&mut self.pending.changes);
        for change in changes.iter_mut() {
            let mut kept = Vec::with_capacity(change.ops.len());
            for mut op in change.ops.drain(..) {
                op.clamp_to(self.segment_len(&op.segment));
                if op.is_noop() {
                    continue;
                }
                if apply_ops(&mut self.segments, std::slice::from_ref(&op)).is_ok() {
                    kept.push(op);
                }
            }
            change.ops = kept;
        }
        changes.retain(|c| !c.is_empty());
        let replayed = changes.len();
        self.pending.changes = changes;
        replayed
    }

    /// The server dropped the in-flight change unprocessed. Returns whether
    /// `client_seq` was in flight and will be resent.
    pub fn on_rejected(&mut self, client_seq: u64) -> bool {
        let ours = self.pending.in_flight && self.pending.front().is_some_and(|c| c.client_seq == client_seq);
        if ours {
            self.pending.in_flight = false;
        }
        ours
    }

    /// The transport dropped; whatever was in flight will be resent.
    pub fn on_disconnect(&mut self) {
        self.pending.in_flight = false;
    }

    /// `last_sequence` for a `sync.request` after reconnecting.
    pub fn sync_request(&self) -> u64 {
        self.known_seq
    }
}

/// Exponential reconnect delay: 1s doubling to 30s, then give up.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_retries: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 10)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max,
            max_retries,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` when retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.attempt += 1;
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DocumentSession, Submission};

    fn server_change(sequence: u64, user: &str, ops: Vec<Operation>) -> Change {
        let mut change = Change::new(user, Uuid::new_v4(), sequence, sequence - 1, ops);
        change.sequence = sequence;
        change
    }

    #[test]
    fn test_local_edit_queues_one_in_flight() {
        let mut doc = ClientDocument::new("doc", "alice", Uuid::new_v4());
        doc.local_edit(Operation::insert("body", 0, "ab")).unwrap();
        doc.local_edit(Operation::insert("body", 2, "c")).unwrap();
        assert_eq!(doc.text("body"), Some("abc"));

        let first = doc.next_outgoing().unwrap();
        assert_eq!(first.client_seq, 1);
        assert!(doc.next_outgoing().is_none());

        assert!(doc.on_ack(1, 1, AckStatus::Applied).unwrap());
        let second = doc.next_outgoing().unwrap();
        assert_eq!((second.client_seq, second.base_sequence), (2, 1));
    }

    #[test]
    fn test_rejection_only_requeues_the_change_in_flight() {
        let mut doc = ClientDocument::new("doc", "alice", Uuid::new_v4());
        doc.local_edit(Operation::insert("body", 0, "a")).unwrap();
        doc.local_edit(Operation::insert("body", 1, "b")).unwrap();
        let sent = doc.next_outgoing().unwrap();

        // A throttled cursor update, or a stale id, leaves the change in flight.
        assert!(!doc.on_rejected(sent.client_seq + 1));
        assert!(doc.pending().in_flight());
        assert!(doc.next_outgoing().is_none());

        assert!(doc.on_rejected(sent.client_seq));
        assert!(!doc.pending().in_flight());
        assert_eq!(doc.next_outgoing().unwrap().client_seq, sent.client_seq);
    }

    #[test]
    fn test_invalid_local_edit_rejected() {
        let mut doc = ClientDocument::new("doc", "alice", Uuid::new_v4());
        assert!(matches!(
            doc.local_edit(Operation::delete("body", 0, 3)),
            Err(ClientError::InvalidEdit(_))
        ));
        assert!(doc.pending().is_empty());
    }

    #[test]
    fn test_queue_limit() {
        let mut doc = ClientDocument::with_capacity("doc", "alice", Uuid::new_v4(), 2);
        doc.local_edit(Operation::insert("body", 0, "a")).unwrap();
        doc.local_edit(Operation::insert("body", 0, "b")).unwrap();
        assert!(matches!(
            doc.local_edit(Operation::insert("body", 0, "c")),
            Err(ClientError::QueueFull { limit: 2 })
        ));
    }

    #[test]
    fn test_remote_change_transformed_against_pending() {
        let mut doc = ClientDocument::new("doc", "alice", Uuid::new_v4());
        doc.on_remote_change(server_change(1, "bob", vec![Operation::insert("body", 0, "hello")]))
            .unwrap();
        doc.local_edit(Operation::insert("body", 5, "!")).unwrap();
        doc.next_outgoing().unwrap();

        let applied = doc
            .on_remote_change(server_change(2, "bob", vec![Operation::insert("body", 0, ">> ")]))
            .unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(doc.text("body"), Some(">> hello!"));
        // The pending insert moved right by the remote insert.
        assert_eq!(doc.pending().front().unwrap().ops[0].position, 8);
    }

    #[test]
    fn test_out_of_order_buffered() {
        let mut doc = ClientDocument::new("doc", "alice", Uuid::new_v4());
        doc.on_remote_change(server_change(2, "bob", vec![Operation::insert("body", 1, "b")]))
            .unwrap();
        assert_eq!(doc.known_sequence(), 0);
        let applied = doc
            .on_remote_change(server_change(1, "bob", vec![Operation::insert("body", 0, "a")]))
            .unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(doc.text("body"), Some("ab"));
        assert_eq!(doc.known_sequence(), 2);
    }

    #[test]
    fn test_catch_up_twice_is_idempotent() {
        let mut doc = ClientDocument::new("doc", "alice", Uuid::new_v4());
        let body = SyncBody::Changes {
            latest: 2,
            changes: vec![
                server_change(1, "bob", vec![Operation::insert("body", 0, "xy")]),
                server_change(2, "bob", vec![Operation::delete("body", 0, 1)]),
            ],
        };
        doc.on_sync_response(body.clone()).unwrap();
        let again = doc.on_sync_response(body).unwrap();
        assert_eq!(again, Resync::CaughtUp(Vec::new()));
        assert_eq!(doc.text("body"), Some("y"));
    }

    #[test]
    fn test_own_change_in_catch_up_settles_pending() {
        let client = Uuid::new_v4();
        let mut server = DocumentSession::new("doc", Uuid::new_v4(), 100);
        let mut doc = ClientDocument::new("doc", "alice", client);

        doc.local_edit(Operation::insert("body", 0, "one")).unwrap();
        doc.local_edit(Operation::insert("body", 3, " two")).unwrap();
        let sent = doc.next_outgoing().unwrap();
        // The server applies it, but the ack is lost with the connection.
        assert!(matches!(server.submit(sent).unwrap(), Submission::Applied { .. }));
        doc.on_disconnect();

        let body = SyncBody::Changes {
            latest: server.sequence(),
            changes: server.changes_since(doc.sync_request()).unwrap(),
        };
        doc.on_sync_response(body).unwrap();
        assert_eq!(doc.pending().len(), 1);

        let next = doc.next_outgoing().unwrap();
        assert_eq!(next.client_seq, 2);
        server.submit(next).unwrap();
        assert_eq!(server.segment("body"), Some("one two"));
    }

    #[test]
    fn test_resequenced_own_change_applies_after_reset() {
        let client = Uuid::new_v4();
        let mut doc = ClientDocument::new("doc", "alice", client);
        doc.local_edit(Operation::insert("body", 0, "L")).unwrap();
        let sent = doc.next_outgoing().unwrap();
        doc.on_ack(sent.client_seq, 1, AckStatus::Applied).unwrap();

        // The server lost its lineage and adopted another one without "L".
        let mut snapshot = DocumentSnapshot::with_segments([("body", "W")]);
        snapshot.sequence = 1;
        doc.on_sync_response(SyncBody::Snapshot {
            snapshot,
            reason: crate::protocol::SnapshotReason::Reset,
        })
        .unwrap();
        assert_eq!(doc.text("body"), Some("W"));

        let mut again = Change::new("alice", client, 1, 1, vec![Operation::insert("body", 0, "L")]);
        again.sequence = 2;
        assert_eq!(doc.on_remote_change(again).unwrap().len(), 1);
        assert_eq!(doc.text("body"), Some("LW"));
        assert_eq!(doc.known_sequence(), 2);
    }

    #[test]
    fn test_snapshot_drops_applied_and_replays_rest() {
        let client = Uuid::new_v4();
        let mut doc = ClientDocument::new("doc", "alice", client);
        doc.local_edit(Operation::insert("body", 0, "abc")).unwrap();
        doc.local_edit(Operation::insert("body", 3, "XYZ")).unwrap();
        doc.next_outgoing().unwrap();
        doc.on_disconnect();

        let mut snapshot = DocumentSnapshot::with_segments([("body", "abc")]);
        snapshot.sequence = 40;
        snapshot.clients.insert(client, 1);
        let body = SyncBody::Snapshot {
            snapshot: snapshot.clone(),
            reason: crate::protocol::SnapshotReason::TooOld,
        };

        let outcome = doc.on_sync_response(body.clone()).unwrap();
        assert_eq!(outcome, Resync::Snapshot { sequence: 40, replayed: 1 });
        assert_eq!(doc.text("body"), Some("abcXYZ"));
        assert_eq!(doc.known_sequence(), 40);

        doc.on_sync_response(body).unwrap();
        assert_eq!(doc.text("body"), Some("abcXYZ"));
        assert_eq!(doc.pending().len(), 1);
    }

    #[test]
    fn test_snapshot_replay_clamps_positions() {
        let mut doc = ClientDocument::new("doc", "alice", Uuid::new_v4());
        doc.on_remote_change(server_change(1, "bob", vec![Operation::insert("body", 0, "0123456789")]))
            .unwrap();
        doc.local_edit(Operation::insert("body", 9, "!")).unwrap();

        let mut snapshot = DocumentSnapshot::with_segments([("body", "012")]);
        snapshot.sequence = 7;
        doc.on_sync_response(SyncBody::Snapshot {
            snapshot,
            reason: crate::protocol::SnapshotReason::Reset,
        })
        .unwrap();
        assert_eq!(doc.text("body"), Some("012!"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 10);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert_eq!(delays[5], Duration::from_secs(30));
        assert_eq!(delays[9], Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
