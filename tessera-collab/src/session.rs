//! Authoritative per-document state: segments, sequence and history.
//!
//! A `DocumentSession` is never shared directly; it lives behind the
//! per-document mutex in [`crate::room::DocumentRoom`], which makes
//! transform-then-apply atomic with respect to other edits on the same
//! document while different documents proceed in parallel.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

use crate::operation::{apply_ops, Change, DocumentId, OperationError, SegmentId, UserId};
use crate::transform::transform_many;

/// Full document state at a sequence number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub sequence: u64,
    pub segments: BTreeMap<SegmentId, String>,
    /// Highest applied `client_seq` per client, for replay de-duplication.
    pub clients: BTreeMap<Uuid, u64>,
    /// User each client id first submitted as.
    #[serde(default)]
    pub owners: BTreeMap<Uuid, UserId>,
}

impl DocumentSnapshot {
    pub fn with_segments<I, K, V>(segments: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<SegmentId>,
        V: Into<String>,
    {
        Self {
            sequence: 0,
            segments: segments
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            clients: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("sequence {requested} predates retained history (oldest retained {retained_from})")]
    StaleSequence { requested: u64, retained_from: u64 },
    #[error("sequence {requested} is ahead of the document (at {current})")]
    FutureSequence { requested: u64, current: u64 },
    #[error("client {client} belongs to '{owner}', not '{user}'")]
    ForeignClient { client: Uuid, owner: UserId, user: UserId },
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] OperationError),
    #[error("integrity violation in document '{document}': {detail}")]
    Integrity { document: DocumentId, detail: String },
}

/// Result of submitting a client change.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Finalized change, ready for broadcast.
    Applied { change: Change, transformed: bool },
    /// The same client submission was applied before.
    Duplicate { sequence: u64 },
}

/// Result of mirroring a change finalized on another instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Integration {
    /// Applied in order, followed by any buffered successors.
    Applied(Vec<Change>),
    Duplicate,
    /// Arrived ahead of a missing sequence; held until the gap closes.
    Gap { missing_from: u64 },
    /// A different change already holds this sequence locally.
    Collision { local_instance: Uuid },
}

pub struct DocumentSession {
    document_id: DocumentId,
    instance_id: Uuid,
    segments: BTreeMap<SegmentId, String>,
    sequence: u64,
    history: VecDeque<Change>,
    history_limit: usize,
    clients: BTreeMap<Uuid, u64>,
    owners: BTreeMap<Uuid, UserId>,
    remote_pending: BTreeMap<u64, Change>,
}

impl DocumentSession {
    pub fn new(document_id: impl Into<DocumentId>, instance_id: Uuid, history_limit: usize) -> Self {
        Self::from_snapshot(document_id, instance_id, DocumentSnapshot::default(), history_limit)
    }

    pub fn from_snapshot(
        document_id: impl Into<DocumentId>,
        instance_id: Uuid,
        snapshot: DocumentSnapshot,
        history_limit: usize,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            instance_id,
            segments: snapshot.segments,
            sequence: snapshot.sequence,
            history: VecDeque::with_capacity(history_limit.min(1024)),
            history_limit: history_limit.max(1),
            clients: snapshot.clients,
            owners: snapshot.owners,
            remote_pending: BTreeMap::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn segment(&self, id: &str) -> Option<&str> {
        self.segments.get(id).map(String::as_str)
    }

    pub fn segments(&self) -> &BTreeMap<SegmentId, String> {
        &self.segments
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Last applied `client_seq` for a client, if any.
    pub fn last_client_seq(&self, client: &Uuid) -> Option<u64> {
        self.clients.get(client).copied()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            sequence: self.sequence,
            segments: self.segments.clone(),
            clients: self.clients.clone(),
            owners: self.owners.clone(),
        }
    }

    /// Replace all state. History is discarded, so every client behind
    /// `snapshot.sequence` needs a full resync afterwards.
    pub fn restore(&mut self, snapshot: DocumentSnapshot) {
        self.segments = snapshot.segments;
        self.sequence = snapshot.sequence;
        self.clients = snapshot.clients;
        self.owners = snapshot.owners;
        self.history.clear();
        self.remote_pending.clear();
    }

    /// Index into `history` of the first change after `base`.
    fn history_start(&self, base: u64) -> Result<usize, SessionError> {
        if base > self.sequence {
            return Err(SessionError::FutureSequence {
                requested: base,
                current: self.sequence,
            });
        }
        if base == self.sequence {
            return Ok(self.history.len());
        }
        let oldest = self
            .history
            .front()
            .map_or(self.sequence + 1, |c| c.sequence);
        if base + 1 < oldest {
            return Err(SessionError::StaleSequence {
                requested: base,
                retained_from: oldest,
            });
        }
        Ok((base + 1 - oldest) as usize)
    }

    /// Retained changes at or after `from`, in sequence order.
    pub fn history_since(&self, from: u64) -> impl Iterator<Item = &Change> {
        self.history.iter().filter(move |c| c.sequence >= from)
    }

    /// Every change applied after `base`, in sequence order.
    pub fn changes_since(&self, base: u64) -> Result<Vec<Change>, SessionError> {
        let start = self.history_start(base)?;
        Ok(self.history.iter().skip(start).cloned().collect())
    }

    /// Char length of `segment` as it was right after `history[start - 1]`.
    fn segment_len_at(&self, segment: &str, start: usize) -> usize {
        let mut len = self
            .segments
            .get(segment)
            .map_or(0, |t| t.chars().count());
        for change in self.history.iter().skip(start).rev() {
            for op in change.ops.iter().rev().filter(|op| op.segment == segment) {
                len = op.length_before(len);
            }
        }
        len
    }

    /// Transform a client change against everything it has not seen, then
    /// apply it and assign the next sequence number.
    ///
    /// A client id stays bound to the user that first submitted under it.
    pub fn submit(&mut self, mut change: Change) -> Result<Submission, SessionError> {
        if let Some(owner) = self.owners.get(&change.origin_client) {
            if *owner != change.origin_user {
                return Err(SessionError::ForeignClient {
                    client: change.origin_client,
                    owner: owner.clone(),
                    user: change.origin_user,
                });
            }
        }
        if let Some(&last) = self.clients.get(&change.origin_client) {
            if change.client_seq <= last {
                let sequence = self
                    .history
                    .iter()
                    .find(|c| c.same_submission(&change))
                    .map_or(self.sequence, |c| c.sequence);
                return Ok(Submission::Duplicate { sequence });
            }
        }

        let start = self.history_start(change.base_sequence)?;

        // Validate against the state the client saw.
        let mut lens: HashMap<&str, usize> = HashMap::new();
        for op in &change.ops {
            let len = lens
                .entry(op.segment.as_str())
                .or_insert_with(|| self.segment_len_at(&op.segment, start));
            op.check_bounds(*len)?;
            *len = op.length_after(*len);
        }

        let submitted: Vec<_> = change.ops.iter().filter(|op| !op.is_noop()).cloned().collect();
        let mut ops = submitted.clone();
        for applied in self.history.iter().skip(start) {
            ops = transform_many(&ops, &applied.ops).0;
        }
        let transformed = ops != submitted;

        apply_ops(&mut self.segments, &ops).map_err(|e| SessionError::Integrity {
            document: self.document_id.clone(),
            detail: format!("transformed change does not apply: {e}"),
        })?;

        self.sequence += 1;
        change.sequence = self.sequence;
        change.origin_instance = self.instance_id;
        change.ops = ops;
        self.record(change.clone());

        Ok(Submission::Applied { change, transformed })
    }

    fn record(&mut self, change: Change) {
        let last = self.clients.entry(change.origin_client).or_insert(0);
        *last = (*last).max(change.client_seq);
        self.owners
            .entry(change.origin_client)
            .or_insert_with(|| change.origin_user.clone());
        self.history.push_back(change);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Mirror a change finalized by another instance.
    pub fn integrate_remote(&mut self, change: Change) -> Result<Integration, SessionError> {
        if change.sequence <= self.sequence {
            return Ok(match self.history.iter().find(|c| c.sequence == change.sequence) {
                Some(local)
                    if local.same_submission(&change)
                        && local.origin_instance == change.origin_instance =>
                {
                    Integration::Duplicate
                }
                Some(local) => Integration::Collision {
                    local_instance: local.origin_instance,
                },
                None => Integration::Duplicate,
            });
        }

        if change.sequence > self.sequence + 1 {
            let missing_from = self.sequence + 1;
            self.remote_pending.insert(change.sequence, change);
            return Ok(Integration::Gap { missing_from });
        }

        let mut applied = Vec::new();
        let mut next = Some(change);
        while let Some(change) = next {
            apply_ops(&mut self.segments, &change.ops).map_err(|e| SessionError::Integrity {
                document: self.document_id.clone(),
                detail: format!("mirrored change {} does not apply: {e}", change.sequence),
            })?;
            self.sequence = change.sequence;
            self.record(change.clone());
            applied.push(change);
            next = self.remote_pending.remove(&(self.sequence + 1));
        }
        self.remote_pending.retain(|seq, _| *seq > self.sequence);

        Ok(Integration::Applied(applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    fn session() -> DocumentSession {
        DocumentSession::from_snapshot(
            "doc",
            Uuid::new_v4(),
            DocumentSnapshot::with_segments([("s", "0123456789ABC")]),
            16,
        )
    }

    fn change(user: &str, client: Uuid, client_seq: u64, base: u64, op: Operation) -> Change {
        Change::new(user, client, client_seq, base, vec![op.with_origin(user, client_seq, 1.0)])
    }

    #[test]
    fn test_submit_as_is() {
        let mut s = session();
        let c = change("alice", Uuid::new_v4(), 1, 0, Operation::insert("s", 0, ">"));
        match s.submit(c).unwrap() {
            Submission::Applied { change, transformed } => {
                assert_eq!(change.sequence, 1);
                assert!(!transformed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.segment("s"), Some(">0123456789ABC"));
    }

    #[test]
    fn test_concurrent_submit_is_transformed() {
        let mut s = session();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        s.submit(change("alice", alice, 1, 0, Operation::delete("s", 5, 5))).unwrap();
        let out = s.submit(change("bob", bob, 1, 0, Operation::insert("s", 7, "X"))).unwrap();
        match out {
            Submission::Applied { change, transformed } => {
                assert!(transformed);
                assert_eq!(change.sequence, 2);
                assert_eq!(change.ops[0].position, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.segment("s"), Some("01234XABC"));
    }

    #[test]
    fn test_stale_sequence_rejected() {
        let mut s = DocumentSession::from_snapshot(
            "doc",
            Uuid::new_v4(),
            DocumentSnapshot::with_segments([("s", "")]),
            2,
        );
        let client = Uuid::new_v4();
        for i in 0..4 {
            s.submit(change("a", client, i + 1, i, Operation::insert("s", 0, "x"))).unwrap();
        }
        assert_eq!(s.history_len(), 2);
        let late = change("b", Uuid::new_v4(), 1, 1, Operation::insert("s", 0, "y"));
        assert!(matches!(
            s.submit(late),
            Err(SessionError::StaleSequence { requested: 1, retained_from: 3 })
        ));
        assert!(s.changes_since(2).is_ok());
        assert!(s.changes_since(1).is_err());
    }

    #[test]
    fn test_future_sequence_rejected() {
        let mut s = session();
        let c = change("a", Uuid::new_v4(), 1, 9, Operation::insert("s", 0, "x"));
        assert!(matches!(s.submit(c), Err(SessionError::FutureSequence { .. })));
    }

    #[test]
    fn test_duplicate_submission() {
        let mut s = session();
        let client = Uuid::new_v4();
        let c = change("a", client, 1, 0, Operation::insert("s", 0, "x"));
        s.submit(c.clone()).unwrap();
        assert_eq!(s.submit(c).unwrap(), Submission::Duplicate { sequence: 1 });
        assert_eq!(s.sequence(), 1);
        assert_eq!(s.segment("s"), Some("x0123456789ABC"));
    }

    #[test]
    fn test_invalid_operation_validated_at_base() {
        let mut s = session();
        s.submit(change("a", Uuid::new_v4(), 1, 0, Operation::insert("s", 0, "xyz"))).unwrap();
        // Valid now (len 16) but not against the base the client saw (len 13).
        let c = change("b", Uuid::new_v4(), 1, 0, Operation::insert("s", 15, "!"));
        assert!(matches!(s.submit(c), Err(SessionError::InvalidOperation(_))));
        assert_eq!(s.sequence(), 1);
    }

    #[test]
    fn test_overflowing_delete_rejected() {
        let mut s = session();
        let c = change("mallory", Uuid::new_v4(), 1, 0, Operation::delete("s", 1, usize::MAX));
        assert!(matches!(s.submit(c), Err(SessionError::InvalidOperation(_))));
        let past_end = change("mallory", Uuid::new_v4(), 1, 0, Operation::delete("s", 10, 4));
        assert!(matches!(s.submit(past_end), Err(SessionError::InvalidOperation(_))));
        assert_eq!(s.sequence(), 0);
        assert_eq!(s.segment("s"), Some("0123456789ABC"));

        // Still accepting edits afterwards.
        s.submit(change("alice", Uuid::new_v4(), 1, 0, Operation::delete("s", 10, 3))).unwrap();
        assert_eq!(s.segment("s"), Some("0123456789"));
    }

    #[test]
    fn test_client_id_bound_to_first_user() {
        let mut s = session();
        let alice = Uuid::new_v4();
        s.submit(change("alice", alice, 1, 0, Operation::insert("s", 0, "a"))).unwrap();

        let spoofed = change("mallory", alice, 1_000_000, 1, Operation::insert("s", 0, "m"));
        assert!(matches!(
            s.submit(spoofed),
            Err(SessionError::ForeignClient { ref owner, .. }) if owner == "alice"
        ));

        let next = change("alice", alice, 2, 1, Operation::insert("s", 0, "!"));
        assert!(matches!(s.submit(next).unwrap(), Submission::Applied { .. }));
        assert_eq!(s.segment("s"), Some("!a0123456789ABC"));
        assert_eq!(s.snapshot().owners.get(&alice).map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_changes_since() {
        let mut s = session();
        let client = Uuid::new_v4();
        for i in 0..3 {
            s.submit(change("a", client, i + 1, i, Operation::insert("s", 0, "x"))).unwrap();
        }
        let since = s.changes_since(1).unwrap();
        assert_eq!(since.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![2, 3]);
        assert!(s.changes_since(3).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_restore_clears_history() {
        let mut s = session();
        s.submit(change("a", Uuid::new_v4(), 1, 0, Operation::insert("s", 0, "x"))).unwrap();
        let snap = s.snapshot();
        assert_eq!(snap.sequence, 1);
        s.restore(snap.clone());
        assert_eq!(s.history_len(), 0);
        assert_eq!(s.snapshot(), snap);
        assert!(s.changes_since(0).is_err());
    }

    #[test]
    fn test_integrate_remote_in_order_and_duplicate() {
        let mut origin = session();
        let mut mirror = session();
        let c = change("a", Uuid::new_v4(), 1, 0, Operation::insert("s", 0, "x"));
        let Submission::Applied { change: finalized, .. } = origin.submit(c).unwrap() else {
            panic!("expected applied");
        };
        assert!(matches!(
            mirror.integrate_remote(finalized.clone()).unwrap(),
            Integration::Applied(ref v) if v.len() == 1
        ));
        assert_eq!(mirror.integrate_remote(finalized).unwrap(), Integration::Duplicate);
        assert_eq!(mirror.snapshot().segments, origin.snapshot().segments);
    }

    #[test]
    fn test_integrate_remote_gap_then_fill() {
        let mut origin = session();
        let mut mirror = session();
        let client = Uuid::new_v4();
        let mut finalized = Vec::new();
        for i in 0..3 {
            let c = change("a", client, i + 1, i, Operation::insert("s", 0, "x"));
            if let Submission::Applied { change, .. } = origin.submit(c).unwrap() {
                finalized.push(change);
            }
        }
        assert_eq!(
            mirror.integrate_remote(finalized[2].clone()).unwrap(),
            Integration::Gap { missing_from: 1 }
        );
        mirror.integrate_remote(finalized[0].clone()).unwrap();
        match mirror.integrate_remote(finalized[1].clone()).unwrap() {
            Integration::Applied(v) => assert_eq!(v.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mirror.sequence(), 3);
        assert_eq!(mirror.segment("s"), origin.segment("s"));
    }

    #[test]
    fn test_integrate_remote_collision() {
        let mut a = session();
        let mut b = session();
        let ca = change("a", Uuid::new_v4(), 1, 0, Operation::insert("s", 0, "a"));
        let cb = change("b", Uuid::new_v4(), 1, 0, Operation::insert("s", 0, "b"));
        a.submit(ca).unwrap();
        let Submission::Applied { change: from_b, .. } = b.submit(cb).unwrap() else {
            panic!("expected applied");
        };
        assert!(matches!(
            a.integrate_remote(from_b).unwrap(),
            Integration::Collision { .. }
        ));
    }
}
