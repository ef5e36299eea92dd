//! Edit operations over the named text segments of a document.
//!
//! Positions and lengths are counted in Unicode scalar values (`char`s),
//! never bytes, so that clients in any language agree on offsets.
//!
//! A [`Change`] is what gets a sequence number: an ordered list of
//! operations applied left to right. Clients normally submit a single
//! operation; the transform engine may split a delete in two.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

pub type UserId = String;
pub type DocumentId = String;
pub type SegmentId = String;

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { content: String },
    Delete { length: usize },
}

/// A single edit against one segment.
///
/// `position` is expressed against the segment as the originating client
/// last observed it; the session re-expresses it against server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub segment: SegmentId,
    pub position: usize,
    pub kind: OpKind,
    pub origin_user: UserId,
    pub origin_seq: u64,
    /// Seconds since the unix epoch at the origin.
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    #[error("position {position} (+{length}) out of bounds for segment '{segment}' of length {len}")]
    OutOfBounds {
        segment: SegmentId,
        position: usize,
        length: usize,
        len: usize,
    },
}

impl Operation {
    pub fn insert(segment: impl Into<SegmentId>, position: usize, content: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            position,
            kind: OpKind::Insert {
                content: content.into(),
            },
            origin_user: UserId::new(),
            origin_seq: 0,
            timestamp: 0.0,
        }
    }

    pub fn delete(segment: impl Into<SegmentId>, position: usize, length: usize) -> Self {
        Self {
            segment: segment.into(),
            position,
            kind: OpKind::Delete { length },
            origin_user: UserId::new(),
            origin_seq: 0,
            timestamp: 0.0,
        }
    }

    /// Stamp the origin used for deterministic tie-breaking.
    pub fn with_origin(mut self, user: impl Into<UserId>, origin_seq: u64, timestamp: f64) -> Self {
        self.origin_user = user.into();
        self.origin_seq = origin_seq;
        self.timestamp = timestamp;
        self
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    /// Number of chars inserted (0 for deletes).
    pub fn inserted_len(&self) -> usize {
        match &self.kind {
            OpKind::Insert { content } => content.chars().count(),
            OpKind::Delete { .. } => 0,
        }
    }

    /// Number of chars deleted (0 for inserts).
    pub fn deleted_len(&self) -> usize {
        match self.kind {
            OpKind::Delete { length } => length,
            OpKind::Insert { .. } => 0,
        }
    }

    /// An empty insert or a zero-length delete.
    pub fn is_noop(&self) -> bool {
        match &self.kind {
            OpKind::Insert { content } => content.is_empty(),
            OpKind::Delete { length } => *length == 0,
        }
    }

    /// Segment length after this operation, given the length before it.
    pub fn length_after(&self, len: usize) -> usize {
        (len - self.deleted_len().min(len)).saturating_add(self.inserted_len())
    }

    /// Segment length before this operation, given the length after it.
    pub fn length_before(&self, len: usize) -> usize {
        (len - self.inserted_len().min(len)).saturating_add(self.deleted_len())
    }

    /// One past the last char this operation touches in the old text.
    /// `None` when a delete length runs past `usize::MAX`.
    pub fn end(&self) -> Option<usize> {
        self.position.checked_add(self.deleted_len())
    }

    /// Check that the operation fits a segment of `len` chars.
    pub fn check_bounds(&self, len: usize) -> Result<(), OperationError> {
        if self.position > len || self.end().map_or(true, |end| end > len) {
            return Err(OperationError::OutOfBounds {
                segment: self.segment.clone(),
                position: self.position,
                length: self.deleted_len(),
                len,
            });
        }
        Ok(())
    }

    /// Pull the operation inside a segment of `len` chars.
    ///
    /// Only used for best-effort replay after a full snapshot resync.
    pub fn clamp_to(&mut self, len: usize) {
        self.position = self.position.min(len);
        if let OpKind::Delete { length } = &mut self.kind {
            *length = (*length).min(len - self.position);
        }
    }

    /// Apply to the text of this operation's segment.
    pub fn apply(&self, text: &mut String) -> Result<(), OperationError> {
        let len = text.chars().count();
        self.check_bounds(len)?;
        let start = byte_offset(text, self.position);
        match &self.kind {
            OpKind::Insert { content } => text.insert_str(start, content),
            OpKind::Delete { length } => {
                let end = byte_offset(text, self.position.saturating_add(*length));
                text.replace_range(start..end, "");
            }
        }
        Ok(())
    }
}

/// Byte offset of char index `idx`; `idx` must be `<=` the char count.
fn byte_offset(text: &str, idx: usize) -> usize {
    text.char_indices()
        .nth(idx)
        .map(|(b, _)| b)
        .unwrap_or(text.len())
}

/// Apply a list of operations to a segment map, all or nothing.
///
/// Unknown segments are treated as empty and created on first insert.
pub fn apply_ops(
    segments: &mut BTreeMap<SegmentId, String>,
    ops: &[Operation],
) -> Result<(), OperationError> {
    let mut scratch: BTreeMap<&str, String> = BTreeMap::new();
    for op in ops {
        let text = scratch
            .entry(op.segment.as_str())
            .or_insert_with(|| segments.get(&op.segment).cloned().unwrap_or_default());
        op.apply(text)?;
    }
    let staged: Vec<(String, String)> = scratch
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    for (segment, text) in staged {
        segments.insert(segment, text);
    }
    Ok(())
}

/// An ordered batch of operations that shares one sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Assigned by the server; 0 while unsequenced.
    pub sequence: u64,
    /// Last sequence the origin had integrated when it produced the change.
    pub base_sequence: u64,
    pub origin_user: UserId,
    /// Stable across reconnects of the same client.
    pub origin_client: Uuid,
    /// Client-local counter, used for acknowledgement and de-duplication.
    pub client_seq: u64,
    /// Server instance that finalized the change (nil until finalized).
    pub origin_instance: Uuid,
    pub ops: Vec<Operation>,
}

impl Change {
    pub fn new(
        origin_user: impl Into<UserId>,
        origin_client: Uuid,
        client_seq: u64,
        base_sequence: u64,
        ops: Vec<Operation>,
    ) -> Self {
        Self {
            sequence: 0,
            base_sequence,
            origin_user: origin_user.into(),
            origin_client,
            client_seq,
            origin_instance: Uuid::nil(),
            ops,
        }
    }

    /// Same client submission, regardless of how it was transformed.
    pub fn same_submission(&self, other: &Change) -> bool {
        self.origin_client == other.origin_client && self.client_seq == other.client_seq
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Seconds since the unix epoch.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_apply() {
        let mut text = "hello world".to_string();
        Operation::insert("s", 5, ",").apply(&mut text).unwrap();
        assert_eq!(text, "hello, world");
    }

    #[test]
    fn test_delete_apply() {
        let mut text = "hello world".to_string();
        Operation::delete("s", 5, 6).apply(&mut text).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_char_positions_not_bytes() {
        let mut text = "héllo".to_string();
        Operation::insert("s", 2, "X").apply(&mut text).unwrap();
        assert_eq!(text, "héXllo");
        Operation::delete("s", 1, 2).apply(&mut text).unwrap();
        assert_eq!(text, "hllo");
    }

    #[test]
    fn test_insert_at_end() {
        let mut text = "ab".to_string();
        Operation::insert("s", 2, "c").apply(&mut text).unwrap();
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_out_of_bounds() {
        let mut text = "abc".to_string();
        assert!(Operation::insert("s", 4, "x").apply(&mut text).is_err());
        assert!(Operation::delete("s", 2, 2).apply(&mut text).is_err());
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_overflowing_delete_is_out_of_bounds() {
        let mut text = "abc".to_string();
        let op = Operation::delete("s", 1, usize::MAX);
        assert_eq!(op.end(), None);
        assert!(matches!(op.check_bounds(3), Err(OperationError::OutOfBounds { .. })));
        assert!(op.apply(&mut text).is_err());
        assert_eq!(text, "abc");
        assert_eq!(op.length_before(3), usize::MAX);
        assert_eq!(op.length_after(3), 0);
    }

    #[test]
    fn test_apply_ops_atomic() {
        let mut segments = BTreeMap::new();
        segments.insert("a".to_string(), "one".to_string());
        let ops = vec![
            Operation::insert("a", 3, " two"),
            Operation::delete("a", 0, 100),
        ];
        assert!(apply_ops(&mut segments, &ops).is_err());
        assert_eq!(segments["a"], "one");
    }

    #[test]
    fn test_apply_ops_creates_segment() {
        let mut segments = BTreeMap::new();
        apply_ops(&mut segments, &[Operation::insert("title", 0, "Draft")]).unwrap();
        assert_eq!(segments["title"], "Draft");
    }

    #[test]
    fn test_length_bookkeeping() {
        let ins = Operation::insert("s", 0, "abc");
        let del = Operation::delete("s", 0, 2);
        assert_eq!(ins.length_after(5), 8);
        assert_eq!(ins.length_before(8), 5);
        assert_eq!(del.length_after(5), 3);
        assert_eq!(del.length_before(3), 5);
    }

    #[test]
    fn test_clamp_to() {
        let mut op = Operation::delete("s", 8, 5);
        op.clamp_to(6);
        assert_eq!(op.position, 6);
        assert_eq!(op.deleted_len(), 0);

        let mut op = Operation::delete("s", 2, 10);
        op.clamp_to(6);
        assert_eq!(op.deleted_len(), 4);
    }

    #[test]
    fn test_noop_detection() {
        assert!(Operation::insert("s", 0, "").is_noop());
        assert!(Operation::delete("s", 3, 0).is_noop());
        assert!(!Operation::delete("s", 3, 1).is_noop());
    }
}
