//! Message stream merging
//!
//! One logical thread may be backed by several raw conversation records, each
//! with its own live message subscription, plus a legacy flat collection only
//! reachable through one-shot fallback queries. This module fans those streams
//! into one ordered, duplicate-free sequence.
//!
//! No ordering is assumed from the transport: snapshots from different sources
//! arrive in any order, possibly delayed, possibly repeated. Correctness
//! therefore rests on [`merge_messages`] being idempotent and commutative for
//! copies that do not carry conflicting non-empty content — the real-world
//! conflict is a client echo versus the store-confirmed copy, which differ
//! only in bookkeeping fields.
//!
//! [`MessageStreamMerger`] is the synchronous core: it holds the latest
//! snapshot per source, rebuilds the flattened view on every arrival, and is
//! discarded wholesale when the selected thread changes. Subscription wiring
//! lives in [`crate::engine`].

use std::collections::HashMap;

use crate::message::{map_message, CanonicalMessage, MessageStatus};
use crate::record::RawRecord;

/// Deterministically merge two copies of the same message
///
/// `later` is the more recently arrived copy. Field rules:
/// - `content`/`message_type`: the later copy's non-empty value wins, else the
///   earlier copy's is kept;
/// - `created_at`: max of the present values;
/// - `is_read`: OR of both copies;
/// - `status`: `Read` whenever the OR'd `is_read` is true, otherwise the
///   higher-ranked of the two (absent ranks as `sent`, present beats absent at
///   equal rank);
/// - `conversation_id`: the lexicographically smaller source id, so source
///   attribution never depends on which snapshot arrived last.
///
/// Idempotent: `merge_messages(&a, &a) == a`.
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::{merge_messages, CanonicalMessage, MessageStatus};
///
/// let echo = CanonicalMessage {
///     id: "m1".into(),
///     conversation_id: "c1".into(),
///     sender_id: "u1".into(),
///     content: "hi".into(),
///     message_type: "text".into(),
///     created_at: None,
///     status: Some(MessageStatus::Sending),
///     is_read: false,
/// };
/// let confirmed = CanonicalMessage {
///     created_at: Some(1_000),
///     status: Some(MessageStatus::Sent),
///     ..echo.clone()
/// };
///
/// let merged = merge_messages(&echo, &confirmed);
/// assert_eq!(merged.created_at, Some(1_000));
/// assert_eq!(merged.status, Some(MessageStatus::Sent));
/// ```
pub fn merge_messages(earlier: &CanonicalMessage, later: &CanonicalMessage) -> CanonicalMessage {
    let is_read = earlier.is_read || later.is_read;

    let content = if !later.content.is_empty() {
        later.content.clone()
    } else {
        earlier.content.clone()
    };
    let message_type = if !later.message_type.is_empty() {
        later.message_type.clone()
    } else {
        earlier.message_type.clone()
    };
    let sender_id = if !later.sender_id.is_empty() {
        later.sender_id.clone()
    } else {
        earlier.sender_id.clone()
    };

    let created_at = match (earlier.created_at, later.created_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    };

    let status = if is_read {
        Some(MessageStatus::Read)
    } else {
        match (earlier.status, later.status) {
            (status, None) => status,
            (None, status) => status,
            (Some(a), Some(b)) => Some(if b.rank() >= a.rank() { b } else { a }),
        }
    };

    // Ranks are distinct per variant, so the rank comparison above is
    // symmetric; source attribution needs an explicit order-free choice
    let conversation_id = if earlier.conversation_id <= later.conversation_id {
        earlier.conversation_id.clone()
    } else {
        later.conversation_id.clone()
    };

    CanonicalMessage {
        id: later.id.clone(),
        conversation_id,
        sender_id,
        content,
        message_type,
        created_at,
        status,
        is_read,
    }
}

/// Where a snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Origin {
    /// Live per-source subscription
    Live,
    /// One-time legacy flat-collection fallback query
    Legacy,
}

#[derive(Debug)]
struct SourceSnapshot {
    /// Arrival sequence; later snapshots win merge precedence
    seq: u64,
    messages: Vec<CanonicalMessage>,
}

/// Per-thread fan-in of message snapshots from every backing source
///
/// Holds the latest snapshot per `(source id, origin)` and rebuilds the merged
/// view on demand. All methods are synchronous and bounded by the current
/// message count; safe to re-run on every callback.
#[derive(Debug)]
pub struct MessageStreamMerger {
    viewer_id: String,
    snapshots: HashMap<(String, Origin), SourceSnapshot>,
    next_seq: u64,
}

impl MessageStreamMerger {
    /// Create an empty merger for the given viewer
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            snapshots: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Replace the live snapshot for one source
    pub fn apply_live(&mut self, source_id: &str, records: &[RawRecord]) {
        self.apply(source_id, Origin::Live, records);
    }

    /// Replace the legacy fallback snapshot for one source
    ///
    /// Fallback results participate in the same merge rules; ids the live path
    /// later reports merge into the same entries instead of duplicating.
    pub fn apply_legacy(&mut self, source_id: &str, records: &[RawRecord]) {
        self.apply(source_id, Origin::Legacy, records);
    }

    fn apply(&mut self, source_id: &str, origin: Origin, records: &[RawRecord]) {
        let messages = records
            .iter()
            .map(|record| map_message(record, source_id, &self.viewer_id))
            .collect();
        self.next_seq += 1;
        self.snapshots.insert(
            (source_id.to_string(), origin),
            SourceSnapshot {
                seq: self.next_seq,
                messages,
            },
        );
    }

    /// Flattened, deduplicated view, sorted ascending by timestamp
    ///
    /// Messages without a store-assigned timestamp sort as 0 (oldest), with id
    /// as a deterministic tiebreak.
    pub fn merged(&self) -> Vec<CanonicalMessage> {
        let mut ordered: Vec<&SourceSnapshot> = self.snapshots.values().collect();
        ordered.sort_by_key(|snapshot| snapshot.seq);

        let mut by_id: HashMap<String, CanonicalMessage> = HashMap::new();
        for snapshot in ordered {
            for incoming in &snapshot.messages {
                match by_id.get(&incoming.id) {
                    Some(existing) => {
                        let merged = merge_messages(existing, incoming);
                        by_id.insert(incoming.id.clone(), merged);
                    }
                    None => {
                        by_id.insert(incoming.id.clone(), incoming.clone());
                    }
                }
            }
        }

        let mut messages: Vec<CanonicalMessage> = by_id.into_values().collect();
        messages.sort_by(|a, b| {
            let ta = a.created_at.unwrap_or(0);
            let tb = b.created_at.unwrap_or(0);
            ta.cmp(&tb).then_with(|| a.id.cmp(&b.id))
        });
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(id: &str, content: &str, created_at: Option<i64>) -> CanonicalMessage {
        CanonicalMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "u2".to_string(),
            content: content.to_string(),
            message_type: "text".to_string(),
            created_at,
            status: None,
            is_read: false,
        }
    }

    #[test]
    fn test_merge_idempotent() {
        let a = msg("m1", "hello", Some(100));
        assert_eq!(merge_messages(&a, &a), a);
    }

    #[test]
    fn test_merge_commutative_for_bookkeeping_conflicts() {
        let mut a = msg("m1", "hello", Some(100));
        a.status = Some(MessageStatus::Sent);
        let mut b = msg("m1", "", Some(200));
        b.is_read = true;

        let ab = merge_messages(&a, &b);
        let ba = merge_messages(&b, &a);
        assert_eq!(ab.content, ba.content);
        assert_eq!(ab.created_at, ba.created_at);
        assert_eq!(ab.is_read, ba.is_read);
        assert_eq!(ab.status, ba.status);

        assert_eq!(ab.content, "hello");
        assert_eq!(ab.created_at, Some(200));
        assert!(ab.is_read);
        assert_eq!(ab.status, Some(MessageStatus::Read));
    }

    #[test]
    fn test_merge_read_or() {
        let a = msg("m1", "x", Some(1));
        let mut b = msg("m1", "x", Some(1));
        b.is_read = true;
        b.status = Some(MessageStatus::Read);

        let merged = merge_messages(&a, &b);
        assert!(merged.is_read);
        assert_eq!(merged.status, Some(MessageStatus::Read));
    }

    #[test]
    fn test_merge_status_rank() {
        let mut a = msg("m1", "x", Some(1));
        a.status = Some(MessageStatus::Delivered);
        let mut b = msg("m1", "x", Some(1));
        b.status = Some(MessageStatus::Sending);

        // Higher rank wins regardless of arrival order
        assert_eq!(merge_messages(&a, &b).status, Some(MessageStatus::Delivered));
        assert_eq!(merge_messages(&b, &a).status, Some(MessageStatus::Delivered));

        // Failed outranks everything
        b.status = Some(MessageStatus::Failed);
        assert_eq!(merge_messages(&a, &b).status, Some(MessageStatus::Failed));
    }

    #[test]
    fn test_merge_status_present_beats_absent_at_equal_rank() {
        let mut a = msg("m1", "x", Some(1));
        a.status = Some(MessageStatus::Sent);
        let b = msg("m1", "x", Some(1));
        assert_eq!(b.status, None);

        // None ranks as Sent; the explicit value must survive either order
        assert_eq!(merge_messages(&a, &b).status, Some(MessageStatus::Sent));
        assert_eq!(merge_messages(&b, &a).status, Some(MessageStatus::Sent));
    }

    #[test]
    fn test_merge_source_attribution_order_independent() {
        let mut a = msg("m1", "x", Some(1));
        a.conversation_id = "c2".to_string();
        let mut b = msg("m1", "x", Some(1));
        b.conversation_id = "c1".to_string();

        // Copies of one message from two duplicate records must resolve to
        // the same source regardless of which snapshot landed last
        assert_eq!(merge_messages(&a, &b).conversation_id, "c1");
        assert_eq!(merge_messages(&b, &a).conversation_id, "c1");
    }

    #[test]
    fn test_merge_timestamp_max() {
        let a = msg("m1", "x", None);
        let b = msg("m1", "x", Some(50));
        assert_eq!(merge_messages(&a, &b).created_at, Some(50));
        assert_eq!(merge_messages(&b, &a).created_at, Some(50));
        assert_eq!(merge_messages(&a, &a).created_at, None);
    }

    #[test]
    fn test_merger_dedupes_across_sources() {
        let mut merger = MessageStreamMerger::new("A");
        merger.apply_live(
            "c1",
            &[RawRecord::new(
                "m1",
                json!({ "text": "hi", "senderId": "B", "createdAt": 100, "is_read": false, "status": "sent" }),
            )],
        );
        merger.apply_legacy(
            "c2",
            &[RawRecord::new("m1", json!({ "read_by": ["A"] }))],
        );

        let merged = merger.merged();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content, "hi");
        assert!(merged[0].is_read);
        assert_eq!(merged[0].status, Some(MessageStatus::Read));
    }

    #[test]
    fn test_merger_order_independent() {
        let live = RawRecord::new(
            "m1",
            json!({ "text": "hi", "senderId": "B", "createdAt": 100, "status": "sent" }),
        );
        let legacy = RawRecord::new("m1", json!({ "read_by": ["A"] }));

        let mut forward = MessageStreamMerger::new("A");
        forward.apply_live("c1", std::slice::from_ref(&live));
        forward.apply_legacy("c2", std::slice::from_ref(&legacy));

        let mut reverse = MessageStreamMerger::new("A");
        reverse.apply_legacy("c2", std::slice::from_ref(&legacy));
        reverse.apply_live("c1", std::slice::from_ref(&live));

        assert_eq!(forward.merged(), reverse.merged());
    }

    #[test]
    fn test_merger_sorts_missing_timestamps_oldest() {
        let mut merger = MessageStreamMerger::new("A");
        merger.apply_live(
            "c1",
            &[
                RawRecord::new("m2", json!({ "text": "second", "createdAt": 200 })),
                RawRecord::new("m0", json!({ "text": "pending" })),
                RawRecord::new("m1", json!({ "text": "first", "createdAt": 100 })),
            ],
        );

        let merged = merger.merged();
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn test_merger_snapshot_replacement_is_bounded() {
        let mut merger = MessageStreamMerger::new("A");
        for _ in 0..10 {
            merger.apply_live("c1", &[RawRecord::new("m1", json!({ "text": "hi" }))]);
        }
        assert_eq!(merger.merged().len(), 1);
    }
}
