//! Status reconciliation
//!
//! One message record can carry several possibly-contradictory read/delivery
//! indicators written by different schema generations. [`resolve_status`]
//! derives the single canonical `(status, is_read)` pair from all of them.
//!
//! Deterministic and side-effect free; never writes to the store. Monotonic
//! under additional evidence: adding a read indicator to a record can only
//! raise the resolved status, never demote it.
//!
//! ## Evidence precedence
//!
//! Read, any one sufficient:
//! 1. explicit boolean read/seen flag;
//! 2. explicit string status equal to `"read"`;
//! 3. viewer's id in a read-by id list (the sender's own entry never counts);
//! 4. presence of a read timestamp.
//!
//! Absent read evidence, delivery evidence (delivered-to list with a
//! non-sender id, delivered timestamp, or explicit delivered boolean) upgrades
//! an absent/`"sent"` status to `"delivered"`. Explicit `sending`/`failed`
//! statuses are preserved.

use crate::message::MessageStatus;
use crate::record::RawRecord;

/// Boolean read flag aliases
pub const READ_FLAG_ALIASES: &[&str] = &["isRead", "is_read", "read", "seen"];

/// Explicit status string aliases
pub const STATUS_ALIASES: &[&str] = &["status", "messageStatus", "state"];

/// Read-by id list aliases
pub const READ_BY_ALIASES: &[&str] = &["readBy", "read_by", "seenBy", "seen_by"];

/// Read timestamp aliases
pub const READ_AT_ALIASES: &[&str] = &["readAt", "read_at", "seenAt", "seen_at"];

/// Delivered-to id list aliases
pub const DELIVERED_TO_ALIASES: &[&str] = &["deliveredTo", "delivered_to"];

/// Delivered timestamp aliases
pub const DELIVERED_AT_ALIASES: &[&str] = &["deliveredAt", "delivered_at"];

/// Boolean delivered flag aliases
pub const DELIVERED_FLAG_ALIASES: &[&str] = &["delivered", "isDelivered", "is_delivered"];

/// Derive the canonical `(status, is_read)` pair from a raw record
///
/// `viewer_id` is the user whose read state is being resolved; `sender_id` is
/// the message sender as mapped (their own read-by entry is not evidence).
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::{resolve_status, MessageStatus, RawRecord};
/// use serde_json::json;
///
/// let record = RawRecord::new("m1", json!({ "status": "sent", "readBy": ["u1"] }));
/// let (status, is_read) = resolve_status(&record, "u1", "u2");
/// assert!(is_read);
/// assert_eq!(status, Some(MessageStatus::Read));
/// ```
pub fn resolve_status(
    record: &RawRecord,
    viewer_id: &str,
    sender_id: &str,
) -> (Option<MessageStatus>, bool) {
    let explicit = record
        .str_field(STATUS_ALIASES)
        .and_then(MessageStatus::parse);

    let read_by_viewer = !viewer_id.is_empty()
        && viewer_id != sender_id
        && record
            .id_list_field(READ_BY_ALIASES)
            .iter()
            .any(|id| id == viewer_id);

    let is_read = record.bool_field(READ_FLAG_ALIASES).unwrap_or(false)
        || explicit == Some(MessageStatus::Read)
        || read_by_viewer
        || record.millis_field(READ_AT_ALIASES).is_some();

    if is_read {
        return (Some(MessageStatus::Read), true);
    }

    let delivered = record
        .id_list_field(DELIVERED_TO_ALIASES)
        .iter()
        .any(|id| id != sender_id)
        || record.millis_field(DELIVERED_AT_ALIASES).is_some()
        || record.bool_field(DELIVERED_FLAG_ALIASES).unwrap_or(false);

    let status = match explicit {
        Some(MessageStatus::Sent) | None if delivered => Some(MessageStatus::Delivered),
        other => other,
    };

    (status, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(fields: serde_json::Value) -> (Option<MessageStatus>, bool) {
        resolve_status(&RawRecord::new("m1", fields), "viewer", "sender")
    }

    #[test]
    fn test_no_evidence() {
        assert_eq!(resolve(json!({})), (None, false));
        assert_eq!(
            resolve(json!({ "status": "sent" })),
            (Some(MessageStatus::Sent), false)
        );
    }

    #[test]
    fn test_each_read_indicator_is_sufficient() {
        for fields in [
            json!({ "isRead": true }),
            json!({ "seen": true }),
            json!({ "status": "read" }),
            json!({ "readBy": ["viewer"] }),
            json!({ "readAt": 1_000 }),
            json!({ "seen_at": { "seconds": 1 } }),
        ] {
            let (status, is_read) = resolve(fields.clone());
            assert!(is_read, "expected read for {}", fields);
            assert_eq!(status, Some(MessageStatus::Read));
        }
    }

    #[test]
    fn test_sender_in_read_by_does_not_count() {
        let record = RawRecord::new("m1", json!({ "readBy": ["sender"] }));
        let (status, is_read) = resolve_status(&record, "sender", "sender");
        assert!(!is_read);
        assert_eq!(status, None);
    }

    #[test]
    fn test_delivery_evidence_upgrades_sent() {
        for fields in [
            json!({ "deliveredTo": ["viewer"] }),
            json!({ "deliveredAt": 5 }),
            json!({ "delivered": true }),
            json!({ "status": "sent", "isDelivered": true }),
        ] {
            let (status, is_read) = resolve(fields.clone());
            assert!(!is_read, "unexpected read for {}", fields);
            assert_eq!(status, Some(MessageStatus::Delivered), "for {}", fields);
        }
    }

    #[test]
    fn test_delivered_to_only_sender_is_not_delivery() {
        let (status, _) = resolve(json!({ "deliveredTo": ["sender"] }));
        assert_eq!(status, None);
    }

    #[test]
    fn test_delivery_does_not_downgrade_explicit_states() {
        let (status, _) = resolve(json!({ "status": "failed", "delivered": true }));
        assert_eq!(status, Some(MessageStatus::Failed));

        let (status, _) = resolve(json!({ "status": "sending", "delivered": true }));
        assert_eq!(status, Some(MessageStatus::Sending));
    }

    #[test]
    fn test_monotonic_under_added_evidence() {
        // Delivered record gains a read indicator: status rises, never falls
        let (before, _) = resolve(json!({ "deliveredAt": 5 }));
        let (after, is_read) = resolve(json!({ "deliveredAt": 5, "readBy": ["viewer"] }));
        assert_eq!(before, Some(MessageStatus::Delivered));
        assert_eq!(after, Some(MessageStatus::Read));
        assert!(is_read);
        assert!(after.map(MessageStatus::rank) > before.map(MessageStatus::rank));
    }

    #[test]
    fn test_contradictory_flags_resolve_read() {
        // A false flag in one generation cannot veto a true one in another
        let (status, is_read) = resolve(json!({ "isRead": false, "seen_by": ["viewer"] }));
        assert!(is_read);
        assert_eq!(status, Some(MessageStatus::Read));
    }
}
