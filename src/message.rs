//! Canonical message representation and mapping
//!
//! Raw message records arrive with arbitrary field names accumulated over
//! several schema generations. [`map_message`] converts one raw record into
//! the single canonical shape the rest of the engine operates on.
//!
//! The mapper is pure and total: it never fails regardless of which fields are
//! present. Missing content maps to an empty string, missing type to `"text"`,
//! and a missing timestamp stays `None` — a timestamp is never invented, the
//! store assigns it eventually.
//!
//! ## Field aliases
//!
//! | Canonical      | Accepted stored names                                 |
//! |----------------|-------------------------------------------------------|
//! | `content`      | `content`, `text`, `body`, `message`                  |
//! | `sender_id`    | `senderId`, `sender_id`, `from`, `sentBy`             |
//! | `message_type` | `messageType`, `message_type`, `type`                 |
//! | `created_at`   | `createdAt`, `created_at`, `timestamp`, `sentAt`, `time` |
//!
//! Timestamps additionally accept the seconds-based object shape; see
//! [`RawRecord::millis_field`].

use serde::{Deserialize, Serialize};

use crate::record::RawRecord;
use crate::status::resolve_status;

/// Content field aliases, oldest schema last
pub const CONTENT_ALIASES: &[&str] = &["content", "text", "body", "message"];

/// Sender id field aliases
pub const SENDER_ALIASES: &[&str] = &["senderId", "sender_id", "from", "sentBy"];

/// Message type field aliases
pub const TYPE_ALIASES: &[&str] = &["messageType", "message_type", "type"];

/// Timestamp field aliases
pub const TIMESTAMP_ALIASES: &[&str] = &["createdAt", "created_at", "timestamp", "sentAt", "time"];

/// Canonical delivery/read status
///
/// Rank order resolves conflicts between copies of the same message:
/// `Failed(5) > Read(4) > Delivered(3) > Sent(2) > Sending(1)`; an absent
/// status ranks as `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Client echo not yet accepted by the store
    Sending,
    /// Accepted by the store
    Sent,
    /// Evidence a recipient device received it
    Delivered,
    /// Evidence the recipient read it
    Read,
    /// Send permanently failed
    Failed,
}

impl MessageStatus {
    /// Conflict-resolution rank
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Failed => 5,
            MessageStatus::Read => 4,
            MessageStatus::Delivered => 3,
            MessageStatus::Sent => 2,
            MessageStatus::Sending => 1,
        }
    }

    /// Parse a stored status string, tolerating unknown values
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" | "seen" => Some(MessageStatus::Read),
            "failed" | "error" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Stored wire representation
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

/// Rank of an optional status (absent ranks as `Sent`)
pub fn status_rank(status: Option<MessageStatus>) -> u8 {
    status.map_or(2, MessageStatus::rank)
}

/// Normalized, engine-internal message representation
///
/// Invariant: `status == Some(Read)` if and only if `is_read` — the two never
/// disagree after mapping or merging. Content is immutable once the store has
/// assigned `created_at`; the engine only ever touches status-related fields,
/// and only through the read-receipt writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Store-assigned, globally unique id
    pub id: String,

    /// Source conversation record id that produced this copy
    pub conversation_id: String,

    /// Sender user id (empty if the record never carried one)
    pub sender_id: String,

    /// Text content; empty for non-text messages
    pub content: String,

    /// Free-form tag: text/image/audio/file/location
    pub message_type: String,

    /// Epoch millis; `None` until the store timestamps the record
    pub created_at: Option<i64>,

    /// Canonical delivery/read status
    pub status: Option<MessageStatus>,

    /// Whether the viewer has read this message
    pub is_read: bool,
}

impl CanonicalMessage {
    /// Whether this message was sent by the given user
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// Map one raw record into a canonical message
///
/// `source_id` is the conversation record id whose subscription (or fallback
/// query) produced this record; `viewer_id` is needed to resolve read-by
/// lists. Total: degrades gracefully on any missing field.
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::{map_message, RawRecord};
/// use serde_json::json;
///
/// let record = RawRecord::new("m1", json!({ "body": "hi", "from": "u2" }));
/// let msg = map_message(&record, "c1", "u1");
/// assert_eq!(msg.content, "hi");
/// assert_eq!(msg.sender_id, "u2");
/// assert_eq!(msg.message_type, "text");
/// assert_eq!(msg.created_at, None);
/// ```
pub fn map_message(record: &RawRecord, source_id: &str, viewer_id: &str) -> CanonicalMessage {
    let sender_id = record
        .str_field(SENDER_ALIASES)
        .unwrap_or_default()
        .to_string();
    let (status, is_read) = resolve_status(record, viewer_id, &sender_id);

    CanonicalMessage {
        id: record.id.clone(),
        conversation_id: source_id.to_string(),
        sender_id,
        content: record
            .str_field(CONTENT_ALIASES)
            .unwrap_or_default()
            .to_string(),
        message_type: record
            .str_field(TYPE_ALIASES)
            .unwrap_or("text")
            .to_string(),
        created_at: record.millis_field(TIMESTAMP_ALIASES),
        status,
        is_read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_full_record() {
        let record = RawRecord::new(
            "m1",
            json!({
                "content": "hello",
                "senderId": "u2",
                "messageType": "image",
                "createdAt": 1_000,
                "isRead": true
            }),
        );
        let msg = map_message(&record, "c1", "u1");
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.conversation_id, "c1");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.message_type, "image");
        assert_eq!(msg.created_at, Some(1_000));
        assert!(msg.is_read);
        assert_eq!(msg.status, Some(MessageStatus::Read));
    }

    #[test]
    fn test_map_empty_record_is_total() {
        let record = RawRecord::new("m1", json!({}));
        let msg = map_message(&record, "c1", "u1");
        assert_eq!(msg.content, "");
        assert_eq!(msg.sender_id, "");
        assert_eq!(msg.message_type, "text");
        assert_eq!(msg.created_at, None);
        assert_eq!(msg.status, None);
        assert!(!msg.is_read);
    }

    #[test]
    fn test_map_legacy_aliases() {
        let record = RawRecord::new(
            "m1",
            json!({
                "message": "old shape",
                "sentBy": "u9",
                "type": "audio",
                "time": { "seconds": 3, "nanoseconds": 250_000_000 }
            }),
        );
        let msg = map_message(&record, "c1", "u1");
        assert_eq!(msg.content, "old shape");
        assert_eq!(msg.sender_id, "u9");
        assert_eq!(msg.message_type, "audio");
        assert_eq!(msg.created_at, Some(3_250));
    }

    #[test]
    fn test_status_read_and_is_read_never_disagree() {
        // Raw record claims status "sent" but carries a read flag
        let record = RawRecord::new(
            "m1",
            json!({ "text": "x", "status": "sent", "seen": true }),
        );
        let msg = map_message(&record, "c1", "u1");
        assert!(msg.is_read);
        assert_eq!(msg.status, Some(MessageStatus::Read));
    }

    #[test]
    fn test_status_rank_order() {
        assert!(MessageStatus::Failed.rank() > MessageStatus::Read.rank());
        assert!(MessageStatus::Read.rank() > MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() > MessageStatus::Sent.rank());
        assert!(MessageStatus::Sent.rank() > MessageStatus::Sending.rank());
        assert_eq!(status_rank(None), MessageStatus::Sent.rank());
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("SEEN"), Some(MessageStatus::Read));
        assert_eq!(MessageStatus::parse("garbage"), None);
    }
}
