//! Conversation deduplication
//!
//! The store enforces no uniqueness: two writers racing to start a chat
//! between the same pair of participants produce two conversation records, and
//! both may accumulate real messages and unread counters before anyone
//! notices. The deduplicator groups raw records by their order-independent
//! participant set and exposes one [`LogicalThread`] per set.
//!
//! Recomputation is a full O(records) pass per change batch; at chat scale no
//! incremental indexing is needed. The deduplicator retains every record it
//! has seen, keyed by record id, so partial snapshot batches cannot drop
//! previously known groups. Record deletion is not propagated; the store is
//! append-only for conversation records in practice.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::record::RawRecord;

/// Ordered pair-field participant aliases
pub const PAIR_ALIASES: &[(&str, &str)] = &[("participant1", "participant2"), ("user1", "user2")];

/// Array participant aliases
pub const PARTICIPANTS_ALIASES: &[&str] = &["participants", "participantIds", "members", "users"];

/// Denormalized last-message text aliases
pub const LAST_MESSAGE_ALIASES: &[&str] = &["lastMessage", "last_message", "lastMessageText"];

/// Denormalized last-message timestamp aliases
pub const LAST_MESSAGE_AT_ALIASES: &[&str] =
    &["lastMessageAt", "last_message_at", "lastMessageTime"];

/// Record update timestamp aliases
pub const UPDATED_AT_ALIASES: &[&str] = &["updatedAt", "updated_at"];

/// Per-user unread counter map aliases
pub const UNREAD_ALIASES: &[&str] = &["unreadCount", "unread_count", "unreadCounts"];

/// The application-level notion of "the conversation with this set of
/// participants"
///
/// Invariants: exactly one thread exists per unordered participant set;
/// `participant_ids` is non-empty and deduplicated; `source_ids` lists every
/// raw record id backing the thread (≥1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalThread {
    /// Winning raw record's id; display/navigation handle
    pub id: String,

    /// Ordered unique participant ids
    pub participant_ids: Vec<String>,

    /// All raw record ids mapping to this participant set
    pub source_ids: Vec<String>,

    /// Denormalized last message text from the winning record, with loser
    /// fallback
    pub last_message_text: Option<String>,

    /// Denormalized last message timestamp, winner-first
    pub last_message_at: Option<i64>,

    /// Record update timestamp, winner-first
    pub updated_at: Option<i64>,

    /// Sum of the viewer's unread counters across all source records
    pub merged_unread_count: i64,
}

impl LogicalThread {
    /// Most recent activity instant, for display ordering
    pub fn activity(&self) -> i64 {
        self.updated_at.or(self.last_message_at).unwrap_or(0)
    }

    /// Participants other than the given user
    pub fn peers_of(&self, user_id: &str) -> Vec<String> {
        self.participant_ids
            .iter()
            .filter(|id| id.as_str() != user_id)
            .cloned()
            .collect()
    }
}

/// Extract the participant id list from a raw conversation record
///
/// Prefers an array field under any known alias, falling back to the ordered
/// two-field pair representation. Entries are deduplicated preserving first
/// occurrence; an empty result means the record is not a usable conversation.
pub fn participant_ids(record: &RawRecord) -> Vec<String> {
    let mut ids = record.id_list_field(PARTICIPANTS_ALIASES);
    if ids.is_empty() {
        for (first, second) in PAIR_ALIASES.iter().copied() {
            let a = record.str_field(&[first]);
            let b = record.str_field(&[second]);
            if a.is_some() || b.is_some() {
                ids = [a, b].into_iter().flatten().map(str::to_string).collect();
                break;
            }
        }
    }
    ids.retain(|id| !id.is_empty());
    dedup_preserving_order(ids)
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// Order-independent grouping key for a participant set
pub fn participant_key(ids: &[String]) -> String {
    let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join("\u{1f}")
}

/// The viewer's unread counter on one raw record
pub fn unread_count_for(record: &RawRecord, viewer_id: &str) -> i64 {
    record
        .map_field(UNREAD_ALIASES)
        .and_then(|counts| counts.get(viewer_id))
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0)
}

fn record_activity(record: &RawRecord) -> i64 {
    record
        .millis_field(UPDATED_AT_ALIASES)
        .or_else(|| record.millis_field(LAST_MESSAGE_AT_ALIASES))
        .unwrap_or(0)
}

/// Live view over the conversation collection, regrouped on every batch
///
/// The synchronous core of the conversation pipeline: [`crate::engine`] feeds
/// it subscription batches and publishes the recomputed thread list.
#[derive(Debug)]
pub struct ConversationDeduplicator {
    viewer_id: String,
    /// Every record ever seen, keyed by record id; upserted per batch
    records: HashMap<String, RawRecord>,
}

impl ConversationDeduplicator {
    /// Create an empty deduplicator for the given viewer
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            records: HashMap::new(),
        }
    }

    /// Upsert a snapshot batch of raw conversation records
    pub fn apply_batch(&mut self, records: &[RawRecord]) {
        for record in records {
            self.records.insert(record.id.clone(), record.clone());
        }
    }

    /// Latest raw record by id, if known
    pub fn record(&self, id: &str) -> Option<&RawRecord> {
        self.records.get(id)
    }

    /// Recompute all logical threads, most recent activity first
    pub fn threads(&self) -> Vec<LogicalThread> {
        let mut groups: HashMap<String, Vec<&RawRecord>> = HashMap::new();
        for record in self.records.values() {
            let ids = participant_ids(record);
            if ids.is_empty() {
                continue;
            }
            groups.entry(participant_key(&ids)).or_default().push(record);
        }

        let mut threads: Vec<LogicalThread> = groups
            .into_values()
            .map(|group| self.build_thread(group))
            .collect();
        threads.sort_by(|a, b| b.activity().cmp(&a.activity()).then_with(|| a.id.cmp(&b.id)));
        threads
    }

    /// Thread whose participant set matches the given ids, if any
    pub fn find_by_participants(&self, ids: &[String]) -> Option<LogicalThread> {
        let key = participant_key(ids);
        self.threads()
            .into_iter()
            .find(|thread| participant_key(&thread.participant_ids) == key)
    }

    /// Sum of merged unread counters over all threads (badge count)
    pub fn total_unread(&self) -> i64 {
        self.threads()
            .iter()
            .map(|thread| thread.merged_unread_count)
            .sum()
    }

    fn build_thread(&self, mut group: Vec<&RawRecord>) -> LogicalThread {
        // Newest record wins; id tiebreak keeps the choice deterministic
        group.sort_by(|a, b| {
            record_activity(b)
                .cmp(&record_activity(a))
                .then_with(|| b.id.cmp(&a.id))
        });
        let winner = group[0];

        let mut last_message_text = winner
            .str_field(LAST_MESSAGE_ALIASES)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let mut last_message_at = winner.millis_field(LAST_MESSAGE_AT_ALIASES);
        let mut updated_at = winner.millis_field(UPDATED_AT_ALIASES);

        // Loser fields fill only where the winner's are empty
        for record in &group[1..] {
            if last_message_text.is_none() {
                last_message_text = record
                    .str_field(LAST_MESSAGE_ALIASES)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
            }
            if last_message_at.is_none() {
                last_message_at = record.millis_field(LAST_MESSAGE_AT_ALIASES);
            }
            if updated_at.is_none() {
                updated_at = record.millis_field(UPDATED_AT_ALIASES);
            }
        }

        let merged_unread_count = group
            .iter()
            .map(|record| unread_count_for(record, &self.viewer_id))
            .sum();

        let mut source_ids: Vec<String> = group.iter().map(|r| r.id.clone()).collect();
        source_ids.sort_unstable();

        LogicalThread {
            id: winner.id.clone(),
            participant_ids: participant_ids(winner),
            source_ids,
            last_message_text,
            last_message_at,
            updated_at,
            merged_unread_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_participant_extraction_shapes() {
        let array = RawRecord::new("c1", json!({ "participants": ["b", "a", "b"] }));
        assert_eq!(participant_ids(&array), vec!["b", "a"]);

        let pair = RawRecord::new("c2", json!({ "participant1": "a", "participant2": "b" }));
        assert_eq!(participant_ids(&pair), vec!["a", "b"]);

        let legacy_pair = RawRecord::new("c3", json!({ "user1": "x", "user2": "y" }));
        assert_eq!(participant_ids(&legacy_pair), vec!["x", "y"]);

        let empty = RawRecord::new("c4", json!({ "lastMessage": "hi" }));
        assert!(participant_ids(&empty).is_empty());
    }

    #[test]
    fn test_participant_key_order_independent() {
        let ab = participant_key(&["a".to_string(), "b".to_string()]);
        let ba = participant_key(&["b".to_string(), "a".to_string()]);
        assert_eq!(ab, ba);
        assert_ne!(ab, participant_key(&["a".to_string(), "c".to_string()]));
    }

    #[test]
    fn test_duplicate_records_collapse_to_one_thread() {
        let mut dedup = ConversationDeduplicator::new("A");
        dedup.apply_batch(&[
            RawRecord::new(
                "c1",
                json!({
                    "participant1": "A", "participant2": "B",
                    "updatedAt": 100,
                    "lastMessage": "older text",
                    "unreadCount": { "A": 2 }
                }),
            ),
            RawRecord::new(
                "c2",
                json!({
                    "participants": ["B", "A"],
                    "updatedAt": 200,
                    "unreadCount": { "A": 1 }
                }),
            ),
        ]);

        let threads = dedup.threads();
        assert_eq!(threads.len(), 1);
        let thread = &threads[0];
        assert_eq!(thread.id, "c2");
        assert_eq!(thread.source_ids, vec!["c1", "c2"]);
        assert_eq!(thread.merged_unread_count, 3);
        // Winner has no last-message text; loser's fills in
        assert_eq!(thread.last_message_text.as_deref(), Some("older text"));
        assert_eq!(thread.updated_at, Some(200));
    }

    #[test]
    fn test_distinct_pairs_stay_separate() {
        let mut dedup = ConversationDeduplicator::new("A");
        dedup.apply_batch(&[
            RawRecord::new("c1", json!({ "participants": ["A", "B"], "updatedAt": 10 })),
            RawRecord::new("c2", json!({ "participants": ["A", "C"], "updatedAt": 20 })),
        ]);

        let threads = dedup.threads();
        assert_eq!(threads.len(), 2);
        // Most recent activity first
        assert_eq!(threads[0].id, "c2");
    }

    #[test]
    fn test_partial_batches_do_not_drop_groups() {
        let mut dedup = ConversationDeduplicator::new("A");
        dedup.apply_batch(&[RawRecord::new(
            "c1",
            json!({ "participants": ["A", "B"], "updatedAt": 10 }),
        )]);
        // Later batch only mentions another record
        dedup.apply_batch(&[RawRecord::new(
            "c2",
            json!({ "participants": ["A", "C"], "updatedAt": 20 }),
        )]);

        assert_eq!(dedup.threads().len(), 2);
    }

    #[test]
    fn test_unread_sum_not_max() {
        let mut dedup = ConversationDeduplicator::new("A");
        dedup.apply_batch(&[
            RawRecord::new(
                "c1",
                json!({ "participants": ["A", "B"], "unread_count": { "A": 4, "B": 9 } }),
            ),
            RawRecord::new(
                "c2",
                json!({ "participants": ["A", "B"], "unreadCount": { "A": 4 } }),
            ),
        ]);

        assert_eq!(dedup.threads()[0].merged_unread_count, 8);
        assert_eq!(dedup.total_unread(), 8);
    }

    #[test]
    fn test_activity_falls_back_to_last_message_at() {
        let mut dedup = ConversationDeduplicator::new("A");
        dedup.apply_batch(&[
            RawRecord::new(
                "c1",
                json!({ "participants": ["A", "B"], "lastMessageAt": 300 }),
            ),
            RawRecord::new(
                "c2",
                json!({ "participants": ["A", "B"], "updatedAt": 100 }),
            ),
        ]);

        // c1's lastMessageAt (300) beats c2's updatedAt (100)
        assert_eq!(dedup.threads()[0].id, "c1");
    }

    #[test]
    fn test_find_by_participants() {
        let mut dedup = ConversationDeduplicator::new("A");
        dedup.apply_batch(&[RawRecord::new(
            "c1",
            json!({ "participant1": "A", "participant2": "B" }),
        )]);

        let found = dedup.find_by_participants(&["B".to_string(), "A".to_string()]);
        assert_eq!(found.map(|t| t.id), Some("c1".to_string()));
        assert!(dedup
            .find_by_participants(&["A".to_string(), "C".to_string()])
            .is_none());
    }

    #[test]
    fn test_peers_of() {
        let thread = LogicalThread {
            id: "c1".to_string(),
            participant_ids: vec!["A".to_string(), "B".to_string()],
            source_ids: vec!["c1".to_string()],
            last_message_text: None,
            last_message_at: None,
            updated_at: None,
            merged_unread_count: 0,
        };
        assert_eq!(thread.peers_of("A"), vec!["B"]);
    }
}
