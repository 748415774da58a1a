//! Idempotent read-receipt writing
//!
//! When a thread is open, every visible inbound message that is not yet read
//! gets marked read in the store. One update writes the "read" fact in every
//! recognized field-name variant simultaneously, so any consumer reading any
//! schema generation observes it.
//!
//! A message's record may live under any of the raw conversation records
//! backing the logical thread, or only in the legacy flat collection, so the
//! writer tries storage shapes in order: the message's own source id, then
//! every other source id backing the thread, then the legacy path — stopping
//! at the first update that succeeds.
//!
//! The [`ReadReceiptGuard`] remembers what was already submitted while the
//! thread stays open; it is cleared on every thread switch. A message whose
//! every attempt failed is simply retried on the next trigger.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::message::CanonicalMessage;
use crate::store::DocumentStore;

/// In-memory de-duplication of outgoing "mark as read" writes
///
/// Keyed by `(source id, message id)`; lives only as long as the currently
/// open thread.
#[derive(Debug, Default)]
pub struct ReadReceiptGuard {
    submitted: HashSet<(String, String)>,
}

impl ReadReceiptGuard {
    /// Create an empty guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful write; returns false if already recorded
    pub fn mark(&mut self, source_id: &str, message_id: &str) -> bool {
        self.submitted
            .insert((source_id.to_string(), message_id.to_string()))
    }

    /// Whether a write for this message was already recorded under any source
    pub fn is_submitted(&self, message_id: &str) -> bool {
        self.submitted.iter().any(|(_, id)| id == message_id)
    }

    /// Forget everything; called when the selected thread changes
    pub fn reset(&mut self) {
        self.submitted.clear();
    }
}

/// Writes read receipts for visible inbound messages of the open thread
pub struct ReadReceiptWriter {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    viewer_id: String,
    conversations_path: String,
    legacy_messages_path: String,
    guard: ReadReceiptGuard,
}

impl ReadReceiptWriter {
    /// Create a writer for the given viewer
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        viewer_id: impl Into<String>,
        conversations_path: &str,
        legacy_messages_path: &str,
    ) -> Self {
        Self {
            store,
            clock,
            viewer_id: viewer_id.into(),
            conversations_path: conversations_path.to_string(),
            legacy_messages_path: legacy_messages_path.to_string(),
            guard: ReadReceiptGuard::new(),
        }
    }

    /// Clear the guard; must be called whenever the open thread changes
    pub fn reset(&mut self) {
        self.guard.reset();
    }

    /// Mark every visible unread inbound message as read, idempotently
    ///
    /// `source_ids` are the raw record ids backing the open thread. Returns
    /// the number of successful store writes. Safe to call on every merged
    /// view rebuild: the guard and the messages' own read flags keep repeat
    /// invocations write-free.
    pub async fn mark_visible_read(
        &mut self,
        source_ids: &[String],
        messages: &[CanonicalMessage],
    ) -> usize {
        let mut written = 0;
        for message in messages {
            if message.is_read
                || message.sender_id == self.viewer_id
                || self.guard.is_submitted(&message.id)
            {
                continue;
            }
            if self.mark_one(source_ids, message).await {
                written += 1;
            }
        }
        written
    }

    /// Try each storage shape for one message, stopping at the first success
    async fn mark_one(&mut self, source_ids: &[String], message: &CanonicalMessage) -> bool {
        let fields = json!({
            "isRead": true,
            "is_read": true,
            "read": true,
            "seen": true,
            "status": "read",
            "readAt": self.clock.now_millis(),
        });

        let mut candidates: Vec<(String, String)> = Vec::with_capacity(source_ids.len() + 1);
        // Own source first, then the thread's other sources
        candidates.push((
            message.conversation_id.clone(),
            self.message_path(&message.conversation_id, &message.id),
        ));
        for source_id in source_ids {
            if *source_id != message.conversation_id {
                candidates.push((source_id.clone(), self.message_path(source_id, &message.id)));
            }
        }
        // Legacy flat collection last
        candidates.push((
            self.legacy_messages_path.clone(),
            format!("{}/{}", self.legacy_messages_path, message.id),
        ));

        for (source_id, path) in candidates {
            match self.store.update(&path, fields.clone()).await {
                Ok(()) => {
                    self.guard.mark(&source_id, &message.id);
                    debug!(message_id = %message.id, %path, "read receipt written");
                    return true;
                }
                Err(error) => {
                    debug!(message_id = %message.id, %path, %error, "read receipt attempt failed");
                }
            }
        }

        // Not held in-flight; the next visible-unread recomputation retries
        warn!(
            message_id = %message.id,
            "read receipt failed across all storage shapes; will retry on next trigger"
        );
        false
    }

    fn message_path(&self, source_id: &str, message_id: &str) -> String {
        format!(
            "{}/{}/messages/{}",
            self.conversations_path, source_id, message_id
        )
    }
}
