//! Engine orchestration
//!
//! [`ChatEngine`] wires the synchronous reconciliation cores to the store's
//! live subscriptions and exposes the derived views through watch channels:
//!
//! - the deduplicated thread list ([`ChatEngine::threads`]);
//! - the selected thread's merged message view ([`ChatEngine::messages`]);
//! - presence labels for visible peers ([`ChatEngine::presence_labels`]).
//!
//! Ownership of subscriptions follows the selection lifecycle: the
//! conversation subscription lives as long as the engine, message
//! subscriptions as long as the selected thread, presence subscriptions as
//! long as their peer stays visible. Thread switches tear down the old message
//! pumps (dropping their subscriptions) and reset all per-thread state before
//! establishing the new ones.
//!
//! A failure on one thread's message stream degrades only that thread's view
//! to [`ThreadView::Unavailable`]; every other subscription keeps running, and
//! the view heals on the next successful snapshot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::dedup::{ConversationDeduplicator, LogicalThread, UNREAD_ALIASES};
use crate::error::{EngineError, Result};
use crate::merge::MessageStreamMerger;
use crate::message::CanonicalMessage;
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_TICK};
use crate::receipts::ReadReceiptWriter;
use crate::resolver::ThreadResolver;
use crate::store::{DocumentStore, Filter, StoreEvent};

/// Result limit for legacy fallback message queries
const LEGACY_QUERY_LIMIT: usize = 500;

/// Legacy flat-collection filter field variants for a source id
const LEGACY_SOURCE_FIELDS: &[&str] = &["conversationId", "conversation_id"];

/// Collection paths and timing knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Conversation records collection
    pub conversations_path: String,
    /// Legacy flat message collection
    pub legacy_messages_path: String,
    /// Presence documents collection
    pub users_path: String,
    /// Presence label refresh interval
    pub presence_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conversations_path: "conversations".to_string(),
            legacy_messages_path: "messages".to_string(),
            users_path: "users".to_string(),
            presence_tick: DEFAULT_PRESENCE_TICK,
        }
    }
}

/// State of the selected thread's message view
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadView {
    /// No thread selected
    Idle,
    /// Selected, first snapshot not yet merged
    Loading,
    /// Merged, ordered, duplicate-free message list
    Ready(Vec<CanonicalMessage>),
    /// The live stream reported a failure; self-heals on the next snapshot
    Unavailable(String),
}

struct ActiveThread {
    thread: LogicalThread,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ActiveThread {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Reconciliation engine facade
///
/// Single-writer by design: one engine instance per signed-in viewer, driven
/// from one logical execution context. All heavy lifting is delegated to the
/// synchronous cores; the engine only pumps subscriptions into them.
pub struct ChatEngine {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    viewer_id: String,
    config: EngineConfig,
    dedup: Arc<Mutex<ConversationDeduplicator>>,
    presence: Arc<Mutex<PresenceTracker>>,
    resolver: ThreadResolver,
    threads_tx: Arc<watch::Sender<Vec<LogicalThread>>>,
    messages_tx: Arc<watch::Sender<ThreadView>>,
    /// Send target with no thread yet; still gets presence
    pending_peer: Arc<Mutex<Option<String>>>,
    conversations_task: Option<JoinHandle<()>>,
    active: Option<ActiveThread>,
}

impl ChatEngine {
    /// Create an engine for the given viewer with default paths
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        viewer_id: impl Into<String>,
    ) -> Self {
        Self::with_config(store, clock, viewer_id, EngineConfig::default())
    }

    /// Create an engine with explicit configuration
    pub fn with_config(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        viewer_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        let viewer_id = viewer_id.into();
        let (threads_tx, _) = watch::channel(Vec::new());
        let (messages_tx, _) = watch::channel(ThreadView::Idle);
        let presence = PresenceTracker::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            &config.users_path,
        )
        .with_tick_interval(config.presence_tick);
        let resolver = ThreadResolver::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            &config.conversations_path,
        );

        Self {
            dedup: Arc::new(Mutex::new(ConversationDeduplicator::new(viewer_id.clone()))),
            presence: Arc::new(Mutex::new(presence)),
            resolver,
            threads_tx: Arc::new(threads_tx),
            messages_tx: Arc::new(messages_tx),
            pending_peer: Arc::new(Mutex::new(None)),
            conversations_task: None,
            active: None,
            store,
            clock,
            viewer_id,
            config,
        }
    }

    /// Subscribe to the deduplicated thread list, most recent first
    pub fn threads(&self) -> watch::Receiver<Vec<LogicalThread>> {
        self.threads_tx.subscribe()
    }

    /// Subscribe to the selected thread's message view
    pub fn messages(&self) -> watch::Receiver<ThreadView> {
        self.messages_tx.subscribe()
    }

    /// Subscribe to the peer-id → presence-label map
    pub fn presence_labels(&self) -> watch::Receiver<std::collections::HashMap<String, String>> {
        self.presence.lock().expect("presence lock").labels()
    }

    /// Sum of unread counters over all threads (badge count)
    pub fn total_unread(&self) -> i64 {
        self.dedup.lock().expect("dedup lock").total_unread()
    }

    /// Watch presence for a peer with no thread yet
    ///
    /// Compose surfaces call this when the user picks a send target, so the
    /// target's presence label is live before the first message creates the
    /// thread. `None` clears the target. A send to the pending peer also
    /// clears it; once the thread exists the peer stays watched through the
    /// thread list.
    pub fn set_pending_peer(&mut self, peer_id: Option<&str>) {
        *self.pending_peer.lock().expect("pending peer lock") = peer_id.map(str::to_string);
        self.refresh_watched();
    }

    /// Reconcile the presence tracker against the visible peer set
    fn refresh_watched(&self) {
        let mut peers: HashSet<String> = self
            .threads_tx
            .borrow()
            .iter()
            .flat_map(|thread| thread.peers_of(&self.viewer_id))
            .collect();
        if let Some(peer) = self.pending_peer.lock().expect("pending peer lock").clone() {
            peers.insert(peer);
        }
        self.presence.lock().expect("presence lock").set_watched(&peers);
    }

    /// Start the conversation subscription and the presence ticker
    ///
    /// Idempotent; subsequent calls are no-ops.
    pub fn start(&mut self) {
        if self.conversations_task.is_some() {
            return;
        }
        self.presence.lock().expect("presence lock").start_ticker();

        let mut subscription = self.store.subscribe(&self.config.conversations_path, None);
        let dedup = Arc::clone(&self.dedup);
        let presence = Arc::clone(&self.presence);
        let threads_tx = Arc::clone(&self.threads_tx);
        let pending_peer = Arc::clone(&self.pending_peer);
        let viewer_id = self.viewer_id.clone();

        info!(viewer_id = %viewer_id, "engine started");
        self.conversations_task = Some(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    StoreEvent::Snapshot(batch) => {
                        let threads = {
                            let mut dedup = dedup.lock().expect("dedup lock");
                            dedup.apply_batch(&batch);
                            dedup.threads()
                        };
                        let mut peers: HashSet<String> = threads
                            .iter()
                            .flat_map(|thread| thread.peers_of(&viewer_id))
                            .collect();
                        if let Some(peer) =
                            pending_peer.lock().expect("pending peer lock").clone()
                        {
                            peers.insert(peer);
                        }
                        presence.lock().expect("presence lock").set_watched(&peers);
                        debug!(threads = threads.len(), "thread list recomputed");
                        threads_tx.send_replace(threads);
                    }
                    StoreEvent::Error(message) => {
                        // Last known thread list stays visible
                        let error = EngineError::Subscription(message);
                        warn!(%error, "conversation stream degraded");
                    }
                }
            }
        }));
    }

    /// Select a logical thread by its id (or any of its source ids)
    ///
    /// Tears down the previous thread's subscriptions and per-thread state,
    /// runs the one-time legacy fallback queries, then establishes one live
    /// subscription per backing source.
    pub async fn select_thread(&mut self, thread_id: &str) -> Result<()> {
        let thread = self
            .threads_tx
            .borrow()
            .iter()
            .find(|thread| {
                thread.id == thread_id || thread.source_ids.iter().any(|id| id == thread_id)
            })
            .cloned()
            .ok_or_else(|| EngineError::ThreadNotFound(thread_id.to_string()))?;

        self.close_thread();
        self.messages_tx.send_replace(ThreadView::Loading);
        info!(thread_id = %thread.id, sources = thread.source_ids.len(), "thread selected");

        let merger = Arc::new(Mutex::new(MessageStreamMerger::new(self.viewer_id.clone())));
        let receipts = Arc::new(tokio::sync::Mutex::new(ReadReceiptWriter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.viewer_id.clone(),
            &self.config.conversations_path,
            &self.config.legacy_messages_path,
        )));

        // One-time legacy fallbacks; history the live path cannot see
        let mut fallbacks = Vec::with_capacity(thread.source_ids.len() * LEGACY_SOURCE_FIELDS.len());
        for source_id in &thread.source_ids {
            for field in LEGACY_SOURCE_FIELDS {
                let store = Arc::clone(&self.store);
                let path = self.config.legacy_messages_path.clone();
                let field = *field;
                let filter = Filter::eq(field, json!(source_id));
                let source_id = source_id.clone();
                fallbacks.push(async move {
                    let result = store.query(&path, &filter, LEGACY_QUERY_LIMIT).await;
                    (source_id, field, result)
                });
            }
        }
        for (source_id, field, result) in future::join_all(fallbacks).await {
            match result {
                Ok(records) if !records.is_empty() => {
                    debug!(%source_id, field, count = records.len(), "legacy fallback hit");
                    merger
                        .lock()
                        .expect("merger lock")
                        .apply_legacy(&source_id, &records);
                }
                Ok(_) => {}
                Err(error) => {
                    // Degraded history only; live view still comes up
                    warn!(%source_id, %error, "legacy fallback query failed");
                }
            }
        }

        let mut tasks = Vec::with_capacity(thread.source_ids.len());
        for source_id in thread.source_ids.clone() {
            let path = format!(
                "{}/{}/messages",
                self.config.conversations_path, source_id
            );
            let mut subscription = self.store.subscribe(&path, None);
            let merger = Arc::clone(&merger);
            let receipts = Arc::clone(&receipts);
            let messages_tx = Arc::clone(&self.messages_tx);
            let source_ids = thread.source_ids.clone();

            tasks.push(tokio::spawn(async move {
                while let Some(event) = subscription.next().await {
                    match event {
                        StoreEvent::Snapshot(batch) => {
                            let merged = {
                                let mut merger = merger.lock().expect("merger lock");
                                merger.apply_live(&source_id, &batch);
                                merger.merged()
                            };
                            receipts
                                .lock()
                                .await
                                .mark_visible_read(&source_ids, &merged)
                                .await;
                            messages_tx.send_replace(ThreadView::Ready(merged));
                        }
                        StoreEvent::Error(message) => {
                            let error = EngineError::Subscription(message.clone());
                            warn!(%source_id, %error, "message stream degraded");
                            messages_tx.send_replace(ThreadView::Unavailable(message));
                        }
                    }
                }
            }));
        }

        // Publish fallback-era history and settle its receipts before the
        // first live snapshots land
        let merged = merger.lock().expect("merger lock").merged();
        receipts
            .lock()
            .await
            .mark_visible_read(&thread.source_ids, &merged)
            .await;
        self.messages_tx.send_replace(ThreadView::Ready(merged));

        self.active = Some(ActiveThread { thread, tasks });
        Ok(())
    }

    /// The currently selected thread, if any
    pub fn selected_thread(&self) -> Option<LogicalThread> {
        self.active.as_ref().map(|active| active.thread.clone())
    }

    /// Tear down the selected thread's subscriptions and per-thread state
    pub fn close_thread(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(thread_id = %active.thread.id, "thread closed");
            // Dropping ActiveThread aborts the pumps and revokes their
            // subscriptions; snapshot caches and the receipt guard go with it
            drop(active);
        }
        self.messages_tx.send_replace(ThreadView::Idle);
    }

    /// Send a text message to a peer, resolving or creating the thread first
    ///
    /// Returns the new message id. The denormalized thread metadata write
    /// (last message, recipient unread counter) is best-effort: its failure is
    /// logged and healed by later activity, never surfaced to the caller.
    pub async fn send_message(&mut self, peer_id: &str, content: &str) -> Result<String> {
        let existing = self
            .dedup
            .lock()
            .expect("dedup lock")
            .find_by_participants(&[self.viewer_id.clone(), peer_id.to_string()]);

        let conversation_id = match existing {
            Some(thread) => thread.id,
            None => {
                // Presence for the peer while the thread does not exist yet
                *self.pending_peer.lock().expect("pending peer lock") =
                    Some(peer_id.to_string());
                self.refresh_watched();
                self.resolver.resolve_or_create(&self.viewer_id, peer_id).await?
            }
        };

        let message_id = Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        let message_path = format!(
            "{}/{}/messages/{}",
            self.config.conversations_path, conversation_id, message_id
        );
        self.store
            .write(
                &message_path,
                json!({
                    "senderId": self.viewer_id,
                    "content": content,
                    "messageType": "text",
                    "createdAt": now,
                    "isRead": false,
                    "status": "sent",
                }),
            )
            .await?;
        debug!(%message_id, %conversation_id, "message written");

        if let Err(error) = self
            .write_thread_metadata(&conversation_id, peer_id, content, now)
            .await
        {
            warn!(%conversation_id, %error, "thread metadata write failed; will heal on next activity");
        }

        *self.pending_peer.lock().expect("pending peer lock") = None;
        Ok(message_id)
    }

    /// Denormalized thread metadata plus recipient unread counter
    ///
    /// The counter is recomputed from the deduplicator's latest snapshot of
    /// the record — the store offers no transactions, and the write is
    /// idempotent per message send.
    async fn write_thread_metadata(
        &self,
        conversation_id: &str,
        peer_id: &str,
        content: &str,
        now: i64,
    ) -> Result<()> {
        let mut unread = {
            let dedup = self.dedup.lock().expect("dedup lock");
            dedup
                .record(conversation_id)
                .and_then(|record| record.map_field(UNREAD_ALIASES).cloned())
                .unwrap_or_default()
        };
        let current = unread.get(peer_id).and_then(serde_json::Value::as_i64).unwrap_or(0);
        unread.insert(peer_id.to_string(), json!(current + 1));

        self.store
            .write(
                &format!("{}/{}", self.config.conversations_path, conversation_id),
                json!({
                    "lastMessage": content,
                    "lastMessageAt": now,
                    "updatedAt": now,
                    "unreadCount": unread,
                }),
            )
            .await
    }

    /// Tear down every subscription and background task
    pub fn shutdown(&mut self) {
        self.close_thread();
        if let Some(task) = self.conversations_task.take() {
            task.abort();
        }
        self.presence.lock().expect("presence lock").shutdown();
        info!(viewer_id = %self.viewer_id, "engine shut down");
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use tokio::time::{sleep, Duration};

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    fn engine(store: &Arc<MemoryStore>, viewer: &str) -> ChatEngine {
        ChatEngine::new(
            Arc::clone(store) as Arc<dyn DocumentStore>,
            Arc::new(ManualClock::new(1_000_000)),
            viewer,
        )
    }

    #[tokio::test]
    async fn test_thread_list_updates_live() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = engine(&store, "A");
        engine.start();
        settle().await;
        assert!(engine.threads().borrow().is_empty());

        store
            .write(
                "conversations/c1",
                json!({ "participants": ["A", "B"], "updatedAt": 10 }),
            )
            .await
            .unwrap();
        settle().await;

        let threads = engine.threads().borrow().clone();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, "c1");
    }

    #[tokio::test]
    async fn test_select_unknown_thread() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = engine(&store, "A");
        engine.start();
        settle().await;

        let err = engine.select_thread("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::ThreadNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_creates_thread_and_metadata() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = engine(&store, "A");
        engine.start();
        settle().await;

        engine.send_message("B", "first!").await.unwrap();
        settle().await;

        let threads = engine.threads().borrow().clone();
        assert_eq!(threads.len(), 1);
        let thread = &threads[0];
        assert_eq!(thread.last_message_text.as_deref(), Some("first!"));
        assert_eq!(thread.last_message_at, Some(1_000_000));
        // Recipient's unread counter incremented
        let record = store
            .query("conversations", &Filter::eq("participant1", json!("A")), 5)
            .await
            .unwrap()
            .remove(0);
        let unread = record.fields.get("unreadCount").unwrap();
        assert_eq!(unread.get("B"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_thread_switch_revokes_message_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        store
            .write("conversations/c1", json!({ "participants": ["A", "B"] }))
            .await
            .unwrap();
        store
            .write("conversations/c2", json!({ "participants": ["A", "C"] }))
            .await
            .unwrap();

        let mut engine = engine(&store, "A");
        engine.start();
        settle().await;

        engine.select_thread("c1").await.unwrap();
        settle().await;
        let with_first = store.subscription_count();

        engine.select_thread("c2").await.unwrap();
        settle().await;
        // Old message subscription replaced, not leaked
        assert_eq!(store.subscription_count(), with_first);

        engine.close_thread();
        settle().await;
        assert_eq!(engine.messages().borrow().clone(), ThreadView::Idle);
    }
}
