//! Peer presence tracking
//!
//! Maintains exactly one set of live subscriptions per visible peer, diffing
//! the desired peer set against the active one on every change instead of
//! tearing everything down. Presence data arrives from two storage shapes
//! (direct per-user document and a query-by-id fallback); both are subscribed
//! and either may update the cache.
//!
//! Display labels are recomputed on every data change and on a periodic clock
//! tick, so "Last seen 3m ago" keeps advancing without new presence events.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::record::RawRecord;
use crate::store::{DocumentStore, Filter, StoreEvent};

/// Online flag aliases
pub const ONLINE_ALIASES: &[&str] = &["isOnline", "is_online", "online"];

/// Last-seen timestamp aliases
pub const LAST_SEEN_ALIASES: &[&str] = &["lastSeenAt", "last_seen", "lastSeen", "lastActive"];

/// Default interval for the label-refresh tick
pub const DEFAULT_PRESENCE_TICK: Duration = Duration::from_secs(15);

/// A peer's online/last-seen state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPresence {
    /// Whether the peer is currently online, if known
    pub is_online: Option<bool>,

    /// Last seen instant in epoch millis, if known
    pub last_seen_at: Option<i64>,
}

/// Map a raw presence record into [`PeerPresence`]
pub fn presence_from_record(record: &RawRecord) -> PeerPresence {
    PeerPresence {
        is_online: record.bool_field(ONLINE_ALIASES),
        last_seen_at: record.millis_field(LAST_SEEN_ALIASES),
    }
}

/// Staleness-aware display text for a peer's presence
///
/// `"Online"` while the online flag holds; otherwise the last-seen instant is
/// rounded down to minutes/hours/days. With neither signal, `"Offline"`.
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::{presence_label, PeerPresence};
///
/// let p = PeerPresence { is_online: Some(false), last_seen_at: Some(10_000) };
/// assert_eq!(presence_label(Some(&p), 100_000), "Last seen 1m ago");
/// assert_eq!(presence_label(None, 100_000), "Offline");
/// ```
pub fn presence_label(presence: Option<&PeerPresence>, now_millis: i64) -> String {
    let Some(presence) = presence else {
        return "Offline".to_string();
    };
    if presence.is_online == Some(true) {
        return "Online".to_string();
    }
    let Some(last_seen) = presence.last_seen_at else {
        return "Offline".to_string();
    };

    let elapsed = (now_millis - last_seen).max(0);
    let minutes = elapsed / 60_000;
    if minutes < 1 {
        "Last seen just now".to_string()
    } else if minutes < 60 {
        format!("Last seen {}m ago", minutes)
    } else if minutes < 24 * 60 {
        format!("Last seen {}h ago", minutes / 60)
    } else {
        format!("Last seen {}d ago", minutes / (24 * 60))
    }
}

/// Live presence subscriptions for the currently visible peer set
///
/// Publishes a peer-id → label map through a watch channel. All subscriptions
/// are revoked on [`PresenceTracker::shutdown`] or drop; none leak across a
/// teardown.
pub struct PresenceTracker {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    users_path: String,
    cache: Arc<Mutex<HashMap<String, PeerPresence>>>,
    labels_tx: Arc<watch::Sender<HashMap<String, String>>>,
    /// Pump task handles per watched peer (two shapes each)
    active: HashMap<String, Vec<JoinHandle<()>>>,
    tick_task: Option<JoinHandle<()>>,
    tick_interval: Duration,
}

impl PresenceTracker {
    /// Create a tracker reading presence documents under `users_path`
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, users_path: &str) -> Self {
        let (labels_tx, _) = watch::channel(HashMap::new());
        Self {
            store,
            clock,
            users_path: users_path.to_string(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            labels_tx: Arc::new(labels_tx),
            active: HashMap::new(),
            tick_task: None,
            tick_interval: DEFAULT_PRESENCE_TICK,
        }
    }

    /// Override the label-refresh tick interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Subscribe to the published peer-id → label map
    pub fn labels(&self) -> watch::Receiver<HashMap<String, String>> {
        self.labels_tx.subscribe()
    }

    /// Current snapshot of one peer's presence, if cached
    pub fn presence_of(&self, peer_id: &str) -> Option<PeerPresence> {
        self.cache.lock().expect("presence cache lock").get(peer_id).copied()
    }

    /// Reconcile the active subscription set against the desired peer set
    ///
    /// Adds subscriptions for newly visible peers, revokes them for peers no
    /// longer visible. Idempotent for an unchanged set.
    pub fn set_watched(&mut self, peers: &HashSet<String>) {
        let stale: Vec<String> = self
            .active
            .keys()
            .filter(|id| !peers.contains(*id))
            .cloned()
            .collect();
        for peer_id in stale {
            if let Some(tasks) = self.active.remove(&peer_id) {
                for task in tasks {
                    task.abort();
                }
            }
            self.cache.lock().expect("presence cache lock").remove(&peer_id);
            debug!(%peer_id, "presence subscription removed");
        }

        for peer_id in peers {
            if !self.active.contains_key(peer_id) {
                let tasks = self.spawn_peer_tasks(peer_id);
                self.active.insert(peer_id.clone(), tasks);
                debug!(%peer_id, "presence subscription added");
            }
        }

        self.refresh();
    }

    /// Recompute and publish labels from cached data, without new events
    pub fn refresh(&self) {
        let now = self.clock.now_millis();
        let labels: HashMap<String, String> = self
            .cache
            .lock()
            .expect("presence cache lock")
            .iter()
            .map(|(id, presence)| (id.clone(), presence_label(Some(presence), now)))
            .collect();
        self.labels_tx.send_replace(labels);
    }

    /// Start the periodic label-refresh tick
    pub fn start_ticker(&mut self) {
        if self.tick_task.is_some() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let clock = Arc::clone(&self.clock);
        let labels_tx = Arc::clone(&self.labels_tx);
        let interval = self.tick_interval;
        self.tick_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = clock.now_millis();
                let labels: HashMap<String, String> = cache
                    .lock()
                    .expect("presence cache lock")
                    .iter()
                    .map(|(id, presence)| (id.clone(), presence_label(Some(presence), now)))
                    .collect();
                labels_tx.send_replace(labels);
            }
        }));
    }

    /// Revoke every subscription and stop the tick
    pub fn shutdown(&mut self) {
        for (_, tasks) in self.active.drain() {
            for task in tasks {
                task.abort();
            }
        }
        if let Some(task) = self.tick_task.take() {
            task.abort();
        }
        self.cache.lock().expect("presence cache lock").clear();
    }

    /// Subscribe both storage shapes for one peer and pump them into the cache
    fn spawn_peer_tasks(&self, peer_id: &str) -> Vec<JoinHandle<()>> {
        let doc_path = format!("{}/{}", self.users_path, peer_id);
        let direct = self.store.subscribe(&doc_path, None);
        let fallback = self
            .store
            .subscribe(&self.users_path, Some(Filter::eq("userId", json!(peer_id))));

        [direct, fallback]
            .into_iter()
            .map(|mut subscription| {
                let peer_id = peer_id.to_string();
                let cache = Arc::clone(&self.cache);
                let clock = Arc::clone(&self.clock);
                let labels_tx = Arc::clone(&self.labels_tx);
                tokio::spawn(async move {
                    while let Some(event) = subscription.next().await {
                        match event {
                            StoreEvent::Snapshot(batch) => {
                                let Some(record) = batch.last() else {
                                    continue;
                                };
                                let presence = presence_from_record(record);
                                cache
                                    .lock()
                                    .expect("presence cache lock")
                                    .insert(peer_id.clone(), presence);
                                let now = clock.now_millis();
                                let labels: HashMap<String, String> = cache
                                    .lock()
                                    .expect("presence cache lock")
                                    .iter()
                                    .map(|(id, p)| (id.clone(), presence_label(Some(p), now)))
                                    .collect();
                                labels_tx.send_replace(labels);
                            }
                            StoreEvent::Error(message) => {
                                // Presence is best-effort; keep the stale label
                                warn!(%peer_id, %message, "presence subscription error");
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
