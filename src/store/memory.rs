//! In-memory document store
//!
//! Reference implementation of [`DocumentStore`] used by the test suite and as
//! the documented store semantics: every write fans out a fresh full snapshot
//! to all live subscriptions whose scope covers the written document.
//!
//! Test hooks:
//! - [`MemoryStore::fail_writes_matching`] and
//!   [`MemoryStore::fail_queries_matching`] inject failures by path prefix
//!   (for fallback and retry behavior);
//! - [`MemoryStore::emit_error`] pushes an error event to subscriptions on a
//!   path (for degraded-view behavior);
//! - [`MemoryStore::writes_matching`] counts writes by path prefix (for
//!   idempotency assertions).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{DocumentStore, Filter, StoreEvent, Subscription};
use crate::error::{EngineError, Result};
use crate::record::RawRecord;

/// In-memory [`DocumentStore`] with live snapshot fan-out
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Collection path → document id → fields
    collections: HashMap<String, BTreeMap<String, Map<String, Value>>>,
    subscribers: Vec<Subscriber>,
    failing_prefixes: Vec<String>,
    failing_query_prefixes: Vec<String>,
    write_log: Vec<String>,
}

#[derive(Debug)]
struct Subscriber {
    path: String,
    filter: Option<Filter>,
    sender: mpsc::UnboundedSender<StoreEvent>,
}

/// Split a document path into (collection path, document id)
///
/// Document paths have an even number of segments: `conversations/c1`,
/// `conversations/c1/messages/m1`.
fn split_document_path(path: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 || segments.len() % 2 != 0 {
        return None;
    }
    let doc_id = segments[segments.len() - 1].to_string();
    let collection = segments[..segments.len() - 1].join("/");
    Some((collection, doc_id))
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes to paths starting with `prefix` fail
    pub fn fail_writes_matching(&self, prefix: impl Into<String>) {
        self.inner
            .lock()
            .expect("store lock")
            .failing_prefixes
            .push(prefix.into());
    }

    /// Remove all injected write failures
    pub fn clear_write_failures(&self) {
        self.inner.lock().expect("store lock").failing_prefixes.clear();
    }

    /// Make queries against paths starting with `prefix` fail
    pub fn fail_queries_matching(&self, prefix: impl Into<String>) {
        self.inner
            .lock()
            .expect("store lock")
            .failing_query_prefixes
            .push(prefix.into());
    }

    /// Remove all injected query failures
    pub fn clear_query_failures(&self) {
        self.inner
            .lock()
            .expect("store lock")
            .failing_query_prefixes
            .clear();
    }

    /// Number of writes (including updates) issued to paths with this prefix
    pub fn writes_matching(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .expect("store lock")
            .write_log
            .iter()
            .filter(|p| p.starts_with(prefix))
            .count()
    }

    /// Push an error event to every subscription on exactly this path
    pub fn emit_error(&self, path: &str, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.inner.lock().expect("store lock");
        inner.subscribers.retain(|sub| {
            if sub.path != path {
                return true;
            }
            sub.sender.send(StoreEvent::Error(message.clone())).is_ok()
        });
    }

    /// Number of currently live subscriptions (revoked handles are pruned
    /// lazily on the next delivery attempt)
    pub fn subscription_count(&self) -> usize {
        let mut inner = self.inner.lock().expect("store lock");
        inner.subscribers.retain(|sub| !sub.sender.is_closed());
        inner.subscribers.len()
    }
}

impl Inner {
    fn snapshot_for(&self, path: &str, filter: Option<&Filter>) -> Vec<RawRecord> {
        if let Some((collection, doc_id)) = split_document_path(path) {
            // Single-document scope
            return self
                .collections
                .get(&collection)
                .and_then(|docs| docs.get(&doc_id))
                .map(|fields| {
                    vec![RawRecord {
                        id: doc_id,
                        fields: fields.clone(),
                    }]
                })
                .unwrap_or_default();
        }

        self.collections
            .get(path)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| RawRecord {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .filter(|record| filter.map_or(true, |f| f.matches(record)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-deliver snapshots to every subscriber covering the written document
    fn notify(&mut self, collection: &str, doc_id: &str) {
        let doc_path = format!("{}/{}", collection, doc_id);
        let mut deliveries: Vec<(usize, Vec<RawRecord>)> = Vec::new();
        for (idx, sub) in self.subscribers.iter().enumerate() {
            if sub.path == collection || sub.path == doc_path {
                let batch = self.snapshot_for(&sub.path, sub.filter.as_ref());
                deliveries.push((idx, batch));
            }
        }
        let mut dropped = Vec::new();
        for (idx, batch) in deliveries {
            if self.subscribers[idx]
                .sender
                .send(StoreEvent::Snapshot(batch))
                .is_err()
            {
                dropped.push(idx);
            }
        }
        for idx in dropped.into_iter().rev() {
            self.subscribers.remove(idx);
        }
    }

    fn apply_write(&mut self, path: &str, fields: Value, require_existing: bool) -> Result<()> {
        if let Some(prefix) = self
            .failing_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))
        {
            return Err(EngineError::WriteFailed {
                path: path.to_string(),
                reason: format!("injected failure for prefix {}", prefix),
            });
        }

        let (collection, doc_id) = split_document_path(path).ok_or_else(|| {
            EngineError::invalid_state(format!("not a document path: {}", path))
        })?;
        let incoming = match fields {
            Value::Object(map) => map,
            other => {
                return Err(EngineError::invalid_state(format!(
                    "write fields must be an object, got {}",
                    other
                )))
            }
        };

        let docs = self.collections.entry(collection.clone()).or_default();
        if require_existing && !docs.contains_key(&doc_id) {
            return Err(EngineError::WriteFailed {
                path: path.to_string(),
                reason: "document does not exist".to_string(),
            });
        }

        let doc = docs.entry(doc_id.clone()).or_default();
        for (key, value) in incoming {
            doc.insert(key, value);
        }
        self.write_log.push(path.to_string());
        debug!(path, "memory store write applied");

        self.notify(&collection, &doc_id);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn subscribe(&self, path: &str, filter: Option<Filter>) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("store lock");
        let initial = inner.snapshot_for(path, filter.as_ref());
        let _ = sender.send(StoreEvent::Snapshot(initial));
        inner.subscribers.push(Subscriber {
            path: path.to_string(),
            filter,
            sender,
        });
        Subscription::new(receiver)
    }

    async fn query(&self, path: &str, filter: &Filter, limit: usize) -> Result<Vec<RawRecord>> {
        let inner = self.inner.lock().expect("store lock");
        if let Some(prefix) = inner
            .failing_query_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))
        {
            return Err(EngineError::Store(format!(
                "injected query failure for prefix {}",
                prefix
            )));
        }
        let mut records = inner.snapshot_for(path, Some(filter));
        records.truncate(limit);
        Ok(records)
    }

    async fn write(&self, path: &str, fields: Value) -> Result<()> {
        self.inner
            .lock()
            .expect("store lock")
            .apply_write(path, fields, false)
    }

    async fn update(&self, path: &str, fields: Value) -> Result<()> {
        self.inner
            .lock()
            .expect("store lock")
            .apply_write(path, fields, true)
    }
}
