//! Document store collaborator contracts
//!
//! The engine treats the backing store as a source of unordered, possibly
//! delayed, possibly duplicated change notifications with eventual consistency
//! and no uniqueness constraints. Everything the engine needs from it fits in
//! four operations:
//!
//! - [`DocumentStore::subscribe`] — live stream of snapshot batches for a
//!   collection (or a single document), with an in-band error channel;
//! - [`DocumentStore::query`] — one-shot batch read, used for legacy fallback
//!   reads and thread-existence search;
//! - [`DocumentStore::write`] — upsert of fields at a document path, used for
//!   creating threads and denormalized metadata; safely retriable;
//! - [`DocumentStore::update`] — like `write` but failing when the document
//!   does not exist, used by the read-receipt writer so schema-shape fallbacks
//!   are attempted in order instead of blindly creating documents.
//!
//! ## Paths
//!
//! Paths are `/`-separated, alternating collection and document segments:
//! `conversations` (collection), `conversations/c1` (document),
//! `conversations/c1/messages` (subcollection).
//!
//! ## Cancellation
//!
//! Every subscription is individually revocable: dropping the [`Subscription`]
//! handle revokes it. The engine relies on this for thread switches and
//! presence set churn.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::record::RawRecord;

pub mod memory;

pub use memory::MemoryStore;

/// Comparison operator for a filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    /// Field value equals the condition value
    Eq,
    /// Field value is an array containing the condition value
    ArrayContains,
}

/// A single field condition
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Concrete stored field name (filters are not alias-aware)
    pub field: String,
    /// Comparison operator
    pub op: FieldOp,
    /// Value to compare against
    pub value: Value,
}

/// Conjunction of field conditions
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::store::Filter;
/// use chat_reconcile::RawRecord;
/// use serde_json::json;
///
/// let filter = Filter::eq("participant1", json!("a")).and_eq("participant2", json!("b"));
/// let record = RawRecord::new("c1", json!({ "participant1": "a", "participant2": "b" }));
/// assert!(filter.matches(&record));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// All conditions must hold
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Filter on field equality
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self {
            conditions: vec![Condition {
                field: field.into(),
                op: FieldOp::Eq,
                value,
            }],
        }
    }

    /// Filter on array membership
    pub fn array_contains(field: impl Into<String>, value: Value) -> Self {
        Self {
            conditions: vec![Condition {
                field: field.into(),
                op: FieldOp::ArrayContains,
                value,
            }],
        }
    }

    /// Add an equality condition
    pub fn and_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op: FieldOp::Eq,
            value,
        });
        self
    }

    /// Add an array-membership condition
    pub fn and_array_contains(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op: FieldOp::ArrayContains,
            value,
        });
        self
    }

    /// Check whether a record satisfies every condition
    pub fn matches(&self, record: &RawRecord) -> bool {
        self.conditions.iter().all(|cond| {
            match record.fields.get(&cond.field) {
                Some(value) => match cond.op {
                    FieldOp::Eq => *value == cond.value,
                    FieldOp::ArrayContains => value
                        .as_array()
                        .is_some_and(|items| items.contains(&cond.value)),
                },
                None => false,
            }
        })
    }
}

/// Event delivered on a live subscription
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Snapshot batch for the subscribed scope
    Snapshot(Vec<RawRecord>),
    /// The stream reported a failure; the subscription may keep delivering
    Error(String),
}

/// Handle for one live subscription
///
/// Dropping the handle revokes the subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<StoreEvent>,
}

impl Subscription {
    /// Build a subscription from its receiving half
    pub fn new(receiver: mpsc::UnboundedReceiver<StoreEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the store side has closed the stream
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.receiver.recv().await
    }
}

/// Backing document store contract
///
/// Implementations must deliver writes to all matching live subscriptions and
/// tolerate retried writes (the engine never assumes at-most-once delivery).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Subscribe to a collection (optionally filtered) or a single document
    ///
    /// Delivery is push-based; an initial snapshot of the current state is
    /// delivered promptly after subscribing.
    fn subscribe(&self, path: &str, filter: Option<Filter>) -> Subscription;

    /// One-shot filtered read of a collection
    async fn query(&self, path: &str, filter: &Filter, limit: usize) -> Result<Vec<RawRecord>>;

    /// Upsert fields at a document path, creating the document if needed
    async fn write(&self, path: &str, fields: Value) -> Result<()>;

    /// Merge fields into an existing document, failing if it does not exist
    async fn update(&self, path: &str, fields: Value) -> Result<()>;
}
