//! Chat reconciliation engine over an eventually-consistent document store
//!
//! The store underneath this crate offers live snapshot subscriptions, one-shot
//! queries, and field-merge writes, and guarantees none of the invariants a
//! chat UI needs: collections accumulate duplicate conversation records for
//! the same participant pair, message history is split across a per-thread
//! subcollection and a legacy flat collection, and a decade of schema
//! generations spell every field name differently. This crate turns those raw
//! collections into consistent application views and keeps them consistent as
//! snapshots stream in.
//!
//! ## Architecture
//!
//! Synchronous, re-runnable reconciliation cores do all the deriving:
//!
//! - [`record`] — alias-aware field access over raw documents;
//! - [`message`] / [`status`] — total mapping to [`CanonicalMessage`] with
//!   read/delivery state resolution;
//! - [`merge`] — commutative, idempotent merging of message copies across
//!   live and legacy sources;
//! - [`dedup`] — grouping duplicate conversation records into one
//!   [`LogicalThread`] per participant set;
//! - [`presence`] — presence mapping and staleness-aware labels.
//!
//! The async layer pumps store subscriptions into the cores and publishes the
//! results through watch channels:
//!
//! - [`engine::ChatEngine`] — subscription lifecycles, thread selection,
//!   sending;
//! - [`receipts`] — idempotent read-receipt writes with storage-shape
//!   fallback;
//! - [`resolver`] — exhaustive thread search before creation.
//!
//! [`store::DocumentStore`] is the seam to the real backend;
//! [`store::MemoryStore`] is the reference implementation the test suite runs
//! against.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chat_reconcile::clock::SystemClock;
//! use chat_reconcile::engine::ChatEngine;
//! use chat_reconcile::store::{DocumentStore, MemoryStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> chat_reconcile::Result<()> {
//! let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
//! let mut engine = ChatEngine::new(store, Arc::new(SystemClock), "viewer-1");
//! engine.start();
//!
//! let mut threads = engine.threads();
//! threads.changed().await.ok();
//! if let Some(thread) = threads.borrow().first().cloned() {
//!     engine.select_thread(&thread.id).await?;
//! }
//! engine.send_message("peer-7", "hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod merge;
pub mod message;
pub mod presence;
pub mod receipts;
pub mod record;
pub mod resolver;
pub mod status;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::{ConversationDeduplicator, LogicalThread};
pub use engine::{ChatEngine, EngineConfig, ThreadView};
pub use error::{EngineError, Result};
pub use merge::{merge_messages, MessageStreamMerger};
pub use message::{map_message, CanonicalMessage, MessageStatus};
pub use presence::{presence_label, PeerPresence, PresenceTracker};
pub use receipts::{ReadReceiptGuard, ReadReceiptWriter};
pub use record::RawRecord;
pub use resolver::ThreadResolver;
pub use status::resolve_status;
