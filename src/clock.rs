//! Clock abstraction
//!
//! The engine needs the current time in exactly one form: epoch milliseconds.
//! Presence labels ("Last seen 3m ago") are recomputed against this clock on
//! a periodic tick, and read receipts/outbound messages are stamped with it.
//! Tests substitute [`ManualClock`] to drive label transitions
//! deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Source of current epoch-millisecond time
pub trait Clock: Send + Sync {
    /// Current time as UNIX epoch milliseconds
    fn now_millis(&self) -> i64;
}

/// Wall-clock time via chrono
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// assert_eq!(clock.now_millis(), 1_000);
///
/// clock.advance(90_000);
/// assert_eq!(clock.now_millis(), 91_000);
/// ```
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock frozen at the given epoch-millisecond instant
    pub fn new(millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(millis)),
        }
    }

    /// Advance the clock by the given number of milliseconds
    pub fn advance(&self, delta_millis: i64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }

    /// Set the clock to an absolute instant
    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
