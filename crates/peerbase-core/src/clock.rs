//! Clocks for stamping writes.
//!
//! Writes are stamped by a [`HybridClock`]: wall-clock milliseconds, pushed
//! forward whenever needed so that
//!
//! 1. successive ticks on one node are strictly increasing, and
//! 2. a tick never falls at or below a timestamp already observed from a
//!    peer, so a local write made after seeing a remote one always wins.
//!
//! The value stays a plain `i64` millisecond count, comparable with any
//! peer's timestamps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::types::Timestamp;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> Timestamp;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Used by tests to script timestamps.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Monotonic write clock seeded by wall time.
pub struct HybridClock {
    source: Arc<dyn Clock>,
    last: AtomicI64,
}

impl HybridClock {
    pub fn new(source: Arc<dyn Clock>) -> Self {
        Self {
            source,
            last: AtomicI64::new(0),
        }
    }

    /// A hybrid clock over the system clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Wall time from the underlying source, without ticking.
    pub fn wall_millis(&self) -> Timestamp {
        self.source.now_millis()
    }

    /// Issue a fresh timestamp: `max(wall, last + 1)`.
    pub fn tick(&self) -> Timestamp {
        let wall = self.source.now_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Record a timestamp seen on a replicated record.
    pub fn observe(&self, timestamp: Timestamp) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }

    /// The highest timestamp issued or observed so far.
    pub fn last(&self) -> Timestamp {
        self.last.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &self.last())
            .finish()
    }
}
