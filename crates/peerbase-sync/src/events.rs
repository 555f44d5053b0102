//! Replication events.
//!
//! The engine publishes what happens during rounds on an [`EventBus`] so
//! that applications can observe progress and per-record problems without
//! parsing logs. Publishing never blocks and never fails; events are simply
//! dropped when nobody listens.

use tokio::sync::broadcast;

use peerbase_core::{PeerId, Timestamp};

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Something that happened during replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// This node started a round with `peer`.
    RoundStarted { peer: PeerId },
    /// A `sync_with` call finished and both sides advanced their marks.
    RoundCompleted {
        peer: PeerId,
        sent: usize,
        received: usize,
        applied: usize,
        high_water_mark: Timestamp,
    },
    /// A round failed; the high-water mark is unchanged.
    RoundFailed { peer: PeerId, error: String },
    /// A received record was malformed and skipped.
    RecordRejected {
        peer: PeerId,
        table: String,
        id: String,
        reason: String,
    },
    /// A received record is too far in the future for the local clock. It
    /// will be offered again in a later round.
    RecordDeferred {
        peer: PeerId,
        table: String,
        id: String,
        timestamp: Timestamp,
    },
    /// A received record could not be written.
    RecordFailed {
        peer: PeerId,
        table: String,
        id: String,
        error: String,
    },
    /// Something tried to move a high-water mark backwards.
    HighWaterMarkRegression {
        peer: PeerId,
        attempted: Timestamp,
        current: Timestamp,
    },
}

/// Broadcast channel for [`SyncEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
