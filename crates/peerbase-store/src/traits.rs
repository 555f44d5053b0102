//! Store trait: the abstract interface for change-tracked record storage.
//!
//! The replication engine and any API layer talk to storage only through
//! [`Store`]. Implementations include SQLite (primary) and in-memory (for
//! tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use peerbase_core::{Fields, HybridClock, PeerId, Record, Schema, Timestamp};

use crate::error::Result;

/// Result of applying a replicated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming version won and was written.
    Applied,
    /// The local version is equal or newer; nothing was written.
    Discarded,
}

/// Result of writing a peer's high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwmUpdate {
    /// First mark recorded for this peer.
    Created,
    /// The mark moved forward.
    Advanced,
    /// The mark already had this value.
    Unchanged,
    /// The new value was lower than the stored one and was not written.
    Regressed {
        /// The stored value, which remains in place.
        current: Timestamp,
    },
}

impl HwmUpdate {
    /// Decide the update for `new` given the stored value, if any.
    pub fn decide(current: Option<Timestamp>, new: Timestamp) -> Self {
        match current {
            None => HwmUpdate::Created,
            Some(current) if new > current => HwmUpdate::Advanced,
            Some(current) if new == current => HwmUpdate::Unchanged,
            Some(current) => HwmUpdate::Regressed { current },
        }
    }

    /// Whether the new value has to be written.
    pub fn writes(&self) -> bool {
        matches!(self, HwmUpdate::Created | HwmUpdate::Advanced)
    }
}

/// Persisted sync progress for one remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSyncState {
    pub peer_id: PeerId,
    /// Every local change with a timestamp at or below this value has been
    /// confirmed delivered to the peer.
    pub last_sync_timestamp: Timestamp,
}

/// Notified after every successful write so a read-through cache can drop
/// its entry for the key.
pub trait InvalidationHook: Send + Sync {
    fn invalidate(&self, table: &str, id: &str);
}

/// The Store trait: async interface for change-tracked storage.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Stamping**: local writes take their timestamp from the store's
///   [`HybridClock`] inside the same critical section as the write.
/// - **Tombstones**: deletes keep the id and version forever so that an
///   older live version arriving later cannot resurrect the record.
/// - **Replicated writes**: [`Store::apply_merged`] keeps the incoming
///   timestamp and origin; it never re-stamps.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────────

    /// The tables this store holds.
    fn schema(&self) -> &Schema;

    /// The peer id stamped as `origin` on local writes.
    fn local_peer(&self) -> &PeerId;

    /// The clock local writes are stamped with.
    fn clock(&self) -> &HybridClock;

    // ─────────────────────────────────────────────────────────────────────────
    // Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a live record.
    ///
    /// Fails with `DuplicateKey` if a live record with `id` exists. Creating
    /// over a tombstone revives the id with a newer version.
    async fn create(&self, table: &str, id: &str, fields: Fields) -> Result<Record>;

    /// Read a live record. Absent and tombstoned records both read as `None`.
    async fn read(&self, table: &str, id: &str) -> Result<Option<Record>>;

    /// Merge `fields` into a live record; `Null` values clear fields.
    ///
    /// Fails with `NotFound` if there is no live record.
    async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Record>;

    /// Delete a record, returning its tombstone.
    ///
    /// Idempotent: deleting a tombstone leaves it unchanged, and deleting an
    /// unknown id writes a tombstone so the delete still propagates.
    async fn delete(&self, table: &str, id: &str) -> Result<Record>;

    /// Live records of a table, ordered by id.
    async fn list(&self, table: &str) -> Result<Vec<Record>>;

    /// Every record, live or tombstoned, with `timestamp > threshold`.
    async fn changes_since(&self, table: &str, threshold: Timestamp) -> Result<Vec<Record>>;

    /// Apply a replicated record under the last-write-wins rule.
    ///
    /// The read-compare-write is atomic with respect to other writes on the
    /// same table.
    async fn apply_merged(&self, record: &Record) -> Result<MergeOutcome>;

    // ─────────────────────────────────────────────────────────────────────────
    // Peer Sync State
    // ─────────────────────────────────────────────────────────────────────────

    /// The high-water mark for a peer, 0 if none has been recorded.
    async fn high_water_mark(&self, peer: &PeerId) -> Result<Timestamp>;

    /// Record a new high-water mark. Regressions are reported, not written.
    async fn set_high_water_mark(&self, peer: &PeerId, timestamp: Timestamp) -> Result<HwmUpdate>;

    /// All recorded peer states, ordered by peer id.
    async fn peer_states(&self) -> Result<Vec<PeerSyncState>>;
}
