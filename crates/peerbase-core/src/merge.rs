//! Last-write-wins merge rule for replicated records.
//!
//! For one `(table, id)` key, an incoming record replaces the local state iff
//! there is no local state or the incoming [`Version`] is strictly greater.
//! Tombstones go through the same comparison, so a delete only wins against
//! older writes and an old live record can never resurrect a newer tombstone.
//!
//! The decision depends only on comparing versions, which makes merging
//! commutative, associative and idempotent.
//!
//! [`Version`]: crate::record::Version

use crate::error::ConflictResolutionError;
use crate::record::Record;
use crate::types::Timestamp;

/// What to do with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Write the incoming record (live or tombstone) over the local state.
    Apply,
    /// Keep the local state; it is equal or newer.
    Discard,
}

/// Decide between the local state and an incoming record for the same key.
pub fn resolve(local: Option<&Record>, incoming: &Record) -> Resolution {
    match local {
        None => Resolution::Apply,
        Some(local) if incoming.version() > local.version() => Resolution::Apply,
        Some(_) => Resolution::Discard,
    }
}

/// Reject timestamps that cannot be ordered meaningfully.
///
/// `now` is the receiving node's wall time; anything further than
/// `max_drift_millis` ahead of it is treated as malformed.
pub fn check_timestamp(
    record: &Record,
    now: Timestamp,
    max_drift_millis: i64,
) -> Result<(), ConflictResolutionError> {
    if record.timestamp <= 0 {
        return Err(ConflictResolutionError::InvalidTimestamp {
            table: record.table.clone(),
            id: record.id.clone(),
            timestamp: record.timestamp,
        });
    }
    let horizon = now.saturating_add(max_drift_millis);
    if record.timestamp > horizon {
        return Err(ConflictResolutionError::FutureTimestamp {
            table: record.table.clone(),
            id: record.id.clone(),
            timestamp: record.timestamp,
            horizon,
        });
    }
    Ok(())
}
