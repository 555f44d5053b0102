//! # Peerbase Core
//!
//! Pure primitives for Peerbase: records, change sets, schemas, clocks and
//! the last-write-wins merge rule.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Record`] - One row of one replicated table, live or tombstoned
//! - [`ChangeSet`] - Records changed since a threshold, grouped by table
//! - [`Version`] - `(timestamp, origin)`, the total order used for conflicts
//! - [`Schema`] / [`TableSchema`] - Declared field names and types
//! - [`HybridClock`] - Monotonic write clock seeded by wall time
//!
//! ## Merge rule
//!
//! See [`merge::resolve`]: an incoming record wins iff its version is
//! strictly greater than the local one.

pub mod canonical;
pub mod changeset;
pub mod clock;
pub mod error;
pub mod merge;
pub mod record;
pub mod schema;
pub mod types;

pub use canonical::{canonical_record_bytes, from_cbor, to_cbor};
pub use changeset::ChangeSet;
pub use clock::{Clock, HybridClock, ManualClock, SystemClock};
pub use error::{CodecError, ConflictResolutionError, SchemaError};
pub use merge::{check_timestamp, resolve, Resolution};
pub use record::{fields, FieldValue, Fields, Record, Version};
pub use schema::{FieldDef, FieldType, Schema, TableSchema};
pub use types::{Digest, PeerId, Timestamp};
