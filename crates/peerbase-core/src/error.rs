//! Error types for Peerbase Core.

use thiserror::Error;

use crate::schema::FieldType;
use crate::types::Timestamp;

/// A record or schema definition does not fit the declared table schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown field {field} in table {table}")]
    UnknownField { table: String, field: String },

    #[error("field {table}.{field} expects {expected}, got {got}")]
    TypeMismatch {
        table: String,
        field: String,
        expected: FieldType,
        got: &'static str,
    },

    #[error("field {table}.{field} holds a NaN or infinite real")]
    NonFiniteReal { table: String, field: String },

    #[error("required field {table}.{field} is missing")]
    MissingRequired { table: String, field: String },

    #[error("invalid identifier {0:?}: must match [A-Za-z_][A-Za-z0-9_]* and not be reserved")]
    InvalidIdentifier(String),

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("record id must not be empty")]
    EmptyId,
}

/// An incoming record carries a timestamp that cannot take part in
/// last-write-wins resolution.
///
/// Fatal for the record only: the merge skips it and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictResolutionError {
    #[error("record {table}/{id} has non-positive timestamp {timestamp}")]
    InvalidTimestamp {
        table: String,
        id: String,
        timestamp: Timestamp,
    },

    #[error("record {table}/{id} has timestamp {timestamp} beyond the allowed horizon {horizon}")]
    FutureTimestamp {
        table: String,
        id: String,
        timestamp: Timestamp,
        horizon: Timestamp,
    },
}

/// Encoding and decoding failures for the canonical CBOR form.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encode(String),

    #[error("decoding error: {0}")]
    Decode(String),
}
