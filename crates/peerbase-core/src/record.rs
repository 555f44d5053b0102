//! Record: one row of one replicated table.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::{PeerId, Timestamp};

/// Field map of a record. A null value is represented by absence.
pub type Fields = BTreeMap<String, FieldValue>;

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Real(_) => "real",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Real(f)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Boolean(b)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Bytes(b)
    }
}

/// Build a [`Fields`] map from `(name, value)` pairs.
///
/// ```
/// use peerbase_core::{fields, FieldValue};
///
/// let f = fields([("email", FieldValue::from("a@x.com"))]);
/// assert_eq!(f["email"].as_text(), Some("a@x.com"));
/// ```
pub fn fields<K, I>(pairs: I) -> Fields
where
    K: Into<String>,
    I: IntoIterator<Item = (K, FieldValue)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// The version of a record: which write produced its current state.
///
/// Versions are totally ordered: higher timestamp wins, and equal timestamps
/// are broken by comparing the originating peer ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: Timestamp,
    pub origin: PeerId,
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One row in one table, live or tombstoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub table: String,
    /// Immutable, unique within `table`.
    pub id: String,
    pub fields: Fields,
    pub timestamp: Timestamp,
    /// The peer whose write produced this version.
    pub origin: PeerId,
    pub deleted: bool,
}

impl Record {
    /// A live record.
    pub fn live(
        table: impl Into<String>,
        id: impl Into<String>,
        fields: Fields,
        timestamp: Timestamp,
        origin: PeerId,
    ) -> Self {
        let mut record = Self {
            table: table.into(),
            id: id.into(),
            fields,
            timestamp,
            origin,
            deleted: false,
        };
        record.normalize();
        record
    }

    /// A tombstone: identity and version only, no fields.
    pub fn tombstone(
        table: impl Into<String>,
        id: impl Into<String>,
        timestamp: Timestamp,
        origin: PeerId,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            fields: Fields::new(),
            timestamp,
            origin,
            deleted: true,
        }
    }

    pub fn version(&self) -> Version {
        Version {
            timestamp: self.timestamp,
            origin: self.origin.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Merge `patch` into the fields; `Null` clears a field.
    pub fn apply_patch(&mut self, patch: Fields) {
        for (name, value) in patch {
            if value.is_null() {
                self.fields.remove(&name);
            } else {
                self.fields.insert(name, value);
            }
        }
    }

    /// Turn this record into a tombstone at the given version.
    pub fn mark_deleted(&mut self, timestamp: Timestamp, origin: PeerId) {
        self.fields.clear();
        self.deleted = true;
        self.timestamp = timestamp;
        self.origin = origin;
    }

    /// Drop explicit nulls, and all fields of a tombstone.
    pub fn normalize(&mut self) {
        if self.deleted {
            self.fields.clear();
        } else {
            self.fields.retain(|_, v| !v.is_null());
        }
    }
}
