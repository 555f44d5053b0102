//! Canonical CBOR encoding.
//!
//! Two uses:
//!
//! - [`canonical_record_bytes`] produces a deterministic byte form of a
//!   record (RFC 8949 core deterministic encoding: sorted map keys, smallest
//!   integer encodings, definite lengths, no floats). Convergence digests are
//!   computed over it, so two nodes holding the same record state produce the
//!   same bytes.
//! - [`to_cbor`] / [`from_cbor`] encode any serde type for the wire.

use ciborium::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::record::{FieldValue, Record};

/// Record field keys (integer keys for compact encoding).
///
/// Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub const TABLE: u64 = 0;
    pub const ID: u64 = 1;
    pub const TIMESTAMP: u64 = 2;
    pub const ORIGIN: u64 = 3;
    pub const DELETED: u64 = 4;
    pub const FIELDS: u64 = 5;
}

/// Field value type tags.
mod tags {
    pub const TEXT: u64 = 0;
    pub const INTEGER: u64 = 1;
    pub const REAL: u64 = 2;
    pub const BOOLEAN: u64 = 3;
    pub const BYTES: u64 = 4;
}

/// Encode a record to canonical CBOR bytes.
pub fn canonical_record_bytes(record: &Record) -> Vec<u8> {
    let value = record_to_cbor_value(record);
    encode_cbor_value_canonical(&value)
}

/// Encode a serde value as CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a serde value from CBOR.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

fn record_to_cbor_value(record: &Record) -> Value {
    let key = |k: u64| Value::Integer(k.into());

    // Null fields are never stored, so only present values are encoded.
    let fields: Vec<(Value, Value)> = record
        .fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(name, value)| (Value::Text(name.clone()), field_to_cbor_value(value)))
        .collect();

    Value::Map(vec![
        (key(keys::TABLE), Value::Text(record.table.clone())),
        (key(keys::ID), Value::Text(record.id.clone())),
        (key(keys::TIMESTAMP), Value::Integer(record.timestamp.into())),
        (key(keys::ORIGIN), Value::Text(record.origin.as_str().to_string())),
        (key(keys::DELETED), Value::Bool(record.deleted)),
        (key(keys::FIELDS), Value::Map(fields)),
    ])
}

/// `[tag, value]`. Reals are encoded through their IEEE 754 bit pattern to
/// keep floats out of the canonical form.
fn field_to_cbor_value(value: &FieldValue) -> Value {
    let tagged = |tag: u64, v: Value| Value::Array(vec![Value::Integer(tag.into()), v]);
    match value {
        FieldValue::Text(s) => tagged(tags::TEXT, Value::Text(s.clone())),
        FieldValue::Integer(i) => tagged(tags::INTEGER, Value::Integer((*i).into())),
        FieldValue::Real(f) => tagged(tags::REAL, Value::Bytes(f.to_bits().to_be_bytes().to_vec())),
        FieldValue::Boolean(b) => tagged(tags::BOOLEAN, Value::Bool(*b)),
        FieldValue::Bytes(b) => tagged(tags::BYTES, Value::Bytes(b.clone())),
        FieldValue::Null => Value::Null,
    }
}

/// Encode a CBOR Value to canonical bytes.
fn encode_cbor_value_canonical(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr),
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        // Floats, tags and nulls are never produced by this module.
        _ => buf.push(0xf6),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffffffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item);
    }
}

/// Encode a map canonically (major type 5): keys sorted by their encoded
/// bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut key_value_pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();

    key_value_pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, key_value_pairs.len() as u64);
    for (key_bytes, value) in key_value_pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}
