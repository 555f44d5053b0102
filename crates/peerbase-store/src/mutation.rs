//! Write rules shared by every store backend.
//!
//! Backends load the current state of one key, call into this module while
//! still holding their write lock (or transaction), and persist the result.

use peerbase_core::{resolve, Fields, HybridClock, PeerId, Record, Resolution, Schema, SchemaError, TableSchema};

use crate::error::{Result, StoreError};
use crate::traits::MergeOutcome;

pub(crate) fn table<'a>(schema: &'a Schema, name: &str) -> Result<&'a TableSchema> {
    schema
        .table(name)
        .map_err(|_| StoreError::UnknownTable(name.to_string()))
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SchemaError::EmptyId.into());
    }
    Ok(())
}

pub(crate) fn create(
    table: &TableSchema,
    existing: Option<&Record>,
    id: &str,
    fields: Fields,
    origin: &PeerId,
    clock: &HybridClock,
) -> Result<Record> {
    check_id(id)?;
    if existing.is_some_and(Record::is_live) {
        return Err(StoreError::DuplicateKey {
            table: table.name().to_string(),
            id: id.to_string(),
        });
    }
    table.validate_new(&fields)?;
    Ok(Record::live(table.name(), id, fields, clock.tick(), origin.clone()))
}

pub(crate) fn update(
    table: &TableSchema,
    existing: Option<Record>,
    id: &str,
    patch: Fields,
    origin: &PeerId,
    clock: &HybridClock,
) -> Result<Record> {
    let mut record = existing
        .filter(Record::is_live)
        .ok_or_else(|| StoreError::NotFound {
            table: table.name().to_string(),
            id: id.to_string(),
        })?;
    table.validate_patch(&patch)?;
    record.apply_patch(patch);
    record.timestamp = clock.tick();
    record.origin = origin.clone();
    Ok(record)
}

/// Returns the tombstone and whether it has to be written.
pub(crate) fn delete(
    table: &TableSchema,
    existing: Option<Record>,
    id: &str,
    origin: &PeerId,
    clock: &HybridClock,
) -> Result<(Record, bool)> {
    check_id(id)?;
    match existing {
        Some(record) if record.deleted => Ok((record, false)),
        Some(mut record) => {
            record.mark_deleted(clock.tick(), origin.clone());
            Ok((record, true))
        }
        None => Ok((
            Record::tombstone(table.name(), id, clock.tick(), origin.clone()),
            true,
        )),
    }
}

/// Validate a replicated record and return its normalized form.
pub(crate) fn check_incoming(schema: &Schema, incoming: &Record) -> Result<Record> {
    let table = table(schema, &incoming.table)?;
    check_id(&incoming.id)?;
    let mut record = incoming.clone();
    record.normalize();
    if record.is_live() {
        table.validate_new(&record.fields)?;
    }
    Ok(record)
}

pub(crate) fn merge(local: Option<&Record>, incoming: &Record) -> MergeOutcome {
    match resolve(local, incoming) {
        Resolution::Apply => MergeOutcome::Applied,
        Resolution::Discard => MergeOutcome::Discarded,
    }
}
