//! ChangeSet: the unit of exchange between peers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::Record;

/// Records changed since some threshold, grouped by table.
///
/// Tombstones are included. Order within a table carries no meaning: the
/// merge rule decides per record regardless of application order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    tables: BTreeMap<String, Vec<Record>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record under its own table.
    pub fn push(&mut self, record: Record) {
        self.tables
            .entry(record.table.clone())
            .or_default()
            .push(record);
    }

    /// Add a batch of records for one table.
    ///
    /// An empty batch does not create an entry for the table.
    pub fn extend_table(&mut self, table: &str, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        self.tables
            .entry(table.to_string())
            .or_default()
            .extend(records);
    }

    /// Total number of records across all tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Records for one table (empty slice if none).
    pub fn table(&self, name: &str) -> &[Record] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate `(table, records)` in table-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.tables
            .iter()
            .map(|(name, records)| (name.as_str(), records.as_slice()))
    }

    /// Iterate every record in table-name order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.tables.values().flatten()
    }
}

impl FromIterator<Record> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut changes = ChangeSet::new();
        for record in iter {
            changes.push(record);
        }
        changes
    }
}

impl IntoIterator for ChangeSet {
    type Item = (String, Vec<Record>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Vec<Record>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tables.into_iter()
    }
}
