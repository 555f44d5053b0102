//! Table schemas: declared field names and types per replicated table.
//!
//! Records are validated against the schema at the store boundary, so shape
//! errors surface on `create`/`update` or when a replicated record arrives,
//! never in the middle of a merge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SchemaError;
use crate::record::{FieldValue, Fields};

/// Column names every replicated table carries in addition to its fields.
pub const RESERVED_COLUMNS: &[&str] = &["id", "timestamp", "origin", "deleted"];

/// Table names used by the store for its own bookkeeping.
pub const RESERVED_TABLES: &[&str] = &["sync_metadata", "schema_migrations"];

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    Bytes,
}

impl FieldType {
    /// Whether `value` is acceptable for a field of this type.
    ///
    /// `Null` is checked separately against the `required` flag. Reals
    /// must be finite: SQLite stores NaN as NULL.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (_, FieldValue::Null) => true,
            (FieldType::Real, FieldValue::Real(f)) => f.is_finite(),
            (FieldType::Text, FieldValue::Text(_))
            | (FieldType::Integer, FieldValue::Integer(_))
            | (FieldType::Boolean, FieldValue::Boolean(_))
            | (FieldType::Bytes, FieldValue::Bytes(_)) => true,
            _ => false,
        }
    }

    /// SQLite column affinity used for this type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Integer | FieldType::Boolean => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Bytes => "BLOB",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Boolean => "boolean",
            FieldType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Live records must carry a non-null value.
    pub required: bool,
}

/// Declared shape of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    fields: Vec<FieldDef>,
}

impl TableSchema {
    /// Start a table definition with no fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add an optional field.
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            required: false,
        });
        self
    }

    /// Add a field that every live record must carry.
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            required: true,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up a field definition by name.
    pub fn get(&self, field: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == field)
    }

    /// Check identifiers and uniqueness of the definition itself.
    pub fn check_definition(&self) -> Result<(), SchemaError> {
        if !is_identifier(&self.name) || RESERVED_TABLES.contains(&self.name.as_str()) {
            return Err(SchemaError::InvalidIdentifier(self.name.clone()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for field in &self.fields {
            if !is_identifier(&field.name) || RESERVED_COLUMNS.contains(&field.name.as_str()) {
                return Err(SchemaError::InvalidIdentifier(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::Duplicate(format!("{}.{}", self.name, field.name)));
            }
        }
        Ok(())
    }

    /// Validate the full field set of a new live record.
    pub fn validate_new(&self, fields: &Fields) -> Result<(), SchemaError> {
        self.validate_values(fields)?;
        for def in self.fields.iter().filter(|f| f.required) {
            match fields.get(&def.name) {
                Some(value) if !value.is_null() => {}
                _ => return Err(self.missing(&def.name)),
            }
        }
        Ok(())
    }

    /// Validate a partial update: known fields, matching types, and no
    /// required field cleared.
    pub fn validate_patch(&self, fields: &Fields) -> Result<(), SchemaError> {
        self.validate_values(fields)?;
        for (name, value) in fields {
            if value.is_null() && self.get(name).is_some_and(|d| d.required) {
                return Err(self.missing(name));
            }
        }
        Ok(())
    }

    fn validate_values(&self, fields: &Fields) -> Result<(), SchemaError> {
        for (name, value) in fields {
            let def = self.get(name).ok_or_else(|| SchemaError::UnknownField {
                table: self.name.clone(),
                field: name.clone(),
            })?;
            if matches!(value, FieldValue::Real(f) if !f.is_finite()) {
                return Err(SchemaError::NonFiniteReal {
                    table: self.name.clone(),
                    field: name.clone(),
                });
            }
            if !def.field_type.accepts(value) {
                return Err(SchemaError::TypeMismatch {
                    table: self.name.clone(),
                    field: name.clone(),
                    expected: def.field_type,
                    got: value.type_name(),
                });
            }
        }
        Ok(())
    }

    fn missing(&self, field: &str) -> SchemaError {
        SchemaError::MissingRequired {
            table: self.name.clone(),
            field: field.to_string(),
        }
    }
}

/// The set of tables a store holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table, rejecting invalid or duplicate definitions.
    pub fn with_table(mut self, table: TableSchema) -> Result<Self, SchemaError> {
        self.add_table(table)?;
        Ok(self)
    }

    pub fn add_table(&mut self, table: TableSchema) -> Result<(), SchemaError> {
        table.check_definition()?;
        if self.tables.contains_key(table.name()) {
            return Err(SchemaError::Duplicate(table.name().to_string()));
        }
        self.tables.insert(table.name().to_string(), table);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<&TableSchema, SchemaError> {
        self.tables
            .get(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, which is safe to splice into SQL as a quoted
/// identifier.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
