//! Database schema migrations for SQLite.
//!
//! Two layers:
//!
//! - Versioned migrations for the store's own bookkeeping tables. Each
//!   migration is a SQL batch that transforms the schema from version N to
//!   N+1.
//! - [`ensure_table`] for the replicated tables, which are declared by the
//!   caller's [`TableSchema`] rather than by a fixed migration. It creates a
//!   missing table and adds missing columns; it never drops anything.

use rusqlite::Connection;
use tracing::info;

use peerbase_core::{Clock, SystemClock, TableSchema};

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, SystemClock.now_millis()],
            )?;
        }

        tx.commit()?;
        info!(from = current, to = CURRENT_VERSION, "migrated store schema");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: peer sync state.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per remote peer, created on the first confirmed round
        CREATE TABLE sync_metadata (
            peer_id TEXT PRIMARY KEY,
            last_sync_timestamp INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}

/// Create or extend the SQL table backing a replicated table.
pub fn ensure_table(conn: &Connection, table: &TableSchema) -> Result<()> {
    table
        .check_definition()
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    let name = quote(table.name());
    let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
    columns.extend(
        table
            .fields()
            .iter()
            .map(|f| format!("{} {}", quote(&f.name), f.field_type.sql_type())),
    );
    columns.push("timestamp INTEGER NOT NULL".into());
    columns.push("origin TEXT NOT NULL".into());
    columns.push("deleted INTEGER NOT NULL DEFAULT 0".into());

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {name} ({});
         CREATE INDEX IF NOT EXISTS {} ON {name}(timestamp);",
        columns.join(", "),
        quote(&format!("idx_{}_timestamp", table.name())),
    ))?;

    // Fields declared after the table was first created.
    let existing = column_names(conn, table.name())?;
    for field in table.fields() {
        if !existing.iter().any(|c| c == &field.name) {
            conn.execute_batch(&format!(
                "ALTER TABLE {name} ADD COLUMN {} {}",
                quote(&field.name),
                field.field_type.sql_type()
            ))?;
            info!(table = table.name(), column = %field.name, "added column");
        }
    }

    Ok(())
}

fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Quote an identifier. Callers only pass names that passed
/// `is_identifier`, so no escaping is needed.
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}
