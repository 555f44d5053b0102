//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking. Every operation runs
//! in its own transaction while holding the connection mutex, which
//! serializes writes and keeps each read-compare-write atomic.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use peerbase_core::{
    FieldType, FieldValue, Fields, HybridClock, PeerId, Record, Schema, TableSchema, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, quote};
use crate::mutation;
use crate::traits::{HwmUpdate, InvalidationHook, MergeOutcome, PeerSyncState, Store};

/// Identity and clock, shared with the blocking tasks.
struct Shared {
    schema: Schema,
    local: PeerId,
    clock: Arc<HybridClock>,
}

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    shared: Arc<Shared>,
    hook: Option<Arc<dyn InvalidationHook>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file if needed, runs migrations and creates a table for
    /// every table in `schema`.
    pub fn open(
        path: impl AsRef<Path>,
        schema: Schema,
        local: PeerId,
        clock: Arc<HybridClock>,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, schema, local, clock)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory(schema: Schema, local: PeerId, clock: Arc<HybridClock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, schema, local, clock)
    }

    fn init(
        mut conn: Connection,
        schema: Schema,
        local: PeerId,
        clock: Arc<HybridClock>,
    ) -> Result<Self> {
        migration::migrate(&mut conn)?;

        let mut newest = 0;
        for table in schema.tables() {
            migration::ensure_table(&conn, table)?;
            let max: Timestamp = conn.query_row(
                &format!("SELECT COALESCE(MAX(timestamp), 0) FROM {}", quote(table.name())),
                [],
                |row| row.get(0),
            )?;
            newest = newest.max(max);
        }
        let marks: Timestamp = conn.query_row(
            "SELECT COALESCE(MAX(last_sync_timestamp), 0) FROM sync_metadata",
            [],
            |row| row.get(0),
        )?;
        // Local writes after a restart must outrank everything stored and
        // every high-water mark, or they would never be offered again.
        clock.observe(newest.max(marks));

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            shared: Arc::new(Shared {
                schema,
                local,
                clock,
            }),
            hook: None,
        })
    }

    /// Notify `hook` after every successful write.
    pub fn with_invalidation_hook(mut self, hook: Arc<dyn InvalidationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Run a blocking operation on the connection.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Shared) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let shared = self.shared.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(lock_error)?;
            f(&mut conn, &shared)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }

    fn invalidate(&self, record: &Record) {
        if let Some(hook) = &self.hook {
            hook.invalidate(&record.table, &record.id);
        }
    }
}

fn lock_error<T>(e: PoisonError<T>) -> StoreError {
    StoreError::Database(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
        Some(format!("mutex poisoned: {}", e)),
    ))
}

/// `id, timestamp, origin, deleted`, then the declared fields in order.
fn column_list(table: &TableSchema) -> Vec<String> {
    ["id", "timestamp", "origin", "deleted"]
        .into_iter()
        .map(String::from)
        .chain(table.fields().iter().map(|f| quote(&f.name)))
        .collect()
}

fn select_sql(table: &TableSchema, filter: &str) -> String {
    format!(
        "SELECT {} FROM {} {}",
        column_list(table).join(", "),
        quote(table.name()),
        filter
    )
}

// Helper to convert a row to a Record
fn row_to_record(table: &TableSchema, row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let mut fields = Fields::new();
    for (i, def) in table.fields().iter().enumerate() {
        let idx = 4 + i;
        let value = match def.field_type {
            FieldType::Text => row.get::<_, Option<String>>(idx)?.map(FieldValue::Text),
            FieldType::Integer => row.get::<_, Option<i64>>(idx)?.map(FieldValue::Integer),
            FieldType::Real => row.get::<_, Option<f64>>(idx)?.map(FieldValue::Real),
            FieldType::Boolean => row.get::<_, Option<bool>>(idx)?.map(FieldValue::Boolean),
            FieldType::Bytes => row.get::<_, Option<Vec<u8>>>(idx)?.map(FieldValue::Bytes),
        };
        if let Some(value) = value {
            fields.insert(def.name.clone(), value);
        }
    }

    Ok(Record {
        table: table.name().to_string(),
        id: row.get(0)?,
        fields,
        timestamp: row.get(1)?,
        origin: PeerId::new(row.get::<_, String>(2)?),
        deleted: row.get(3)?,
    })
}

fn sql_value(value: Option<&FieldValue>) -> Value {
    match value {
        None | Some(FieldValue::Null) => Value::Null,
        Some(FieldValue::Text(s)) => Value::Text(s.clone()),
        Some(FieldValue::Integer(i)) => Value::Integer(*i),
        Some(FieldValue::Real(f)) => Value::Real(*f),
        Some(FieldValue::Boolean(b)) => Value::Integer(i64::from(*b)),
        Some(FieldValue::Bytes(b)) => Value::Blob(b.clone()),
    }
}

fn load(conn: &Connection, table: &TableSchema, id: &str) -> Result<Option<Record>> {
    conn.prepare_cached(&select_sql(table, "WHERE id = ?1"))?
        .query_row(params![id], |row| row_to_record(table, row))
        .optional()
        .map_err(StoreError::from)
}

/// Upsert the full row. Fields absent from the record are written as NULL.
fn write_record(conn: &Connection, table: &TableSchema, record: &Record) -> Result<()> {
    let columns = column_list(table);
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        quote(table.name()),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    );

    let mut values = vec![
        Value::Text(record.id.clone()),
        Value::Integer(record.timestamp),
        Value::Text(record.origin.as_str().to_string()),
        Value::Integer(i64::from(record.deleted)),
    ];
    values.extend(table.fields().iter().map(|f| sql_value(record.fields.get(&f.name))));

    conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    Ok(())
}

fn query_records(
    conn: &Connection,
    table: &TableSchema,
    filter: &str,
    param: Option<Timestamp>,
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare_cached(&select_sql(table, filter))?;
    let records = match param {
        Some(threshold) => stmt
            .query_map(params![threshold], |row| row_to_record(table, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt
            .query_map([], |row| row_to_record(table, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(records)
}

#[async_trait]
impl Store for SqliteStore {
    fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    fn local_peer(&self) -> &PeerId {
        &self.shared.local
    }

    fn clock(&self) -> &HybridClock {
        &self.shared.clock
    }

    async fn create(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let (table, id) = (table.to_string(), id.to_string());

        let record = self
            .run(move |conn, shared| {
                let schema = mutation::table(&shared.schema, &table)?;
                let tx = conn.transaction()?;
                let existing = load(&tx, schema, &id)?;
                let record =
                    mutation::create(schema, existing.as_ref(), &id, fields, &shared.local, &shared.clock)?;
                write_record(&tx, schema, &record)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;

        debug!(table = %record.table, id = %record.id, timestamp = record.timestamp, "created record");
        self.invalidate(&record);
        Ok(record)
    }

    async fn read(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let (table, id) = (table.to_string(), id.to_string());

        self.run(move |conn, shared| {
            let schema = mutation::table(&shared.schema, &table)?;
            Ok(load(conn, schema, &id)?.filter(Record::is_live))
        })
        .await
    }

    async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let (table, id) = (table.to_string(), id.to_string());

        let record = self
            .run(move |conn, shared| {
                let schema = mutation::table(&shared.schema, &table)?;
                let tx = conn.transaction()?;
                let existing = load(&tx, schema, &id)?;
                let record =
                    mutation::update(schema, existing, &id, fields, &shared.local, &shared.clock)?;
                write_record(&tx, schema, &record)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;

        debug!(table = %record.table, id = %record.id, timestamp = record.timestamp, "updated record");
        self.invalidate(&record);
        Ok(record)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Record> {
        let (table, id) = (table.to_string(), id.to_string());

        let (record, written) = self
            .run(move |conn, shared| {
                let schema = mutation::table(&shared.schema, &table)?;
                let tx = conn.transaction()?;
                let existing = load(&tx, schema, &id)?;
                let (record, written) =
                    mutation::delete(schema, existing, &id, &shared.local, &shared.clock)?;
                if written {
                    write_record(&tx, schema, &record)?;
                }
                tx.commit()?;
                Ok((record, written))
            })
            .await?;

        if written {
            debug!(table = %record.table, id = %record.id, timestamp = record.timestamp, "deleted record");
            self.invalidate(&record);
        }
        Ok(record)
    }

    async fn list(&self, table: &str) -> Result<Vec<Record>> {
        let table = table.to_string();

        self.run(move |conn, shared| {
            let schema = mutation::table(&shared.schema, &table)?;
            query_records(conn, schema, "WHERE deleted = 0 ORDER BY id", None)
        })
        .await
    }

    async fn changes_since(&self, table: &str, threshold: Timestamp) -> Result<Vec<Record>> {
        let table = table.to_string();

        self.run(move |conn, shared| {
            let schema = mutation::table(&shared.schema, &table)?;
            query_records(
                conn,
                schema,
                "WHERE timestamp > ?1 ORDER BY timestamp, id",
                Some(threshold),
            )
        })
        .await
    }

    async fn apply_merged(&self, record: &Record) -> Result<MergeOutcome> {
        let incoming = record.clone();

        let (outcome, record) = self
            .run(move |conn, shared| {
                let record = mutation::check_incoming(&shared.schema, &incoming)?;
                shared.clock.observe(record.timestamp);

                let schema = mutation::table(&shared.schema, &record.table)?;
                let tx = conn.transaction()?;
                let local = load(&tx, schema, &record.id)?;
                let outcome = mutation::merge(local.as_ref(), &record);
                if outcome == MergeOutcome::Applied {
                    write_record(&tx, schema, &record)?;
                }
                tx.commit()?;
                Ok((outcome, record))
            })
            .await?;

        if outcome == MergeOutcome::Applied {
            self.invalidate(&record);
        }
        Ok(outcome)
    }

    async fn high_water_mark(&self, peer: &PeerId) -> Result<Timestamp> {
        let peer = peer.clone();

        self.run(move |conn, _| {
            let hwm: Option<Timestamp> = conn
                .query_row(
                    "SELECT last_sync_timestamp FROM sync_metadata WHERE peer_id = ?1",
                    params![peer.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(hwm.unwrap_or(0))
        })
        .await
    }

    async fn set_high_water_mark(&self, peer: &PeerId, timestamp: Timestamp) -> Result<HwmUpdate> {
        let peer = peer.clone();

        self.run(move |conn, _| {
            let tx = conn.transaction()?;
            let current: Option<Timestamp> = tx
                .query_row(
                    "SELECT last_sync_timestamp FROM sync_metadata WHERE peer_id = ?1",
                    params![peer.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let update = HwmUpdate::decide(current, timestamp);
            if update.writes() {
                tx.execute(
                    "INSERT INTO sync_metadata (peer_id, last_sync_timestamp) VALUES (?1, ?2)
                     ON CONFLICT(peer_id) DO UPDATE SET last_sync_timestamp = excluded.last_sync_timestamp",
                    params![peer.as_str(), timestamp],
                )?;
            }
            tx.commit()?;
            Ok(update)
        })
        .await
    }

    async fn peer_states(&self) -> Result<Vec<PeerSyncState>> {
        self.run(|conn, _| {
            let mut stmt = conn.prepare(
                "SELECT peer_id, last_sync_timestamp FROM sync_metadata ORDER BY peer_id",
            )?;
            let states = stmt
                .query_map([], |row| {
                    Ok(PeerSyncState {
                        peer_id: PeerId::new(row.get::<_, String>(0)?),
                        last_sync_timestamp: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(states)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use peerbase_core::{fields, ManualClock};

    fn store_at(wall: Timestamp) -> (Arc<ManualClock>, SqliteStore) {
        let manual = Arc::new(ManualClock::new(wall));
        let clock = Arc::new(HybridClock::new(manual.clone()));
        let store = SqliteStore::open_memory(conformance::schema(), PeerId::new("node-a"), clock).unwrap();
        (manual, store)
    }

    #[tokio::test]
    async fn test_conformance() {
        let (manual, store) = store_at(1_000);
        conformance::run_all(&store, &manual).await;
    }

    #[tokio::test]
    async fn test_typed_columns_roundtrip() {
        let (_, store) = store_at(1_000);
        let created = store
            .create(
                "users",
                "u1",
                fields([
                    ("email", "a@x.com".into()),
                    ("age", 41i64.into()),
                    ("score", 2.5f64.into()),
                    ("active", true.into()),
                    ("avatar", vec![1u8, 2, 3].into()),
                ]),
            )
            .await
            .unwrap();

        let read = store.read("users", "u1").await.unwrap().unwrap();
        assert_eq!(read, created);
        assert_eq!(read.get("active"), Some(&FieldValue::Boolean(true)));
        assert_eq!(read.get("avatar"), Some(&FieldValue::Bytes(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let peer = PeerId::new("node-a");

        let manual = Arc::new(ManualClock::new(5_000));
        {
            let clock = Arc::new(HybridClock::new(manual.clone()));
            let store = SqliteStore::open(&path, conformance::schema(), peer.clone(), clock).unwrap();
            store
                .create("users", "u1", fields([("email", "a@x.com".into())]))
                .await
                .unwrap();
            store.delete("users", "u2").await.unwrap();
            store.set_high_water_mark(&PeerId::new("node-b"), 9_000).await.unwrap();
        }

        // Wall clock went backwards across the restart.
        manual.set(10);
        let clock = Arc::new(HybridClock::new(manual.clone()));
        let store = SqliteStore::open(&path, conformance::schema(), peer, clock).unwrap();

        assert_eq!(store.list("users").await.unwrap().len(), 1);
        assert_eq!(store.changes_since("users", 0).await.unwrap().len(), 2);
        assert_eq!(store.high_water_mark(&PeerId::new("node-b")).await.unwrap(), 9_000);

        let updated = store
            .update("users", "u1", fields([("email", "b@x.com".into())]))
            .await
            .unwrap();
        // Above both the newest record and the stored mark.
        assert!(updated.timestamp > 9_000);
    }
}
