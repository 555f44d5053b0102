//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use peerbase_core::{Fields, HybridClock, PeerId, Record, Schema, TableSchema, Timestamp};

use crate::error::{Result, StoreError};
use crate::mutation;
use crate::traits::{HwmUpdate, InvalidationHook, MergeOutcome, PeerSyncState, Store};

type Rows = BTreeMap<String, Record>;

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Each table has its own
/// RwLock, so writes to different tables do not contend.
pub struct MemoryStore {
    schema: Schema,
    local: PeerId,
    clock: Arc<HybridClock>,
    tables: BTreeMap<String, RwLock<Rows>>,
    peers: RwLock<BTreeMap<PeerId, Timestamp>>,
    hook: Option<Arc<dyn InvalidationHook>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty in-memory store holding the tables of `schema`.
    pub fn new(schema: Schema, local: PeerId, clock: Arc<HybridClock>) -> Self {
        let tables = schema
            .table_names()
            .map(|name| (name.to_string(), RwLock::new(Rows::new())))
            .collect();

        Self {
            schema,
            local,
            clock,
            tables,
            peers: RwLock::new(BTreeMap::new()),
            hook: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Notify `hook` after every successful write.
    pub fn with_invalidation_hook(mut self, hook: Arc<dyn InvalidationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Make every record write fail with an I/O error until switched off.
    ///
    /// Used to exercise storage-failure paths in the replication engine.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn rows(&self, table: &str) -> Result<(&TableSchema, &RwLock<Rows>)> {
        let schema = mutation::table(&self.schema, table)?;
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok((schema, rows))
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        Ok(())
    }

    fn invalidate(&self, record: &Record) {
        if let Some(hook) = &self.hook {
            hook.invalidate(&record.table, &record.id);
        }
    }
}

// A panic while holding a guard leaves at most one key half-written, and
// every write replaces a whole record, so the data is still usable.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Store for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn clock(&self) -> &HybridClock {
        &self.clock
    }

    async fn create(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let (schema, rows) = self.rows(table)?;
        let record = {
            let mut rows = write_lock(rows);
            self.check_writable()?;
            let record =
                mutation::create(schema, rows.get(id), id, fields, &self.local, &self.clock)?;
            rows.insert(record.id.clone(), record.clone());
            record
        };

        debug!(table, id, timestamp = record.timestamp, "created record");
        self.invalidate(&record);
        Ok(record)
    }

    async fn read(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let (_, rows) = self.rows(table)?;
        let rows = read_lock(rows);
        Ok(rows.get(id).filter(|r| r.is_live()).cloned())
    }

    async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let (schema, rows) = self.rows(table)?;
        let record = {
            let mut rows = write_lock(rows);
            self.check_writable()?;
            let existing = rows.get(id).cloned();
            let record = mutation::update(schema, existing, id, fields, &self.local, &self.clock)?;
            rows.insert(record.id.clone(), record.clone());
            record
        };

        debug!(table, id, timestamp = record.timestamp, "updated record");
        self.invalidate(&record);
        Ok(record)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Record> {
        let (schema, rows) = self.rows(table)?;
        let (record, written) = {
            let mut rows = write_lock(rows);
            self.check_writable()?;
            let existing = rows.get(id).cloned();
            let (record, written) = mutation::delete(schema, existing, id, &self.local, &self.clock)?;
            if written {
                rows.insert(record.id.clone(), record.clone());
            }
            (record, written)
        };

        if written {
            debug!(table, id, timestamp = record.timestamp, "deleted record");
            self.invalidate(&record);
        }
        Ok(record)
    }

    async fn list(&self, table: &str) -> Result<Vec<Record>> {
        let (_, rows) = self.rows(table)?;
        let rows = read_lock(rows);
        Ok(rows.values().filter(|r| r.is_live()).cloned().collect())
    }

    async fn changes_since(&self, table: &str, threshold: Timestamp) -> Result<Vec<Record>> {
        let (_, rows) = self.rows(table)?;
        let rows = read_lock(rows);
        let mut changes: Vec<Record> = rows
            .values()
            .filter(|r| r.timestamp > threshold)
            .cloned()
            .collect();
        changes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(changes)
    }

    async fn apply_merged(&self, record: &Record) -> Result<MergeOutcome> {
        let record = mutation::check_incoming(&self.schema, record)?;
        self.clock.observe(record.timestamp);

        let (_, rows) = self.rows(&record.table)?;
        let outcome = {
            let mut rows = write_lock(rows);
            let outcome = mutation::merge(rows.get(&record.id), &record);
            if outcome == MergeOutcome::Applied {
                self.check_writable()?;
                rows.insert(record.id.clone(), record.clone());
            }
            outcome
        };

        if outcome == MergeOutcome::Applied {
            self.invalidate(&record);
        }
        Ok(outcome)
    }

    async fn high_water_mark(&self, peer: &PeerId) -> Result<Timestamp> {
        Ok(read_lock(&self.peers).get(peer).copied().unwrap_or(0))
    }

    async fn set_high_water_mark(&self, peer: &PeerId, timestamp: Timestamp) -> Result<HwmUpdate> {
        let mut peers = write_lock(&self.peers);
        let update = HwmUpdate::decide(peers.get(peer).copied(), timestamp);
        if update.writes() {
            peers.insert(peer.clone(), timestamp);
        }
        Ok(update)
    }

    async fn peer_states(&self) -> Result<Vec<PeerSyncState>> {
        Ok(read_lock(&self.peers)
            .iter()
            .map(|(peer_id, ts)| PeerSyncState {
                peer_id: peer_id.clone(),
                last_sync_timestamp: *ts,
            })
            .collect())
    }
}
