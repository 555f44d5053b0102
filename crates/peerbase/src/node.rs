//! The Node: one replica of the replicated tables.
//!
//! A node ties a change-tracked store to the replication engine and exposes
//! the record operations an API layer needs alongside sync.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use peerbase_core::{Digest, Fields, HybridClock, PeerId, Record};
use peerbase_store::{InvalidationHook, MemoryStore, PeerSyncState, SqliteStore, Store};
use peerbase_sync::{
    table_digest, EventBus, SyncConfig, SyncEngine, SyncEvent, SyncReport, Transport,
};

use crate::config::{NodeConfig, StorageBackend};
use crate::error::{ConfigError, Result};
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Configuration for a node.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Peers synced by [`Node::sync_all`] and the scheduler.
    pub peers: Vec<PeerId>,
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
}

/// A replica: store, replication engine and event bus.
pub struct Node {
    store: Arc<dyn Store>,
    engine: Arc<SyncEngine>,
    events: EventBus,
    options: NodeOptions,
}

impl Node {
    /// Create a node over an opened store.
    ///
    /// The engine registers itself with `transport` as the inbound handler.
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        options: NodeOptions,
    ) -> Result<Self> {
        let events = EventBus::default();
        let engine = SyncEngine::new(store.clone(), transport, options.sync.clone(), events.clone())?;
        info!(peer = %store.local_peer(), tables = ?options.sync.tables, "node ready");
        Ok(Self {
            store,
            engine,
            events,
            options,
        })
    }

    /// Open the store described by `config` and create a node over it.
    pub fn open(
        config: &NodeConfig,
        transport: Arc<dyn Transport>,
        hook: Option<Arc<dyn InvalidationHook>>,
    ) -> Result<Self> {
        let schema = config.schema()?;
        let local = config.peer_id();
        let clock = Arc::new(HybridClock::system());

        let store: Arc<dyn Store> = match config.storage.backend {
            StorageBackend::Memory => {
                let store = MemoryStore::new(schema, local, clock);
                match hook {
                    Some(hook) => Arc::new(store.with_invalidation_hook(hook)),
                    None => Arc::new(store),
                }
            }
            StorageBackend::Sqlite => {
                let path = config.storage.path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("storage.path is required for the sqlite backend".into())
                })?;
                let store = SqliteStore::open(path, schema, local, clock)?;
                match hook {
                    Some(hook) => Arc::new(store.with_invalidation_hook(hook)),
                    None => Arc::new(store),
                }
            }
        };

        let options = NodeOptions {
            peers: config.peers(),
            sync: config.sync_config(),
            scheduler: config.scheduler_config(),
        };
        Self::new(store, transport, options)
    }

    pub fn local_peer(&self) -> &PeerId {
        self.store.local_peer()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.options.peers
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn create(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        Ok(self.store.create(table, id, fields).await?)
    }

    pub async fn read(&self, table: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.store.read(table, id).await?)
    }

    pub async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        Ok(self.store.update(table, id, fields).await?)
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<Record> {
        Ok(self.store.delete(table, id).await?)
    }

    pub async fn list(&self, table: &str) -> Result<Vec<Record>> {
        Ok(self.store.list(table).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Sync with `peer` until neither side has a batch left.
    pub async fn sync_with(&self, peer: &PeerId) -> Result<SyncReport> {
        Ok(self.engine.sync_with(peer).await?)
    }

    /// Sync with every configured peer in turn.
    ///
    /// A failure with one peer does not stop the others; it is reported in
    /// that peer's [`SyncReport`].
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let mut reports = Vec::with_capacity(self.options.peers.len());
        for peer in &self.options.peers {
            let report = match self.engine.sync_with(peer).await {
                Ok(report) => report,
                Err(e) => SyncReport::failure(peer, &e),
            };
            reports.push(report);
        }
        reports
    }

    /// Start periodic sync with every configured peer.
    ///
    /// Returns `None` when the scheduler is disabled in the options.
    pub fn start_scheduler(&self) -> Option<Scheduler> {
        if !self.options.scheduler.enabled {
            info!("sync scheduler disabled");
            return None;
        }
        Some(Scheduler::start(
            self.engine.clone(),
            self.options.peers.clone(),
            self.options.scheduler.clone(),
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Persisted high-water marks, one per peer a round has completed with.
    pub async fn peer_states(&self) -> Result<Vec<PeerSyncState>> {
        Ok(self.engine.high_water_marks().all().await?)
    }

    /// Digest of one table's full state, tombstones included.
    pub async fn table_digest(&self, table: &str) -> Result<Digest> {
        Ok(table_digest(self.store.as_ref(), table).await?)
    }
}
