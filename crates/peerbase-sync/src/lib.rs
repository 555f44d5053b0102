//! # peerbase sync
//!
//! Pairwise replication between peers that each hold a full copy of the
//! replicated tables.
//!
//! ## Overview
//!
//! A round exchanges every change either side made since the last confirmed
//! round, merges both directions with last-writer-wins, and only then moves
//! each side's high-water mark for the other. Interrupted rounds are simply
//! repeated: merging is idempotent and commutative. Large backlogs travel in
//! batches of oldest changes first, one round per batch, and the marks move
//! up to the newest timestamp each confirmed batch carried.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerbase_core::{fields, FieldType, HybridClock, PeerId, Schema, TableSchema};
//! use peerbase_store::{MemoryStore, Store};
//! use peerbase_sync::{EventBus, MemoryNetwork, SyncConfig, SyncEngine};
//!
//! async fn example() -> peerbase_sync::Result<()> {
//!     let schema = Schema::new()
//!         .with_table(TableSchema::new("users").required("email", FieldType::Text))
//!         .map_err(|e| peerbase_sync::SyncError::Config(e.to_string()))?;
//!     let network = MemoryNetwork::new();
//!
//!     let local = PeerId::new("node-a");
//!     let store = Arc::new(MemoryStore::new(schema, local.clone(), Arc::new(HybridClock::system())));
//!     let transport = Arc::new(network.create_transport(local));
//!     let engine = SyncEngine::new(store.clone(), transport, SyncConfig::with_tables(["users"]), EventBus::default())?;
//!
//!     store.create("users", "u1", fields([("email", "a@x.com".into())])).await?;
//!     let report = engine.sync_with(&PeerId::new("node-b")).await?;
//!     println!("sent {} received {}", report.sent, report.received);
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Node A (initiator)                  Node B (responder)
//!   |-------- Offer(changes) -------->|  merge, stash round start
//!   |<------- Answer(changes) --------|
//!   |  merge                          |
//!   |-------- Commit ---------------->|  advance mark for A
//!   |<------- Committed --------------|
//!   |  advance mark for B             |
//! ```

pub mod convergence;
pub mod error;
pub mod events;
pub mod messages;
pub mod peer_state;
pub mod protocol;
pub mod transport;

pub use convergence::{table_digest, verify_convergence, ConvergenceResult};
pub use error::{Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use messages::{limits, MergeSummary, SessionId, SyncErrorCode, SyncMessage, PROTOCOL_VERSION};
pub use peer_state::HighWaterMarks;
pub use protocol::{Outgoing, SyncConfig, SyncEngine, SyncReport};
pub use transport::{
    memory::{LinkFault, MemoryNetwork, MemoryTransport},
    MessageHandler, Transport,
};
