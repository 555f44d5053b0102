//! # peerbase
//!
//! Peer-to-peer replication of structured records. Every node holds a full
//! copy of the replicated tables, mutates it locally while offline, and
//! converges with peers through pairwise sync rounds.
//!
//! ## Key Concepts
//!
//! - **Record**: a row with a version `(timestamp, origin)`. The higher
//!   version wins on conflict; equal timestamps fall back to the origin.
//! - **Tombstone**: a deleted record keeps its id and version so the delete
//!   propagates and older copies never come back.
//! - **High-water mark**: per peer, the start of the last confirmed round.
//!   It only moves after both directions of a round were applied.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerbase::{Node, NodeConfig};
//! use peerbase::core::{fields, PeerId};
//! use peerbase::sync::MemoryNetwork;
//!
//! async fn example() -> peerbase::Result<()> {
//!     peerbase::init_logging("info")?;
//!
//!     let config = NodeConfig::load("node-a.toml")?;
//!     let network = MemoryNetwork::new();
//!     let node = Node::open(&config, Arc::new(network.create_transport(config.peer_id())), None)?;
//!
//!     node.create("users", "u1", fields([("email", "a@x.com".into())])).await?;
//!     let report = node.sync_with(&PeerId::new("node-b")).await?;
//!     println!("applied {} records", report.applied);
//!
//!     if let Some(scheduler) = node.start_scheduler() {
//!         scheduler.shutdown().await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `peerbase::core` - records, schema, clock, merge rule
//! - `peerbase::store` - change-tracked stores (SQLite and in-memory)
//! - `peerbase::sync` - replication engine, transport, events

pub mod config;
pub mod error;
pub mod node;
pub mod scheduler;

// Re-export component crates
pub use peerbase_core as core;
pub use peerbase_store as store;
pub use peerbase_sync as sync;

pub use config::NodeConfig;
pub use error::{ConfigError, NodeError, Result};
pub use node::{Node, NodeOptions};
pub use scheduler::{Scheduler, SchedulerConfig};

pub use peerbase_core::{FieldType, FieldValue, Fields, PeerId, Record, Schema, TableSchema};
pub use peerbase_sync::{SyncConfig, SyncEvent, SyncReport};

use tracing_subscriber::EnvFilter;

/// Install a formatted `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter` when set. Fails if a
/// global subscriber is already installed.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| NodeError::Logging(e.to_string()))
}
