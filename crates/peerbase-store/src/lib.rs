//! # Peerbase Store
//!
//! Change-tracked storage for Peerbase. Provides a trait-based interface for
//! record persistence with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The store abstracts record storage behind the [`Store`] trait, allowing
//! the replication engine to be storage-agnostic. The primary
//! implementation is [`SqliteStore`], with [`MemoryStore`] for testing.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`MergeOutcome`] - Result of applying a replicated record
//! - [`PeerSyncState`] - Persisted high-water mark for one peer
//! - [`InvalidationHook`] - Cache invalidation callback
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerbase_core::{fields, FieldType, HybridClock, PeerId, Schema, TableSchema};
//! use peerbase_store::{SqliteStore, Store};
//!
//! async fn example() -> peerbase_store::Result<()> {
//!     let schema = Schema::new()
//!         .with_table(TableSchema::new("users").required("email", FieldType::Text))?;
//!     let clock = Arc::new(HybridClock::system());
//!     let store = SqliteStore::open("node.db", schema, PeerId::new("node-a"), clock)?;
//!
//!     store.create("users", "u1", fields([("email", "a@x.com".into())])).await?;
//!     let changes = store.changes_since("users", 0).await?;
//!     assert_eq!(changes.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Tombstones**: deletes are soft and permanent; tombstones replicate
//! - **Atomic merges**: `apply_merged` compares and writes under one lock
//! - **Peer state**: high-water marks live in `sync_metadata` and only move
//!   forward

pub mod error;
pub mod memory;
pub mod migration;
mod mutation;
pub mod sqlite;
pub mod traits;

#[cfg(test)]
mod conformance;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{HwmUpdate, InvalidationHook, MergeOutcome, PeerSyncState, Store};
