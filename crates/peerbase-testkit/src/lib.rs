//! # peerbase testkit
//!
//! Testing utilities for peerbase.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: replicas on an in-memory network with manual clocks
//! - **Generators**: Proptest strategies for records and local mutations
//!
//! ## Test Fixtures
//!
//! ```rust
//! use peerbase_testkit::TestCluster;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let cluster = TestCluster::new(&["node-a", "node-b"]);
//! cluster[0].create_user("u1", "a@x.com").await;
//! cluster[0].sync_with(&cluster[1]).await.unwrap();
//! assert_eq!(cluster[1].email("u1").await.as_deref(), Some("a@x.com"));
//! # });
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use peerbase_core::{resolve, Resolution};
//! use peerbase_testkit::generators::user_record;
//!
//! proptest! {
//!     #[test]
//!     fn same_version_is_discarded(r in user_record()) {
//!         prop_assert_eq!(resolve(Some(&r), &r), Resolution::Discard);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{test_schema, test_sync_config, TestCluster, TestNode, START_MILLIS};
pub use generators::{apply_user_op, user_op, user_record, UserOp};
