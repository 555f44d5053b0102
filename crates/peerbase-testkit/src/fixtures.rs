//! Test fixtures and helpers.
//!
//! Common setup for multi-node replication tests: in-memory stores on a
//! [`MemoryNetwork`], each node with its own manually driven wall clock.

use std::ops::Index;
use std::sync::Arc;

use peerbase_core::{fields, FieldType, HybridClock, ManualClock, PeerId, Record, Schema, TableSchema};
use peerbase_store::{MemoryStore, Store};
use peerbase_sync::{
    verify_convergence, ConvergenceResult, EventBus, MemoryNetwork, SyncConfig, SyncEngine,
    SyncReport,
};

/// Wall time every fixture clock starts at.
pub const START_MILLIS: i64 = 1_700_000_000_000;

/// `users { email: text (required), age: integer }` and
/// `items { name: text }`.
pub fn test_schema() -> Schema {
    Schema::new()
        .with_table(
            TableSchema::new("users")
                .required("email", FieldType::Text)
                .field("age", FieldType::Integer),
        )
        .and_then(|s| s.with_table(TableSchema::new("items").field("name", FieldType::Text)))
        .expect("fixture schema is valid")
}

/// Both fixture tables.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig::with_tables(["users", "items"])
}

/// One replica.
pub struct TestNode {
    pub id: PeerId,
    pub wall: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<SyncEngine>,
    pub events: EventBus,
}

impl TestNode {
    /// Create a node on `network` with the fixture schema.
    pub fn new(network: &Arc<MemoryNetwork>, name: &str, config: SyncConfig) -> Self {
        let id = PeerId::new(name);
        let wall = Arc::new(ManualClock::new(START_MILLIS));
        let clock = Arc::new(HybridClock::new(wall.clone()));
        let store = Arc::new(MemoryStore::new(test_schema(), id.clone(), clock));
        let events = EventBus::default();
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(network.create_transport(id.clone())),
            config,
            events.clone(),
        )
        .expect("fixture engine config is valid");
        Self {
            id,
            wall,
            store,
            engine,
            events,
        }
    }

    /// Move this node's wall clock forward.
    pub fn advance(&self, millis: i64) {
        self.wall.advance(millis);
    }

    pub async fn create_user(&self, id: &str, email: &str) -> Record {
        self.store
            .create("users", id, fields([("email", email.into())]))
            .await
            .expect("create user")
    }

    pub async fn set_email(&self, id: &str, email: &str) -> Record {
        self.store
            .update("users", id, fields([("email", email.into())]))
            .await
            .expect("update user")
    }

    /// The live user's email, `None` if absent or deleted.
    pub async fn email(&self, id: &str) -> Option<String> {
        self.store
            .read("users", id)
            .await
            .expect("read user")
            .and_then(|r| r.get("email").and_then(|v| v.as_text()).map(str::to_string))
    }

    pub async fn sync_with(&self, other: &TestNode) -> peerbase_sync::Result<SyncReport> {
        self.engine.sync_with(&other.id).await
    }

    pub async fn high_water_mark(&self, other: &TestNode) -> i64 {
        self.store
            .high_water_mark(&other.id)
            .await
            .expect("read high-water mark")
    }
}

/// Several nodes on one memory network.
pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// A cluster syncing both fixture tables.
    pub fn new(names: &[&str]) -> Self {
        Self::with_config(names, test_sync_config())
    }

    pub fn with_config(names: &[&str], config: SyncConfig) -> Self {
        let network = MemoryNetwork::new();
        let nodes = names
            .iter()
            .map(|name| TestNode::new(&network, name, config.clone()))
            .collect();
        Self { network, nodes }
    }

    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// One round for every pair of nodes, lower index initiating.
    ///
    /// Every node exchanges directly with every other, so this converges
    /// whatever was written where.
    pub async fn sync_mesh(&self) -> Vec<SyncReport> {
        let mut reports = Vec::new();
        for (i, a) in self.nodes.iter().enumerate() {
            for b in &self.nodes[i + 1..] {
                reports.push(a.sync_with(b).await.expect("mesh round"));
            }
        }
        reports
    }

    /// Whether every node holds the same state of both fixture tables.
    pub async fn converged(&self) -> bool {
        let tables = test_sync_config().tables;
        let Some((first, rest)) = self.nodes.split_first() else {
            return true;
        };
        for node in rest {
            let result = verify_convergence(first.store.as_ref(), node.store.as_ref(), &tables)
                .await
                .expect("digest");
            if result != ConvergenceResult::Converged {
                return false;
            }
        }
        true
    }
}

impl Index<usize> for TestCluster {
    type Output = TestNode;

    fn index(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cluster_mesh_converges() {
        let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
        cluster[0].create_user("u1", "a@x.com").await;
        cluster[1].create_user("u2", "b@x.com").await;
        cluster[2].create_user("u3", "c@x.com").await;
        assert!(!cluster.converged().await);

        let reports = cluster.sync_mesh().await;
        assert_eq!(reports.len(), 3);
        assert!(cluster.converged().await);
        for node in cluster.nodes() {
            assert_eq!(node.store.list("users").await.unwrap().len(), 3);
        }
    }
}
