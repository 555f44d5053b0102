//! End-to-end replication scenarios over the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use peerbase::core::{fields, PeerId, Record};
use peerbase::sync::limits::MAX_RECORDS_PER_MESSAGE;
use peerbase::store::{HwmUpdate, Store};
use peerbase::sync::{LinkFault, MemoryNetwork, SyncError, SyncErrorCode, SyncEvent};
use peerbase::{Node, NodeConfig, SyncConfig};
use peerbase_testkit::{test_sync_config, TestCluster, START_MILLIS};

fn user(id: &str, email: &str, timestamp: i64, origin: &PeerId) -> Record {
    Record::live("users", id, fields([("email", email.into())]), timestamp, origin.clone())
}

#[tokio::test]
async fn test_create_then_remote_update_initiated_by_writer() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    a.create_user("u1", "a@x.com").await;
    a.sync_with(b).await.unwrap();
    assert_eq!(b.email("u1").await.as_deref(), Some("a@x.com"));

    b.set_email("u1", "b@x.com").await;
    b.sync_with(a).await.unwrap();

    assert_eq!(a.email("u1").await.as_deref(), Some("b@x.com"));
    assert_eq!(b.email("u1").await.as_deref(), Some("b@x.com"));
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_create_then_remote_update_initiated_by_reader() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    a.create_user("u1", "a@x.com").await;
    b.sync_with(a).await.unwrap();
    assert_eq!(b.email("u1").await.as_deref(), Some("a@x.com"));

    b.set_email("u1", "b@x.com").await;
    let report = a.sync_with(b).await.unwrap();
    assert_eq!(report.applied, 1);

    assert_eq!(a.email("u1").await.as_deref(), Some("b@x.com"));
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_last_writer_wins() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    a.store.apply_merged(&user("u1", "t100", START_MILLIS + 100, &a.id)).await.unwrap();
    b.store.apply_merged(&user("u1", "t50", START_MILLIS + 50, &b.id)).await.unwrap();

    let report = a.sync_with(b).await.unwrap();
    assert_eq!(report.remote.applied, 1);
    assert_eq!(report.discarded, 1);
    assert_eq!(b.email("u1").await.as_deref(), Some("t100"));

    b.store.apply_merged(&user("u1", "t150", START_MILLIS + 150, &b.id)).await.unwrap();
    b.sync_with(a).await.unwrap();
    assert_eq!(a.email("u1").await.as_deref(), Some("t150"));
    assert!(cluster.converged().await);
}

/// Both replicas update `u1` while apart: a at START+300 with b@x.com,
/// b at START+250 with c@x.com.
async fn concurrent_offline_updates(cluster: &TestCluster) {
    let (a, b) = (&cluster[0], &cluster[1]);
    a.create_user("u1", "a@x.com").await;
    a.sync_with(b).await.unwrap();

    a.advance(300);
    b.advance(250);
    let later = a.set_email("u1", "b@x.com").await;
    let earlier = b.set_email("u1", "c@x.com").await;
    assert_eq!(later.timestamp, START_MILLIS + 300);
    assert_eq!(earlier.timestamp, START_MILLIS + 250);
}

#[tokio::test]
async fn test_concurrent_updates_later_writer_initiates() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    concurrent_offline_updates(&cluster).await;
    let (a, b) = (&cluster[0], &cluster[1]);

    let report = a.sync_with(b).await.unwrap();
    assert_eq!(report.discarded, 1);
    assert_eq!(report.remote.applied, 1);

    assert_eq!(a.email("u1").await.as_deref(), Some("b@x.com"));
    assert_eq!(b.email("u1").await.as_deref(), Some("b@x.com"));
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_concurrent_updates_earlier_writer_initiates() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    concurrent_offline_updates(&cluster).await;
    let (a, b) = (&cluster[0], &cluster[1]);

    let report = b.sync_with(a).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.remote.discarded, 1);

    assert_eq!(a.email("u1").await.as_deref(), Some("b@x.com"));
    assert_eq!(b.email("u1").await.as_deref(), Some("b@x.com"));
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_equal_timestamps_resolve_the_same_everywhere() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    // Same wall time, fresh clocks: both writes get the same timestamp.
    let ra = a.create_user("u1", "from-a@x.com").await;
    let rb = b.create_user("u1", "from-b@x.com").await;
    assert_eq!(ra.timestamp, rb.timestamp);

    a.sync_with(b).await.unwrap();

    assert_eq!(a.email("u1").await.as_deref(), Some("from-b@x.com"));
    assert_eq!(b.email("u1").await.as_deref(), Some("from-b@x.com"));
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_tombstone_propagates_and_blocks_resurrection() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    a.create_user("u1", "a@x.com").await;
    a.sync_with(b).await.unwrap();

    // b edits offline, then a deletes later in wall time.
    b.set_email("u1", "stale@x.com").await;
    a.advance(1_000);
    a.store.delete("users", "u1").await.unwrap();

    b.sync_with(a).await.unwrap();

    assert_eq!(a.email("u1").await, None);
    assert_eq!(b.email("u1").await, None);
    let tombstones = b.store.changes_since("users", 0).await.unwrap();
    assert_eq!(tombstones.len(), 1);
    assert!(tombstones[0].deleted);
    assert_eq!(tombstones[0].origin, a.id);

    // The stale copy does not come back on later rounds.
    a.sync_with(b).await.unwrap();
    assert_eq!(a.email("u1").await, None);
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_delete_of_unknown_id_still_propagates() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    b.create_user("u1", "b@x.com").await;
    a.advance(1_000);
    a.store.delete("users", "u1").await.unwrap();

    a.sync_with(b).await.unwrap();
    assert_eq!(b.email("u1").await, None);
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_second_round_is_incremental() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    a.create_user("u1", "a@x.com").await;
    b.create_user("u2", "b@x.com").await;

    let first = a.sync_with(b).await.unwrap();
    assert_eq!((first.sent, first.received), (1, 1));

    let second = a.sync_with(b).await.unwrap();
    assert_eq!((second.sent, second.received), (0, 0));

    a.set_email("u1", "a2@x.com").await;
    let third = b.sync_with(a).await.unwrap();
    assert_eq!((third.sent, third.received), (0, 1));
}

#[tokio::test]
async fn test_records_are_not_echoed_to_their_origin() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    // b's wall clock runs well ahead of a's.
    b.advance(10_000);
    b.create_user("u1", "b@x.com").await;

    let first = a.sync_with(b).await.unwrap();
    assert_eq!(first.received, 1);

    let second = a.sync_with(b).await.unwrap();
    assert_eq!((second.sent, second.received), (0, 0));
}

const TWENTY_MINUTES: i64 = 20 * 60 * 1_000;

#[tokio::test]
async fn test_future_record_is_held_until_the_clock_catches_up() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);
    let mut events = a.events.subscribe();

    // Further ahead than the allowed drift.
    b.advance(TWENTY_MINUTES);
    b.create_user("u1", "b@x.com").await;

    assert!(matches!(
        a.sync_with(b).await,
        Err(SyncError::MergeIncomplete { failed: 0, deferred: 1 })
    ));
    assert_eq!(a.email("u1").await, None);
    assert_eq!(a.high_water_mark(b).await, 0);
    assert_eq!(b.high_water_mark(a).await, 0);
    assert!(matches!(events.recv().await.unwrap(), SyncEvent::RoundStarted { .. }));
    assert!(matches!(events.recv().await.unwrap(), SyncEvent::RecordDeferred { .. }));

    a.advance(TWENTY_MINUTES + 10 * 60 * 1_000);
    let report = a.sync_with(b).await.unwrap();
    assert_eq!((report.received, report.applied), (1, 1));
    assert_eq!(a.email("u1").await.as_deref(), Some("b@x.com"));
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_future_offer_is_held_until_the_clock_catches_up() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    b.advance(TWENTY_MINUTES);
    b.create_user("u1", "b@x.com").await;

    // a answers, but b does not commit while a holds the record back.
    assert!(matches!(
        b.sync_with(a).await,
        Err(SyncError::MergeIncomplete { failed: 0, deferred: 1 })
    ));
    assert_eq!(a.email("u1").await, None);
    assert_eq!(b.high_water_mark(a).await, 0);
    assert_eq!(a.high_water_mark(b).await, 0);

    a.advance(TWENTY_MINUTES + 10 * 60 * 1_000);
    let report = b.sync_with(a).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.remote.applied, 1);
    assert_eq!(a.email("u1").await.as_deref(), Some("b@x.com"));
}

#[tokio::test]
async fn test_backlog_larger_than_one_message_syncs_in_batches() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    let total = MAX_RECORDS_PER_MESSAGE + 1;
    for i in 0..total {
        a.store
            .create("items", &format!("i{}", i), fields([("name", "x".into())]))
            .await
            .unwrap();
    }

    let report = a.sync_with(b).await.unwrap();
    assert_eq!(report.sent, total);
    assert!(report.rounds > 1);
    assert_eq!(b.store.list("items").await.unwrap().len(), total);
    assert_eq!(a.high_water_mark(b).await, report.high_water_mark.unwrap());

    let again = b.sync_with(a).await.unwrap();
    assert_eq!((again.sent, again.received), (0, 0));
    assert!(cluster.converged().await);
}

#[tokio::test]
async fn test_failed_round_leaves_marks_and_retry_delivers() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);
    let mut events = a.events.subscribe();

    a.create_user("u1", "a@x.com").await;

    cluster.network.set_link(&a.id, &b.id, LinkFault::Down);
    assert!(matches!(a.sync_with(b).await, Err(SyncError::Transport(_))));
    assert_eq!(a.high_water_mark(b).await, 0);
    assert_eq!(b.email("u1").await, None);

    assert!(matches!(events.recv().await.unwrap(), SyncEvent::RoundStarted { .. }));
    assert!(matches!(events.recv().await.unwrap(), SyncEvent::RoundFailed { .. }));

    // Replies lost: b merged the offer but never saw a Commit.
    cluster.network.set_link(&a.id, &b.id, LinkFault::DropReplies);
    assert!(a.sync_with(b).await.is_err());
    assert_eq!(a.high_water_mark(b).await, 0);
    assert_eq!(b.high_water_mark(a).await, 0);

    cluster.network.clear_faults();
    let report = a.sync_with(b).await.unwrap();
    assert_eq!(report.sent, 1);
    assert!(a.high_water_mark(b).await > 0);
    assert!(b.high_water_mark(a).await > 0);
    assert_eq!(b.email("u1").await.as_deref(), Some("a@x.com"));
}

#[tokio::test]
async fn test_slow_peer_times_out_without_advancing() {
    let config = SyncConfig {
        message_timeout: Duration::from_millis(50),
        ..test_sync_config()
    };
    let cluster = TestCluster::with_config(&["node-a", "node-b"], config);
    let (a, b) = (&cluster[0], &cluster[1]);
    a.create_user("u1", "a@x.com").await;

    cluster
        .network
        .set_link(&a.id, &b.id, LinkFault::Delay(Duration::from_millis(300)));
    assert!(matches!(a.sync_with(b).await, Err(SyncError::Timeout(_))));
    assert_eq!(a.high_water_mark(b).await, 0);

    cluster.network.clear_faults();
    a.sync_with(b).await.unwrap();
    assert_eq!(b.email("u1").await.as_deref(), Some("a@x.com"));
}

#[tokio::test]
async fn test_round_timeout_bounds_the_whole_exchange() {
    let config = SyncConfig {
        round_timeout: Duration::from_millis(100),
        message_timeout: Duration::from_secs(5),
        ..test_sync_config()
    };
    let cluster = TestCluster::with_config(&["node-a", "node-b"], config);
    let (a, b) = (&cluster[0], &cluster[1]);

    cluster
        .network
        .set_link(&a.id, &b.id, LinkFault::Delay(Duration::from_millis(400)));
    assert!(matches!(a.sync_with(b).await, Err(SyncError::Timeout(_))));
    assert_eq!(a.high_water_mark(b).await, 0);
}

#[tokio::test]
async fn test_one_round_per_peer_pair() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);
    cluster
        .network
        .set_link(&a.id, &b.id, LinkFault::Delay(Duration::from_millis(200)));

    let (first, second, reverse) = tokio::join!(
        a.sync_with(b),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            a.sync_with(b).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            b.sync_with(a).await
        },
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::SyncInProgress(_))));
    assert!(matches!(
        reverse,
        Err(SyncError::PeerError {
            code: SyncErrorCode::Busy,
            ..
        })
    ));
}

#[tokio::test]
async fn test_rounds_with_different_peers_run_concurrently() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    let (a, b, c) = (&cluster[0], &cluster[1], &cluster[2]);
    a.create_user("u1", "a@x.com").await;
    for peer in [b, c] {
        cluster
            .network
            .set_link(&a.id, &peer.id, LinkFault::Delay(Duration::from_millis(100)));
    }

    let (rb, rc) = tokio::join!(a.sync_with(b), a.sync_with(c));
    assert!(rb.is_ok() && rc.is_ok());
    assert_eq!(c.email("u1").await.as_deref(), Some("a@x.com"));
}

#[tokio::test]
async fn test_high_water_mark_never_moves_back() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);

    let report = a.sync_with(b).await.unwrap();
    let current = report.high_water_mark.unwrap();
    let mut events = a.events.subscribe();

    let marks = a.engine.high_water_marks();
    assert_eq!(
        marks.advance(&b.id, 1).await.unwrap(),
        HwmUpdate::Regressed { current }
    );
    assert_eq!(a.high_water_mark(b).await, current);
    assert_eq!(
        events.recv().await.unwrap(),
        SyncEvent::HighWaterMarkRegression {
            peer: b.id.clone(),
            attempted: 1,
            current,
        }
    );
}

#[tokio::test]
async fn test_storage_failure_blocks_commit() {
    let cluster = TestCluster::new(&["node-a", "node-b"]);
    let (a, b) = (&cluster[0], &cluster[1]);
    b.create_user("u2", "b@x.com").await;

    a.store.fail_writes(true);
    assert!(matches!(
        a.sync_with(b).await,
        Err(SyncError::MergeIncomplete { failed: 1, deferred: 0 })
    ));
    assert_eq!(a.high_water_mark(b).await, 0);
    assert_eq!(b.high_water_mark(a).await, 0);

    a.store.fail_writes(false);
    let report = a.sync_with(b).await.unwrap();
    assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn test_three_nodes_converge() {
    let cluster = TestCluster::new(&["node-a", "node-b", "node-c"]);
    cluster[0].create_user("u1", "a@x.com").await;
    cluster[1].create_user("u1", "b@x.com").await;
    cluster[2].create_user("u2", "c@x.com").await;
    cluster[2].advance(10);
    cluster[2].store.delete("users", "u1").await.unwrap();

    cluster.sync_mesh().await;
    assert!(cluster.converged().await);
    for node in cluster.nodes() {
        assert_eq!(node.email("u1").await, None);
        assert_eq!(node.email("u2").await.as_deref(), Some("c@x.com"));
    }
}

fn sqlite_config(path: &std::path::Path) -> NodeConfig {
    NodeConfig::from_toml_str(&format!(
        r#"
        [node]
        peer_id = "node-a"
        peers = ["node-b"]

        [storage]
        backend = "sqlite"
        path = "{}"

        [tables.users]
        email = {{ type = "text", required = true }}
        "#,
        path.display()
    ))
    .unwrap()
}

fn memory_config() -> NodeConfig {
    NodeConfig::from_toml_str(
        r#"
        [node]
        peer_id = "node-b"
        peers = ["node-a"]

        [tables.users]
        email = { type = "text", required = true }
        "#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_sqlite_node_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node-a.db");
    let network = MemoryNetwork::new();

    let b = Node::open(
        &memory_config(),
        Arc::new(network.create_transport(PeerId::new("node-b"))),
        None,
    )
    .unwrap();

    let (mark, created) = {
        let a = Node::open(
            &sqlite_config(&path),
            Arc::new(network.create_transport(PeerId::new("node-a"))),
            None,
        )
        .unwrap();
        let created = a
            .create("users", "u1", fields([("email", "a@x.com".into())]))
            .await
            .unwrap();
        let report = a.sync_with(b.local_peer()).await.unwrap();
        (report.high_water_mark.unwrap(), created)
    };

    let a = Node::open(
        &sqlite_config(&path),
        Arc::new(network.create_transport(PeerId::new("node-a"))),
        None,
    )
    .unwrap();

    let stored = a.read("users", "u1").await.unwrap().unwrap();
    assert_eq!(stored.timestamp, created.timestamp);
    assert_eq!(a.store().high_water_mark(b.local_peer()).await.unwrap(), mark);

    let report = a.sync_with(b.local_peer()).await.unwrap();
    assert_eq!((report.sent, report.received), (0, 0));

    // New local writes sort after everything written before the restart.
    let updated = a
        .update("users", "u1", fields([("email", "a2@x.com".into())]))
        .await
        .unwrap();
    assert!(updated.timestamp > mark);
    a.sync_with(b.local_peer()).await.unwrap();
    assert_eq!(
        b.read("users", "u1").await.unwrap().unwrap().get("email").and_then(|v| v.as_text()),
        Some("a2@x.com")
    );
}

#[tokio::test]
async fn test_scheduler_syncs_in_the_background() {
    let network = MemoryNetwork::new();
    let config = NodeConfig::from_toml_str(
        r#"
        [node]
        peer_id = "node-a"
        peers = ["node-b"]

        [scheduler]
        interval_ms = 20
        initial_backoff_ms = 20
        max_backoff_ms = 40

        [tables.users]
        email = { type = "text", required = true }
        "#,
    )
    .unwrap();
    let a = Node::open(&config, Arc::new(network.create_transport(config.peer_id())), None).unwrap();

    // node-b joins late; the first rounds fail and back off.
    let scheduler = a.start_scheduler().expect("scheduler is enabled by default");
    a.create("users", "u1", fields([("email", "a@x.com".into())]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let b = Node::open(
        &memory_config(),
        Arc::new(network.create_transport(PeerId::new("node-b"))),
        None,
    )
    .unwrap();

    let mut delivered = false;
    for _ in 0..100 {
        if b.read("users", "u1").await.unwrap().is_some() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.shutdown().await;
    assert!(delivered);
}
