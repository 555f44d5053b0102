//! Behaviour every `Store` implementation must share.

use peerbase_core::{fields, FieldType, FieldValue, Fields, ManualClock, PeerId, Record, Schema, TableSchema};

use crate::error::StoreError;
use crate::traits::{HwmUpdate, MergeOutcome, Store};

pub(crate) fn schema() -> Schema {
    Schema::new()
        .with_table(
            TableSchema::new("users")
                .required("email", FieldType::Text)
                .field("age", FieldType::Integer)
                .field("score", FieldType::Real)
                .field("active", FieldType::Boolean)
                .field("avatar", FieldType::Bytes),
        )
        .and_then(|s| s.with_table(TableSchema::new("items").field("name", FieldType::Text)))
        .unwrap()
}

fn email(value: &str) -> Fields {
    fields([("email", FieldValue::from(value))])
}

pub(crate) async fn run_all(store: &dyn Store, wall: &ManualClock) {
    create_read_update(store).await;
    delete_is_idempotent(store).await;
    create_revives_tombstone(store).await;
    list_and_changes_since(store, wall).await;
    apply_merged_last_write_wins(store).await;
    apply_merged_tombstones(store).await;
    apply_merged_rejects_bad_records(store).await;
    non_finite_reals(store).await;
    high_water_marks(store).await;
    unknown_tables(store).await;
}

async fn create_read_update(store: &dyn Store) {
    let created = store.create("users", "crud", email("a@x.com")).await.unwrap();
    assert_eq!(created.origin, *store.local_peer());
    assert!(!created.deleted);

    assert!(matches!(
        store.create("users", "crud", email("b@x.com")).await,
        Err(StoreError::DuplicateKey { .. })
    ));

    let updated = store
        .update(
            "users",
            "crud",
            fields([("age", 30i64.into()), ("email", "b@x.com".into())]),
        )
        .await
        .unwrap();
    assert!(updated.timestamp > created.timestamp);
    assert_eq!(updated.get("age"), Some(&FieldValue::Integer(30)));

    let cleared = store
        .update("users", "crud", fields([("age", FieldValue::Null)]))
        .await
        .unwrap();
    assert!(cleared.get("age").is_none());
    assert_eq!(store.read("users", "crud").await.unwrap(), Some(cleared));

    assert!(matches!(
        store.update("users", "missing", email("x")).await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        store.create("users", "no-email", fields([("age", 1i64.into())])).await,
        Err(StoreError::Validation(_))
    ));
    assert!(store.read("users", "missing").await.unwrap().is_none());
}

async fn delete_is_idempotent(store: &dyn Store) {
    let created = store.create("users", "del", email("a@x.com")).await.unwrap();
    let tomb = store.delete("users", "del").await.unwrap();
    assert!(tomb.deleted);
    assert!(tomb.fields.is_empty());
    assert!(tomb.timestamp > created.timestamp);
    assert!(store.read("users", "del").await.unwrap().is_none());

    let again = store.delete("users", "del").await.unwrap();
    assert_eq!(again, tomb);

    // Deleting an unknown id still leaves a tombstone to propagate.
    let ghost = store.delete("users", "ghost").await.unwrap();
    assert!(ghost.deleted);
    let changes = store.changes_since("users", ghost.timestamp - 1).await.unwrap();
    assert!(changes.iter().any(|r| r.id == "ghost" && r.deleted));

    assert!(matches!(
        store.update("users", "del", email("b@x.com")).await,
        Err(StoreError::NotFound { .. })
    ));
}

async fn create_revives_tombstone(store: &dyn Store) {
    store.create("users", "revive", email("a@x.com")).await.unwrap();
    let tomb = store.delete("users", "revive").await.unwrap();
    let revived = store.create("users", "revive", email("c@x.com")).await.unwrap();
    assert!(revived.timestamp > tomb.timestamp);
    assert_eq!(
        store.read("users", "revive").await.unwrap().unwrap().get("email"),
        Some(&FieldValue::from("c@x.com"))
    );
}

async fn list_and_changes_since(store: &dyn Store, wall: &ManualClock) {
    wall.advance(10_000);
    let first = store.create("items", "b", fields([("name", "bee".into())])).await.unwrap();
    store.create("items", "a", fields([("name", "ant".into())])).await.unwrap();
    store.create("items", "c", fields([("name", "cat".into())])).await.unwrap();
    store.delete("items", "c").await.unwrap();

    let ids: Vec<_> = store
        .list("items")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    let all = store.changes_since("items", 0).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|r| r.id == "c" && r.deleted));

    let after_first = store.changes_since("items", first.timestamp).await.unwrap();
    assert_eq!(after_first.len(), 2);
    assert!(after_first.iter().all(|r| r.timestamp > first.timestamp));
}

async fn apply_merged_last_write_wins(store: &dyn Store) {
    let p1 = PeerId::new("p1");
    let at = |ts, mail: &str| Record::live("users", "lww", email(mail), ts, p1.clone());

    assert_eq!(store.apply_merged(&at(100, "v100")).await.unwrap(), MergeOutcome::Applied);
    assert_eq!(store.apply_merged(&at(50, "v50")).await.unwrap(), MergeOutcome::Discarded);
    assert_eq!(store.apply_merged(&at(150, "v150")).await.unwrap(), MergeOutcome::Applied);
    assert_eq!(store.apply_merged(&at(150, "v150")).await.unwrap(), MergeOutcome::Discarded);

    let stored = store.read("users", "lww").await.unwrap().unwrap();
    assert_eq!(stored.get("email"), Some(&FieldValue::from("v150")));
    assert_eq!(stored.timestamp, 150);
    assert_eq!(stored.origin, p1);

    // Equal timestamp: the higher origin wins.
    let tie = Record::live("users", "lww", email("tie"), 150, PeerId::new("p2"));
    assert_eq!(store.apply_merged(&tie).await.unwrap(), MergeOutcome::Applied);
    let tie_low = Record::live("users", "lww", email("low"), 150, PeerId::new("p0"));
    assert_eq!(store.apply_merged(&tie_low).await.unwrap(), MergeOutcome::Discarded);

    // Replicated timestamps lift the local clock.
    let remote = Record::live("users", "far", email("far"), 9_000_000, PeerId::new("p9"));
    store.apply_merged(&remote).await.unwrap();
    let local = store.update("users", "far", email("near")).await.unwrap();
    assert!(local.timestamp > 9_000_000);
}

async fn apply_merged_tombstones(store: &dyn Store) {
    let p = PeerId::new("p1");
    let live = Record::live("users", "tomb", email("a@x.com"), 20_000_000, p.clone());
    store.apply_merged(&live).await.unwrap();

    let old_tomb = Record::tombstone("users", "tomb", 19_000_000, p.clone());
    assert_eq!(store.apply_merged(&old_tomb).await.unwrap(), MergeOutcome::Discarded);
    assert!(store.read("users", "tomb").await.unwrap().is_some());

    let tomb = Record::tombstone("users", "tomb", 20_000_001, p.clone());
    assert_eq!(store.apply_merged(&tomb).await.unwrap(), MergeOutcome::Applied);
    assert!(store.read("users", "tomb").await.unwrap().is_none());

    // An older live version cannot resurrect it.
    assert_eq!(store.apply_merged(&live).await.unwrap(), MergeOutcome::Discarded);
    assert!(store.read("users", "tomb").await.unwrap().is_none());

    // A tombstone for a key never seen is stored.
    let unseen = Record::tombstone("users", "unseen", 20_000_002, p);
    assert_eq!(store.apply_merged(&unseen).await.unwrap(), MergeOutcome::Applied);
}

async fn apply_merged_rejects_bad_records(store: &dyn Store) {
    let p = PeerId::new("p1");
    let unknown_field = Record::live("users", "bad", fields([("nick", "x".into())]), 10, p.clone());
    let err = store.apply_merged(&unknown_field).await.unwrap_err();
    assert!(err.is_rejection());

    let unknown_table = Record::tombstone("ghosts", "g", 10, p);
    let err = store.apply_merged(&unknown_table).await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownTable(_)));
}

async fn non_finite_reals(store: &dyn Store) {
    let with_score = |score: f64| {
        let mut f = email("r@x.com");
        f.insert("score".into(), FieldValue::Real(score));
        f
    };

    let err = store.create("users", "nan", with_score(f64::NAN)).await.unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(store.read("users", "nan").await.unwrap(), None);

    let kept = store.create("users", "finite", with_score(0.5)).await.unwrap();
    assert!(store
        .update("users", "finite", fields([("score", FieldValue::Real(f64::INFINITY))]))
        .await
        .unwrap_err()
        .is_rejection());
    assert_eq!(store.read("users", "finite").await.unwrap(), Some(kept));

    let incoming = Record::live("users", "inf", with_score(f64::NEG_INFINITY), 10, PeerId::new("p1"));
    assert!(store.apply_merged(&incoming).await.unwrap_err().is_rejection());
    assert_eq!(store.read("users", "inf").await.unwrap(), None);
}

async fn high_water_marks(store: &dyn Store) {
    let b = PeerId::new("node-b");
    let c = PeerId::new("node-c");
    assert_eq!(store.high_water_mark(&b).await.unwrap(), 0);

    assert_eq!(store.set_high_water_mark(&b, 500).await.unwrap(), HwmUpdate::Created);
    assert_eq!(store.set_high_water_mark(&b, 700).await.unwrap(), HwmUpdate::Advanced);
    assert_eq!(store.set_high_water_mark(&b, 700).await.unwrap(), HwmUpdate::Unchanged);
    assert_eq!(
        store.set_high_water_mark(&b, 600).await.unwrap(),
        HwmUpdate::Regressed { current: 700 }
    );
    assert_eq!(store.high_water_mark(&b).await.unwrap(), 700);

    store.set_high_water_mark(&c, 1).await.unwrap();
    let states = store.peer_states().await.unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].peer_id, b);
    assert_eq!(states[0].last_sync_timestamp, 700);
}

async fn unknown_tables(store: &dyn Store) {
    assert!(matches!(store.list("ghosts").await, Err(StoreError::UnknownTable(_))));
    assert!(matches!(
        store.changes_since("ghosts", 0).await,
        Err(StoreError::UnknownTable(_))
    ));
    assert!(matches!(
        store.create("ghosts", "g", Fields::new()).await,
        Err(StoreError::UnknownTable(_))
    ));
}
