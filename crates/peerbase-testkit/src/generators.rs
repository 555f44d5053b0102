//! Proptest generators for property-based testing.

use proptest::prelude::*;

use peerbase_core::{fields, FieldValue, PeerId, Record, Timestamp};
use peerbase_store::{Store, StoreError};

/// One of a small set of peer ids, so origins collide often.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    prop::sample::select(vec!["node-a", "node-b", "node-c"]).prop_map(PeerId::new)
}

/// One of a small set of record ids, so writes hit the same keys.
pub fn record_id() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["u1", "u2", "u3", "u4"]).prop_map(str::to_string)
}

/// A positive timestamp from a narrow range, so ties are common.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    1i64..=50
}

pub fn email() -> impl Strategy<Value = String> {
    "[a-z]{1,6}@x\\.com"
}

/// A `users` record version: live with an email and optional age, or a
/// tombstone.
pub fn user_record() -> impl Strategy<Value = Record> {
    (
        record_id(),
        email(),
        proptest::option::of(0i64..120),
        timestamp(),
        peer_id(),
        any::<bool>(),
    )
        .prop_map(|(id, email, age, ts, origin, deleted)| {
            if deleted {
                return Record::tombstone("users", id, ts, origin);
            }
            let mut f = fields([("email", FieldValue::from(email))]);
            if let Some(age) = age {
                f.insert("age".to_string(), FieldValue::Integer(age));
            }
            Record::live("users", id, f, ts, origin)
        })
}

/// A local mutation of the `users` table.
#[derive(Debug, Clone)]
pub enum UserOp {
    Create { id: String, email: String },
    Update { id: String, email: String },
    Delete { id: String },
}

pub fn user_op() -> impl Strategy<Value = UserOp> {
    prop_oneof![
        (record_id(), email()).prop_map(|(id, email)| UserOp::Create { id, email }),
        (record_id(), email()).prop_map(|(id, email)| UserOp::Update { id, email }),
        record_id().prop_map(|id| UserOp::Delete { id }),
    ]
}

/// Apply `op` to `store`. Creating a live id or updating a missing one is
/// skipped, as an application would after checking first.
pub async fn apply_user_op(store: &dyn Store, op: &UserOp) -> Result<(), StoreError> {
    let result = match op {
        UserOp::Create { id, email } => store
            .create("users", id, fields([("email", email.as_str().into())]))
            .await
            .map(drop),
        UserOp::Update { id, email } => store
            .update("users", id, fields([("email", email.as_str().into())]))
            .await
            .map(drop),
        UserOp::Delete { id } => store.delete("users", id).await.map(drop),
    };
    match result {
        Err(StoreError::DuplicateKey { .. }) | Err(StoreError::NotFound { .. }) => Ok(()),
        other => other,
    }
}
