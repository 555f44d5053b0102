//! Convergence verification.
//!
//! After syncing, nodes can verify they have converged to the same state
//! by computing deterministic table digests.

use peerbase_core::{canonical_record_bytes, Digest};
use peerbase_store::Store;

use crate::error::Result;

/// Compute a deterministic digest of one table.
///
/// Every record, live and tombstoned, contributes its canonical bytes in id
/// order. Two stores agree on the digest iff they hold the same versions
/// of the same records.
///
/// Algorithm:
/// 1. Get all records of the table, sorted by id
/// 2. Hash: H = Blake3(domain || table || len(r1) || r1 || len(r2) || r2 ...)
/// 3. Return final H
pub async fn table_digest(store: &dyn Store, table: &str) -> Result<Digest> {
    let mut records = store.changes_since(table, i64::MIN).await?;
    records.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"peerbase-table-v1:");
    hasher.update(table.as_bytes());

    for record in &records {
        let bytes = canonical_record_bytes(record);
        hasher.update(&(bytes.len() as u64).to_be_bytes());
        hasher.update(&bytes);
    }

    Ok(Digest(*hasher.finalize().as_bytes()))
}

/// Result of convergence verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both stores have identical state for every compared table.
    Converged,
    /// The listed tables differ (more sync rounds may be needed).
    Diverged { tables: Vec<String> },
}

impl ConvergenceResult {
    /// Check if the stores have converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// Compare two stores table by table.
pub async fn verify_convergence(
    local: &dyn Store,
    remote: &dyn Store,
    tables: &[String],
) -> Result<ConvergenceResult> {
    let mut diverged = Vec::new();

    for table in tables {
        if table_digest(local, table).await? != table_digest(remote, table).await? {
            diverged.push(table.clone());
        }
    }

    if diverged.is_empty() {
        Ok(ConvergenceResult::Converged)
    } else {
        Ok(ConvergenceResult::Diverged { tables: diverged })
    }
}
