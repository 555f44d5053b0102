//! Sync protocol message types.
//!
//! These messages are exchanged between two nodes during one replication
//! round. Every message is a request or a reply; the transport pairs them.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use peerbase_core::{from_cbor, to_cbor, ChangeSet, CodecError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message size limits.
pub mod limits {
    /// Max records carried by one Offer or Answer.
    pub const MAX_RECORDS_PER_MESSAGE: usize = 100_000;
    /// Records per Offer or Answer unless configured otherwise.
    pub const DEFAULT_BATCH_SIZE: usize = 10_000;
    /// Max length of an error description.
    pub const MAX_ERROR_MESSAGE_LEN: usize = 4096;
}

/// Identifies one replication round between two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Generate a random session ID.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-record outcome counts of merging one change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    /// Incoming version won and was written.
    pub applied: usize,
    /// Local version was equal or newer.
    pub discarded: usize,
    /// Malformed record, skipped for good.
    pub rejected: usize,
    /// Timestamp too far ahead of the receiver's clock. Held back until the
    /// clocks agree, so the sender's mark must not pass it.
    #[serde(default)]
    pub deferred: usize,
    /// Storage failure while writing the record.
    pub failed: usize,
}

impl MergeSummary {
    /// Records looked at.
    pub fn total(&self) -> usize {
        self.applied + self.discarded + self.rejected + self.deferred + self.failed
    }

    /// True when every record was settled: nothing failed and nothing has
    /// to be offered again later.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.deferred == 0
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Initiator's changes since its high-water mark for the responder.
    Offer {
        session: SessionId,
        /// Protocol version for compatibility checking.
        protocol_version: u8,
        changes: ChangeSet,
    },

    /// Responder's changes since its high-water mark for the initiator,
    /// sent after merging the offer.
    Answer {
        session: SessionId,
        changes: ChangeSet,
        /// How the responder's merge of the offer went.
        summary: MergeSummary,
        /// The responder held back changes to stay under the batch size.
        #[serde(default)]
        more: bool,
    },

    /// The initiator merged the answer; the responder may advance its mark.
    Commit { session: SessionId },

    /// The responder advanced its mark; the initiator may advance its own.
    Committed { session: SessionId },

    /// Error condition.
    Error {
        /// Error code for programmatic handling.
        code: SyncErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl SyncMessage {
    /// Build an error reply, truncating long descriptions.
    pub fn error(code: SyncErrorCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > limits::MAX_ERROR_MESSAGE_LEN {
            let mut end = limits::MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        SyncMessage::Error { code, message }
    }

    /// Short name of the message variant, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Offer { .. } => "Offer",
            SyncMessage::Answer { .. } => "Answer",
            SyncMessage::Commit { .. } => "Commit",
            SyncMessage::Committed { .. } => "Committed",
            SyncMessage::Error { .. } => "Error",
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> Result<(), &'static str> {
        match self {
            SyncMessage::Offer { changes, .. } | SyncMessage::Answer { changes, .. } => {
                if changes.len() > limits::MAX_RECORDS_PER_MESSAGE {
                    return Err("too many records");
                }
                if changes
                    .iter()
                    .any(|(table, records)| records.iter().any(|r| r.table != table))
                {
                    return Err("record filed under the wrong table");
                }
            }
            SyncMessage::Error { message, .. } => {
                if message.len() > limits::MAX_ERROR_MESSAGE_LEN {
                    return Err("error message too long");
                }
            }
            SyncMessage::Commit { .. } | SyncMessage::Committed { .. } => {}
        }
        Ok(())
    }

    /// Encode to CBOR bytes for the wire.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        to_cbor(self).map(Bytes::from)
    }

    /// Decode from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_cbor(bytes)
    }
}

/// Error codes for sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum SyncErrorCode {
    /// Unknown/unspecified error.
    Unknown = 0,
    /// Protocol version mismatch.
    VersionMismatch = 1,
    /// Invalid message format or content.
    InvalidMessage = 2,
    /// A round with this peer is already running.
    Busy = 3,
    /// The responder could not write every received record.
    StorageFailure = 4,
    /// Commit for a round the responder does not know.
    UnknownSession = 5,
    /// Internal error on peer.
    InternalError = 6,
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerbase_core::{PeerId, Record};

    fn offer(changes: ChangeSet) -> SyncMessage {
        SyncMessage::Offer {
            session: SessionId(7),
            protocol_version: PROTOCOL_VERSION,
            changes,
        }
    }

    #[test]
    fn test_codec_preserves_offer() {
        let changes: ChangeSet = vec![Record::tombstone("users", "u1", 10, PeerId::new("a"))]
            .into_iter()
            .collect();
        let msg = offer(changes);
        let bytes = msg.encode().unwrap();
        assert_eq!(SyncMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SyncMessage::decode(b"not cbor at all").is_err());
    }

    #[test]
    fn test_message_limits_valid() {
        assert!(offer(ChangeSet::new()).validate_limits().is_ok());
        assert!(SyncMessage::Commit { session: SessionId(1) }.validate_limits().is_ok());
    }

    #[test]
    fn test_message_limits_misfiled_record() {
        let mut changes = ChangeSet::new();
        changes.extend_table(
            "items",
            vec![Record::tombstone("users", "u1", 10, PeerId::new("a"))],
        );
        assert!(offer(changes).validate_limits().is_err());
    }

    #[test]
    fn test_error_message_truncated() {
        let msg = SyncMessage::error(SyncErrorCode::InternalError, "é".repeat(5000));
        assert!(msg.validate_limits().is_ok());
    }

    #[test]
    fn test_merge_summary_totals() {
        let summary = MergeSummary {
            applied: 2,
            discarded: 1,
            rejected: 1,
            deferred: 0,
            failed: 0,
        };
        assert_eq!(summary.total(), 4);
        assert!(summary.is_complete());
    }

    #[test]
    fn test_deferred_records_leave_merge_incomplete() {
        let summary = MergeSummary {
            applied: 3,
            deferred: 1,
            ..MergeSummary::default()
        };
        assert_eq!(summary.total(), 4);
        assert!(!summary.is_complete());
    }
}
