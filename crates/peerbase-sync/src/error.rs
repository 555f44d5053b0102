//! Error types for the sync module.

use thiserror::Error;

use peerbase_core::{CodecError, PeerId};
use peerbase_store::StoreError;

use crate::messages::{SyncErrorCode, SyncMessage};

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level error: the peer could not be reached or the reply was
    /// lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Peer sent an error message.
    #[error("peer error ({code:?}): {message}")]
    PeerError { code: SyncErrorCode, message: String },

    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u8, peer: u8 },

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A round with this peer is already running.
    #[error("sync with {0} already in progress")]
    SyncInProgress(PeerId),

    /// Some received records could not be written, or were held back
    /// because their timestamps are ahead of the receiving clock.
    #[error("merge incomplete: {failed} record(s) failed to apply, {deferred} deferred")]
    MergeIncomplete { failed: usize, deferred: usize },

    /// Engine configuration does not match the store.
    #[error("configuration error: {0}")]
    Config(String),

    /// Message encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl SyncError {
    /// The error reply a responder sends for this failure.
    pub fn to_message(&self) -> SyncMessage {
        let code = match self {
            SyncError::VersionMismatch { .. } => SyncErrorCode::VersionMismatch,
            SyncError::InvalidMessage(_) | SyncError::Codec(_) => SyncErrorCode::InvalidMessage,
            SyncError::SyncInProgress(_) => SyncErrorCode::Busy,
            SyncError::Store(_) | SyncError::MergeIncomplete { .. } => SyncErrorCode::StorageFailure,
            _ => SyncErrorCode::InternalError,
        };
        SyncMessage::error(code, self.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
