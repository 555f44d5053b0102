//! Transport abstraction for the sync protocol.
//!
//! The transport layer handles message serialization and delivery.
//! Implementations may use WebSockets, HTTP, or any other channel that can
//! carry a request and its reply; discovery and encryption live there too.

use std::sync::Arc;

use async_trait::async_trait;

use peerbase_core::PeerId;

use crate::error::Result;
use crate::messages::SyncMessage;

/// Handles inbound requests. The sync engine registers itself as one.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce the reply to `message` from `from`.
    async fn handle(&self, from: &PeerId, message: SyncMessage) -> SyncMessage;
}

/// Transport trait for exchanging sync messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the local node's identity.
    fn local_peer_id(&self) -> &PeerId;

    /// Send a request to a peer and wait for its reply.
    ///
    /// Fails with `SyncError::Transport` if the peer cannot be reached or
    /// the reply is lost.
    async fn send(&self, peer: &PeerId, message: SyncMessage) -> Result<SyncMessage>;

    /// Install the handler for inbound requests, replacing any previous one.
    fn register(&self, handler: Arc<dyn MessageHandler>);
}

/// A simple in-memory transport for testing.
///
/// Every message is encoded to CBOR and decoded on the far side, so the
/// codec is exercised exactly as on a real wire. Links can be broken per
/// direction to simulate failures.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{PoisonError, RwLock, Weak};
    use std::time::Duration;

    use tracing::trace;

    use crate::error::SyncError;

    /// Injected failure on the link from one peer to another.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LinkFault {
        /// Requests never arrive.
        Down,
        /// Requests are handled but replies are lost.
        DropReplies,
        /// Requests arrive after the given delay.
        Delay(Duration),
    }

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        /// Inbound handler for each node.
        handlers: RwLock<HashMap<PeerId, Weak<dyn MessageHandler>>>,
        /// Faults keyed by `(from, to)`.
        faults: RwLock<HashMap<(PeerId, PeerId), LinkFault>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport connected to this network.
        pub fn create_transport(self: &Arc<Self>, peer_id: PeerId) -> MemoryTransport {
            MemoryTransport {
                peer_id,
                network: Arc::clone(self),
            }
        }

        /// Break the link from `from` to `to`. Other directions are unaffected.
        pub fn set_link(&self, from: &PeerId, to: &PeerId, fault: LinkFault) {
            self.faults
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((from.clone(), to.clone()), fault);
        }

        /// Restore the link from `from` to `to`.
        pub fn clear_link(&self, from: &PeerId, to: &PeerId) {
            self.faults
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&(from.clone(), to.clone()));
        }

        /// Restore every link.
        pub fn clear_faults(&self) {
            self.faults
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        fn fault(&self, from: &PeerId, to: &PeerId) -> Option<LinkFault> {
            self.faults
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(from.clone(), to.clone()))
                .copied()
        }

        fn handler(&self, peer: &PeerId) -> Option<Arc<dyn MessageHandler>> {
            self.handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(peer)
                .and_then(Weak::upgrade)
        }

        async fn deliver(
            &self,
            from: &PeerId,
            to: &PeerId,
            message: SyncMessage,
        ) -> Result<SyncMessage> {
            let request = message.encode()?;

            match self.fault(from, to) {
                Some(LinkFault::Down) => {
                    return Err(SyncError::Transport(format!("link {} -> {} is down", from, to)));
                }
                Some(LinkFault::Delay(delay)) => tokio::time::sleep(delay).await,
                _ => {}
            }

            let handler = self
                .handler(to)
                .ok_or_else(|| SyncError::Transport(format!("peer not found: {}", to)))?;

            trace!(%from, %to, bytes = request.len(), "delivering request");
            let reply = handler.handle(from, SyncMessage::decode(&request)?).await;
            let reply = reply.encode()?;

            if self.fault(from, to) == Some(LinkFault::DropReplies) {
                return Err(SyncError::Transport(format!("reply from {} lost", to)));
            }

            Ok(SyncMessage::decode(&reply)?)
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        peer_id: PeerId,
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn local_peer_id(&self) -> &PeerId {
            &self.peer_id
        }

        async fn send(&self, peer: &PeerId, message: SyncMessage) -> Result<SyncMessage> {
            self.network.deliver(&self.peer_id, peer, message).await
        }

        fn register(&self, handler: Arc<dyn MessageHandler>) {
            self.network
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(self.peer_id.clone(), Arc::downgrade(&handler));
        }
    }
}
