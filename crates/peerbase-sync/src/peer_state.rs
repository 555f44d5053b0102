//! Per-peer high-water marks.

use std::sync::Arc;

use tracing::{debug, warn};

use peerbase_core::{PeerId, Timestamp};
use peerbase_store::{HwmUpdate, PeerSyncState, Store};

use crate::error::Result;
use crate::events::{EventBus, SyncEvent};

/// Reads and advances the persisted high-water mark of each remote peer.
///
/// The mark for a peer is the timestamp at which the last confirmed round
/// with it started: every local change at or below it has reached the peer.
/// Marks only move forward; an attempt to lower one is refused, logged and
/// published.
#[derive(Clone)]
pub struct HighWaterMarks {
    store: Arc<dyn Store>,
    events: EventBus,
}

impl HighWaterMarks {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// The mark for `peer`, 0 if no round with it has completed.
    pub async fn get(&self, peer: &PeerId) -> Result<Timestamp> {
        Ok(self.store.high_water_mark(peer).await?)
    }

    /// Move the mark for `peer` to `timestamp`.
    pub async fn advance(&self, peer: &PeerId, timestamp: Timestamp) -> Result<HwmUpdate> {
        let update = self.store.set_high_water_mark(peer, timestamp).await?;
        match update {
            HwmUpdate::Regressed { current } => {
                warn!(%peer, attempted = timestamp, current, "refusing to move high-water mark backwards");
                self.events.publish(SyncEvent::HighWaterMarkRegression {
                    peer: peer.clone(),
                    attempted: timestamp,
                    current,
                });
            }
            _ => debug!(%peer, high_water_mark = timestamp, ?update, "high-water mark updated"),
        }
        Ok(update)
    }

    /// Marks for every peer a round has completed with.
    pub async fn all(&self) -> Result<Vec<PeerSyncState>> {
        Ok(self.store.peer_states().await?)
    }
}
