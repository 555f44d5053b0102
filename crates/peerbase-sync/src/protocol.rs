//! Replication engine.
//!
//! One call to [`SyncEngine::sync_with`] runs rounds with one peer until
//! neither side has changes left to send. A round:
//!
//! 1. Take the per-peer lock and tick the clock: `round_start`.
//! 2. Offer the changes since the peer's high-water mark, oldest first and
//!    at most `batch_size` of them.
//! 3. The responder merges the offer and answers with its own changes since
//!    its mark for us, batched the same way.
//! 4. Merge the answer. Only if every record on both sides was settled
//!    (no storage failure, nothing deferred), Commit.
//! 5. The responder advances its mark for us and replies Committed.
//! 6. Advance our mark for the peer to `round_start`, or to the newest
//!    timestamp offered when the batch was cut short.
//!
//! Any failure before step 6 leaves our mark where it was, so the next
//! round resends everything; merging is idempotent, so that is safe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use peerbase_core::{
    check_timestamp, ChangeSet, ConflictResolutionError, PeerId, Record, Schema, Timestamp,
};
use peerbase_store::{MergeOutcome, Store};

use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::messages::{limits, MergeSummary, SessionId, SyncErrorCode, SyncMessage, PROTOCOL_VERSION};
use crate::peer_state::HighWaterMarks;
use crate::transport::{MessageHandler, Transport};

/// Result of syncing with one peer.
///
/// Counts are summed over every round the call ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub peer: PeerId,
    /// Session of the last round.
    pub session: Option<SessionId>,
    /// Rounds run; more than one when either side had more than a batch.
    pub rounds: usize,
    /// Records offered to the peer.
    pub sent: usize,
    /// Records received in the peer's answers.
    pub received: usize,
    pub applied: usize,
    pub discarded: usize,
    pub rejected: usize,
    /// How the peer's merge of our offers went.
    pub remote: MergeSummary,
    /// Our mark for the peer after the last round. `None` when no round
    /// completed, in which case the stored mark is unchanged.
    pub high_water_mark: Option<Timestamp>,
    /// Whether sync completed successfully.
    pub success: bool,
    /// Error message if sync failed.
    pub error: Option<String>,
}

impl SyncReport {
    /// Report for a sync that failed before completing.
    pub fn failure(peer: &PeerId, error: &SyncError) -> Self {
        Self {
            peer: peer.clone(),
            session: None,
            rounds: 0,
            sent: 0,
            received: 0,
            applied: 0,
            discarded: 0,
            rejected: 0,
            remote: MergeSummary::default(),
            high_water_mark: None,
            success: false,
            error: Some(error.to_string()),
        }
    }

    /// Fold the report of the following round into this one.
    fn absorb(&mut self, next: SyncReport) {
        self.session = next.session;
        self.rounds += next.rounds;
        self.sent += next.sent;
        self.received += next.received;
        self.applied += next.applied;
        self.discarded += next.discarded;
        self.rejected += next.rejected;
        self.remote.applied += next.remote.applied;
        self.remote.discarded += next.remote.discarded;
        self.remote.rejected += next.remote.rejected;
        self.remote.deferred += next.remote.deferred;
        self.remote.failed += next.remote.failed;
        self.high_water_mark = next.high_water_mark;
    }
}

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Tables exchanged with peers. Records of other tables are rejected.
    pub tables: Vec<String>,
    /// Upper bound for a whole round.
    pub round_timeout: Duration,
    /// Upper bound for a single request and its reply.
    pub message_timeout: Duration,
    /// How far ahead of local wall time an incoming timestamp may be.
    pub max_clock_drift: Duration,
    /// Most records sent in one Offer or Answer.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            round_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(10),
            max_clock_drift: Duration::from_secs(600),
            batch_size: limits::DEFAULT_BATCH_SIZE,
        }
    }
}

impl SyncConfig {
    /// Default timeouts with the given tables.
    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Check the table list against the store schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.tables.is_empty() {
            return Err(SyncError::Config("no tables configured for sync".into()));
        }
        for (i, table) in self.tables.iter().enumerate() {
            if !schema.contains(table) {
                return Err(SyncError::Config(format!("table {} is not in the store schema", table)));
            }
            if self.tables[..i].contains(table) {
                return Err(SyncError::Config(format!("table {} listed twice", table)));
            }
        }
        if self.round_timeout.is_zero() || self.message_timeout.is_zero() {
            return Err(SyncError::Config("timeouts must be positive".into()));
        }
        if self.batch_size == 0 || self.batch_size > limits::MAX_RECORDS_PER_MESSAGE {
            return Err(SyncError::Config(format!(
                "batch size must be between 1 and {}",
                limits::MAX_RECORDS_PER_MESSAGE
            )));
        }
        Ok(())
    }

    fn syncs(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }

    fn drift_millis(&self) -> i64 {
        i64::try_from(self.max_clock_drift.as_millis()).unwrap_or(i64::MAX)
    }
}

/// A round the responder has answered but not yet seen committed.
struct PendingRound {
    /// Where the responder's mark for the initiator goes on Commit.
    mark: Timestamp,
    opened: Instant,
}

/// Changes selected for one Offer or Answer.
#[derive(Debug, Clone, Default)]
pub struct Outgoing {
    pub changes: ChangeSet,
    /// Set when the batch size cut the change set short. Every change up to
    /// and including this timestamp is in `changes`; none after it is.
    pub cut: Option<Timestamp>,
}

impl Outgoing {
    /// The mark the receiver may be credited with once this batch is
    /// confirmed.
    fn mark(&self, round_start: Timestamp) -> Timestamp {
        self.cut.unwrap_or(round_start)
    }
}

/// Replicates the configured tables with peers over a transport.
///
/// Created with [`SyncEngine::new`], which also registers the engine as the
/// transport's inbound handler, so the same engine initiates rounds and
/// answers them.
pub struct SyncEngine {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    marks: HighWaterMarks,
    events: EventBus,
    /// One lock per remote peer, held for the whole of an initiated round
    /// and while answering an Offer.
    locks: StdMutex<HashMap<PeerId, Arc<Mutex<()>>>>,
    pending: StdMutex<HashMap<(PeerId, SessionId), PendingRound>>,
}

impl SyncEngine {
    /// Create an engine and register it with the transport.
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        config.validate(store.schema())?;
        if transport.local_peer_id() != store.local_peer() {
            return Err(SyncError::Config(format!(
                "transport identity {} does not match store identity {}",
                transport.local_peer_id(),
                store.local_peer()
            )));
        }

        let engine = Arc::new(Self {
            marks: HighWaterMarks::new(store.clone(), events.clone()),
            store,
            transport,
            config,
            events,
            locks: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
        });
        engine.transport.register(engine.clone());
        Ok(engine)
    }

    pub fn local_peer(&self) -> &PeerId {
        self.store.local_peer()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn high_water_marks(&self) -> &HighWaterMarks {
        &self.marks
    }

    /// Sync with `peer`, running rounds until neither side holds back a
    /// batch.
    ///
    /// Fails with `SyncInProgress` if a round with that peer is already
    /// running on this node. A failed round leaves the high-water mark
    /// where the last completed round put it.
    pub async fn sync_with(&self, peer: &PeerId) -> Result<SyncReport> {
        if peer == self.local_peer() {
            return Err(SyncError::Config("cannot sync with self".into()));
        }
        let _guard = self.lock_peer(peer)?;

        debug!(%peer, "starting sync round");
        self.events.publish(SyncEvent::RoundStarted { peer: peer.clone() });

        let mut total: Option<SyncReport> = None;
        let result = loop {
            let round = match tokio::time::timeout(self.config.round_timeout, self.run_round(peer)).await {
                Ok(round) => round,
                Err(_) => Err(SyncError::Timeout(format!(
                    "round with {} exceeded {:?}",
                    peer, self.config.round_timeout
                ))),
            };
            let (report, more) = match round {
                Ok(round) => round,
                Err(e) => break Err(e),
            };
            let report = match total.take() {
                Some(mut total) => {
                    total.absorb(report);
                    total
                }
                None => report,
            };
            if !more {
                break Ok(report);
            }
            debug!(%peer, rounds = report.rounds, "batch limit reached, running another round");
            total = Some(report);
        };

        match &result {
            Ok(report) => {
                let high_water_mark = report.high_water_mark.unwrap_or_default();
                info!(
                    %peer,
                    rounds = report.rounds,
                    sent = report.sent,
                    received = report.received,
                    applied = report.applied,
                    rejected = report.rejected,
                    high_water_mark,
                    "sync round complete"
                );
                self.events.publish(SyncEvent::RoundCompleted {
                    peer: peer.clone(),
                    sent: report.sent,
                    received: report.received,
                    applied: report.applied,
                    high_water_mark,
                });
            }
            Err(e) => {
                warn!(%peer, error = %e, "sync round failed");
                self.events.publish(SyncEvent::RoundFailed {
                    peer: peer.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    /// One Offer/Answer/Commit exchange. Also returns whether either side
    /// cut its batch short.
    async fn run_round(&self, peer: &PeerId) -> Result<(SyncReport, bool)> {
        let round_start = self.store.clock().tick();
        let hwm = self.marks.get(peer).await?;
        let outgoing = self.collect_changes(peer, hwm).await?;
        let mark = outgoing.mark(round_start);
        let session = SessionId::random();
        let sent = outgoing.changes.len();

        debug!(%peer, %session, since = hwm, records = sent, cut = ?outgoing.cut, "sending offer");
        let offer = SyncMessage::Offer {
            session,
            protocol_version: PROTOCOL_VERSION,
            changes: outgoing.changes,
        };
        let (answer, remote, remote_more) = match self.request(peer, offer).await? {
            SyncMessage::Answer {
                session: s,
                changes,
                summary,
                more,
            } if s == session => (changes, summary, more),
            other => return Err(unexpected("Answer", other)),
        };

        let received = answer.len();
        let local = self.merge_changes(peer, &answer).await;
        if !local.is_complete() || remote.deferred > 0 {
            return Err(SyncError::MergeIncomplete {
                failed: local.failed,
                deferred: local.deferred + remote.deferred,
            });
        }

        match self.request(peer, SyncMessage::Commit { session }).await? {
            SyncMessage::Committed { session: s } if s == session => {}
            other => return Err(unexpected("Committed", other)),
        }

        self.marks.advance(peer, mark).await?;

        let report = SyncReport {
            peer: peer.clone(),
            session: Some(session),
            rounds: 1,
            sent,
            received,
            applied: local.applied,
            discarded: local.discarded,
            rejected: local.rejected,
            remote,
            high_water_mark: Some(mark),
            success: true,
            error: None,
        };
        Ok((report, outgoing.cut.is_some() || remote_more))
    }

    /// Send one request and check the reply against the message limits.
    async fn request(&self, peer: &PeerId, message: SyncMessage) -> Result<SyncMessage> {
        let kind = message.kind();
        let reply = tokio::time::timeout(self.config.message_timeout, self.transport.send(peer, message))
            .await
            .map_err(|_| SyncError::Timeout(format!("no reply from {} to {}", peer, kind)))??;

        reply
            .validate_limits()
            .map_err(|reason| SyncError::InvalidMessage(reason.into()))?;
        Ok(reply)
    }

    /// The oldest changes with `timestamp > since` that `peer` may be
    /// missing, across every configured table, up to `batch_size` of them.
    ///
    /// Versions written by `peer` itself are left out: the peer holds either
    /// that version or a newer one.
    pub async fn collect_changes(&self, peer: &PeerId, since: Timestamp) -> Result<Outgoing> {
        let mut records = Vec::new();
        for table in &self.config.tables {
            let mut rows = self.store.changes_since(table, since).await?;
            rows.retain(|r| r.origin != *peer);
            records.append(&mut rows);
        }
        let cut = cut_batch(&mut records, self.config.batch_size);
        Ok(Outgoing {
            changes: records.into_iter().collect(),
            cut,
        })
    }

    /// Apply a received change set record by record.
    ///
    /// Never stops early: malformed records are rejected and storage
    /// failures are counted, and the caller decides what the counts mean.
    pub async fn merge_changes(&self, from: &PeerId, changes: &ChangeSet) -> MergeSummary {
        let now = self.store.clock().wall_millis();
        let drift = self.config.drift_millis();
        let mut summary = MergeSummary::default();

        for record in changes.records() {
            if !self.config.syncs(&record.table) {
                self.reject(from, record, format!("table {} is not replicated", record.table));
                summary.rejected += 1;
                continue;
            }
            match check_timestamp(record, now, drift) {
                Ok(()) => {}
                Err(ConflictResolutionError::FutureTimestamp { horizon, .. }) => {
                    warn!(
                        peer = %from,
                        table = %record.table,
                        id = %record.id,
                        timestamp = record.timestamp,
                        horizon,
                        "deferred record from the future"
                    );
                    self.events.publish(SyncEvent::RecordDeferred {
                        peer: from.clone(),
                        table: record.table.clone(),
                        id: record.id.clone(),
                        timestamp: record.timestamp,
                    });
                    summary.deferred += 1;
                    continue;
                }
                Err(e) => {
                    self.reject(from, record, e.to_string());
                    summary.rejected += 1;
                    continue;
                }
            }

            match self.store.apply_merged(record).await {
                Ok(MergeOutcome::Applied) => summary.applied += 1,
                Ok(MergeOutcome::Discarded) => summary.discarded += 1,
                Err(e) if e.is_rejection() => {
                    self.reject(from, record, e.to_string());
                    summary.rejected += 1;
                }
                Err(e) => {
                    error!(peer = %from, table = %record.table, id = %record.id, error = %e, "failed to apply record");
                    self.events.publish(SyncEvent::RecordFailed {
                        peer: from.clone(),
                        table: record.table.clone(),
                        id: record.id.clone(),
                        error: e.to_string(),
                    });
                    summary.failed += 1;
                }
            }
        }

        debug!(
            peer = %from,
            applied = summary.applied,
            discarded = summary.discarded,
            rejected = summary.rejected,
            deferred = summary.deferred,
            failed = summary.failed,
            "merged change set"
        );
        summary
    }

    fn reject(&self, from: &PeerId, record: &Record, reason: String) {
        warn!(peer = %from, table = %record.table, id = %record.id, %reason, "rejected record");
        self.events.publish(SyncEvent::RecordRejected {
            peer: from.clone(),
            table: record.table.clone(),
            id: record.id.clone(),
            reason,
        });
    }

    fn lock_peer(&self, peer: &PeerId) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer.clone())
            .or_default()
            .clone();
        lock.try_lock_owned()
            .map_err(|_| SyncError::SyncInProgress(peer.clone()))
    }

    async fn on_offer(
        &self,
        from: &PeerId,
        session: SessionId,
        protocol_version: u8,
        changes: ChangeSet,
    ) -> Result<SyncMessage> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::VersionMismatch {
                local: PROTOCOL_VERSION,
                peer: protocol_version,
            });
        }
        let _guard = self.lock_peer(from)?;

        let round_start = self.store.clock().tick();
        let hwm = self.marks.get(from).await?;
        // Collected before merging so the offer is not echoed back.
        let outgoing = self.collect_changes(from, hwm).await?;
        let mark = outgoing.mark(round_start);

        // Deferred records still get an Answer: the initiator sees them in
        // the summary and does not Commit.
        let summary = self.merge_changes(from, &changes).await;
        if summary.failed > 0 {
            return Err(SyncError::MergeIncomplete {
                failed: summary.failed,
                deferred: summary.deferred,
            });
        }

        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let ttl = self.config.round_timeout;
            pending.retain(|_, round| round.opened.elapsed() <= ttl);
            pending.insert(
                (from.clone(), session),
                PendingRound {
                    mark,
                    opened: Instant::now(),
                },
            );
        }

        debug!(peer = %from, %session, records = outgoing.changes.len(), cut = ?outgoing.cut, "answering offer");
        Ok(SyncMessage::Answer {
            session,
            changes: outgoing.changes,
            summary,
            more: outgoing.cut.is_some(),
        })
    }

    async fn on_commit(&self, from: &PeerId, session: SessionId) -> Result<SyncMessage> {
        let round = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(from.clone(), session));

        let Some(round) = round else {
            return Ok(SyncMessage::error(
                SyncErrorCode::UnknownSession,
                format!("no pending round {} with {}", session, from),
            ));
        };

        self.marks.advance(from, round.mark).await?;
        Ok(SyncMessage::Committed { session })
    }
}

/// Keep the oldest `limit` records, without splitting a timestamp between
/// two batches. Returns the newest timestamp kept if anything was dropped.
///
/// A single timestamp shared by more than `limit` records is kept whole.
fn cut_batch(records: &mut Vec<Record>, limit: usize) -> Option<Timestamp> {
    if records.len() <= limit {
        return None;
    }
    records.sort_by_key(|r| r.timestamp);
    let first_left_out = records[limit].timestamp;
    let mut end = records.partition_point(|r| r.timestamp < first_left_out);
    if end == 0 {
        end = records.partition_point(|r| r.timestamp <= first_left_out);
    }
    if end == records.len() {
        return None;
    }
    records.truncate(end);
    records.last().map(|r| r.timestamp)
}

fn unexpected(expected: &str, reply: SyncMessage) -> SyncError {
    match reply {
        SyncMessage::Error { code, message } => SyncError::PeerError { code, message },
        other => SyncError::InvalidMessage(format!("expected {}, got {}", expected, other.kind())),
    }
}

#[async_trait]
impl MessageHandler for SyncEngine {
    async fn handle(&self, from: &PeerId, message: SyncMessage) -> SyncMessage {
        if let Err(reason) = message.validate_limits() {
            return SyncError::InvalidMessage(reason.into()).to_message();
        }

        let result = match message {
            SyncMessage::Offer {
                session,
                protocol_version,
                changes,
            } => self.on_offer(from, session, protocol_version, changes).await,
            SyncMessage::Commit { session } => self.on_commit(from, session).await,
            other => Err(SyncError::InvalidMessage(format!(
                "unexpected {} request",
                other.kind()
            ))),
        };

        result.unwrap_or_else(|e| {
            warn!(peer = %from, error = %e, "refusing request");
            e.to_message()
        })
    }
}
