//! Synchronization coordinator
//!
//! Runs a full cycle against the remote store: health gate, pull (ordered
//! batch query, hydration, sequential merge), push (lazy clock record
//! creation, stale-vector detection, batch upload, compare-and-swap clock
//! save with rollback), progress reporting, and jittered retry
//! notifications. Cycles on one pairing are strictly serialized by a
//! mutex-guarded phase flag released on every exit path.

mod progress;

pub use progress::SyncProgress;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::clock::{ReplicaId, VectorClock};
use crate::entity::VersionedEntity;
use crate::remote::{BatchEntity, RemoteError, RemoteStore, RevisionBatch};
use crate::store::{LocalStore, ResolvedBatch, StoreError};

/// Errors surfaced to the caller of [`SyncCoordinator::synchronize`]
#[derive(Error, Debug)]
pub enum SyncError {
    /// A cycle is already running on this pairing; nothing was started
    #[error("sync already in progress")]
    AlreadyInProgress,

    /// The remote failed its health check or could not be reached
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Another writer advanced the remote vector mid-cycle; retry later
    #[error("stale vector: remote advanced during the cycle")]
    StaleVector,

    #[error(transparent)]
    Remote(RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether the caller may simply reschedule the cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::AlreadyInProgress
                | SyncError::RemoteUnavailable(_)
                | SyncError::StaleVector
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unavailable(msg) => SyncError::RemoteUnavailable(msg),
            RemoteError::VectorChanged { .. } => SyncError::StaleVector,
            other => SyncError::Remote(other),
        }
    }
}

/// Tuning knobs for retry and wakeup scheduling.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Lower bound of the randomized retry delay.
    pub retry_jitter_min: Duration,
    /// Upper bound of the randomized retry delay.
    pub retry_jitter_max: Duration,
    /// How many times a deferred wakeup re-checks a busy coordinator
    /// before giving up.
    pub max_deferred_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_jitter_min: Duration::from_millis(100),
            retry_jitter_max: Duration::from_millis(1000),
            max_deferred_attempts: 5,
        }
    }
}

/// Statistics for one completed cycle
#[derive(Clone, Debug, Default)]
pub struct SyncReport {
    pub pulled_batches: usize,
    pub merged_entities: usize,
    pub rejected_entities: usize,
    pub conflicts_resolved: usize,
    pub pushed_entities: usize,
    /// The replica's knowledge after the cycle
    pub vector: VectorClock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncPhase {
    Idle,
    Pulling,
    Pushing,
}

/// Orchestrates synchronization cycles for one replica pairing.
pub struct SyncCoordinator<R, L> {
    replica_id: ReplicaId,
    remote: Arc<R>,
    local: Arc<L>,
    /// Guards the check-then-set of the cycle flag; suspension points only
    /// occur while the flag is held set
    phase: Mutex<SyncPhase>,
    /// This replica's causal knowledge, merged from every pull and push
    knowledge: Mutex<VectorClock>,
    progress_tx: broadcast::Sender<SyncProgress>,
    config: SyncConfig,
}

impl<R, L> SyncCoordinator<R, L>
where
    R: RemoteStore,
    L: LocalStore,
{
    pub fn new(replica_id: ReplicaId, remote: Arc<R>, local: Arc<L>) -> Self {
        Self::with_config(replica_id, remote, local, SyncConfig::default())
    }

    pub fn with_config(
        replica_id: ReplicaId,
        remote: Arc<R>,
        local: Arc<L>,
        config: SyncConfig,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(64);
        Self {
            replica_id,
            remote,
            local,
            phase: Mutex::new(SyncPhase::Idle),
            knowledge: Mutex::new(VectorClock::for_replica(replica_id)),
            progress_tx,
            config,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Subscribe to progress events for subsequent cycles
    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// This replica's current causal knowledge
    pub async fn knowledge(&self) -> VectorClock {
        self.knowledge.lock().await.clone()
    }

    /// Run one full synchronization cycle.
    ///
    /// Returns [`SyncError::AlreadyInProgress`] without touching the network
    /// if a cycle is running. The phase flag is released on every exit
    /// path, success or not, so a failed cycle never wedges the
    /// coordinator.
    pub async fn synchronize(&self) -> Result<SyncReport, SyncError> {
        {
            let mut phase = self.phase.lock().await;
            if *phase != SyncPhase::Idle {
                return Err(SyncError::AlreadyInProgress);
            }
            *phase = SyncPhase::Pulling;
        }

        log::info!("replica {}: starting sync cycle", self.replica_id);
        self.emit(SyncProgress::Started);

        let result = self.run_cycle().await;

        *self.phase.lock().await = SyncPhase::Idle;
        match &result {
            Ok(report) => {
                log::info!(
                    "replica {}: sync complete ({} batches pulled, {} entities pushed)",
                    self.replica_id,
                    report.pulled_batches,
                    report.pushed_entities
                );
                self.emit(SyncProgress::Completed);
            }
            Err(e) => {
                log::warn!("replica {}: sync failed: {}", self.replica_id, e);
                self.emit(SyncProgress::Failed {
                    retryable: e.is_retryable(),
                });
            }
        }
        result
    }

    /// React to a remote-changed wakeup.
    ///
    /// Starts a cycle if the coordinator is idle; otherwise defers with a
    /// short randomized delay and re-checks, up to the configured attempt
    /// bound, so a wakeup arriving mid-cycle is never dropped.
    pub fn notify_remote_changed(self: &Arc<Self>)
    where
        R: 'static,
        L: 'static,
    {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempts = 0;
            loop {
                match coordinator.synchronize().await {
                    Err(SyncError::AlreadyInProgress)
                        if attempts < coordinator.config.max_deferred_attempts =>
                    {
                        attempts += 1;
                        tokio::time::sleep(coordinator.jitter()).await;
                    }
                    Ok(_) | Err(_) => break,
                }
            }
        });
    }

    async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        // -- Pull --

        self.remote.health_check().await?;

        // Absent record means no remote history for this replica: first
        // sync, replay every author's stream from counter zero. The stored
        // vector carries a per-author cutoff; our own counter says nothing
        // about how far along any peer's stream is.
        let own_record = self.remote.fetch_clock_record(self.replica_id).await?;
        let since = own_record
            .as_ref()
            .map(|r| r.vector.clone())
            .unwrap_or_default();
        let own_record_id = own_record.as_ref().map(|r| r.record_id);

        let batches: Vec<RevisionBatch> = self
            .remote
            .batches_since(&since)
            .await?
            .into_iter()
            .filter(|b| Some(b.authoring_clock_id) != own_record_id)
            .collect();

        let total = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let resolved = self.hydrate_batch(batch, &mut report).await?;
            let outcome = self.local.merge_revisions(&resolved).await?;
            report.pulled_batches += 1;
            report.merged_entities += outcome.merged;
            report.rejected_entities += outcome.rejected;
            report.conflicts_resolved += outcome.conflicts_resolved;
            self.emit(SyncProgress::Pulling {
                fraction: (index + 1) as f64 / total as f64,
            });
        }

        // Capture concurrent replicas' knowledge even when no batch
        // touched them directly
        let pull_snapshot = self.remote.remote_vector().await?;
        self.knowledge.lock().await.merge(&pull_snapshot);

        // -- Push --

        *self.phase.lock().await = SyncPhase::Pushing;

        let record = self.remote.create_clock_record(self.replica_id).await?;

        // A counter we did not see at pull time means a concurrent writer
        // raced us; lazily created zero entries are not an advance
        let remote_now = self.remote.remote_vector().await?;
        if !pull_snapshot.covers(&remote_now) {
            log::debug!(
                "replica {}: remote vector advanced during cycle, aborting push",
                self.replica_id
            );
            self.schedule_retry();
            return Err(SyncError::StaleVector);
        }

        let pending = self.local.pending_revisions().await?;
        // Batches are stamped with the current remote value; the increment
        // happens only in the clock bookkeeping below
        let logical_clock = record.vector.clock_for(&self.replica_id);
        let mut pushed_uuids = Vec::with_capacity(pending.len());

        if !pending.is_empty() {
            let total = pending.len();
            let mut entities = Vec::with_capacity(total);
            for (index, mut entity) in pending.into_iter().enumerate() {
                let stamp = entity.stamp_mut();
                stamp.logical_clock = logical_clock;
                stamp.remote_clock_id = Some(record.record_id);
                pushed_uuids.push(stamp.uuid);
                entities.push(BatchEntity::Full(entity));
                self.emit(SyncProgress::Pushing {
                    fraction: (index + 1) as f64 / total as f64,
                });
            }

            let knowledge = self.knowledge.lock().await.clone();
            let batch = RevisionBatch::new(
                entities,
                knowledge,
                self.replica_id,
                record.record_id,
                logical_clock,
            );
            self.remote.upload_batch(batch).await?;
            report.pushed_entities = pushed_uuids.len();
        }

        // Clock bookkeeping runs even with nothing to upload. The increment
        // is applied to a working copy; local knowledge only observes it
        // once the compare-and-swap save succeeds, which is what makes the
        // rollback on a detected race trivial.
        let expected = record.vector.clone();
        let mut updated = record.clone();
        updated.vector.increment(self.replica_id);
        updated.vector.merge(&*self.knowledge.lock().await);

        match self.remote.save_clock_record(&updated, &expected).await {
            Ok(()) => {
                self.knowledge.lock().await.merge(&updated.vector);
                self.local
                    .mark_pushed(&pushed_uuids, logical_clock, record.record_id)
                    .await?;
            }
            Err(RemoteError::VectorChanged { latest }) => {
                log::debug!(
                    "replica {}: clock record advanced to {:?} under us, rolling back",
                    self.replica_id,
                    latest
                );
                self.schedule_retry();
                return Err(SyncError::StaleVector);
            }
            Err(e) => return Err(e.into()),
        }

        report.vector = self.knowledge.lock().await.clone();
        Ok(report)
    }

    /// Resolve abbreviated batch entities to full payloads, in order.
    ///
    /// An entity that cannot be hydrated is skipped with a report entry
    /// rather than failing the cycle; a stuck replica is worse than a
    /// partial merge.
    async fn hydrate_batch(
        &self,
        batch: RevisionBatch,
        report: &mut SyncReport,
    ) -> Result<ResolvedBatch, SyncError> {
        let mut entities = Vec::with_capacity(batch.entities.len());
        for entry in batch.entities {
            match entry {
                BatchEntity::Full(entity) => entities.push(entity),
                BatchEntity::Reference(uuid) => match self.remote.hydrate(uuid).await {
                    Ok(entity) => entities.push(entity),
                    Err(RemoteError::NotFound(_)) => {
                        log::warn!("cannot hydrate referenced entity {}, skipping", uuid);
                        report.rejected_entities += 1;
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(ResolvedBatch {
            entities,
            vector: batch.vector,
            logical_clock: batch.logical_clock,
        })
    }

    /// Emit a retry notification after a randomized delay instead of
    /// looping synchronously
    fn schedule_retry(&self) {
        let delay = self.jitter();
        self.emit(SyncProgress::RetryScheduled { delay });
        let tx = self.progress_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SyncProgress::RetryReady);
        });
    }

    fn jitter(&self) -> Duration {
        let min = self.config.retry_jitter_min.as_millis() as u64;
        let max = self.config.retry_jitter_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min + 1)))
    }

    fn emit(&self, event: SyncProgress) {
        // No subscribers is fine
        let _ = self.progress_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityPayload, Task};
    use crate::remote::memory::InMemoryRemote;
    use crate::store::ReplicaStore;
    use uuid::Uuid;

    fn replica(n: u8) -> ReplicaId {
        Uuid::from_u128(n as u128)
    }

    fn coordinator(
        n: u8,
        remote: &Arc<InMemoryRemote>,
    ) -> (Arc<SyncCoordinator<InMemoryRemote, ReplicaStore>>, Arc<ReplicaStore>) {
        let store = Arc::new(ReplicaStore::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            replica(n),
            Arc::clone(remote),
            Arc::clone(&store),
        ));
        (coordinator, store)
    }

    #[tokio::test]
    async fn test_unhealthy_remote_is_retryable_and_releases_lock() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_healthy(false);
        let (coordinator, _store) = coordinator(1, &remote);

        let err = coordinator.synchronize().await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable(_)));
        assert!(err.is_retryable());

        // The flag unwound; a later cycle may run
        remote.set_healthy(true);
        coordinator.synchronize().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_sync_with_empty_remote_is_clock_bookkeeping_only() {
        let remote = Arc::new(InMemoryRemote::new());
        let (coordinator, _store) = coordinator(1, &remote);

        let report = coordinator.synchronize().await.unwrap();
        assert_eq!(report.pulled_batches, 0);
        assert_eq!(report.pushed_entities, 0);
        assert_eq!(report.vector.clock_for(&replica(1)), 1);
        assert_eq!(remote.batch_count().await, 0);
    }

    #[tokio::test]
    async fn test_push_then_pull_roundtrip() {
        let remote = Arc::new(InMemoryRemote::new());
        let (a, store_a) = coordinator(1, &remote);
        let (b, store_b) = coordinator(2, &remote);

        store_a
            .add(EntityPayload::Task(Task::new("walk", "Walk 1km")))
            .await
            .unwrap();
        let report = a.synchronize().await.unwrap();
        assert_eq!(report.pushed_entities, 1);
        assert_eq!(store_a.pending_count().await, 0);

        let report = b.synchronize().await.unwrap();
        assert_eq!(report.pulled_batches, 1);
        assert_eq!(report.merged_entities, 1);
        assert!(store_b.current("walk").await.is_some());

        // B's knowledge covers both replicas
        assert_eq!(report.vector.clock_for(&replica(2)), 1);
        assert!(report.vector.clock_for(&replica(1)) >= 1);
    }

    #[tokio::test]
    async fn test_own_batches_are_not_replayed() {
        let remote = Arc::new(InMemoryRemote::new());
        let (a, store_a) = coordinator(1, &remote);

        store_a
            .add(EntityPayload::Task(Task::new("walk", "Walk 1km")))
            .await
            .unwrap();
        a.synchronize().await.unwrap();

        let report = a.synchronize().await.unwrap();
        assert_eq!(report.pulled_batches, 0);
        assert_eq!(store_a.version_count().await, 1);
    }

    #[tokio::test]
    async fn test_idle_cycles_do_not_starve_peer_batches() {
        let remote = Arc::new(InMemoryRemote::new());
        let (a, store_a) = coordinator(1, &remote);
        let (b, store_b) = coordinator(2, &remote);

        // A's own counter races ahead on read-only cycles
        for _ in 0..3 {
            a.synchronize().await.unwrap();
        }

        store_b
            .add(EntityPayload::Task(Task::new("walk", "Walk 1km")))
            .await
            .unwrap();
        b.synchronize().await.unwrap();

        // B's stream starts at counter zero regardless of where A's is
        let report = a.synchronize().await.unwrap();
        assert_eq!(report.pulled_batches, 1);
        assert!(store_a.current("walk").await.is_some());

        // And the delivered batch is not re-merged on the next cycle
        let report = a.synchronize().await.unwrap();
        assert_eq!(report.pulled_batches, 0);
    }

    #[tokio::test]
    async fn test_progress_events_bracket_the_cycle() {
        let remote = Arc::new(InMemoryRemote::new());
        let (a, store_a) = coordinator(1, &remote);
        store_a
            .add(EntityPayload::Task(Task::new("walk", "Walk 1km")))
            .await
            .unwrap();

        let mut rx = a.subscribe();
        a.synchronize().await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.first(), Some(&SyncProgress::Started));
        assert_eq!(events.last(), Some(&SyncProgress::Completed));
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncProgress::Pushing { fraction } if *fraction == 1.0)));
    }
}
