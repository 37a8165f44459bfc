//! In-memory remote store
//!
//! Stands in for the real remote during tests and demos, the same way a
//! simulated transport stands in for radio hardware. Clock vectors are
//! persisted in their wire string form so the decode fallback path is
//! exercised for real, health can be toggled to drive the coordinator's
//! gate, and saves are compare-and-swap like the production store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BatchEntity, ClockRecord, RemoteError, RemoteStore, RevisionBatch};
use crate::clock::{ReplicaId, VectorClock};
use crate::entity::{EntityPayload, VersionedEntity};

/// A clock record as the remote actually stores it: the vector is an opaque
/// string payload, decoded on read.
#[derive(Clone, Debug)]
struct StoredClockRecord {
    replica_id: ReplicaId,
    encoded_vector: String,
    record_id: Uuid,
}

impl StoredClockRecord {
    fn to_record(&self) -> ClockRecord {
        ClockRecord {
            replica_id: self.replica_id,
            // Corrupt payloads decode to empty knowledge (full resync)
            vector: VectorClock::decode_or_empty(&self.encoded_vector),
            record_id: self.record_id,
        }
    }
}

#[derive(Default)]
struct RemoteState {
    clock_records: HashMap<ReplicaId, StoredClockRecord>,
    batches: Vec<RevisionBatch>,
    /// Hydration index: version uuid -> full payload
    entities: HashMap<Uuid, EntityPayload>,
}

/// In-memory [`RemoteStore`] shared by every replica in a test or demo.
pub struct InMemoryRemote {
    state: RwLock<RemoteState>,
    healthy: AtomicBool,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RemoteState::default()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Toggle the health gate
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Overwrite a stored clock payload with garbage, simulating the
    /// inconsistent remote state the decode fallback exists for
    pub async fn corrupt_clock_payload(&self, replica: ReplicaId) {
        let mut state = self.state.write().await;
        if let Some(stored) = state.clock_records.get_mut(&replica) {
            stored.encoded_vector = "{corrupt".to_string();
        }
    }

    /// Number of batches the remote currently holds
    pub async fn batch_count(&self) -> usize {
        self.state.read().await.batches.len()
    }

    fn gate(&self) -> Result<(), RemoteError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("health check failed".into()))
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn health_check(&self) -> Result<(), RemoteError> {
        self.gate()
    }

    async fn fetch_clock_record(
        &self,
        replica: ReplicaId,
    ) -> Result<Option<ClockRecord>, RemoteError> {
        self.gate()?;
        let state = self.state.read().await;
        Ok(state.clock_records.get(&replica).map(|s| s.to_record()))
    }

    async fn create_clock_record(&self, replica: ReplicaId) -> Result<ClockRecord, RemoteError> {
        self.gate()?;
        let mut state = self.state.write().await;
        if let Some(existing) = state.clock_records.get(&replica) {
            return Ok(existing.to_record());
        }

        // Access grants for the owning principal are provisioned here in the
        // production store; the record is not usable until that completes.
        log::info!("provisioning clock record and access grants for replica {}", replica);

        let record = ClockRecord::new(replica);
        state.clock_records.insert(
            replica,
            StoredClockRecord {
                replica_id: replica,
                encoded_vector: record.vector.encode(),
                record_id: record.record_id,
            },
        );
        Ok(record)
    }

    async fn save_clock_record(
        &self,
        record: &ClockRecord,
        expected: &VectorClock,
    ) -> Result<(), RemoteError> {
        self.gate()?;
        let mut state = self.state.write().await;
        let stored = state
            .clock_records
            .get_mut(&record.replica_id)
            .ok_or(RemoteError::NotFound(record.record_id))?;

        let latest = VectorClock::decode_or_empty(&stored.encoded_vector);
        if latest != *expected {
            return Err(RemoteError::VectorChanged { latest });
        }

        stored.encoded_vector = record.vector.encode();
        Ok(())
    }

    async fn remote_vector(&self) -> Result<VectorClock, RemoteError> {
        self.gate()?;
        let state = self.state.read().await;
        let mut merged = VectorClock::new();
        for stored in state.clock_records.values() {
            merged.merge(&stored.to_record().vector);
        }
        Ok(merged)
    }

    async fn batches_since(
        &self,
        since: &VectorClock,
    ) -> Result<Vec<RevisionBatch>, RemoteError> {
        self.gate()?;
        let state = self.state.read().await;
        // Counters from different replicas are incomparable, so the cutoff
        // is taken per authoring replica
        let mut matched: Vec<RevisionBatch> = state
            .batches
            .iter()
            .filter(|b| b.logical_clock >= since.clock_for(&b.authoring_replica))
            .cloned()
            .collect();
        // The tie-break matters: batches from one clock tick replay in
        // authoring order
        matched.sort_by(|a, b| {
            (a.logical_clock, a.created_at).cmp(&(b.logical_clock, b.created_at))
        });
        Ok(matched)
    }

    async fn upload_batch(&self, batch: RevisionBatch) -> Result<(), RemoteError> {
        self.gate()?;
        let mut state = self.state.write().await;
        for entry in &batch.entities {
            if let BatchEntity::Full(entity) = entry {
                state.entities.insert(entity.stamp().uuid, entity.clone());
            }
        }
        state.batches.push(batch);
        Ok(())
    }

    async fn hydrate(&self, uuid: Uuid) -> Result<EntityPayload, RemoteError> {
        self.gate()?;
        let state = self.state.read().await;
        state
            .entities
            .get(&uuid)
            .cloned()
            .ok_or(RemoteError::NotFound(uuid))
    }
}
