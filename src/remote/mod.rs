//! Remote store boundary
//!
//! The engine talks to the remote store through the [`RemoteStore`] trait:
//! clock records with compare-and-swap save semantics, ordered revision
//! batch queries, batch upload, and entity hydration. The concrete
//! transport and query execution live behind this boundary;
//! [`memory::InMemoryRemote`] is the in-tree implementation used by tests
//! and demos.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::{LogicalTime, ReplicaId, VectorClock};
use crate::entity::{EntityPayload, VersionedEntity};

/// Errors crossing the remote boundary
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// The remote cannot be reached or reported itself unhealthy
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("no such object: {0}")]
    NotFound(Uuid),

    /// Compare-and-swap failure: another writer advanced the stored vector
    #[error("stored vector changed since last read")]
    VectorChanged { latest: VectorClock },

    #[error("remote storage error: {0}")]
    Storage(String),
}

/// A replica's knowledge vector as persisted at the remote.
///
/// One record per synchronization pairing, created lazily on the replica's
/// first push and read-modify-written on every successful push thereafter.
/// Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockRecord {
    /// The replica this record belongs to
    pub replica_id: ReplicaId,

    /// The replica's knowledge at last push
    pub vector: VectorClock,

    /// Remote object identity, fixed at creation
    pub record_id: Uuid,
}

impl ClockRecord {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            vector: VectorClock::for_replica(replica_id),
            record_id: Uuid::new_v4(),
        }
    }
}

/// An entity carried by a batch: either the full payload or an abbreviated
/// reference the puller must hydrate before merging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BatchEntity {
    Full(EntityPayload),
    Reference(Uuid),
}

impl BatchEntity {
    pub fn uuid(&self) -> Uuid {
        match self {
            BatchEntity::Full(entity) => entity.stamp().uuid,
            BatchEntity::Reference(uuid) => *uuid,
        }
    }
}

/// The unit exchanged between replicas: an ordered list of modified
/// entities plus the authoring replica's clock snapshot.
///
/// `entities` preserves insertion order, oldest first. That order is the
/// replay order: a later entity may name an earlier one in the same batch
/// as its previous version, so permuting it breaks chain reconstruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevisionBatch {
    pub entities: Vec<BatchEntity>,

    /// The authoring replica's full knowledge at creation
    pub vector: VectorClock,

    /// The replica that authored this batch. Counter values are only
    /// comparable within one replica's stream, so pull queries filter per
    /// author.
    pub authoring_replica: ReplicaId,

    /// The clock record that authored this batch
    pub authoring_clock_id: Uuid,

    /// The authoring replica's counter at creation (pre-increment)
    pub logical_clock: LogicalTime,

    pub created_at: DateTime<Utc>,
}

impl RevisionBatch {
    pub fn new(
        entities: Vec<BatchEntity>,
        vector: VectorClock,
        authoring_replica: ReplicaId,
        authoring_clock_id: Uuid,
        logical_clock: LogicalTime,
    ) -> Self {
        Self {
            entities,
            vector,
            authoring_replica,
            authoring_clock_id,
            logical_clock,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }
}

/// Query and mutation surface of the remote store.
///
/// Implementations must return `batches_since` results ordered by
/// `(logical_clock ascending, created_at ascending)`, so batches from the
/// same clock tick replay in authoring order, and must implement
/// `save_clock_record` as a compare-and-swap against `expected`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reachability gate checked before any cycle proceeds
    async fn health_check(&self) -> Result<(), RemoteError>;

    async fn fetch_clock_record(
        &self,
        replica: ReplicaId,
    ) -> Result<Option<ClockRecord>, RemoteError>;

    /// Create the replica's clock record if absent, returning the stored
    /// record either way. First creation provisions access grants for the
    /// owning principal before the record is usable.
    async fn create_clock_record(&self, replica: ReplicaId) -> Result<ClockRecord, RemoteError>;

    /// Persist a clock record if the stored vector still equals `expected`;
    /// otherwise fail with [`RemoteError::VectorChanged`].
    async fn save_clock_record(
        &self,
        record: &ClockRecord,
        expected: &VectorClock,
    ) -> Result<(), RemoteError>;

    /// The merged knowledge across every clock record at the remote
    async fn remote_vector(&self) -> Result<VectorClock, RemoteError>;

    /// All batches at or past `since`'s counter for their authoring
    /// replica, ordered by `(logical_clock asc, created_at asc)`
    async fn batches_since(&self, since: &VectorClock)
        -> Result<Vec<RevisionBatch>, RemoteError>;

    async fn upload_batch(&self, batch: RevisionBatch) -> Result<(), RemoteError>;

    /// Resolve an abbreviated batch entity to its full payload
    async fn hydrate(&self, uuid: Uuid) -> Result<EntityPayload, RemoteError>;
}
