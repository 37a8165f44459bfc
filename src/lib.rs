// caresync - Versioned Record Synchronization Engine

//! Replicates a local, versioned, event-sourced record store against a
//! remote store so both sides converge on the same history without a shared
//! clock. Causality is tracked with vector clocks; record history is an
//! immutable linked chain of versions with validity windows and tombstones;
//! a coordinator pulls, merges, and pushes revision batches with
//! compare-and-swap clock semantics and a pluggable conflict policy.

pub mod chain;
pub mod clock;
pub mod conflict;
pub mod entity;
pub mod remote;
pub mod store;
pub mod sync;

pub use chain::{ChainError, VersionChain};
pub use clock::{LogicalTime, ReplicaId, VectorClock};
pub use conflict::{ConflictResolver, KeepLocal, KeepRemote, LastWriterWins};
pub use entity::{
    CarePlan, Contact, EntityError, EntityKind, EntityPayload, Outcome, OutcomeValue, Patient,
    Task, VersionStamp, VersionedEntity,
};
pub use remote::memory::InMemoryRemote;
pub use remote::{BatchEntity, ClockRecord, RemoteError, RemoteStore, RevisionBatch};
pub use store::{LocalStore, MergeOutcome, ReplicaStore, ResolvedBatch, StoreError};
pub use sync::{SyncConfig, SyncCoordinator, SyncError, SyncProgress, SyncReport};
