//! Conflict resolution policies
//!
//! Invoked by the local store when an incoming remote revision collides
//! with an uncommitted local change to the same logical record: a true
//! concurrent edit, not a vector-clock race. The policy receives the full
//! conflicting set and picks one survivor.

use crate::entity::{EntityPayload, VersionedEntity};

/// Policy hook for concurrent edits to one logical record.
pub trait ConflictResolver: Send + Sync {
    /// Choose the surviving version among the conflicting set.
    ///
    /// Returns `None` only for an empty set. By convention the incoming
    /// remote versions precede the local ones. Implementations must be
    /// deterministic across replicas for convergence.
    fn resolve(&self, conflicts: &[EntityPayload]) -> Option<EntityPayload>;
}

/// Default policy: the most recently created version wins.
///
/// Equal creation timestamps break by descending version uuid, which is
/// deterministic and symmetric across replicas.
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, conflicts: &[EntityPayload]) -> Option<EntityPayload> {
        conflicts
            .iter()
            .max_by_key(|e| (e.stamp().created_at, e.stamp().uuid))
            .cloned()
    }
}

/// Structural policy: the remote version always wins.
pub struct KeepRemote;

impl ConflictResolver for KeepRemote {
    fn resolve(&self, conflicts: &[EntityPayload]) -> Option<EntityPayload> {
        conflicts.first().cloned()
    }
}

/// Structural policy: the local version always wins.
pub struct KeepLocal;

impl ConflictResolver for KeepLocal {
    fn resolve(&self, conflicts: &[EntityPayload]) -> Option<EntityPayload> {
        conflicts.last().cloned()
    }
}
