//! Local store boundary and the in-memory replica store
//!
//! The coordinator applies pulled revisions through the [`LocalStore`]
//! trait, one batch at a time, and collects pending local revisions from it
//! for the push phase. [`ReplicaStore`] is the in-tree implementation:
//! version chains over an in-memory arena, a pending queue of uncommitted
//! local edits, and true concurrent-edit detection delegating to a
//! [`ConflictResolver`].

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::chain::{ChainError, VersionChain};
use crate::clock::{LogicalTime, VectorClock};
use crate::conflict::{ConflictResolver, LastWriterWins};
use crate::entity::{EntityError, EntityPayload, VersionedEntity};

/// Errors surfaced by the local store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("no record with id '{0}'")]
    NoSuchRecord(String),

    #[error("local storage error: {0}")]
    Storage(String),
}

/// A pulled batch after hydration: every entity carries its full payload,
/// in the original insertion order.
#[derive(Clone, Debug)]
pub struct ResolvedBatch {
    pub entities: Vec<EntityPayload>,
    pub vector: VectorClock,
    pub logical_clock: LogicalTime,
}

/// Per-batch merge accounting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entities applied to the store
    pub merged: usize,
    /// Entities rejected for contract violations (reported, not fatal)
    pub rejected: usize,
    /// Concurrent edits settled by the conflict policy
    pub conflicts_resolved: usize,
}

/// What the synchronization engine requires of the local store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Apply one pulled batch. Contract violations on individual entities
    /// must not abort the rest of the batch, but must be reported in the
    /// outcome.
    async fn merge_revisions(&self, batch: &ResolvedBatch) -> Result<MergeOutcome, StoreError>;

    /// Local revisions made since the last successful push, oldest first
    async fn pending_revisions(&self) -> Result<Vec<EntityPayload>, StoreError>;

    /// Record that the given versions were pushed: stamp them with the
    /// authoring clock value and clock record, and drop them from the
    /// pending queue.
    async fn mark_pushed(
        &self,
        uuids: &[Uuid],
        logical_clock: LogicalTime,
        clock_record_id: Uuid,
    ) -> Result<(), StoreError>;
}

struct ReplicaState {
    chain: VersionChain,
    /// Uncommitted local versions, in edit order
    pending: Vec<Uuid>,
}

/// In-memory versioned record store for one replica.
pub struct ReplicaStore {
    state: RwLock<ReplicaState>,
    resolver: Arc<dyn ConflictResolver>,
}

impl Default for ReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaStore {
    /// A store resolving conflicts by last-writer-wins
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(LastWriterWins))
    }

    pub fn with_resolver(resolver: Arc<dyn ConflictResolver>) -> Self {
        Self {
            state: RwLock::new(ReplicaState {
                chain: VersionChain::new(),
                pending: Vec::new(),
            }),
            resolver,
        }
    }

    /// Add a brand-new record version authored locally
    pub async fn add(&self, entity: EntityPayload) -> Result<Uuid, StoreError> {
        contract_check(&entity)?;
        let uuid = entity.stamp().uuid;
        let mut state = self.state.write().await;
        state.chain.insert(entity);
        state.pending.push(uuid);
        Ok(uuid)
    }

    /// Author a new version superseding the record's current tip
    pub async fn update(&self, mut entity: EntityPayload) -> Result<Uuid, StoreError> {
        contract_check(&entity)?;
        let mut state = self.state.write().await;
        let tip = state
            .chain
            .current_version(entity.logical_id(), Utc::now())
            .map(|t| t.stamp().uuid)
            .ok_or_else(|| StoreError::NoSuchRecord(entity.logical_id().to_string()))?;

        entity.stamp_mut().previous_version_id = Some(tip);
        let uuid = entity.stamp().uuid;
        state.chain.insert(entity);
        state.pending.push(uuid);
        Ok(uuid)
    }

    /// Tombstone the record's current version. The version stays in the
    /// chain; it is re-queued for push so the deletion replicates.
    pub async fn delete(&self, logical_id: &str) -> Result<Uuid, StoreError> {
        let mut state = self.state.write().await;
        let tip = state
            .chain
            .current_version(logical_id, Utc::now())
            .map(|t| t.stamp().uuid)
            .ok_or_else(|| StoreError::NoSuchRecord(logical_id.to_string()))?;

        state.chain.tombstone(&tip, Utc::now())?;
        if !state.pending.contains(&tip) {
            state.pending.push(tip);
        }
        Ok(tip)
    }

    /// The record version valid right now, if any
    pub async fn current(&self, logical_id: &str) -> Option<EntityPayload> {
        let state = self.state.read().await;
        state.chain.current_version(logical_id, Utc::now()).cloned()
    }

    /// The record's full chain, earliest version first
    pub async fn history(&self, logical_id: &str) -> Result<Vec<EntityPayload>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .chain
            .chain_of(logical_id)?
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn version_count(&self) -> usize {
        self.state.read().await.chain.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// Apply one incoming entity, settling concurrent-edit conflicts.
    /// Returns whether a conflict was resolved.
    fn apply_incoming(state: &mut ReplicaState, resolver: &dyn ConflictResolver, incoming: EntityPayload) -> bool {
        let incoming_uuid = incoming.stamp().uuid;
        let logical_id = incoming.logical_id().to_string();

        // A true concurrent edit: an uncommitted local version of the same
        // logical record that the incoming revision does not descend from.
        let contested: Vec<Uuid> = state
            .pending
            .iter()
            .copied()
            .filter(|pending| {
                *pending != incoming_uuid
                    && incoming.stamp().previous_version_id != Some(*pending)
                    && state
                        .chain
                        .get(pending)
                        .map(|local| local.logical_id() == logical_id)
                        .unwrap_or(false)
            })
            .collect();

        if contested.is_empty() {
            state.chain.insert(incoming);
            return false;
        }

        let mut conflicts = vec![incoming.clone()];
        for uuid in &contested {
            if let Some(local) = state.chain.get(uuid) {
                conflicts.push(local.clone());
            }
        }

        let winner = match resolver.resolve(&conflicts) {
            Some(winner) => winner,
            // Unreachable with a non-empty set; treat as no conflict
            None => {
                state.chain.insert(incoming);
                return false;
            }
        };
        let winner_uuid = winner.stamp().uuid;
        log::info!(
            "concurrent edit on '{}': {} candidates, keeping {}",
            logical_id,
            conflicts.len(),
            winner_uuid
        );

        if winner_uuid == incoming_uuid {
            // Remote wins: discard the losing uncommitted local versions
            for uuid in &contested {
                state.chain.remove(uuid);
                state.pending.retain(|p| p != uuid);
            }
            state.chain.insert(incoming);
        } else {
            // A local uncommitted edit survives; the incoming revision is
            // superseded and not applied
            log::debug!(
                "dropping incoming version {} of '{}' in favor of local {}",
                incoming_uuid,
                logical_id,
                winner_uuid
            );
        }
        true
    }
}

/// Required-field checks shared by local edits and incoming merges
fn contract_check(entity: &EntityPayload) -> Result<(), EntityError> {
    if entity.logical_id().is_empty() {
        return Err(EntityError::MissingField {
            kind: entity.kind(),
            uuid: entity.stamp().uuid,
            field: "id",
        });
    }
    Ok(())
}

#[async_trait]
impl LocalStore for ReplicaStore {
    async fn merge_revisions(&self, batch: &ResolvedBatch) -> Result<MergeOutcome, StoreError> {
        let mut state = self.state.write().await;
        let mut outcome = MergeOutcome::default();

        // Batch order is replay order: a later entity may link to an
        // earlier one in this same batch
        for entity in &batch.entities {
            if let Err(e) = contract_check(entity) {
                log::warn!("rejecting entity from batch: {}", e);
                outcome.rejected += 1;
                continue;
            }
            if Self::apply_incoming(&mut state, self.resolver.as_ref(), entity.clone()) {
                outcome.conflicts_resolved += 1;
            }
            outcome.merged += 1;
        }

        Ok(outcome)
    }

    async fn pending_revisions(&self) -> Result<Vec<EntityPayload>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .pending
            .iter()
            .filter_map(|uuid| state.chain.get(uuid))
            .cloned()
            .collect())
    }

    async fn mark_pushed(
        &self,
        uuids: &[Uuid],
        logical_clock: LogicalTime,
        clock_record_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for uuid in uuids {
            state.chain.stamp_pushed(uuid, logical_clock, clock_record_id);
            state.pending.retain(|p| p != uuid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::KeepLocal;
    use crate::entity::Task;

    fn task(id: &str, title: &str) -> EntityPayload {
        EntityPayload::Task(Task::new(id, title))
    }

    fn batch(entities: Vec<EntityPayload>) -> ResolvedBatch {
        ResolvedBatch {
            entities,
            vector: VectorClock::new(),
            logical_clock: 1,
        }
    }

    #[tokio::test]
    async fn test_add_update_builds_chain() {
        let store = ReplicaStore::new();
        store.add(task("walk", "Walk 1km")).await.unwrap();

        let mut v2 = task("walk", "Walk 2km");
        v2.stamp_mut().effective_date = Utc::now() + chrono::Duration::milliseconds(1);
        store.update(v2).await.unwrap();

        let history = store.history("walk").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].stamp().next_version_id,
            Some(history[1].stamp().uuid)
        );
        assert_eq!(store.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() {
        let store = ReplicaStore::new();
        let err = store.update(task("ghost", "nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NoSuchRecord(_)));
    }

    #[tokio::test]
    async fn test_contract_violation_rejected_not_fatal() {
        let store = ReplicaStore::new();
        let nameless = task("", "no id");
        let fine = task("walk", "Walk 1km");

        let outcome = store
            .merge_revisions(&batch(vec![nameless, fine]))
            .await
            .unwrap();
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.merged, 1);
        assert!(store.current("walk").await.is_some());
    }

    #[tokio::test]
    async fn test_remote_wins_conflict_discards_pending() {
        let store = ReplicaStore::new();
        let mut local = task("walk", "local edit");
        local.stamp_mut().created_at = Utc::now() - chrono::Duration::minutes(1);
        store.add(local).await.unwrap();

        let mut remote = task("walk", "remote edit");
        remote.stamp_mut().created_at = Utc::now();

        let outcome = store
            .merge_revisions(&batch(vec![remote.clone()]))
            .await
            .unwrap();
        assert_eq!(outcome.conflicts_resolved, 1);
        assert_eq!(store.pending_count().await, 0);

        let current = store.current("walk").await.unwrap();
        assert_eq!(current.stamp().uuid, remote.stamp().uuid);
    }

    #[tokio::test]
    async fn test_keep_local_policy_preserves_pending() {
        let store = ReplicaStore::with_resolver(Arc::new(KeepLocal));
        let local = task("walk", "local edit");
        let local_uuid = store.add(local).await.unwrap();

        let remote = task("walk", "remote edit");
        let outcome = store.merge_revisions(&batch(vec![remote])).await.unwrap();

        assert_eq!(outcome.conflicts_resolved, 1);
        assert_eq!(store.pending_count().await, 1);
        assert_eq!(store.current("walk").await.unwrap().stamp().uuid, local_uuid);
    }

    #[tokio::test]
    async fn test_mark_pushed_stamps_and_clears() {
        let store = ReplicaStore::new();
        let uuid = store.add(task("walk", "Walk 1km")).await.unwrap();

        let record_id = Uuid::new_v4();
        store.mark_pushed(&[uuid], 4, record_id).await.unwrap();

        assert_eq!(store.pending_count().await, 0);
        let current = store.current("walk").await.unwrap();
        assert_eq!(current.stamp().logical_clock, 4);
        assert_eq!(current.stamp().remote_clock_id, Some(record_id));
    }
}
