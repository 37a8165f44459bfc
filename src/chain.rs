//! Version chain reconstruction and repair
//!
//! Revisions arrive out of order: a "next" version may land before its
//! "previous". The [`VersionChain`] is an id-keyed arena of versions plus a
//! per-logical-record index; it accepts versions in any order, repairs
//! missing reciprocal links as neighbors resolve, and answers
//! point-in-time queries over the reconstructed history.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::{EntityPayload, VersionedEntity};

/// Integrity errors raised while reconstructing chains
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("unknown version {0}")]
    UnknownVersion(Uuid),

    #[error("version cycle detected for record '{logical_id}' at {version}")]
    CycleDetected { logical_id: String, version: Uuid },
}

/// Arena of entity versions with per-record chain reconstruction.
///
/// Links are identifier relations resolved against the arena on demand; a
/// version whose neighbor has not arrived yet simply stays partially linked
/// until repair catches up.
#[derive(Default)]
pub struct VersionChain {
    versions: HashMap<Uuid, EntityPayload>,
    /// logical record id -> version uuids, in arrival order
    records: HashMap<String, Vec<Uuid>>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&EntityPayload> {
        self.versions.get(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.versions.contains_key(uuid)
    }

    /// Version uuids recorded for a logical record, in arrival order
    pub fn versions_of(&self, logical_id: &str) -> &[Uuid] {
        self.records
            .get(logical_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Insert a version and repair linkage around it.
    ///
    /// Re-inserting a known uuid replaces the stored payload but keeps any
    /// link already repaired on either side, so a hydrated re-delivery never
    /// undoes an earlier fix. Returns the uuids whose links were repaired,
    /// including possibly the inserted version's own; callers persisting to
    /// a backing store should rewrite those versions.
    pub fn insert(&mut self, mut entity: EntityPayload) -> Vec<Uuid> {
        let uuid = entity.stamp().uuid;

        if let Some(existing) = self.versions.get(&uuid) {
            let stamp = entity.stamp_mut();
            if stamp.previous_version_id.is_none() {
                stamp.previous_version_id = existing.stamp().previous_version_id;
            }
            if stamp.next_version_id.is_none() {
                stamp.next_version_id = existing.stamp().next_version_id;
            }
        } else {
            self.records
                .entry(entity.logical_id().to_string())
                .or_default()
                .push(uuid);
        }

        self.versions.insert(uuid, entity);
        self.repair_links(uuid)
    }

    /// Self-healing reciprocal link repair.
    ///
    /// Walks outward from `start` with an explicit worklist (bounded stack
    /// regardless of chain length). Repair looks both ways: it follows the
    /// version's own `previous`/`next` pointers to fill unset reciprocal
    /// pointers on resolved neighbors, and it scans same-record versions
    /// whose pointers name this version, so a predecessor arriving after
    /// the successor that claims it still gets its `next` healed. A pointer
    /// already set to a *different* version is left alone and logged, since
    /// overwriting would violate the at-most-one-next invariant.
    /// Idempotent: a second pass finds every reciprocal link already
    /// agreeing and changes nothing.
    pub fn repair_links(&mut self, start: Uuid) -> Vec<Uuid> {
        let mut repaired = Vec::new();
        let mut seen = HashSet::new();
        let mut work = VecDeque::from([start]);

        while let Some(uuid) = work.pop_front() {
            if !seen.insert(uuid) {
                continue;
            }
            let (logical_id, prev_id, next_id) = match self.versions.get(&uuid) {
                Some(entity) => (
                    entity.logical_id().to_string(),
                    entity.stamp().previous_version_id,
                    entity.stamp().next_version_id,
                ),
                None => continue,
            };

            if let Some(prev) = prev_id {
                match self.versions.get_mut(&prev) {
                    Some(neighbor) => match neighbor.stamp().next_version_id {
                        None => {
                            neighbor.stamp_mut().next_version_id = Some(uuid);
                            repaired.push(prev);
                            work.push_back(prev);
                        }
                        Some(n) if n == uuid => {
                            work.push_back(prev);
                        }
                        Some(other) => {
                            log::warn!(
                                "version {} claims previous {}, which already links next to {}; leaving chain as-is",
                                uuid, prev, other
                            );
                        }
                    },
                    // Neighbor not fetched yet; repair resumes when it arrives
                    None => {}
                }
            }

            if let Some(next) = next_id {
                match self.versions.get_mut(&next) {
                    Some(neighbor) => match neighbor.stamp().previous_version_id {
                        None => {
                            neighbor.stamp_mut().previous_version_id = Some(uuid);
                            repaired.push(next);
                            work.push_back(next);
                        }
                        Some(p) if p == uuid => {
                            work.push_back(next);
                        }
                        Some(other) => {
                            log::warn!(
                                "version {} claims next {}, which already links previous to {}; leaving chain as-is",
                                uuid, next, other
                            );
                        }
                    },
                    None => {}
                }
            }

            // The other direction: same-record versions whose pointers name
            // this one resolve their claims now that it is present
            let claimants: Vec<(Uuid, Option<Uuid>, Option<Uuid>)> = self
                .records
                .get(&logical_id)
                .map(|uuids| {
                    uuids
                        .iter()
                        .filter(|c| **c != uuid)
                        .filter_map(|c| self.versions.get(c))
                        .map(|e| {
                            (
                                e.stamp().uuid,
                                e.stamp().previous_version_id,
                                e.stamp().next_version_id,
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();

            for (claimant, claims_prev, claims_next) in claimants {
                if claims_prev == Some(uuid) {
                    let our_next = self
                        .versions
                        .get(&uuid)
                        .and_then(|e| e.stamp().next_version_id);
                    match our_next {
                        None => {
                            if let Some(entity) = self.versions.get_mut(&uuid) {
                                entity.stamp_mut().next_version_id = Some(claimant);
                                repaired.push(uuid);
                            }
                            work.push_back(claimant);
                        }
                        Some(n) if n == claimant => {
                            work.push_back(claimant);
                        }
                        Some(other) => {
                            log::warn!(
                                "version {} claims previous {}, which already links next to {}; leaving chain as-is",
                                claimant, uuid, other
                            );
                        }
                    }
                }
                if claims_next == Some(uuid) {
                    let our_prev = self
                        .versions
                        .get(&uuid)
                        .and_then(|e| e.stamp().previous_version_id);
                    match our_prev {
                        None => {
                            if let Some(entity) = self.versions.get_mut(&uuid) {
                                entity.stamp_mut().previous_version_id = Some(claimant);
                                repaired.push(uuid);
                            }
                            work.push_back(claimant);
                        }
                        Some(p) if p == claimant => {
                            work.push_back(claimant);
                        }
                        Some(other) => {
                            log::warn!(
                                "version {} claims next {}, which already links previous to {}; leaving chain as-is",
                                claimant, uuid, other
                            );
                        }
                    }
                }
            }
        }

        repaired
    }

    /// Remove a version outright and unlink its neighbors.
    ///
    /// Synced history is never removed (deletion is tombstoning); this
    /// exists for uncommitted local versions discarded by conflict
    /// resolution before they ever reached the remote.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<EntityPayload> {
        let removed = self.versions.remove(uuid)?;

        let record_emptied = match self.records.get_mut(removed.logical_id()) {
            Some(record) => {
                record.retain(|u| u != uuid);
                record.is_empty()
            }
            None => false,
        };
        if record_emptied {
            self.records.remove(removed.logical_id());
        }

        if let Some(prev) = removed.stamp().previous_version_id {
            if let Some(neighbor) = self.versions.get_mut(&prev) {
                if neighbor.stamp().next_version_id == Some(*uuid) {
                    neighbor.stamp_mut().next_version_id = None;
                }
            }
        }
        if let Some(next) = removed.stamp().next_version_id {
            if let Some(neighbor) = self.versions.get_mut(&next) {
                if neighbor.stamp().previous_version_id == Some(*uuid) {
                    neighbor.stamp_mut().previous_version_id = None;
                }
            }
        }

        Some(removed)
    }

    /// Stamp a version with the clock value and clock record that pushed it
    pub fn stamp_pushed(
        &mut self,
        uuid: &Uuid,
        logical_clock: crate::clock::LogicalTime,
        clock_record_id: Uuid,
    ) {
        if let Some(entity) = self.versions.get_mut(uuid) {
            let stamp = entity.stamp_mut();
            stamp.logical_clock = logical_clock;
            stamp.remote_clock_id = Some(clock_record_id);
        }
    }

    /// Tombstone a version. The version keeps its place and links in the
    /// chain; only "current" queries stop returning it.
    pub fn tombstone(&mut self, uuid: &Uuid, when: DateTime<Utc>) -> Result<(), ChainError> {
        let entity = self
            .versions
            .get_mut(uuid)
            .ok_or(ChainError::UnknownVersion(*uuid))?;
        entity.stamp_mut().deleted_date = Some(when);
        Ok(())
    }

    /// The version of a logical record valid at `as_of`.
    ///
    /// A version qualifies when its effective date is at or before `as_of`
    /// and its successor (if resolved) becomes effective only after `as_of`.
    /// Tombstoned versions never qualify. Ties on identical effective dates
    /// break by earliest creation time, then ascending uuid.
    pub fn current_version(&self, logical_id: &str, as_of: DateTime<Utc>) -> Option<&EntityPayload> {
        self.versions_of(logical_id)
            .iter()
            .filter_map(|uuid| self.versions.get(uuid))
            .filter(|entity| {
                let stamp = entity.stamp();
                if stamp.is_deleted() || !stamp.is_effective_at(as_of) {
                    return false;
                }
                match stamp.next_version_id.and_then(|n| self.versions.get(&n)) {
                    Some(next) => next.stamp().effective_date > as_of,
                    None => true,
                }
            })
            .min_by_key(|entity| {
                let stamp = entity.stamp();
                // Latest validity window first; creation order breaks ties
                (
                    std::cmp::Reverse(stamp.effective_date),
                    stamp.created_at,
                    stamp.uuid,
                )
            })
    }

    /// Walk a record's chain from its earliest version along next-pointers.
    ///
    /// Fails with [`ChainError::CycleDetected`] if a next-pointer revisits a
    /// version already seen.
    pub fn chain_of(&self, logical_id: &str) -> Result<Vec<&EntityPayload>, ChainError> {
        let uuids = self.versions_of(logical_id);
        if uuids.is_empty() {
            return Ok(Vec::new());
        }

        // Head: no resolved previous, earliest effective date as fallback
        let head = match uuids
            .iter()
            .filter_map(|u| self.versions.get(u))
            .filter(|e| {
                e.stamp()
                    .previous_version_id
                    .map(|p| !self.versions.contains_key(&p))
                    .unwrap_or(true)
            })
            .min_by_key(|e| (e.stamp().effective_date, e.stamp().created_at, e.stamp().uuid))
        {
            Some(head) => head,
            // Every version has a resolved predecessor: the links loop
            None => {
                return Err(ChainError::CycleDetected {
                    logical_id: logical_id.to_string(),
                    version: uuids[0],
                })
            }
        };

        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(head);

        while let Some(entity) = cursor {
            let uuid = entity.stamp().uuid;
            if !seen.insert(uuid) {
                return Err(ChainError::CycleDetected {
                    logical_id: logical_id.to_string(),
                    version: uuid,
                });
            }
            chain.push(entity);
            cursor = entity
                .stamp()
                .next_version_id
                .and_then(|n| self.versions.get(&n));
        }

        Ok(chain)
    }

    /// Iterate every version in the arena
    pub fn iter(&self) -> impl Iterator<Item = &EntityPayload> {
        self.versions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Task;

    fn task_version(id: &str, title: &str) -> EntityPayload {
        EntityPayload::Task(Task::new(id, title))
    }

    fn linked_pair(id: &str) -> (EntityPayload, EntityPayload) {
        let v1 = task_version(id, "v1");
        let mut v2 = task_version(id, "v2");
        v2.stamp_mut().previous_version_id = Some(v1.stamp().uuid);
        v2.stamp_mut().effective_date = v1.stamp().effective_date + chrono::Duration::hours(1);
        (v1, v2)
    }

    #[test]
    fn test_out_of_order_arrival_heals_links() {
        let (v1, v2) = linked_pair("walk");
        let (id1, id2) = (v1.stamp().uuid, v2.stamp().uuid);

        let mut chain = VersionChain::new();
        // The successor arrives first; nothing to repair yet
        assert!(chain.insert(v2).is_empty());
        // The predecessor lands and its missing next-pointer is healed
        let repaired = chain.insert(v1);
        assert_eq!(repaired, vec![id1]);

        assert_eq!(chain.get(&id1).unwrap().stamp().next_version_id, Some(id2));
        assert_eq!(
            chain.get(&id2).unwrap().stamp().previous_version_id,
            Some(id1)
        );
    }

    #[test]
    fn test_middle_version_arriving_last_heals_both_sides() {
        let v1 = task_version("walk", "v1");
        let mut v2 = task_version("walk", "v2");
        let mut v3 = task_version("walk", "v3");
        v2.stamp_mut().previous_version_id = Some(v1.stamp().uuid);
        v3.stamp_mut().previous_version_id = Some(v2.stamp().uuid);
        let (id1, id2, id3) = (v1.stamp().uuid, v2.stamp().uuid, v3.stamp().uuid);

        let mut chain = VersionChain::new();
        chain.insert(v1);
        chain.insert(v3);
        // The middle version lands last and both its neighbors resolve
        chain.insert(v2);

        assert_eq!(chain.get(&id1).unwrap().stamp().next_version_id, Some(id2));
        assert_eq!(chain.get(&id2).unwrap().stamp().next_version_id, Some(id3));
        assert_eq!(
            chain.get(&id3).unwrap().stamp().previous_version_id,
            Some(id2)
        );
        assert_eq!(chain.chain_of("walk").unwrap().len(), 3);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let (v1, v2) = linked_pair("walk");
        let id1 = v1.stamp().uuid;

        let mut chain = VersionChain::new();
        chain.insert(v2);
        chain.insert(v1);

        let first = chain.repair_links(id1);
        let second = chain.repair_links(id1);
        assert!(first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn test_repair_propagates_along_chain() {
        // Three generations, middle one missing both reciprocal links
        let v1 = task_version("walk", "v1");
        let mut v2 = task_version("walk", "v2");
        let mut v3 = task_version("walk", "v3");
        v2.stamp_mut().previous_version_id = Some(v1.stamp().uuid);
        v3.stamp_mut().previous_version_id = Some(v2.stamp().uuid);

        let (id1, id2, id3) = (v1.stamp().uuid, v2.stamp().uuid, v3.stamp().uuid);

        let mut chain = VersionChain::new();
        chain.insert(v1);
        chain.insert(v2);
        chain.insert(v3);

        assert_eq!(chain.get(&id1).unwrap().stamp().next_version_id, Some(id2));
        assert_eq!(chain.get(&id2).unwrap().stamp().next_version_id, Some(id3));
        assert_eq!(chain.get(&id3).unwrap().stamp().next_version_id, None);
    }

    #[test]
    fn test_repair_never_overwrites_existing_link() {
        let v1 = task_version("walk", "v1");
        let id1 = v1.stamp().uuid;
        let stranger = Uuid::new_v4();

        let mut v1_linked = v1.clone();
        v1_linked.stamp_mut().next_version_id = Some(stranger);

        let mut claimant = task_version("walk", "claimant");
        claimant.stamp_mut().previous_version_id = Some(id1);

        let mut chain = VersionChain::new();
        chain.insert(v1_linked);
        let repaired = chain.insert(claimant);

        assert!(repaired.is_empty());
        assert_eq!(
            chain.get(&id1).unwrap().stamp().next_version_id,
            Some(stranger)
        );
    }

    #[test]
    fn test_chain_walk_is_acyclic() {
        let (v1, mut v2) = linked_pair("walk");
        // Corrupt: successor points back at itself as next
        let id2 = v2.stamp().uuid;
        v2.stamp_mut().next_version_id = Some(id2);

        let mut chain = VersionChain::new();
        chain.insert(v1);
        chain.insert(v2);

        let err = chain.chain_of("walk").unwrap_err();
        assert!(matches!(err, ChainError::CycleDetected { .. }));
    }

    #[test]
    fn test_current_version_selects_validity_window() {
        let (v1, v2) = linked_pair("walk");
        let mid = v1.stamp().effective_date + chrono::Duration::minutes(30);
        let late = v2.stamp().effective_date + chrono::Duration::hours(1);

        let mut chain = VersionChain::new();
        chain.insert(v1.clone());
        chain.insert(v2.clone());

        assert_eq!(
            chain.current_version("walk", mid).unwrap().stamp().uuid,
            v1.stamp().uuid
        );
        assert_eq!(
            chain.current_version("walk", late).unwrap().stamp().uuid,
            v2.stamp().uuid
        );
        assert!(chain
            .current_version("walk", v1.stamp().effective_date - chrono::Duration::hours(1))
            .is_none());
    }

    #[test]
    fn test_equal_effective_dates_break_by_creation_order() {
        let mut a = task_version("walk", "first write");
        let mut b = task_version("walk", "second write");
        let when = Utc::now();
        a.stamp_mut().effective_date = when;
        b.stamp_mut().effective_date = when;
        a.stamp_mut().created_at = when;
        b.stamp_mut().created_at = when + chrono::Duration::milliseconds(5);

        let mut chain = VersionChain::new();
        chain.insert(b);
        chain.insert(a.clone());

        let current = chain.current_version("walk", when + chrono::Duration::hours(1));
        assert_eq!(current.unwrap().stamp().uuid, a.stamp().uuid);
    }

    #[test]
    fn test_tombstone_excluded_but_reachable() {
        let (v1, v2) = linked_pair("walk");
        let (id1, id2) = (v1.stamp().uuid, v2.stamp().uuid);
        let late = v2.stamp().effective_date + chrono::Duration::hours(1);

        let mut chain = VersionChain::new();
        chain.insert(v1);
        chain.insert(v2);
        chain.tombstone(&id2, Utc::now()).unwrap();

        // The tombstoned tip no longer answers current queries; the
        // predecessor does not cover the window either (its successor is
        // effective), so there is no current version at `late`.
        assert!(chain.current_version("walk", late).is_none());

        // But the version remains reachable and linked
        let walked = chain.chain_of("walk").unwrap();
        assert_eq!(walked.len(), 2);
        assert_eq!(walked[1].stamp().uuid, id2);
        assert_eq!(walked[1].stamp().previous_version_id, Some(id1));
        assert_eq!(walked[0].stamp().next_version_id, Some(id2));
    }
}
