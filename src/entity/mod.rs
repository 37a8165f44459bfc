//! Versioned entity model
//!
//! Every record participating in synchronization is an immutable version in
//! a linked chain. The version metadata (identity, previous/next links,
//! validity window, tombstone, clock stamp) is common across kinds and lives
//! in a [`VersionStamp`] embedded in each flat kind struct.

mod kinds;

pub use kinds::{CarePlan, Contact, EntityKind, EntityPayload, Outcome, OutcomeValue, Patient, Task};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::LogicalTime;

/// Contract errors for entity handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("expected {expected} entity, got {got}")]
    KindMismatch {
        expected: EntityKind,
        got: EntityKind,
    },

    #[error("required field absent on {kind} {uuid}: {field}")]
    MissingField {
        kind: EntityKind,
        uuid: Uuid,
        field: &'static str,
    },
}

/// Version metadata shared by every entity kind.
///
/// The previous/next links are identifier relations, never owning
/// references: either side may be unresolved while a fetch or a chain
/// repair is pending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStamp {
    /// Identity of this version (not of the logical record)
    pub uuid: Uuid,

    /// The version this one supersedes, if any
    pub previous_version_id: Option<Uuid>,

    /// The version superseding this one, if any. At most one.
    pub next_version_id: Option<Uuid>,

    /// Start of this version's validity window
    pub effective_date: DateTime<Utc>,

    /// Tombstone marker. Set means logically deleted; the version is
    /// excluded from "current" queries but never removed from the chain.
    pub deleted_date: Option<DateTime<Utc>>,

    /// Wall-clock creation time, used for last-writer-wins resolution
    pub created_at: DateTime<Utc>,

    /// The authoring replica's counter value at last write
    pub logical_clock: LogicalTime,

    /// The clock record that authored this version, once pushed
    pub remote_clock_id: Option<Uuid>,
}

impl VersionStamp {
    /// A fresh stamp for a brand-new version, effective now
    pub fn new() -> Self {
        Self::effective(Utc::now())
    }

    /// A fresh stamp with an explicit validity start
    pub fn effective(effective_date: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            previous_version_id: None,
            next_version_id: None,
            effective_date,
            deleted_date: None,
            created_at: Utc::now(),
            logical_clock: 0,
            remote_clock_id: None,
        }
    }

    /// Whether this version has been tombstoned
    pub fn is_deleted(&self) -> bool {
        self.deleted_date.is_some()
    }

    /// Whether this version's validity window covers `date`.
    ///
    /// Only the start of the window is knowable locally; the end is implied
    /// by the next version's effective date and is checked by the chain.
    pub fn is_effective_at(&self, date: DateTime<Utc>) -> bool {
        self.effective_date <= date
    }
}

impl Default for VersionStamp {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability contract for any record participating in sync.
///
/// The engine never looks past this trait: kind-specific field data flows
/// through opaque payloads, and all ordering, linking, and merge decisions
/// are made on the stamp and the stable logical identifier.
pub trait VersionedEntity {
    /// Which closed kind this entity is
    fn kind(&self) -> EntityKind;

    /// The version metadata
    fn stamp(&self) -> &VersionStamp;

    /// Mutable access for linking, tombstoning, and clock stamping
    fn stamp_mut(&mut self) -> &mut VersionStamp;

    /// Stable identifier of the logical record, shared by every version in
    /// the chain
    fn logical_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_stamp_is_unlinked() {
        let stamp = VersionStamp::new();
        assert!(stamp.previous_version_id.is_none());
        assert!(stamp.next_version_id.is_none());
        assert!(!stamp.is_deleted());
        assert_eq!(stamp.logical_clock, 0);
    }

    #[test]
    fn test_effective_at() {
        let start = Utc::now();
        let stamp = VersionStamp::effective(start);
        assert!(stamp.is_effective_at(start));
        assert!(stamp.is_effective_at(start + chrono::Duration::days(1)));
        assert!(!stamp.is_effective_at(start - chrono::Duration::seconds(1)));
    }
}
