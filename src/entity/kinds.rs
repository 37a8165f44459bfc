//! The closed set of record kinds
//!
//! Each kind is a flat struct embedding a [`VersionStamp`]. The engine
//! dispatches on [`EntityKind`] through the [`EntityPayload`] union and the
//! [`VersionedEntity`] trait; it never interprets kind-specific fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{EntityError, VersionStamp, VersionedEntity};

/// The closed set of record kinds participating in sync
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Patient,
    CarePlan,
    Contact,
    Task,
    Outcome,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Patient => "patient",
            EntityKind::CarePlan => "carePlan",
            EntityKind::Contact => "contact",
            EntityKind::Task => "task",
            EntityKind::Outcome => "outcome",
        };
        write!(f, "{}", name)
    }
}

/// A person receiving care
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub stamp: VersionStamp,
    /// Stable user-facing identifier shared across versions
    pub id: String,
    pub given_name: String,
    pub family_name: String,
    pub birth_date: Option<DateTime<Utc>>,
    pub sex: Option<String>,
    pub allergies: Vec<String>,
}

/// A set of tasks organized around a treatment goal
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CarePlan {
    pub stamp: VersionStamp,
    pub id: String,
    pub title: String,
    /// The patient this plan belongs to, by version uuid
    pub patient_id: Option<Uuid>,
}

/// A care provider or personal contact
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub stamp: VersionStamp,
    pub id: String,
    pub given_name: String,
    pub family_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub organization: Option<String>,
    pub care_plan_id: Option<Uuid>,
}

/// A recurring or one-off action the patient is asked to perform
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub stamp: VersionStamp,
    pub id: String,
    pub title: String,
    pub instructions: Option<String>,
    /// Whether adherence to this task should influence care metrics
    pub impacts_adherence: bool,
    pub care_plan_id: Option<Uuid>,
}

/// A single measured value attached to an outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeValue {
    pub units: Option<String>,
    pub value: serde_json::Value,
}

/// The result of completing (or skipping) one task occurrence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub stamp: VersionStamp,
    pub id: String,
    /// The task version this outcome responds to
    pub task_id: Uuid,
    /// Index of the task occurrence this outcome belongs to
    pub occurrence_index: u64,
    pub values: Vec<OutcomeValue>,
}

macro_rules! impl_versioned {
    ($type:ty, $kind:expr) => {
        impl VersionedEntity for $type {
            fn kind(&self) -> EntityKind {
                $kind
            }

            fn stamp(&self) -> &VersionStamp {
                &self.stamp
            }

            fn stamp_mut(&mut self) -> &mut VersionStamp {
                &mut self.stamp
            }

            fn logical_id(&self) -> &str {
                &self.id
            }
        }
    };
}

impl_versioned!(Patient, EntityKind::Patient);
impl_versioned!(CarePlan, EntityKind::CarePlan);
impl_versioned!(Contact, EntityKind::Contact);
impl_versioned!(Task, EntityKind::Task);
impl_versioned!(Outcome, EntityKind::Outcome);

/// Tagged union over the closed kind set.
///
/// This is the unit the engine moves around: batches carry payloads, chains
/// index them, and kind-specific handlers narrow them back down through the
/// `as_*` accessors, which surface contract errors instead of panicking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EntityPayload {
    Patient(Patient),
    CarePlan(CarePlan),
    Contact(Contact),
    Task(Task),
    Outcome(Outcome),
}

impl EntityPayload {
    fn mismatch(&self, expected: EntityKind) -> EntityError {
        EntityError::KindMismatch {
            expected,
            got: self.kind(),
        }
    }

    pub fn as_patient(&self) -> Result<&Patient, EntityError> {
        match self {
            EntityPayload::Patient(p) => Ok(p),
            other => Err(other.mismatch(EntityKind::Patient)),
        }
    }

    pub fn as_care_plan(&self) -> Result<&CarePlan, EntityError> {
        match self {
            EntityPayload::CarePlan(p) => Ok(p),
            other => Err(other.mismatch(EntityKind::CarePlan)),
        }
    }

    pub fn as_contact(&self) -> Result<&Contact, EntityError> {
        match self {
            EntityPayload::Contact(c) => Ok(c),
            other => Err(other.mismatch(EntityKind::Contact)),
        }
    }

    pub fn as_task(&self) -> Result<&Task, EntityError> {
        match self {
            EntityPayload::Task(t) => Ok(t),
            other => Err(other.mismatch(EntityKind::Task)),
        }
    }

    pub fn as_outcome(&self) -> Result<&Outcome, EntityError> {
        match self {
            EntityPayload::Outcome(o) => Ok(o),
            other => Err(other.mismatch(EntityKind::Outcome)),
        }
    }
}

impl VersionedEntity for EntityPayload {
    fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::Patient(_) => EntityKind::Patient,
            EntityPayload::CarePlan(_) => EntityKind::CarePlan,
            EntityPayload::Contact(_) => EntityKind::Contact,
            EntityPayload::Task(_) => EntityKind::Task,
            EntityPayload::Outcome(_) => EntityKind::Outcome,
        }
    }

    fn stamp(&self) -> &VersionStamp {
        match self {
            EntityPayload::Patient(p) => &p.stamp,
            EntityPayload::CarePlan(p) => &p.stamp,
            EntityPayload::Contact(c) => &c.stamp,
            EntityPayload::Task(t) => &t.stamp,
            EntityPayload::Outcome(o) => &o.stamp,
        }
    }

    fn stamp_mut(&mut self) -> &mut VersionStamp {
        match self {
            EntityPayload::Patient(p) => &mut p.stamp,
            EntityPayload::CarePlan(p) => &mut p.stamp,
            EntityPayload::Contact(c) => &mut c.stamp,
            EntityPayload::Task(t) => &mut t.stamp,
            EntityPayload::Outcome(o) => &mut o.stamp,
        }
    }

    fn logical_id(&self) -> &str {
        match self {
            EntityPayload::Patient(p) => &p.id,
            EntityPayload::CarePlan(p) => &p.id,
            EntityPayload::Contact(c) => &c.id,
            EntityPayload::Task(t) => &t.id,
            EntityPayload::Outcome(o) => &o.id,
        }
    }
}

impl Patient {
    pub fn new(id: impl Into<String>, given_name: impl Into<String>, family_name: impl Into<String>) -> Self {
        Self {
            stamp: VersionStamp::new(),
            id: id.into(),
            given_name: given_name.into(),
            family_name: family_name.into(),
            birth_date: None,
            sex: None,
            allergies: Vec::new(),
        }
    }
}

impl CarePlan {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            stamp: VersionStamp::new(),
            id: id.into(),
            title: title.into(),
            patient_id: None,
        }
    }
}

impl Contact {
    pub fn new(id: impl Into<String>, given_name: impl Into<String>, family_name: impl Into<String>) -> Self {
        Self {
            stamp: VersionStamp::new(),
            id: id.into(),
            given_name: given_name.into(),
            family_name: family_name.into(),
            email: None,
            phone: None,
            organization: None,
            care_plan_id: None,
        }
    }
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            stamp: VersionStamp::new(),
            id: id.into(),
            title: title.into(),
            instructions: None,
            impacts_adherence: true,
            care_plan_id: None,
        }
    }
}

impl Outcome {
    pub fn new(id: impl Into<String>, task_id: Uuid, occurrence_index: u64) -> Self {
        Self {
            stamp: VersionStamp::new(),
            id: id.into(),
            task_id,
            occurrence_index,
            values: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dispatch() {
        let payload = EntityPayload::Task(Task::new("doxylamine", "Take Doxylamine"));
        assert_eq!(payload.kind(), EntityKind::Task);
        assert_eq!(payload.logical_id(), "doxylamine");
        assert!(payload.as_task().is_ok());
    }

    #[test]
    fn test_kind_mismatch_is_contract_error() {
        let payload = EntityPayload::Patient(Patient::new("alice", "Alice", "Apple"));
        let err = payload.as_outcome().unwrap_err();
        assert_eq!(
            err,
            EntityError::KindMismatch {
                expected: EntityKind::Outcome,
                got: EntityKind::Patient,
            }
        );
    }

    #[test]
    fn test_payload_serde_tag() {
        let payload = EntityPayload::CarePlan(CarePlan::new("recovery", "Knee Recovery"));
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"carePlan\""));

        let back: EntityPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
