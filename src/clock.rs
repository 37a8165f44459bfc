//! Causality tracking via vector clocks
//!
//! A VectorClock records, per replica, the highest logical counter this
//! replica has incorporated. Comparing clocks tells us whether one view
//! "happened before" another or whether the two are concurrent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a replica participating in synchronization
pub type ReplicaId = Uuid;

/// Logical counter value within a replica's revision stream
pub type LogicalTime = u64;

/// A VectorClock captures a replica's causal knowledge.
///
/// It maps each known replica to the highest counter value incorporated from
/// that replica. Counters only ever increase; comparison is a partial order,
/// and two clocks where neither dominates are concurrent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    /// Map from replica ID to the highest counter seen from that replica
    processes: BTreeMap<ReplicaId, LogicalTime>,
}

/// Transport shape of a clock: `{"processes":[{"id":"...","clock":n}]}`.
#[derive(Serialize, Deserialize)]
struct WireClock {
    processes: Vec<WireProcess>,
}

#[derive(Serialize, Deserialize)]
struct WireProcess {
    id: ReplicaId,
    clock: LogicalTime,
}

impl VectorClock {
    /// Create an empty clock (knows nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock for a newly introduced replica: a single zeroed entry
    pub fn for_replica(replica: ReplicaId) -> Self {
        let mut clock = Self::new();
        clock.processes.insert(replica, 0);
        clock
    }

    /// Get the counter for a replica (0 if never seen)
    pub fn clock_for(&self, replica: &ReplicaId) -> LogicalTime {
        self.processes.get(replica).copied().unwrap_or(0)
    }

    /// Advance the counter for a replica. Creates the entry at 1 if absent.
    pub fn increment(&mut self, replica: ReplicaId) -> LogicalTime {
        let counter = self.processes.entry(replica).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Record having incorporated a counter value from a replica
    pub fn observe(&mut self, replica: ReplicaId, value: LogicalTime) {
        let current = self.processes.entry(replica).or_insert(0);
        if value > *current {
            *current = value;
        }
    }

    /// Merge another clock into this one (per-replica max, union of keys)
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, value) in &other.processes {
            self.observe(*replica, *value);
        }
    }

    /// Check whether every counter in `other` is at or below ours.
    ///
    /// Unlike [`dominates`](Self::dominates) this is not strict: equal
    /// clocks cover each other. "Other has advanced past us" is exactly
    /// `!self.covers(other)`.
    pub fn covers(&self, other: &VectorClock) -> bool {
        other
            .processes
            .iter()
            .all(|(r, v)| self.clock_for(r) >= *v)
    }

    /// Check whether this clock dominates another: every counter in `other`
    /// is covered and at least one of ours is strictly greater.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        let strictly_ahead = self
            .processes
            .iter()
            .any(|(r, v)| *v > other.clock_for(r));
        self.covers(other) && strictly_ahead
    }

    /// Check whether two clocks are concurrent (neither dominates)
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self != other && !self.dominates(other) && !other.dominates(self)
    }

    /// All replicas this clock knows about
    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.processes.keys()
    }

    /// Serialize to the transport string format
    pub fn encode(&self) -> String {
        let wire = WireClock {
            processes: self
                .processes
                .iter()
                .map(|(id, clock)| WireProcess {
                    id: *id,
                    clock: *clock,
                })
                .collect(),
        };
        // BTreeMap iteration order makes the output deterministic; a Vec of
        // uuid/int pairs cannot fail to serialize.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Parse the transport string format
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        let wire: WireClock = serde_json::from_str(payload)?;
        let mut clock = Self::new();
        for process in wire.processes {
            clock.observe(process.id, process.clock);
        }
        Ok(clock)
    }

    /// Parse the transport format, falling back to the empty clock.
    ///
    /// A malformed payload means "no prior knowledge": the caller replays
    /// from counter zero rather than failing the cycle.
    pub fn decode_or_empty(payload: &str) -> Self {
        match Self::decode(payload) {
            Ok(clock) => clock,
            Err(e) => {
                log::warn!("malformed vector clock payload, treating as empty: {}", e);
                Self::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u8) -> ReplicaId {
        Uuid::from_u128(n as u128)
    }

    #[test]
    fn test_increment_and_clock_for() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.clock_for(&replica(1)), 0);

        assert_eq!(clock.increment(replica(1)), 1);
        assert_eq!(clock.clock_for(&replica(1)), 1);

        assert_eq!(clock.increment(replica(1)), 2);
        assert_eq!(clock.clock_for(&replica(1)), 2);

        // Other replicas untouched
        assert_eq!(clock.clock_for(&replica(2)), 0);
    }

    #[test]
    fn test_observe_never_goes_backwards() {
        let mut clock = VectorClock::new();
        clock.observe(replica(1), 5);
        clock.observe(replica(1), 3);
        assert_eq!(clock.clock_for(&replica(1)), 5);
    }

    #[test]
    fn test_dominates() {
        let mut a = VectorClock::new();
        a.observe(replica(1), 5);
        a.observe(replica(2), 3);

        let mut b = VectorClock::new();
        b.observe(replica(1), 3);
        b.observe(replica(2), 2);

        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        // A clock never dominates itself (no strictly greater component)
        assert!(!a.dominates(&a.clone()));
    }

    #[test]
    fn test_covers_is_not_strict() {
        let mut a = VectorClock::new();
        a.observe(replica(1), 2);

        let mut zeroed = a.clone();
        zeroed.observe(replica(2), 0);

        // Equal-modulo-zero-entries clocks cover each other without
        // dominating
        assert!(a.covers(&zeroed));
        assert!(zeroed.covers(&a));
        assert!(!a.dominates(&zeroed));

        let mut ahead = a.clone();
        ahead.observe(replica(2), 1);
        assert!(!a.covers(&ahead));
        assert!(ahead.dominates(&a));
    }

    #[test]
    fn test_merge_dominates_both_inputs() {
        let mut a = VectorClock::new();
        a.observe(replica(1), 5);
        a.observe(replica(2), 1);

        let mut b = VectorClock::new();
        b.observe(replica(1), 2);
        b.observe(replica(2), 4);

        let mut merged = a.clone();
        merged.merge(&b);

        assert!(merged.dominates(&a));
        assert!(merged.dominates(&b));
        assert_eq!(merged.clock_for(&replica(1)), 5);
        assert_eq!(merged.clock_for(&replica(2)), 4);
    }

    #[test]
    fn test_concurrent() {
        let mut a = VectorClock::new();
        a.observe(replica(1), 5);
        a.observe(replica(2), 2);

        let mut b = VectorClock::new();
        b.observe(replica(1), 3);
        b.observe(replica(2), 4);

        // Neither dominates: a ahead on replica 1, b ahead on replica 2
        assert!(a.is_concurrent_with(&b));
        assert!(b.is_concurrent_with(&a));
    }

    #[test]
    fn test_for_replica_starts_zeroed() {
        let clock = VectorClock::for_replica(replica(7));
        assert_eq!(clock.clock_for(&replica(7)), 0);
        assert_eq!(clock.replicas().count(), 1);
    }

    #[test]
    fn test_wire_format() {
        let mut clock = VectorClock::new();
        clock.observe(replica(1), 4);

        let payload = clock.encode();
        assert!(payload.contains("\"processes\""));
        assert!(payload.contains("\"clock\":4"));

        let decoded = VectorClock::decode(&payload).unwrap();
        assert_eq!(decoded, clock);
    }

    #[test]
    fn test_decode_failure_is_empty_knowledge() {
        assert!(VectorClock::decode("not json at all").is_err());
        let fallback = VectorClock::decode_or_empty("{\"wrong\":true}");
        assert_eq!(fallback, VectorClock::new());
    }
}
