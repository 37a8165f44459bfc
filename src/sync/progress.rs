//! Progress events emitted over the coordinator's broadcast channel

use std::time::Duration;

/// Fractional progress and lifecycle events for one synchronization cycle.
///
/// Fractions are in [0, 1]: per pulled batch while pulling, per pending
/// entity while pushing.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgress {
    Started,
    Pulling { fraction: f64 },
    Pushing { fraction: f64 },
    Completed,
    Failed { retryable: bool },
    /// A stale-vector or contended cycle asked for another attempt after a
    /// randomized delay (jitter avoids thundering-herd retries)
    RetryScheduled { delay: Duration },
    /// The scheduled delay elapsed; the caller may re-invoke synchronize
    RetryReady,
}
