//! Events surfaced to the UI.

use std::fmt;

use serde_json::Value;

use crate::types::{MutationId, Operation, TimestampMs};

/// Why a mutation failed terminally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Every allowed attempt failed with a retryable error.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },
    /// The server refused the write.
    Rejected(String),
    /// The write conflicts with newer server state.
    Conflict(String),
    /// The mutation stayed in flight past the stale threshold.
    StuckJob {
        /// How long it had been in flight.
        in_flight_ms: u64,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted { attempts, last_error } => {
                write!(f, "gave up after {attempts} attempts: {last_error}")
            }
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::StuckJob { in_flight_ms } => write!(f, "stuck in flight for {in_flight_ms} ms"),
        }
    }
}

/// Events broadcast by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A local edit was applied and queued.
    Enqueued {
        /// Queued mutation.
        id: MutationId,
        /// Target collection.
        collection: String,
        /// Target record.
        target_id: String,
        /// Write intent.
        operation: Operation,
    },
    /// The server acknowledged a mutation.
    Confirmed {
        /// Acknowledged mutation.
        id: MutationId,
        /// Target collection.
        collection: String,
        /// Canonical record id.
        target_id: String,
    },
    /// A send failed and will be retried.
    RetryScheduled {
        /// Mutation to retry.
        id: MutationId,
        /// Failed attempts so far.
        attempt: u32,
        /// Earliest next attempt.
        retry_at: TimestampMs,
        /// Error of the failed attempt.
        error: String,
    },
    /// A mutation failed for good and its optimistic edit was rolled back.
    MutationFailed {
        /// Failed mutation.
        id: MutationId,
        /// Target collection.
        collection: String,
        /// Target record.
        target_id: String,
        /// Terminal cause.
        reason: FailureReason,
    },
    /// A collection has no pending or in-flight mutations left.
    QueueDrained {
        /// Drained collection.
        collection: String,
    },
    /// Connectivity flipped.
    ConnectivityChanged {
        /// New state.
        online: bool,
    },
    /// Authoritative server state was applied locally.
    Reconciled {
        /// Refreshed collection.
        collection: String,
        /// Refreshed record.
        target_id: String,
        /// New value; `None` when the record is gone.
        value: Option<Value>,
    },
    /// Server state arrived for a record with unresolved local edits and was held back.
    ReconcileDeferred {
        /// Refreshed collection.
        collection: String,
        /// Refreshed record.
        target_id: String,
    },
}
