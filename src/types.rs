//! Shared identifiers, status enums, and the wall clock.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-generated mutation identifier.
pub type MutationId = Uuid;
/// Monotonic enqueue sequence number.
pub type MutationSeq = u64;
/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// Identity of one record: collection name plus record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Collection name, e.g. `birds`.
    pub collection: String,
    /// Record id within the collection.
    pub target_id: String,
}

impl RecordKey {
    /// Builds a key from any string-like parts.
    pub fn new(collection: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            target_id: target_id.into(),
        }
    }
}

/// Write intent carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Insert a new record.
    Create,
    /// Merge fields into an existing record.
    Update,
    /// Remove a record.
    Delete,
}

/// Queue lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be sent.
    Pending,
    /// Claimed by a dispatch attempt.
    InFlight,
    /// Terminally failed; kept for manual retry.
    Failed,
    /// Acknowledged by the remote store.
    Done,
}

/// Where the visible value of a local record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Matches the last known server state.
    Confirmed,
    /// Reflects at least one unconfirmed local mutation.
    Optimistic,
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
