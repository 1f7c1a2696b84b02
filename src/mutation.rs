//! Mutation model, validation, payload application, and persistence envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{MutationId, MutationSeq, MutationStatus, Operation, RecordKey, TimestampMs};

/// Version number for serialized [`StoredMutationEnvelope`] payloads.
pub const MUTATION_FORMAT_VERSION: u16 = 1;

/// Field that carries a record's identity inside payloads and server records.
pub const ID_FIELD: &str = "id";

/// Reasons a mutation is rejected before it reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Collection name is absent or blank.
    #[error("mutation has no collection")]
    MissingCollection,
    /// Operation is absent.
    #[error("mutation has no operation")]
    MissingOperation,
    /// Target id is absent or blank.
    #[error("mutation has no target id")]
    MissingTargetId,
    /// Operation string is not create/update/delete.
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
    /// Create and update payloads must be JSON objects.
    #[error("{operation:?} payload must be a JSON object")]
    PayloadNotObject {
        /// Operation whose payload was malformed.
        operation: Operation,
    },
}

/// Caller-supplied write intent, before it is assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDraft {
    /// Target collection.
    pub collection: String,
    /// Write intent.
    pub operation: Operation,
    /// Affected record id; may be client-generated for creates.
    pub target_id: String,
    /// Record fields to write.
    pub payload: Value,
}

impl MutationDraft {
    /// Builds a draft from its parts.
    pub fn new(
        collection: impl Into<String>,
        operation: Operation,
        target_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            collection: collection.into(),
            operation,
            target_id: target_id.into(),
            payload,
        }
    }

    /// Draft that inserts `payload` as a new record.
    pub fn create(collection: impl Into<String>, target_id: impl Into<String>, payload: Value) -> Self {
        Self::new(collection, Operation::Create, target_id, payload)
    }

    /// Draft that merges `payload` into an existing record.
    pub fn update(collection: impl Into<String>, target_id: impl Into<String>, payload: Value) -> Self {
        Self::new(collection, Operation::Update, target_id, payload)
    }

    /// Draft that removes a record.
    pub fn delete(collection: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self::new(collection, Operation::Delete, target_id, Value::Null)
    }

    /// Parses an untyped draft as produced by a UI bridge.
    ///
    /// Accepts `collection` (or `table`), `operation` (`create`/`insert`,
    /// `update`, `delete`), `targetId` (or `recordId`, falling back to the
    /// payload's `id`) and `payload` (or `data`).
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let collection = value
            .get("collection")
            .or_else(|| value.get("table"))
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingCollection)?;

        let operation = match value.get("operation").and_then(Value::as_str) {
            None => return Err(ValidationError::MissingOperation),
            Some("create") | Some("insert") => Operation::Create,
            Some("update") => Operation::Update,
            Some("delete") => Operation::Delete,
            Some(other) => return Err(ValidationError::UnknownOperation(other.to_string())),
        };

        let payload = value
            .get("payload")
            .or_else(|| value.get("data"))
            .cloned()
            .unwrap_or(Value::Null);

        let target_id = value
            .get("targetId")
            .or_else(|| value.get("recordId"))
            .and_then(id_string)
            .or_else(|| record_id(&payload))
            .ok_or(ValidationError::MissingTargetId)?;

        let draft = Self::new(collection, operation, target_id, payload);
        draft.validate()?;
        Ok(draft)
    }

    /// Checks the fields the queue relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_parts(&self.collection, self.operation, &self.target_id, &self.payload)
    }

    /// Record identity targeted by this draft.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection.clone(), self.target_id.clone())
    }
}

/// One queued write and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    /// Unique client-generated id.
    pub id: MutationId,
    /// Enqueue order across the whole queue.
    pub seq: MutationSeq,
    /// Target collection.
    pub collection: String,
    /// Write intent.
    pub operation: Operation,
    /// Fields to write; `{"id": target}` for deletes.
    pub payload: Value,
    /// Affected record id.
    pub target_id: String,
    /// Lifecycle status.
    pub status: MutationStatus,
    /// When the mutation was enqueued.
    pub enqueued_at: TimestampMs,
    /// When the last dispatch attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<TimestampMs>,
    /// Earliest time a backed-off record may be dispatched again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<TimestampMs>,
    /// Attempts that completed without success.
    pub attempt_count: u32,
    /// Last failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl MutationRecord {
    /// Validates `draft` and materializes a pending record with a fresh id.
    ///
    /// `seq` is left at zero; the queue assigns it on enqueue.
    pub fn from_draft(draft: MutationDraft, now: TimestampMs) -> Result<Self, ValidationError> {
        draft.validate()?;
        let MutationDraft {
            collection,
            operation,
            target_id,
            payload,
        } = draft;

        let payload = match operation {
            Operation::Delete => with_id(Value::Object(Map::new()), &target_id),
            Operation::Create => with_id(payload, &target_id),
            Operation::Update => payload,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            seq: 0,
            collection,
            operation,
            payload,
            target_id,
            status: MutationStatus::Pending,
            enqueued_at: now,
            last_attempt_at: None,
            next_attempt_at: None,
            attempt_count: 0,
            error_message: None,
        })
    }

    /// Record identity targeted by this mutation.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection.clone(), self.target_id.clone())
    }

    /// Re-checks the fields the queue relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_parts(&self.collection, self.operation, &self.target_id, &self.payload)
    }

    /// True while the mutation still awaits an outcome.
    pub fn is_unresolved(&self) -> bool {
        matches!(self.status, MutationStatus::Pending | MutationStatus::InFlight)
    }

    /// True when the record is pending and not backing off at `now`.
    pub fn is_ready(&self, now: TimestampMs) -> bool {
        self.status == MutationStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Versioned wrapper for stable on-disk decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMutationEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped record.
    pub record: MutationRecord,
}

impl StoredMutationEnvelope {
    /// Constructs an envelope using [`MUTATION_FORMAT_VERSION`].
    pub fn new(record: MutationRecord) -> Self {
        Self {
            format_version: MUTATION_FORMAT_VERSION,
            record,
        }
    }
}

/// Applies one mutation to a record value and returns the result.
///
/// Creates replace, updates merge top-level fields (last writer wins), and
/// deletes yield `None`.
pub fn apply_payload(operation: Operation, current: Option<&Value>, payload: &Value) -> Option<Value> {
    match operation {
        Operation::Create => Some(payload.clone()),
        Operation::Update => match (current, payload) {
            (Some(Value::Object(existing)), Value::Object(fields)) => {
                let mut merged = existing.clone();
                for (field, value) in fields {
                    merged.insert(field.clone(), value.clone());
                }
                Some(Value::Object(merged))
            }
            _ => Some(payload.clone()),
        },
        Operation::Delete => None,
    }
}

/// Extracts the `id` of a record as a string.
pub fn record_id(record: &Value) -> Option<String> {
    record.get(ID_FIELD).and_then(id_string)
}

fn validate_parts(
    collection: &str,
    operation: Operation,
    target_id: &str,
    payload: &Value,
) -> Result<(), ValidationError> {
    if collection.trim().is_empty() {
        return Err(ValidationError::MissingCollection);
    }
    if target_id.trim().is_empty() {
        return Err(ValidationError::MissingTargetId);
    }
    match operation {
        Operation::Create | Operation::Update if !payload.is_object() => {
            Err(ValidationError::PayloadNotObject { operation })
        }
        _ => Ok(()),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn with_id(payload: Value, target_id: &str) -> Value {
    match payload {
        Value::Object(mut fields) => {
            fields
                .entry(ID_FIELD.to_string())
                .or_insert_with(|| Value::String(target_id.to_string()));
            Value::Object(fields)
        }
        other => other,
    }
}
