use std::collections::BTreeSet;
use std::fmt;

use hashbrown::{HashMap, HashSet};
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;

use crate::{
    core::indices::{KeySet, SeqOrder},
    mutation::{ID_FIELD, MutationDraft, MutationRecord, ValidationError},
    persist::{PersistError, QueueSink},
    types::{MutationId, MutationSeq, MutationStatus, RecordKey, TimestampMs},
};

/// Failures of queue transitions.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The draft is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No record with this id is queued.
    #[error("unknown mutation {0}")]
    UnknownMutation(MutationId),
    /// A record with this id is already queued.
    #[error("mutation {0} is already queued")]
    DuplicateMutation(MutationId),
    /// The record is not in a status the transition accepts.
    #[error("mutation {id} is {actual:?}, expected {expected}")]
    InvalidTransition {
        /// Affected mutation.
        id: MutationId,
        /// Status found.
        actual: MutationStatus,
        /// Statuses the transition accepts.
        expected: &'static str,
    },
    /// The sink could not store the change.
    #[error("queue persistence failed: {0}")]
    Persist(#[from] PersistError),
}

impl QueueError {
    /// True when another path already settled the mutation.
    pub fn is_settled_elsewhere(&self) -> bool {
        matches!(self, Self::UnknownMutation(_) | Self::InvalidTransition { .. })
    }
}

/// Per-status record counts, e.g. for a sync indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting to be sent, including backed-off records.
    pub pending: usize,
    /// Claimed by a dispatch attempt.
    pub in_flight: usize,
    /// Terminally failed, kept for manual retry.
    pub failed: usize,
}

impl QueueStats {
    /// Records not yet settled with the server.
    pub fn unresolved(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// Ordered store of queued mutations.
///
/// With a sink attached every transition is written through before memory
/// changes; without one the queue is purely in memory.
#[derive(Default)]
pub struct MutationQueue {
    records: HashMap<MutationId, MutationRecord>,
    order: SeqOrder,
    in_flight: KeySet,
    next_seq: MutationSeq,
    sink: Option<Box<dyn QueueSink>>,
}

impl fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationQueue")
            .field("len", &self.records.len())
            .field("in_flight", &self.in_flight.len())
            .field("next_seq", &self.next_seq)
            .field("durable", &self.sink.is_some())
            .finish()
    }
}

impl MutationQueue {
    /// In-memory queue without a sink.
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            ..Self::default()
        }
    }

    /// Loads every stored record from `sink` and writes through to it from now on.
    ///
    /// Records left `in_flight` by a previous run are restored as `pending`.
    pub fn open(sink: Box<dyn QueueSink>) -> Result<Self, QueueError> {
        let stored = sink.load_all()?;
        let mut queue = Self {
            sink: Some(sink),
            ..Self::new()
        };

        let mut recovered = 0usize;
        for mut record in stored {
            match record.status {
                MutationStatus::Done => {
                    queue.erase(&record.id)?;
                    continue;
                }
                MutationStatus::InFlight => {
                    record.status = MutationStatus::Pending;
                    queue.write(&record)?;
                    recovered += 1;
                }
                MutationStatus::Pending | MutationStatus::Failed => {}
            }
            queue.next_seq = queue.next_seq.max(record.seq.saturating_add(1));
            queue.commit(record);
        }

        info!(
            "mutation queue opened with {} records ({} interrupted sends re-queued)",
            queue.records.len(),
            recovered
        );
        Ok(queue)
    }

    /// Validates `draft`, assigns an id and sequence, and queues it as pending.
    pub fn enqueue(&mut self, draft: MutationDraft, now: TimestampMs) -> Result<MutationId, QueueError> {
        let record = MutationRecord::from_draft(draft, now)?;
        self.enqueue_record(record)
    }

    /// Queues a record built with [`MutationRecord::from_draft`], assigning its sequence.
    pub fn enqueue_record(&mut self, mut record: MutationRecord) -> Result<MutationId, QueueError> {
        record.validate()?;
        if self.records.contains_key(&record.id) {
            return Err(QueueError::DuplicateMutation(record.id));
        }

        record.seq = self.next_seq;
        record.status = MutationStatus::Pending;
        self.write(&record)?;
        self.next_seq += 1;

        debug!(
            "enqueued {:?} {}/{} as {}",
            record.operation, record.collection, record.target_id, record.id
        );
        let id = record.id;
        self.commit(record);
        Ok(id)
    }

    /// Claims the oldest dispatchable record of `collection`.
    ///
    /// A record is dispatchable when it is pending, not backing off at `now`,
    /// its target has nothing in flight, and no older pending record for the
    /// same target is still waiting.
    pub fn dequeue_next(
        &mut self,
        collection: &str,
        now: TimestampMs,
    ) -> Result<Option<MutationRecord>, QueueError> {
        let Some(id) = self.next_ready(collection, now) else {
            return Ok(None);
        };

        let mut claimed = self.checked(&id, &[MutationStatus::Pending], "pending")?;
        claimed.status = MutationStatus::InFlight;
        claimed.last_attempt_at = Some(now);
        claimed.next_attempt_at = None;
        let claimed = self.replace(claimed)?;

        debug!(
            "claimed {} for {}/{} (attempt {})",
            claimed.id,
            claimed.collection,
            claimed.target_id,
            claimed.attempt_count + 1
        );
        Ok(Some(claimed))
    }

    /// Removes an acknowledged in-flight record.
    pub fn mark_done(&mut self, id: &MutationId) -> Result<MutationRecord, QueueError> {
        self.mark_done_remapped(id, None)
    }

    /// Acknowledges an in-flight record.
    ///
    /// When `canonical_id` differs from the record's client-generated target,
    /// later records for that target are rewritten to the canonical id first.
    pub fn mark_done_remapped(
        &mut self,
        id: &MutationId,
        canonical_id: Option<&str>,
    ) -> Result<MutationRecord, QueueError> {
        let mut done = self.checked(id, &[MutationStatus::InFlight], "in_flight")?;

        if let Some(canonical) = canonical_id.filter(|c| *c != done.target_id) {
            let moved = self.remap_target(&done.collection, &done.target_id, canonical)?;
            info!(
                "{}/{} is now {} ({} queued mutations rewritten)",
                done.collection, done.target_id, canonical, moved
            );
        }

        self.erase(id)?;
        done.status = MutationStatus::Done;
        Ok(done)
    }

    /// Returns an in-flight record to `pending` after a retryable failure.
    pub fn mark_retry(
        &mut self,
        id: &MutationId,
        error: &str,
        retry_at: TimestampMs,
    ) -> Result<MutationRecord, QueueError> {
        let mut record = self.checked(id, &[MutationStatus::InFlight], "in_flight")?;
        record.status = MutationStatus::Pending;
        record.attempt_count += 1;
        record.next_attempt_at = Some(retry_at);
        record.error_message = Some(error.to_string());
        self.replace(record)
    }

    /// Returns an in-flight record to `pending` without counting an attempt.
    pub fn release(&mut self, id: &MutationId) -> Result<MutationRecord, QueueError> {
        let mut record = self.checked(id, &[MutationStatus::InFlight], "in_flight")?;
        record.status = MutationStatus::Pending;
        record.next_attempt_at = None;
        self.replace(record)
    }

    /// Fails a pending or in-flight record; an in-flight attempt is counted.
    pub fn mark_failed(&mut self, id: &MutationId, reason: &str) -> Result<MutationRecord, QueueError> {
        let mut record = self.checked(
            id,
            &[MutationStatus::Pending, MutationStatus::InFlight],
            "pending or in_flight",
        )?;
        if record.status == MutationStatus::InFlight {
            record.attempt_count += 1;
        }
        record.status = MutationStatus::Failed;
        record.next_attempt_at = None;
        record.error_message = Some(reason.to_string());
        self.replace(record)
    }

    /// Puts a failed record back in line with a fresh attempt budget.
    pub fn retry_failed(&mut self, id: &MutationId) -> Result<MutationRecord, QueueError> {
        let mut record = self.checked(id, &[MutationStatus::Failed], "failed")?;
        record.status = MutationStatus::Pending;
        record.attempt_count = 0;
        record.next_attempt_at = None;
        record.error_message = None;
        self.replace(record)
    }

    /// Re-queues every failed record, optionally of one collection.
    pub fn retry_all_failed(&mut self, collection: Option<&str>) -> Result<Vec<MutationRecord>, QueueError> {
        let ids = self.ids_where(|r| r.status == MutationStatus::Failed && matches_collection(r, collection));
        ids.iter().map(|id| self.retry_failed(id)).collect()
    }

    /// Deletes a failed record.
    pub fn clear_failed(&mut self, id: &MutationId) -> Result<MutationRecord, QueueError> {
        let record = self.checked(id, &[MutationStatus::Failed], "failed")?;
        self.erase(id)?;
        Ok(record)
    }

    /// Drops every record (of one collection, if given) and returns them.
    pub fn clear(&mut self, collection: Option<&str>) -> Result<Vec<MutationRecord>, QueueError> {
        let ids = self.ids_where(|r| matches_collection(r, collection));
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.records.get(&id).cloned() {
                self.erase(&id)?;
                removed.push(record);
            }
        }
        Ok(removed)
    }

    /// Deletes failed records last touched at or before `cutoff`.
    pub fn purge_failed_before(
        &mut self,
        collection: &str,
        cutoff: TimestampMs,
    ) -> Result<Vec<MutationRecord>, QueueError> {
        let ids = self.ids_where(|r| {
            r.collection == collection
                && r.status == MutationStatus::Failed
                && r.last_attempt_at.unwrap_or(r.enqueued_at) <= cutoff
        });
        ids.iter().map(|id| self.clear_failed(id)).collect()
    }

    /// In-flight records of `collection` claimed at or before `cutoff`, with their claim time.
    pub fn stale_in_flight(&self, collection: &str, cutoff: TimestampMs) -> Vec<(MutationId, TimestampMs)> {
        self.ordered()
            .filter(|r| r.collection == collection && r.status == MutationStatus::InFlight)
            .filter_map(|r| {
                let since = r.last_attempt_at.unwrap_or(r.enqueued_at);
                (since <= cutoff).then_some((r.id, since))
            })
            .collect()
    }

    /// Pending and in-flight records in enqueue order.
    pub fn list_pending(&self, collection: Option<&str>) -> Vec<MutationRecord> {
        self.ordered()
            .filter(|r| r.is_unresolved() && matches_collection(r, collection))
            .cloned()
            .collect()
    }

    /// Failed records in enqueue order.
    pub fn list_failed(&self, collection: Option<&str>) -> Vec<MutationRecord> {
        self.ordered()
            .filter(|r| r.status == MutationStatus::Failed && matches_collection(r, collection))
            .cloned()
            .collect()
    }

    /// Looks up a record by id.
    pub fn get(&self, id: &MutationId) -> Option<&MutationRecord> {
        self.records.get(id)
    }

    /// True when `key` has a pending or in-flight mutation.
    pub fn has_unresolved(&self, key: &RecordKey) -> bool {
        self.in_flight.contains(key)
            || self.records.values().any(|r| {
                r.status == MutationStatus::Pending
                    && r.collection == key.collection
                    && r.target_id == key.target_id
            })
    }

    /// Whether `collection` has pending or in-flight records.
    pub fn has_work(&self, collection: &str) -> bool {
        self.records
            .values()
            .any(|r| r.collection == collection && r.is_unresolved())
    }

    /// Collections holding pending or in-flight records, sorted by name.
    pub fn collections_with_work(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.is_unresolved())
            .map(|r| r.collection.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Collections holding in-flight records, sorted by name.
    pub fn collections_in_flight(&self) -> Vec<String> {
        self.in_flight
            .iter()
            .map(|k| k.collection.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Earliest backoff deadline among pending records of `collection`.
    pub fn next_retry_at(&self, collection: &str) -> Option<TimestampMs> {
        self.records
            .values()
            .filter(|r| r.collection == collection && r.status == MutationStatus::Pending)
            .filter_map(|r| r.next_attempt_at)
            .min()
    }

    /// Targets with a record in flight.
    pub fn in_flight_keys(&self) -> Vec<RecordKey> {
        self.in_flight.iter().cloned().collect()
    }

    /// Counts per status, optionally of one collection.
    pub fn stats(&self, collection: Option<&str>) -> QueueStats {
        let mut stats = QueueStats::default();
        for record in self.records.values().filter(|r| matches_collection(r, collection)) {
            match record.status {
                MutationStatus::Pending => stats.pending += 1,
                MutationStatus::InFlight => stats.in_flight += 1,
                MutationStatus::Failed => stats.failed += 1,
                MutationStatus::Done => {}
            }
        }
        stats
    }

    /// Queued records of every status.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record is queued.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flushes the sink, if any.
    pub fn flush(&mut self) -> Result<(), QueueError> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    fn next_ready(&self, collection: &str, now: TimestampMs) -> Option<MutationId> {
        let mut blocked: HashSet<&str> = self
            .in_flight
            .iter()
            .filter(|k| k.collection == collection)
            .map(|k| k.target_id.as_str())
            .collect();

        for record in self.ordered() {
            if record.collection != collection || record.status != MutationStatus::Pending {
                continue;
            }
            if blocked.contains(record.target_id.as_str()) {
                continue;
            }
            if record.is_ready(now) {
                return Some(record.id);
            }
            blocked.insert(record.target_id.as_str());
        }
        None
    }

    fn remap_target(&mut self, collection: &str, from: &str, to: &str) -> Result<usize, QueueError> {
        let ids = self.ids_where(|r| {
            r.collection == collection && r.target_id == from && r.status != MutationStatus::InFlight
        });
        for id in &ids {
            let Some(mut record) = self.records.get(id).cloned() else {
                continue;
            };
            record.target_id = to.to_string();
            if let Some(fields) = record.payload.as_object_mut() {
                if fields.contains_key(ID_FIELD) {
                    fields.insert(ID_FIELD.to_string(), Value::String(to.to_string()));
                }
            }
            self.replace(record)?;
        }
        Ok(ids.len())
    }

    fn ordered(&self) -> impl Iterator<Item = &MutationRecord> {
        self.order.values().filter_map(|id| self.records.get(id))
    }

    fn ids_where(&self, pred: impl Fn(&MutationRecord) -> bool) -> Vec<MutationId> {
        self.ordered().filter(|r| pred(r)).map(|r| r.id).collect()
    }

    fn checked(
        &self,
        id: &MutationId,
        allowed: &[MutationStatus],
        expected: &'static str,
    ) -> Result<MutationRecord, QueueError> {
        let record = self.records.get(id).ok_or(QueueError::UnknownMutation(*id))?;
        if !allowed.contains(&record.status) {
            return Err(QueueError::InvalidTransition {
                id: *id,
                actual: record.status,
                expected,
            });
        }
        Ok(record.clone())
    }

    fn replace(&mut self, record: MutationRecord) -> Result<MutationRecord, QueueError> {
        self.write(&record)?;
        self.commit(record.clone());
        Ok(record)
    }

    fn write(&mut self, record: &MutationRecord) -> Result<(), QueueError> {
        if let Some(sink) = self.sink.as_mut() {
            sink.upsert(record)?;
        }
        Ok(())
    }

    fn erase(&mut self, id: &MutationId) -> Result<(), QueueError> {
        if let Some(sink) = self.sink.as_mut() {
            sink.remove(id)?;
        }
        if let Some(prev) = self.records.remove(id) {
            self.unindex(&prev);
        }
        Ok(())
    }

    fn commit(&mut self, record: MutationRecord) {
        if let Some(prev) = self.records.get(&record.id).cloned() {
            self.unindex(&prev);
        }
        if record.status == MutationStatus::InFlight {
            self.in_flight.insert(record.key());
        }
        self.order.insert(record.seq, record.id);
        self.records.insert(record.id, record);
    }

    fn unindex(&mut self, record: &MutationRecord) {
        if record.status == MutationStatus::InFlight {
            self.in_flight.remove(&record.key());
        }
        self.order.remove(&record.seq);
    }
}

fn matches_collection(record: &MutationRecord, collection: Option<&str>) -> bool {
    collection.is_none_or(|c| record.collection == c)
}
