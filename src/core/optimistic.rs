use hashbrown::HashMap;
use log::debug;
use serde_json::Value;

use crate::{
    mutation::{MutationRecord, apply_payload},
    types::{MutationId, Operation, Provenance, RecordKey},
};

/// One unconfirmed local edit stacked on a record.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticLayer {
    /// Mutation that produced the edit.
    pub mutation_id: MutationId,
    /// Write intent of the edit.
    pub operation: Operation,
    /// Fields written by the edit.
    pub payload: Value,
    /// Visible value just before the edit was applied.
    pub prior: Option<Value>,
}

/// UI-visible projection of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecordState {
    /// Current value; `None` when the record is (optimistically) deleted.
    pub value: Option<Value>,
    /// Whether the value is confirmed by the server.
    pub provenance: Provenance,
    /// Unconfirmed edits stacked on the confirmed value.
    pub pending_layers: usize,
}

/// What a reconciliation did to a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The authoritative value replaced the local one.
    Replaced,
    /// The record no longer exists locally or remotely.
    Removed,
    /// An optimistic value with an unresolved mutation was kept visible.
    Deferred,
}

#[derive(Debug, Default)]
struct TargetState {
    confirmed: Option<Value>,
    visible: Option<Value>,
    layers: Vec<OptimisticLayer>,
}

impl TargetState {
    fn recompute(&mut self) {
        self.visible = self.layers.iter().fold(self.confirmed.clone(), |acc, layer| {
            apply_payload(layer.operation, acc.as_ref(), &layer.payload)
        });
    }

    fn remove_layer(&mut self, mutation_id: &MutationId) -> Option<OptimisticLayer> {
        let idx = self.layers.iter().position(|l| l.mutation_id == *mutation_id)?;
        Some(self.layers.remove(idx))
    }

    fn snapshot(&self) -> LocalRecordState {
        LocalRecordState {
            value: self.visible.clone(),
            provenance: if self.layers.is_empty() {
                Provenance::Confirmed
            } else {
                Provenance::Optimistic
            },
            pending_layers: self.layers.len(),
        }
    }

    fn is_vacant(&self) -> bool {
        self.layers.is_empty() && self.confirmed.is_none()
    }
}

/// Sole writer of [`LocalRecordState`].
///
/// Each record keeps its last confirmed value plus an ordered stack of
/// optimistic layers; the visible value is the confirmed value with every
/// layer re-applied in order. Removing any layer (confirm or rollback)
/// recomputes the visible value, so a failed older edit never discards
/// newer ones.
#[derive(Debug, Default)]
pub struct OptimisticApplier {
    records: HashMap<RecordKey, TargetState>,
}

impl OptimisticApplier {
    /// Empty applier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `mutation` on top of the visible value and returns the prior value.
    ///
    /// Re-applying an already stacked mutation changes nothing.
    pub fn apply_optimistic(&mut self, mutation: &MutationRecord) -> Option<Value> {
        let state = self.records.entry(mutation.key()).or_default();
        if state.layers.iter().any(|l| l.mutation_id == mutation.id) {
            return state.layers.iter().rev().find(|l| l.mutation_id == mutation.id).and_then(|l| l.prior.clone());
        }

        let prior = state.visible.clone();
        state.visible = apply_payload(mutation.operation, prior.as_ref(), &mutation.payload);
        state.layers.push(OptimisticLayer {
            mutation_id: mutation.id,
            operation: mutation.operation,
            payload: mutation.payload.clone(),
            prior: prior.clone(),
        });
        prior
    }

    /// Drops the layer of an acknowledged mutation and adopts the server's echo.
    ///
    /// `authoritative` is the record returned by the server, or `None` for a
    /// delete. Returns whether the layer was found.
    pub fn confirm(&mut self, key: &RecordKey, mutation_id: &MutationId, authoritative: Option<Value>) -> bool {
        let state = self.records.entry(key.clone()).or_default();
        let found = state.remove_layer(mutation_id).is_some();
        state.confirmed = authoritative;
        state.recompute();
        self.prune(key);
        found
    }

    /// Removes the layer of a terminally failed mutation and returns the new visible value.
    pub fn rollback(&mut self, key: &RecordKey, mutation_id: &MutationId) -> Option<Value> {
        let state = self.records.get_mut(key)?;
        if state.remove_layer(mutation_id).is_none() {
            debug!("rollback of {mutation_id} on {}/{}: no layer", key.collection, key.target_id);
            return state.visible.clone();
        }
        state.recompute();
        let visible = state.visible.clone();
        self.prune(key);
        visible
    }

    /// Applies freshly fetched server state.
    ///
    /// While the record carries layers and `has_unresolved` is set, only the
    /// confirmed base moves; the visible value stays until the mutation resolves.
    pub fn reconcile(&mut self, key: &RecordKey, authoritative: Option<Value>, has_unresolved: bool) -> ReconcileOutcome {
        let state = self.records.entry(key.clone()).or_default();
        if !state.layers.is_empty() && has_unresolved {
            state.confirmed = authoritative;
            return ReconcileOutcome::Deferred;
        }

        state.layers.clear();
        state.confirmed = authoritative;
        state.recompute();
        let outcome = if state.visible.is_some() {
            ReconcileOutcome::Replaced
        } else {
            ReconcileOutcome::Removed
        };
        self.prune(key);
        outcome
    }

    /// Sets the confirmed value beneath any existing layers, e.g. on first load.
    pub fn hydrate(&mut self, key: &RecordKey, value: Option<Value>) {
        let state = self.records.entry(key.clone()).or_default();
        state.confirmed = value;
        state.recompute();
        self.prune(key);
    }

    /// Moves a record to the server-assigned id and returns the new key.
    pub fn rekey(&mut self, from: &RecordKey, to_id: &str) -> RecordKey {
        let to = RecordKey::new(from.collection.clone(), to_id);
        if let Some(moved) = self.records.remove(from) {
            let state = self.records.entry(to.clone()).or_default();
            state.layers.extend(moved.layers);
            if state.confirmed.is_none() {
                state.confirmed = moved.confirmed;
            }
            state.recompute();
        }
        to
    }

    /// UI projection of `key`, if the record is known.
    pub fn get(&self, key: &RecordKey) -> Option<LocalRecordState> {
        self.records.get(key).map(TargetState::snapshot)
    }

    /// Last server-confirmed value, beneath any layers.
    pub fn confirmed(&self, key: &RecordKey) -> Option<&Value> {
        self.records.get(key)?.confirmed.as_ref()
    }

    /// Unconfirmed layers of `key`, oldest first.
    pub fn layers(&self, key: &RecordKey) -> &[OptimisticLayer] {
        self.records.get(key).map(|s| s.layers.as_slice()).unwrap_or(&[])
    }

    /// Whether `key` carries any unconfirmed layer.
    pub fn is_optimistic(&self, key: &RecordKey) -> bool {
        self.records.get(key).is_some_and(|s| !s.layers.is_empty())
    }

    /// Local record ids of `collection`, sorted.
    pub fn keys(&self, collection: &str) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self
            .records
            .keys()
            .filter(|k| k.collection == collection)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Visible records of `collection` sorted by id; deleted ones are skipped.
    pub fn visible(&self, collection: &str) -> Vec<(String, Value)> {
        self.keys(collection)
            .into_iter()
            .filter_map(|key| {
                let value = self.records.get(&key)?.visible.clone()?;
                Some((key.target_id, value))
            })
            .collect()
    }

    fn prune(&mut self, key: &RecordKey) {
        if self.records.get(key).is_some_and(TargetState::is_vacant) {
            self.records.remove(key);
        }
    }
}
