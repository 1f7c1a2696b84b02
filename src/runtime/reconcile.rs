use std::{collections::BTreeMap, sync::Arc};

use log::{debug, warn};
use serde_json::Value;

use crate::{
    core::optimistic::ReconcileOutcome,
    mutation::record_id,
    remote::{ChangeFilter, ChangeKind, ChangeSignal, RemoteError},
    types::RecordKey,
};

use super::{context::SyncContext, events::SyncEvent};

/// Re-reads authoritative state and folds it into local state.
///
/// A record with a pending or in-flight local edit keeps its optimistic value.
#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<SyncContext>,
}

impl Reconciler {
    /// Reconciler over the shared context.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Reacts to one push signal; a signal without a target refreshes the whole collection.
    pub async fn handle_signal(
        &self,
        collection: &str,
        filter: &ChangeFilter,
        signal: &ChangeSignal,
    ) -> Result<Vec<(String, ReconcileOutcome)>, RemoteError> {
        match (&signal.target_id, signal.kind) {
            (Some(target_id), ChangeKind::Delete) => {
                Ok(vec![(target_id.clone(), self.apply(collection, target_id, None))])
            }
            (Some(target_id), ChangeKind::Insert | ChangeKind::Update) => {
                let outcome = self.refresh_record(collection, target_id).await?;
                Ok(vec![(target_id.clone(), outcome)])
            }
            (None, _) => self.refresh_collection(collection, filter).await,
        }
    }

    /// Fetches one record and folds it into local state.
    pub async fn refresh_record(&self, collection: &str, target_id: &str) -> Result<ReconcileOutcome, RemoteError> {
        let fetched = self
            .ctx
            .remote()
            .fetch(self.ctx.session(), collection, target_id)
            .await?;
        Ok(self.apply(collection, target_id, fetched))
    }

    /// Refreshes every record of `collection` matching `filter`.
    ///
    /// With [`ChangeFilter::all`], local records the server no longer returns
    /// are treated as deleted. With a narrower filter only local records whose
    /// confirmed value matched it are re-read one by one; the rest are left alone.
    pub async fn refresh_collection(
        &self,
        collection: &str,
        filter: &ChangeFilter,
    ) -> Result<Vec<(String, ReconcileOutcome)>, RemoteError> {
        let rows = self
            .ctx
            .remote()
            .fetch_all(self.ctx.session(), collection, filter)
            .await?;

        let mut fetched = BTreeMap::new();
        for row in rows {
            match record_id(&row) {
                Some(id) => {
                    fetched.insert(id, row);
                }
                None => warn!("ignoring {collection} row without id"),
            }
        }

        let missing: Vec<String> = {
            let applier = self.ctx.applier();
            applier
                .keys(collection)
                .into_iter()
                .filter(|key| !fetched.contains_key(&key.target_id))
                .filter(|key| filter.is_all() || applier.confirmed(key).is_some_and(|v| filter.matches(v)))
                .map(|key| key.target_id)
                .collect()
        };

        let mut outcomes = Vec::with_capacity(fetched.len() + missing.len());
        for target_id in missing {
            let outcome = if filter.is_all() {
                self.apply(collection, &target_id, None)
            } else {
                // Gone from a narrow filter may mean moved out of it.
                self.refresh_record(collection, &target_id).await?
            };
            outcomes.push((target_id, outcome));
        }
        for (target_id, row) in fetched {
            let outcome = self.apply(collection, &target_id, Some(row));
            outcomes.push((target_id, outcome));
        }
        Ok(outcomes)
    }

    fn apply(&self, collection: &str, target_id: &str, authoritative: Option<Value>) -> ReconcileOutcome {
        let key = RecordKey::new(collection, target_id);
        let mut applier = self.ctx.applier();
        let unresolved = self.ctx.queue().has_unresolved(&key);
        let outcome = applier.reconcile(&key, authoritative.clone(), unresolved);
        drop(applier);

        match outcome {
            ReconcileOutcome::Deferred => {
                debug!("{collection}/{target_id} has unresolved local edits; server value held back");
                self.ctx.emit(SyncEvent::ReconcileDeferred {
                    collection: key.collection,
                    target_id: key.target_id,
                });
            }
            ReconcileOutcome::Replaced | ReconcileOutcome::Removed => {
                self.ctx.emit(SyncEvent::Reconciled {
                    collection: key.collection,
                    target_id: key.target_id,
                    value: authoritative,
                });
            }
        }
        outcome
    }
}
