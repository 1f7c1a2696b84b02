use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use hashbrown::HashSet;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::{task::JoinSet, time};

use crate::{
    mutation::{MutationRecord, apply_payload, record_id},
    remote::{RemoteError, RemoteService},
    types::{Operation, now_ms},
};

use super::{
    connectivity::until_offline,
    context::SyncContext,
    events::{FailureReason, SyncEvent},
    session::SyncSession,
};

/// How a call to [`SyncDispatcher::drain`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No pending or in-flight mutations remain for the collection.
    Drained,
    /// Connectivity was lost; unsent mutations stay queued.
    Paused,
    /// Another drain of the same collection is running.
    AlreadyRunning,
    /// The queue could not persist a claim.
    Stopped,
}

/// Sends queued mutations to the remote service.
#[derive(Clone)]
pub struct SyncDispatcher {
    ctx: Arc<SyncContext>,
    draining: Arc<Mutex<HashSet<String>>>,
}

struct DrainGuard {
    draining: Arc<Mutex<HashSet<String>>>,
    collection: String,
}

impl DrainGuard {
    fn acquire(draining: &Arc<Mutex<HashSet<String>>>, collection: &str) -> Option<Self> {
        let mut set = draining.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(collection.to_string()) {
            return None;
        }
        Some(Self {
            draining: Arc::clone(draining),
            collection: collection.to_string(),
        })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.draining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.collection);
    }
}

enum SendOutcome {
    Sent(Option<Value>),
    Failed(RemoteError),
    Aborted,
}

impl SyncDispatcher {
    /// Dispatcher over the shared context.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            draining: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a drain of `collection` is running.
    pub fn is_draining(&self, collection: &str) -> bool {
        self.draining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(collection)
    }

    /// Sends the collection's queued mutations until none are left or the device goes offline.
    ///
    /// Up to `max_concurrent_sends` mutations are in flight at once, never two
    /// for the same record. Mutations backing off are waited for.
    pub async fn drain(&self, collection: &str) -> DrainOutcome {
        let mut outcome = DrainOutcome::AlreadyRunning;
        loop {
            let Some(guard) = DrainGuard::acquire(&self.draining, collection) else {
                return outcome;
            };
            outcome = self.run(collection).await;
            drop(guard);

            // Work queued between the final check and the guard release.
            let late = outcome == DrainOutcome::Drained
                && self.ctx.connectivity().is_online()
                && self.ctx.queue().has_work(collection);
            if !late {
                return outcome;
            }
        }
    }

    async fn run(&self, collection: &str) -> DrainOutcome {
        let ctx = &self.ctx;
        let capacity = ctx.config().max_concurrent_sends.max(1);
        let mut sends = JoinSet::new();
        info!("draining {collection}");

        loop {
            let work_added = ctx.work_added().notified();
            tokio::pin!(work_added);
            work_added.as_mut().enable();

            if !ctx.connectivity().is_online() {
                while sends.join_next().await.is_some() {}
                info!("drain of {collection} paused: offline");
                return DrainOutcome::Paused;
            }

            while sends.len() < capacity {
                let claimed = ctx.queue().dequeue_next(collection, now_ms());
                match claimed {
                    Ok(Some(record)) => {
                        let this = self.clone();
                        sends.spawn(async move { this.dispatch(record).await });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        error!("could not claim next mutation of {collection}: {err}");
                        while sends.join_next().await.is_some() {}
                        return DrainOutcome::Stopped;
                    }
                }
            }

            if !sends.is_empty() {
                tokio::select! {
                    _ = sends.join_next() => {}
                    _ = &mut work_added => {}
                }
                continue;
            }

            let (has_work, next_retry_at) = {
                let queue = ctx.queue();
                (queue.has_work(collection), queue.next_retry_at(collection))
            };
            if !has_work {
                info!("{collection} drained");
                ctx.emit(SyncEvent::QueueDrained {
                    collection: collection.to_string(),
                });
                return DrainOutcome::Drained;
            }

            let wait_ms = next_retry_at
                .map(|at| at.saturating_sub(now_ms()))
                .unwrap_or(ctx.config().backoff_base_ms)
                .max(1);
            debug!("{collection}: nothing ready, waiting {wait_ms} ms");
            tokio::select! {
                _ = time::sleep(Duration::from_millis(wait_ms)) => {}
                _ = &mut work_added => {}
                _ = until_offline(ctx.connectivity().subscribe()) => {}
            }
        }
    }

    async fn dispatch(&self, record: MutationRecord) {
        let ctx = &self.ctx;
        let timeout_ms = ctx.config().request_timeout_ms;
        let outcome = tokio::select! {
            sent = time::timeout(
                ctx.config().request_timeout(),
                send_remote(ctx.remote(), ctx.session(), &record),
            ) => match sent {
                Ok(Ok(echo)) => SendOutcome::Sent(echo),
                Ok(Err(err)) => SendOutcome::Failed(err),
                Err(_elapsed) => SendOutcome::Failed(RemoteError::Timeout(timeout_ms)),
            },
            _ = until_offline(ctx.connectivity().subscribe()) => SendOutcome::Aborted,
        };

        match outcome {
            SendOutcome::Sent(echo) => self.acknowledge(&record, echo),
            SendOutcome::Failed(err) if err.is_retryable() => self.schedule_retry(&record, err),
            SendOutcome::Failed(RemoteError::Conflict(msg)) => {
                ctx.fail_terminally(&record.id, FailureReason::Conflict(msg));
            }
            SendOutcome::Failed(err) => {
                ctx.fail_terminally(&record.id, FailureReason::Rejected(err.to_string()));
            }
            SendOutcome::Aborted => match ctx.queue().release(&record.id) {
                Ok(_) => debug!("send of {} aborted: offline", record.id),
                Err(err) => debug!("send of {} aborted after settling: {err}", record.id),
            },
        }
    }

    fn acknowledge(&self, record: &MutationRecord, echo: Option<Value>) {
        let ctx = &self.ctx;
        let canonical = match record.operation {
            Operation::Create => echo.as_ref().and_then(record_id),
            Operation::Update | Operation::Delete => None,
        };

        let mut applier = ctx.applier();
        let done = ctx.queue().mark_done_remapped(&record.id, canonical.as_deref());
        if let Err(err) = done {
            if err.is_settled_elsewhere() {
                warn!("late acknowledgement of {} ignored: {err}", record.id);
            } else {
                error!("could not record acknowledgement of {}: {err}", record.id);
            }
            return;
        }

        let mut key = record.key();
        if let Some(canonical) = canonical.as_deref().filter(|c| *c != record.target_id) {
            key = applier.rekey(&key, canonical);
        }
        let authoritative = match record.operation {
            Operation::Delete => None,
            Operation::Create | Operation::Update => echo
                .filter(Value::is_object)
                .or_else(|| apply_payload(record.operation, applier.confirmed(&key), &record.payload)),
        };
        applier.confirm(&key, &record.id, authoritative);
        drop(applier);

        debug!("{} confirmed for {}/{}", record.id, key.collection, key.target_id);
        ctx.emit(SyncEvent::Confirmed {
            id: record.id,
            collection: key.collection,
            target_id: key.target_id,
        });
    }

    fn schedule_retry(&self, record: &MutationRecord, err: RemoteError) {
        let ctx = &self.ctx;
        let attempts = record.attempt_count + 1;
        if attempts >= ctx.config().max_attempts.max(1) {
            ctx.fail_terminally(
                &record.id,
                FailureReason::RetriesExhausted {
                    attempts,
                    last_error: err.to_string(),
                },
            );
            return;
        }

        let retry_at = now_ms() + ctx.config().backoff_delay_ms(attempts);
        let error = err.to_string();
        let retried = ctx.queue().mark_retry(&record.id, &error, retry_at);
        match retried {
            Ok(_) => {
                warn!(
                    "send of {} to {} failed (attempt {attempts}): {error}; retrying",
                    record.id, record.collection
                );
                ctx.emit(SyncEvent::RetryScheduled {
                    id: record.id,
                    attempt: attempts,
                    retry_at,
                    error,
                });
            }
            Err(err) if err.is_settled_elsewhere() => debug!("retry of {} skipped: {err}", record.id),
            Err(err) => error!("could not schedule retry of {}: {err}", record.id),
        }
    }
}

async fn send_remote(
    remote: &dyn RemoteService,
    session: &SyncSession,
    record: &MutationRecord,
) -> Result<Option<Value>, RemoteError> {
    match record.operation {
        Operation::Create => remote
            .create(session, &record.collection, &record.payload)
            .await
            .map(Some),
        Operation::Update => remote
            .update(session, &record.collection, &record.target_id, &record.payload)
            .await
            .map(Some),
        Operation::Delete => remote
            .delete(session, &record.collection, &record.target_id)
            .await
            .map(|()| None),
    }
}
