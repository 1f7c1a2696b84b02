use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::{Notify, broadcast};

use crate::{
    core::{optimistic::OptimisticApplier, queue::MutationQueue},
    mutation::{MutationDraft, MutationRecord},
    remote::RemoteService,
    types::{MutationId, now_ms},
};

use super::{
    config::SyncConfig,
    connectivity::ConnectivityMonitor,
    events::{FailureReason, SyncEvent},
    handle::SyncError,
    session::SyncSession,
};

/// State shared by the dispatcher, reconciler and reaper.
///
/// Lock order is applier, then queue. Neither lock is held across an await.
pub struct SyncContext {
    queue: Mutex<MutationQueue>,
    applier: Mutex<OptimisticApplier>,
    remote: Arc<dyn RemoteService>,
    session: SyncSession,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    work_added: Notify,
}

impl SyncContext {
    /// Wraps `queue` and re-applies the optimistic layers of its unresolved mutations.
    pub fn new(
        queue: MutationQueue,
        remote: Arc<dyn RemoteService>,
        session: SyncSession,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Arc<Self> {
        let mut applier = OptimisticApplier::new();
        let restored = queue.list_pending(None);
        for record in &restored {
            applier.apply_optimistic(record);
        }
        if !restored.is_empty() {
            info!("restored {} optimistic edits from the queue", restored.len());
        }

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            queue: Mutex::new(queue),
            applier: Mutex::new(applier),
            remote,
            session,
            connectivity,
            config,
            events,
            work_added: Notify::new(),
        })
    }

    /// Locks the queue. Take the applier first when both are needed.
    pub fn queue(&self) -> MutexGuard<'_, MutationQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the optimistic applier.
    pub fn applier(&self) -> MutexGuard<'_, OptimisticApplier> {
        self.applier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remote data service.
    pub fn remote(&self) -> &dyn RemoteService {
        self.remote.as_ref()
    }

    /// Session every remote call runs as.
    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    /// Shared connectivity state.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Engine tunables.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// New receiver for engine events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Broadcasts `event`; dropped when nobody listens.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn work_added(&self) -> &Notify {
        &self.work_added
    }

    /// Applies `draft` optimistically and queues it; no network involved.
    ///
    /// The optimistic layer is removed again if the queue rejects the record.
    pub fn apply_local(&self, draft: MutationDraft) -> Result<MutationRecord, SyncError> {
        let record = MutationRecord::from_draft(draft, now_ms())?;

        let mut applier = self.applier();
        applier.apply_optimistic(&record);
        let queued = {
            let mut queue = self.queue();
            queue
                .enqueue_record(record.clone())
                .map(|id| queue.get(&id).cloned().unwrap_or_else(|| record.clone()))
        };
        let queued = match queued {
            Ok(queued) => queued,
            Err(err) => {
                applier.rollback(&record.key(), &record.id);
                error!("could not queue {:?} on {}/{}: {err}", record.operation, record.collection, record.target_id);
                return Err(err.into());
            }
        };
        drop(applier);

        self.emit(SyncEvent::Enqueued {
            id: queued.id,
            collection: queued.collection.clone(),
            target_id: queued.target_id.clone(),
            operation: queued.operation,
        });
        self.work_added.notify_waiters();
        Ok(queued)
    }

    /// Fails a mutation for good: `failed` in the queue, optimistic layer
    /// rolled back, one `MutationFailed` event.
    ///
    /// Returns `None` when another path already settled the mutation, so
    /// concurrent callers roll back at most once.
    pub fn fail_terminally(&self, id: &MutationId, reason: FailureReason) -> Option<MutationRecord> {
        let mut applier = self.applier();
        let failed = self.queue().mark_failed(id, &reason.to_string());
        let failed = match failed {
            Ok(failed) => failed,
            Err(err) if err.is_settled_elsewhere() => {
                debug!("mutation {id} already settled: {err}");
                return None;
            }
            Err(err) => {
                error!("could not record failure of {id}: {err}");
                return None;
            }
        };
        applier.rollback(&failed.key(), &failed.id);
        drop(applier);

        warn!(
            "{:?} on {}/{} failed: {reason}",
            failed.operation, failed.collection, failed.target_id
        );
        self.emit(SyncEvent::MutationFailed {
            id: failed.id,
            collection: failed.collection.clone(),
            target_id: failed.target_id.clone(),
            reason,
        });
        Some(failed)
    }
}
