use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use log::{info, warn};
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    core::{
        optimistic::{LocalRecordState, ReconcileOutcome},
        queue::{MutationQueue, QueueError, QueueStats},
    },
    mutation::{MutationDraft, MutationRecord, ValidationError, record_id},
    remote::{ChangeFeed, ChangeFilter, ChangeSignal, RemoteError, RemoteService},
    types::{MutationId, RecordKey},
};

use super::{
    config::SyncConfig,
    connectivity::ConnectivityMonitor,
    context::SyncContext,
    dispatcher::{DrainOutcome, SyncDispatcher},
    events::SyncEvent,
    listener::{RemoteChangeListener, SubscriptionHandle},
    reaper::{StuckJobReaper, SweepReport},
    reconcile::Reconciler,
    session::SyncSession,
};

/// Errors returned by [`SyncHandle`] calls.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The edit is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The queue refused or could not persist the change.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A remote read failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// [`SyncHandle::shutdown`] was called.
    #[error("sync engine is shut down")]
    ShutDown,
}

/// Application-supplied remote collaborators.
#[derive(Clone)]
pub struct RemoteServices {
    /// Authoritative record store.
    pub remote: Arc<dyn RemoteService>,
    /// Push channel factory.
    pub feed: Arc<dyn ChangeFeed>,
}

#[derive(Default)]
struct TaskSet {
    tasks: Vec<JoinHandle<()>>,
}

impl TaskSet {
    fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Entry point for the UI layer.
#[derive(Clone)]
pub struct SyncHandle {
    ctx: Arc<SyncContext>,
    dispatcher: SyncDispatcher,
    reconciler: Reconciler,
    reaper: StuckJobReaper,
    listener: Arc<RemoteChangeListener>,
    runtime: Handle,
    tasks: Arc<Mutex<TaskSet>>,
    closed: Arc<AtomicBool>,
}

/// Starts the engine on the current tokio runtime.
///
/// Unresolved mutations in `queue` are re-applied optimistically and, when
/// online, replayed right away.
pub fn spawn_sync(
    queue: MutationQueue,
    services: RemoteServices,
    session: SyncSession,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
) -> SyncHandle {
    let resubscribe_delay = config.resubscribe_delay();
    let ctx = SyncContext::new(queue, services.remote, session.clone(), connectivity, config);
    let handle = SyncHandle {
        dispatcher: SyncDispatcher::new(Arc::clone(&ctx)),
        reconciler: Reconciler::new(Arc::clone(&ctx)),
        reaper: StuckJobReaper::new(Arc::clone(&ctx)),
        listener: Arc::new(RemoteChangeListener::new(services.feed, session, resubscribe_delay)),
        runtime: Handle::current(),
        tasks: Arc::new(Mutex::new(TaskSet::default())),
        closed: Arc::new(AtomicBool::new(false)),
        ctx,
    };

    let watcher = handle.clone();
    handle.track(handle.ctx.connectivity().on_change(move |online| {
        watcher.ctx.emit(SyncEvent::ConnectivityChanged { online });
        if online {
            watcher.drain_in_background_all();
        }
    }));
    handle.track(handle.reaper.clone().spawn());

    if handle.ctx.connectivity().is_online() {
        handle.drain_in_background_all();
    }
    info!("sync engine started for {}", handle.ctx.session().user_id);
    handle
}

impl SyncHandle {
    /// New receiver for engine events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.subscribe_events()
    }

    /// Applies a local edit optimistically and queues it for sending.
    ///
    /// Returns before any network round trip.
    pub fn mutate(&self, draft: MutationDraft) -> Result<MutationRecord, SyncError> {
        self.ensure_open()?;
        let record = self.ctx.apply_local(draft)?;
        if self.ctx.connectivity().is_online() {
            self.drain_in_background(&record.collection);
        }
        Ok(record)
    }

    /// What the UI should show for one record.
    pub fn local(&self, key: &RecordKey) -> Option<LocalRecordState> {
        self.ctx.applier().get(key)
    }

    /// Visible records of `collection` by id.
    pub fn visible(&self, collection: &str) -> Vec<(String, Value)> {
        self.ctx.applier().visible(collection)
    }

    /// Unsent and in-flight mutations in enqueue order.
    pub fn pending(&self, collection: Option<&str>) -> Vec<MutationRecord> {
        self.ctx.queue().list_pending(collection)
    }

    /// Failed mutations awaiting manual retry.
    pub fn failed(&self, collection: Option<&str>) -> Vec<MutationRecord> {
        self.ctx.queue().list_failed(collection)
    }

    /// Queue counts for the sync indicator.
    pub fn stats(&self, collection: Option<&str>) -> QueueStats {
        self.ctx.queue().stats(collection)
    }

    /// Re-queues a failed mutation and re-applies its optimistic edit.
    pub fn retry_failed(&self, id: &MutationId) -> Result<MutationRecord, SyncError> {
        self.ensure_open()?;
        let record = {
            let mut applier = self.ctx.applier();
            let record = self.ctx.queue().retry_failed(id)?;
            applier.apply_optimistic(&record);
            record
        };
        self.ctx.work_added().notify_waiters();
        if self.ctx.connectivity().is_online() {
            self.drain_in_background(&record.collection);
        }
        Ok(record)
    }

    /// Re-queues every failed mutation and returns how many.
    pub fn retry_all_failed(&self, collection: Option<&str>) -> Result<usize, SyncError> {
        self.ensure_open()?;
        let retried = {
            let mut applier = self.ctx.applier();
            let retried = self.ctx.queue().retry_all_failed(collection)?;
            for record in &retried {
                applier.apply_optimistic(record);
            }
            retried
        };
        self.ctx.work_added().notify_waiters();
        if self.ctx.connectivity().is_online() {
            self.drain_in_background_all();
        }
        Ok(retried.len())
    }

    /// Discards a failed mutation.
    pub fn clear_failed(&self, id: &MutationId) -> Result<MutationRecord, SyncError> {
        Ok(self.ctx.queue().clear_failed(id)?)
    }

    /// Drops queued mutations and rolls back their optimistic edits.
    pub fn clear_queue(&self, collection: Option<&str>) -> Result<usize, SyncError> {
        let mut applier = self.ctx.applier();
        let removed = self.ctx.queue().clear(collection)?;
        for record in removed.iter().filter(|r| r.is_unresolved()) {
            applier.rollback(&record.key(), &record.id);
        }
        drop(applier);
        warn!("cleared {} queued mutations", removed.len());
        Ok(removed.len())
    }

    /// Loads authoritative records beneath any optimistic edits.
    pub fn hydrate(&self, collection: &str, records: Vec<Value>) {
        let mut applier = self.ctx.applier();
        for record in records {
            match record_id(&record) {
                Some(id) => applier.hydrate(&RecordKey::new(collection, id), Some(record)),
                None => warn!("ignoring {collection} record without id"),
            }
        }
    }

    /// Sends the queued mutations of `collection` now.
    pub async fn drain(&self, collection: &str) -> Result<DrainOutcome, SyncError> {
        self.ensure_open()?;
        Ok(self.dispatcher.drain(collection).await)
    }

    /// Drains every collection with queued work, one after another.
    pub async fn drain_all(&self) -> Result<Vec<(String, DrainOutcome)>, SyncError> {
        self.ensure_open()?;
        let collections = self.ctx.queue().collections_with_work();
        let mut outcomes = Vec::with_capacity(collections.len());
        for collection in collections {
            let outcome = self.dispatcher.drain(&collection).await;
            outcomes.push((collection, outcome));
        }
        Ok(outcomes)
    }

    /// Runs the reaper over one collection.
    pub fn sweep(&self, collection: &str) -> SweepReport {
        self.reaper.sweep(collection, self.ctx.config().stale_after_ms)
    }

    /// Runs the reaper and replays queued work, e.g. when the app returns to the foreground.
    pub fn resume(&self) -> SweepReport {
        let report = self.reaper.sweep_all();
        if self.ctx.connectivity().is_online() {
            self.drain_in_background_all();
        }
        report
    }

    /// Keeps local state of `collection` in step with server changes.
    pub fn watch_collection(&self, collection: &str, filter: ChangeFilter) -> SubscriptionHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeSignal>();
        let reconciler = self.reconciler.clone();
        let name = collection.to_string();
        let scope = filter.clone();
        self.track(self.runtime.spawn(async move {
            while let Some(signal) = rx.recv().await {
                if let Err(err) = reconciler.handle_signal(&name, &scope, &signal).await {
                    warn!("could not refresh {name} after {:?}: {err}", signal.kind);
                }
            }
        }));

        self.listener.subscribe(collection, filter, move |signal| {
            let _ = tx.send(signal.clone());
        })
    }

    /// Live push subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.listener.active_subscriptions()
    }

    /// Re-reads one record from the server.
    pub async fn reconcile(&self, collection: &str, target_id: &str) -> Result<ReconcileOutcome, SyncError> {
        Ok(self.reconciler.refresh_record(collection, target_id).await?)
    }

    /// Re-reads every record of `collection` matching `filter`.
    pub async fn refresh(
        &self,
        collection: &str,
        filter: &ChangeFilter,
    ) -> Result<Vec<(String, ReconcileOutcome)>, SyncError> {
        Ok(self.reconciler.refresh_collection(collection, filter).await?)
    }

    /// Connectivity monitor the platform adapter reports to.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        self.ctx.connectivity()
    }

    /// Session the engine acts for.
    pub fn session(&self) -> &SyncSession {
        self.ctx.session()
    }

    /// Stops background work and flushes the queue.
    ///
    /// Sends still in flight are abandoned and reopen as pending.
    pub fn shutdown(&self) -> Result<(), SyncError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.listener.unsubscribe_all();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        self.ctx.queue().flush()?;
        info!("sync engine stopped");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        if self.closed.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn drain_in_background(&self, collection: &str) {
        if self.dispatcher.is_draining(collection) {
            self.ctx.work_added().notify_waiters();
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let collection = collection.to_string();
        self.track(self.runtime.spawn(async move {
            dispatcher.drain(&collection).await;
        }));
    }

    fn drain_in_background_all(&self) {
        let collections = self.ctx.queue().collections_with_work();
        for collection in collections {
            self.drain_in_background(&collection);
        }
    }
}
