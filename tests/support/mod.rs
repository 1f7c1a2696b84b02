#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

use aviary_sync::{
    core::queue::MutationQueue,
    mutation::{apply_payload, record_id},
    remote::{ChangeFeed, ChangeFilter, ChangeSignal, ChangeStream, RemoteError, RemoteService},
    runtime::{
        config::SyncConfig,
        connectivity::ConnectivityMonitor,
        events::SyncEvent,
        handle::{RemoteServices, SyncHandle, spawn_sync},
        session::SyncSession,
    },
    types::Operation,
};

/// One call that reached the fake server.
#[derive(Debug, Clone, PartialEq)]
pub struct SentCall {
    pub operation: Operation,
    pub collection: String,
    pub target_id: String,
}

#[derive(Default)]
struct ServerState {
    records: BTreeMap<(String, String), Value>,
    scripted: VecDeque<RemoteError>,
    always: Option<RemoteError>,
    sent: Vec<SentCall>,
    next_id: u64,
}

/// In-memory remote store with scripted failures and a hold gate.
pub struct FakeRemote {
    state: Mutex<ServerState>,
    assign_ids: bool,
    held: watch::Sender<bool>,
    attempts: AtomicUsize,
    completed: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    /// Creates get `srv-N` ids instead of the client-supplied one.
    pub fn with_server_ids() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(assign_ids: bool) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            state: Mutex::new(ServerState::default()),
            assign_ids,
            held,
            attempts: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn seed(&self, collection: &str, record: Value) {
        let id = record_id(&record).expect("seeded record needs an id");
        self.state
            .lock()
            .expect("lock")
            .records
            .insert((collection.to_string(), id), record);
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .expect("lock")
            .records
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    pub fn fail_next(&self, err: RemoteError) {
        self.state.lock().expect("lock").scripted.push_back(err);
    }

    pub fn fail_always(&self, err: RemoteError) {
        self.state.lock().expect("lock").always = Some(err);
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().expect("lock");
        state.always = None;
        state.scripted.clear();
    }

    /// Writes wait until [`FakeRemote::release`].
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Writes that reached the server, including held and failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Writes that returned a response.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentCall> {
        self.state.lock().expect("lock").sent.clone()
    }

    async fn gate(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.held.subscribe();
        let _ = rx.wait_for(|held| !*held).await.is_ok();
    }

    fn write<T>(
        &self,
        call: SentCall,
        apply: impl FnOnce(&mut ServerState) -> T,
    ) -> Result<T, RemoteError> {
        let mut state = self.state.lock().expect("lock");
        state.sent.push(call);
        self.completed.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if let Some(err) = state.always.clone() {
            return Err(err);
        }
        Ok(apply(&mut state))
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn create(&self, _session: &SyncSession, collection: &str, payload: &Value) -> Result<Value, RemoteError> {
        self.gate().await;
        let client_id = record_id(payload).unwrap_or_default();
        let call = SentCall {
            operation: Operation::Create,
            collection: collection.to_string(),
            target_id: client_id.clone(),
        };
        let assign_ids = self.assign_ids;
        self.write(call, |state| {
            let id = if assign_ids {
                state.next_id += 1;
                format!("srv-{}", state.next_id)
            } else {
                client_id
            };
            let mut stored = payload.clone();
            if let Some(fields) = stored.as_object_mut() {
                fields.insert("id".to_string(), Value::String(id.clone()));
            }
            state.records.insert((collection.to_string(), id), stored.clone());
            stored
        })
    }

    async fn update(
        &self,
        _session: &SyncSession,
        collection: &str,
        target_id: &str,
        payload: &Value,
    ) -> Result<Value, RemoteError> {
        self.gate().await;
        let call = SentCall {
            operation: Operation::Update,
            collection: collection.to_string(),
            target_id: target_id.to_string(),
        };
        self.write(call, |state| {
            let key = (collection.to_string(), target_id.to_string());
            let merged = apply_payload(Operation::Update, state.records.get(&key), payload)
                .unwrap_or(Value::Null);
            state.records.insert(key, merged.clone());
            merged
        })
    }

    async fn delete(&self, _session: &SyncSession, collection: &str, target_id: &str) -> Result<(), RemoteError> {
        self.gate().await;
        let call = SentCall {
            operation: Operation::Delete,
            collection: collection.to_string(),
            target_id: target_id.to_string(),
        };
        self.write(call, |state| {
            state
                .records
                .remove(&(collection.to_string(), target_id.to_string()));
        })
    }

    async fn fetch(&self, _session: &SyncSession, collection: &str, target_id: &str) -> Result<Option<Value>, RemoteError> {
        Ok(self.record(collection, target_id))
    }

    async fn fetch_all(
        &self,
        _session: &SyncSession,
        collection: &str,
        filter: &ChangeFilter,
    ) -> Result<Vec<Value>, RemoteError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .records
            .iter()
            .filter(|((c, _), v)| c == collection && filter.matches(v))
            .map(|(_, v)| v.clone())
            .collect())
    }
}

type Feeder = mpsc::UnboundedSender<Result<ChangeSignal, RemoteError>>;

#[derive(Default)]
struct FeedState {
    handshakes: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    failing_opens: AtomicUsize,
    feeders: Mutex<Vec<Feeder>>,
}

/// Push channel whose signals are injected by the test.
#[derive(Clone, Default)]
pub struct FakeFeed {
    state: Arc<FeedState>,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` handshakes fail.
    pub fn fail_opens(&self, n: usize) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Streams successfully opened.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn push(&self, signal: ChangeSignal) {
        self.send(Ok(signal));
    }

    /// Fails every open stream.
    pub fn break_streams(&self) {
        self.send(Err(RemoteError::Transport("socket reset".to_string())));
    }

    fn send(&self, item: Result<ChangeSignal, RemoteError>) {
        let mut feeders = self.state.feeders.lock().expect("lock");
        feeders.retain(|tx| tx.send(item.clone()).is_ok());
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn open(
        &self,
        _session: &SyncSession,
        _collection: &str,
        _filter: &ChangeFilter,
    ) -> Result<Box<dyn ChangeStream>, RemoteError> {
        self.state.handshakes.fetch_add(1, Ordering::SeqCst);
        let failing = self.state.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(RemoteError::Unavailable { status: 503 });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.feeders.lock().expect("lock").push(tx);
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            rx,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeStream {
    rx: mpsc::UnboundedReceiver<Result<ChangeSignal, RemoteError>>,
    state: Arc<FeedState>,
}

#[async_trait]
impl ChangeStream for FakeStream {
    async fn next_change(&mut self) -> Option<Result<ChangeSignal, RemoteError>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tunables that keep scenario tests fast.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        backoff_base_ms: 1,
        backoff_cap_ms: 4,
        resubscribe_delay_ms: 10,
        request_timeout_ms: 2_000,
        reap_interval_ms: 3_600_000,
        ..SyncConfig::default()
    }
}

pub fn session() -> SyncSession {
    SyncSession::new("breeder-1")
}

pub fn engine(remote: Arc<FakeRemote>, feed: Arc<FakeFeed>, online: bool, config: SyncConfig) -> SyncHandle {
    spawn_sync(
        MutationQueue::new(),
        RemoteServices { remote, feed },
        session(),
        ConnectivityMonitor::new(online),
        config,
    )
}

/// Polls `check` for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Waits for the first event matching `pred`, returning every event seen on the way.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<SyncEvent>,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    let found = within(async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let hit = pred(&event);
                    seen.push(event);
                    if hit {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    assert!(found, "timed out waiting for event; saw {seen:?}");
    seen
}

/// Events already queued on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn within(fut: impl Future<Output = ()>) -> bool {
    tokio::time::timeout(Duration::from_secs(5), fut).await.is_ok()
}
