use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};
use tokio::{sync::watch, task::JoinHandle, time};

use crate::remote::{ChangeFeed, ChangeFilter, ChangeSignal};

use super::session::SyncSession;

/// Signals remembered for de-duplication.
const RECENT_SIGNALS_MAX: usize = 100;
/// Signals kept when the window is trimmed.
const RECENT_SIGNALS_KEEP: usize = 50;

type SubscriptionKey = (String, ChangeFilter);
type Registry = Arc<Mutex<HashMap<SubscriptionKey, Weak<SubscriptionInner>>>>;
type OnChange = Arc<dyn Fn(&ChangeSignal) + Send + Sync>;

/// Keeps one push subscription per `(collection, filter)`.
pub struct RemoteChangeListener {
    feed: Arc<dyn ChangeFeed>,
    session: SyncSession,
    resubscribe_delay: Duration,
    registry: Registry,
}

struct SubscriptionInner {
    key: SubscriptionKey,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionInner {
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown.send(true);
        true
    }
}

impl Drop for SubscriptionInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owner of a live subscription.
///
/// Clones share the subscription; it ends on [`SubscriptionHandle::unsubscribe`]
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<SubscriptionInner>,
    registry: Registry,
}

impl SubscriptionHandle {
    /// Subscribed collection.
    pub fn collection(&self) -> &str {
        &self.inner.key.0
    }

    /// Subscribed row filter.
    pub fn filter(&self) -> &ChangeFilter {
        &self.inner.key.1
    }

    /// Whether the push channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether shutdown was signalled.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Signals shutdown; later calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.inner.stop() {
            return;
        }
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = registry
            .get(&self.inner.key)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.inner)));
        if ours {
            registry.remove(&self.inner.key);
        }
    }

    /// Unsubscribes and waits until the channel is released.
    pub async fn close(&self) {
        self.unsubscribe();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl RemoteChangeListener {
    /// Listener opening channels through `feed` as `session`.
    pub fn new(feed: Arc<dyn ChangeFeed>, session: SyncSession, resubscribe_delay: Duration) -> Self {
        Self {
            feed,
            session,
            resubscribe_delay,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribes to changes of `collection` matching `filter`.
    ///
    /// While a subscription for the same pair is live, its handle is returned
    /// and `on_change` is dropped. Must be called within a tokio runtime.
    pub fn subscribe<F>(&self, collection: &str, filter: ChangeFilter, on_change: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeSignal) + Send + Sync + 'static,
    {
        let key = (collection.to_string(), filter);
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(inner) = registry.get(&key).and_then(Weak::upgrade) {
            if !inner.stopped.load(Ordering::SeqCst) {
                debug!("reusing subscription to {} ({})", key.0, key.1);
                return SubscriptionHandle {
                    inner,
                    registry: Arc::clone(&self.registry),
                };
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.feed),
            self.session.clone(),
            key.clone(),
            self.resubscribe_delay,
            Arc::new(on_change),
            Arc::clone(&connected),
            shutdown_rx,
        ));
        let inner = Arc::new(SubscriptionInner {
            key: key.clone(),
            shutdown,
            stopped: AtomicBool::new(false),
            connected,
            task: Mutex::new(Some(task)),
        });
        registry.insert(key, Arc::downgrade(&inner));
        SubscriptionHandle {
            inner,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.retain(|_, weak| weak.upgrade().is_some_and(|inner| !inner.stopped.load(Ordering::SeqCst)));
        registry.len()
    }

    /// Stops every subscription.
    pub fn unsubscribe_all(&self) {
        let live: Vec<Arc<SubscriptionInner>> = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for inner in live {
            inner.stop();
        }
    }
}

async fn run_subscription(
    feed: Arc<dyn ChangeFeed>,
    session: SyncSession,
    (collection, filter): SubscriptionKey,
    resubscribe_delay: Duration,
    on_change: OnChange,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut recent = RecentSignals::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        // A stream returned after shutdown was requested is still released below.
        let opened = feed.open(&session, &collection, &filter).await;
        match opened {
            Ok(mut stream) => {
                if *shutdown.borrow() {
                    stream.close().await;
                    break;
                }
                connected.store(true, Ordering::SeqCst);
                info!("subscribed to {collection} ({filter})");

                let lost = loop {
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break None,
                        change = stream.next_change() => match change {
                            Some(Ok(signal)) => {
                                if recent.observe(&signal) {
                                    on_change(&signal);
                                } else {
                                    debug!("duplicate change on {collection}: {signal:?}");
                                }
                            }
                            Some(Err(err)) => break Some(err.to_string()),
                            None => break Some("closed by server".to_string()),
                        },
                    }
                };

                stream.close().await;
                connected.store(false, Ordering::SeqCst);
                let Some(reason) = lost else {
                    break;
                };
                warn!("subscription to {collection} ({filter}) lost: {reason}; retrying in {resubscribe_delay:?}");
            }
            Err(err) => {
                connected.store(false, Ordering::SeqCst);
                warn!("subscribing to {collection} ({filter}) failed: {err}; retrying in {resubscribe_delay:?}");
            }
        }

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = time::sleep(resubscribe_delay) => {}
        }
    }

    info!("unsubscribed from {collection} ({filter})");
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await.is_ok();
}

/// Bounded window of recently seen signals.
///
/// Signals without a commit timestamp cannot be told apart and are never
/// treated as duplicates.
#[derive(Default)]
struct RecentSignals {
    order: VecDeque<ChangeSignal>,
    seen: HashSet<ChangeSignal>,
}

impl RecentSignals {
    fn observe(&mut self, signal: &ChangeSignal) -> bool {
        if signal.commit_ts.is_none() {
            return true;
        }
        if !self.seen.insert(signal.clone()) {
            return false;
        }
        self.order.push_back(signal.clone());
        if self.order.len() > RECENT_SIGNALS_MAX {
            while self.order.len() > RECENT_SIGNALS_KEEP {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }
}
