use std::sync::Arc;

use log::info;
use tokio::{sync::watch, task::JoinHandle};

/// Tracks whether the remote service is reachable.
///
/// The platform adapter feeds it through [`ConnectivityMonitor::set_online`];
/// clones share the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Monitor starting in the given state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Last reported state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Records the current state and returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!("connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Receiver that observes every later change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Calls `callback` with the new state on every change until the task is aborted.
    pub fn on_change<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                callback(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Resolves once `rx` reports offline; never resolves if the monitor is gone.
pub(crate) async fn until_offline(mut rx: watch::Receiver<bool>) {
    let closed = rx.wait_for(|online| !*online).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
