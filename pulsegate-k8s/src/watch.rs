//! Ready-edge watch loop
//!
//! Streams node events for the local host, edge-detects Ready transitions,
//! and dispatches reconciliation off the watch thread under a per-node
//! try-lock. The API server closes watch streams server-side every 5-10
//! minutes by design; a closed stream is a reconnect, never an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::api::WatchEvent;
use tokio::sync::watch;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use pulsegate_core::PulseRunner;

use crate::client::{K8sClient, NodeApi};
use crate::reconciler::{is_node_ready, Controller};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Per-node reconciliation locks. Entries are created on first observation
/// and never removed; the map outlives every reconciliation. A single-node
/// agent effectively holds one entry, but the shape anticipates agents
/// responsible for more than one node.
#[derive(Default)]
pub struct NodeLocks {
    inner: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for a node without waiting. `None` means a
    /// reconciliation is already in flight and the caller should drop the
    /// event.
    pub fn try_acquire(&self, node_name: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.inner.lock().expect("node lock map poisoned");
            Arc::clone(map.entry(node_name.to_string()).or_default())
        };
        lock.try_lock_owned().ok()
    }
}

/// Watch the node's Ready condition indefinitely, reconnecting with
/// exponential backoff whenever the stream ends. Returns when the shutdown
/// signal fires.
pub async fn run_watch_loop<C, P>(
    controller: Arc<Controller<C, P>>,
    client: K8sClient,
    node_name: String,
    locks: Arc<NodeLocks>,
    mut shutdown: watch::Receiver<bool>,
) where
    C: NodeApi + 'static,
    P: PulseRunner + 'static,
{
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let result = watch_once(&controller, &client, &node_name, &locks, &mut shutdown).await;
        if *shutdown.borrow() {
            return;
        }

        let failed = result.is_err();
        match result {
            // Cooperative server-side close: reconnect on a short, fixed
            // delay.
            Ok(()) => backoff = INITIAL_BACKOFF,
            Err(e) => {
                warn!(node = %node_name, error = %e, backoff = ?backoff, "watch ended, reconnecting");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(backoff) => {}
        }

        if failed {
            backoff = next_backoff(backoff);
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Drain one watch stream until it closes or shutdown fires. The ready
/// shadow lives here, per connection: a reconnect re-derives it from the
/// first event and may legitimately re-fire the edge.
async fn watch_once<C, P>(
    controller: &Arc<Controller<C, P>>,
    client: &K8sClient,
    node_name: &str,
    locks: &Arc<NodeLocks>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    C: NodeApi + 'static,
    P: PulseRunner + 'static,
{
    let stream = client.watch_node(node_name).await?;
    futures::pin_mut!(stream);

    let mut was_ready = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            event = stream.try_next() => {
                let Some(event) = event.context("watch stream")? else {
                    return Ok(()); // server closed, caller reconnects
                };
                match event {
                    WatchEvent::Added(node) | WatchEvent::Modified(node) => {
                        let ready = is_node_ready(&node);
                        if ready && !was_ready {
                            dispatch(controller, locks, node_name);
                        }
                        was_ready = ready;
                    }
                    // Anything else (Deleted, Bookmark, server Error events)
                    // is dropped; the stream itself closing handles retry.
                    other => {
                        debug!(node = node_name, event = ?other, "ignoring watch event");
                    }
                }
            }
        }
    }
}

/// Spawn a reconciliation in the background under the per-node lock. An
/// in-flight pulse is the source of truth; a duplicate event observing the
/// same hardware would only risk double-mutation races, so it is dropped.
fn dispatch<C, P>(controller: &Arc<Controller<C, P>>, locks: &Arc<NodeLocks>, node_name: &str)
where
    C: NodeApi + 'static,
    P: PulseRunner + 'static,
{
    let Some(guard) = locks.try_acquire(node_name) else {
        info!(
            node = node_name,
            "reconcile already in progress, discarding duplicate ready event"
        );
        return;
    };

    let controller = Arc::clone(controller);
    let name = node_name.to_string();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = controller.reconcile_node(&name).await {
            error!(node = %name, error = %e, "reconcile failed");
        }
    });
}
