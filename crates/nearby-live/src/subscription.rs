//! Delivery subscription manager.
//!
//! Owns every open logical channel of a session. Each handle gets one
//! dispatcher task that drains the transport's ordered event stream into the
//! handle's callback, so events on one topic are delivered in emission
//! order. Closing is synchronous: once [`SubscriptionManager::close`]
//! returns, no further callback for that handle starts.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{ChangeEvent, ChangeFeed, FeedSubscriptionId, TopicSpec};
use crate::error::LiveError;

/// Callback invoked for every event delivered on a handle.
pub type EventCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

thread_local! {
    /// Handle whose callback is running on this thread, if any.
    static DISPATCHING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Process-local identity of one open subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// A logical channel opened by an owner. Must be released with
/// [`SubscriptionManager::close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: HandleId,
    topic: String,
    owner: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Delivery gate. A callback runs only while holding `lock` with `closed`
/// unset.
struct Gate {
    closed: AtomicBool,
    lock: Mutex<()>,
}

impl Gate {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the callback unless the gate is closed. Returns `false` once closed.
    fn deliver(&self, id: HandleId, event: ChangeEvent, on_event: &(dyn Fn(ChangeEvent) + Send + Sync)) -> bool {
        let _guard = self.guard();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        DISPATCHING.with(|d| d.set(Some(id.0)));
        on_event(event);
        DISPATCHING.with(|d| d.set(None));
        true
    }

    /// Close the gate and wait out any callback already running, unless
    /// that callback is the caller.
    fn close(&self, id: HandleId) {
        self.closed.store(true, Ordering::Release);
        let inside_own_callback = DISPATCHING.with(|d| d.get() == Some(id.0));
        if !inside_own_callback {
            drop(self.guard());
        }
    }
}

struct Entry {
    handle: SubscriptionHandle,
    feed_id: FeedSubscriptionId,
    gate: Arc<Gate>,
    task: JoinHandle<()>,
    runtime: Handle,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<HandleId, Entry>,
    by_key: HashMap<(String, String), HandleId>,
}

impl Registry {
    fn take(&mut self, id: HandleId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        let key = (entry.handle.topic.clone(), entry.handle.owner.clone());
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
        Some(entry)
    }
}

/// Opens and closes change-feed subscriptions on behalf of owners.
pub struct SubscriptionManager {
    feed: Arc<dyn ChangeFeed>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open `spec` for `owner`. An existing handle for the same topic and
    /// owner is closed first.
    pub async fn open<F>(
        &self,
        owner: &str,
        spec: TopicSpec,
        on_event: F,
    ) -> Result<SubscriptionHandle, LiveError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let key = (spec.name.clone(), owner.to_string());
        self.close_stale(&key);

        let subscription = self.feed.subscribe(&spec).await.map_err(|e| {
            warn!(topic = %spec.name, owner = %owner, error = %e, "Subscribe failed");
            e
        })?;

        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = SubscriptionHandle {
            id,
            topic: spec.name.clone(),
            owner: owner.to_string(),
        };
        let gate = Arc::new(Gate::new());
        let task = tokio::spawn(dispatch(
            id,
            subscription.events,
            Arc::clone(&gate),
            Arc::new(on_event),
        ));

        // A concurrent open for the same key may have finished meanwhile.
        self.close_stale(&key);
        {
            let mut registry = self.registry();
            registry.by_key.insert(key, id);
            registry.entries.insert(
                id,
                Entry {
                    handle: handle.clone(),
                    feed_id: subscription.id,
                    gate,
                    task,
                    runtime: Handle::current(),
                },
            );
        }
        info!(handle = %id, topic = %handle.topic, owner = %owner, "Subscription opened");
        Ok(handle)
    }

    fn close_stale(&self, key: &(String, String)) {
        let stale = {
            let mut registry = self.registry();
            match registry.by_key.get(key).copied() {
                Some(id) => registry.take(id),
                None => None,
            }
        };
        if let Some(entry) = stale {
            warn!(
                handle = %entry.handle.id,
                topic = %entry.handle.topic,
                owner = %entry.handle.owner,
                "Re-opening subscription; closing stale handle"
            );
            self.release(entry);
        }
    }

    /// Close a handle. Idempotent; safe to call from inside the handle's
    /// own callback. Server-side release is not awaited.
    pub fn close(&self, handle: &SubscriptionHandle) {
        let entry = self.registry().take(handle.id);
        match entry {
            Some(entry) => self.release(entry),
            None => debug!(handle = %handle.id, "Close on already closed handle"),
        }
    }

    /// Close every open handle.
    pub fn close_all(&self) {
        let entries: Vec<Entry> = {
            let mut registry = self.registry();
            registry.by_key.clear();
            registry.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            self.release(entry);
        }
    }

    fn release(&self, entry: Entry) {
        entry.gate.close(entry.handle.id);
        entry.task.abort();
        let feed = Arc::clone(&self.feed);
        let feed_id = entry.feed_id;
        entry.runtime.spawn(async move {
            feed.unsubscribe(feed_id).await;
        });
        debug!(handle = %entry.handle.id, topic = %entry.handle.topic, "Subscription closed");
    }

    /// Announce presence on a handle's topic.
    pub async fn announce(
        &self,
        handle: &SubscriptionHandle,
        payload: serde_json::Value,
    ) -> Result<(), LiveError> {
        let feed_id = self
            .registry()
            .entries
            .get(&handle.id)
            .map(|e| e.feed_id)
            .ok_or_else(|| {
                LiveError::SubscriptionFailure(format!("{} is closed", handle.id))
            })?;
        self.feed.announce(feed_id, payload).await
    }

    pub fn is_open(&self, handle: &SubscriptionHandle) -> bool {
        self.registry().entries.contains_key(&handle.id)
    }

    pub fn open_count(&self) -> usize {
        self.registry().entries.len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

async fn dispatch(
    id: HandleId,
    mut events: mpsc::Receiver<ChangeEvent>,
    gate: Arc<Gate>,
    on_event: EventCallback,
) {
    while let Some(event) = events.recv().await {
        if !gate.deliver(id, event, &*on_event) {
            break;
        }
    }
    debug!(handle = %id, "Dispatcher stopped");
}

#[cfg(test)]
mod tests;
