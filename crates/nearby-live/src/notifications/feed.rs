//! Live notification feed for one recipient.
//!
//! Insert events are treated as "something changed" signals: each one
//! triggers a full refetch so the joined related-user projection is always
//! populated, never an incremental merge of the raw event row. Refetches are
//! deduplicated through a fetch gate: every refresh request takes a ticket,
//! one fetch runs at a time, and a caller returns only once a fetch that
//! started after its ticket has completed.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nearby_config::schema::NotificationsConfig;

use crate::backend::{NotificationStore, RowEvent, RowFilter, TopicSpec};
use crate::error::LiveError;
use crate::subscription::{SubscriptionHandle, SubscriptionManager};

use super::types::{FeedOrder, Notification};

#[derive(Debug, Default)]
struct FetchGate {
    in_flight: bool,
    /// Last ticket handed out.
    requested: u64,
}

/// Outcome of the most recent completed fetch.
#[derive(Debug, Clone)]
struct Pass {
    /// Every ticket up to this one was issued before the fetch started.
    covers: u64,
    outcome: Result<(), LiveError>,
}

/// Releases the gate if the owning fetch is dropped mid-flight (aborted),
/// waking waiters so one of them takes over.
struct InFlight<'a> {
    gate: &'a Mutex<FetchGate>,
    passes: &'a watch::Sender<Pass>,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.gate.lock().unwrap_or_else(|e| e.into_inner()).in_flight = false;
            self.passes.send_modify(|_| {});
        }
    }
}

struct Inner {
    user_id: String,
    store: Arc<dyn NotificationStore>,
    manager: Arc<SubscriptionManager>,
    table: String,
    order: FeedOrder,
    items: RwLock<Vec<Notification>>,
    unread: watch::Sender<usize>,
    gate: Mutex<FetchGate>,
    passes: watch::Sender<Pass>,
    handle: Mutex<Option<SubscriptionHandle>>,
    refetches: Mutex<Vec<JoinHandle<()>>>,
}

/// Notification feed of one recipient.
pub struct NotificationFeed {
    inner: Arc<Inner>,
}

impl NotificationFeed {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn NotificationStore>,
        manager: Arc<SubscriptionManager>,
        config: &NotificationsConfig,
    ) -> Self {
        let (unread, _) = watch::channel(0);
        let (passes, _) = watch::channel(Pass {
            covers: 0,
            outcome: Ok(()),
        });
        Self {
            inner: Arc::new(Inner {
                user_id: user_id.into(),
                store,
                manager,
                table: config.table.clone(),
                order: config.order,
                items: RwLock::new(Vec::new()),
                unread,
                gate: Mutex::new(FetchGate::default()),
                passes,
                handle: Mutex::new(None),
                refetches: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Fetch the full feed and return the refreshed view. Shares the fetch
    /// gate with event-driven refreshes; a failed fetch leaves the view as
    /// it was and is returned.
    pub async fn fetch(&self) -> Result<Vec<Notification>, LiveError> {
        self.inner.refresh().await?;
        Ok(self.items())
    }

    /// Open the insert subscription and load the initial view.
    ///
    /// The initial fetch runs even when subscribing fails; the view is then
    /// only as fresh as the last explicit refresh.
    pub async fn start(&self) -> Result<(), LiveError> {
        let user_id = &self.inner.user_id;
        let spec = TopicSpec::rows(
            format!("notifications:{user_id}"),
            RowFilter::new(&self.inner.table, RowEvent::Insert).eq("user_id", user_id),
        );
        let weak = Arc::downgrade(&self.inner);
        let opened = self
            .inner
            .manager
            .open(&format!("feed:{user_id}"), spec, move |event| {
                debug!(topic = %event.topic, "Notification inserted; refetching");
                Inner::spawn_refresh(&weak);
            })
            .await;

        let result = match opened {
            Ok(handle) => {
                if let Some(stale) = self.inner.handle().replace(handle) {
                    self.inner.manager.close(&stale);
                }
                Ok(())
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Notification subscription failed");
                Err(e)
            }
        };

        let _ = self.inner.refresh().await;
        info!(user_id = %user_id, items = self.items().len(), "Notification feed started");
        result
    }

    /// Refetch, coalescing with a fetch already in flight. Read failures
    /// keep the previous view.
    pub async fn refresh(&self) {
        let _ = self.inner.refresh().await;
    }

    /// Mark one notification read, then refetch. Returns once the view
    /// reflects a fetch issued after the write.
    pub async fn mark_read(&self, notification_id: &str) -> Result<(), LiveError> {
        self.inner.store.mark_read(notification_id).await?;
        let _ = self.inner.refresh().await;
        Ok(())
    }

    /// Mark every notification of this recipient read, then refetch.
    pub async fn mark_all_read(&self) -> Result<(), LiveError> {
        self.inner.store.mark_all_read(&self.inner.user_id).await?;
        let _ = self.inner.refresh().await;
        Ok(())
    }

    pub fn items(&self) -> Vec<Notification> {
        self.inner.items().clone()
    }

    pub fn unread_count(&self) -> usize {
        *self.inner.unread.borrow()
    }

    pub fn watch_unread(&self) -> watch::Receiver<usize> {
        self.inner.unread.subscribe()
    }

    /// Close the subscription and abort pending refetches.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.handle().take() {
            self.inner.manager.close(&handle);
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.refetches().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        debug!(user_id = %self.inner.user_id, "Notification feed stopped");
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn items(&self) -> std::sync::RwLockReadGuard<'_, Vec<Notification>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self) -> MutexGuard<'_, Option<SubscriptionHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refetches(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.refetches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, FetchGate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn replace(&self, items: Vec<Notification>) {
        let unread = items.iter().filter(|n| !n.is_read).count();
        *self.items.write().unwrap_or_else(|e| e.into_inner()) = items;
        self.unread.send_replace(unread);
    }

    fn spawn_refresh(weak: &Weak<Inner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let task_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let _ = task_inner.refresh().await;
        });
        let mut refetches = inner.refetches();
        refetches.retain(|t| !t.is_finished());
        refetches.push(task);
    }

    /// Refetch, coalescing with a fetch already in flight. Resolves with
    /// the outcome of the first fetch that started after this call.
    async fn refresh(&self) -> Result<(), LiveError> {
        let mut passes = self.passes.subscribe();
        let ticket = {
            let mut gate = self.gate();
            gate.requested += 1;
            gate.requested
        };

        loop {
            {
                let mut gate = self.gate();
                let pass = passes.borrow_and_update();
                if pass.covers >= ticket {
                    return pass.outcome.clone();
                }
                if !gate.in_flight {
                    gate.in_flight = true;
                    break;
                }
            }
            debug!(user_id = %self.user_id, ticket, "Fetch in flight; waiting for the next one");
            if passes.changed().await.is_err() {
                return Ok(());
            }
        }

        let mut in_flight = InFlight {
            gate: &self.gate,
            passes: &self.passes,
            finished: false,
        };
        loop {
            let covers = self.gate().requested;
            let outcome = match self.store.list(&self.user_id, self.order).await {
                Ok(items) => {
                    self.replace(items);
                    Ok(())
                }
                Err(e) => {
                    warn!(user_id = %self.user_id, error = %e, "Notification fetch failed; keeping previous view");
                    Err(e)
                }
            };
            self.passes.send_replace(Pass {
                covers,
                outcome: outcome.clone(),
            });

            let mut gate = self.gate();
            if gate.requested > covers {
                continue;
            }
            gate.in_flight = false;
            in_flight.finished = true;
            return outcome;
        }
    }
}

#[cfg(test)]
mod tests;
