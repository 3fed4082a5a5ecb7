//! Collaborator doubles shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LiveError;
use crate::notifications::{FeedOrder, Notification};

use super::{ChangeFeed, FeedSubscription, FeedSubscriptionId, NotificationStore, TopicSpec};

/// Refuses every subscription.
pub(crate) struct RefusingFeed;

#[async_trait]
impl ChangeFeed for RefusingFeed {
    async fn subscribe(&self, spec: &TopicSpec) -> Result<FeedSubscription, LiveError> {
        Err(LiveError::SubscriptionFailure(format!("{} refused", spec.name)))
    }

    async fn announce(&self, _: FeedSubscriptionId, _: serde_json::Value) -> Result<(), LiveError> {
        Ok(())
    }

    async fn unsubscribe(&self, _: FeedSubscriptionId) {}
}

/// Notification store that takes `delay` per list call and counts calls.
pub(crate) struct SlowNotifications<S> {
    inner: Arc<S>,
    delay: Duration,
    lists: AtomicUsize,
    failing: AtomicBool,
}

impl<S> SlowNotifications<S> {
    pub(crate) fn new(inner: Arc<S>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            lists: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_lists(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: NotificationStore> NotificationStore for SlowNotifications<S> {
    async fn list(&self, user_id: &str, order: FeedOrder) -> Result<Vec<Notification>, LiveError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LiveError::Network("connection reset".into()));
        }
        self.inner.list(user_id, order).await
    }

    async fn mark_read(&self, notification_id: &str) -> Result<(), LiveError> {
        self.inner.mark_read(notification_id).await
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<(), LiveError> {
        self.inner.mark_all_read(user_id).await
    }
}
