use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use nearby_config::schema::NotificationsConfig;

use super::*;
use crate::backend::testing::{RefusingFeed, SlowNotifications};
use crate::backend::{MemoryBackend, MonotonicClock};
use crate::notifications::{NewNotification, NotificationKind, RelatedUser};

struct Harness {
    backend: Arc<MemoryBackend>,
    manager: Arc<SubscriptionManager>,
}

impl Harness {
    fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new(Arc::new(MonotonicClock::new())));
        Self {
            manager: Arc::new(SubscriptionManager::new(backend.clone())),
            backend,
        }
    }

    fn feed(&self, user_id: &str) -> NotificationFeed {
        self.feed_with(user_id, self.backend.clone(), &NotificationsConfig::default())
    }

    fn feed_with(
        &self,
        user_id: &str,
        store: Arc<dyn NotificationStore>,
        config: &NotificationsConfig,
    ) -> NotificationFeed {
        NotificationFeed::new(user_id, store, Arc::clone(&self.manager), config)
    }

    fn notify(&self, user_id: &str, related: Option<&str>) -> Notification {
        self.backend.insert_notification(NewNotification {
            user_id: user_id.into(),
            kind: NotificationKind::EventJoin,
            title: "New attendee".into(),
            message: "Someone is coming to your BBQ".into(),
            related_user_id: related.map(str::to_string),
        })
    }
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn insert_bumps_unread_with_related_user() {
    let h = Harness::new();
    h.backend.add_profile(RelatedUser {
        id: "alice".into(),
        display_name: Some("Alice".into()),
        avatar_url: Some("https://cdn.example/alice.png".into()),
    });
    h.notify("bob", None);

    let feed = h.feed("bob");
    feed.start().await.unwrap();
    let before = feed.unread_count();
    assert_eq!(before, 1);

    let inserted = h.notify("bob", Some("alice"));
    settle().await;

    assert_eq!(feed.unread_count(), before + 1);
    let items = feed.items();
    let item = items.iter().find(|n| n.id == inserted.id).unwrap();
    assert_eq!(
        item.related_user.as_ref().unwrap().display_name.as_deref(),
        Some("Alice")
    );
}

#[tokio::test]
async fn other_recipients_do_not_trigger_refetch() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(h.backend.clone(), Duration::ZERO));
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    feed.start().await.unwrap();

    h.notify("carol", None);
    settle().await;
    assert_eq!(store.list_calls(), 1);
    assert_eq!(feed.unread_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_coalesce() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(
        h.backend.clone(),
        Duration::from_millis(100),
    ));
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    feed.start().await.unwrap();
    assert_eq!(store.list_calls(), 1);

    join_all((0..5).map(|_| feed.refresh())).await;

    // One fetch plus one follow-up for everything requested meanwhile.
    assert_eq!(store.list_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn insert_burst_refetches_at_most_twice() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(
        h.backend.clone(),
        Duration::from_millis(100),
    ));
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    feed.start().await.unwrap();

    for _ in 0..4 {
        h.notify("bob", None);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(store.list_calls(), 3);
    assert_eq!(feed.unread_count(), 4);
}

#[tokio::test]
async fn failed_fetch_keeps_previous_view() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(h.backend.clone(), Duration::ZERO));
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    h.notify("bob", None);
    feed.start().await.unwrap();
    assert_eq!(feed.items().len(), 1);

    store.fail_lists(true);
    h.notify("bob", None);
    settle().await;
    assert_eq!(feed.items().len(), 1);

    store.fail_lists(false);
    feed.refresh().await;
    assert_eq!(feed.items().len(), 2);
}

#[tokio::test]
async fn mark_read_updates_unread_count() {
    let h = Harness::new();
    let first = h.notify("bob", None);
    h.notify("bob", None);
    h.notify("bob", None);
    let feed = h.feed("bob");
    feed.start().await.unwrap();
    let mut unread = feed.watch_unread();
    assert_eq!(*unread.borrow_and_update(), 3);

    feed.mark_read(&first.id).await.unwrap();
    assert_eq!(feed.unread_count(), 2);
    assert!(unread.has_changed().unwrap());
    assert!(feed.items().iter().find(|n| n.id == first.id).unwrap().is_read);

    feed.mark_all_read().await.unwrap();
    assert_eq!(feed.unread_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn mark_read_waits_for_a_fetch_that_sees_the_write() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(
        h.backend.clone(),
        Duration::from_millis(100),
    ));
    let first = h.notify("bob", None);
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    feed.start().await.unwrap();

    h.notify("bob", None);
    settle().await;
    // The insert-triggered refetch is now in flight.
    assert_eq!(store.list_calls(), 2);

    feed.mark_read(&first.id).await.unwrap();

    assert!(feed.items().iter().find(|n| n.id == first.id).unwrap().is_read);
    assert_eq!(feed.items().len(), 2);
    assert_eq!(feed.unread_count(), 1);
    assert_eq!(store.list_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn fetch_is_coalesced_with_refreshes() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(
        h.backend.clone(),
        Duration::from_millis(100),
    ));
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    feed.start().await.unwrap();
    h.notify("bob", None);

    let (_, fetched, again) = tokio::join!(feed.refresh(), feed.fetch(), feed.fetch());

    assert_eq!(store.list_calls(), 3);
    assert_eq!(fetched.unwrap().len(), 1);
    assert_eq!(again.unwrap().len(), 1);
    assert_eq!(feed.items().len(), 1);
}

#[tokio::test]
async fn failed_fetch_is_returned_and_view_kept() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(h.backend.clone(), Duration::ZERO));
    h.notify("bob", None);
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    feed.start().await.unwrap();

    store.fail_lists(true);
    h.notify("bob", None);
    let err = feed.fetch().await.unwrap_err();

    assert!(matches!(err, LiveError::Network(_)));
    assert_eq!(feed.items().len(), 1);
}

#[tokio::test]
async fn rejected_mark_read_leaves_view_untouched() {
    let h = Harness::new();
    let n = h.notify("bob", None);
    let feed = h.feed("bob");
    feed.start().await.unwrap();

    h.backend.reject_writes(true);
    let err = feed.mark_read(&n.id).await.unwrap_err();
    assert!(matches!(err, LiveError::WriteRejected(_)));
    assert_eq!(feed.unread_count(), 1);
}

#[tokio::test]
async fn stop_closes_subscription_and_ignores_later_inserts() {
    let h = Harness::new();
    let store = Arc::new(SlowNotifications::new(h.backend.clone(), Duration::ZERO));
    let feed = h.feed_with("bob", store.clone(), &NotificationsConfig::default());
    feed.start().await.unwrap();
    assert_eq!(h.manager.open_count(), 1);

    feed.stop();
    h.notify("bob", None);
    settle().await;

    assert_eq!(h.manager.open_count(), 0);
    assert_eq!(store.list_calls(), 1);
    assert_eq!(feed.unread_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn descending_order_lists_newest_first() {
    let h = Harness::new();
    let old = h.notify("bob", None);
    tokio::time::sleep(Duration::from_secs(60)).await;
    let new = h.notify("bob", None);

    let config = NotificationsConfig {
        order: FeedOrder::Desc,
        ..Default::default()
    };
    let feed = h.feed_with("bob", h.backend.clone(), &config);
    let items = feed.fetch().await.unwrap();
    assert_eq!(items[0].id, new.id);
    assert_eq!(items[1].id, old.id);
}

#[tokio::test]
async fn subscription_failure_still_loads_initial_view() {
    let backend = Arc::new(MemoryBackend::new(Arc::new(MonotonicClock::new())));
    backend.insert_notification(NewNotification {
        user_id: "bob".into(),
        kind: NotificationKind::System,
        title: "Welcome".into(),
        message: "Say hi to your neighbors".into(),
        related_user_id: None,
    });
    let manager = Arc::new(SubscriptionManager::new(Arc::new(RefusingFeed)));
    let feed = NotificationFeed::new("bob", backend, manager, &NotificationsConfig::default());

    let err = feed.start().await.unwrap_err();
    assert!(matches!(err, LiveError::SubscriptionFailure(_)));
    assert_eq!(feed.unread_count(), 1);
}
