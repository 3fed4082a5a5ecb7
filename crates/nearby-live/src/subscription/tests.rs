use std::sync::{Arc, Mutex};

use serde_json::json;

use super::*;
use crate::backend::testing::RefusingFeed;
use crate::backend::{ChangeKind, MemoryBackend, RowEvent, RowFilter, RowKey, RowStore, SystemClock};

fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(Arc::new(SystemClock)))
}

fn status_topic() -> TopicSpec {
    TopicSpec::rows("status:all", RowFilter::new("user_status", RowEvent::All))
}

fn recorder() -> (Arc<Mutex<Vec<ChangeEvent>>>, impl Fn(ChangeEvent) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |e| sink.lock().unwrap().push(e))
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn write_row(backend: &MemoryBackend, user: &str, n: u32) {
    backend
        .upsert("user_status", &RowKey::new("user_id", user), json!({"n": n}))
        .await
        .unwrap();
}

#[tokio::test]
async fn events_arrive_in_emission_order() {
    let backend = backend();
    let manager = SubscriptionManager::new(backend.clone());
    let (seen, on_event) = recorder();
    manager.open("test", status_topic(), on_event).await.unwrap();

    for n in 0..5 {
        write_row(&backend, "alice", n).await;
    }
    settle().await;

    let seen = seen.lock().unwrap();
    let order: Vec<u64> = seen.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    assert_eq!(seen[0].kind, ChangeKind::Insert);
    assert_eq!(seen[1].kind, ChangeKind::Update);
}

#[tokio::test]
async fn close_twice_is_harmless() {
    let backend = backend();
    let manager = SubscriptionManager::new(backend.clone());
    let handle = manager.open("test", status_topic(), |_| {}).await.unwrap();
    assert_eq!(manager.open_count(), 1);

    manager.close(&handle);
    manager.close(&handle);
    settle().await;

    assert_eq!(manager.open_count(), 0);
    assert!(!manager.is_open(&handle));
    assert_eq!(backend.active_subscriptions(), 0);
}

#[tokio::test]
async fn reopen_closes_stale_handle() {
    let backend = backend();
    let manager = SubscriptionManager::new(backend.clone());
    let (first_seen, first) = recorder();
    let (second_seen, second) = recorder();

    let stale = manager.open("feed", status_topic(), first).await.unwrap();
    let fresh = manager.open("feed", status_topic(), second).await.unwrap();
    settle().await;

    assert!(!manager.is_open(&stale));
    assert!(manager.is_open(&fresh));
    assert_eq!(manager.open_count(), 1);
    assert_eq!(backend.active_subscriptions(), 1);

    write_row(&backend, "alice", 1).await;
    settle().await;
    assert!(first_seen.lock().unwrap().is_empty());
    assert_eq!(second_seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn different_owners_share_a_topic() {
    let backend = backend();
    let manager = SubscriptionManager::new(backend.clone());
    manager.open("a", status_topic(), |_| {}).await.unwrap();
    manager.open("b", status_topic(), |_| {}).await.unwrap();
    assert_eq!(manager.open_count(), 2);
}

#[tokio::test]
async fn close_drops_events_already_received() {
    let backend = backend();
    let manager = SubscriptionManager::new(backend.clone());
    let (seen, on_event) = recorder();
    let handle = manager.open("test", status_topic(), on_event).await.unwrap();

    // Buffered in the handle's channel; the dispatcher has not run yet.
    write_row(&backend, "alice", 1).await;
    write_row(&backend, "alice", 2).await;
    manager.close(&handle);
    settle().await;

    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn callback_may_close_its_own_handle() {
    let backend = backend();
    let manager = Arc::new(SubscriptionManager::new(backend.clone()));
    let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let count = Arc::new(AtomicU64::new(0));

    let handle = {
        let manager = Arc::clone(&manager);
        let slot = Arc::clone(&slot);
        let count = Arc::clone(&count);
        manager
            .clone()
            .open("test", status_topic(), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(h) = slot.lock().unwrap().as_ref() {
                    manager.close(h);
                }
            })
            .await
            .unwrap()
    };
    *slot.lock().unwrap() = Some(handle.clone());

    for n in 0..3 {
        write_row(&backend, "alice", n).await;
    }
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!manager.is_open(&handle));
}

#[tokio::test]
async fn announce_on_closed_handle_fails() {
    let backend = backend();
    let manager = SubscriptionManager::new(backend.clone());
    let handle = manager
        .open("me", TopicSpec::presence("presence:hood", "alice"), |_| {})
        .await
        .unwrap();
    manager.announce(&handle, json!({"user_id": "alice"})).await.unwrap();
    manager.close(&handle);

    let err = manager.announce(&handle, json!({})).await.unwrap_err();
    assert!(matches!(err, LiveError::SubscriptionFailure(_)));
    assert_eq!(backend.announce_count("presence:hood"), 1);
}

#[tokio::test]
async fn subscribe_failure_leaves_nothing_open() {
    let manager = SubscriptionManager::new(Arc::new(RefusingFeed));
    let err = manager.open("test", status_topic(), |_| {}).await.unwrap_err();
    assert!(matches!(err, LiveError::SubscriptionFailure(_)));
    assert_eq!(manager.open_count(), 0);
}

#[tokio::test]
async fn close_all_releases_everything() {
    let backend = backend();
    let manager = SubscriptionManager::new(backend.clone());
    manager.open("a", status_topic(), |_| {}).await.unwrap();
    manager
        .open("b", TopicSpec::presence("presence:hood", "bob"), |_| {})
        .await
        .unwrap();

    manager.close_all();
    settle().await;
    assert_eq!(manager.open_count(), 0);
    assert_eq!(backend.active_subscriptions(), 0);
}
