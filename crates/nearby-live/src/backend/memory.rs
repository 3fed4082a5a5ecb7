//! In-process backend: change feed, row store, and notification log in one.
//!
//! Behaves like the hosted backend from the engine's point of view: presence
//! topics get a full `Sync` on subscribe, every announce is reported as a
//! join of a fresh ref plus a leave of the previous one, and row writes are
//! pushed to subscriptions whose filter matches.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::LiveError;
use crate::notifications::{sort_feed, FeedOrder, NewNotification, Notification, RelatedUser};

use super::{
    json_guard_eq, json_scalar_eq, ChangeEvent, ChangeFeed, ChangeKind, Clock, FeedSubscription,
    FeedSubscriptionId, NotificationStore, PresenceMap, RowKey, RowStore, TopicSpec,
};

/// Per-subscription event buffer.
const FEED_BUFFER: usize = 256;

const DEFAULT_NOTIFICATIONS_TABLE: &str = "notifications";

struct Subscriber {
    spec: TopicSpec,
    tx: mpsc::Sender<ChangeEvent>,
    /// `(presence key, phx_ref)` of the current announcement, if any.
    announced: Option<(String, String)>,
}

#[derive(Default)]
struct MemoryState {
    next_subscription: u64,
    next_ref: u64,
    subscribers: BTreeMap<FeedSubscriptionId, Subscriber>,
    presence: HashMap<String, PresenceMap>,
    announces: HashMap<String, u64>,
    tables: HashMap<String, Vec<Value>>,
    notifications: Vec<Notification>,
    profiles: HashMap<String, RelatedUser>,
    reject_writes: bool,
}

impl MemoryState {
    /// Deliver to every subscriber for which `want` returns an event.
    fn fan_out(&self, mut want: impl FnMut(&Subscriber) -> Option<ChangeEvent>) {
        for (id, sub) in &self.subscribers {
            let Some(event) = want(sub) else { continue };
            match sub.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = %id, topic = %sub.spec.name, "Subscriber buffer full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = %id, "Subscriber receiver dropped");
                }
            }
        }
    }

    fn fan_out_presence(&self, topic: &str, kind: ChangeKind, payload: &Value) {
        self.fan_out(|sub| {
            (sub.spec.is_presence() && sub.spec.name == topic)
                .then(|| ChangeEvent::new(topic, kind, payload.clone()))
        });
    }

    fn fan_out_rows(&self, table: &str, kind: ChangeKind, record: &Value) {
        self.fan_out(|sub| {
            let filter = sub.spec.rows.as_ref()?;
            filter
                .matches(table, kind, record)
                .then(|| ChangeEvent::new(sub.spec.name.clone(), kind, record.clone()))
        });
    }

    fn check_writable(&self) -> Result<(), LiveError> {
        if self.reject_writes {
            Err(LiveError::WriteRejected(
                "row-level security policy violation".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// In-process implementation of [`ChangeFeed`], [`RowStore`], and
/// [`NotificationStore`].
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    notifications_table: String,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            notifications_table: DEFAULT_NOTIFICATIONS_TABLE.to_string(),
        }
    }

    /// Table name row subscriptions must filter on to see notification inserts.
    pub fn with_notifications_table(mut self, table: impl Into<String>) -> Self {
        self.notifications_table = table.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a notification the way a server-side trigger would, and push
    /// the insert to matching subscriptions.
    pub fn insert_notification(&self, new: NewNotification) -> Notification {
        let notification = Notification {
            id: nearby_common::new_id(),
            user_id: new.user_id,
            kind: new.kind,
            title: new.title,
            message: new.message,
            is_read: false,
            related_user_id: new.related_user_id,
            created_at: self.clock.now(),
            related_user: None,
        };
        let record = serde_json::to_value(&notification).unwrap_or(Value::Null);

        let mut state = self.lock();
        state.notifications.push(notification.clone());
        state.fan_out_rows(&self.notifications_table, ChangeKind::Insert, &record);
        debug!(id = %notification.id, user_id = %notification.user_id, "Notification inserted");
        notification
    }

    /// Register display data joined into notifications as `related_user`.
    pub fn add_profile(&self, profile: RelatedUser) {
        self.lock().profiles.insert(profile.id.clone(), profile);
    }

    /// While set, every write fails with `WriteRejected`.
    pub fn reject_writes(&self, reject: bool) {
        self.lock().reject_writes = reject;
    }

    /// Drop all presence state as a lost connection would, sending an empty
    /// `Sync` to every presence subscriber.
    pub fn drop_presence(&self) {
        let mut state = self.lock();
        state.presence.clear();
        for sub in state.subscribers.values_mut() {
            sub.announced = None;
        }
        let topics: Vec<String> = state
            .subscribers
            .values()
            .filter(|s| s.spec.is_presence())
            .map(|s| s.spec.name.clone())
            .collect();
        for topic in topics {
            state.fan_out_presence(&topic, ChangeKind::Sync, &json!({}));
        }
    }

    /// Number of announcements received on `topic`.
    pub fn announce_count(&self, topic: &str) -> u64 {
        self.lock().announces.get(topic).copied().unwrap_or(0)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Presence keys currently announced on `topic`.
    pub fn online_keys(&self, topic: &str) -> Vec<String> {
        self.lock()
            .presence
            .get(topic)
            .map(|p| p.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, spec: &TopicSpec) -> Result<FeedSubscription, LiveError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = self.lock();
        state.next_subscription += 1;
        let id = FeedSubscriptionId(state.next_subscription);

        if spec.is_presence() {
            let snapshot = state
                .presence
                .get(&spec.name)
                .map(PresenceMap::to_payload)
                .unwrap_or_else(|| json!({}));
            // Fresh channel with room for FEED_BUFFER events.
            let _ = tx.try_send(ChangeEvent::new(&spec.name, ChangeKind::Sync, snapshot));
        }

        state.subscribers.insert(
            id,
            Subscriber {
                spec: spec.clone(),
                tx,
                announced: None,
            },
        );
        debug!(subscription = %id, topic = %spec.name, "Subscribed");
        Ok(FeedSubscription { id, events: rx })
    }

    async fn announce(&self, id: FeedSubscriptionId, payload: Value) -> Result<(), LiveError> {
        let mut state = self.lock();
        state.next_ref += 1;
        let new_ref = format!("ref-{}", state.next_ref);

        let sub = state
            .subscribers
            .get_mut(&id)
            .ok_or_else(|| LiveError::SubscriptionFailure(format!("unknown subscription {id}")))?;
        let key = sub.spec.presence_key.clone().ok_or_else(|| {
            LiveError::SubscriptionFailure(format!("{} is not a presence topic", sub.spec.name))
        })?;
        let topic = sub.spec.name.clone();
        let previous = sub.announced.replace((key.clone(), new_ref.clone()));

        let mut meta = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        meta.insert("phx_ref".to_string(), Value::String(new_ref));
        let joins = json!({ key.clone(): [Value::Object(meta)] });

        let presence = state.presence.entry(topic.clone()).or_default();
        presence.join(&PresenceMap::from_payload(&joins));
        let leaves = previous.map(|(old_key, old_ref)| json!({ old_key: [{ "phx_ref": old_ref }] }));
        if let Some(leaves) = &leaves {
            presence.leave(&PresenceMap::from_payload(leaves));
        }
        *state.announces.entry(topic.clone()).or_default() += 1;

        state.fan_out_presence(&topic, ChangeKind::Join, &joins);
        if let Some(leaves) = leaves {
            state.fan_out_presence(&topic, ChangeKind::Leave, &leaves);
        }
        Ok(())
    }

    async fn unsubscribe(&self, id: FeedSubscriptionId) {
        let mut state = self.lock();
        let Some(sub) = state.subscribers.remove(&id) else {
            return;
        };
        debug!(subscription = %id, topic = %sub.spec.name, "Unsubscribed");
        if let Some((key, phx_ref)) = sub.announced {
            let leaves = json!({ key: [{ "phx_ref": phx_ref }] });
            if let Some(presence) = state.presence.get_mut(&sub.spec.name) {
                presence.leave(&PresenceMap::from_payload(&leaves));
            }
            state.fan_out_presence(&sub.spec.name, ChangeKind::Leave, &leaves);
        }
    }
}

fn row_matches(row: &Value, key: &RowKey) -> bool {
    row.get(&key.column)
        .is_some_and(|v| json_scalar_eq(v, &key.value))
}

#[async_trait]
impl RowStore for MemoryBackend {
    async fn upsert(&self, table: &str, key: &RowKey, mut record: Value) -> Result<(), LiveError> {
        let mut state = self.lock();
        state.check_writable()?;
        if let Some(obj) = record.as_object_mut() {
            obj.entry(key.column.clone())
                .or_insert_with(|| Value::String(key.value.clone()));
        }

        let rows = state.tables.entry(table.to_string()).or_default();
        let kind = match rows.iter_mut().find(|row| row_matches(row, key)) {
            Some(existing) => {
                *existing = record.clone();
                ChangeKind::Update
            }
            None => {
                rows.push(record.clone());
                ChangeKind::Insert
            }
        };
        state.fan_out_rows(table, kind, &record);
        Ok(())
    }

    async fn update_if(
        &self,
        table: &str,
        key: &RowKey,
        guard: &RowKey,
        mut record: Value,
    ) -> Result<bool, LiveError> {
        let mut state = self.lock();
        state.check_writable()?;
        if let Some(obj) = record.as_object_mut() {
            obj.entry(key.column.clone())
                .or_insert_with(|| Value::String(key.value.clone()));
        }

        let Some(existing) = state.tables.get_mut(table).and_then(|rows| {
            rows.iter_mut().find(|row| {
                row_matches(row, key)
                    && row
                        .get(&guard.column)
                        .is_some_and(|v| json_guard_eq(v, &guard.value))
            })
        }) else {
            debug!(table = %table, key = %key.value, guard = %guard.column, "Guarded update skipped");
            return Ok(false);
        };
        *existing = record.clone();
        state.fan_out_rows(table, ChangeKind::Update, &record);
        Ok(true)
    }

    async fn get(&self, table: &str, key: &RowKey) -> Result<Option<Value>, LiveError> {
        let state = self.lock();
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|row| row_matches(row, key)))
            .cloned())
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), LiveError> {
        let mut state = self.lock();
        state.check_writable()?;
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(());
        };
        let (removed, kept): (Vec<Value>, Vec<Value>) =
            rows.drain(..).partition(|row| row_matches(row, key));
        *rows = kept;
        for old in &removed {
            state.fan_out_rows(table, ChangeKind::Delete, old);
        }
        Ok(())
    }

    async fn select_eq(&self, table: &str, column: &str, value: &str) -> Result<Vec<Value>, LiveError> {
        let key = RowKey::new(column, value);
        let state = self.lock();
        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| row_matches(row, &key)).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl NotificationStore for MemoryBackend {
    async fn list(&self, user_id: &str, order: FeedOrder) -> Result<Vec<Notification>, LiveError> {
        let state = self.lock();
        let mut items: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| {
                let mut n = n.clone();
                n.related_user = n
                    .related_user_id
                    .as_ref()
                    .and_then(|id| state.profiles.get(id))
                    .cloned();
                n
            })
            .collect();
        sort_feed(&mut items, order);
        Ok(items)
    }

    async fn mark_read(&self, notification_id: &str) -> Result<(), LiveError> {
        let mut state = self.lock();
        state.check_writable()?;
        if let Some(n) = state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
        {
            n.is_read = true;
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<(), LiveError> {
        let mut state = self.lock();
        state.check_writable()?;
        for n in state.notifications.iter_mut().filter(|n| n.user_id == user_id) {
            n.is_read = true;
        }
        Ok(())
    }
}
