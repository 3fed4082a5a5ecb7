//! [`ChangeFeed`] over Supabase Realtime.
//!
//! One Phoenix channel is joined per topic no matter how many subscriptions
//! share it. A router task fans incoming realtime events out to the
//! subscriptions of each topic and keeps a presence cache so late
//! subscribers start from a full `Sync`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LiveError;
use crate::realtime::{ChannelConfig, PostgresChange, RealtimeClient, RealtimeConfig, RealtimeEvent};

use super::{
    ChangeEvent, ChangeFeed, ChangeKind, FeedSubscription, FeedSubscriptionId, PresenceMap,
    TopicSpec,
};

/// Per-subscription event buffer.
const FEED_BUFFER: usize = 256;

type JoinWaiter = oneshot::Sender<Result<(), String>>;

struct Channel {
    joined: bool,
    /// Spec of the subscription that created the channel; later ones must match.
    spec: TopicSpec,
    waiters: Vec<JoinWaiter>,
    presence: PresenceMap,
    subscribers: Vec<FeedSubscriptionId>,
    /// Subscription whose presence is currently tracked.
    tracked_by: Option<FeedSubscriptionId>,
}

struct Subscriber {
    topic: String,
    spec: TopicSpec,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    channels: HashMap<String, Channel>,
    subscribers: BTreeMap<FeedSubscriptionId, Subscriber>,
}

/// What `unsubscribe` must tell the server after updating local state.
enum Release {
    Nothing,
    Untrack(String),
    Leave(String),
}

impl RouterState {
    fn send(&self, id: FeedSubscriptionId, event: ChangeEvent) {
        let Some(sub) = self.subscribers.get(&id) else {
            return;
        };
        match sub.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(subscription = %id, topic = %sub.topic, "Subscriber buffer full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscription = %id, "Subscriber receiver dropped");
            }
        }
    }

    fn fan_out_presence(&self, topic: &str, kind: ChangeKind, payload: &Value) {
        let Some(channel) = self.channels.get(topic) else {
            return;
        };
        for id in &channel.subscribers {
            if self.subscribers.get(id).is_some_and(|s| s.spec.is_presence()) {
                self.send(*id, ChangeEvent::new(topic, kind, payload.clone()));
            }
        }
    }

    fn fan_out_rows(&self, topic: &str, change: &PostgresChange) {
        let Some(channel) = self.channels.get(topic) else {
            return;
        };
        let record = match change.kind {
            ChangeKind::Delete => &change.old_record,
            _ => &change.record,
        };
        for id in &channel.subscribers {
            let Some(filter) = self.subscribers.get(id).and_then(|s| s.spec.rows.as_ref()) else {
                continue;
            };
            if filter.matches(&change.table, change.kind, record) {
                self.send(*id, ChangeEvent::new(topic, change.kind, record.clone()));
            }
        }
    }

    fn handle(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::Connected => debug!("Realtime connected"),
            RealtimeEvent::ChannelJoined { topic } => {
                if let Some(channel) = self.channels.get_mut(&topic) {
                    channel.joined = true;
                    for waiter in channel.waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            RealtimeEvent::ChannelError { topic, message } => {
                if let Some(channel) = self.channels.get_mut(&topic) {
                    if channel.joined {
                        warn!(topic = %topic, message = %message, "Joined channel reported an error");
                    } else {
                        for waiter in channel.waiters.drain(..) {
                            let _ = waiter.send(Err(message.clone()));
                        }
                    }
                }
            }
            RealtimeEvent::PresenceState { topic, state } => {
                let snapshot = PresenceMap::from_payload(&presence_payload(state));
                let payload = match self.channels.get_mut(&topic) {
                    Some(channel) => {
                        channel.presence.sync(snapshot);
                        channel.presence.to_payload()
                    }
                    None => return,
                };
                self.fan_out_presence(&topic, ChangeKind::Sync, &payload);
            }
            RealtimeEvent::PresenceDiff {
                topic,
                joins,
                leaves,
            } => {
                let joins = presence_payload(joins);
                let leaves = presence_payload(leaves);
                let Some(channel) = self.channels.get_mut(&topic) else {
                    return;
                };
                channel.presence.join(&PresenceMap::from_payload(&joins));
                channel.presence.leave(&PresenceMap::from_payload(&leaves));
                if joins.as_object().is_some_and(|o| !o.is_empty()) {
                    self.fan_out_presence(&topic, ChangeKind::Join, &joins);
                }
                if leaves.as_object().is_some_and(|o| !o.is_empty()) {
                    self.fan_out_presence(&topic, ChangeKind::Leave, &leaves);
                }
            }
            RealtimeEvent::PostgresChange { topic, change } => {
                self.fan_out_rows(&topic, &change);
            }
            RealtimeEvent::Disconnected => {
                // Server-side presence went with the socket.
                let topics: Vec<String> = self.channels.keys().cloned().collect();
                for topic in topics {
                    if let Some(channel) = self.channels.get_mut(&topic) {
                        channel.joined = false;
                        channel.presence.clear();
                    }
                    self.fan_out_presence(&topic, ChangeKind::Sync, &Value::Object(Default::default()));
                }
            }
            RealtimeEvent::Error(message) => {
                warn!(message = %message, "Realtime error");
            }
        }
    }

    fn release(&mut self, id: FeedSubscriptionId) -> Release {
        let Some(sub) = self.subscribers.remove(&id) else {
            return Release::Nothing;
        };
        let Some(channel) = self.channels.get_mut(&sub.topic) else {
            return Release::Nothing;
        };
        channel.subscribers.retain(|s| *s != id);
        if channel.subscribers.is_empty() {
            self.channels.remove(&sub.topic);
            return Release::Leave(sub.topic);
        }
        if channel.tracked_by == Some(id) {
            channel.tracked_by = None;
            return Release::Untrack(sub.topic);
        }
        Release::Nothing
    }
}

/// Convert a parsed realtime presence map back into `{ key: [meta, ...] }`.
fn presence_payload(map: HashMap<String, Vec<Value>>) -> Value {
    Value::Object(
        map.into_iter()
            .map(|(key, metas)| (key, Value::Array(metas)))
            .collect(),
    )
}

fn channel_config(spec: &TopicSpec) -> ChannelConfig {
    ChannelConfig {
        presence_key: spec.presence_key.clone().unwrap_or_default(),
        postgres_changes: spec.rows.iter().cloned().collect(),
    }
}

/// Supabase Realtime implementation of [`ChangeFeed`].
pub struct SupabaseFeed {
    client: RealtimeClient,
    state: Arc<Mutex<RouterState>>,
    join_timeout: Duration,
    router: JoinHandle<()>,
}

impl SupabaseFeed {
    /// Open the realtime connection and start routing its events.
    pub fn connect(config: RealtimeConfig, join_timeout: Duration) -> Self {
        let (client, events) = RealtimeClient::connect(config);
        Self::from_parts(client, events, join_timeout)
    }

    pub fn from_parts(
        client: RealtimeClient,
        mut events: mpsc::Receiver<RealtimeEvent>,
        join_timeout: Duration,
    ) -> Self {
        let state = Arc::new(Mutex::new(RouterState::default()));
        let router_state = Arc::clone(&state);
        let router = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                router_state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle(event);
            }
            debug!("Realtime event stream ended");
        });
        Self {
            client,
            state,
            join_timeout,
            router,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn is_connected(&self) -> bool {
        self.client.is_connected().await
    }

    /// Number of channels joined or joining.
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Leave every channel and close the connection.
    pub async fn shutdown(&self) {
        self.client.disconnect().await;
        self.router.abort();
        info!("Supabase feed shut down");
    }

    async fn fail_subscribe(&self, id: FeedSubscriptionId, topic: &str, reason: String) -> LiveError {
        warn!(topic = %topic, subscription = %id, reason = %reason, "Channel join failed");
        let release = self.lock().release(id);
        self.apply(release).await;
        LiveError::SubscriptionFailure(format!("{topic}: {reason}"))
    }

    async fn apply(&self, release: Release) {
        match release {
            Release::Nothing => {}
            Release::Untrack(topic) => self.client.presence_untrack(&topic).await,
            Release::Leave(topic) => self.client.leave_channel(&topic).await,
        }
    }
}

impl Drop for SupabaseFeed {
    fn drop(&mut self) {
        self.router.abort();
    }
}

#[async_trait]
impl ChangeFeed for SupabaseFeed {
    async fn subscribe(&self, spec: &TopicSpec) -> Result<FeedSubscription, LiveError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let topic = spec.name.clone();

        let (id, needs_join) = {
            let mut state = self.lock();
            if let Some(channel) = state.channels.get(&topic) {
                if channel.spec != *spec {
                    return Err(LiveError::SubscriptionFailure(format!(
                        "{topic}: already joined with a different configuration"
                    )));
                }
            }

            state.next_id += 1;
            let id = FeedSubscriptionId(state.next_id);
            state.subscribers.insert(
                id,
                Subscriber {
                    topic: topic.clone(),
                    spec: spec.clone(),
                    tx,
                },
            );

            let mut needs_join = false;
            let channel = state.channels.entry(topic.clone()).or_insert_with(|| {
                needs_join = true;
                Channel {
                    joined: false,
                    spec: spec.clone(),
                    waiters: Vec::new(),
                    presence: PresenceMap::new(),
                    subscribers: Vec::new(),
                    tracked_by: None,
                }
            });
            channel.subscribers.push(id);

            if channel.joined {
                let snapshot = channel.presence.to_payload();
                if spec.is_presence() {
                    // Late subscribers start from the cached state.
                    state.send(id, ChangeEvent::new(&topic, ChangeKind::Sync, snapshot));
                }
                debug!(topic = %topic, subscription = %id, "Attached to joined channel");
                return Ok(FeedSubscription { id, events: rx });
            }
            channel.waiters.push(waiter_tx);
            (id, needs_join)
        };

        if needs_join {
            debug!(topic = %topic, subscription = %id, "Joining channel");
            self.client.join_channel(&topic, channel_config(spec)).await;
        }

        match tokio::time::timeout(self.join_timeout, waiter_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(topic = %topic, subscription = %id, "Subscribed");
                Ok(FeedSubscription { id, events: rx })
            }
            Ok(Ok(Err(reason))) => Err(self.fail_subscribe(id, &topic, reason).await),
            Ok(Err(_)) => Err(self.fail_subscribe(id, &topic, "channel released".into()).await),
            Err(_) => Err(self
                .fail_subscribe(id, &topic, format!("no join reply within {:?}", self.join_timeout))
                .await),
        }
    }

    async fn announce(&self, id: FeedSubscriptionId, payload: Value) -> Result<(), LiveError> {
        let topic = {
            let mut state = self.lock();
            let Some(sub) = state.subscribers.get(&id) else {
                return Err(LiveError::SubscriptionFailure(format!(
                    "unknown subscription {id}"
                )));
            };
            if !sub.spec.is_presence() {
                return Err(LiveError::SubscriptionFailure(format!(
                    "{} is not a presence topic",
                    sub.topic
                )));
            }
            let topic = sub.topic.clone();
            if let Some(channel) = state.channels.get_mut(&topic) {
                channel.tracked_by = Some(id);
            }
            topic
        };
        self.client.presence_track(&topic, payload).await;
        Ok(())
    }

    async fn unsubscribe(&self, id: FeedSubscriptionId) {
        let release = self.lock().release(id);
        self.apply(release).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::backend::{RowEvent, RowFilter};
    use crate::realtime::RealtimeCommand;

    const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        feed: Arc<SupabaseFeed>,
        events: mpsc::Sender<RealtimeEvent>,
        commands: mpsc::Receiver<RealtimeCommand>,
    }

    impl Harness {
        fn new() -> Self {
            let (client, commands) = RealtimeClient::detached();
            let (events, events_rx) = mpsc::channel(64);
            Self {
                feed: Arc::new(SupabaseFeed::from_parts(client, events_rx, JOIN_TIMEOUT)),
                events,
                commands,
            }
        }

        async fn push(&self, event: RealtimeEvent) {
            self.events.send(event).await.unwrap();
            settle().await;
        }

        /// Subscribe while acknowledging the join the way the server would.
        async fn subscribe_joined(&mut self, spec: TopicSpec) -> FeedSubscription {
            let feed = Arc::clone(&self.feed);
            let task = tokio::spawn(async move { feed.subscribe(&spec).await });
            let topic = match self.commands.recv().await.unwrap() {
                RealtimeCommand::JoinChannel { topic, .. } => topic,
                other => panic!("expected join, got {other:?}"),
            };
            self.push(RealtimeEvent::ChannelJoined { topic }).await;
            task.await.unwrap().unwrap()
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn metas(pairs: &[(&str, &str)]) -> HashMap<String, Vec<Value>> {
        pairs
            .iter()
            .map(|(key, r)| (key.to_string(), vec![json!({"user_id": key, "phx_ref": r})]))
            .collect()
    }

    fn presence_spec(key: &str) -> TopicSpec {
        TopicSpec::presence("presence:hood", key)
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_resolves_on_join_reply() {
        let mut h = Harness::new();
        let sub = h.subscribe_joined(presence_spec("alice")).await;
        assert_eq!(sub.id, FeedSubscriptionId(1));
        assert_eq!(h.feed.channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_join_is_a_subscription_failure() {
        let mut h = Harness::new();
        let feed = Arc::clone(&h.feed);
        let task = tokio::spawn(async move { feed.subscribe(&presence_spec("alice")).await });
        assert!(matches!(
            h.commands.recv().await.unwrap(),
            RealtimeCommand::JoinChannel { .. }
        ));
        h.push(RealtimeEvent::ChannelError {
            topic: "presence:hood".into(),
            message: "unauthorized".into(),
        })
        .await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, LiveError::SubscriptionFailure(ref m) if m.contains("unauthorized")));
        assert!(matches!(
            h.commands.recv().await.unwrap(),
            RealtimeCommand::LeaveChannel { .. }
        ));
        assert_eq!(h.feed.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_join_reply_times_out() {
        let h = Harness::new();
        let err = h.feed.subscribe(&presence_spec("alice")).await.unwrap_err();
        assert!(matches!(err, LiveError::SubscriptionFailure(_)));
        assert_eq!(h.feed.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_events_are_forwarded_in_order() {
        let mut h = Harness::new();
        let mut sub = h.subscribe_joined(presence_spec("alice")).await;

        h.push(RealtimeEvent::PresenceState {
            topic: "presence:hood".into(),
            state: metas(&[("alice", "r1")]),
        })
        .await;
        h.push(RealtimeEvent::PresenceDiff {
            topic: "presence:hood".into(),
            joins: metas(&[("alice", "r2")]),
            leaves: metas(&[("alice", "r1")]),
        })
        .await;

        let sync = sub.events.try_recv().unwrap();
        assert_eq!(sync.kind, ChangeKind::Sync);
        assert_eq!(sync.payload["alice"][0]["phx_ref"], "r1");
        assert_eq!(sub.events.try_recv().unwrap().kind, ChangeKind::Join);
        let leave = sub.events.try_recv().unwrap();
        assert_eq!(leave.kind, ChangeKind::Leave);
        assert_eq!(leave.payload["alice"][0]["phx_ref"], "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn second_subscriber_starts_from_cached_snapshot() {
        let mut h = Harness::new();
        let _first = h.subscribe_joined(presence_spec("alice")).await;
        h.push(RealtimeEvent::PresenceState {
            topic: "presence:hood".into(),
            state: metas(&[("bob", "r9")]),
        })
        .await;

        let mut second = h.feed.subscribe(&presence_spec("alice")).await.unwrap();
        let sync = second.events.try_recv().unwrap();
        assert_eq!(sync.kind, ChangeKind::Sync);
        assert!(sync.payload.get("bob").is_some());
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_spec_on_same_topic_is_refused() {
        let mut h = Harness::new();
        let _first = h.subscribe_joined(presence_spec("alice")).await;
        let err = h.feed.subscribe(&presence_spec("bob")).await.unwrap_err();
        assert!(matches!(err, LiveError::SubscriptionFailure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn row_changes_are_filtered() {
        let mut h = Harness::new();
        let spec = TopicSpec::rows(
            "notifications:bob",
            RowFilter::new("notifications", RowEvent::Insert).eq("user_id", "bob"),
        );
        let mut sub = h.subscribe_joined(spec).await;

        for (user, kind) in [
            ("alice", ChangeKind::Insert),
            ("bob", ChangeKind::Update),
            ("bob", ChangeKind::Insert),
        ] {
            h.push(RealtimeEvent::PostgresChange {
                topic: "notifications:bob".into(),
                change: PostgresChange {
                    table: "notifications".into(),
                    kind,
                    record: json!({"id": "n", "user_id": user}),
                    old_record: Value::Null,
                },
            })
            .await;
        }

        let event = sub.events.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.payload["user_id"], "bob");
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_drops_presence() {
        let mut h = Harness::new();
        let mut sub = h.subscribe_joined(presence_spec("alice")).await;
        h.push(RealtimeEvent::PresenceState {
            topic: "presence:hood".into(),
            state: metas(&[("alice", "r1")]),
        })
        .await;
        h.push(RealtimeEvent::Disconnected).await;

        sub.events.try_recv().unwrap();
        let sync = sub.events.try_recv().unwrap();
        assert_eq!(sync.kind, ChangeKind::Sync);
        assert_eq!(sync.payload, json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn announce_tracks_and_last_unsubscribe_leaves() {
        let mut h = Harness::new();
        let sub = h.subscribe_joined(presence_spec("alice")).await;

        h.feed
            .announce(sub.id, json!({"user_id": "alice"}))
            .await
            .unwrap();
        assert!(matches!(
            h.commands.recv().await.unwrap(),
            RealtimeCommand::PresenceTrack { .. }
        ));

        h.feed.unsubscribe(sub.id).await;
        assert!(matches!(
            h.commands.recv().await.unwrap(),
            RealtimeCommand::LeaveChannel { topic } if topic == "presence:hood"
        ));
        assert!(h.feed.announce(sub.id, json!({})).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_unsubscribe_does_not_untrack_newer_announce() {
        let mut h = Harness::new();
        let old = h.subscribe_joined(presence_spec("alice")).await;
        h.feed.announce(old.id, json!({"user_id": "alice"})).await.unwrap();
        h.commands.recv().await.unwrap();

        let new = h.feed.subscribe(&presence_spec("alice")).await.unwrap();
        h.feed.announce(new.id, json!({"user_id": "alice"})).await.unwrap();
        h.commands.recv().await.unwrap();

        h.feed.unsubscribe(old.id).await;
        assert!(h.commands.try_recv().is_err());
    }
}
