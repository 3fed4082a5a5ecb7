//! Collaborator interfaces the engine is written against.
//!
//! The engine never talks to a concrete backend directly: it subscribes to
//! topics through a [`ChangeFeed`], persists status rows through a
//! [`RowStore`], reads the notification log through a [`NotificationStore`],
//! asks a [`Geolocator`] for positions, and reads time from a [`Clock`].
//! Authorization is the backend's job; the engine only surfaces rejections.

mod clock;
mod geo;
mod memory;
mod presence_map;
mod rest;
mod supabase;
#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, MonotonicClock, SystemClock};
pub use geo::{Geolocator, StaticGeolocator};
pub use memory::MemoryBackend;
pub use presence_map::PresenceMap;
pub use rest::RestStore;
pub use supabase::SupabaseFeed;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LiveError;
use crate::notifications::{FeedOrder, Notification};

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// What happened on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Full presence state snapshot; replaces whatever the receiver held.
    Sync,
    Join,
    Leave,
}

/// One event pushed by the backend on a subscribed topic.
///
/// Presence payloads (`Sync`, `Join`, `Leave`) are `{ "<key>": [meta, ...] }`.
/// Row payloads carry the new record, or the old record for deletes.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub topic: String,
    pub kind: ChangeKind,
    pub payload: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(topic: impl Into<String>, kind: ChangeKind, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            kind,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Topics and row filters
// ---------------------------------------------------------------------------

/// Which row changes a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowEvent {
    Insert,
    Update,
    Delete,
    All,
}

impl RowEvent {
    /// Event name used in `postgres_changes` channel configs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RowEvent::Insert => "INSERT",
            RowEvent::Update => "UPDATE",
            RowEvent::Delete => "DELETE",
            RowEvent::All => "*",
        }
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            RowEvent::Insert => kind == ChangeKind::Insert,
            RowEvent::Update => kind == ChangeKind::Update,
            RowEvent::Delete => kind == ChangeKind::Delete,
            RowEvent::All => matches!(
                kind,
                ChangeKind::Insert | ChangeKind::Update | ChangeKind::Delete
            ),
        }
    }
}

/// Row-change scope of a topic: one table, some events, optional equality filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub table: String,
    pub event: RowEvent,
    pub eq: Option<(String, String)>,
}

impl RowFilter {
    pub fn new(table: impl Into<String>, event: RowEvent) -> Self {
        Self {
            table: table.into(),
            event,
            eq: None,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.eq = Some((column.into(), value.into()));
        self
    }

    /// `column=eq.value`, as the realtime server expects it.
    pub fn filter_expr(&self) -> Option<String> {
        self.eq
            .as_ref()
            .map(|(column, value)| format!("{column}=eq.{value}"))
    }

    /// Whether a change to `record` in `table` falls inside this filter.
    pub fn matches(&self, table: &str, kind: ChangeKind, record: &serde_json::Value) -> bool {
        if table != self.table || !self.event.matches(kind) {
            return false;
        }
        match &self.eq {
            None => true,
            Some((column, value)) => record
                .get(column)
                .map(|v| json_scalar_eq(v, value))
                .unwrap_or(false),
        }
    }
}

/// Compare a JSON scalar against its textual filter form.
pub(crate) fn json_scalar_eq(v: &serde_json::Value, expected: &str) -> bool {
    match v {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Number(n) => n.to_string() == expected,
        serde_json::Value::Bool(b) => b.to_string() == expected,
        _ => false,
    }
}

/// Like [`json_scalar_eq`], but timestamps compare by instant so that
/// `+00:00` and `Z` spellings of the same time match.
pub(crate) fn json_guard_eq(v: &serde_json::Value, expected: &str) -> bool {
    if json_scalar_eq(v, expected) {
        return true;
    }
    match (v.as_str(), chrono::DateTime::parse_from_rfc3339(expected)) {
        (Some(s), Ok(want)) => chrono::DateTime::parse_from_rfc3339(s).is_ok_and(|got| got == want),
        _ => false,
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSpec {
    pub name: String,
    /// Set for presence topics the subscriber will announce itself on.
    pub presence_key: Option<String>,
    pub rows: Option<RowFilter>,
}

impl TopicSpec {
    pub fn presence(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            presence_key: Some(key.into()),
            rows: None,
        }
    }

    pub fn rows(name: impl Into<String>, filter: RowFilter) -> Self {
        Self {
            name: name.into(),
            presence_key: None,
            rows: Some(filter),
        }
    }

    pub fn is_presence(&self) -> bool {
        self.rows.is_none()
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// Backend-assigned identity of one feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedSubscriptionId(pub u64);

impl fmt::Display for FeedSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live subscription: its id plus the ordered event stream.
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: FeedSubscriptionId,
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Change-data topic subscription.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Register on a topic. Resolves once the backend has accepted the
    /// registration; failures surface as `SubscriptionFailure`.
    async fn subscribe(&self, spec: &TopicSpec) -> Result<FeedSubscription, LiveError>;

    /// Announce (or re-announce) presence on the subscription's topic.
    async fn announce(
        &self,
        id: FeedSubscriptionId,
        payload: serde_json::Value,
    ) -> Result<(), LiveError>;

    /// Release the server-side registration. Unknown ids are ignored.
    async fn unsubscribe(&self, id: FeedSubscriptionId);
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Unique key of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub column: String,
    pub value: String,
}

impl RowKey {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Key-value upsert store with backend-enforced row ownership.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert-or-replace the row identified by `key`.
    async fn upsert(
        &self,
        table: &str,
        key: &RowKey,
        record: serde_json::Value,
    ) -> Result<(), LiveError>;

    /// Replace the row identified by `key` only while its `guard` column
    /// still holds `guard.value`. Returns whether a row was replaced.
    async fn update_if(
        &self,
        table: &str,
        key: &RowKey,
        guard: &RowKey,
        record: serde_json::Value,
    ) -> Result<bool, LiveError>;

    async fn get(&self, table: &str, key: &RowKey) -> Result<Option<serde_json::Value>, LiveError>;

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), LiveError>;

    /// All rows whose `column` equals `value`.
    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<serde_json::Value>, LiveError>;
}

/// Read side of the per-user notification log, plus read-bit transitions.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// The recipient's notifications with the related-user projection joined.
    async fn list(&self, user_id: &str, order: FeedOrder) -> Result<Vec<Notification>, LiveError>;

    async fn mark_read(&self, notification_id: &str) -> Result<(), LiveError>;

    async fn mark_all_read(&self, user_id: &str) -> Result<(), LiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_event_matching() {
        assert!(RowEvent::Insert.matches(ChangeKind::Insert));
        assert!(!RowEvent::Insert.matches(ChangeKind::Update));
        assert!(RowEvent::All.matches(ChangeKind::Delete));
        assert!(!RowEvent::All.matches(ChangeKind::Join));
    }

    #[test]
    fn row_filter_matches_eq_column() {
        let filter = RowFilter::new("notifications", RowEvent::Insert).eq("user_id", "bob");
        assert!(filter.matches(
            "notifications",
            ChangeKind::Insert,
            &json!({"user_id": "bob"})
        ));
        assert!(!filter.matches(
            "notifications",
            ChangeKind::Insert,
            &json!({"user_id": "alice"})
        ));
        assert!(!filter.matches("posts", ChangeKind::Insert, &json!({"user_id": "bob"})));
        assert!(!filter.matches("notifications", ChangeKind::Insert, &json!({})));
    }

    #[test]
    fn row_filter_matches_numeric_columns_textually() {
        let filter = RowFilter::new("events", RowEvent::All).eq("community_id", "42");
        assert!(filter.matches("events", ChangeKind::Update, &json!({"community_id": 42})));
    }

    #[test]
    fn guard_compares_timestamps_by_instant() {
        let stored = json!("2026-10-16T09:30:00.250+00:00");
        assert!(json_guard_eq(&stored, "2026-10-16T09:30:00.250Z"));
        assert!(!json_guard_eq(&stored, "2026-10-16T09:30:01Z"));
        assert!(json_guard_eq(&json!("alice"), "alice"));
        assert!(!json_guard_eq(&json!("alice"), "bob"));
    }

    #[test]
    fn filter_expr_format() {
        let filter = RowFilter::new("notifications", RowEvent::Insert).eq("user_id", "bob");
        assert_eq!(filter.filter_expr().as_deref(), Some("user_id=eq.bob"));
        assert_eq!(RowFilter::new("t", RowEvent::All).filter_expr(), None);
    }

    #[test]
    fn topic_spec_kinds() {
        assert!(TopicSpec::presence("presence:hood", "alice").is_presence());
        let rows = TopicSpec::rows(
            "notifications:bob",
            RowFilter::new("notifications", RowEvent::Insert),
        );
        assert!(!rows.is_presence());
        assert_eq!(rows.presence_key, None);
    }
}
