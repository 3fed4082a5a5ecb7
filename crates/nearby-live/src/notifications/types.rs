//! Notification records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use nearby_config::schema::FeedOrder;

/// What produced a notification. Kinds written by newer server triggers
/// land in `Other` instead of failing the whole feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    EventJoin,
    EventReminder,
    PostComment,
    PostLike,
    MarketplaceInquiry,
    CommunityInvite,
    Coupon,
    System,
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::EventJoin => "event_join",
            NotificationKind::EventReminder => "event_reminder",
            NotificationKind::PostComment => "post_comment",
            NotificationKind::PostLike => "post_like",
            NotificationKind::MarketplaceInquiry => "marketplace_inquiry",
            NotificationKind::CommunityInvite => "community_invite",
            NotificationKind::Coupon => "coupon",
            NotificationKind::System => "system",
            NotificationKind::Other(s) => s,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "event_join" => NotificationKind::EventJoin,
            "event_reminder" => NotificationKind::EventReminder,
            "post_comment" => NotificationKind::PostComment,
            "post_like" => NotificationKind::PostLike,
            "marketplace_inquiry" => NotificationKind::MarketplaceInquiry,
            "community_invite" => NotificationKind::CommunityInvite,
            "coupon" => NotificationKind::Coupon,
            "system" => NotificationKind::System,
            _ => NotificationKind::Other(s),
        }
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Display data of the user a notification is about, joined from profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// One entry of a user's notification log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    /// Recipient.
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub related_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_user: Option<RelatedUser>,
}

/// A notification as written by another subsystem, before the backend
/// assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub related_user_id: Option<String>,
}

/// Sort in place by `created_at`, ties broken by id for a stable view.
pub(crate) fn sort_feed(items: &mut [Notification], order: FeedOrder) {
    items.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    if order == FeedOrder::Desc {
        items.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_and_unknown_kinds_deserialize() {
        let kind: NotificationKind = serde_json::from_value(json!("event_join")).unwrap();
        assert_eq!(kind, NotificationKind::EventJoin);
        let kind: NotificationKind = serde_json::from_value(json!("garage_sale")).unwrap();
        assert_eq!(kind, NotificationKind::Other("garage_sale".into()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("garage_sale"));
    }

    #[test]
    fn row_with_embedded_projection_deserializes() {
        let row = json!({
            "id": "n1",
            "user_id": "bob",
            "type": "event_join",
            "title": "New attendee",
            "message": "Alice joined your BBQ",
            "is_read": false,
            "related_user_id": "alice",
            "created_at": "2026-05-01T18:00:00Z",
            "related_user": {"id": "alice", "display_name": "Alice", "avatar_url": null}
        });
        let n: Notification = serde_json::from_value(row).unwrap();
        assert_eq!(n.kind, NotificationKind::EventJoin);
        assert_eq!(
            n.related_user.unwrap().display_name.as_deref(),
            Some("Alice")
        );
    }

    #[test]
    fn row_without_optional_columns_deserializes() {
        let row = json!({
            "id": "n2",
            "user_id": "bob",
            "type": "system",
            "title": "Welcome",
            "message": "Hi",
            "created_at": "2026-05-01T18:00:00Z"
        });
        let n: Notification = serde_json::from_value(row).unwrap();
        assert!(!n.is_read);
        assert!(n.related_user_id.is_none());
        assert!(n.related_user.is_none());
    }

    #[test]
    fn sort_feed_orders_by_created_at() {
        let at = |s: &str| s.parse::<DateTime<Utc>>().unwrap();
        let mk = |id: &str, ts: &str| Notification {
            id: id.into(),
            user_id: "bob".into(),
            kind: NotificationKind::System,
            title: String::new(),
            message: String::new(),
            is_read: false,
            related_user_id: None,
            created_at: at(ts),
            related_user: None,
        };
        let mut items = vec![
            mk("b", "2026-01-02T00:00:00Z"),
            mk("a", "2026-01-01T00:00:00Z"),
            mk("c", "2026-01-03T00:00:00Z"),
        ];
        sort_feed(&mut items, FeedOrder::Asc);
        assert_eq!(items.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), ["a", "b", "c"]);
        sort_feed(&mut items, FeedOrder::Desc);
        assert_eq!(items.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), ["c", "b", "a"]);
    }
}
