use serde::{Deserialize, Serialize};

/// Order in which the notification feed is presented.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum FeedOrder {
    #[default]
    Asc,
    Desc,
}

/// Notification feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub table: String,
    /// Table the related-user projection is joined from.
    pub profiles_table: String,
    pub order: FeedOrder,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            table: "notifications".into(),
            profiles_table: "profiles".into(),
            order: FeedOrder::Asc,
        }
    }
}
