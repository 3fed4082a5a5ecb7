//! Per-user notification feed fed by server-side triggers.

mod feed;
mod types;

pub use feed::NotificationFeed;
pub use types::{FeedOrder, NewNotification, Notification, NotificationKind, RelatedUser};

pub(crate) use types::sort_feed;
