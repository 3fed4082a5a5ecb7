//! Presence records and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A currently announced user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub last_announced_at: DateTime<Utc>,
}

/// Membership changes, re-published for listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Full state received; the online set was replaced.
    Synced { online_count: usize },
    UserOnline { user_id: String },
    UserOffline { user_id: String },
}
