//! Applies presence change events to the online set and translates them
//! into [`PresenceEvent`]s.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::backend::{ChangeEvent, ChangeKind, PresenceMap};

use super::types::{PresenceEvent, PresenceRecord};

/// Online set keyed by user id, with the time of each user's latest
/// announcement.
#[derive(Debug, Default)]
pub(crate) struct Members {
    state: PresenceMap,
    announced_at: HashMap<String, DateTime<Utc>>,
}

impl Members {
    /// Apply one transport event. `received_at` stands in for metas that
    /// carry no parseable `online_at`.
    pub(crate) fn apply(&mut self, event: &ChangeEvent, received_at: DateTime<Utc>) -> Vec<PresenceEvent> {
        let diff = PresenceMap::from_payload(&event.payload);
        match event.kind {
            ChangeKind::Sync => {
                self.state.sync(diff);
                self.announced_at.clear();
                let keys: Vec<String> = self.state.keys().map(str::to_string).collect();
                for key in keys {
                    let at = announced_at(&self.state, &key).unwrap_or(received_at);
                    self.announced_at.insert(key, at);
                }
                debug!(topic = %event.topic, online = self.state.len(), "Presence synced");
                vec![PresenceEvent::Synced {
                    online_count: self.state.len(),
                }]
            }
            ChangeKind::Join => {
                let newly_online = self.state.join(&diff);
                for key in diff.keys() {
                    let at = announced_at(&diff, key).unwrap_or(received_at);
                    self.announced_at.insert(key.to_string(), at);
                }
                newly_online
                    .into_iter()
                    .map(|user_id| PresenceEvent::UserOnline { user_id })
                    .collect()
            }
            ChangeKind::Leave => {
                let gone = self.state.leave(&diff);
                gone.into_iter()
                    .map(|user_id| {
                        self.announced_at.remove(&user_id);
                        PresenceEvent::UserOffline { user_id }
                    })
                    .collect()
            }
            ChangeKind::Insert | ChangeKind::Update | ChangeKind::Delete => {
                debug!(topic = %event.topic, kind = ?event.kind, "Ignoring row event on presence topic");
                Vec::new()
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.state.clear();
        self.announced_at.clear();
    }

    pub(crate) fn is_online(&self, user_id: &str) -> bool {
        self.state.contains(user_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.len()
    }

    pub(crate) fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.announced_at.get(user_id).copied()
    }

    /// Sorted by user id.
    pub(crate) fn records(&self) -> Vec<PresenceRecord> {
        self.state
            .keys()
            .filter_map(|user_id| {
                Some(PresenceRecord {
                    user_id: user_id.to_string(),
                    last_announced_at: self.last_seen(user_id)?,
                })
            })
            .collect()
    }
}

fn announced_at(map: &PresenceMap, key: &str) -> Option<DateTime<Utc>> {
    map.latest(key)?
        .get("online_at")?
        .as_str()?
        .parse::<DateTime<Utc>>()
        .ok()
}
