//! Presence registry bound to one presence topic.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nearby_config::schema::PresenceConfig;

use crate::backend::{Clock, TopicSpec};
use crate::error::LiveError;
use crate::subscription::{SubscriptionHandle, SubscriptionManager};

use super::event_translator::Members;
use super::heartbeat::{announce_detached, announcement, spawn_heartbeat};
use super::types::{PresenceEvent, PresenceRecord};

const EVENT_CAPACITY: usize = 64;

struct Joined {
    user_id: String,
    handle: SubscriptionHandle,
    heartbeat: JoinHandle<()>,
}

/// Tracks who is online on a presence topic and keeps the local user's own
/// announcement alive while joined.
///
/// Instances are independent; each owns its online set.
pub struct PresenceRegistry {
    manager: Arc<SubscriptionManager>,
    clock: Arc<dyn Clock>,
    topic: String,
    heartbeat_interval: Duration,
    members: Arc<RwLock<Members>>,
    session: Mutex<Option<Joined>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceRegistry {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        clock: Arc<dyn Clock>,
        config: &PresenceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            manager,
            clock,
            topic: config.topic.clone(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            members: Arc::new(RwLock::new(Members::default())),
            session: Mutex::new(None),
            events,
        }
    }

    fn members(&self) -> RwLockReadGuard<'_, Members> {
        self.members.read().unwrap_or_else(|e| e.into_inner())
    }

    fn members_mut(&self) -> RwLockWriteGuard<'_, Members> {
        self.members.write().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, Option<Joined>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join the presence topic as `user_id`: subscribe, announce, and start
    /// the heartbeat. Joining again leaves first.
    ///
    /// On subscribe failure the online set stays empty and the error is
    /// returned; the caller may retry later.
    pub async fn join(&self, user_id: &str) -> Result<(), LiveError> {
        self.leave();

        let owner = format!("presence:{user_id}");
        let spec = TopicSpec::presence(&self.topic, user_id);
        let members = Arc::clone(&self.members);
        let events = self.events.clone();
        let clock = Arc::clone(&self.clock);

        let handle = match self
            .manager
            .open(&owner, spec, move |event| {
                let changes = members
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .apply(&event, clock.now());
                for change in changes {
                    // No receivers is fine.
                    let _ = events.send(change);
                }
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(topic = %self.topic, user_id = %user_id, error = %e, "Presence join failed");
                self.members_mut().clear();
                return Err(e);
            }
        };

        if let Err(e) = self
            .manager
            .announce(&handle, announcement(user_id, self.clock.as_ref()))
            .await
        {
            warn!(topic = %self.topic, user_id = %user_id, error = %e, "Initial announce failed; heartbeat will retry");
        }

        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.manager),
            handle.clone(),
            user_id.to_string(),
            Arc::clone(&self.clock),
            self.heartbeat_interval,
        );

        let previous = self.session().replace(Joined {
            user_id: user_id.to_string(),
            handle,
            heartbeat,
        });
        if let Some(previous) = previous {
            // Lost a race with a concurrent join.
            self.release(previous);
        }
        info!(topic = %self.topic, user_id = %user_id, "Joined presence");
        Ok(())
    }

    /// Re-announce liveness now without waiting for the result.
    pub fn heartbeat(&self) -> Result<(), LiveError> {
        let session = self.session();
        let joined = session.as_ref().ok_or(LiveError::NotJoined)?;
        announce_detached(&self.manager, &joined.handle, &joined.user_id, self.clock.as_ref());
        Ok(())
    }

    /// Stop the heartbeat, close the subscription, and forget the online set.
    pub fn leave(&self) {
        let joined = self.session().take();
        if let Some(joined) = joined {
            info!(topic = %self.topic, user_id = %joined.user_id, "Leaving presence");
            self.release(joined);
        }
        self.members_mut().clear();
    }

    fn release(&self, joined: Joined) {
        joined.heartbeat.abort();
        self.manager.close(&joined.handle);
        debug!(topic = %self.topic, user_id = %joined.user_id, "Presence session released");
    }

    pub fn is_joined(&self) -> bool {
        self.session().is_some()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.members().is_online(user_id)
    }

    /// Online users sorted by user id.
    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.members().records()
    }

    pub fn online_count(&self) -> usize {
        self.members().len()
    }

    /// When `user_id` last announced, if online.
    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.members().last_seen(user_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        self.leave();
    }
}
