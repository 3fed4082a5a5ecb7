//! One signed-in user's live session: presence, status, and notifications
//! wired onto a shared subscription manager.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use nearby_common::SessionId;
use nearby_config::NearbyConfig;

use crate::backend::{
    ChangeFeed, Clock, Geolocator, MemoryBackend, MonotonicClock, NotificationStore, RestStore,
    RowStore, StaticGeolocator, SupabaseFeed, SystemClock,
};
use crate::error::LiveError;
use crate::notifications::NotificationFeed;
use crate::presence::PresenceRegistry;
use crate::realtime::RealtimeConfig;
use crate::status::EphemeralStatusStore;
use crate::subscription::SubscriptionManager;

/// The collaborators a session runs against.
#[derive(Clone)]
pub struct LiveServices {
    pub feed: Arc<dyn ChangeFeed>,
    pub rows: Arc<dyn RowStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub geo: Arc<dyn Geolocator>,
    pub clock: Arc<dyn Clock>,
}

impl LiveServices {
    /// Supabase-backed collaborators. Opens the realtime connection, so it
    /// must be called inside a tokio runtime.
    pub fn supabase(config: &NearbyConfig, access_token: Option<String>) -> Result<Self, LiveError> {
        if !config.backend.is_configured() {
            return Err(LiveError::Network(
                "backend.project_ref and backend.api_key must be set".to_string(),
            ));
        }

        let rest = Arc::new(RestStore::new(
            &config.backend,
            &config.notifications,
            access_token.clone(),
        )?);
        let feed = SupabaseFeed::connect(
            RealtimeConfig::from_config(config, access_token),
            Duration::from_secs(config.realtime.join_timeout_secs),
        );
        info!(project_ref = %config.backend.project_ref, "Supabase services ready");

        Ok(Self {
            feed: Arc::new(feed),
            rows: rest.clone(),
            notifications: rest,
            geo: Arc::new(StaticGeolocator::from_config(&config.status)),
            clock: Arc::new(SystemClock),
        })
    }

    /// In-process collaborators. The backend is returned as well so callers
    /// can play the server side (insert notifications, drop presence).
    pub fn memory(config: &NearbyConfig) -> (Self, Arc<MemoryBackend>) {
        let clock = Arc::new(MonotonicClock::new());
        let backend = Arc::new(
            MemoryBackend::new(clock.clone()).with_notifications_table(&config.notifications.table),
        );
        let services = Self {
            feed: backend.clone(),
            rows: backend.clone(),
            notifications: backend.clone(),
            geo: Arc::new(StaticGeolocator::from_config(&config.status)),
            clock,
        };
        (services, backend)
    }
}

/// Presence, status, and notification feed for one user.
pub struct LiveSession {
    id: SessionId,
    user_id: String,
    manager: Arc<SubscriptionManager>,
    presence: PresenceRegistry,
    status: EphemeralStatusStore,
    notifications: NotificationFeed,
}

impl LiveSession {
    /// Join presence (if enabled) and start the notification feed.
    /// Either failing is logged; the session still starts with empty or
    /// stale state.
    pub async fn start(user_id: &str, services: LiveServices, config: &NearbyConfig) -> Self {
        let manager = Arc::new(SubscriptionManager::new(services.feed));
        let presence = PresenceRegistry::new(
            Arc::clone(&manager),
            Arc::clone(&services.clock),
            &config.presence,
        );
        let status = EphemeralStatusStore::new(
            services.rows,
            services.geo,
            services.clock,
            &config.status,
        );
        let notifications = NotificationFeed::new(
            user_id,
            services.notifications,
            Arc::clone(&manager),
            &config.notifications,
        );

        if config.presence.enabled {
            if let Err(e) = presence.join(user_id).await {
                warn!(user_id = %user_id, error = %e, "Presence unavailable");
            }
        }
        if let Err(e) = notifications.start().await {
            warn!(user_id = %user_id, error = %e, "Live notifications unavailable; showing last fetch");
        }

        let id = SessionId::new();
        info!(
            session = %id,
            user_id = %user_id,
            presence = presence.is_joined(),
            subscriptions = manager.open_count(),
            "Live session started"
        );
        Self {
            id,
            user_id: user_id.to_string(),
            manager,
            presence,
            status,
            notifications,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn status(&self) -> &EphemeralStatusStore {
        &self.status
    }

    pub fn notifications(&self) -> &NotificationFeed {
        &self.notifications
    }

    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }

    /// Release every subscription, interval, and timer.
    pub fn shutdown(&self) {
        self.notifications.stop();
        self.presence.leave();
        self.status.shutdown();
        self.manager.close_all();
        info!(session = %self.id, user_id = %self.user_id, "Live session shut down");
    }
}
