//! Periodic re-announcement of the local session's presence.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::backend::Clock;
use crate::subscription::{SubscriptionHandle, SubscriptionManager};

/// Presence meta announced for `user_id`.
pub(crate) fn announcement(user_id: &str, clock: &dyn Clock) -> serde_json::Value {
    serde_json::json!({
        "user_id": user_id,
        "online_at": clock.now().to_rfc3339(),
    })
}

/// Fire one announce without waiting for it to resolve.
pub(crate) fn announce_detached(
    manager: &Arc<SubscriptionManager>,
    handle: &SubscriptionHandle,
    user_id: &str,
    clock: &dyn Clock,
) {
    let payload = announcement(user_id, clock);
    let manager = Arc::clone(manager);
    let handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.announce(&handle, payload).await {
            debug!(topic = %handle.topic(), error = %e, "Heartbeat announce failed");
        }
    });
}

/// Shortest heartbeat period; zero would make the interval panic.
pub(crate) const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Re-announce every `period` (at least [`MIN_PERIOD`]), first tick one
/// period from now.
///
/// Each tick spawns its own announce, so a slow announce never delays or
/// skips the next tick. Late ticks are not bursted.
pub(crate) fn spawn_heartbeat(
    manager: Arc<SubscriptionManager>,
    handle: SubscriptionHandle,
    user_id: String,
    clock: Arc<dyn Clock>,
    period: Duration,
) -> JoinHandle<()> {
    let period = period.max(MIN_PERIOD);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            announce_detached(&manager, &handle, &user_id, clock.as_ref());
        }
    })
}
