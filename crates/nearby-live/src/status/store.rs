//! Ephemeral status store with client-side expiry timers and read-time
//! reconciliation.
//!
//! A non-normal status always carries an expiry. Two mechanisms make it
//! self-expire: a one-shot timer per user flips the session-local view the
//! moment the expiry passes, and every read of a persisted row whose expiry
//! has passed reports normal and writes the correction back. The second one
//! covers rows whose writer never came back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nearby_config::schema::StatusConfig;

use crate::backend::{Clock, Geolocator, RowKey, RowStore};
use crate::error::LiveError;

use super::types::{Coordinates, EphemeralStatus, StatusEvent, StatusKind};

const KEY_COLUMN: &str = "user_id";
const STATUS_COLUMN: &str = "status";
const VERSION_COLUMN: &str = "updated_at";
const EVENT_CAPACITY: usize = 64;

struct ExpiryTimer {
    generation: u64,
    expires_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    by_user: HashMap<String, ExpiryTimer>,
}

struct Inner {
    rows: Arc<dyn RowStore>,
    geo: Arc<dyn Geolocator>,
    clock: Arc<dyn Clock>,
    table: String,
    max_ttl_mins: u32,
    local: Mutex<HashMap<String, EphemeralStatus>>,
    timers: Mutex<Timers>,
    events: broadcast::Sender<StatusEvent>,
}

/// Reads and writes the single status row each user owns.
pub struct EphemeralStatusStore {
    inner: Arc<Inner>,
}

impl EphemeralStatusStore {
    pub fn new(
        rows: Arc<dyn RowStore>,
        geo: Arc<dyn Geolocator>,
        clock: Arc<dyn Clock>,
        config: &StatusConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                rows,
                geo,
                clock,
                table: config.table.clone(),
                max_ttl_mins: config.max_ttl_mins,
                local: Mutex::new(HashMap::new()),
                timers: Mutex::new(Timers::default()),
                events,
            }),
        }
    }

    /// Write `kind` for `user_id`, expiring `ttl` from now.
    ///
    /// Nothing local changes unless the write succeeds; failures are
    /// returned, never retried.
    pub async fn set_status(
        &self,
        user_id: &str,
        kind: StatusKind,
        ttl: Duration,
        coordinates: Option<Coordinates>,
    ) -> Result<EphemeralStatus, LiveError> {
        let ttl = self.inner.checked_ttl(ttl)?;
        if let Some(c) = &coordinates {
            c.validate()?;
        }

        let now = self.inner.clock.now();
        let status = EphemeralStatus {
            user_id: user_id.to_string(),
            kind,
            coordinates,
            expires_at: (kind != StatusKind::Normal).then(|| now + ttl),
            updated_at: now,
        };
        self.inner.write(&status).await?;
        info!(user_id = %user_id, kind = ?kind, expires_at = ?status.expires_at, "Status set");

        Inner::remember(&self.inner, status.clone());
        let _ = self.inner.events.send(StatusEvent::Updated(status.clone()));
        Ok(status)
    }

    /// Like [`set_status`](Self::set_status) at the device's current
    /// position. A geolocation failure writes nothing.
    pub async fn set_status_here(
        &self,
        user_id: &str,
        kind: StatusKind,
        ttl: Duration,
    ) -> Result<EphemeralStatus, LiveError> {
        let position = self.inner.geo.current_position().await.map_err(|e| {
            info!(user_id = %user_id, error = %e, "Geolocation unavailable; status not written");
            LiveError::CapabilityDenied(e)
        })?;
        self.set_status(user_id, kind, ttl, Some(position)).await
    }

    /// Reset `user_id` to normal with no expiry and no coordinates.
    pub async fn clear_status(&self, user_id: &str) -> Result<EphemeralStatus, LiveError> {
        let status = EphemeralStatus::normal(user_id, self.inner.clock.now());
        self.inner.write(&status).await?;
        info!(user_id = %user_id, "Status cleared");

        Inner::remember(&self.inner, status.clone());
        let _ = self.inner.events.send(StatusEvent::Cleared {
            user_id: user_id.to_string(),
        });
        Ok(status)
    }

    /// Read the persisted status, reporting an expired one as normal and
    /// writing the correction back.
    pub async fn get_status(&self, user_id: &str) -> Result<EphemeralStatus, LiveError> {
        Inner::read(&self.inner, user_id).await
    }

    /// This session's view of `user_id`, kept current by expiry timers
    /// without any read.
    pub fn local_status(&self, user_id: &str) -> Option<EphemeralStatus> {
        self.inner.local().get(user_id).cloned()
    }

    /// Users currently open to hang, expired rows omitted and corrected.
    pub async fn open_to_hang(&self) -> Result<Vec<EphemeralStatus>, LiveError> {
        let rows = self
            .inner
            .rows
            .select_eq(&self.inner.table, STATUS_COLUMN, StatusKind::OpenToHang.as_str())
            .await?;

        let now = self.inner.clock.now();
        let mut active = Vec::new();
        for row in rows {
            let status = match EphemeralStatus::from_row(row) {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed status row");
                    continue;
                }
            };
            let status = if status.is_expired_at(now) {
                self.inner.correct_stale(&status, now).await
            } else {
                status
            };
            if status.kind == StatusKind::OpenToHang {
                active.push(status);
            }
        }
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(active)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Number of pending expiry timers.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers().by_user.len()
    }

    /// Abort every pending expiry timer.
    pub fn shutdown(&self) {
        let timers: Vec<ExpiryTimer> = self.inner.timers().by_user.drain().map(|(_, t)| t).collect();
        for timer in timers {
            timer.task.abort();
        }
        debug!("Status store shut down");
    }
}

impl Drop for EphemeralStatusStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn local(&self) -> MutexGuard<'_, HashMap<String, EphemeralStatus>> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked_ttl(&self, ttl: Duration) -> Result<chrono::Duration, LiveError> {
        let max = Duration::from_secs(u64::from(self.max_ttl_mins) * 60);
        let invalid = LiveError::InvalidTtl {
            max_mins: self.max_ttl_mins,
        };
        if ttl.is_zero() || ttl > max {
            return Err(invalid);
        }
        chrono::Duration::from_std(ttl).map_err(|_| invalid)
    }

    async fn write(&self, status: &EphemeralStatus) -> Result<(), LiveError> {
        self.rows
            .upsert(&self.table, &RowKey::new(KEY_COLUMN, &status.user_id), status.to_row())
            .await
            .map_err(|e| {
                warn!(user_id = %status.user_id, error = %e, "Status write failed");
                e
            })
    }

    async fn read(this: &Arc<Self>, user_id: &str) -> Result<EphemeralStatus, LiveError> {
        let row = this
            .rows
            .get(&this.table, &RowKey::new(KEY_COLUMN, user_id))
            .await?;
        let now = this.clock.now();
        let status = match row {
            Some(row) => EphemeralStatus::from_row(row)?,
            None => EphemeralStatus::normal(user_id, now),
        };

        let status = if status.is_expired_at(now) {
            this.correct_stale(&status, now).await
        } else {
            status
        };
        Inner::remember(this, status.clone());
        Ok(status)
    }

    /// Persist normal over the expired row `stale`, unless another writer
    /// has replaced that row since it was read. Returns the status to report:
    /// normal, or the newer row when the correction lost the race.
    ///
    /// A failed write is logged only; the next read retries.
    async fn correct_stale(&self, stale: &EphemeralStatus, now: DateTime<Utc>) -> EphemeralStatus {
        let user_id = stale.user_id.as_str();
        debug!(user_id = %user_id, "Stale expiry; reporting normal");
        let corrected = EphemeralStatus::normal(user_id, now);
        let key = RowKey::new(KEY_COLUMN, user_id);
        let version = RowKey::new(
            VERSION_COLUMN,
            stale.updated_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );

        match self
            .rows
            .update_if(&self.table, &key, &version, corrected.to_row())
            .await
        {
            Ok(true) => corrected,
            Ok(false) => {
                debug!(user_id = %user_id, "Status row changed since read; correction skipped");
                self.current(&key, now).await.unwrap_or(corrected)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Stale expiry correction not persisted");
                corrected
            }
        }
    }

    /// The persisted row for `key` if it holds an unexpired status.
    async fn current(&self, key: &RowKey, now: DateTime<Utc>) -> Option<EphemeralStatus> {
        let row = match self.rows.get(&self.table, key).await {
            Ok(row) => row?,
            Err(e) => {
                warn!(user_id = %key.value, error = %e, "Status re-read failed");
                return None;
            }
        };
        EphemeralStatus::from_row(row)
            .ok()
            .filter(|status| !status.is_expired_at(now))
    }

    /// Record `status` as the local view and (re)arm or cancel its timer.
    fn remember(this: &Arc<Self>, status: EphemeralStatus) {
        let user_id = status.user_id.clone();
        let expiry = status.expires_at.filter(|_| status.kind != StatusKind::Normal);
        this.local().insert(user_id.clone(), status);
        match expiry {
            Some(expires_at) => Inner::schedule_expiry(this, user_id, expires_at),
            None => this.cancel_expiry(&user_id),
        }
    }

    fn cancel_expiry(&self, user_id: &str) {
        if let Some(timer) = self.timers().by_user.remove(user_id) {
            timer.task.abort();
            debug!(user_id = %user_id, "Expiry timer cancelled");
        }
    }

    fn schedule_expiry(this: &Arc<Self>, user_id: String, expires_at: DateTime<Utc>) {
        let mut timers = this.timers();
        if timers
            .by_user
            .get(&user_id)
            .is_some_and(|t| t.expires_at == expires_at)
        {
            return;
        }

        timers.next_generation += 1;
        let generation = timers.next_generation;
        let delay = this.clock.until(expires_at);
        let weak: Weak<Inner> = Arc::downgrade(this);
        let uid = user_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Inner::on_expiry(&inner, &uid, generation, expires_at).await;
            }
        });

        if let Some(old) = timers.by_user.insert(
            user_id.clone(),
            ExpiryTimer {
                generation,
                expires_at,
                task,
            },
        ) {
            old.task.abort();
        }
        debug!(user_id = %user_id, delay_ms = delay.as_millis() as u64, "Expiry timer scheduled");
    }

    async fn on_expiry(this: &Arc<Self>, user_id: &str, generation: u64, expires_at: DateTime<Utc>) {
        {
            let mut timers = this.timers();
            if timers.by_user.get(user_id).map(|t| t.generation) == Some(generation) {
                timers.by_user.remove(user_id);
            }
        }

        let flipped = {
            let mut local = this.local();
            match local.get_mut(user_id) {
                Some(status)
                    if status.kind != StatusKind::Normal
                        && status.expires_at == Some(expires_at) =>
                {
                    *status = EphemeralStatus::normal(user_id, this.clock.now());
                    true
                }
                _ => false,
            }
        };
        if !flipped {
            debug!(user_id = %user_id, "Expiry timer superseded");
            return;
        }

        info!(user_id = %user_id, "Status expired");
        let _ = this.events.send(StatusEvent::Expired {
            user_id: user_id.to_string(),
        });
        if let Err(e) = Inner::read(this, user_id).await {
            warn!(user_id = %user_id, error = %e, "Post-expiry reconciliation failed");
        }
    }
}
