//! Command execution against the hosted backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use nearby_common::NearbyError;
use nearby_config::NearbyConfig;
use nearby_live::{
    EphemeralStatus, EphemeralStatusStore, LiveServices, LiveSession, Notification,
    NotificationStore, PresenceEvent, RestStore, StaticGeolocator, StatusEvent, StatusKind,
    SystemClock,
};

use crate::cli::{Command, NotificationsCommand, StatusCommand};

const API_KEY_ENV: &str = "NEARBY_SUPABASE_KEY";
const ACCESS_TOKEN_ENV: &str = "NEARBY_ACCESS_TOKEN";

/// Secrets come from the environment, never from the config file alone.
pub fn apply_env(config: &mut NearbyConfig) -> Option<String> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        config.backend.api_key = key;
    }
    std::env::var(ACCESS_TOKEN_ENV).ok().filter(|t| !t.is_empty())
}

pub async fn run(command: Command, config: NearbyConfig, token: Option<String>) -> Result<(), NearbyError> {
    match command {
        Command::Watch { user } => watch(&user, config, token).await,
        Command::Status(cmd) => status(cmd, &config, token).await,
        Command::Notifications(cmd) => notifications(cmd, &config, token).await,
    }
}

fn rest_store(config: &NearbyConfig, token: Option<String>) -> Result<RestStore, NearbyError> {
    if !config.backend.is_configured() {
        return Err(NearbyError::Other(format!(
            "backend.project_ref must be set in the config and {API_KEY_ENV} in the environment"
        )));
    }
    Ok(RestStore::new(&config.backend, &config.notifications, token)?)
}

async fn watch(user: &str, config: NearbyConfig, token: Option<String>) -> Result<(), NearbyError> {
    let services = LiveServices::supabase(&config, token)?;
    let session = LiveSession::start(user, services, &config).await;

    let mut presence = session.presence().subscribe_events();
    let mut statuses = session.status().subscribe_events();
    let mut unread = session.notifications().watch_unread();

    println!(
        "{user}: {} online, {} unread",
        session.presence().online_count(),
        session.notifications().unread_count()
    );

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                break;
            }
            Ok(event) = presence.recv() => match event {
                PresenceEvent::Synced { online_count } => println!("presence: {online_count} online"),
                PresenceEvent::UserOnline { user_id } => println!("presence: {user_id} online"),
                PresenceEvent::UserOffline { user_id } => println!("presence: {user_id} offline"),
            },
            Ok(event) = statuses.recv() => match event {
                StatusEvent::Updated(status) => println!("status: {}", describe_status(&status)),
                StatusEvent::Cleared { user_id } => println!("status: {user_id} cleared"),
                StatusEvent::Expired { user_id } => println!("status: {user_id} expired"),
            },
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *unread.borrow_and_update();
                println!("notifications: {count} unread");
                if let Some(latest) = session.notifications().items().iter().max_by_key(|n| n.created_at) {
                    println!("  latest: {}", describe_notification(latest));
                }
            }
        }
    }

    session.shutdown();
    info!(user_id = %user, "Watch ended");
    Ok(())
}

async fn status(cmd: StatusCommand, config: &NearbyConfig, token: Option<String>) -> Result<(), NearbyError> {
    let store = EphemeralStatusStore::new(
        Arc::new(rest_store(config, token)?),
        Arc::new(StaticGeolocator::from_config(&config.status)),
        Arc::new(SystemClock),
        &config.status,
    );

    match cmd {
        StatusCommand::Set {
            user,
            ttl_mins,
            here,
        } => {
            let mins = ttl_mins.unwrap_or(config.status.default_ttl_mins);
            let ttl = Duration::from_secs(u64::from(mins) * 60);
            let result = if here {
                store.set_status_here(&user, StatusKind::OpenToHang, ttl).await
            } else {
                store.set_status(&user, StatusKind::OpenToHang, ttl, None).await
            };
            let status = result.map_err(|e| {
                if let nearby_live::LiveError::CapabilityDenied(geo) = &e {
                    eprintln!("{}", geo.user_message());
                }
                NearbyError::from(e)
            })?;
            println!("{}", describe_status(&status));
        }
        StatusCommand::Clear { user } => {
            let status = store.clear_status(&user).await?;
            println!("{}", describe_status(&status));
        }
        StatusCommand::Get { user } => {
            let status = store.get_status(&user).await?;
            println!("{}", describe_status(&status));
        }
        StatusCommand::Nearby => {
            let open = store.open_to_hang().await?;
            if open.is_empty() {
                println!("nobody is open to hang right now");
            }
            for status in &open {
                println!("{}", describe_status(status));
            }
        }
    }
    Ok(())
}

async fn notifications(
    cmd: NotificationsCommand,
    config: &NearbyConfig,
    token: Option<String>,
) -> Result<(), NearbyError> {
    let store = rest_store(config, token)?;
    match cmd {
        NotificationsCommand::List { user } => {
            let items = store.list(&user, config.notifications.order).await?;
            let unread = items.iter().filter(|n| !n.is_read).count();
            println!("{} notifications, {unread} unread", items.len());
            for item in &items {
                println!("{}", describe_notification(item));
            }
        }
        NotificationsCommand::Read { id } => {
            store.mark_read(&id).await?;
            println!("marked {id} read");
        }
        NotificationsCommand::ReadAll { user } => {
            store.mark_all_read(&user).await?;
            println!("marked all notifications of {user} read");
        }
    }
    Ok(())
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&chrono::Local).format("%H:%M").to_string()
}

fn describe_status(status: &EphemeralStatus) -> String {
    let mut line = format!("{} is {}", status.user_id, status.kind.as_str());
    if let Some(expires_at) = status.expires_at {
        line.push_str(&format!(" until {}", local_time(expires_at)));
    }
    if let Some(c) = status.coordinates {
        line.push_str(&format!(" at {:.4},{:.4}", c.lat, c.lon));
    }
    line
}

fn describe_notification(n: &Notification) -> String {
    let marker = if n.is_read { " " } else { "*" };
    let from = n
        .related_user
        .as_ref()
        .and_then(|u| u.display_name.as_deref())
        .map(|name| format!(" ({name})"))
        .unwrap_or_default();
    format!(
        "{marker} {} [{}] {}: {}{from}  id={}",
        local_time(n.created_at),
        n.kind.as_str(),
        n.title,
        n.message,
        n.id
    )
}
