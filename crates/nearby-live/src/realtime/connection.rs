//! Background WebSocket connection loop with auto-reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::handler::translate;
use super::types::{
    ChannelConfig, PhoenixMessage, RealtimeCommand, RealtimeConfig, RealtimeEvent,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Ref Counter
// ---------------------------------------------------------------------------

/// Monotonically increasing ref counter for Phoenix messages.
static REF_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_ref() -> String {
    REF_COUNTER.fetch_add(1, Ordering::Relaxed).to_string()
}

/// State for channels that should be (re)joined on reconnect.
#[derive(Clone)]
pub(crate) struct PendingChannel {
    pub(crate) config: ChannelConfig,
    pub(crate) presence_payload: Option<serde_json::Value>,
}

/// State shared between the read loop and the command forwarder.
#[derive(Default)]
struct Shared {
    channels: RwLock<HashMap<String, PendingChannel>>,
    /// Outstanding `phx_join` refs, ref -> topic.
    join_refs: Mutex<HashMap<String, String>>,
    /// Set once the client asked to disconnect or was dropped.
    shutdown: AtomicBool,
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Apply a command to the rejoin table without a live socket.
    /// Returns `false` on `Disconnect`.
    async fn record_offline(&self, cmd: RealtimeCommand) -> bool {
        let mut channels = self.channels.write().await;
        match cmd {
            RealtimeCommand::JoinChannel { topic, config } => {
                channels.insert(
                    topic,
                    PendingChannel {
                        config,
                        presence_payload: None,
                    },
                );
            }
            RealtimeCommand::LeaveChannel { topic } => {
                channels.remove(&topic);
            }
            RealtimeCommand::PresenceTrack { topic, payload } => {
                if let Some(ch) = channels.get_mut(&topic) {
                    ch.presence_payload = Some(payload);
                }
            }
            RealtimeCommand::PresenceUntrack { topic } => {
                if let Some(ch) = channels.get_mut(&topic) {
                    ch.presence_payload = None;
                }
            }
            RealtimeCommand::Disconnect => {
                self.shutdown.store(true, Ordering::SeqCst);
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

fn join_message(topic: &str, config: &ChannelConfig, access_token: Option<&str>) -> PhoenixMessage {
    PhoenixMessage::new(topic, "phx_join", config.to_join_payload(access_token), next_ref())
}

fn leave_message(topic: &str) -> PhoenixMessage {
    PhoenixMessage::new(topic, "phx_leave", serde_json::json!({}), next_ref())
}

fn track_message(topic: &str, payload: serde_json::Value) -> PhoenixMessage {
    PhoenixMessage::new(
        topic,
        "presence",
        serde_json::json!({
            "type": "presence",
            "event": "track",
            "payload": payload
        }),
        next_ref(),
    )
}

fn untrack_message(topic: &str) -> PhoenixMessage {
    PhoenixMessage::new(
        topic,
        "presence",
        serde_json::json!({
            "type": "presence",
            "event": "untrack"
        }),
        next_ref(),
    )
}

fn heartbeat_message() -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: serde_json::json!({}),
        msg_ref: Some(next_ref()),
    }
}

/// Serialize and send one message. Returns `false` if the socket rejected it.
async fn send_message<S>(writer: &Mutex<S>, msg: &PhoenixMessage) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => writer.lock().await.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, event = %msg.event, "Failed to encode Phoenix message");
            true
        }
    }
}

/// Send `phx_join` for `topic`, recording its ref so the reply is recognized.
async fn send_join<S>(
    writer: &Mutex<S>,
    shared: &Shared,
    topic: &str,
    config: &ChannelConfig,
    access_token: Option<&str>,
) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    let msg = join_message(topic, config, access_token);
    if let Some(r) = &msg.msg_ref {
        shared
            .join_refs
            .lock()
            .await
            .insert(r.clone(), topic.to_string());
    }
    send_message(writer, &msg).await
}

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Background task managing the WebSocket connection with auto-reconnect.
///
/// Runs until the client sends `Disconnect` or every command sender is
/// dropped.
pub(crate) async fn connection_loop(
    config: RealtimeConfig,
    connected: Arc<RwLock<bool>>,
    event_tx: mpsc::Sender<RealtimeEvent>,
    command_rx: mpsc::Receiver<RealtimeCommand>,
) {
    let command_rx = Arc::new(Mutex::new(command_rx));
    let shared = Arc::new(Shared::default());
    let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout_secs);
    let mut reconnect_delay = config.reconnect_delay_secs;

    loop {
        let url = config.ws_url();
        info!(url = %url.split('?').next().unwrap_or(""), "Connecting to Supabase Realtime");

        match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url)).await {
            Ok(Ok((ws_stream, _))) => {
                reconnect_delay = config.reconnect_delay_secs;
                *connected.write().await = true;
                let _ = event_tx.send(RealtimeEvent::Connected).await;

                let (ws_write, ws_read) = ws_stream.split();
                let ws_write = Arc::new(Mutex::new(ws_write));

                // Rejoin previously-joined channels and restore tracked presence.
                shared.join_refs.lock().await.clear();
                let channels: Vec<(String, PendingChannel)> = shared
                    .channels
                    .read()
                    .await
                    .iter()
                    .map(|(t, p)| (t.clone(), p.clone()))
                    .collect();
                for (topic, pending) in channels {
                    debug!(topic = %topic, "Rejoining channel");
                    send_join(
                        &ws_write,
                        &shared,
                        &topic,
                        &pending.config,
                        config.access_token.as_deref(),
                    )
                    .await;
                    if let Some(payload) = pending.presence_payload {
                        send_message(&ws_write, &track_message(&topic, payload)).await;
                    }
                }

                let heartbeat_handle = tokio::spawn(heartbeat_task(
                    Arc::clone(&ws_write),
                    config.heartbeat_interval_secs,
                ));

                let mut cmd_handle = tokio::spawn(command_forwarder(
                    Arc::clone(&command_rx),
                    Arc::clone(&ws_write),
                    Arc::clone(&shared),
                    config.access_token.clone(),
                ));

                // Process incoming messages.
                let mut read_stream = ws_read;
                loop {
                    tokio::select! {
                        _ = &mut cmd_handle => {
                            debug!("Command forwarder finished");
                            break;
                        }
                        next = tokio::time::timeout(heartbeat_timeout, read_stream.next()) => {
                            match next {
                                Err(_) => {
                                    warn!(
                                        timeout_secs = heartbeat_timeout.as_secs(),
                                        "No frames from Supabase Realtime; reconnecting"
                                    );
                                    break;
                                }
                                Ok(None) => {
                                    info!("Supabase Realtime stream ended");
                                    break;
                                }
                                Ok(Some(Ok(WsMessage::Text(text)))) => {
                                    match serde_json::from_str::<PhoenixMessage>(&text) {
                                        Ok(phoenix_msg) => {
                                            let event = {
                                                let mut refs = shared.join_refs.lock().await;
                                                translate(&phoenix_msg, &mut refs)
                                            };
                                            if let Some(event) = event {
                                                let _ = event_tx.send(event).await;
                                            }
                                        }
                                        Err(_) => {
                                            debug!(text = %text, "Unrecognized message from Supabase");
                                        }
                                    }
                                }
                                Ok(Some(Ok(WsMessage::Close(_)))) => {
                                    info!("Supabase Realtime closed connection");
                                    break;
                                }
                                Ok(Some(Err(e))) => {
                                    warn!(error = %e, "WebSocket error");
                                    break;
                                }
                                Ok(Some(Ok(_))) => {}
                            }
                        }
                    }
                }

                // Cleanup.
                heartbeat_handle.abort();
                cmd_handle.abort();
                *connected.write().await = false;
                let _ = event_tx.send(RealtimeEvent::Disconnected).await;
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to connect to Supabase Realtime");
                let _ = event_tx
                    .send(RealtimeEvent::Error(format!("Connection failed: {e}")))
                    .await;
            }
            Err(_elapsed) => {
                error!(timeout_secs = CONNECT_TIMEOUT.as_secs(), "WebSocket connection timed out");
                let _ = event_tx
                    .send(RealtimeEvent::Error(format!(
                        "Connection timed out after {}s",
                        CONNECT_TIMEOUT.as_secs()
                    )))
                    .await;
            }
        }

        if shared.is_shutdown() {
            info!("Supabase Realtime connection shut down");
            return;
        }

        // Exponential backoff reconnect. Commands arriving meanwhile only
        // update the rejoin table.
        info!(delay = reconnect_delay, "Reconnecting in {} seconds", reconnect_delay);
        let sleep = tokio::time::sleep(Duration::from_secs(reconnect_delay));
        tokio::pin!(sleep);
        let mut rx = command_rx.lock().await;
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = rx.recv() => {
                    let keep_going = match cmd {
                        Some(cmd) => shared.record_offline(cmd).await,
                        None => {
                            shared.shutdown.store(true, Ordering::SeqCst);
                            false
                        }
                    };
                    if !keep_going {
                        info!("Supabase Realtime connection shut down while reconnecting");
                        return;
                    }
                }
            }
        }
        drop(rx);
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay_secs);
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

async fn heartbeat_task<S>(ws_write: Arc<Mutex<S>>, interval_secs: u64)
where
    S: Sink<WsMessage> + Unpin,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        if !send_message(&ws_write, &heartbeat_message()).await {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Command Forwarder
// ---------------------------------------------------------------------------

async fn command_forwarder<S>(
    cmd_rx: Arc<Mutex<mpsc::Receiver<RealtimeCommand>>>,
    cmd_write: Arc<Mutex<S>>,
    shared: Arc<Shared>,
    access_token: Option<String>,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut rx = cmd_rx.lock().await;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RealtimeCommand::JoinChannel { topic, config } => {
                send_join(&cmd_write, &shared, &topic, &config, access_token.as_deref()).await;
                shared.channels.write().await.insert(
                    topic,
                    PendingChannel {
                        config,
                        presence_payload: None,
                    },
                );
            }
            RealtimeCommand::LeaveChannel { topic } => {
                send_message(&cmd_write, &leave_message(&topic)).await;
                shared.channels.write().await.remove(&topic);
            }
            RealtimeCommand::PresenceTrack { topic, payload } => {
                send_message(&cmd_write, &track_message(&topic, payload.clone())).await;
                // Store for re-tracking on reconnect.
                if let Some(ch) = shared.channels.write().await.get_mut(&topic) {
                    ch.presence_payload = Some(payload);
                }
            }
            RealtimeCommand::PresenceUntrack { topic } => {
                send_message(&cmd_write, &untrack_message(&topic)).await;
                if let Some(ch) = shared.channels.write().await.get_mut(&topic) {
                    ch.presence_payload = None;
                }
            }
            RealtimeCommand::Disconnect => {
                let topics: Vec<String> = shared.channels.read().await.keys().cloned().collect();
                for topic in topics {
                    send_message(&cmd_write, &leave_message(&topic)).await;
                }
                let _ = cmd_write.lock().await.send(WsMessage::Close(None)).await;
                shared.shutdown.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
    // Every client handle was dropped.
    shared.shutdown.store(true, Ordering::SeqCst);
}
