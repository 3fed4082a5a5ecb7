//! Incoming Phoenix message handler and presence parsing.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::backend::ChangeKind;

use super::types::{PhoenixMessage, PostgresChange, RealtimeEvent};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract the short topic name from a Phoenix topic (strip "realtime:" prefix).
fn strip_topic_prefix(topic: &str) -> &str {
    topic.strip_prefix("realtime:").unwrap_or(topic)
}

/// Parse a Phoenix presence map into `HashMap<key, Vec<meta>>`.
///
/// Supabase sends presence as `{ "key": { "metas": [{ ... }] } }`.
pub(crate) fn parse_presence_map(
    value: &serde_json::Value,
) -> HashMap<String, Vec<serde_json::Value>> {
    let mut result = HashMap::new();
    if let Some(obj) = value.as_object() {
        for (key, val) in obj {
            if let Some(metas) = val.get("metas").and_then(|m| m.as_array()) {
                result.insert(key.clone(), metas.clone());
            }
        }
    }
    result
}

/// Parse the `data` of a `postgres_changes` message.
fn parse_postgres_change(payload: &serde_json::Value) -> Option<PostgresChange> {
    let data = payload.get("data")?;
    let kind = match data.get("type")?.as_str()? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    Some(PostgresChange {
        table: data.get("table")?.as_str()?.to_string(),
        kind,
        record: data.get("record").cloned().unwrap_or(serde_json::Value::Null),
        old_record: data
            .get("old_record")
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    })
}

// ---------------------------------------------------------------------------
// Message Handler
// ---------------------------------------------------------------------------

/// Translate one incoming Phoenix message.
///
/// `join_refs` maps the ref of each outstanding `phx_join` to its topic;
/// only replies to those refs count as join acknowledgements.
pub(crate) fn translate(
    msg: &PhoenixMessage,
    join_refs: &mut HashMap<String, String>,
) -> Option<RealtimeEvent> {
    let topic = strip_topic_prefix(&msg.topic);

    match msg.event.as_str() {
        "phx_reply" => {
            let status = msg.payload.get("status").and_then(|s| s.as_str())?;
            let joined_topic = msg.msg_ref.as_ref().and_then(|r| join_refs.remove(r));
            let Some(joined_topic) = joined_topic else {
                if status != "ok" {
                    warn!(topic = %topic, status = %status, payload = %msg.payload, "Request rejected");
                }
                return None;
            };
            if status == "ok" {
                debug!(topic = %joined_topic, "Channel joined");
                Some(RealtimeEvent::ChannelJoined { topic: joined_topic })
            } else {
                let message = msg
                    .payload
                    .get("response")
                    .and_then(|r| r.get("reason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                warn!(topic = %joined_topic, status = %status, reason = %message, "Channel join refused");
                Some(RealtimeEvent::ChannelError {
                    topic: joined_topic,
                    message,
                })
            }
        }
        "phx_error" => {
            warn!(topic = %topic, "Channel error");
            Some(RealtimeEvent::ChannelError {
                topic: topic.to_string(),
                message: "Channel error".to_string(),
            })
        }
        "phx_close" => {
            info!(topic = %topic, "Channel closed");
            Some(RealtimeEvent::ChannelError {
                topic: topic.to_string(),
                message: "Channel closed".to_string(),
            })
        }
        "presence_state" => {
            let state = parse_presence_map(&msg.payload);
            debug!(topic = %topic, users = state.len(), "Presence state received");
            Some(RealtimeEvent::PresenceState {
                topic: topic.to_string(),
                state,
            })
        }
        "presence_diff" => {
            let joins = msg
                .payload
                .get("joins")
                .map(parse_presence_map)
                .unwrap_or_default();
            let leaves = msg
                .payload
                .get("leaves")
                .map(parse_presence_map)
                .unwrap_or_default();
            debug!(
                topic = %topic,
                joins = joins.len(),
                leaves = leaves.len(),
                "Presence diff received"
            );
            Some(RealtimeEvent::PresenceDiff {
                topic: topic.to_string(),
                joins,
                leaves,
            })
        }
        "postgres_changes" => match parse_postgres_change(&msg.payload) {
            Some(change) => {
                debug!(topic = %topic, table = %change.table, kind = ?change.kind, "Row change received");
                Some(RealtimeEvent::PostgresChange {
                    topic: topic.to_string(),
                    change,
                })
            }
            None => {
                warn!(topic = %topic, payload = %msg.payload, "Malformed postgres_changes payload");
                None
            }
        },
        "system" => {
            debug!(topic = %topic, payload = %msg.payload, "System message");
            None
        }
        _ => {
            debug!(
                topic = %topic,
                event = %msg.event,
                "Unhandled Phoenix event"
            );
            None
        }
    }
}
