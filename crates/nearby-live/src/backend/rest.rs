//! [`RowStore`] and [`NotificationStore`] over the Supabase REST API (PostgREST).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use nearby_config::schema::{BackendConfig, NotificationsConfig};

use crate::error::LiveError;
use crate::notifications::{FeedOrder, Notification};

use super::{NotificationStore, RowKey, RowStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How much of an error body ends up in the error message.
const ERROR_BODY_CHARS: usize = 200;

/// PostgREST client scoped to one project and one caller identity.
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    notifications_table: String,
    profiles_table: String,
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RestStore {
    pub fn new(
        backend: &BackendConfig,
        notifications: &NotificationsConfig,
        access_token: Option<String>,
    ) -> Result<Self, LiveError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LiveError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: backend.rest_base_url(),
            api_key: backend.api_key.clone(),
            access_token,
            notifications_table: notifications.table.clone(),
            profiles_table: notifications.profiles_table.clone(),
        })
    }

    fn url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    /// Attach the project key and the caller's bearer token. Without a user
    /// token the anon key doubles as bearer.
    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    async fn send(
        &self,
        access: Access,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, LiveError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| LiveError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let err = classify_failure(access, status, &text);
        warn!(status = %status, access = ?access, error = %err, "REST request failed");
        Err(err)
    }

    async fn rows(
        &self,
        access: Access,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<Value>, LiveError> {
        self.send(access, request)
            .await?
            .json::<Vec<Value>>()
            .await
            .map_err(|e| LiveError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Map a non-success response to the engine's taxonomy. The backend saying
/// no to a write (policy, constraint, auth) is a rejected write; every
/// failed read and any other status is transport trouble.
pub(crate) fn classify_failure(access: Access, status: StatusCode, body: &str) -> LiveError {
    let detail = format!(
        "HTTP {status}: {}",
        body.chars().take(ERROR_BODY_CHARS).collect::<String>()
    );
    match (access, status.as_u16()) {
        (Access::Write, 400 | 401 | 403 | 404 | 409 | 422) => LiveError::WriteRejected(detail),
        _ => LiveError::Network(detail),
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

/// Query of the notification feed with the related-user projection embedded.
pub(crate) fn list_query(
    user_id: &str,
    order: FeedOrder,
    profiles_table: &str,
) -> Vec<(String, String)> {
    let direction = match order {
        FeedOrder::Asc => "asc",
        FeedOrder::Desc => "desc",
    };
    vec![
        (
            "select".to_string(),
            format!("*,related_user:{profiles_table}!related_user_id(id,display_name,avatar_url)"),
        ),
        ("user_id".to_string(), eq(user_id)),
        ("order".to_string(), format!("created_at.{direction},id.{direction}")),
    ]
}

/// `record` with the key column forced to the key value.
fn keyed(key: &RowKey, mut record: Value) -> Value {
    if let Some(obj) = record.as_object_mut() {
        obj.insert(key.column.clone(), Value::String(key.value.clone()));
    }
    record
}

#[async_trait]
impl RowStore for RestStore {
    async fn upsert(&self, table: &str, key: &RowKey, record: Value) -> Result<(), LiveError> {
        debug!(table = %table, key = %key.value, "REST upsert");
        self.send(
            Access::Write,
            self.http
                .post(self.url(table))
                .query(&[("on_conflict", key.column.as_str())])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&keyed(key, record)),
        )
        .await?;
        Ok(())
    }

    async fn update_if(
        &self,
        table: &str,
        key: &RowKey,
        guard: &RowKey,
        record: Value,
    ) -> Result<bool, LiveError> {
        debug!(table = %table, key = %key.value, guard = %guard.column, "REST guarded update");
        let updated = self
            .rows(
                Access::Write,
                self.http
                    .patch(self.url(table))
                    .query(&[
                        (key.column.as_str(), eq(&key.value)),
                        (guard.column.as_str(), eq(&guard.value)),
                    ])
                    .header("Prefer", "return=representation")
                    .json(&keyed(key, record)),
            )
            .await?;
        Ok(!updated.is_empty())
    }

    async fn get(&self, table: &str, key: &RowKey) -> Result<Option<Value>, LiveError> {
        let rows = self
            .rows(
                Access::Read,
                self.http
                    .get(self.url(table))
                    .query(&[("select", "*".to_string()), (key.column.as_str(), eq(&key.value))])
                    .query(&[("limit", "1")]),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), LiveError> {
        debug!(table = %table, key = %key.value, "REST delete");
        self.send(
            Access::Write,
            self.http
                .delete(self.url(table))
                .query(&[(key.column.as_str(), eq(&key.value))])
                .header("Prefer", "return=minimal"),
        )
        .await?;
        Ok(())
    }

    async fn select_eq(&self, table: &str, column: &str, value: &str) -> Result<Vec<Value>, LiveError> {
        self.rows(
            Access::Read,
            self.http
                .get(self.url(table))
                .query(&[("select", "*".to_string()), (column, eq(value))]),
        )
        .await
    }
}

#[async_trait]
impl NotificationStore for RestStore {
    async fn list(&self, user_id: &str, order: FeedOrder) -> Result<Vec<Notification>, LiveError> {
        let rows = self
            .rows(
                Access::Read,
                self.http
                    .get(self.url(&self.notifications_table))
                    .query(&list_query(user_id, order, &self.profiles_table)),
            )
            .await?;
        let items = rows
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Notification>, _>>()?;
        debug!(user_id = %user_id, count = items.len(), "Notifications fetched");
        Ok(items)
    }

    async fn mark_read(&self, notification_id: &str) -> Result<(), LiveError> {
        self.send(
            Access::Write,
            self.http
                .patch(self.url(&self.notifications_table))
                .query(&[("id", eq(notification_id))])
                .header("Prefer", "return=minimal")
                .json(&serde_json::json!({ "is_read": true })),
        )
        .await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<(), LiveError> {
        self.send(
            Access::Write,
            self.http
                .patch(self.url(&self.notifications_table))
                .query(&[("user_id", eq(user_id)), ("is_read", eq("false"))])
                .header("Prefer", "return=minimal")
                .json(&serde_json::json!({ "is_read": true })),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn policy_and_constraint_failures_are_rejections() {
        for code in [401, 403, 409, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(
                classify_failure(Access::Write, status, "new row violates row-level security policy"),
                LiveError::WriteRejected(_)
            ));
        }
    }

    #[test]
    fn refused_reads_are_not_write_rejections() {
        for code in [401, 403, 404] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(
                classify_failure(Access::Read, status, "permission denied for table notifications"),
                LiveError::Network(_)
            ));
        }
    }

    #[test]
    fn server_failures_are_network_errors() {
        let err = classify_failure(Access::Write, StatusCode::SERVICE_UNAVAILABLE, &"x".repeat(1000));
        match err {
            LiveError::Network(detail) => assert!(detail.len() < 300),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn list_query_embeds_related_user_and_orders() {
        let query = list_query("bob", FeedOrder::Desc, "profiles");
        assert_eq!(
            query[0].1,
            "*,related_user:profiles!related_user_id(id,display_name,avatar_url)"
        );
        assert_eq!(query[1], ("user_id".to_string(), "eq.bob".to_string()));
        assert_eq!(query[2].1, "created_at.desc,id.desc");
    }

    #[test]
    fn keyed_record_carries_key_column() {
        let record = keyed(&RowKey::new("user_id", "alice"), json!({"status": "normal"}));
        assert_eq!(record, json!({"status": "normal", "user_id": "alice"}));
    }

    #[test]
    fn debug_redacts_credentials() {
        let store = RestStore::new(
            &BackendConfig {
                project_ref: "abcd".into(),
                api_key: "anon-secret".into(),
                rest_url: None,
            },
            &NotificationsConfig::default(),
            Some("jwt-secret".into()),
        )
        .unwrap();
        let out = format!("{store:?}");
        assert!(out.contains("abcd.supabase.co"));
        assert!(!out.contains("anon-secret"));
        assert!(!out.contains("jwt-secret"));
    }
}
