//! Hosted backend connection settings.

use serde::{Deserialize, Serialize};

/// Where the Supabase project lives and how to reach it.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Supabase project reference (the `<ref>` in `<ref>.supabase.co`).
    pub project_ref: String,
    /// Publishable anon key. Usually supplied via `NEARBY_SUPABASE_KEY`.
    pub api_key: String,
    /// Overrides the derived `https://<ref>.supabase.co/rest/v1` base URL.
    pub rest_url: Option<String>,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("project_ref", &self.project_ref)
            .field("api_key", &"[REDACTED]")
            .field("rest_url", &self.rest_url)
            .finish()
    }
}

impl BackendConfig {
    /// Base URL of the PostgREST API.
    pub fn rest_base_url(&self) -> String {
        match &self.rest_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.supabase.co/rest/v1", self.project_ref),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.project_ref.is_empty() && !self.api_key.is_empty()
    }
}
