//! Client configuration

use crate::error::{ClientError, Result};
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the authenticated client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix for relative API paths, e.g. `https://portal.example.com/api`
    pub base_url: String,

    /// Prefix for the `/auth/*` endpoints; falls back to `base_url`
    pub auth_base_url: Option<String>,

    /// Sent as `X-Language` when the UI has not chosen a language
    pub fallback_language: String,

    /// Sent as `X-Timezone` when the device zone cannot be resolved
    pub fallback_timezone: String,

    /// Per-request timeout applied by the HTTP transport
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            auth_base_url: None,
            fallback_language: "en".to_string(),
            fallback_timezone: "UTC".to_string(),
            timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_auth_base_url(mut self, auth_base_url: impl Into<String>) -> Self {
        self.auth_base_url = Some(auth_base_url.into());
        self
    }

    pub fn with_fallback_language(mut self, language: impl Into<String>) -> Self {
        self.fallback_language = language.into();
        self
    }

    pub fn with_fallback_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.fallback_timezone = timezone.into();
        self
    }

    /// Defaults overridden by `PORTAL_*` environment variables
    /// (`PORTAL_BASE_URL`, `PORTAL_AUTH_BASE_URL`, `PORTAL_TIMEOUT_SECS`, ...)
    pub fn from_env() -> Result<Self> {
        Self::figment().extract::<Self>().map_err(|e| {
            ClientError::Configuration(format!("failed to load client configuration: {e}"))
        })
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(ClientConfig::default()))
            .merge(Env::prefixed("PORTAL_"))
    }

    pub fn auth_base(&self) -> &str {
        self.auth_base_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Join a path onto `base_url`; absolute URLs pass through untouched
    pub fn api_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn auth_url(&self, path: &str) -> String {
        join_url(self.auth_base(), path)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ClientError::Configuration(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.fallback_language.trim().is_empty() {
            return Err(ClientError::Configuration(
                "fallback_language must not be empty".to_string(),
            ));
        }
        crate::context::parse_zone(&self.fallback_timezone)
            .map_err(|e| ClientError::Configuration(e.to_string()))?;
        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
