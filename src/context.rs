//! Locale and timezone resolution for outgoing requests

use crate::error::{ClientError, Result};
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::str::FromStr;
use std::sync::Arc;

/// Locales the portal backend serves translations for
pub const SUPPORTED_LANGUAGES: [&str; 3] = ["en", "ru", "uz"];

/// Source of the current UI language
pub trait LocaleResolver: Send + Sync + 'static {
    /// Current language code, or `None` when the UI has not picked one yet
    fn language(&self) -> Option<String>;
}

/// Source of the device's IANA timezone identifier
pub trait TimezoneResolver: Send + Sync + 'static {
    fn resolve(&self) -> Result<String>;
}

/// Language setting shared between the UI and the client
#[derive(Clone, Default)]
pub struct SharedLocale {
    language: Arc<RwLock<Option<String>>>,
}

impl SharedLocale {
    pub fn new(language: impl Into<String>) -> Self {
        let locale = Self::default();
        locale.set(language);
        locale
    }

    pub fn set(&self, language: impl Into<String>) {
        let language = language.into();
        let language = language.trim();
        *self.language.write() = (!language.is_empty()).then(|| language.to_string());
    }

    pub fn clear(&self) {
        *self.language.write() = None;
    }
}

impl LocaleResolver for SharedLocale {
    fn language(&self) -> Option<String> {
        self.language.read().clone()
    }
}

/// Reads the zone from the `TZ` environment variable.
///
/// Only `TZ` is consulted, not the platform's zone database or settings. Where `TZ` is unset,
/// which is the usual case on phones and desktops, resolution fails and requests carry the
/// configured fallback zone. Hosts that know the device zone should supply their own
/// [`TimezoneResolver`] (or a [`FixedTimezone`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimezone;

impl TimezoneResolver for SystemTimezone {
    fn resolve(&self) -> Result<String> {
        let raw = std::env::var("TZ")
            .map_err(|_| ClientError::Timezone("TZ is not set".to_string()))?;
        parse_zone(raw.trim_start_matches(':'))
    }
}

/// Always reports the same zone
#[derive(Debug, Clone, Copy)]
pub struct FixedTimezone(pub Tz);

impl TimezoneResolver for FixedTimezone {
    fn resolve(&self) -> Result<String> {
        Ok(self.0.name().to_string())
    }
}

/// Validate an IANA zone name, returning its canonical spelling
pub fn parse_zone(name: &str) -> Result<String> {
    Tz::from_str(name.trim())
        .map(|tz| tz.name().to_string())
        .map_err(|e| ClientError::Timezone(format!("'{name}': {e}")))
}
