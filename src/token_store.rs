//! Persisted credential storage
//!
//! Where credentials actually live (keychain, secure storage, a file) is up to the host
//! application; the client only needs a small key-value capability.

use crate::error::Result;
use papaya::HashMap;
use std::sync::Arc;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

/// Key-value storage for credentials that must survive a restart
pub trait CredentialStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: String) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Thread-safe in-memory credential store using Papaya HashMap
#[derive(Clone)]
pub struct MemoryCredentialStore {
    entries: Arc<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(HashMap::new()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.pin().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.pin().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.pin().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.pin().remove(key);
        Ok(())
    }
}
