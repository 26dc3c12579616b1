//! Process-wide identity store
//!
//! Holds the single valid [`Session`] and mirrors it into a [`CredentialStore`]. Changes are
//! published through a watch channel so the application can react to a forced sign-out.
//!
//! A new session is persisted before it is published. If persisting fails, the stored
//! credentials are rolled back to the previous session and nothing is published.

use crate::error::Result;
use crate::token_store::{
    CredentialStore, MemoryCredentialStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY,
};
use crate::types::{Session, TokenPair, User};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    state: watch::Sender<Option<Session>>,
    credentials: Arc<dyn CredentialStore>,
}

impl SessionStore {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner { state, credentials }),
        }
    }

    /// Session store backed by process memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialStore::new()))
    }

    pub fn current(&self) -> Option<Session> {
        self.inner.state.borrow().clone()
    }

    pub fn current_token(&self) -> Option<TokenPair> {
        self.inner.state.borrow().as_ref().map(|s| s.token.clone())
    }

    pub fn user(&self) -> Option<User> {
        self.inner.state.borrow().as_ref().and_then(|s| s.user.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    /// Observe session transitions; `None` means signed out
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.inner.state.subscribe()
    }

    /// Replace the session wholesale.
    ///
    /// On a storage error the previous session stays in effect, in memory and on disk.
    pub fn set_session(&self, token: TokenPair, user: Option<User>) -> Result<()> {
        let session = Session { token, user };
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| {
            result = self.replace(state, session);
            result.is_ok()
        });
        result
    }

    /// Swap the token pair, keeping the current user record.
    ///
    /// Returns `Ok(false)` without touching anything when there is no session, so a refresh
    /// finishing after a sign-out cannot sign the user back in.
    pub fn update_token(&self, token: TokenPair) -> Result<bool> {
        let mut result = Ok(false);
        self.inner.state.send_if_modified(|state| {
            let Some(current) = state.as_ref() else {
                debug!("Session cleared before token update, discarding new tokens");
                return false;
            };
            let session = Session {
                token,
                user: current.user.clone(),
            };
            result = self.replace(state, session).map(|()| true);
            result.is_ok()
        });
        result
    }

    fn replace(&self, state: &mut Option<Session>, session: Session) -> Result<()> {
        if let Err(e) = self.persist(&session) {
            let restored = match state.as_ref() {
                Some(previous) => self.persist(previous),
                None => self.clear_persisted(),
            };
            if let Err(rollback) = restored {
                warn!(error = %rollback, "Failed to roll back persisted credentials");
            }
            return Err(e);
        }
        *state = Some(session);
        Ok(())
    }

    /// Clear the session and the persisted credentials
    pub fn sign_out(&self) {
        let previous = self.inner.state.send_replace(None);
        if let Err(e) = self.clear_persisted() {
            warn!(error = %e, "Failed to remove persisted credentials");
        }
        if previous.is_some() {
            info!("Signed out");
        }
    }

    /// Load a previously persisted session, if both tokens are present
    pub fn restore(&self) -> Result<Option<Session>> {
        let credentials = &self.inner.credentials;
        let (Some(access), Some(refresh)) = (
            credentials.get(ACCESS_TOKEN_KEY)?,
            credentials.get(REFRESH_TOKEN_KEY)?,
        ) else {
            debug!("No persisted session to restore");
            return Ok(None);
        };

        let user = match credentials.get(USER_KEY)? {
            Some(raw) => match serde_json::from_str::<User>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable persisted user record");
                    None
                }
            },
            None => None,
        };

        let session = Session {
            token: TokenPair::new(access, refresh),
            user,
        };
        self.inner.state.send_replace(Some(session.clone()));
        info!("Restored persisted session");
        Ok(Some(session))
    }

    /// Remove every credential key, reporting the first failure
    fn clear_persisted(&self) -> Result<()> {
        let mut first_error = None;
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.inner.credentials.remove(key) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let credentials = &self.inner.credentials;
        credentials.set(ACCESS_TOKEN_KEY, session.token.access.clone())?;
        credentials.set(REFRESH_TOKEN_KEY, session.token.refresh.clone())?;
        match &session.user {
            Some(user) => credentials.set(USER_KEY, serde_json::to_string(user)?)?,
            None => credentials.remove(USER_KEY)?,
        }
        Ok(())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
