//! Session and wire types for authentication

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Access + refresh token pair currently held by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

/// Signed-in user record, as returned by the backend
///
/// Only the common fields are typed; anything else the backend sends is kept in `extra`
/// so it survives a persist/restore cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The process-wide authentication state
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: TokenPair,
    pub user: Option<User>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub full_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupPasswordRequest {
    /// One-time token from the invitation link
    pub token: String,
    pub password: String,
}

/// Tokens issued by login, signup, setup-password or refresh
///
/// `refresh_token` is optional: a refresh reply without one keeps the stored refresh token.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
}

impl IssuedTokens {
    /// Decode a token-bearing response body.
    ///
    /// The canonical shape is flat `{accessToken, refreshToken}`. Two enveloped shapes are
    /// accepted as well: `{data: {accessToken, refreshToken}}` and
    /// `{data: {token: {access, refresh}}}`.
    pub fn from_body(body: &str) -> Result<Self> {
        let wire: TokenWire = serde_json::from_str(body).map_err(|e| {
            ClientError::InvalidResponse(format!("unrecognised token response: {e}"))
        })?;

        let issued = match wire {
            TokenWire::Flat(flat) | TokenWire::Enveloped { data: TokenData::Flat(flat) } => {
                flat.into()
            }
            TokenWire::Enveloped {
                data: TokenData::Nested { token, user },
            } => IssuedTokens {
                access_token: token.access,
                refresh_token: token.refresh,
                user,
            },
        };

        if issued.access_token.is_empty() {
            return Err(ClientError::InvalidResponse(
                "token response carries an empty access token".to_string(),
            ));
        }
        Ok(issued)
    }

    /// Pair the issued tokens with the refresh token to keep when none was issued
    pub fn into_pair(self, fallback_refresh: &str) -> (TokenPair, Option<User>) {
        let refresh = self
            .refresh_token
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| fallback_refresh.to_string());
        (TokenPair::new(self.access_token, refresh), self.user)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenWire {
    Flat(FlatTokens),
    Enveloped { data: TokenData },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenData {
    Flat(FlatTokens),
    Nested {
        token: NestedTokens,
        #[serde(default)]
        user: Option<User>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatTokens {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<User>,
}

#[derive(Deserialize)]
struct NestedTokens {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

impl From<FlatTokens> for IssuedTokens {
    fn from(flat: FlatTokens) -> Self {
        Self {
            access_token: flat.access_token,
            refresh_token: flat.refresh_token,
            user: flat.user,
        }
    }
}
