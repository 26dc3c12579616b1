//! Error types for the portal client

use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Shared by every request that waited on the same refresh attempt
    #[error("Token refresh failed: {0}")]
    Refresh(Arc<ClientError>),

    #[error("Token refresh was abandoned before it completed")]
    RefreshAborted,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("Timezone resolution failed: {0}")]
    Timezone(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// HTTP status carried by the error, if the server answered at all
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::HttpRequest(e) => e.status(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
