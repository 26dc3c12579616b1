//! HTTP transport boundary
//!
//! [`Transport`] sends a request exactly as described and reports whatever status the server
//! answered with. Header augmentation and 401 recovery live one layer up, in
//! [`crate::auth_client::AuthClient`].

use crate::error::{ClientError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const BEARER_PREFIX: &str = "Bearer ";

/// An outgoing request, owned by whoever is about to send or replay it
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.set_header(name, value)?;
        Ok(self)
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::InvalidHeader(format!("{name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_bearer(&mut self, access_token: &str) -> Result<()> {
        let mut value = HeaderValue::from_str(&format!("{BEARER_PREFIX}{access_token}"))
            .map_err(|e| ClientError::InvalidHeader(format!("{AUTHORIZATION}: {e}")))?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Token from an `Authorization: Bearer ...` header, if the request carries one
    pub fn bearer_token(&self) -> Option<&str> {
        self.header(AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix(BEARER_PREFIX))
            .filter(|token| !token.is_empty())
    }

    /// Whether a token refresh has already been attempted for this request
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub fn mark_retried(&mut self) {
        self.retried = true;
    }
}

/// A response as received, including error statuses
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Turn a non-2xx response into [`ClientError::Status`]
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ClientError::Status {
                status: self.status,
                body: self.body,
            })
        }
    }
}

/// Something that can put an [`ApiRequest`] on the wire
pub trait Transport: Send + Sync + 'static {
    /// Send the request. Only transport-level failures are errors; any HTTP status is `Ok`.
    fn send(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client })
    }

    pub fn from_client(http_client: Client) -> Self {
        Self { http_client }
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        debug!(method = %request.method, url = %request.url, "Sending request");

        let mut builder = self
            .http_client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        debug!(url = %request.url, status = %status, "Received response");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
