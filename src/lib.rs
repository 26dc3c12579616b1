//! Portal Rust Client
//!
//! Authenticated HTTP client for the parent/teacher portal API. Every request carries the
//! UI language, the device timezone and the current bearer token; an expired access token is
//! refreshed once for all concurrent callers and the failed requests are replayed.

pub mod auth_client;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod refresh;
pub mod session;
pub mod token_store;
pub mod transport;
pub mod types;

pub use auth_client::AuthClient;
pub use config::ClientConfig;
pub use context::{FixedTimezone, LocaleResolver, SharedLocale, SystemTimezone, TimezoneResolver};
pub use error::{ClientError, Result};
pub use session::SessionStore;
pub use token_store::{CredentialStore, MemoryCredentialStore};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
pub use types::{LoginRequest, Session, SetupPasswordRequest, SignupRequest, TokenPair, User};
