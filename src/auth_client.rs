// Authenticated client: header augmentation and transparent access-token refresh

use crate::config::ClientConfig;
use crate::context::{LocaleResolver, SharedLocale, SystemTimezone, TimezoneResolver};
use crate::error::{ClientError, Result};
use crate::refresh::{RefreshCoordinator, RefreshGuard, RefreshTicket};
use crate::session::SessionStore;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
use crate::types::*;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LANGUAGE_HEADER: &str = "X-Language";
pub const TIMEZONE_HEADER: &str = "X-Timezone";

pub const LOGIN_PATH: &str = "/auth/login";
pub const SIGNUP_PATH: &str = "/auth/signup";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const SETUP_PASSWORD_PATH: &str = "/auth/setup-password";

/// Endpoints whose 401 is final; refreshing on them would recurse
pub const REFRESH_EXEMPT_PATHS: [&str; 4] =
    [LOGIN_PATH, SIGNUP_PATH, REFRESH_PATH, SETUP_PASSWORD_PATH];

pub fn is_refresh_exempt(url: &str) -> bool {
    REFRESH_EXEMPT_PATHS.iter().any(|path| url.contains(path))
}

fn set_or_fallback(request: &mut ApiRequest, name: &str, value: &str, fallback: &str) {
    if let Err(e) = request.set_header(name, value) {
        warn!(header = %name, error = %e, "Invalid header value, using fallback");
        if let Err(e) = request.set_header(name, fallback) {
            warn!(header = %name, error = %e, "Fallback header value rejected");
        }
    }
}

/// Exchange the stored refresh token for a new pair and store it.
///
/// A session signed out while the refresh was in flight stays signed out; the new pair is
/// discarded and the cycle fails.
async fn refresh_tokens<T: Transport>(
    transport: &T,
    session: &SessionStore,
    url: &str,
) -> Result<TokenPair> {
    let current = session
        .current_token()
        .ok_or_else(|| ClientError::Authentication("no refresh token stored".to_string()))?;

    let body = serde_json::to_value(RefreshRequest {
        refresh_token: current.refresh.clone(),
    })?;

    debug!(endpoint = %url, "Refreshing access token");
    let response = transport
        .send(ApiRequest::post(url).with_body(body))
        .await?
        .error_for_status()?;

    let (token, _) = IssuedTokens::from_body(&response.body)?.into_pair(&current.refresh);
    if !session.update_token(token.clone())? {
        return Err(ClientError::Authentication(
            "signed out while the access token was being refreshed".to_string(),
        ));
    }
    info!("Access token refreshed successfully");

    Ok(token)
}

/// HTTP client that attaches identity/locale headers to every call and recovers from an
/// expired access token without duplicating refresh calls.
///
/// Refresh calls go through `refresh_transport`, which is never intercepted, so a failing
/// refresh cannot trigger another refresh. A refresh runs on its own task: dropping the request
/// that started it does not cancel it.
pub struct AuthClient<T: Transport = HttpTransport> {
    config: ClientConfig,
    session: SessionStore,
    locale: Arc<dyn LocaleResolver>,
    timezone: Arc<dyn TimezoneResolver>,
    transport: T,
    refresh_transport: Arc<T>,
    refresh: Arc<RefreshCoordinator>,
}

impl AuthClient<HttpTransport> {
    /// Create a client talking to the configured backend over reqwest
    pub fn new(config: ClientConfig, session: SessionStore) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(config.timeout())?;
        let refresh_transport = HttpTransport::new(config.timeout())?;
        Ok(Self::with_transports(
            config,
            session,
            transport,
            refresh_transport,
        ))
    }
}

impl<T: Transport> AuthClient<T> {
    pub fn with_transports(
        config: ClientConfig,
        session: SessionStore,
        transport: T,
        refresh_transport: T,
    ) -> Self {
        Self {
            config,
            session,
            locale: Arc::new(SharedLocale::default()),
            timezone: Arc::new(SystemTimezone),
            transport,
            refresh_transport: Arc::new(refresh_transport),
            refresh: Arc::new(RefreshCoordinator::new()),
        }
    }

    pub fn with_locale(mut self, locale: Arc<dyn LocaleResolver>) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_timezone(mut self, timezone: Arc<dyn TimezoneResolver>) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Attach `X-Language`, `X-Timezone` and, when signed in, `Authorization: Bearer`.
    ///
    /// Never fails: unresolvable values degrade to the configured fallbacks.
    pub fn augment(&self, request: &mut ApiRequest) {
        let language = self
            .locale
            .language()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.config.fallback_language.clone());
        set_or_fallback(
            request,
            LANGUAGE_HEADER,
            &language,
            &self.config.fallback_language,
        );

        let timezone = self.timezone.resolve().unwrap_or_else(|e| {
            debug!(error = %e, fallback = %self.config.fallback_timezone, "Using fallback timezone");
            self.config.fallback_timezone.clone()
        });
        set_or_fallback(
            request,
            TIMEZONE_HEADER,
            &timezone,
            &self.config.fallback_timezone,
        );

        if let Some(token) = self.session.current_token() {
            if let Err(e) = request.set_bearer(&token.access) {
                warn!(error = %e, "Stored access token is not a valid header value, sending unauthenticated");
            }
        }
    }

    /// Send a request through the augmentation and 401-recovery stages.
    ///
    /// Non-2xx statuses other than a recoverable 401 come back as [`ClientError::Status`].
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        self.augment(&mut request);
        let response = self.transport.send(request.clone()).await?;
        if !response.is_unauthorized() {
            return response.error_for_status();
        }
        self.recover(request, response).await
    }

    fn refresh_eligible(&self, request: &ApiRequest) -> bool {
        !is_refresh_exempt(&request.url)
            && request.bearer_token().is_some()
            && !request.is_retried()
    }

    async fn recover(&self, mut request: ApiRequest, response: ApiResponse) -> Result<ApiResponse> {
        if !self.refresh_eligible(&request) {
            debug!(url = %request.url, retried = request.is_retried(), "401 is not eligible for token refresh");
            return response.error_for_status();
        }

        let waiter = match self.refresh.join() {
            RefreshTicket::Waiter(waiter) => {
                debug!(url = %request.url, "Waiting for in-flight token refresh");
                waiter
            }
            RefreshTicket::Leader { guard, waiter } => {
                request.mark_retried();
                self.spawn_refresh(guard);
                waiter
            }
        };

        match waiter.wait().await {
            Ok(access) => self.replay(request, &access).await,
            Err(e) => Err(ClientError::Refresh(e)),
        }
    }

    /// Run one refresh cycle to completion on its own task and settle `guard` with the outcome.
    ///
    /// On failure the session is cleared before the queue is woken, so every caller resumes
    /// into the signed-out state.
    fn spawn_refresh(&self, guard: RefreshGuard) {
        let transport = Arc::clone(&self.refresh_transport);
        let session = self.session.clone();
        let url = self.config.auth_url(REFRESH_PATH);

        tokio::spawn(async move {
            match refresh_tokens(transport.as_ref(), &session, &url).await {
                Ok(token) => guard.finish(Ok(token.access)),
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "Token refresh failed, signing out");
                    session.sign_out();
                    guard.finish(Err(Arc::new(e)));
                }
            }
        });
    }

    /// Resubmit a request with a fresh access token. A 401 here is final.
    async fn replay(&self, mut request: ApiRequest, access_token: &str) -> Result<ApiResponse> {
        request.mark_retried();
        request.set_bearer(access_token)?;
        debug!(method = %request.method, url = %request.url, "Replaying request with refreshed token");
        self.transport.send(request).await?.error_for_status()
    }

    pub async fn request<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<ApiResponse>
    where
        B: Serialize + ?Sized + Sync,
    {
        let mut request = ApiRequest::new(method, self.config.api_url(path));
        if let Some(body) = body {
            request.body = Some(serde_json::to_value(body)?);
        }
        self.send(request).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request::<()>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize + ?Sized + Sync>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize + ?Sized + Sync>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch<B: Serialize + ?Sized + Sync>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request::<()>(Method::DELETE, path, None).await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        self.get(path).await?.json()
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        self.post(path, body).await?.json()
    }

    /// Sign in with email and password
    pub async fn login(&self, request: &LoginRequest) -> Result<Session> {
        self.establish_session(LOGIN_PATH, request).await
    }

    /// Register a new account and sign in
    pub async fn signup(&self, request: &SignupRequest) -> Result<Session> {
        self.establish_session(SIGNUP_PATH, request).await
    }

    /// Set the first password from an invitation token and sign in
    pub async fn setup_password(&self, request: &SetupPasswordRequest) -> Result<Session> {
        self.establish_session(SETUP_PASSWORD_PATH, request).await
    }

    pub fn sign_out(&self) {
        self.session.sign_out();
    }

    async fn establish_session<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<Session> {
        let request = ApiRequest::post(self.config.auth_url(path)).with_body(serde_json::to_value(body)?);
        let response = self.send(request).await?;

        let issued = IssuedTokens::from_body(&response.body)?;
        let refresh = issued.refresh_token.clone().filter(|r| !r.is_empty()).ok_or_else(|| {
            ClientError::InvalidResponse(format!("{path} response carries no refresh token"))
        })?;
        let (token, user) = issued.into_pair(&refresh);

        self.session.set_session(token.clone(), user.clone())?;
        info!(endpoint = %path, "Session established");

        Ok(Session { token, user })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FixedTimezone, SUPPORTED_LANGUAGES};
    use crate::token_store::{CredentialStore, MemoryCredentialStore, ACCESS_TOKEN_KEY};
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    type Responder = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync>;

    /// Records every request and answers with `responder`; a gated mock holds each call
    /// until the test releases it.
    #[derive(Clone)]
    struct MockTransport {
        inner: Arc<MockInner>,
    }

    struct MockInner {
        responder: Responder,
        calls: Mutex<Vec<ApiRequest>>,
        gate: Option<Semaphore>,
    }

    impl MockTransport {
        fn new(responder: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static) -> Self {
            Self::build(responder, None)
        }

        fn gated(responder: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static) -> Self {
            Self::build(responder, Some(Semaphore::new(0)))
        }

        fn build(
            responder: impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static,
            gate: Option<Semaphore>,
        ) -> Self {
            Self {
                inner: Arc::new(MockInner {
                    responder: Box::new(responder),
                    calls: Mutex::new(Vec::new()),
                    gate,
                }),
            }
        }

        fn release(&self) {
            if let Some(gate) = &self.inner.gate {
                gate.add_permits(1);
            }
        }

        fn calls(&self) -> Vec<ApiRequest> {
            self.inner.calls.lock().clone()
        }

        fn call_count(&self) -> usize {
            self.inner.calls.lock().len()
        }
    }

    impl Transport for MockTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
            self.inner.calls.lock().push(request.clone());
            if let Some(gate) = &self.inner.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            (self.inner.responder)(&request)
        }
    }

    /// Backend that rejects access token "A" (and anonymous calls) and accepts anything else
    fn expires_token_a(request: &ApiRequest) -> Result<ApiResponse> {
        match request.bearer_token() {
            None | Some("A") => Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "jwt expired")),
            Some(_) => Ok(ApiResponse::new(StatusCode::OK, "ok")),
        }
    }

    fn refresh_succeeds(_: &ApiRequest) -> Result<ApiResponse> {
        Ok(ApiResponse::new(
            StatusCode::OK,
            r#"{"accessToken":"B","refreshToken":"R2"}"#,
        ))
    }

    fn refresh_rejected(_: &ApiRequest) -> Result<ApiResponse> {
        Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "refresh token expired"))
    }

    fn signed_in(access: &str, refresh: &str) -> SessionStore {
        let session = SessionStore::in_memory();
        session
            .set_session(TokenPair::new(access, refresh), None)
            .unwrap();
        session
    }

    fn client(main: &MockTransport, refresh: &MockTransport, session: SessionStore) -> AuthClient<MockTransport> {
        AuthClient::with_transports(
            ClientConfig::new("https://portal.example.com/api"),
            session,
            main.clone(),
            refresh.clone(),
        )
        .with_timezone(Arc::new(FixedTimezone(chrono_tz::Asia::Tashkent)))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    struct BrokenTimezone;

    impl TimezoneResolver for BrokenTimezone {
        fn resolve(&self) -> Result<String> {
            Err(ClientError::Timezone("no zone database".to_string()))
        }
    }

    #[test]
    fn test_refresh_exempt_paths() {
        assert!(is_refresh_exempt("https://portal.example.com/api/auth/login"));
        assert!(is_refresh_exempt("/auth/refresh"));
        assert!(is_refresh_exempt("/api/auth/setup-password?token=x"));
        assert!(is_refresh_exempt("/v2/auth/signup"));
        assert!(!is_refresh_exempt("/api/auth/me"));
        assert!(!is_refresh_exempt("/api/students"));
    }

    #[test]
    fn test_augment_attaches_headers_for_every_language() {
        let main = MockTransport::new(expires_token_a);
        let locale = SharedLocale::default();
        let client = client(&main, &main, signed_in("A", "R")).with_locale(Arc::new(locale.clone()));

        for language in SUPPORTED_LANGUAGES {
            locale.set(language);
            for method in [Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
                let mut request = ApiRequest::new(method, "https://portal.example.com/api/students");
                client.augment(&mut request);
                assert_eq!(request.header(LANGUAGE_HEADER), Some(language));
                assert_eq!(request.header(TIMEZONE_HEADER), Some("Asia/Tashkent"));
                assert_eq!(request.header("Authorization"), Some("Bearer A"));
            }
        }
    }

    #[test]
    fn test_augment_degrades_to_defaults() {
        let main = MockTransport::new(expires_token_a);
        let client = client(&main, &main, SessionStore::in_memory())
            .with_timezone(Arc::new(BrokenTimezone));

        let mut request = ApiRequest::get("/students");
        client.augment(&mut request);

        assert_eq!(request.header(LANGUAGE_HEADER), Some("en"));
        assert_eq!(request.header(TIMEZONE_HEADER), Some("UTC"));
        assert_eq!(request.header("Authorization"), None);
    }

    #[tokio::test]
    async fn test_refresh_and_replay_on_401() {
        let credentials = MemoryCredentialStore::new();
        let session = SessionStore::new(Arc::new(credentials.clone()));
        let user = User {
            full_name: Some("Aziza".to_string()),
            ..User::default()
        };
        session
            .set_session(TokenPair::new("A", "R"), Some(user.clone()))
            .unwrap();

        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, session);

        let response = client.get("/data/x").await.unwrap();
        assert_eq!(response.body, "ok");

        let calls = main.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].bearer_token(), Some("A"));
        assert_eq!(calls[1].bearer_token(), Some("B"));
        assert_eq!(calls[1].url, "https://portal.example.com/api/data/x");
        assert!(calls[1].is_retried());

        let refresh_calls = refresh.calls();
        assert_eq!(refresh_calls.len(), 1);
        assert_eq!(refresh_calls[0].url, "https://portal.example.com/api/auth/refresh");
        assert_eq!(refresh_calls[0].body, Some(json!({"refreshToken": "R"})));
        assert_eq!(refresh_calls[0].bearer_token(), None);

        let current = client.session().current().unwrap();
        assert_eq!(current.token, TokenPair::new("B", "R2"));
        assert_eq!(current.user, Some(user));
        assert_eq!(credentials.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_refresh_failure_signs_out() {
        let credentials = MemoryCredentialStore::new();
        let session = SessionStore::new(Arc::new(credentials.clone()));
        session.set_session(TokenPair::new("A", "R"), None).unwrap();
        let mut observer = session.subscribe();
        observer.borrow_and_update();

        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::new(refresh_rejected);
        let client = client(&main, &refresh, session);

        let err = client.get("/data/x").await.unwrap_err();
        match &err {
            ClientError::Refresh(cause) => assert!(cause.is_unauthorized()),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(main.call_count(), 1);
        assert!(!client.session().is_signed_in());
        assert!(credentials.is_empty());
        assert!(observer.has_changed().unwrap());
        assert!(observer.borrow().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::gated(refresh_succeeds);
        let client = Arc::new(client(&main, &refresh, signed_in("A", "R")));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.get(&format!("/students/{i}")).await })
            })
            .collect();

        wait_until(|| refresh.call_count() == 1 && client.refresh.pending() == 5).await;
        refresh.release();

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.body, "ok");
        }

        assert_eq!(refresh.call_count(), 1);
        let calls = main.calls();
        assert_eq!(calls.len(), 10);
        let replays: Vec<_> = calls.iter().filter(|c| c.bearer_token() == Some("B")).collect();
        assert_eq!(replays.len(), 5);
        for i in 0..5 {
            let url = format!("https://portal.example.com/api/students/{i}");
            assert_eq!(replays.iter().filter(|c| c.url == url).count(), 1);
        }
        assert!(!client.refresh.is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_failure_fans_out_same_error() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::gated(refresh_rejected);
        let client = Arc::new(client(&main, &refresh, signed_in("A", "R")));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.get(&format!("/attendance/{i}")).await })
            })
            .collect();

        wait_until(|| refresh.call_count() == 1 && client.refresh.pending() == 4).await;
        refresh.release();

        let mut causes = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Err(ClientError::Refresh(cause)) => causes.push(cause),
                other => panic!("expected refresh failure, got {other:?}"),
            }
        }
        assert!(causes.iter().all(|c| Arc::ptr_eq(c, &causes[0])));

        // No request was replayed
        assert_eq!(main.call_count(), 4);
        assert_eq!(refresh.call_count(), 1);
        assert!(!client.session().is_signed_in());
    }

    #[tokio::test]
    async fn test_exempt_endpoints_never_refresh() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, signed_in("A", "R"));

        for path in REFRESH_EXEMPT_PATHS {
            let err = client.post(path, &json!({})).await.unwrap_err();
            assert!(err.is_unauthorized(), "{path} should surface the 401");
        }

        assert_eq!(refresh.call_count(), 0);
        assert_eq!(main.call_count(), REFRESH_EXEMPT_PATHS.len());
        assert!(client.session().is_signed_in());
    }

    #[tokio::test]
    async fn test_unauthenticated_401_never_refreshes() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, SessionStore::in_memory());

        let err = client.get("/students").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(refresh.call_count(), 0);
        assert_eq!(main.calls()[0].bearer_token(), None);
    }

    #[tokio::test]
    async fn test_retried_request_is_not_refreshed_again() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, signed_in("A", "R"));

        let mut request = ApiRequest::get("https://portal.example.com/api/students");
        request.mark_retried();
        let err = client.send(request).await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(refresh.call_count(), 0);
        assert_eq!(main.call_count(), 1);
    }

    #[tokio::test]
    async fn test_401_on_replay_is_final() {
        let main = MockTransport::new(|_| Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "nope")));
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, signed_in("A", "R"));

        let err = client.get("/students").await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(main.call_count(), 2);
        assert_eq!(refresh.call_count(), 1);
        // The refresh itself succeeded, so the session stays
        assert_eq!(client.session().current_token(), Some(TokenPair::new("B", "R2")));
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let main = MockTransport::new(|_| {
            Ok(ApiResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"))
        });
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, signed_in("A", "R"));

        match client.get("/students").await {
            Err(ClientError::Status { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(main.call_count(), 1);
        assert_eq!(refresh.call_count(), 0);
    }

    #[tokio::test]
    async fn test_new_cycle_after_failed_refresh() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::new(refresh_rejected);
        let client = client(&main, &refresh, signed_in("A", "R"));

        assert!(client.get("/students").await.is_err());
        assert!(!client.refresh.is_refreshing());

        client
            .session()
            .set_session(TokenPair::new("A", "R9"), None)
            .unwrap();
        assert!(client.get("/students").await.is_err());

        let refresh_calls = refresh.calls();
        assert_eq!(refresh_calls.len(), 2);
        assert_eq!(refresh_calls[1].body, Some(json!({"refreshToken": "R9"})));
    }

    #[tokio::test]
    async fn test_login_establishes_session() {
        let main = MockTransport::new(|request| {
            assert!(request.url.ends_with(LOGIN_PATH));
            assert_eq!(request.body.as_ref().unwrap()["email"], "parent@example.com");
            Ok(ApiResponse::new(
                StatusCode::OK,
                r#"{"data":{"accessToken":"A","refreshToken":"R","user":{"id":3,"role":"parent"}}}"#,
            ))
        });
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, SessionStore::in_memory());

        let session = client
            .login(&LoginRequest {
                email: "parent@example.com".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(session.token, TokenPair::new("A", "R"));
        assert_eq!(session.user.as_ref().unwrap().id, Some(Value::from(3)));
        assert_eq!(client.session().current(), Some(session));

        client.sign_out();
        assert!(!client.session().is_signed_in());
    }

    #[tokio::test]
    async fn test_login_without_refresh_token_is_rejected() {
        let main = MockTransport::new(|_| Ok(ApiResponse::new(StatusCode::OK, r#"{"accessToken":"A"}"#)));
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, SessionStore::in_memory());

        let err = client
            .setup_password(&SetupPasswordRequest {
                token: "invite".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InvalidResponse(_)));
        assert!(!client.session().is_signed_in());
    }

    /// Credential store that refuses every write
    struct ReadOnlyStore;

    impl CredentialStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: String) -> Result<()> {
            Err(ClientError::Storage("keychain unavailable".to_string()))
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_refresh_survives_cancelled_leader() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::gated(refresh_succeeds);
        let client = Arc::new(client(&main, &refresh, signed_in("A", "R")));

        let leader = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                tokio::time::timeout(Duration::from_millis(50), client.get("/students/0")).await
            })
        };
        wait_until(|| refresh.call_count() == 1).await;

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get("/students/1").await })
        };
        wait_until(|| client.refresh.pending() == 2).await;

        assert!(leader.await.unwrap().is_err(), "leader should time out");
        assert!(client.refresh.is_refreshing());

        refresh.release();
        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.body, "ok");

        assert_eq!(refresh.call_count(), 1);
        assert_eq!(client.session().current_token(), Some(TokenPair::new("B", "R2")));
        let last = main.calls().pop().unwrap();
        assert_eq!(last.url, "https://portal.example.com/api/students/1");
        assert_eq!(last.bearer_token(), Some("B"));
    }

    #[tokio::test]
    async fn test_sign_out_during_refresh_stays_signed_out() {
        let main = MockTransport::new(expires_token_a);
        let refresh = MockTransport::gated(refresh_succeeds);
        let client = Arc::new(client(&main, &refresh, signed_in("A", "R")));

        let request = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get("/students").await })
        };
        wait_until(|| refresh.call_count() == 1).await;

        client.sign_out();
        refresh.release();

        match request.await.unwrap() {
            Err(ClientError::Refresh(cause)) => {
                assert!(matches!(*cause, ClientError::Authentication(_)))
            }
            other => panic!("expected refresh failure, got {other:?}"),
        }
        assert!(!client.session().is_signed_in());
        assert_eq!(main.call_count(), 1);
    }

    #[tokio::test]
    async fn test_login_with_unwritable_store_stays_signed_out() {
        let main = MockTransport::new(|_| {
            Ok(ApiResponse::new(
                StatusCode::OK,
                r#"{"accessToken":"A","refreshToken":"R"}"#,
            ))
        });
        let refresh = MockTransport::new(refresh_succeeds);
        let client = client(&main, &refresh, SessionStore::new(Arc::new(ReadOnlyStore)));

        let err = client
            .login(&LoginRequest {
                email: "parent@example.com".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Storage(_)));
        assert!(!client.session().is_signed_in());
        assert_eq!(client.session().current_token(), None);
    }
}
