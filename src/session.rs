/// Session state and the PKCE login lifecycle
use crate::callback::CallbackServer;
use crate::config::ProviderConfig;
use crate::error::{AuthError, Result};
use crate::lock::RefreshLockManager;
use crate::pkce::PendingAuthorization;
use crate::storage::KeyValueStore;
use parking_lot::{Mutex, RwLock};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

/// Storage key of the persisted session record
pub const SESSION_KEY: &str = "auth_data";

/// Storage key of the pending code verifier
pub const CODE_VERIFIER_KEY: &str = "code_verifier";

/// Storage key of the pending state token
pub const STATE_KEY: &str = "auth_state";

/// Access tokens this close to expiry are refreshed before use
pub const EXPIRY_MARGIN_MS: u64 = 5 * 60 * 1000;

/// Authenticated session
///
/// `access_token` and `expires_at` are either both set or both empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Epoch milliseconds
    pub expires_at: Option<u64>,
}

impl Session {
    /// Whether the access token is valid for longer than the safety margin
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => now_ms.saturating_add(EXPIRY_MARGIN_MS) < expires_at,
            _ => false,
        }
    }

    /// Whether the session holds no credentials at all
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.expires_at.is_none()
    }

    fn is_consistent(&self) -> bool {
        self.access_token.is_some() == self.expires_at.is_some()
    }
}

/// Tokens issued by a successful code exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds
    pub expires_in: u64,
}

/// Authorization URL together with the state it was issued for
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Result of inspecting a redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The query carried no authorization code
    NotACallback,
    /// The code was exchanged and the session is logged in
    Authorized(TokenSet),
}

/// Current user's profile
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    /// Full response body
    #[serde(skip)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

enum CachedToken {
    Fresh(String),
    Stale,
    Unavailable,
}

/// Owner of the session and the PKCE authorization flow
///
/// Construct one per process and share it by handle (`Arc`) with every
/// component that issues authenticated requests.
///
/// # Example
///
/// ```no_run
/// use setlist::prelude::*;
/// use std::sync::Arc;
///
/// let config = ProviderConfig::new("your-client-id", "http://127.0.0.1:8888/callback");
/// let storage = Arc::new(FileStore::new("setlist").unwrap());
/// let manager = SessionManager::new(config, storage).unwrap();
///
/// match manager.access_token() {
///     Some(token) => println!("Bearer {}", token),
///     None => println!("Not logged in"),
/// }
/// ```
pub struct SessionManager<S: KeyValueStore> {
    config: ProviderConfig,
    storage: Arc<S>,
    http: Client,
    session: RwLock<Session>,
    refresh_guard: Mutex<()>,
    refresh_lock: Option<RefreshLockManager>,
}

impl<S: KeyValueStore> SessionManager<S> {
    /// Create a manager and restore any session persisted in `storage`
    pub fn new(config: ProviderConfig, storage: Arc<S>) -> Result<Self> {
        let http = Client::builder().timeout(config.http_timeout).build()?;

        let manager = Self {
            config,
            storage,
            http,
            session: RwLock::new(Session::default()),
            refresh_guard: Mutex::new(()),
            refresh_lock: None,
        };
        manager.restore_from_storage();
        Ok(manager)
    }

    /// Coordinate refreshes with other processes sharing the same storage
    pub fn with_refresh_lock(mut self, lock_manager: RefreshLockManager) -> Self {
        self.refresh_lock = Some(lock_manager);
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    /// Start a login attempt without opening a browser
    ///
    /// Persists the code verifier and state under separate keys and
    /// returns the provider's authorization URL.
    pub fn begin_authorization(&self) -> Result<AuthorizationRequest> {
        let pending = PendingAuthorization::generate();

        self.storage.set(CODE_VERIFIER_KEY, pending.code_verifier())?;
        self.storage.set(STATE_KEY, pending.state())?;

        let url = self.build_authorize_url(&pending)?;
        debug!(url = %url, "Built authorization URL");

        Ok(AuthorizationRequest {
            url,
            state: pending.state().to_string(),
        })
    }

    /// Start a login attempt and open the consent page in the system browser
    ///
    /// The returned URL can be shown to the user in case no browser could be
    /// launched.
    pub fn authorize(&self) -> Result<AuthorizationRequest> {
        let request = self.begin_authorization()?;

        if let Err(e) = webbrowser::open(&request.url) {
            warn!(error = %e, "Could not open a browser for authorization");
        }

        Ok(request)
    }

    /// Run a complete login through a loopback listener
    ///
    /// Binds the redirect URI's port, opens the browser, and exchanges the
    /// first authorization code that arrives before `timeout`.
    pub fn authorize_with_loopback(&self, timeout: Duration) -> Result<TokenSet> {
        let server = CallbackServer::for_redirect_uri(&self.config.redirect_uri)?;
        let request = self.authorize()?;
        info!(url = %request.url, "Waiting for authorization in the browser");

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let callback = server.wait_for_callback(remaining)?;

            match self.handle_callback(callback.query()) {
                Ok(CallbackOutcome::Authorized(tokens)) => {
                    callback.respond_success()?;
                    return Ok(tokens);
                }
                Ok(CallbackOutcome::NotACallback) => {
                    callback.respond_failure("The redirect did not carry an authorization code.")?;
                }
                Err(e) => {
                    callback.respond_failure(&e.to_string())?;
                    return Err(e);
                }
            }
        }
    }

    /// Complete a login from the provider's redirect query string
    ///
    /// Safe to call for every incoming request: a query without `code`
    /// yields [`CallbackOutcome::NotACallback`] and leaves storage untouched.
    /// Once a code is present the pending verifier and state are deleted
    /// before anything else is checked, whatever the outcome.
    pub fn handle_callback(&self, query: &str) -> Result<CallbackOutcome> {
        let params: HashMap<String, String> =
            url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
                .into_owned()
                .collect();

        if let Some(error) = params.get("error") {
            self.discard_pending();
            warn!(error = %error, "Provider denied authorization");
            return Err(AuthError::AuthorizationDenied {
                error: error.clone(),
                description: params.get("error_description").cloned(),
            });
        }

        let code = match params.get("code") {
            Some(code) => code,
            None => return Ok(CallbackOutcome::NotACallback),
        };

        let stored_state = self.storage.get(STATE_KEY);
        let stored_verifier = self.storage.get(CODE_VERIFIER_KEY);
        self.discard_pending();

        let stored_state = stored_state?;
        if stored_state.is_none() || stored_state.as_ref() != params.get("state") {
            warn!("Callback state does not match the pending authorization");
            return Err(AuthError::StateMismatch);
        }

        let code_verifier = stored_verifier?.ok_or(AuthError::MissingVerifier)?;
        let tokens = self.exchange_code_for_tokens(code, &code_verifier)?;

        Ok(CallbackOutcome::Authorized(tokens))
    }

    /// Redeem an authorization code for tokens
    pub fn exchange_code_for_tokens(&self, code: &str, code_verifier: &str) -> Result<TokenSet> {
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code_verifier", code_verifier),
            ])
            .send()?;

        if !response.status().is_success() {
            let (error, description) = provider_error(response);
            warn!(error = %error, "Token exchange rejected");
            return Err(AuthError::TokenExchangeFailed { error, description });
        }

        let data: TokenResponse = response.json()?;
        let session = Session {
            access_token: Some(data.access_token.clone()),
            refresh_token: data.refresh_token.clone(),
            expires_at: Some(expires_at(data.expires_in)),
        };

        *self.session.write() = session.clone();
        self.persist(&session);
        info!(token = %mask_token(&data.access_token), "Logged in");

        Ok(TokenSet {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_in: data.expires_in,
        })
    }

    /// Obtain a new access token with the stored refresh token
    ///
    /// A rejected refresh clears the whole session, in memory and on disk.
    pub fn refresh_access_token(&self) -> Result<String> {
        let _cross_process = match &self.refresh_lock {
            Some(lock_manager) => {
                let lock = lock_manager.acquire_lock(SESSION_KEY)?;
                if let Some(token) = self.adopt_stored_refresh() {
                    return Ok(token);
                }
                Some(lock)
            }
            None => None,
        };

        let refresh_token = self
            .session
            .read()
            .refresh_token
            .clone()
            .ok_or(AuthError::NoRefreshToken)?;

        let response = self
            .http
            .post(&self.config.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.config.client_id.as_str()),
            ])
            .send()?;

        if !response.status().is_success() {
            let (error, description) = provider_error(response);
            warn!(error = %error, "Token refresh rejected, clearing session");
            self.clear_session();
            return Err(AuthError::TokenRefreshFailed { error, description });
        }

        let data: TokenResponse = response.json()?;
        let session = {
            let mut session = self.session.write();
            session.access_token = Some(data.access_token.clone());
            session.expires_at = Some(expires_at(data.expires_in));
            if let Some(rotated) = data.refresh_token {
                session.refresh_token = Some(rotated);
            }
            session.clone()
        };

        self.persist(&session);
        info!(token = %mask_token(&data.access_token), "Refreshed access token");

        Ok(data.access_token)
    }

    /// Get an access token that is safe to use right now
    ///
    /// Returns the cached token while it is more than five minutes from
    /// expiry, refreshes it otherwise. `None` means "not authenticated":
    /// there is no token, no way to refresh it, or the refresh failed.
    /// Concurrent callers share a single refresh.
    pub fn access_token(&self) -> Option<String> {
        match self.cached_token() {
            CachedToken::Fresh(token) => return Some(token),
            CachedToken::Unavailable => return None,
            CachedToken::Stale => {}
        }

        let _guard = self.refresh_guard.lock();

        // Another caller may have refreshed while we waited
        match self.cached_token() {
            CachedToken::Fresh(token) => Some(token),
            CachedToken::Unavailable => None,
            CachedToken::Stale => match self.refresh_access_token() {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(error = %e, "Failed to refresh access token");
                    None
                }
            },
        }
    }

    /// Whether a usable access token is available
    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    /// Forget the session locally; the provider is not contacted
    pub fn logout(&self) {
        self.clear_session();
        info!("Logged out");
    }

    /// Fetch the current user's profile
    pub fn user_profile(&self) -> Result<UserProfile> {
        let token = self.access_token().ok_or(AuthError::NotAuthenticated)?;
        let url = format!("{}/me", self.config.api_base_url.trim_end_matches('/'));

        let response = self.http.get(url).bearer_auth(token).send()?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Profile fetch failed");
            return Err(AuthError::ProfileFetchFailed {
                status: status.as_u16(),
            });
        }

        let raw: serde_json::Value = response.json()?;
        let mut profile: UserProfile = serde_json::from_value(raw.clone())?;
        profile.raw = raw;
        Ok(profile)
    }

    fn cached_token(&self) -> CachedToken {
        let session = self.session.read();
        match &session.access_token {
            None => CachedToken::Unavailable,
            Some(token) if session.is_fresh(now_millis()) => CachedToken::Fresh(token.clone()),
            Some(_) if session.refresh_token.is_some() => CachedToken::Stale,
            Some(_) => CachedToken::Unavailable,
        }
    }

    fn build_authorize_url(&self, pending: &PendingAuthorization) -> Result<String> {
        let scope = self.config.scope_string();
        let url = Url::parse_with_params(
            &self.config.authorize_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("scope", scope.as_str()),
                (
                    "code_challenge_method",
                    PendingAuthorization::code_challenge_method(),
                ),
                ("code_challenge", pending.code_challenge()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("state", pending.state()),
            ],
        )
        .map_err(|e| AuthError::Config(format!("Invalid authorization endpoint: {}", e)))?;

        Ok(url.into())
    }

    /// Pick up a session another process refreshed while we waited for the lock
    fn adopt_stored_refresh(&self) -> Option<String> {
        let stored = self.load_stored_session()?;
        let mut session = self.session.write();
        if stored != *session && stored.is_fresh(now_millis()) {
            debug!("Adopting session refreshed by another process");
            *session = stored;
            return session.access_token.clone();
        }
        None
    }

    fn clear_session(&self) {
        *self.session.write() = Session::default();
        self.clear_storage();
    }

    fn discard_pending(&self) {
        for key in [STATE_KEY, CODE_VERIFIER_KEY] {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "Failed to delete pending authorization");
            }
        }
    }

    /// Mirror the in-memory session to storage
    ///
    /// Memory stays authoritative: a failed write is logged and the tokens
    /// remain usable for the life of the process.
    fn persist(&self, session: &Session) {
        if let Err(e) = self.save_to_storage(session) {
            warn!(error = %e, "Failed to persist session");
        }
    }

    fn save_to_storage(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_string(session)?;
        self.storage.set(SESSION_KEY, &data)
    }

    fn restore_from_storage(&self) {
        if let Some(session) = self.load_stored_session() {
            debug!("Restored session from storage");
            *self.session.write() = session;
        }
    }

    fn load_stored_session(&self) -> Option<Session> {
        let data = match self.storage.get(SESSION_KEY) {
            Ok(data) => data?,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                return None;
            }
        };

        match serde_json::from_str::<Session>(&data) {
            Ok(session) if session.is_consistent() => Some(session),
            Ok(_) => {
                warn!("Stored session is inconsistent, clearing storage");
                self.clear_storage();
                None
            }
            Err(e) => {
                warn!(error = %e, "Stored session is corrupted, clearing storage");
                self.clear_storage();
                None
            }
        }
    }

    fn clear_storage(&self) {
        for key in [SESSION_KEY, CODE_VERIFIER_KEY, STATE_KEY] {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "Failed to clear storage");
            }
        }
    }
}

/// Extract the provider's error code and description from a failed response
fn provider_error(response: Response) -> (String, Option<String>) {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    let parsed: ErrorResponse = serde_json::from_str(&body).unwrap_or_default();

    let error = parsed.error.unwrap_or_else(|| {
        status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| status.as_str().to_string())
    });
    (error, parsed.error_description)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn expires_at(expires_in_secs: u64) -> u64 {
    now_millis().saturating_add(expires_in_secs.saturating_mul(1000))
}

/// Shorten a token for logs
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::thread;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MINUTE_MS: u64 = 60 * 1000;

    fn test_config(base: &str) -> ProviderConfig {
        ProviderConfig::new("test-client", "http://127.0.0.1:8888/callback")
            .with_authorize_endpoint(format!("{}/authorize", base))
            .with_token_endpoint(format!("{}/api/token", base))
            .with_api_base_url(format!("{}/v1", base))
    }

    fn manager(base: &str, storage: Arc<MemoryStore>) -> SessionManager<MemoryStore> {
        SessionManager::new(test_config(base), storage).unwrap()
    }

    fn seed(storage: &MemoryStore, access: &str, refresh: Option<&str>, expires_in_ms: u64) {
        let session = Session {
            access_token: Some(access.to_string()),
            refresh_token: refresh.map(str::to_string),
            expires_at: Some(now_millis() + expires_in_ms),
        };
        storage
            .set(SESSION_KEY, &serde_json::to_string(&session).unwrap())
            .unwrap();
    }

    fn token_body(access: &str, refresh: Option<&str>) -> serde_json::Value {
        let mut body = json!({
            "access_token": access,
            "token_type": "Bearer",
            "expires_in": 3600,
        });
        if let Some(refresh) = refresh {
            body["refresh_token"] = json!(refresh);
        }
        body
    }

    /// Run blocking client code off the async test runtime
    async fn blocking<T, F>(f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.unwrap()
    }

    #[test]
    fn test_session_freshness() {
        let now = now_millis();
        let session = |expires_at| Session {
            access_token: Some("a".into()),
            refresh_token: None,
            expires_at: Some(expires_at),
        };

        assert!(session(now + 10 * MINUTE_MS).is_fresh(now));
        assert!(!session(now + MINUTE_MS).is_fresh(now));
        assert!(!session(now - MINUTE_MS).is_fresh(now));
        assert!(!Session::default().is_fresh(now));
        assert!(Session::default().is_empty());
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = Session {
            access_token: Some("AT".into()),
            refresh_token: Some("RT".into()),
            expires_at: Some(42),
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(
            value,
            json!({"accessToken": "AT", "refreshToken": "RT", "expiresAt": 42})
        );
    }

    #[test]
    fn test_begin_authorization_persists_pending_and_builds_url() {
        let storage = Arc::new(MemoryStore::new());
        let manager = manager("https://accounts.example.com", storage.clone());

        let request = manager.begin_authorization().unwrap();

        let verifier = storage.get(CODE_VERIFIER_KEY).unwrap().unwrap();
        assert_eq!(verifier.len(), 64);
        assert_eq!(storage.get(STATE_KEY).unwrap().as_ref(), Some(&request.state));
        assert_eq!(request.state.len(), 16);

        let url = Url::parse(&request.url).unwrap();
        assert_eq!(url.path(), "/authorize");
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "test-client");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["code_challenge"], crate::pkce::code_challenge(&verifier));
        assert_eq!(query["redirect_uri"], "http://127.0.0.1:8888/callback");
        assert_eq!(query["state"], request.state);
        assert!(query["scope"].contains("playlist-modify-private"));
        assert!(query["scope"].contains("streaming"));
    }

    #[test]
    fn test_handle_callback_without_code_is_not_a_callback() {
        let storage = Arc::new(MemoryStore::new());
        let manager = manager("https://accounts.example.com", storage.clone());
        let request = manager.begin_authorization().unwrap();

        let outcome = manager.handle_callback("?foo=bar").unwrap();
        assert_eq!(outcome, CallbackOutcome::NotACallback);
        assert_eq!(manager.handle_callback("").unwrap(), CallbackOutcome::NotACallback);

        // Pending authorization untouched
        assert_eq!(storage.get(STATE_KEY).unwrap(), Some(request.state));
        assert!(storage.get(CODE_VERIFIER_KEY).unwrap().is_some());
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_handle_callback_error_is_authorization_denied() {
        let storage = Arc::new(MemoryStore::new());
        let manager = manager("https://accounts.example.com", storage.clone());
        manager.begin_authorization().unwrap();

        let err = manager
            .handle_callback("error=access_denied&state=whatever")
            .unwrap_err();
        match err {
            AuthError::AuthorizationDenied { error, .. } => assert_eq!(error, "access_denied"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(storage.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_mismatch_is_fatal_and_cleans_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT1", Some("RT1"))))
            .expect(0)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            let manager = manager(&uri, storage.clone());
            manager.begin_authorization().unwrap();

            let err = manager.handle_callback("code=abc&state=WRONG").unwrap_err();
            assert!(matches!(err, AuthError::StateMismatch));

            assert!(storage.get(STATE_KEY).unwrap().is_none());
            assert!(storage.get(CODE_VERIFIER_KEY).unwrap().is_none());
            assert_eq!(manager.session(), Session::default());
            assert!(!manager.is_authenticated());
        })
        .await;
    }

    #[test]
    fn test_missing_verifier() {
        let storage = Arc::new(MemoryStore::new());
        let manager = manager("https://accounts.example.com", storage.clone());
        storage.set(STATE_KEY, "S1").unwrap();

        let err = manager.handle_callback("code=abc&state=S1").unwrap_err();
        assert!(matches!(err, AuthError::MissingVerifier));
        assert!(storage.get(STATE_KEY).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_callback_exchanges_code_and_logs_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains("client_id=test-client"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT1", Some("RT1"))))
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            let manager = manager(&uri, storage.clone());
            let request = manager.begin_authorization().unwrap();

            let before = now_millis();
            let outcome = manager
                .handle_callback(&format!("?code=abc&state={}", request.state))
                .unwrap();
            let after = now_millis();

            assert_eq!(
                outcome,
                CallbackOutcome::Authorized(TokenSet {
                    access_token: "AT1".into(),
                    refresh_token: Some("RT1".into()),
                    expires_in: 3600,
                })
            );

            let session = manager.session();
            assert_eq!(session.access_token.as_deref(), Some("AT1"));
            assert_eq!(session.refresh_token.as_deref(), Some("RT1"));
            let expires_at = session.expires_at.unwrap();
            assert!(expires_at >= before + 3_600_000 && expires_at <= after + 3_600_000);

            assert!(storage.get(STATE_KEY).unwrap().is_none());
            assert!(storage.get(CODE_VERIFIER_KEY).unwrap().is_none());
            assert_eq!(manager.access_token().as_deref(), Some("AT1"));
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exchange_failure_carries_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid authorization code",
            })))
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            let manager = manager(&uri, storage.clone());

            let err = manager.exchange_code_for_tokens("bad", "verifier").unwrap_err();
            match &err {
                AuthError::TokenExchangeFailed { error, description } => {
                    assert_eq!(error, "invalid_grant");
                    assert_eq!(description.as_deref(), Some("Invalid authorization code"));
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(
                err.to_string(),
                "Token exchange failed: Invalid authorization code"
            );
            assert!(manager.session().is_empty());
            assert!(storage.get(SESSION_KEY).unwrap().is_none());
        })
        .await;
    }

    #[test]
    fn test_session_round_trips_through_storage() {
        let storage = Arc::new(MemoryStore::new());
        seed(&storage, "AT", Some("RT"), 10 * MINUTE_MS);

        let first = manager("https://accounts.example.com", storage.clone());
        let second = manager("https://accounts.example.com", storage.clone());

        assert_eq!(first.session(), second.session());
        assert_eq!(second.session().access_token.as_deref(), Some("AT"));
        assert_eq!(second.session().refresh_token.as_deref(), Some("RT"));
    }

    #[test]
    fn test_corrupted_storage_is_treated_as_logged_out() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(SESSION_KEY, "{not json").unwrap();
        storage.set(STATE_KEY, "S1").unwrap();

        let manager = manager("https://accounts.example.com", storage.clone());
        assert!(manager.session().is_empty());
        assert!(storage.is_empty());

        storage
            .set(SESSION_KEY, r#"{"accessToken":"AT","refreshToken":null,"expiresAt":null}"#)
            .unwrap();
        let manager = SessionManager::new(manager.config().clone(), storage.clone()).unwrap();
        assert!(manager.session().is_empty());
        assert!(storage.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fresh_token_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT2", None)))
            .expect(0)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), 10 * MINUTE_MS);
            let manager = manager(&uri, storage);

            assert_eq!(manager.access_token().as_deref(), Some("AT1"));
            assert_eq!(manager.access_token().as_deref(), Some("AT1"));
            assert!(manager.is_authenticated());
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_near_expiry_token_is_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT2", None)))
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), MINUTE_MS);
            let manager = manager(&uri, storage.clone());

            assert_eq!(manager.access_token().as_deref(), Some("AT2"));
            // Now fresh, no second request
            assert_eq!(manager.access_token().as_deref(), Some("AT2"));

            let session = manager.session();
            assert_eq!(session.refresh_token.as_deref(), Some("RT1"));
            assert!(session.is_fresh(now_millis()));

            let restored = SessionManager::new(manager.config().clone(), storage).unwrap();
            assert_eq!(restored.session(), session);
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_rotates_refresh_token_when_issued() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT2", Some("RT2"))))
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), 0);
            let manager = manager(&uri, storage);

            assert_eq!(manager.refresh_access_token().unwrap(), "AT2");
            assert_eq!(manager.session().refresh_token.as_deref(), Some("RT2"));
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_refresh_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Refresh token revoked",
            })))
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), MINUTE_MS);
            let manager = manager(&uri, storage.clone());

            let err = manager.refresh_access_token().unwrap_err();
            assert!(matches!(
                err,
                AuthError::TokenRefreshFailed { ref error, .. } if error == "invalid_grant"
            ));

            let session = manager.session();
            assert!(session.access_token.is_none());
            assert!(session.refresh_token.is_none());
            assert!(session.expires_at.is_none());
            assert!(storage.get(SESSION_KEY).unwrap().is_none());
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_refresh_downgrades_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), MINUTE_MS);
            let manager = manager(&uri, storage);

            assert!(manager.access_token().is_none());
            assert!(!manager.is_authenticated());
        })
        .await;
    }

    #[test]
    fn test_stale_token_without_refresh_token() {
        let storage = Arc::new(MemoryStore::new());
        seed(&storage, "AT1", None, MINUTE_MS);
        let manager = manager("http://127.0.0.1:9", storage);

        assert!(manager.access_token().is_none());
        assert!(matches!(
            manager.refresh_access_token(),
            Err(AuthError::NoRefreshToken)
        ));
    }

    #[test]
    fn test_logged_out_has_no_token() {
        let manager = manager("http://127.0.0.1:9", Arc::new(MemoryStore::new()));
        assert!(manager.access_token().is_none());
        assert!(matches!(
            manager.user_profile(),
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("AT2", None))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), MINUTE_MS);
            let manager = Arc::new(manager(&uri, storage));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let manager = manager.clone();
                    thread::spawn(move || manager.access_token())
                })
                .collect();

            for handle in handles {
                assert_eq!(handle.join().unwrap().as_deref(), Some("AT2"));
            }
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_adopts_session_refreshed_by_another_process() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT3", None)))
            .expect(0)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let lock_dir =
                std::env::temp_dir().join(format!("setlist_locks_{}", rand::random::<u32>()));
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), MINUTE_MS);
            let manager = manager(&uri, storage.clone())
                .with_refresh_lock(RefreshLockManager::new(lock_dir.clone()).unwrap());

            // Another process completed a refresh and persisted it
            seed(&storage, "AT2", Some("RT2"), 60 * MINUTE_MS);

            assert_eq!(manager.access_token().as_deref(), Some("AT2"));
            assert_eq!(manager.session().refresh_token.as_deref(), Some("RT2"));

            std::fs::remove_dir_all(lock_dir).ok();
        })
        .await;
    }

    /// Store whose session record cannot be written
    struct ReadOnlySessionStore(MemoryStore);

    impl KeyValueStore for ReadOnlySessionStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if key == SESSION_KEY {
                return Err(AuthError::Storage("disk full".into()));
            }
            self.0.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exchange_survives_storage_write_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT1", Some("RT1"))))
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(ReadOnlySessionStore(MemoryStore::new()));
            let manager = SessionManager::new(test_config(&uri), storage.clone()).unwrap();

            let tokens = manager.exchange_code_for_tokens("abc", "verifier").unwrap();
            assert_eq!(tokens.access_token, "AT1");

            assert!(storage.get(SESSION_KEY).unwrap().is_none());
            assert_eq!(manager.access_token().as_deref(), Some("AT1"));
            assert!(manager.is_authenticated());
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_keeps_rotated_token_when_storage_write_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("AT2", Some("RT2"))))
            .expect(1)
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let inner = MemoryStore::new();
            seed(&inner, "AT1", Some("RT1"), MINUTE_MS);
            let storage = Arc::new(ReadOnlySessionStore(inner));
            let manager = SessionManager::new(test_config(&uri), storage).unwrap();

            assert_eq!(manager.access_token().as_deref(), Some("AT2"));
            assert_eq!(manager.session().refresh_token.as_deref(), Some("RT2"));
            // Fresh in memory, so no second refresh
            assert_eq!(manager.access_token().as_deref(), Some("AT2"));
        })
        .await;
    }

    #[test]
    fn test_logout_is_idempotent() {
        let storage = Arc::new(MemoryStore::new());
        seed(&storage, "AT1", Some("RT1"), 10 * MINUTE_MS);
        storage.set(CODE_VERIFIER_KEY, "v").unwrap();
        let manager = manager("http://127.0.0.1:9", storage.clone());

        manager.logout();
        assert!(manager.session().is_empty());
        assert!(storage.is_empty());

        manager.logout();
        assert!(manager.session().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_user_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me"))
            .and(header("authorization", "Bearer AT1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "listener",
                "display_name": "A Listener",
                "email": "listener@example.com",
                "product": "premium",
                "followers": {"total": 3},
            })))
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), 10 * MINUTE_MS);
            let manager = manager(&uri, storage);

            let profile = manager.user_profile().unwrap();
            assert_eq!(profile.id, "listener");
            assert_eq!(profile.display_name.as_deref(), Some("A Listener"));
            assert_eq!(profile.country, None);
            assert_eq!(profile.raw["followers"]["total"], 3);
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_user_profile_failure_keeps_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let uri = server.uri();
        blocking(move || {
            let storage = Arc::new(MemoryStore::new());
            seed(&storage, "AT1", Some("RT1"), 10 * MINUTE_MS);
            let manager = manager(&uri, storage);

            assert!(matches!(
                manager.user_profile(),
                Err(AuthError::ProfileFetchFailed { status: 503 })
            ));
            assert_eq!(manager.session().access_token.as_deref(), Some("AT1"));
        })
        .await;
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("BQDabcdefgh"), "BQDa...");
        assert_eq!(mask_token("ab"), "ab...");
    }
}
