/// Provider configuration
use crate::error::{AuthError, Result};
use std::env;
use std::time::Duration;

pub const DEFAULT_AUTHORIZE_ENDPOINT: &str = "https://accounts.spotify.com/authorize";
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://accounts.spotify.com/api/token";
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Permission scopes requested on every authorization
pub const DEFAULT_SCOPES: &[&str] = &[
    "playlist-modify-public",
    "playlist-modify-private",
    "playlist-read-private",
    "playlist-read-collaborative",
    "user-library-read",
    "user-library-modify",
    "user-read-private",
    "user-read-email",
    "streaming",
];

/// OAuth client registration and provider endpoints
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub api_base_url: String,
    pub scopes: Vec<String>,
    pub http_timeout: Duration,
}

impl ProviderConfig {
    /// Create a configuration pointing at the default provider endpoints
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            authorize_endpoint: DEFAULT_AUTHORIZE_ENDPOINT.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Load configuration from the environment
    ///
    /// - `SETLIST_CLIENT_ID` (required)
    /// - `SETLIST_REDIRECT_URI` (defaults to a loopback callback on port 8888)
    /// - `SETLIST_AUTHORIZE_URL`, `SETLIST_TOKEN_URL`, `SETLIST_API_BASE_URL` (optional overrides)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let client_id = lookup("SETLIST_CLIENT_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AuthError::Config("SETLIST_CLIENT_ID is not set".into()))?;
        let redirect_uri =
            lookup("SETLIST_REDIRECT_URI").unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string());

        let mut config = Self::new(client_id, redirect_uri);
        if let Some(url) = lookup("SETLIST_AUTHORIZE_URL") {
            config.authorize_endpoint = url;
        }
        if let Some(url) = lookup("SETLIST_TOKEN_URL") {
            config.token_endpoint = url;
        }
        if let Some(url) = lookup("SETLIST_API_BASE_URL") {
            config.api_base_url = url;
        }
        Ok(config)
    }

    pub fn with_authorize_endpoint(mut self, url: impl Into<String>) -> Self {
        self.authorize_endpoint = url.into();
        self
    }

    pub fn with_token_endpoint(mut self, url: impl Into<String>) -> Self {
        self.token_endpoint = url.into();
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_scopes<I, T>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Space-separated scope list as sent to the provider
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}
