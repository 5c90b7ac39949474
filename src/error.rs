/// Error types for setlist authentication operations
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authorization denied by provider: {error}")]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("State parameter mismatch, the callback was not initiated by this session")]
    StateMismatch,

    #[error("Code verifier not found, please log in again")]
    MissingVerifier,

    #[error("Token exchange failed: {}", detail(.error, .description))]
    TokenExchangeFailed {
        error: String,
        description: Option<String>,
    },

    #[error("Token refresh failed: {}", detail(.error, .description))]
    TokenRefreshFailed {
        error: String,
        description: Option<String>,
    },

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Failed to fetch user profile: HTTP {status}")]
    ProfileFetchFailed { status: u16 },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Timed out waiting for the authorization callback")]
    CallbackTimeout,
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Prefer the provider's human-readable description over its error code
fn detail<'a>(error: &'a str, description: &'a Option<String>) -> &'a str {
    description.as_deref().unwrap_or(error)
}
