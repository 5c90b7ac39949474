//! Setlist - OAuth 2.0 PKCE sessions for music-service API clients
//!
//! This library owns the login lifecycle of an application that talks to a
//! Spotify-style REST API: the Authorization Code flow with PKCE
//! (Proof Key for Code Exchange), durable token storage, and silent refresh.
//!
//! # Features
//!
//! - OAuth 2.0 authorization code flow with PKCE (RFC 7636)
//! - Loopback callback listener for command-line logins
//! - Pluggable storage backend (memory, files, OS keyring)
//! - Single-flight token refresh, optionally coordinated across processes
//!
//! # Example
//!
//! ```
//! use setlist::prelude::*;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(MemoryStore::new());
//! let config = ProviderConfig::new("your-client-id", "http://127.0.0.1:8888/callback");
//!
//! let manager = SessionManager::new(config, storage).unwrap();
//! let request = manager.begin_authorization().unwrap();
//! println!("Open {} to log in", request.url);
//!
//! // Nothing stored yet
//! assert!(manager.access_token().is_none());
//! ```

pub mod callback;
pub mod config;
pub mod error;
pub mod lock;
pub mod pkce;
pub mod session;
pub mod storage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::callback::CallbackServer;
    pub use crate::config::ProviderConfig;
    pub use crate::error::{AuthError, Result};
    pub use crate::lock::RefreshLockManager;
    pub use crate::pkce::PendingAuthorization;
    pub use crate::session::{
        AuthorizationRequest, CallbackOutcome, Session, SessionManager, TokenSet, UserProfile,
    };
    pub use crate::storage::{FileStore, KeyValueStore, MemoryStore, SecureStore};
}
