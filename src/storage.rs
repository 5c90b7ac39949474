/// Durable key-value storage backends for session data
use crate::error::{AuthError, Result};
use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// String-keyed record store
///
/// The session manager is the only writer. Removing a key that does not
/// exist is not an error.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete the value stored under `key`
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory storage implementation
///
/// Thread-safe, cheap to clone (clones share the same map).
/// Suitable for testing and simple use cases.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// File-based storage implementation using XDG conventions
///
/// Every key is stored in its own file, `<base>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a new file storage instance for an application
    ///
    /// Respects XDG Base Directory Specification on Unix systems:
    /// - Checks $XDG_DATA_HOME environment variable first
    /// - Falls back to the platform data directory (`~/.local/share` on Linux,
    ///   `~/Library/Application Support` on macOS, AppData on Windows)
    ///
    /// # Example
    ///
    /// ```no_run
    /// use setlist::storage::FileStore;
    ///
    /// let storage = FileStore::new("my-app").unwrap();
    /// // Stores data in $XDG_DATA_HOME/my-app/ or ~/.local/share/my-app/
    /// ```
    pub fn new(app_name: &str) -> Result<Self> {
        let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg_data)
        } else {
            dirs::data_dir()
                .ok_or_else(|| AuthError::Storage("Could not determine data directory".into()))?
        };

        Self::with_path(base_dir.join(app_name))
    }

    /// Create a file storage instance rooted at a custom path
    pub fn with_path(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| {
            AuthError::Storage(format!("Failed to create storage directory: {}", e))
        })?;

        Ok(Self { base_path: path })
    }

    /// Directory holding the stored files
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe_key = key.replace(['/', '\\', ':'], "_");
        self.base_path.join(format!("{}.json", safe_key))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to read {}: {}",
                key, e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::write(self.key_path(key), value)
            .map_err(|e| AuthError::Storage(format!("Failed to write {}: {}", key, e)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to remove {}: {}",
                key, e
            ))),
        }
    }
}

/// Secure storage using the OS credential manager
///
/// Long-lived credentials go to the platform keyring:
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service API (libsecret)
///
/// The short-lived PKCE values only survive one login round-trip and are
/// kept in a [`FileStore`] next to the application data.
#[derive(Debug, Clone)]
pub struct SecureStore {
    app_name: String,
    secret_keys: Vec<String>,
    fallback: FileStore,
}

impl SecureStore {
    /// Create a secure store that keeps `secret_keys` in the keyring
    pub fn new(app_name: &str, secret_keys: &[&str]) -> Result<Self> {
        let fallback = FileStore::new(app_name)?;
        Ok(Self::with_fallback(app_name, secret_keys, fallback))
    }

    /// Create a secure store whose non-secret keys live in `fallback`
    pub fn with_fallback(app_name: &str, secret_keys: &[&str], fallback: FileStore) -> Self {
        Self {
            app_name: app_name.to_string(),
            secret_keys: secret_keys.iter().map(|k| k.to_string()).collect(),
            fallback,
        }
    }

    fn is_secret(&self, key: &str) -> bool {
        self.secret_keys.iter().any(|k| k == key)
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        let service = format!("setlist-{}", self.app_name);
        Entry::new(&service, key)
            .map_err(|e| AuthError::Storage(format!("Failed to create keyring entry: {}", e)))
    }
}

impl KeyValueStore for SecureStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.is_secret(key) {
            return self.fallback.get(key);
        }

        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to read {} from keyring: {}",
                key, e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if !self.is_secret(key) {
            return self.fallback.set(key, value);
        }

        self.entry(key)?
            .set_password(value)
            .map_err(|e| AuthError::Storage(format!("Failed to save {} to keyring: {}", key, e)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        if !self.is_secret(key) {
            return self.fallback.remove(key);
        }

        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to delete {} from keyring: {}",
                key, e
            ))),
        }
    }
}
