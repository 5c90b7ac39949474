/// Cross-process locking for token refresh
use crate::error::Result;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File-based locks that serialize token refreshes between processes
///
/// Two processes sharing the same durable session would otherwise both
/// redeem the refresh token, and with rotating refresh tokens the loser
/// ends up holding a revoked credential.
#[derive(Debug, Clone)]
pub struct RefreshLockManager {
    lock_dir: PathBuf,
}

impl RefreshLockManager {
    /// Create a lock manager rooted at `lock_dir`
    pub fn new(lock_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    /// Create a lock manager for an application in the default location
    ///
    /// Uses `$XDG_RUNTIME_DIR/setlist-locks/<app>` when available, a per-user
    /// directory under the system temp dir otherwise.
    pub fn for_app(app_name: &str) -> Result<Self> {
        let base = match std::env::var("XDG_RUNTIME_DIR") {
            Ok(runtime_dir) => PathBuf::from(runtime_dir).join("setlist-locks"),
            Err(_) => std::env::temp_dir().join(format!("setlist-locks-{}", user_id())),
        };
        Self::new(base.join(app_name))
    }

    /// Directory holding the lock files
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Block until the exclusive lock for `key` is held
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire_lock(&self, key: &str) -> Result<RefreshLock> {
        let (file, path) = self.open_lock_file(key)?;
        file.lock_exclusive()?;
        debug!(path = %path.display(), "Acquired refresh lock");
        Ok(RefreshLock { file, path })
    }

    /// Take the lock for `key` if it is free
    ///
    /// Returns `None` if another holder has it.
    pub fn try_acquire_lock(&self, key: &str) -> Result<Option<RefreshLock>> {
        let (file, path) = self.open_lock_file(key)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RefreshLock { file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open_lock_file(&self, key: &str) -> Result<(File, PathBuf)> {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.lock_dir.join(format!("{}.lock", safe_key))
    }
}

#[cfg(unix)]
fn user_id() -> String {
    use std::os::unix::fs::MetadataExt;
    dirs::home_dir()
        .and_then(|home| home.metadata().ok())
        .map(|m| m.uid().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(unix))]
fn user_id() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// RAII guard for a refresh lock
///
/// The lock file itself is left in place; deleting it while another
/// process waits on the same path would let two holders coexist.
pub struct RefreshLock {
    file: File,
    path: PathBuf,
}

impl RefreshLock {
    /// Get the path to the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RefreshLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "Released refresh lock");
    }
}
