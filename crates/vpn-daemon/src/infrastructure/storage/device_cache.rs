//! JSON files holding the state that survives a restart.
//!
//! | File | Contents |
//! |---|---|
//! | `device.json` | bound account, device, and key pair (private key included) |
//! | `account-history.json` | the last account logged in to |
//! | `target-state.json` | whether the tunnel was wanted up |
//!
//! Files are read once at startup and rewritten after every change.  Writes
//! go to a temporary file first and are then renamed over the old one, so a
//! crash mid-write leaves either the old or the new contents.  On Unix the
//! directory is created `0700` and every file `0600`: `device.json` carries
//! the tunnel private key.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use vpn_core::{AccountToken, TargetState};

use crate::application::session_store::{RestoredState, SessionStore, StoreError, StoredSession};

pub const DEVICE_CACHE_FILENAME: &str = "device.json";
pub const ACCOUNT_HISTORY_FILENAME: &str = "account-history.json";
pub const TARGET_STATE_FILENAME: &str = "target-state.json";

#[derive(Debug, Error)]
pub enum DeviceCacheError {
    #[error("I/O error accessing device cache at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize device cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct DeviceCache {
    dir: PathBuf,
}

impl DeviceCache {
    /// A cache whose files live inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Path of `device.json`.
    pub fn path(&self) -> PathBuf {
        self.dir.join(DEVICE_CACHE_FILENAME)
    }

    pub fn account_history_path(&self) -> PathBuf {
        self.dir.join(ACCOUNT_HISTORY_FILENAME)
    }

    pub fn target_state_path(&self) -> PathBuf {
        self.dir.join(TARGET_STATE_FILENAME)
    }

    /// Reads the stored session.
    ///
    /// A missing file means logged out.  A file that cannot be parsed is
    /// logged and also treated as logged out.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceCacheError::Io`] for read failures other than "not found".
    pub fn load(&self) -> Result<Option<StoredSession>, DeviceCacheError> {
        read_json(&self.path())
    }

    /// Reads all three files.  Missing or corrupt files fall back to their
    /// empty value.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceCacheError::Io`] for read failures other than "not found".
    pub fn load_all(&self) -> Result<RestoredState, DeviceCacheError> {
        let session = self.load()?;
        let account_history = read_json::<AccountToken>(&self.account_history_path())?
            .or_else(|| session.as_ref().map(|s| s.account.token.clone()));
        let target_state = read_json(&self.target_state_path())?.unwrap_or_default();
        Ok(RestoredState {
            session,
            account_history,
            target_state,
        })
    }

    /// Writes `session`, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceCacheError`] if the directory or file cannot be written.
    pub fn write(&self, session: &StoredSession) -> Result<(), DeviceCacheError> {
        write_private(&self.dir, &self.path(), session)
    }

    /// Deletes `device.json`.  A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceCacheError::Io`] if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<(), DeviceCacheError> {
        remove_if_present(&self.path())
    }
}

impl SessionStore for DeviceCache {
    fn save_session(&self, session: &StoredSession) -> Result<(), StoreError> {
        self.write(session)
            .map_err(|e| StoreError::write("device cache", e))
    }

    fn clear_session(&self) -> Result<(), StoreError> {
        self.remove()
            .map_err(|e| StoreError::remove("device cache", e))
    }

    fn save_account_history(&self, account: Option<&AccountToken>) -> Result<(), StoreError> {
        let path = self.account_history_path();
        match account {
            Some(account) => write_private(&self.dir, &path, account)
                .map_err(|e| StoreError::write("account history", e)),
            None => remove_if_present(&path).map_err(|e| StoreError::remove("account history", e)),
        }
    }

    fn save_target_state(&self, target: TargetState) -> Result<(), StoreError> {
        write_private(&self.dir, &self.target_state_path(), &target)
            .map_err(|e| StoreError::write("target state", e))
    }
}

// ── File helpers ──────────────────────────────────────────────────────────────

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DeviceCacheError {
    let path = path.to_path_buf();
    move |source| DeviceCacheError::Io { path, source }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DeviceCacheError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path)(source)),
    };
    match serde_json::from_str(&content) {
        Ok(value) => {
            debug!(path = %path.display(), "restored cache file");
            Ok(Some(value))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt cache file");
            Ok(None)
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), DeviceCacheError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(io_error(path)(source)),
    }
}

/// Serializes `value` to `path` through a temporary file that only the
/// owner can read.
fn write_private<T: Serialize + ?Sized>(dir: &Path, path: &Path, value: &T) -> Result<(), DeviceCacheError> {
    create_private_dir(dir).map_err(io_error(dir))?;
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    // A stale temp file from a crash may carry looser permissions.
    remove_if_present(&tmp)?;
    let mut file = open_private(&tmp).map_err(io_error(&tmp))?;
    file.write_all(&content).map_err(io_error(&tmp))?;
    file.sync_all().map_err(io_error(&tmp))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(io_error(path))
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt as _, PermissionsExt as _};

    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    // `mode` only applies to directories created by this call.
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt as _;

    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use vpn_core::{AccountIdentity, DeviceIdentity, KeyPair};

    fn temp_cache() -> (PathBuf, DeviceCache) {
        let dir = std::env::temp_dir().join(format!("vpn_cache_test_{}", Uuid::new_v4()));
        let cache = DeviceCache::in_dir(&dir);
        (dir, cache)
    }

    fn session() -> StoredSession {
        let keys = KeyPair::generate();
        StoredSession {
            account: AccountIdentity::new(AccountToken::new("1234123412341234")).with_expiry(Utc::now()),
            device: DeviceIdentity {
                id: "d-1".to_string(),
                name: "quiet fox".to_string(),
                pubkey: keys.public.clone(),
                created: Utc::now(),
                revoked: false,
            },
            keys,
        }
    }

    #[test]
    fn test_load_without_file_is_logged_out() {
        let (_dir, cache) = temp_cache();

        assert_eq!(cache.load().unwrap(), None);
        assert_eq!(cache.load_all().unwrap(), RestoredState::default());
    }

    #[test]
    fn test_written_session_is_restored() {
        // Arrange
        let (dir, cache) = temp_cache();
        let stored = session();

        // Act
        cache.save_session(&stored).unwrap();
        let restored = cache.load().unwrap();

        // Assert
        assert_eq!(restored, Some(stored));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_file_is_treated_as_logged_out() {
        let (dir, cache) = temp_cache();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(cache.path(), "{ definitely not a session").unwrap();

        assert_eq!(cache.load().unwrap(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_clear_removes_the_file_and_tolerates_absence() {
        let (dir, cache) = temp_cache();
        cache.save_session(&session()).unwrap();

        cache.clear_session().unwrap();
        cache.clear_session().unwrap();

        assert!(!cache.path().exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_private_key_is_persisted() {
        let (dir, cache) = temp_cache();
        let stored = session();

        cache.save_session(&stored).unwrap();
        let raw = std::fs::read_to_string(cache.path()).unwrap();

        assert!(raw.contains(stored.keys.private.as_str()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_files_are_readable_only_by_owner() {
        use std::os::unix::fs::PermissionsExt as _;

        // Arrange
        let (dir, cache) = temp_cache();

        // Act
        cache.save_session(&session()).unwrap();
        cache.save_session(&session()).unwrap();
        cache
            .save_account_history(Some(&AccountToken::new("1234123412341234")))
            .unwrap();

        // Assert
        let mode = |path: &Path| std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode(&cache.path()) & 0o077, 0, "device.json is group/other accessible");
        assert_eq!(mode(&cache.account_history_path()) & 0o077, 0);
        assert_eq!(mode(&dir) & 0o077, 0, "cache directory is group/other accessible");
        assert!(!cache.path().with_extension("json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_open_directory_is_tightened() {
        use std::os::unix::fs::PermissionsExt as _;

        let (dir, cache) = temp_cache();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        cache.save_target_state(TargetState::Secured).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_history_and_target_survive_logout() {
        // Arrange
        let (dir, cache) = temp_cache();
        let stored = session();
        cache.save_session(&stored).unwrap();
        cache.save_account_history(Some(&stored.account.token)).unwrap();
        cache.save_target_state(TargetState::Secured).unwrap();

        // Act
        cache.clear_session().unwrap();
        let restored = cache.load_all().unwrap();

        // Assert
        assert_eq!(restored.session, None);
        assert_eq!(restored.account_history, Some(stored.account.token));
        assert_eq!(restored.target_state, TargetState::Secured);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_clearing_history_removes_the_file() {
        let (dir, cache) = temp_cache();
        cache
            .save_account_history(Some(&AccountToken::new("1234123412341234")))
            .unwrap();

        cache.save_account_history(None).unwrap();

        assert!(!cache.account_history_path().exists());
        assert_eq!(cache.load_all().unwrap().account_history, None);
        std::fs::remove_dir_all(&dir).ok();
    }
}
