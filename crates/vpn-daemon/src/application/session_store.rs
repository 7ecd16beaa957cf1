//! Persistence seam for the bound account, device, and key pair, plus the
//! small pieces of state that survive a restart: the last account used and
//! whether the tunnel was wanted up.
//!
//! The session manager never touches the store directly.  It queues
//! [`StoreWrite`]s on a [`StoreWriter`], which applies them one at a time on
//! Tokio's blocking pool in the order they were queued.

use std::error::Error as StdError;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use vpn_core::{AccountIdentity, AccountToken, DeviceIdentity, KeyPair, TargetState};

/// Boxed backend error carried as the source of a [`StoreError`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A store operation failed.  The backend's own error is kept as the source.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {what}")]
    Write {
        what: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to remove {what}")]
    Remove {
        what: &'static str,
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    pub fn write(what: &'static str, source: impl Into<BoxError>) -> Self {
        StoreError::Write {
            what,
            source: source.into(),
        }
    }

    pub fn remove(what: &'static str, source: impl Into<BoxError>) -> Self {
        StoreError::Remove {
            what,
            source: source.into(),
        }
    }
}

/// Everything needed to restore a logged-in session after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub account: AccountIdentity,
    pub device: DeviceIdentity,
    pub keys: KeyPair,
}

/// What a store had on disk when the daemon started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoredState {
    pub session: Option<StoredSession>,
    /// The account most recently logged in to.  Kept across logouts.
    pub account_history: Option<AccountToken>,
    pub target_state: TargetState,
}

impl RestoredState {
    pub fn with_session(session: StoredSession) -> Self {
        Self {
            account_history: Some(session.account.token.clone()),
            session: Some(session),
            ..Self::default()
        }
    }
}

/// Where the session manager writes what must survive a restart.
///
/// Implementations may block; they are only ever called from the
/// [`StoreWriter`]'s blocking task.  A failed write is logged and never
/// undoes the committed state change that caused it.
pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &StoredSession) -> Result<(), StoreError>;
    fn clear_session(&self) -> Result<(), StoreError>;
    /// Records the last account, or forgets it with `None`.
    fn save_account_history(&self, account: Option<&AccountToken>) -> Result<(), StoreError>;
    fn save_target_state(&self, target: TargetState) -> Result<(), StoreError>;
}

/// Store that keeps nothing.  Used with `--dry-run`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralStore;

impl SessionStore for EphemeralStore {
    fn save_session(&self, _session: &StoredSession) -> Result<(), StoreError> {
        Ok(())
    }

    fn clear_session(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn save_account_history(&self, _account: Option<&AccountToken>) -> Result<(), StoreError> {
        Ok(())
    }

    fn save_target_state(&self, _target: TargetState) -> Result<(), StoreError> {
        Ok(())
    }
}

// ── Ordered background writes ─────────────────────────────────────────────────

/// One queued change to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    /// `None` clears the stored session.
    Session(Option<StoredSession>),
    AccountHistory(Option<AccountToken>),
    TargetState(TargetState),
}

impl StoreWrite {
    fn label(&self) -> &'static str {
        match self {
            StoreWrite::Session(_) => "session",
            StoreWrite::AccountHistory(_) => "account history",
            StoreWrite::TargetState(_) => "target state",
        }
    }

    fn apply(&self, store: &dyn SessionStore) -> Result<(), StoreError> {
        match self {
            StoreWrite::Session(Some(session)) => store.save_session(session),
            StoreWrite::Session(None) => store.clear_session(),
            StoreWrite::AccountHistory(account) => store.save_account_history(account.as_ref()),
            StoreWrite::TargetState(target) => store.save_target_state(*target),
        }
    }
}

/// Applies [`StoreWrite`]s in submission order, off the caller's task.
pub struct StoreWriter {
    tx: Option<mpsc::UnboundedSender<StoreWrite>>,
    task: Option<JoinHandle<()>>,
}

impl StoreWriter {
    /// Starts the writer task.  Must be called from inside a Tokio runtime.
    pub fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreWrite>();
        let task = tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                let what = write.label();
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || write.apply(store.as_ref())).await {
                    Ok(Ok(())) => debug!(what, "persisted"),
                    Ok(Err(e)) => error!(what, error = %e, cause = ?e.source(), "failed to persist"),
                    Err(e) => error!(what, error = %e, "store write panicked"),
                }
            }
        });
        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    pub fn submit(&self, write: StoreWrite) {
        let Some(tx) = &self.tx else {
            warn!(what = write.label(), "store writer closed, dropping write");
            return;
        };
        if tx.send(write).is_err() {
            warn!("store writer task has stopped");
        }
    }

    /// Stops accepting writes and waits until every queued one has been
    /// applied.
    pub async fn close(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "store writer ended abnormally");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        log: Mutex<Vec<String>>,
        fail_sessions: bool,
    }

    impl RecordingStore {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl SessionStore for RecordingStore {
        fn save_session(&self, session: &StoredSession) -> Result<(), StoreError> {
            if self.fail_sessions {
                return Err(StoreError::write(
                    "session",
                    std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                ));
            }
            self.push(format!("save {}", session.device.id));
            Ok(())
        }

        fn clear_session(&self) -> Result<(), StoreError> {
            self.push("clear".to_string());
            Ok(())
        }

        fn save_account_history(&self, account: Option<&AccountToken>) -> Result<(), StoreError> {
            self.push(format!("history {:?}", account.map(AccountToken::as_str)));
            Ok(())
        }

        fn save_target_state(&self, target: TargetState) -> Result<(), StoreError> {
            self.push(format!("target {target:?}"));
            Ok(())
        }
    }

    fn session(id: &str) -> StoredSession {
        let keys = KeyPair::generate();
        StoredSession {
            account: AccountIdentity::new(AccountToken::new("1234123412341234")),
            device: DeviceIdentity {
                id: id.to_string(),
                name: "calm heron".to_string(),
                pubkey: keys.public.clone(),
                created: chrono::Utc::now(),
                revoked: false,
            },
            keys,
        }
    }

    #[tokio::test]
    async fn test_writes_are_applied_in_submission_order() {
        // Arrange
        let store = Arc::new(RecordingStore::default());
        let mut writer = StoreWriter::spawn(store.clone());

        // Act
        writer.submit(StoreWrite::Session(Some(session("d-1"))));
        writer.submit(StoreWrite::AccountHistory(Some(AccountToken::new("1234"))));
        writer.submit(StoreWrite::TargetState(TargetState::Secured));
        writer.submit(StoreWrite::Session(None));
        writer.close().await;

        // Assert
        assert_eq!(
            *store.log.lock().unwrap(),
            vec![
                "save d-1".to_string(),
                "history Some(\"1234\")".to_string(),
                "target Secured".to_string(),
                "clear".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_later_writes() {
        let store = Arc::new(RecordingStore {
            fail_sessions: true,
            ..RecordingStore::default()
        });
        let mut writer = StoreWriter::spawn(store.clone());

        writer.submit(StoreWrite::Session(Some(session("d-1"))));
        writer.submit(StoreWrite::Session(None));
        writer.close().await;

        assert_eq!(*store.log.lock().unwrap(), vec!["clear".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_after_close_is_dropped() {
        let store = Arc::new(RecordingStore::default());
        let mut writer = StoreWriter::spawn(store.clone());
        writer.close().await;

        writer.submit(StoreWrite::TargetState(TargetState::Secured));

        assert!(store.log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_store_error_keeps_backend_source() {
        let error = StoreError::remove(
            "session",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        );

        assert_eq!(error.to_string(), "failed to remove session");
        assert_eq!(error.source().unwrap().to_string(), "read-only");
    }

    #[test]
    fn test_restored_session_seeds_account_history() {
        let stored = session("d-1");

        let restored = RestoredState::with_session(stored.clone());

        assert_eq!(restored.account_history, Some(stored.account.token.clone()));
        assert_eq!(restored.target_state, TargetState::Unsecured);
    }
}
