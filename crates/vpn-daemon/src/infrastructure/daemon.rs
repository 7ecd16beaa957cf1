//! Wires the daemon together from its configuration.
//!
//! Start-up order matters: the retry policy is built first, then the token
//! cache, then the directory client that uses both, then the session manager
//! that owns the session state and its broadcaster.  Shutdown runs in the
//! reverse direction: subscribers are released before the tunnel is torn
//! down, so no client observes the teardown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vpn_core::ApiError;

use crate::application::account_api::AccountApi;
use crate::application::account_directory::AccountDirectoryClient;
use crate::application::session_handle::{SessionError, SessionHandle};
use crate::application::session_manager::{ManagerDeps, SessionManager};
use crate::application::session_store::{EphemeralStore, RestoredState, SessionStore};
use crate::application::token_cache::AccessTokenCache;
use crate::application::tunnel_control::{TunnelCapability, TunnelEvent};
use crate::infrastructure::api::http::HttpAccountApi;
use crate::infrastructure::api::in_memory::InMemoryAccountApi;
use crate::infrastructure::storage::config::{ConfigError, DaemonConfig};
use crate::infrastructure::storage::device_cache::{DeviceCache, DeviceCacheError};
use crate::infrastructure::tunnel::in_memory::InMemoryTunnel;
use crate::infrastructure::tunnel::script::{ScriptTunnel, ScriptTunnelConfig};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to set up the account API client: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    DeviceCache(#[from] DeviceCacheError),
}

/// The adapters the daemon runs on.
pub struct DaemonParts {
    pub api: Arc<dyn AccountApi>,
    pub tunnel: Arc<dyn TunnelCapability>,
    pub tunnel_events: mpsc::UnboundedReceiver<TunnelEvent>,
    /// Sender side of `tunnel_events` for backends that never report events.
    /// Held so the stream stays open.
    pub tunnel_event_sink: Option<mpsc::UnboundedSender<TunnelEvent>>,
    pub store: Arc<dyn SessionStore>,
    /// What `store` held at startup.
    pub restored: RestoredState,
}

impl DaemonParts {
    /// Production adapters: HTTP API, script tunnel (or in-memory when no up
    /// command is configured), and the on-disk device cache.
    ///
    /// # Errors
    ///
    /// Fails if the cache directory is unknown, the cache cannot be read, or
    /// the HTTP client cannot be built.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let api = HttpAccountApi::new(
            config.api.base_url.clone(),
            Duration::from_secs(config.api.request_timeout_secs),
        )?;
        let cache = DeviceCache::in_dir(&config.cache_dir()?);
        let restored = cache.load_all()?;

        let (tunnel, tunnel_events, tunnel_event_sink) = match &config.tunnel.up_command {
            Some(up_command) => {
                let (sink, events) = mpsc::unbounded_channel();
                let tunnel = ScriptTunnel::new(ScriptTunnelConfig {
                    up_command: up_command.clone(),
                    down_command: config.tunnel.down_command.clone(),
                    timeout: Duration::from_secs(config.tunnel.establish_timeout_secs),
                    block_on_error: config.tunnel.block_on_error,
                });
                let tunnel: Arc<dyn TunnelCapability> = Arc::new(tunnel);
                (tunnel, events, Some(sink))
            }
            None => {
                warn!("no tunnel up_command configured, using the in-memory tunnel");
                let (tunnel, events) = InMemoryTunnel::new();
                let tunnel: Arc<dyn TunnelCapability> = Arc::new(tunnel);
                (tunnel, events, None)
            }
        };

        Ok(Self {
            api: Arc::new(api),
            tunnel,
            tunnel_events,
            tunnel_event_sink,
            store: Arc::new(cache),
            restored,
        })
    }

    /// Fully in-memory adapters for `--dry-run`.  Nothing is persisted and
    /// nothing leaves the process.
    pub fn dry_run(config: &DaemonConfig) -> Self {
        let (tunnel, tunnel_events) = InMemoryTunnel::new();
        Self {
            api: Arc::new(InMemoryAccountApi::new(config.account.max_devices)),
            tunnel: Arc::new(tunnel),
            tunnel_events,
            tunnel_event_sink: None,
            store: Arc::new(EphemeralStore),
            restored: RestoredState::default(),
        }
    }
}

/// A running daemon.
pub struct Daemon {
    handle: SessionHandle,
    manager: JoinHandle<()>,
    _tunnel_event_sink: Option<mpsc::UnboundedSender<TunnelEvent>>,
}

impl Daemon {
    /// Builds the application layer on top of `parts` and starts the
    /// session manager.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unusable tunnel endpoint.
    pub fn start(config: &DaemonConfig, parts: DaemonParts) -> Result<Self, DaemonError> {
        let manager_config = config.manager_config()?;
        let policy = config.retry.policy();
        let margin = chrono::Duration::seconds(config.account.token_refresh_margin_secs as i64);

        let tokens = Arc::new(AccessTokenCache::new(Arc::clone(&parts.api), margin));
        let directory = Arc::new(AccountDirectoryClient::new(parts.api, tokens, policy));
        if parts.restored.session.is_some() {
            info!(target = ?parts.restored.target_state, "restoring session from device cache");
        }
        let (handle, manager) = SessionManager::spawn(
            manager_config,
            ManagerDeps {
                directory,
                tunnel: parts.tunnel,
                tunnel_events: parts.tunnel_events,
                store: parts.store,
            },
            parts.restored,
        );

        Ok(Self {
            handle,
            manager,
            _tunnel_event_sink: parts.tunnel_event_sink,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stops the session manager and waits for it to finish.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        let result = match self.handle.shutdown().await {
            // Already stopped counts as stopped.
            Err(SessionError::DaemonUnavailable) => Ok(()),
            other => other,
        };
        if let Err(e) = self.manager.await {
            warn!(error = %e, "session manager task ended abnormally");
        }
        result
    }
}
