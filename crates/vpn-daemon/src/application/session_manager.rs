//! The session manager: one event loop that owns the session.
//!
//! # Why an event loop? (for beginners)
//!
//! Commands come from several places at once: clients, the tunnel reporting
//! that it dropped, API responses arriving, and timers.  If each of those
//! mutated the session under a lock, a callback fired from inside a commit
//! could try to take the same lock again and deadlock.
//!
//! Instead, everything is turned into a message on a queue, and a single task
//! ([`SessionManager::run`]) handles the messages one at a time:
//!
//! ```text
//!  SessionHandle ──Command──┐
//!  spawned work ──Internal──┼──► SessionManager::run ──commit──► SessionState ──► EventBroadcaster
//!  tunnel impl ──TunnelEvent┘
//! ```
//!
//! The manager is the only owner of [`SessionState`], so `commit` can take
//! `&mut self` and re-entrant commits cannot be written at all.  Slow work
//! (API calls, tunnel establish and teardown) runs on spawned tasks that post
//! their result back as an internal event.
//!
//! # Superseded work
//!
//! Every tunnel operation carries the *tunnel generation* it was started
//! under, and every login carries a *login generation*.  Starting a newer
//! transition bumps the generation and cancels the old operation.  A result
//! that arrives with an old generation is discarded, and a tunnel that was
//! established for a superseded connect is torn down again.
//!
//! # Persistence
//!
//! The bound session, the last account used, and the target state are
//! queued on a [`StoreWriter`] after the change is committed.  Disk I/O never
//! runs on the event loop.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vpn_core::{
    AccountAndDevice, AccountData, AccountIdentity, AccountToken, ApiError, Device, DeviceEvent,
    DeviceEventCause, DeviceId, DeviceIdentity, KeyPair, LoginState, RelayConfig,
    RemoveDeviceEvent, RetryPolicy, SessionSnapshot, TargetState, TunnelEndpoint, TunnelError,
    TunnelHandle, TunnelStatus, VoucherSubmission,
};

use super::account_directory::{AccountDirectoryClient, ApiCall};
use super::broadcaster::EventBroadcaster;
use super::cancellable::{CancelHandle, CancellableOperation, Outcome};
use super::session_handle::{
    Command, DeviceEventHub, DeviceNotification, ResponseTx, SessionError, SessionHandle,
};
use super::session_state::SessionState;
use super::session_store::{RestoredState, SessionStore, StoreWrite, StoreWriter, StoredSession};
use super::tunnel_control::{TunnelCapability, TunnelEvent};

/// Delay before reconnecting after the relay rejected the device key.
pub const AUTH_FAILURE_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Default age at which the device key is replaced.
pub const DEFAULT_KEY_ROTATION_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Wait before retrying an automatic key rotation that failed.
pub const KEY_ROTATION_RETRY_DELAY: Duration = Duration::from_secs(15 * 60);

/// Behaviour settings for the session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Relay hostname handed to the tunnel capability.
    pub relay: String,
    pub endpoint: SocketAddr,
    /// Retry policy for establishing a tunnel.
    pub connect_policy: RetryPolicy,
    /// Whether a tunnel failure that does not say otherwise blocks traffic.
    pub block_on_error: bool,
    /// Whether a recoverable tunnel drop goes straight back to `Connecting`.
    pub auto_reconnect: bool,
    /// Device cap checked before registering a new device.
    pub max_devices: usize,
    /// How often the bound device is re-validated.  `None` disables it.
    pub device_check_interval: Option<Duration>,
    pub auth_failure_reconnect_delay: Duration,
    /// Key age at which the device key is rotated.  `None` disables it.
    pub key_rotation_interval: Option<Duration>,
    /// Bring the tunnel up at startup even if it was down at shutdown.
    pub auto_connect: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            relay: "se-got-wg-001".to_string(),
            endpoint: SocketAddr::from(([185, 213, 154, 68], 51820)),
            connect_policy: RetryPolicy::default(),
            block_on_error: true,
            auto_reconnect: true,
            max_devices: 5,
            device_check_interval: Some(Duration::from_secs(24 * 60 * 60)),
            auth_failure_reconnect_delay: AUTH_FAILURE_RECONNECT_DELAY,
            key_rotation_interval: Some(DEFAULT_KEY_ROTATION_INTERVAL),
            auto_connect: false,
        }
    }
}

/// Collaborators handed to the manager at construction.
pub struct ManagerDeps {
    pub directory: Arc<AccountDirectoryClient>,
    pub tunnel: Arc<dyn TunnelCapability>,
    pub tunnel_events: mpsc::UnboundedReceiver<TunnelEvent>,
    pub store: Arc<dyn SessionStore>,
}

// ── Internal events ───────────────────────────────────────────────────────────

struct LoginResult {
    account: AccountIdentity,
    device: Device,
    keys: KeyPair,
    /// Whether the device was registered by this login rather than reused.
    created: bool,
}

enum LoginResponder {
    Login(ResponseTx<()>),
    CreateAccount(ResponseTx<AccountToken>),
}

impl LoginResponder {
    fn succeed(self, account: &AccountToken) {
        match self {
            LoginResponder::Login(tx) => {
                let _ = tx.send(Ok(()));
            }
            LoginResponder::CreateAccount(tx) => {
                let _ = tx.send(Ok(account.clone()));
            }
        }
    }

    fn fail(self, error: SessionError) {
        match self {
            LoginResponder::Login(tx) => {
                let _ = tx.send(Err(error));
            }
            LoginResponder::CreateAccount(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

enum Internal {
    ConnectAttempt {
        generation: u64,
        attempt: u32,
    },
    Established {
        generation: u64,
        outcome: Outcome<TunnelHandle, TunnelError>,
    },
    TornDown {
        generation: u64,
        result: Result<(), TunnelError>,
    },
    LoginFinished {
        generation: u64,
        responder: LoginResponder,
        result: Result<LoginResult, SessionError>,
    },
    DeviceChecked {
        account: AccountToken,
        device_id: DeviceId,
        result: Result<Option<Device>, ApiError>,
        tx: Option<ResponseTx<()>>,
    },
    DeviceRemoved {
        account: AccountToken,
        result: Result<RemoveDeviceEvent, ApiError>,
        tx: ResponseTx<()>,
    },
    KeyRotated {
        account: AccountToken,
        device_id: DeviceId,
        keys: KeyPair,
        result: Result<Device, ApiError>,
        /// `None` for automatic rotations.
        tx: Option<ResponseTx<()>>,
    },
    VoucherRedeemed {
        account: AccountToken,
        result: Result<VoucherSubmission, ApiError>,
        tx: ResponseTx<VoucherSubmission>,
    },
    AccountDataFetched {
        account: AccountToken,
        result: Result<AccountData, ApiError>,
        tx: ResponseTx<AccountData>,
    },
    CheckDevice,
    ScheduledReconnect,
    RotationDue {
        generation: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterTeardown {
    Nothing,
    Reconnect,
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct SessionManager {
    state: SessionState,
    directory: Arc<AccountDirectoryClient>,
    tunnel: Arc<dyn TunnelCapability>,
    store: StoreWriter,
    config: ManagerConfig,
    /// Key pair of this installation.  Kept across logouts so a later login
    /// to the same account can reuse its device.
    keys: Option<KeyPair>,
    device_events: DeviceEventHub,
    /// Whether the user wants the tunnel up.
    target: TargetState,
    account_history: Option<AccountToken>,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    tunnel_events: mpsc::UnboundedReceiver<TunnelEvent>,

    tunnel_generation: u64,
    connect_op: Option<CancelHandle>,
    active_tunnel: Option<TunnelHandle>,
    after_teardown: AfterTeardown,
    login_generation: u64,
    login_cancel: Option<CancellationToken>,
    reconnect_job: Option<JoinHandle<()>>,
    key_rotation_interval: Option<Duration>,
    rotation_generation: u64,
    rotation_job: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Builds the manager, starts its event loop, and returns the handle
    /// clients use to talk to it.
    ///
    /// `restored` is what the store held at startup.
    pub fn spawn(
        config: ManagerConfig,
        deps: ManagerDeps,
        restored: RestoredState,
    ) -> (SessionHandle, JoinHandle<()>) {
        let broadcaster = EventBroadcaster::new();
        let (initial, keys) = match restored.session {
            Some(stored) => (
                SessionSnapshot::initial().with_login(stored.account, stored.device),
                Some(stored.keys),
            ),
            None => (SessionSnapshot::initial(), None),
        };
        let state = SessionState::new(initial, broadcaster.clone());
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let device_events = DeviceEventHub::default();

        let handle = SessionHandle {
            commands: command_tx,
            reader: state.reader(),
            broadcaster,
            device_events: device_events.clone(),
        };

        let store: Arc<dyn SessionStore> = deps.store;
        let manager = Self {
            state,
            directory: deps.directory,
            tunnel: deps.tunnel,
            store: StoreWriter::spawn(store),
            key_rotation_interval: config.key_rotation_interval,
            config,
            keys,
            device_events,
            target: restored.target_state,
            account_history: restored.account_history,
            commands,
            internal_tx,
            internal_rx,
            tunnel_events: deps.tunnel_events,
            tunnel_generation: 0,
            connect_op: None,
            active_tunnel: None,
            after_teardown: AfterTeardown::Nothing,
            login_generation: 0,
            login_cancel: None,
            reconnect_job: None,
            rotation_generation: 0,
            rotation_job: None,
            shutdown: CancellationToken::new(),
        };
        let join = tokio::spawn(manager.run());
        (handle, join)
    }

    async fn run(mut self) {
        info!(
            logged_in = self.state.read().is_logged_in(),
            target = ?self.target,
            "session manager started"
        );
        self.start_device_checker();
        self.schedule_key_rotation();
        self.resume_target_state();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(tx)) => {
                        self.shutdown_now().await;
                        let _ = tx.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all session handles dropped");
                        self.shutdown_now().await;
                        break;
                    }
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
                Some(event) = self.tunnel_events.recv() => self.on_tunnel_event(event),
            }
        }
        info!("session manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::GetState(tx) => {
                let _ = tx.send(Ok(self.state.read()));
            }
            Command::Connect(tx) => {
                let _ = tx.send(self.on_connect());
            }
            Command::Disconnect(tx) => {
                let _ = tx.send(Ok(self.on_disconnect()));
            }
            Command::Reconnect(tx) => {
                let _ = tx.send(self.on_reconnect());
            }
            Command::Login(tx, account) => self.begin_login(Some(account), LoginResponder::Login(tx)),
            Command::CreateAccount(tx) => {
                if self.state.read().is_logged_in() {
                    let _ = tx.send(Err(SessionError::AlreadyLoggedIn));
                } else {
                    self.begin_login(None, LoginResponder::CreateAccount(tx));
                }
            }
            Command::Logout(tx) => {
                self.on_logout();
                let _ = tx.send(Ok(()));
            }
            Command::GetDevice(tx) => {
                let _ = tx.send(Ok(self.state.read().account_and_device()));
            }
            Command::UpdateDevice(tx) => self.check_device(Some(tx)),
            Command::ListDevices(tx, account) => {
                let call = self.directory.list_devices(&account);
                tokio::spawn(async move {
                    let _ = tx.send(call.await.map_err(SessionError::from));
                });
            }
            Command::RemoveDevice(tx, device_id) => self.on_remove_device(device_id, tx),
            Command::GetAccountData(tx, account) => {
                let call = self.directory.get_account_data(&account);
                self.post_when_done(call, move |result| Internal::AccountDataFetched {
                    account,
                    result,
                    tx,
                });
            }
            Command::SubmitVoucher(tx, code) => match self.bound() {
                Ok(current) => {
                    let account = current.account_token;
                    let call = self.directory.submit_voucher(&account, &code);
                    self.post_when_done(call, move |result| Internal::VoucherRedeemed {
                        account,
                        result,
                        tx,
                    });
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            },
            Command::RotateKey(tx) => self.on_rotate_key(Some(tx)),
            Command::SetKeyRotationInterval(tx, interval) => {
                info!(?interval, "key rotation interval changed");
                self.key_rotation_interval = interval;
                self.schedule_key_rotation();
                let _ = tx.send(Ok(()));
            }
            Command::GetAccountHistory(tx) => {
                let _ = tx.send(Ok(self.account_history.clone()));
            }
            Command::ClearAccountHistory(tx) => {
                self.set_account_history(None);
                let _ = tx.send(Ok(()));
            }
            // Handled by the event loop before dispatch.
            Command::Shutdown(tx) => {
                let _ = tx.send(Ok(()));
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::ConnectAttempt { generation, attempt } => {
                self.on_connect_attempt(generation, attempt)
            }
            Internal::Established {
                generation,
                outcome,
            } => self.on_established(generation, outcome),
            Internal::TornDown { generation, result } => self.on_torn_down(generation, result),
            Internal::LoginFinished {
                generation,
                responder,
                result,
            } => self.on_login_finished(generation, responder, result),
            Internal::DeviceChecked {
                account,
                device_id,
                result,
                tx,
            } => self.on_device_checked(account, device_id, result, tx),
            Internal::DeviceRemoved {
                account,
                result,
                tx,
            } => self.on_device_removed(account, result, tx),
            Internal::KeyRotated {
                account,
                device_id,
                keys,
                result,
                tx,
            } => self.on_key_rotated(account, device_id, keys, result, tx),
            Internal::VoucherRedeemed {
                account,
                result,
                tx,
            } => {
                if let Ok(submission) = &result {
                    info!(seconds = submission.time_added, "voucher redeemed");
                    self.update_expiry(&account, submission.new_expiry);
                }
                let _ = tx.send(result.map_err(SessionError::from));
            }
            Internal::AccountDataFetched {
                account,
                result,
                tx,
            } => {
                if let Ok(data) = &result {
                    self.update_expiry(&account, data.expiry);
                }
                let _ = tx.send(result.map_err(SessionError::from));
            }
            Internal::CheckDevice => self.check_device(None),
            Internal::ScheduledReconnect => {
                self.reconnect_job = None;
                if self.state.read().status.is_in_error_state() {
                    info!("reconnecting after auth failure delay");
                    if let Err(e) = self.start_connect() {
                        debug!(error = %e, "scheduled reconnect skipped");
                    }
                }
            }
            Internal::RotationDue { generation } => {
                if generation == self.rotation_generation {
                    self.rotation_job = None;
                    info!("device key reached its rotation age");
                    self.on_rotate_key(None);
                }
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn bound(&self) -> Result<AccountAndDevice, SessionError> {
        let snapshot = self.state.read();
        match snapshot.account_and_device() {
            Some(current) => Ok(current),
            None if snapshot.login == LoginState::Revoked => Err(SessionError::DeviceRevoked),
            None => Err(SessionError::NotLoggedIn),
        }
    }

    fn is_bound(&self, account: &AccountToken, device_id: Option<&DeviceId>) -> bool {
        match self.state.read().account_and_device() {
            Some(current) => {
                current.account_token == *account
                    && device_id.map_or(true, |id| current.device.id == *id)
            }
            None => false,
        }
    }

    /// Awaits `call` on a new task and posts its result back as an event.
    fn post_when_done<T, F>(&self, call: ApiCall<T>, event: F)
    where
        T: Send + 'static,
        F: FnOnce(Result<T, ApiError>) -> Internal + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = call.await;
            let _ = tx.send(event(result));
        });
    }

    fn notify(&self, notification: DeviceNotification) {
        self.device_events.send(notification);
    }

    fn persist(&self) {
        let snapshot = self.state.read();
        let (Some(account), Some(device), Some(keys)) =
            (&snapshot.account, &snapshot.device, &self.keys)
        else {
            return;
        };
        self.store.submit(StoreWrite::Session(Some(StoredSession {
            account: account.clone(),
            device: device.clone(),
            keys: keys.clone(),
        })));
    }

    fn clear_persisted(&self) {
        self.store.submit(StoreWrite::Session(None));
    }

    fn set_target(&mut self, target: TargetState) {
        if self.target != target {
            debug!(from = ?self.target, to = ?target, "target state changed");
            self.target = target;
            self.store.submit(StoreWrite::TargetState(target));
        }
    }

    fn set_account_history(&mut self, account: Option<AccountToken>) {
        if self.account_history != account {
            self.account_history = account.clone();
            self.store.submit(StoreWrite::AccountHistory(account));
        }
    }

    /// Brings the tunnel back up at startup if it was wanted up.
    fn resume_target_state(&mut self) {
        if self.config.auto_connect {
            self.set_target(TargetState::Secured);
        }
        if self.target != TargetState::Secured {
            return;
        }
        match self.start_connect() {
            Ok(()) => info!("restoring secured tunnel"),
            Err(e) => {
                info!(error = %e, "cannot restore secured tunnel");
                self.set_target(TargetState::Unsecured);
            }
        }
    }

    fn update_expiry(&mut self, account: &AccountToken, expiry: chrono::DateTime<Utc>) {
        if !self.is_bound(account, None) {
            return;
        }
        self.state.commit(|s| match &s.account {
            Some(identity) => s.with_account(identity.clone().with_expiry(expiry)),
            None => s.clone(),
        });
        self.persist();
    }

    fn start_device_checker(&self) {
        let Some(interval) = self.config.device_check_interval else {
            return;
        };
        let tx = self.internal_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(Internal::CheckDevice).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Arms the timer that rotates the device key once it reaches the
    /// rotation age.  Replaces any timer already armed.
    fn schedule_key_rotation(&mut self) {
        let Some(interval) = self.key_rotation_interval else {
            self.cancel_key_rotation();
            return;
        };
        let logged_in = self.state.read().is_logged_in();
        let Some(created) = self.keys.as_ref().filter(|_| logged_in).map(|keys| keys.created) else {
            self.cancel_key_rotation();
            return;
        };
        let age = (Utc::now() - created).to_std().unwrap_or_default();
        self.arm_key_rotation(interval.saturating_sub(age));
    }

    fn arm_key_rotation(&mut self, delay: Duration) {
        self.cancel_key_rotation();
        let generation = self.rotation_generation;
        debug!(?delay, "key rotation scheduled");
        let tx = self.internal_tx.clone();
        self.rotation_job = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RotationDue { generation });
        }));
    }

    fn cancel_key_rotation(&mut self) {
        self.rotation_generation += 1;
        if let Some(job) = self.rotation_job.take() {
            job.abort();
        }
    }

    // ── Tunnel lifecycle ─────────────────────────────────────────────────────

    fn on_connect(&mut self) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.bound()?;
        self.set_target(TargetState::Secured);
        let snapshot = self.state.read();
        match snapshot.status {
            TunnelStatus::Connecting { .. } | TunnelStatus::Connected { .. } => {
                debug!(status = snapshot.status.label(), "connect ignored, tunnel already up");
                Ok(snapshot)
            }
            TunnelStatus::Disconnecting => {
                debug!("connect queued behind teardown");
                self.after_teardown = AfterTeardown::Reconnect;
                Ok(snapshot)
            }
            TunnelStatus::Disconnected | TunnelStatus::Error { .. } => {
                self.start_connect()?;
                Ok(self.state.read())
            }
        }
    }

    fn on_disconnect(&mut self) -> Arc<SessionSnapshot> {
        self.set_target(TargetState::Unsecured);
        let snapshot = self.state.read();
        if snapshot.status.is_disconnected() && self.active_tunnel.is_none() {
            return snapshot;
        }
        info!(status = snapshot.status.label(), "disconnect requested");
        let status = self.shut_tunnel(&snapshot.status);
        self.state.commit(|s| s.with_status(status))
    }

    fn on_reconnect(&mut self) -> Result<bool, SessionError> {
        let snapshot = self.state.read();
        match snapshot.status {
            TunnelStatus::Connected { .. } => {
                self.bound()?;
                info!("reconnecting");
                let status = self.shut_tunnel(&snapshot.status);
                self.after_teardown = AfterTeardown::Reconnect;
                self.state.commit(|s| s.with_status(status));
                Ok(true)
            }
            TunnelStatus::Connecting { .. } | TunnelStatus::Error { .. } => {
                self.start_connect()?;
                Ok(true)
            }
            TunnelStatus::Disconnected | TunnelStatus::Disconnecting => Ok(false),
        }
    }

    /// Cancels whatever the tunnel is doing and returns the status to commit:
    /// `Disconnecting` while a teardown runs, otherwise `Disconnected`.
    fn shut_tunnel(&mut self, current: &TunnelStatus) -> TunnelStatus {
        self.cancel_reconnect_job();
        self.after_teardown = AfterTeardown::Nothing;
        if let Some(op) = self.connect_op.take() {
            op.cancel();
        }
        if let Some(handle) = self.active_tunnel.take() {
            self.tunnel_generation += 1;
            self.spawn_teardown(handle, Some(self.tunnel_generation));
            return TunnelStatus::Disconnecting;
        }
        if matches!(current, TunnelStatus::Disconnecting) {
            // A teardown is already in flight and will finish the job.
            return TunnelStatus::Disconnecting;
        }
        self.tunnel_generation += 1;
        TunnelStatus::Disconnected
    }

    fn start_connect(&mut self) -> Result<(), SessionError> {
        let current = self.bound()?;
        self.cancel_reconnect_job();
        if let Some(op) = self.connect_op.take() {
            op.cancel();
        }
        if let Some(stale) = self.active_tunnel.take() {
            self.spawn_teardown(stale, None);
        }
        self.tunnel_generation += 1;
        let generation = self.tunnel_generation;

        let relay = RelayConfig {
            relay: self.config.relay.clone(),
            endpoint: self.config.endpoint,
            device_pubkey: current.device.pubkey.clone(),
        };
        info!(relay = %relay.relay, endpoint = %relay.endpoint, "connecting");
        self.state.commit(|s| s.with_status(TunnelStatus::connecting_now()));

        let tunnel = Arc::clone(&self.tunnel);
        let abandoned = Arc::clone(&self.tunnel);
        let progress = self.internal_tx.clone();
        let done = self.internal_tx.clone();
        self.connect_op = Some(CancellableOperation::start_with_cleanup(
            self.config.connect_policy,
            move |attempt| {
                if attempt > 1 {
                    let _ = progress.send(Internal::ConnectAttempt {
                        generation,
                        attempt,
                    });
                }
                let tunnel = Arc::clone(&tunnel);
                let relay = relay.clone();
                async move { tunnel.establish(&relay).await }
            },
            move |outcome| {
                let _ = done.send(Internal::Established {
                    generation,
                    outcome,
                });
            },
            // A tunnel that came up after its connect was cancelled has no
            // owner.  Torn down here so it works after shutdown too.
            move |handle| {
                warn!(%handle, "tunnel came up after its connect was cancelled, tearing it down");
                tokio::spawn(async move {
                    if let Err(e) = abandoned.teardown(handle).await {
                        warn!(%handle, error = %e, "failed to tear down abandoned tunnel");
                    }
                });
            },
        ));
        Ok(())
    }

    /// Tears `handle` down on a new task.  With a generation, completion is
    /// reported back as `TornDown`; without one the teardown is silent.
    fn spawn_teardown(&self, handle: TunnelHandle, generation: Option<u64>) {
        let tunnel = Arc::clone(&self.tunnel);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tunnel.teardown(handle).await;
            match generation {
                Some(generation) => {
                    let _ = tx.send(Internal::TornDown { generation, result });
                }
                None => {
                    if let Err(e) = result {
                        warn!(%handle, error = %e, "failed to tear down abandoned tunnel");
                    }
                }
            }
        });
    }

    fn on_connect_attempt(&mut self, generation: u64, attempt: u32) {
        if generation != self.tunnel_generation {
            return;
        }
        debug!(attempt, "retrying tunnel establish");
        self.state.commit(|s| match s.status {
            TunnelStatus::Connecting { since, .. } => {
                s.with_status(TunnelStatus::Connecting { since, attempt })
            }
            _ => s.clone(),
        });
    }

    fn on_established(&mut self, generation: u64, outcome: Outcome<TunnelHandle, TunnelError>) {
        if generation != self.tunnel_generation {
            if let Outcome::Completed(handle) = outcome {
                warn!(%handle, "tunnel came up for a superseded connect, tearing it down");
                self.spawn_teardown(handle, None);
            }
            return;
        }
        self.connect_op = None;
        match outcome {
            Outcome::Completed(handle) => {
                let endpoint = TunnelEndpoint {
                    relay: self.config.relay.clone(),
                    address: self.config.endpoint,
                };
                info!(%handle, %endpoint, "tunnel connected");
                self.active_tunnel = Some(handle);
                self.state.commit(|s| {
                    s.with_status(TunnelStatus::Connected {
                        since: Utc::now(),
                        endpoint: endpoint.clone(),
                    })
                });
            }
            Outcome::Failed(error) => self.enter_error_state(error),
            Outcome::Cancelled => {}
        }
    }

    fn enter_error_state(&mut self, error: TunnelError) {
        let is_blocking = error.blocking_hint().unwrap_or(self.config.block_on_error);
        let auth_failed = error.is_auth_failure();
        if is_blocking {
            info!(%error, "entering blocking error state");
        } else {
            error!(%error, "entering non-blocking error state, traffic is not blocked");
        }
        self.state.commit(|s| {
            s.with_status(TunnelStatus::Error {
                reason: error.to_string(),
                is_blocking,
                auth_failed,
            })
        });
        if auth_failed {
            // The relay may have rejected a key the API no longer knows.
            self.check_device(None);
            self.schedule_reconnect(self.config.auth_failure_reconnect_delay);
        }
    }

    fn on_torn_down(&mut self, generation: u64, result: Result<(), TunnelError>) {
        if generation != self.tunnel_generation {
            return;
        }
        if let Err(e) = result {
            warn!(error = %e, "tunnel teardown reported an error");
        }
        info!("tunnel disconnected");
        self.state.commit(|s| s.with_status(TunnelStatus::Disconnected));
        if mem::replace(&mut self.after_teardown, AfterTeardown::Nothing) == AfterTeardown::Reconnect {
            if let Err(e) = self.start_connect() {
                debug!(error = %e, "queued connect dropped");
            }
        }
    }

    fn on_tunnel_event(&mut self, event: TunnelEvent) {
        if self.active_tunnel != Some(event.handle()) {
            debug!(?event, "ignoring event for inactive tunnel");
            return;
        }
        self.active_tunnel = None;
        match event {
            TunnelEvent::Dropped {
                reason,
                recoverable,
                ..
            } => {
                warn!(%reason, recoverable, "tunnel dropped");
                if recoverable && self.config.auto_reconnect {
                    if let Err(e) = self.start_connect() {
                        debug!(error = %e, "auto-reconnect not possible");
                        self.tunnel_generation += 1;
                        self.state.commit(|s| s.with_status(TunnelStatus::Disconnected));
                    }
                } else {
                    self.tunnel_generation += 1;
                    self.enter_error_state(TunnelError::Failure {
                        reason,
                        is_blocking: self.config.block_on_error,
                    });
                }
            }
            TunnelEvent::TornDown { handle } => {
                info!(%handle, "tunnel torn down externally");
                self.tunnel_generation += 1;
                self.state.commit(|s| s.with_status(TunnelStatus::Disconnected));
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_reconnect_job();
        info!(?delay, "scheduling reconnect");
        let tx = self.internal_tx.clone();
        self.reconnect_job = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::ScheduledReconnect);
        }));
    }

    fn cancel_reconnect_job(&mut self) {
        if let Some(job) = self.reconnect_job.take() {
            job.abort();
        }
    }

    // ── Login and logout ─────────────────────────────────────────────────────

    fn cancel_login(&mut self) {
        self.login_generation += 1;
        if let Some(cancel) = self.login_cancel.take() {
            cancel.cancel();
        }
    }

    /// Starts a login.  With `account == None` a new account is created first.
    fn begin_login(&mut self, account: Option<AccountToken>, responder: LoginResponder) {
        self.cancel_login();
        let generation = self.login_generation;
        let cancel = CancellationToken::new();
        self.login_cancel = Some(cancel.clone());

        let keys = self.keys.clone().unwrap_or_else(KeyPair::generate);
        let directory = Arc::clone(&self.directory);
        let max_devices = self.config.max_devices;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let account = match account {
                    Some(account) => account,
                    None => {
                        let account = until_cancelled(directory.create_account(), &cancel)
                            .await
                            .map_err(login_error)?;
                        info!(account = %account, "created account");
                        account
                    }
                };
                perform_login(&directory, account, keys, max_devices, &cancel).await
            }
            .await;
            let _ = tx.send(Internal::LoginFinished {
                generation,
                responder,
                result,
            });
        });
    }

    fn on_login_finished(
        &mut self,
        generation: u64,
        responder: LoginResponder,
        result: Result<LoginResult, SessionError>,
    ) {
        if generation != self.login_generation {
            if let Ok(login) = &result {
                if login.created {
                    self.spawn_remote_delete(
                        login.account.token.clone(),
                        login.device.id.clone(),
                        "login was superseded",
                    );
                }
            }
            responder.fail(SessionError::Cancelled);
            return;
        }
        self.login_cancel = None;

        let login = match result {
            Ok(login) => login,
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(error = %e, "login failed");
                }
                responder.fail(e);
                return;
            }
        };

        let before = self.state.read();
        if let Some(previous) = before.account_and_device() {
            if previous.device.id != login.device.id {
                self.spawn_remote_delete(
                    previous.account_token,
                    previous.device.id,
                    "replaced by a new login",
                );
            }
        }

        let token = login.account.token.clone();
        let identity = DeviceIdentity::from(login.device.clone());
        self.keys = Some(login.keys);
        self.state
            .commit(|s| s.with_login(login.account.clone(), identity.clone()));
        self.persist();
        self.set_account_history(Some(token.clone()));
        self.schedule_key_rotation();
        info!(
            account = %token,
            device = %login.device.pretty_name(),
            reused = !login.created,
            "logged in"
        );
        self.notify(DeviceNotification::Device(DeviceEvent::logged_in(
            AccountAndDevice::new(token.clone(), login.device),
        )));

        // A tunnel brought up with the previous device's key must be rebuilt.
        if before.is_logged_in() && before.status.is_secured_target() {
            if let Err(e) = self.on_reconnect() {
                debug!(error = %e, "reconnect after login failed");
            }
        }
        responder.succeed(&token);
    }

    fn on_logout(&mut self) {
        self.cancel_login();
        let snapshot = self.state.read();
        let Some(current) = snapshot.account_and_device() else {
            if snapshot.login == LoginState::Revoked {
                // Acknowledges the revocation.  Device and cache are already gone.
                info!("logged out of revoked device");
                self.set_target(TargetState::Unsecured);
                let status = self.shut_tunnel(&snapshot.status);
                self.state.commit(|s| s.logged_out(status));
                self.notify(DeviceNotification::Device(DeviceEvent::logged_out()));
            } else {
                debug!("logout with no bound device");
            }
            return;
        };
        self.set_target(TargetState::Unsecured);
        self.cancel_key_rotation();
        let status = self.shut_tunnel(&snapshot.status);
        self.state.commit(|s| s.logged_out(status));
        self.clear_persisted();
        info!(account = %current.account_token, "logged out");
        self.notify(DeviceNotification::Device(DeviceEvent::logged_out()));
        self.spawn_remote_delete(current.account_token, current.device.id, "logout");
    }

    /// Removes a device remotely without waiting for the result.
    fn spawn_remote_delete(&self, account: AccountToken, device_id: DeviceId, reason: &'static str) {
        let directory = Arc::clone(&self.directory);
        tokio::spawn(async move {
            match directory.delete_device(&account, &device_id).await {
                Ok(true) => debug!(device = %device_id, reason, "removed device remotely"),
                Ok(false) => debug!(device = %device_id, reason, "device was already gone"),
                Err(e) => warn!(device = %device_id, reason, error = %e, "failed to remove device remotely"),
            }
            directory.forget_account(&account);
        });
    }

    // ── Device maintenance ───────────────────────────────────────────────────

    fn check_device(&self, tx: Option<ResponseTx<()>>) {
        let Ok(current) = self.bound() else {
            if let Some(tx) = tx {
                let _ = tx.send(Ok(()));
            }
            return;
        };
        let account = current.account_token;
        let device_id = current.device.id;
        let call = self.directory.get_device(&account, &device_id);
        self.post_when_done(call, move |result| Internal::DeviceChecked {
            account,
            device_id,
            result,
            tx,
        });
    }

    fn on_device_checked(
        &mut self,
        account: AccountToken,
        device_id: DeviceId,
        result: Result<Option<Device>, ApiError>,
        tx: Option<ResponseTx<()>>,
    ) {
        let reply = if !self.is_bound(&account, Some(&device_id)) {
            debug!(device = %device_id, "ignoring check result for a device that is no longer bound");
            Ok(())
        } else {
            match result {
                Ok(Some(device)) => {
                    self.apply_remote_device(device);
                    Ok(())
                }
                Ok(None) | Err(ApiError::InvalidAccount) => {
                    self.revoke(true);
                    Ok(())
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(error = %e, "failed to validate device");
                    }
                    Err(SessionError::from(e))
                }
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(reply);
        }
    }

    fn apply_remote_device(&mut self, device: Device) {
        let updated = DeviceIdentity::from(device.clone());
        if self.state.read().device.as_ref() == Some(&updated) {
            return;
        }
        let committed = self.state.commit(|s| s.with_device(updated.clone()));
        self.persist();
        if let Some(account) = &committed.account {
            info!(device = %device.pretty_name(), "device updated remotely");
            self.notify(DeviceNotification::Device(DeviceEvent {
                cause: DeviceEventCause::Updated,
                device: Some(AccountAndDevice::new(account.token.clone(), device)),
                remote: true,
            }));
        }
    }

    /// Clears the session after the bound device disappeared.
    fn revoke(&mut self, remote: bool) {
        let snapshot = self.state.read();
        warn!(remote, "device has been revoked, logging out");
        self.set_target(TargetState::Unsecured);
        self.cancel_key_rotation();
        let status = self.shut_tunnel(&snapshot.status);
        self.state.commit(|s| s.revoked(status));
        self.clear_persisted();
        self.notify(DeviceNotification::Device(DeviceEvent::revoked(remote)));
    }

    fn on_remove_device(&mut self, device_id: DeviceId, tx: ResponseTx<()>) {
        let current = match self.bound() {
            Ok(current) => current,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let account = current.account_token;
        let directory = Arc::clone(&self.directory);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let devices = directory.list_devices(&account).await?;
                let removed_device = devices
                    .iter()
                    .find(|device| device.id == device_id)
                    .cloned()
                    .ok_or(ApiError::NotFound)?;
                directory.delete_device(&account, &device_id).await?;
                let new_devices = devices
                    .into_iter()
                    .filter(|device| device.id != device_id)
                    .collect();
                Ok(RemoveDeviceEvent {
                    account_token: account.clone(),
                    removed_device,
                    new_devices,
                })
            }
            .await;
            let _ = internal.send(Internal::DeviceRemoved {
                account,
                result,
                tx,
            });
        });
    }

    fn on_device_removed(
        &mut self,
        account: AccountToken,
        result: Result<RemoveDeviceEvent, ApiError>,
        tx: ResponseTx<()>,
    ) {
        match result {
            Ok(event) => {
                info!(device = %event.removed_device.pretty_name(), "removed device");
                let removed_id = event.removed_device.id.clone();
                self.notify(DeviceNotification::Removed(event));
                if self.is_bound(&account, Some(&removed_id)) {
                    self.revoke(false);
                }
                let _ = tx.send(Ok(()));
            }
            Err(e) => {
                let _ = tx.send(Err(SessionError::from(e)));
            }
        }
    }

    fn on_rotate_key(&mut self, tx: Option<ResponseTx<()>>) {
        let current = match self.bound() {
            Ok(current) => current,
            Err(e) => {
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    None => debug!(error = %e, "automatic key rotation skipped"),
                }
                return;
            }
        };
        let keys = KeyPair::generate();
        let account = current.account_token;
        let device_id = current.device.id;
        let call = self
            .directory
            .rotate_device_key(&account, &device_id, &keys.public);
        self.post_when_done(call, move |result| Internal::KeyRotated {
            account,
            device_id,
            keys,
            result,
            tx,
        });
    }

    fn on_key_rotated(
        &mut self,
        account: AccountToken,
        device_id: DeviceId,
        keys: KeyPair,
        result: Result<Device, ApiError>,
        tx: Option<ResponseTx<()>>,
    ) {
        let reply = |tx: Option<ResponseTx<()>>, result: Result<(), SessionError>| {
            if let Some(tx) = tx {
                let _ = tx.send(result);
            }
        };
        if !self.is_bound(&account, Some(&device_id)) {
            reply(tx, Err(SessionError::Cancelled));
            return;
        }
        let device = match result {
            Ok(device) => device,
            Err(e) => {
                if tx.is_none() && !e.is_cancelled() {
                    warn!(error = %e, retry_in = ?KEY_ROTATION_RETRY_DELAY, "automatic key rotation failed");
                    self.arm_key_rotation(KEY_ROTATION_RETRY_DELAY);
                }
                reply(tx, Err(SessionError::from(e)));
                return;
            }
        };
        self.keys = Some(keys);
        let identity = DeviceIdentity::from(device.clone());
        let committed = self.state.commit(|s| s.with_device(identity.clone()));
        self.persist();
        self.schedule_key_rotation();
        info!(automatic = tx.is_none(), "rotated device key");
        self.notify(DeviceNotification::Device(DeviceEvent {
            cause: DeviceEventCause::RotatedKey,
            device: Some(AccountAndDevice::new(account, device)),
            remote: false,
        }));
        if committed.status.is_secured_target() {
            if let Err(e) = self.on_reconnect() {
                debug!(error = %e, "reconnect after key rotation failed");
            }
        }
        reply(tx, Ok(()));
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    async fn shutdown_now(&mut self) {
        info!("session manager shutting down");
        self.shutdown.cancel();
        self.cancel_reconnect_job();
        self.cancel_key_rotation();
        self.cancel_login();
        if let Some(op) = self.connect_op.take() {
            op.cancel();
        }
        // Subscribers go first so nobody observes the tunnel being released.
        self.state.broadcaster().close();
        self.device_events.close();
        if let Some(handle) = self.active_tunnel.take() {
            if let Err(e) = self.tunnel.teardown(handle).await {
                warn!(%handle, error = %e, "failed to tear down tunnel on shutdown");
            }
        }
        self.store.close().await;
    }
}

// ── Login protocol ────────────────────────────────────────────────────────────

fn login_error(error: ApiError) -> SessionError {
    match error {
        ApiError::Cancelled => SessionError::Cancelled,
        ApiError::TooManyDevices => SessionError::TooManyDevices,
        other => SessionError::LoginFailed(other),
    }
}

async fn until_cancelled<T>(mut call: ApiCall<T>, cancel: &CancellationToken) -> Result<T, ApiError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            call.cancel();
            Err(ApiError::Cancelled)
        }
        result = &mut call => result,
    }
}

/// Resolves the device to bind for `account`: the one already registered
/// with `keys`, or a newly created one if the account is below its cap.
///
/// Device creation is never cancelled half-way, so a superseded login can
/// always clean up the device it created.
async fn perform_login(
    directory: &AccountDirectoryClient,
    account: AccountToken,
    keys: KeyPair,
    max_devices: usize,
    cancel: &CancellationToken,
) -> Result<LoginResult, SessionError> {
    let devices = until_cancelled(directory.list_devices(&account), cancel)
        .await
        .map_err(login_error)?;

    let (device, created) = match devices.iter().find(|device| device.pubkey == keys.public) {
        Some(existing) => {
            debug!(device = %existing.pretty_name(), "reusing device registered with this key");
            (existing.clone(), false)
        }
        None if devices.len() >= max_devices => {
            info!(count = devices.len(), "account is at its device limit");
            return Err(SessionError::TooManyDevices);
        }
        None => {
            let device = directory
                .create_device(&account, &keys.public)
                .await
                .map_err(login_error)?;
            (device, true)
        }
    };

    let mut identity = AccountIdentity::new(account.clone());
    match until_cancelled(directory.get_account_data(&account), cancel).await {
        Ok(data) => identity = identity.with_expiry(data.expiry),
        Err(e) => debug!(error = %e, "account expiry unavailable during login"),
    }

    Ok(LoginResult {
        account: identity,
        device,
        keys,
        created,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::account_api::{AccessToken, AccountApi, MockAccountApi};
    use crate::application::session_store::EphemeralStore;
    use crate::application::token_cache::AccessTokenCache;
    use crate::application::tunnel_control::MockTunnelCapability;
    use chrono::Duration as ChronoDuration;
    use vpn_core::PublicKey;

    fn device(id: &str, pubkey: &str) -> Device {
        Device {
            id: id.to_string(),
            name: "agile lynx".to_string(),
            pubkey: PublicKey::new(pubkey),
            created: Utc::now(),
        }
    }

    fn api_with_tokens() -> MockAccountApi {
        let mut api = MockAccountApi::new();
        api.expect_fetch_access_token()
            .returning(|_| Ok(AccessToken::new("access", Utc::now() + ChronoDuration::hours(1))));
        api.expect_get_account_data()
            .returning(|_| Ok(AccountData { expiry: Utc::now() }));
        api
    }

    fn start(
        api: MockAccountApi,
        tunnel: MockTunnelCapability,
        restored: Option<StoredSession>,
    ) -> (SessionHandle, mpsc::UnboundedSender<TunnelEvent>) {
        let api: Arc<dyn AccountApi> = Arc::new(api);
        let tokens = Arc::new(AccessTokenCache::new(Arc::clone(&api), ChronoDuration::minutes(1)));
        let directory = Arc::new(AccountDirectoryClient::new(api, tokens, RetryPolicy::never()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = ManagerConfig {
            connect_policy: RetryPolicy::never(),
            device_check_interval: None,
            ..ManagerConfig::default()
        };
        let deps = ManagerDeps {
            directory,
            tunnel: Arc::new(tunnel),
            tunnel_events: events_rx,
            store: Arc::new(EphemeralStore),
        };
        let restored = restored.map(RestoredState::with_session).unwrap_or_default();
        let (handle, _join) = SessionManager::spawn(config, deps, restored);
        (handle, events_tx)
    }

    fn restored() -> StoredSession {
        let keys = KeyPair::generate();
        StoredSession {
            account: AccountIdentity::new(AccountToken::new("5555666677778888")),
            device: DeviceIdentity::from(device("D1", keys.public.as_str())),
            keys,
        }
    }

    async fn wait_for(handle: &SessionHandle, pred: impl Fn(&SessionSnapshot) -> bool) -> Arc<SessionSnapshot> {
        let mut sub = handle.subscribe();
        loop {
            let snapshot = sub.recv().await.expect("subscription closed");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_without_login_is_rejected() {
        let (handle, _events) = start(MockAccountApi::new(), MockTunnelCapability::new(), None);

        assert_eq!(handle.connect().await.unwrap_err(), SessionError::NotLoggedIn);
    }

    #[tokio::test]
    async fn test_login_at_device_cap_fails_without_mutation() {
        // Arrange
        let mut api = api_with_tokens();
        api.expect_list_devices().returning(|_| {
            Ok((0..5).map(|i| device(&format!("D{i}"), &format!("K{i}"))).collect())
        });
        api.expect_create_device().never();
        let (handle, _events) = start(api, MockTunnelCapability::new(), None);
        let before = handle.state();

        // Act
        let result = handle.login(AccountToken::new("1234")).await;

        // Assert
        assert_eq!(result, Err(SessionError::TooManyDevices));
        assert_eq!(handle.get_state().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_login_transport_failure_surfaces_login_failed() {
        let mut api = MockAccountApi::new();
        api.expect_fetch_access_token()
            .returning(|_| Err(ApiError::Transport("offline".to_string())));
        let (handle, _events) = start(api, MockTunnelCapability::new(), None);

        let result = handle.login(AccountToken::new("1234")).await;

        assert!(matches!(
            result,
            Err(SessionError::LoginFailed(ApiError::Transport(_)))
        ));
        assert!(!handle.state().is_logged_in());
    }

    #[tokio::test]
    async fn test_create_account_while_logged_in_is_rejected() {
        let (handle, _events) = start(MockAccountApi::new(), MockTunnelCapability::new(), Some(restored()));

        assert_eq!(
            handle.create_account().await,
            Err(SessionError::AlreadyLoggedIn)
        );
    }

    #[tokio::test]
    async fn test_connect_twice_establishes_once() {
        // Arrange
        let mut tunnel = MockTunnelCapability::new();
        tunnel
            .expect_establish()
            .times(1)
            .returning(|_| Ok(TunnelHandle(1)));
        let (handle, _events) = start(MockAccountApi::new(), tunnel, Some(restored()));

        // Act
        let (a, b) = tokio::join!(handle.connect(), handle.connect());
        let connected = wait_for(&handle, |s| s.status.is_connected()).await;

        // Assert
        assert!(a.unwrap().status.is_connecting());
        assert!(b.unwrap().status.is_secured_target());
        assert!(connected.status.is_connected());
    }

    #[tokio::test]
    async fn test_tunnel_failure_enters_error_state_with_hint() {
        let mut tunnel = MockTunnelCapability::new();
        tunnel.expect_establish().returning(|_| {
            Err(TunnelError::Failure {
                reason: "no route".to_string(),
                is_blocking: false,
            })
        });
        let (handle, _events) = start(MockAccountApi::new(), tunnel, Some(restored()));

        handle.connect().await.unwrap();
        let failed = wait_for(&handle, |s| s.status.is_in_error_state()).await;

        match &failed.status {
            TunnelStatus::Error {
                is_blocking,
                auth_failed,
                ..
            } => {
                assert!(!is_blocking);
                assert!(!auth_failed);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_while_connected_tears_down() {
        let mut tunnel = MockTunnelCapability::new();
        tunnel.expect_establish().returning(|_| Ok(TunnelHandle(9)));
        tunnel
            .expect_teardown()
            .with(mockall::predicate::eq(TunnelHandle(9)))
            .times(1)
            .returning(|_| Ok(()));
        let (handle, _events) = start(MockAccountApi::new(), tunnel, Some(restored()));
        handle.connect().await.unwrap();
        wait_for(&handle, |s| s.status.is_connected()).await;

        let snapshot = handle.disconnect().await.unwrap();

        assert_eq!(snapshot.status, TunnelStatus::Disconnecting);
        wait_for(&handle, |s| s.status.is_disconnected()).await;
    }

    #[tokio::test]
    async fn test_unrecoverable_drop_enters_error_state() {
        let mut tunnel = MockTunnelCapability::new();
        tunnel.expect_establish().times(1).returning(|_| Ok(TunnelHandle(3)));
        let (handle, events) = start(MockAccountApi::new(), tunnel, Some(restored()));
        handle.connect().await.unwrap();
        wait_for(&handle, |s| s.status.is_connected()).await;

        events
            .send(TunnelEvent::Dropped {
                handle: TunnelHandle(3),
                reason: "interface removed".to_string(),
                recoverable: false,
            })
            .unwrap();

        let failed = wait_for(&handle, |s| s.status.is_in_error_state()).await;
        assert!(matches!(failed.status, TunnelStatus::Error { is_blocking: true, .. }));
    }

    #[tokio::test]
    async fn test_events_for_unknown_tunnels_are_ignored() {
        let (handle, events) = start(MockAccountApi::new(), MockTunnelCapability::new(), Some(restored()));

        events
            .send(TunnelEvent::TornDown {
                handle: TunnelHandle(42),
            })
            .unwrap();

        let snapshot = handle.get_state().await.unwrap();
        assert_eq!(snapshot.revision, 0);
    }

    #[tokio::test]
    async fn test_secured_target_reconnects_at_startup() {
        // Arrange
        let mut tunnel = MockTunnelCapability::new();
        tunnel
            .expect_establish()
            .times(1)
            .returning(|_| Ok(TunnelHandle(5)));
        let api: Arc<dyn AccountApi> = Arc::new(MockAccountApi::new());
        let tokens = Arc::new(AccessTokenCache::new(Arc::clone(&api), ChronoDuration::minutes(1)));
        let directory = Arc::new(AccountDirectoryClient::new(api, tokens, RetryPolicy::never()));
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let deps = ManagerDeps {
            directory,
            tunnel: Arc::new(tunnel),
            tunnel_events: events_rx,
            store: Arc::new(EphemeralStore),
        };
        let persisted = RestoredState {
            target_state: TargetState::Secured,
            ..RestoredState::with_session(restored())
        };

        // Act
        let (handle, _join) = SessionManager::spawn(
            ManagerConfig {
                connect_policy: RetryPolicy::never(),
                device_check_interval: None,
                ..ManagerConfig::default()
            },
            deps,
            persisted,
        );

        // Assert
        let connected = wait_for(&handle, |s| s.status.is_connected()).await;
        assert!(connected.is_logged_in());
    }

    #[tokio::test]
    async fn test_unsecured_target_stays_disconnected_at_startup() {
        let (handle, _events) = start(MockAccountApi::new(), MockTunnelCapability::new(), Some(restored()));

        let snapshot = handle.get_state().await.unwrap();

        assert!(snapshot.status.is_disconnected());
        assert_eq!(snapshot.revision, 0);
    }

    #[tokio::test]
    async fn test_account_history_starts_from_restored_session() {
        let stored = restored();
        let account = stored.account.token.clone();
        let (handle, _events) = start(MockAccountApi::new(), MockTunnelCapability::new(), Some(stored));

        assert_eq!(handle.get_account_history().await.unwrap(), Some(account));
        handle.clear_account_history().await.unwrap();
        assert_eq!(handle.get_account_history().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_when_logged_out_is_a_no_op() {
        let (handle, _events) = start(MockAccountApi::new(), MockTunnelCapability::new(), None);

        handle.logout().await.unwrap();

        assert_eq!(handle.get_state().await.unwrap().revision, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions_and_stops_loop() {
        let (handle, _events) = start(MockAccountApi::new(), MockTunnelCapability::new(), None);
        let mut sub = handle.subscribe();
        let _ = sub.recv().await;

        handle.shutdown().await.unwrap();

        assert!(sub.recv().await.is_none());
        assert_eq!(handle.connect().await, Err(SessionError::DaemonUnavailable));
    }
}
