//! Client-facing command surface of the session manager.
//!
//! A [`SessionHandle`] is a cheap, cloneable sender.  Each method posts a
//! [`Command`] carrying a oneshot responder onto the manager's queue and
//! awaits the reply, so commands from every client are applied one at a time
//! in arrival order.
//!
//! Return values may race with state delivery.  Subscribers obtained from
//! [`SessionHandle::subscribe`] are authoritative for eventual state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use vpn_core::{
    AccountAndDevice, AccountData, AccountToken, ApiError, Device, DeviceEvent, DeviceId,
    RemoveDeviceEvent, SessionSnapshot, VoucherSubmission,
};

use super::broadcaster::{EventBroadcaster, SubscriberId, Subscription};
use super::session_state::SessionReader;

/// Failures returned by session commands.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no account is logged in")]
    NotLoggedIn,

    #[error("an account is already logged in")]
    AlreadyLoggedIn,

    #[error("the account already has the maximum number of devices")]
    TooManyDevices,

    #[error("login failed: {0}")]
    LoginFailed(#[source] ApiError),

    /// The bound device was revoked.  Log in again to get a new one.
    #[error("this device has been revoked")]
    DeviceRevoked,

    /// Superseded by a newer command.  Not a user-facing failure.
    #[error("superseded by a newer command")]
    Cancelled,

    #[error(transparent)]
    Api(ApiError),

    /// The manager's event loop has stopped.
    #[error("the session manager is not running")]
    DaemonUnavailable,
}

impl SessionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}

impl From<ApiError> for SessionError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Cancelled => SessionError::Cancelled,
            ApiError::TooManyDevices => SessionError::TooManyDevices,
            ApiError::DeviceRevoked => SessionError::DeviceRevoked,
            other => SessionError::Api(other),
        }
    }
}

/// Notification on the device event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNotification {
    Device(DeviceEvent),
    Removed(RemoveDeviceEvent),
}

pub(crate) type ResponseTx<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    GetState(ResponseTx<Arc<SessionSnapshot>>),
    Connect(ResponseTx<Arc<SessionSnapshot>>),
    Disconnect(ResponseTx<Arc<SessionSnapshot>>),
    Reconnect(ResponseTx<bool>),
    Login(ResponseTx<()>, AccountToken),
    CreateAccount(ResponseTx<AccountToken>),
    Logout(ResponseTx<()>),
    GetDevice(ResponseTx<Option<AccountAndDevice>>),
    UpdateDevice(ResponseTx<()>),
    ListDevices(ResponseTx<Vec<Device>>, AccountToken),
    RemoveDevice(ResponseTx<()>, DeviceId),
    GetAccountData(ResponseTx<AccountData>, AccountToken),
    SubmitVoucher(ResponseTx<VoucherSubmission>, String),
    RotateKey(ResponseTx<()>),
    SetKeyRotationInterval(ResponseTx<()>, Option<Duration>),
    GetAccountHistory(ResponseTx<Option<AccountToken>>),
    ClearAccountHistory(ResponseTx<()>),
    Shutdown(ResponseTx<()>),
}

/// Lossless fan-out of [`DeviceNotification`]s.  Unlike session snapshots,
/// every device event is delivered to every listener.
#[derive(Clone, Default)]
pub(crate) struct DeviceEventHub {
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<DeviceNotification>>>>,
}

impl DeviceEventHub {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn send(&self, notification: DeviceNotification) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|listener| listener.send(notification.clone()).is_ok());
    }

    pub(crate) fn close(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) reader: SessionReader,
    pub(crate) broadcaster: EventBroadcaster<SessionSnapshot>,
    pub(crate) device_events: DeviceEventHub,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(ResponseTx<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SessionError::DaemonUnavailable)?;
        rx.await.map_err(|_| SessionError::DaemonUnavailable)?
    }

    /// Current snapshot, read without going through the command queue.
    pub fn state(&self) -> Arc<SessionSnapshot> {
        self.reader.read()
    }

    /// Current snapshot after every previously sent command was applied.
    pub async fn get_state(&self) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.request(Command::GetState).await
    }

    /// Subscribes to session snapshots.  The current snapshot is delivered
    /// immediately.
    pub fn subscribe(&self) -> Subscription<SessionSnapshot> {
        self.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    /// Subscribes to device events (login, logout, revocation, key rotation,
    /// remote updates and removals).
    pub fn subscribe_device_events(&self) -> mpsc::UnboundedReceiver<DeviceNotification> {
        self.device_events.subscribe()
    }

    /// Starts bringing the tunnel up.  Returns once `Connecting` has been
    /// committed, or the current snapshot if the tunnel is already up or
    /// coming up.
    pub async fn connect(&self) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.request(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.request(Command::Disconnect).await
    }

    /// Restarts the tunnel.  `Ok(false)` when there is no tunnel to restart.
    pub async fn reconnect(&self) -> Result<bool, SessionError> {
        self.request(Command::Reconnect).await
    }

    pub async fn login(&self, account: AccountToken) -> Result<(), SessionError> {
        self.request(|tx| Command::Login(tx, account)).await
    }

    /// Creates a new account and logs in to it.
    pub async fn create_account(&self) -> Result<AccountToken, SessionError> {
        self.request(Command::CreateAccount).await
    }

    pub async fn logout(&self) -> Result<(), SessionError> {
        self.request(Command::Logout).await
    }

    pub async fn get_device(&self) -> Result<Option<AccountAndDevice>, SessionError> {
        self.request(Command::GetDevice).await
    }

    /// Re-fetches the bound device.  Detects revocation.
    pub async fn update_device(&self) -> Result<(), SessionError> {
        self.request(Command::UpdateDevice).await
    }

    pub async fn list_devices(&self, account: AccountToken) -> Result<Vec<Device>, SessionError> {
        self.request(|tx| Command::ListDevices(tx, account)).await
    }

    /// Removes a device from the logged-in account.
    pub async fn remove_device(&self, device_id: DeviceId) -> Result<(), SessionError> {
        self.request(|tx| Command::RemoveDevice(tx, device_id)).await
    }

    pub async fn get_account_data(&self, account: AccountToken) -> Result<AccountData, SessionError> {
        self.request(|tx| Command::GetAccountData(tx, account)).await
    }

    pub async fn submit_voucher(&self, code: impl Into<String>) -> Result<VoucherSubmission, SessionError> {
        let code = code.into();
        self.request(|tx| Command::SubmitVoucher(tx, code)).await
    }

    /// Replaces the device's tunnel key.
    pub async fn rotate_key(&self) -> Result<(), SessionError> {
        self.request(Command::RotateKey).await
    }

    /// Sets the key age at which the device key is rotated automatically.
    /// `None` turns automatic rotation off.  Takes effect immediately.
    pub async fn set_key_rotation_interval(&self, interval: Option<Duration>) -> Result<(), SessionError> {
        self.request(|tx| Command::SetKeyRotationInterval(tx, interval)).await
    }

    /// The account most recently logged in to, kept across logouts.
    pub async fn get_account_history(&self) -> Result<Option<AccountToken>, SessionError> {
        self.request(Command::GetAccountHistory).await
    }

    pub async fn clear_account_history(&self) -> Result<(), SessionError> {
        self.request(Command::ClearAccountHistory).await
    }

    /// Stops the manager: unsubscribes everyone, then tears the tunnel down.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(Command::Shutdown).await
    }
}
