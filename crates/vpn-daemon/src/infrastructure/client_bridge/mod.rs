//! Client bridge: exposes the session command surface to front-ends.
//!
//! Front-ends (a GUI, a CLI, a management socket) send a [`ClientRequest`]
//! and receive a [`CommandResult`].  How the JSON gets across is up to the
//! transport; this module only defines the messages and dispatches them onto
//! a [`SessionHandle`].
//!
//! # Data Transfer Objects
//!
//! Domain types are mapped onto DTOs with plain JSON-friendly fields.
//! Timestamps are RFC 3339 strings, device names are pretty-printed, and
//! tunnel status keeps the domain's `{"state": "...", ...}` tagging.
//!
//! # `CommandResult<T>` wrapper
//!
//! Every command returns the same shape:
//! `{ success: bool, data: T | null, error: string | null, code: string | null }`.
//! `code` is a stable machine-readable error kind (`"not_logged_in"`,
//! `"too_many_devices"`, ...) so front-ends do not have to parse messages.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use vpn_core::{
    AccountAndDevice, AccountData, AccountToken, ApiError, Device, DeviceEvent, LoginState,
    RemoveDeviceEvent, SessionSnapshot, TunnelStatus, VoucherSubmission,
};

use crate::application::session_handle::{DeviceNotification, SessionError, SessionHandle};

// ── Requests ──────────────────────────────────────────────────────────────────

/// A command from a front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientRequest {
    GetState,
    Connect,
    Disconnect,
    Reconnect,
    Login { account_token: String },
    CreateAccount,
    Logout,
    GetDevice,
    UpdateDevice,
    ListDevices { account_token: String },
    RemoveDevice { device_id: String },
    GetAccountData { account_token: String },
    SubmitVoucher { code: String },
    RotateKey,
    /// `null` turns automatic rotation off.
    SetKeyRotationInterval { interval_secs: Option<u64> },
    GetAccountHistory,
    ClearAccountHistory,
}

// ── Data Transfer Objects ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDto {
    pub id: String,
    pub name: String,
    pub pubkey: String,
    pub created: String,
}

impl From<&Device> for DeviceDto {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.pretty_name(),
            pubkey: device.pubkey.as_str().to_string(),
            created: device.created.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDeviceDto {
    pub account_token: String,
    pub device: DeviceDto,
}

impl From<&AccountAndDevice> for AccountDeviceDto {
    fn from(value: &AccountAndDevice) -> Self {
        Self {
            account_token: value.account_token.as_str().to_string(),
            device: DeviceDto::from(&value.device),
        }
    }
}

/// The session as front-ends see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDto {
    pub revision: u64,
    pub login: LoginState,
    pub account_token: Option<String>,
    pub account_expiry: Option<String>,
    pub device: Option<DeviceDto>,
    pub tunnel: TunnelStatus,
}

impl From<&SessionSnapshot> for SessionDto {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            revision: snapshot.revision,
            login: snapshot.login,
            account_token: snapshot
                .account
                .as_ref()
                .map(|account| account.token.as_str().to_string()),
            account_expiry: snapshot
                .account
                .as_ref()
                .and_then(|account| account.expiry)
                .map(|expiry| expiry.to_rfc3339()),
            device: snapshot
                .device
                .as_ref()
                .map(|device| DeviceDto::from(&device.to_device())),
            tunnel: snapshot.status.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDataDto {
    pub expiry: String,
}

impl From<&AccountData> for AccountDataDto {
    fn from(data: &AccountData) -> Self {
        Self {
            expiry: data.expiry.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherDto {
    pub time_added: u64,
    pub new_expiry: String,
}

impl From<&VoucherSubmission> for VoucherDto {
    fn from(submission: &VoucherSubmission) -> Self {
        Self {
            time_added: submission.time_added,
            new_expiry: submission.new_expiry.to_rfc3339(),
        }
    }
}

/// Entry on the device notification stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceNotificationDto {
    Device {
        #[serde(flatten)]
        event: DeviceEvent,
    },
    Removed {
        #[serde(flatten)]
        event: RemoveDeviceEvent,
    },
}

impl From<DeviceNotification> for DeviceNotificationDto {
    fn from(notification: DeviceNotification) -> Self {
        match notification {
            DeviceNotification::Device(event) => DeviceNotificationDto::Device { event },
            DeviceNotification::Removed(event) => DeviceNotificationDto::Removed { event },
        }
    }
}

// ── CommandResult ─────────────────────────────────────────────────────────────

/// Unified response wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub code: Option<String>,
}

impl<T> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn err(error: &SessionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            code: Some(error_code(error).to_string()),
        }
    }

    fn from_result<U>(result: Result<U, SessionError>, map: impl FnOnce(U) -> T) -> Self {
        match result {
            Ok(value) => Self::ok(map(value)),
            Err(e) => Self::err(&e),
        }
    }
}

/// Stable error kind for front-ends.
pub fn error_code(error: &SessionError) -> &'static str {
    match error {
        SessionError::NotLoggedIn => "not_logged_in",
        SessionError::AlreadyLoggedIn => "already_logged_in",
        SessionError::TooManyDevices => "too_many_devices",
        SessionError::LoginFailed(ApiError::InvalidAccount) => "invalid_account",
        SessionError::LoginFailed(_) => "login_failed",
        SessionError::DeviceRevoked => "device_revoked",
        SessionError::Cancelled => "cancelled",
        SessionError::Api(ApiError::InvalidVoucher) => "invalid_voucher",
        SessionError::Api(ApiError::NotFound) => "not_found",
        SessionError::Api(ApiError::Transport(_)) => "network",
        SessionError::Api(_) => "api",
        SessionError::DaemonUnavailable => "daemon_unavailable",
    }
}

// ── Typed commands ────────────────────────────────────────────────────────────

pub async fn get_state(handle: &SessionHandle) -> CommandResult<SessionDto> {
    CommandResult::from_result(handle.get_state().await, |s| SessionDto::from(&*s))
}

pub async fn connect(handle: &SessionHandle) -> CommandResult<SessionDto> {
    CommandResult::from_result(handle.connect().await, |s| SessionDto::from(&*s))
}

pub async fn disconnect(handle: &SessionHandle) -> CommandResult<SessionDto> {
    CommandResult::from_result(handle.disconnect().await, |s| SessionDto::from(&*s))
}

pub async fn list_devices(handle: &SessionHandle, account_token: &str) -> CommandResult<Vec<DeviceDto>> {
    CommandResult::from_result(
        handle.list_devices(AccountToken::new(account_token)).await,
        |devices| devices.iter().map(DeviceDto::from).collect(),
    )
}

/// Stream of session DTOs.  Starts with the current state.
pub fn session_updates(handle: &SessionHandle) -> impl Stream<Item = SessionDto> + Send {
    handle
        .subscribe()
        .into_stream()
        .map(|snapshot| SessionDto::from(&*snapshot))
}

/// Stream of device notifications, in the order they happened.
pub fn device_notifications(handle: &SessionHandle) -> impl Stream<Item = DeviceNotificationDto> + Send {
    futures_util::stream::unfold(handle.subscribe_device_events(), |mut rx| async move {
        rx.recv()
            .await
            .map(|notification| (DeviceNotificationDto::from(notification), rx))
    })
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

fn to_value<T: Serialize>(result: CommandResult<T>) -> CommandResult<Value> {
    CommandResult {
        success: result.success,
        data: result
            .data
            .map(|data| serde_json::to_value(data).unwrap_or(Value::Null)),
        error: result.error,
        code: result.code,
    }
}

/// Runs `request` against the session and returns a JSON-ready result.
pub async fn dispatch(handle: &SessionHandle, request: ClientRequest) -> CommandResult<Value> {
    debug!(?request, "client request");
    match request {
        ClientRequest::GetState => to_value(get_state(handle).await),
        ClientRequest::Connect => to_value(connect(handle).await),
        ClientRequest::Disconnect => to_value(disconnect(handle).await),
        ClientRequest::Reconnect => to_value(CommandResult::from_result(handle.reconnect().await, |b| b)),
        ClientRequest::Login { account_token } => to_value(CommandResult::from_result(
            handle.login(AccountToken::new(account_token)).await,
            |()| (),
        )),
        ClientRequest::CreateAccount => to_value(CommandResult::from_result(
            handle.create_account().await,
            |token| token.as_str().to_string(),
        )),
        ClientRequest::Logout => to_value(CommandResult::from_result(handle.logout().await, |()| ())),
        ClientRequest::GetDevice => to_value(CommandResult::from_result(
            handle.get_device().await,
            |device| device.as_ref().map(AccountDeviceDto::from),
        )),
        ClientRequest::UpdateDevice => {
            to_value(CommandResult::from_result(handle.update_device().await, |()| ()))
        }
        ClientRequest::ListDevices { account_token } => {
            to_value(list_devices(handle, &account_token).await)
        }
        ClientRequest::RemoveDevice { device_id } => to_value(CommandResult::from_result(
            handle.remove_device(device_id).await,
            |()| (),
        )),
        ClientRequest::GetAccountData { account_token } => to_value(CommandResult::from_result(
            handle.get_account_data(AccountToken::new(account_token)).await,
            |data| AccountDataDto::from(&data),
        )),
        ClientRequest::SubmitVoucher { code } => to_value(CommandResult::from_result(
            handle.submit_voucher(code).await,
            |submission| VoucherDto::from(&submission),
        )),
        ClientRequest::RotateKey => {
            to_value(CommandResult::from_result(handle.rotate_key().await, |()| ()))
        }
        ClientRequest::SetKeyRotationInterval { interval_secs } => to_value(CommandResult::from_result(
            handle
                .set_key_rotation_interval(interval_secs.map(Duration::from_secs))
                .await,
            |()| (),
        )),
        ClientRequest::GetAccountHistory => to_value(CommandResult::from_result(
            handle.get_account_history().await,
            |account| account.map(|token| token.as_str().to_string()),
        )),
        ClientRequest::ClearAccountHistory => to_value(CommandResult::from_result(
            handle.clear_account_history().await,
            |()| (),
        )),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
