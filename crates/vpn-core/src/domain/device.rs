//! Device identity types.
//!
//! A *device* is a registered endpoint (tunnel public key plus metadata)
//! associated with one account.  The API caps the number of devices per
//! account, so logging in on a new installation may fail with
//! `TooManyDevices` until another device is removed.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::AccountToken;

/// Device identifier assigned by the API.
pub type DeviceId = String;

/// Base64-encoded tunnel public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn new(base64: impl Into<String>) -> Self {
        Self(base64.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device as returned by the account API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub pubkey: PublicKey,
    pub created: DateTime<Utc>,
}

impl Device {
    /// Returns the name with each word capitalized: "Happy Seagull" instead of "happy seagull".
    pub fn pretty_name(&self) -> String {
        self.name
            .split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    None => String::new(),
                    Some(c) => c.to_uppercase().chain(chars).collect(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }
}

/// The device bound to the current session.
///
/// Owned exclusively by the session state once bound; a device is never
/// shared between two active sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub name: String,
    pub pubkey: PublicKey,
    pub created: DateTime<Utc>,
    /// Set when the API no longer knows the device.
    #[serde(default)]
    pub revoked: bool,
}

impl DeviceIdentity {
    /// Returns the API view of this device.
    pub fn to_device(&self) -> Device {
        Device {
            id: self.id.clone(),
            name: self.name.clone(),
            pubkey: self.pubkey.clone(),
            created: self.created,
        }
    }
}

impl From<Device> for DeviceIdentity {
    fn from(device: Device) -> Self {
        Self {
            id: device.id,
            name: device.name,
            pubkey: device.pubkey,
            created: device.created,
            revoked: false,
        }
    }
}

/// A [`Device`] and the account it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAndDevice {
    pub account_token: AccountToken,
    pub device: Device,
}

impl AccountAndDevice {
    pub fn new(account_token: AccountToken, device: Device) -> Self {
        Self {
            account_token,
            device,
        }
    }
}

/// Why a [`DeviceEvent`] was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventCause {
    LoggedIn,
    LoggedOut,
    /// The device disappeared from the account.  Distinct from a logout so
    /// front-ends can route the user to a re-authentication flow.
    Revoked,
    RotatedKey,
    /// Device metadata changed remotely (e.g. renamed).
    Updated,
}

/// Emitted when logging in or out, or when the bound device changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub cause: DeviceEventCause,
    /// The device after the change, if one is still bound.
    pub device: Option<AccountAndDevice>,
    /// Whether the change was initiated remotely rather than by this daemon.
    pub remote: bool,
}

impl DeviceEvent {
    pub fn logged_in(device: AccountAndDevice) -> Self {
        Self {
            cause: DeviceEventCause::LoggedIn,
            device: Some(device),
            remote: false,
        }
    }

    pub fn logged_out() -> Self {
        Self {
            cause: DeviceEventCause::LoggedOut,
            device: None,
            remote: false,
        }
    }

    pub fn revoked(remote: bool) -> Self {
        Self {
            cause: DeviceEventCause::Revoked,
            device: None,
            remote,
        }
    }
}

/// Emitted when a device is removed with the `remove_device` command.
///
/// Not sent on a normal logout or when the bound device is revoked remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDeviceEvent {
    pub account_token: AccountToken,
    pub removed_device: Device,
    pub new_devices: Vec<Device>,
}
