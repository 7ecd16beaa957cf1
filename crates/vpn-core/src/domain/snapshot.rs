//! Immutable point-in-time view of the session.

use serde::{Deserialize, Serialize};

use super::account::AccountIdentity;
use super::device::{AccountAndDevice, DeviceIdentity};
use super::tunnel::TunnelStatus;

/// Whether an account/device pair is bound, and if not, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    LoggedOut,
    LoggedIn,
    /// The previously bound device was revoked.  Stays in effect until the
    /// next login so late subscribers still see why the session ended.
    Revoked,
}

/// Immutable session value published to every subscriber.
///
/// Snapshots are never mutated after construction; the `with_*` methods
/// return a modified copy.  `revision` is assigned by the session state on
/// commit and increases by one for every published change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub revision: u64,
    pub account: Option<AccountIdentity>,
    pub device: Option<DeviceIdentity>,
    pub login: LoginState,
    pub status: TunnelStatus,
}

impl SessionSnapshot {
    /// The state of a freshly started daemon with no stored session.
    pub fn initial() -> Self {
        Self {
            revision: 0,
            account: None,
            device: None,
            login: LoginState::LoggedOut,
            status: TunnelStatus::Disconnected,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.account.is_some() && self.device.is_some()
    }

    /// Returns the bound account and device, if any.
    pub fn account_and_device(&self) -> Option<AccountAndDevice> {
        match (&self.account, &self.device) {
            (Some(account), Some(device)) => Some(AccountAndDevice::new(
                account.token.clone(),
                device.to_device(),
            )),
            _ => None,
        }
    }

    pub fn with_status(&self, status: TunnelStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Binds an account and device.
    pub fn with_login(&self, account: AccountIdentity, device: DeviceIdentity) -> Self {
        Self {
            account: Some(account),
            device: Some(device),
            login: LoginState::LoggedIn,
            ..self.clone()
        }
    }

    pub fn with_device(&self, device: DeviceIdentity) -> Self {
        Self {
            device: Some(device),
            ..self.clone()
        }
    }

    pub fn with_account(&self, account: AccountIdentity) -> Self {
        Self {
            account: Some(account),
            ..self.clone()
        }
    }

    /// Clears account and device after a local logout.
    pub fn logged_out(&self, status: TunnelStatus) -> Self {
        Self {
            account: None,
            device: None,
            login: LoginState::LoggedOut,
            status,
            revision: self.revision,
        }
    }

    /// Clears account and device after the device was revoked.
    pub fn revoked(&self, status: TunnelStatus) -> Self {
        Self {
            login: LoginState::Revoked,
            ..self.logged_out(status)
        }
    }

    /// Compares everything except the revision counter.
    pub fn same_content(&self, other: &SessionSnapshot) -> bool {
        self.account == other.account
            && self.device == other.device
            && self.login == other.login
            && self.status == other.status
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountToken;
    use crate::domain::device::PublicKey;
    use chrono::Utc;

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            id: "D1".to_string(),
            name: "brave otter".to_string(),
            pubkey: PublicKey::new("AAAA"),
            created: Utc::now(),
            revoked: false,
        }
    }

    #[test]
    fn test_initial_snapshot_is_logged_out_and_disconnected() {
        let snap = SessionSnapshot::initial();
        assert!(!snap.is_logged_in());
        assert_eq!(snap.login, LoginState::LoggedOut);
        assert!(snap.status.is_disconnected());
    }

    #[test]
    fn test_with_login_binds_account_and_device() {
        let snap = SessionSnapshot::initial()
            .with_login(AccountIdentity::new(AccountToken::new("T1")), device());
        assert!(snap.is_logged_in());
        let pair = snap.account_and_device().unwrap();
        assert_eq!(pair.account_token.as_str(), "T1");
        assert_eq!(pair.device.id, "D1");
    }

    #[test]
    fn test_revoked_clears_identities_and_marks_revoked() {
        let snap = SessionSnapshot::initial()
            .with_login(AccountIdentity::new(AccountToken::new("T1")), device())
            .revoked(TunnelStatus::Disconnecting);
        assert!(snap.account.is_none());
        assert!(snap.device.is_none());
        assert_eq!(snap.login, LoginState::Revoked);
        assert_eq!(snap.status, TunnelStatus::Disconnecting);
    }

    #[test]
    fn test_same_content_ignores_revision() {
        let a = SessionSnapshot::initial();
        let mut b = a.clone();
        b.revision = 42;
        assert!(a.same_content(&b));
    }
}
