//! Abstraction over the remote account and device API.
//!
//! The application layer talks to the API only through [`AccountApi`].  The
//! production implementation is
//! `infrastructure::api::http::HttpAccountApi`; tests and `--dry-run` use
//! `infrastructure::api::in_memory::InMemoryAccountApi`, and unit tests in
//! this layer use the `mockall`-generated `MockAccountApi`.
//!
//! Every call except [`AccountApi::fetch_access_token`] and
//! [`AccountApi::create_account`] is authenticated with a short-lived
//! [`AccessToken`] obtained from the account token.  Retries, token caching
//! and the refresh-on-401 rule are layered on top by the
//! [`AccountDirectoryClient`](super::account_directory::AccountDirectoryClient).

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

#[cfg(test)]
use mockall::automock;

use vpn_core::{AccountData, AccountToken, ApiError, Device, PublicKey, VoucherSubmission};

/// Short-lived bearer token for authenticated API calls.
///
/// `Debug` does not print the token value.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expiry: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expiry: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expiry,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    /// Whether the token is still usable `margin` from `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expiry
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// Exchanges an account token for an access token.
    async fn fetch_access_token(&self, account: &AccountToken) -> Result<AccessToken, ApiError>;

    /// Creates a new account and returns its token.
    async fn create_account(&self) -> Result<AccountToken, ApiError>;

    async fn get_account_data(&self, token: &AccessToken) -> Result<AccountData, ApiError>;

    async fn list_devices(&self, token: &AccessToken) -> Result<Vec<Device>, ApiError>;

    /// Returns [`ApiError::NotFound`] when the device does not exist.
    async fn get_device(&self, token: &AccessToken, device_id: &str) -> Result<Device, ApiError>;

    /// Registers a new device.  Fails with [`ApiError::TooManyDevices`] at
    /// the account's device cap.
    async fn create_device(&self, token: &AccessToken, pubkey: &PublicKey)
        -> Result<Device, ApiError>;

    /// Returns [`ApiError::NotFound`] when the device does not exist.
    async fn delete_device(&self, token: &AccessToken, device_id: &str) -> Result<(), ApiError>;

    async fn replace_device_key(
        &self,
        token: &AccessToken,
        device_id: &str,
        pubkey: &PublicKey,
    ) -> Result<Device, ApiError>;

    async fn submit_voucher(
        &self,
        token: &AccessToken,
        code: &str,
    ) -> Result<VoucherSubmission, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_freshness_honours_margin() {
        let now = Utc::now();
        let token = AccessToken::new("abc", now + Duration::minutes(10));

        assert!(token.is_fresh_at(now, Duration::minutes(5)));
        assert!(!token.is_fresh_at(now, Duration::minutes(10)));
        assert!(!token.is_fresh_at(now + Duration::minutes(11), Duration::zero()));
    }

    #[test]
    fn test_debug_hides_token_value() {
        let token = AccessToken::new("super-secret", Utc::now());
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}
