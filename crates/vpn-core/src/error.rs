//! Failure taxonomy shared by the API client, the tunnel capability and the
//! session manager.
//!
//! | Class            | Retried?                                   |
//! |------------------|--------------------------------------------|
//! | `Transport`      | yes, up to the policy limit                |
//! | `RateLimited`    | yes                                        |
//! | `Server` (5xx)   | yes                                        |
//! | `Unauthorized`   | once, after the cached token is invalidated |
//! | `NotFound`       | never; mapped per endpoint                 |
//! | everything else  | never                                      |

use thiserror::Error;

use crate::retry::Retryable;

/// Error code the API returns in the body of a 400 when the device cap is hit.
pub const MAX_DEVICES_REACHED: &str = "MAX_DEVICES_REACHED";
/// Error code the API returns when the account token does not exist.
pub const INVALID_ACCOUNT: &str = "INVALID_ACCOUNT";
/// Error code the API returns when a voucher is unknown or already used.
pub const INVALID_VOUCHER: &str = "INVALID_VOUCHER";

/// Errors produced by calls against the remote account API.
///
/// `Clone` so that one refresh outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Connectivity problem or timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// The bearer token was rejected (HTTP 401).
    #[error("access token rejected by the API")]
    Unauthorized,

    /// The resource does not exist (HTTP 404).
    #[error("resource not found")]
    NotFound,

    /// The account already has the maximum number of devices.
    #[error("the account already has the maximum number of devices")]
    TooManyDevices,

    /// The bound device no longer exists on the account.
    #[error("the device has been revoked")]
    DeviceRevoked,

    /// The account token does not exist.
    #[error("invalid account token")]
    InvalidAccount,

    /// The voucher code is unknown or already redeemed.
    #[error("invalid or already used voucher")]
    InvalidVoucher,

    /// HTTP 429.
    #[error("rate limited by the API")]
    RateLimited,

    /// Any other non-success response, with the structured error body.
    #[error("API error {status} ({code}): {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    /// The response body could not be decoded.
    #[error("malformed API response: {0}")]
    InvalidResponse(String),

    /// The operation was superseded and cancelled.  Never shown to users.
    #[error("operation cancelled")]
    Cancelled,
}

impl ApiError {
    /// Maps a non-success HTTP status and optional error-body code to an error.
    ///
    /// ```
    /// use vpn_core::ApiError;
    ///
    /// assert_eq!(ApiError::from_status(401, None, ""), ApiError::Unauthorized);
    /// assert_eq!(ApiError::from_status(404, None, ""), ApiError::NotFound);
    /// assert_eq!(
    ///     ApiError::from_status(400, Some("MAX_DEVICES_REACHED"), ""),
    ///     ApiError::TooManyDevices
    /// );
    /// ```
    pub fn from_status(status: u16, code: Option<&str>, message: &str) -> Self {
        match (status, code) {
            (401, Some(INVALID_ACCOUNT)) | (403, Some(INVALID_ACCOUNT)) => ApiError::InvalidAccount,
            (401, _) => ApiError::Unauthorized,
            (404, _) => ApiError::NotFound,
            (429, _) => ApiError::RateLimited,
            (_, Some(MAX_DEVICES_REACHED)) => ApiError::TooManyDevices,
            (_, Some(INVALID_ACCOUNT)) => ApiError::InvalidAccount,
            (_, Some(INVALID_VOUCHER)) => ApiError::InvalidVoucher,
            (status, code) => ApiError::Server {
                status,
                code: code.unwrap_or("UNKNOWN").to_string(),
                message: message.to_string(),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::RateLimited => true,
            ApiError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors reported by the tunnel capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    /// The relay could not be reached.  Retryable.
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    /// The establish call did not finish in time.  Retryable.
    #[error("tunnel establish timed out")]
    Timeout,

    /// The relay rejected the device key.
    #[error("relay rejected the device key")]
    AuthFailed,

    /// Any other failure.  `is_blocking` says whether traffic must be held
    /// back while the daemon sits in the error state.
    #[error("tunnel failure: {reason}")]
    Failure { reason: String, is_blocking: bool },

    /// The operation was superseded and cancelled.
    #[error("tunnel operation cancelled")]
    Cancelled,
}

impl TunnelError {
    /// The blocking decision carried by the error itself, if any.  `None`
    /// means the daemon's configured policy decides.
    pub fn blocking_hint(&self) -> Option<bool> {
        match self {
            TunnelError::Failure { is_blocking, .. } => Some(*is_blocking),
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TunnelError::AuthFailed)
    }
}

impl Retryable for TunnelError {
    fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Unreachable(_) | TunnelError::Timeout)
    }
}
