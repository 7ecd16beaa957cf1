//! Account identity types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque account token (the "account number" a user types to log in).
///
/// `Display` masks all but the first four characters so tokens can be logged
/// without leaking the credential.  Use [`AccountToken::as_str`] to get the
/// real value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountToken(String);

impl AccountToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the unmasked token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the token with everything after the first four characters masked.
    pub fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("{prefix}****")
    }
}

impl fmt::Display for AccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for AccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountToken({})", self.masked())
    }
}

impl From<&str> for AccountToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AccountToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The logged-in account as held by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub token: AccountToken,
    /// Last expiry reported by the API, if one has been fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl AccountIdentity {
    pub fn new(token: AccountToken) -> Self {
        Self {
            token,
            expiry: None,
        }
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

/// Account metadata returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountData {
    pub expiry: DateTime<Utc>,
}

/// Result of redeeming a voucher code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherSubmission {
    /// Seconds of account time the voucher added.
    pub time_added: u64,
    pub new_expiry: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_masks_token() {
        let token = AccountToken::new("1234567890123456");
        assert_eq!(token.to_string(), "1234****");
        assert_eq!(format!("{token:?}"), "AccountToken(1234****)");
    }

    #[test]
    fn test_as_str_returns_unmasked_token() {
        let token = AccountToken::from("1234567890123456");
        assert_eq!(token.as_str(), "1234567890123456");
    }

    #[test]
    fn test_short_token_masks_without_panicking() {
        assert_eq!(AccountToken::new("12").masked(), "12****");
    }

    #[test]
    fn test_token_serializes_as_plain_string() {
        let json = serde_json::to_string(&AccountToken::new("T1")).unwrap();
        assert_eq!(json, "\"T1\"");
    }
}
