//! The installation's tunnel key pair.
//!
//! A device registered with the API is identified by its public key.  When
//! logging in, a device whose key matches the local key pair is reused
//! instead of registering a new one.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::domain::device::PublicKey;

/// Base64-encoded X25519 private key.  `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// X25519 key pair used as the device identity on relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
    /// When the pair was generated.  Drives automatic key rotation.
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
}

impl KeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            private: PrivateKey(STANDARD.encode(secret.to_bytes())),
            public: PublicKey::new(STANDARD.encode(public.as_bytes())),
            created: Utc::now(),
        }
    }

    /// Time since the pair was generated, zero if `created` is in the future.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created).max(chrono::Duration::zero())
    }
}
