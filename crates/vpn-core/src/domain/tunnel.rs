//! Tunnel status and the opaque values exchanged with the tunnel capability.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::PublicKey;

/// Remote endpoint of an established tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    /// Relay hostname, e.g. `se-got-wg-001`.
    pub relay: String,
    pub address: SocketAddr,
}

impl fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.relay, self.address)
    }
}

/// Everything the tunnel capability needs to bring a tunnel up.
///
/// Relay selection happens elsewhere; the daemon hands over an already chosen
/// relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub relay: String,
    pub endpoint: SocketAddr,
    /// Public key of the bound device, registered with the relay by the API.
    pub device_pubkey: PublicKey,
}

impl RelayConfig {
    pub fn endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint {
            relay: self.relay.clone(),
            address: self.endpoint,
        }
    }
}

/// Opaque handle returned by a successful `establish`, required for `teardown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelHandle(pub u64);

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel#{}", self.0)
    }
}

/// Current status of the tunnel.
///
/// Exactly one variant is active at any instant.
///
/// ```text
/// Disconnected ──connect──► Connecting ──established──► Connected
///      ▲                        │  ▲                        │
///      │                  failed│  │retry / dropped         │disconnect
///      │                        ▼  │                        ▼
///      └──────torn down────── Error / Disconnecting ◄───────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelStatus {
    Disconnected,
    Connecting {
        since: DateTime<Utc>,
        /// 1 for the first establish attempt, incremented on every retry.
        attempt: u32,
    },
    Connected {
        since: DateTime<Utc>,
        endpoint: TunnelEndpoint,
    },
    Disconnecting,
    Error {
        reason: String,
        /// Whether outbound traffic is held back while in this state.
        is_blocking: bool,
        /// The tunnel was rejected because the device key is not accepted.
        #[serde(default)]
        auth_failed: bool,
    },
}

impl TunnelStatus {
    pub fn connecting_now() -> Self {
        TunnelStatus::Connecting {
            since: Utc::now(),
            attempt: 1,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelStatus::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, TunnelStatus::Connecting { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, TunnelStatus::Disconnected)
    }

    pub fn is_in_error_state(&self) -> bool {
        matches!(self, TunnelStatus::Error { .. })
    }

    /// True for `Connecting` and `Connected`: states in which the tunnel is
    /// wanted up.
    pub fn is_secured_target(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }

    /// Short lowercase label, used in logs and DTOs.
    pub fn label(&self) -> &'static str {
        match self {
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Connecting { .. } => "connecting",
            TunnelStatus::Connected { .. } => "connected",
            TunnelStatus::Disconnecting => "disconnecting",
            TunnelStatus::Error { .. } => "error",
        }
    }
}

/// Whether the user wants the tunnel up.
///
/// Set by connect and disconnect, kept through failures and retries, and
/// persisted so a restarted daemon brings a wanted tunnel back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    #[default]
    Unsecured,
    Secured,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        TunnelStatus::Disconnected
    }
}
