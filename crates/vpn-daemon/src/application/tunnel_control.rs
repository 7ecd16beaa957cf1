//! The tunnel seam: how the session manager brings tunnels up and down.
//!
//! The manager depends only on [`TunnelCapability`].  Unsolicited changes
//! (the tunnel dropping, or being torn down behind the daemon's back) arrive
//! separately as [`TunnelEvent`]s on an unbounded channel handed to the
//! manager at construction.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use vpn_core::{RelayConfig, TunnelError, TunnelHandle};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelCapability: Send + Sync {
    /// Brings a tunnel up to the relay in `config`.
    async fn establish(&self, config: &RelayConfig) -> Result<TunnelHandle, TunnelError>;

    /// Tears down the tunnel identified by `handle`.
    async fn teardown(&self, handle: TunnelHandle) -> Result<(), TunnelError>;
}

/// Unsolicited notifications from the tunnel implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The established tunnel stopped carrying traffic.
    Dropped {
        handle: TunnelHandle,
        reason: String,
        /// Whether bringing the tunnel back up may succeed.
        recoverable: bool,
    },
    /// The tunnel went away without the daemon asking for it.
    TornDown { handle: TunnelHandle },
}

impl TunnelEvent {
    pub fn handle(&self) -> TunnelHandle {
        match self {
            TunnelEvent::Dropped { handle, .. } | TunnelEvent::TornDown { handle } => *handle,
        }
    }
}
