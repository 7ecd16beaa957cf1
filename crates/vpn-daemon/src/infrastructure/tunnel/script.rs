//! Tunnel backend driven by external commands.
//!
//! `establish` runs the configured up command through `sh -c` and
//! `teardown` runs the down command.  The relay is passed in environment
//! variables:
//!
//! | Variable | Value |
//! |---|---|
//! | `VPN_TUNNEL_HANDLE` | numeric handle chosen by the daemon |
//! | `VPN_RELAY` | relay hostname |
//! | `VPN_ENDPOINT` | relay `ip:port` |
//! | `VPN_PUBKEY` | device public key, base64 |
//!
//! The up command's exit code classifies failures:
//!
//! | Exit code | Error |
//! |---|---|
//! | 0 | success |
//! | 75 (`EX_TEMPFAIL`) | [`TunnelError::Unreachable`], retried |
//! | 77 (`EX_NOPERM`) | [`TunnelError::AuthFailed`] |
//! | anything else | [`TunnelError::Failure`] |
//!
//! If an establish does not succeed, the down command runs for the same
//! handle in the background.  This covers an up command that fails or times
//! out, and an establish the daemon cancels before the up command exits
//! (the up command is killed first).
//!
//! This backend does not watch the tunnel after it is up, so it never emits
//! unsolicited [`TunnelEvent`](crate::application::tunnel_control::TunnelEvent)s.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use vpn_core::{RelayConfig, TunnelError, TunnelHandle};

use crate::application::tunnel_control::TunnelCapability;

pub const EXIT_UNREACHABLE: i32 = 75;
pub const EXIT_AUTH_FAILED: i32 = 77;

#[derive(Debug, Clone)]
pub struct ScriptTunnelConfig {
    pub up_command: String,
    pub down_command: Option<String>,
    pub timeout: Duration,
    /// Classification of failures the exit code does not cover.
    pub block_on_error: bool,
}

pub struct ScriptTunnel {
    config: ScriptTunnelConfig,
    next_handle: AtomicU64,
}

impl ScriptTunnel {
    pub fn new(config: ScriptTunnelConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
        }
    }

    fn command(&self, script: &str, handle: TunnelHandle) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .env("VPN_TUNNEL_HANDLE", handle.0.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Runs `command` to completion within the timeout.  Returns the exit
    /// code (`None` if killed by a signal) and trimmed stderr.
    async fn run(&self, mut command: Command) -> Result<(Option<i32>, String), TunnelError> {
        let child = command.spawn().map_err(|e| TunnelError::Failure {
            reason: format!("failed to start tunnel command: {e}"),
            is_blocking: self.config.block_on_error,
        })?;
        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| TunnelError::Timeout)?
            .map_err(|e| TunnelError::Failure {
                reason: format!("tunnel command failed: {e}"),
                is_blocking: self.config.block_on_error,
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok((output.status.code(), stderr))
    }
}

/// Runs the down command when dropped while armed.  Held across the up
/// command so an interrupted establish still cleans up after itself.
struct AbandonGuard {
    handle: TunnelHandle,
    down: Option<Command>,
}

impl AbandonGuard {
    fn disarm(mut self) {
        self.down = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(mut down) = self.down.take() else {
            return;
        };
        let handle = self.handle;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%handle, "establish abandoned outside a runtime, down command skipped");
            return;
        };
        debug!(%handle, "establish did not succeed, running down command");
        runtime.spawn(async move {
            match down.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(%handle, ?status, "down command after failed establish failed"),
                Err(e) => warn!(%handle, error = %e, "could not run down command after failed establish"),
            }
        });
    }
}

#[async_trait]
impl TunnelCapability for ScriptTunnel {
    async fn establish(&self, config: &RelayConfig) -> Result<TunnelHandle, TunnelError> {
        let handle = TunnelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut command = self.command(&self.config.up_command, handle);
        command
            .env("VPN_RELAY", &config.relay)
            .env("VPN_ENDPOINT", config.endpoint.to_string())
            .env("VPN_PUBKEY", config.device_pubkey.as_str());
        debug!(%handle, relay = %config.relay, "running tunnel up command");

        let guard = AbandonGuard {
            handle,
            down: self
                .config
                .down_command
                .as_deref()
                .map(|script| self.command(script, handle)),
        };
        let (code, stderr) = self.run(command).await?;
        match code {
            Some(0) => {
                guard.disarm();
                info!(%handle, endpoint = %config.endpoint, "tunnel up command succeeded");
                Ok(handle)
            }
            Some(EXIT_UNREACHABLE) => Err(TunnelError::Unreachable(stderr)),
            Some(EXIT_AUTH_FAILED) => Err(TunnelError::AuthFailed),
            code => Err(TunnelError::Failure {
                reason: match code {
                    Some(code) => format!("up command exited with {code}: {stderr}"),
                    None => format!("up command killed by signal: {stderr}"),
                },
                is_blocking: self.config.block_on_error,
            }),
        }
    }

    async fn teardown(&self, handle: TunnelHandle) -> Result<(), TunnelError> {
        let Some(script) = &self.config.down_command else {
            return Ok(());
        };
        debug!(%handle, "running tunnel down command");
        let (code, stderr) = self.run(self.command(script, handle)).await?;
        if code == Some(0) {
            Ok(())
        } else {
            warn!(%handle, ?code, %stderr, "tunnel down command failed");
            Err(TunnelError::Failure {
                reason: format!("down command failed: {stderr}"),
                is_blocking: false,
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
