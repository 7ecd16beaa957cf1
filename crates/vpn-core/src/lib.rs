//! # vpn-core
//!
//! Shared library for the VPN daemon containing the session domain model,
//! the remote-API and tunnel error taxonomy, and the retry policy used by
//! every retried operation.
//!
//! This crate has zero dependencies on async runtimes, sockets, or HTTP
//! clients.  Everything in it is plain data plus pure functions, so it can be
//! unit-tested without any setup and shared with client front-ends.
//!
//! # Architecture overview
//!
//! The daemon keeps one authoritative *session*: the account that is logged
//! in, the device registered for this installation, and the status of the
//! tunnel.  Clients (desktop UI, mobile UI, CLI) never mutate it directly;
//! they send commands and observe immutable [`SessionSnapshot`]s.
//!
//! - **`domain`** – account, device, tunnel and snapshot types.
//! - **`error`** – [`ApiError`] and [`TunnelError`], the failure classes the
//!   session manager reacts to.
//! - **`keys`** – the installation's tunnel key pair.
//! - **`retry`** – [`RetryPolicy`] (attempt limits and backoff schedule) and
//!   the [`Retryable`] classification trait.

pub mod domain;
pub mod error;
pub mod keys;
pub mod retry;

pub use domain::account::{AccountData, AccountIdentity, AccountToken, VoucherSubmission};
pub use domain::device::{
    AccountAndDevice, Device, DeviceEvent, DeviceEventCause, DeviceId, DeviceIdentity, PublicKey,
    RemoveDeviceEvent,
};
pub use domain::snapshot::{LoginState, SessionSnapshot};
pub use domain::tunnel::{RelayConfig, TargetState, TunnelEndpoint, TunnelHandle, TunnelStatus};
pub use error::{ApiError, TunnelError};
pub use keys::{KeyPair, PrivateKey};
pub use retry::{Backoff, RetryPolicy, Retryable};
