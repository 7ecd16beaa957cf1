//! Application layer of the VPN daemon.
//!
//! # What lives here? (for beginners)
//!
//! This layer owns the session lifecycle: who is logged in, which device is
//! bound, and what the tunnel is doing.  It talks to the outside world only
//! through traits ([`account_api::AccountApi`], [`tunnel_control::TunnelCapability`],
//! [`session_store::SessionStore`]) so that tests can swap in mocks and the
//! infrastructure can change without touching this code.
//!
//! # Sub-modules
//!
//! - **`session_manager`** – The single event loop that applies every command
//!   and publishes every state change.  Start here.
//! - **`session_handle`** – The cloneable client-facing command surface.
//! - **`session_state`** – The current snapshot and its commit rule.
//! - **`broadcaster`** – Latest-value fan-out of snapshots to subscribers.
//! - **`cancellable`** – Retried, cancellable async operations.
//! - **`account_directory`** – Authenticated account API calls with 401
//!   recovery.
//! - **`token_cache`** – Coalesced access-token refresh.
//! - **`account_api`**, **`tunnel_control`**, **`session_store`** – The seams
//!   implemented by the infrastructure layer.

pub mod account_api;
pub mod account_directory;
pub mod broadcaster;
pub mod cancellable;
pub mod session_handle;
pub mod session_manager;
pub mod session_state;
pub mod session_store;
pub mod token_cache;
pub mod tunnel_control;
