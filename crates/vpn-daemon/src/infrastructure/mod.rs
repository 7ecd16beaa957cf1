//! Infrastructure layer of the VPN daemon.
//!
//! Contains the adapters behind the application's traits: the HTTP account
//! API, tunnel backends, file storage, and the client command bridge, plus
//! the start-up wiring in `daemon`.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `vpn_core`, but MUST NOT be imported by the `application` or domain layers.

pub mod api;
pub mod client_bridge;
pub mod daemon;
pub mod storage;
pub mod tunnel;
