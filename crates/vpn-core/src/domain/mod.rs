//! Domain entities for the VPN daemon.
//!
//! Pure data with no infrastructure dependencies.  The session manager in
//! `vpn-daemon` is the only writer of these values; everything else receives
//! clones or [`snapshot::SessionSnapshot`]s.

pub mod account;
pub mod device;
pub mod snapshot;
pub mod tunnel;
