//! Tunnel capability backends.
//!
//! - `script` runs external up/down commands for a real tunnel.
//! - `in_memory` pretends, for `--dry-run` and tests.

pub mod in_memory;
pub mod script;
