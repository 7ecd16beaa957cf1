//! Storage infrastructure: configuration file and device cache.
//!
//! - `config` reads the TOML daemon configuration, with defaults for
//!   everything so a first run works without a file.
//! - `device_cache` persists the logged-in session and the small restart
//!   state as owner-only JSON files and implements the application's
//!   `SessionStore` seam.

pub mod config;
pub mod device_cache;
