//! Account API adapters.
//!
//! - `http` talks to the real REST service with `reqwest`.
//! - `in_memory` is a self-contained stand-in used by `--dry-run` and the
//!   scenario tests in `tests/`.

pub mod http;
pub mod in_memory;
