//! proxy-sieve runtime
//!
//! Loads the TOML settings and supervises the long-lived loops:
//! crawl, scan, anonymity check and history check. All loops share one
//! store and one cancellation token.

pub mod settings;
pub mod supervisor;

pub use settings::*;
pub use supervisor::*;
