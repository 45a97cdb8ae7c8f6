//! proxy-sieve agents
//!
//! Long-lived components of the discovery pipeline:
//! - **Crawler**: walks proxy-list pages and queues candidates and ranges
//! - **Backlog**: re-compacts the scan backlog once it grows
//! - **Scanner**: expands ranges into probes over a fixed worker pool
//! - **Chain**: ordered validators with success/fail hooks
//! - **Anonymity**: promotes candidates that hide the client address
//! - **History**: re-validates every proxy ever promoted
//! - **Vps**: heartbeat registry for helper hosts
//!
//! ## Catalog
//!
//! Crawl tasks, templates and check rules are TOML files.
//! See [`catalog`] for the layouts.

pub mod traits;
pub mod catalog;
pub mod crawler;
pub mod backlog;
pub mod chain;
pub mod scanner;
pub mod anonymity;
pub mod history;
pub mod vps;

#[cfg(test)]
pub(crate) mod testing;

pub use traits::*;
pub use catalog::*;
pub use crawler::*;
pub use backlog::*;
pub use chain::*;
pub use scanner::*;
pub use anonymity::*;
pub use history::*;
pub use vps::*;
