//! proxy-sieve core - domain model for proxy discovery
//!
//! This crate provides the pure building blocks:
//! - Proxy records and their provenance
//! - Address ranges with the streaming and batch merge algorithms
//! - The template-driven extraction engine
//! - Connectivity check rules and store key names

pub mod proxy;
pub mod section;
pub mod template;
pub mod rules;
pub mod keys;

pub use proxy::*;
pub use section::*;
pub use template::*;
pub use rules::*;
pub use keys::*;

/// Backlog length above which the backlog is re-merged
pub const BACKLOG_MERGE_THRESHOLD: usize = 100;

/// Word the anonymity probe page must contain
pub const ANONYMITY_CHECK_WORD: &str = "anony";

/// Maximum number of URLs tried per history check
pub const HISTORY_MAX_CHECK_URLS: usize = 4;

/// Seconds a helper host registration stays alive without a heartbeat
pub const VPS_ALIVE_SECS: i64 = 290;

/// Default third-octet distance tolerance for range merging
pub const DEFAULT_DISTANCE: u8 = 3;
