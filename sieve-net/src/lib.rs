//! proxy-sieve network layer
//!
//! Provides outbound HTTP for crawling and probing:
//! - Clients optionally routed through a candidate HTTP proxy
//! - Bounded body reads and request timeouts
//! - Check helpers that reduce a probe to pass/fail

pub mod client;
pub mod transport;
pub mod probe;

pub use client::*;
pub use transport::*;
pub use probe::*;
