//! proxy-sieve store
//!
//! The only state shared between components lives behind the `Store` trait:
//! - Named lists used as work queues
//! - Named sets used as proxy pools
//! - Scalars used as counters and gauges
//!
//! `MemoryStore` keeps everything in process; `RedisStore` talks to Redis.

pub mod store;
pub mod memory;
pub mod redis_store;

pub use store::*;
pub use memory::*;
pub use redis_store::*;
