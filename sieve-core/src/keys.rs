//! Store key names
//!
//! These match the layout of existing deployments so pools and counters
//! written by earlier runs remain readable.

use crate::proxy::Origin;
use chrono::NaiveDate;

/// Candidate queue (list of JSON proxies)
pub const CHECK_QUEUE: &str = "proxy:q:check";

/// Scan backlog (list of JSON ranges)
pub const SCAN_BACKLOG: &str = "proxy:scan:task";

/// Backlog drained aside during a re-merge
pub const SCAN_BACKLOG_ASIDE: &str = "proxy:scan:task:check";

/// Valid pool (set of `ip:port`)
pub const POOL_VALID: &str = "proxy:pool:valid";

/// History pool (set of `ip:port`)
pub const POOL_HISTORY: &str = "proxy:pool:history";

/// Alive-history gauge
pub const COUNT_HISTORY: &str = "proxy:count:history";

/// Registered helper host names
pub const VPS_SET: &str = "proxy:vps:set";

const COUNT_PREFIX: &str = "proxy:count";
const VPS_DATA_PREFIX: &str = "proxy:vps:data";

/// Per-origin, per-day promotion counter, e.g. `proxy:count:craw:20240131`
pub fn daily_counter_key(origin: Origin, date: NaiveDate) -> String {
    format!("{}:{}:{}", COUNT_PREFIX, origin.tag(), date.format("%Y%m%d"))
}

/// Heartbeat record of one helper host
pub fn vps_data_key(name: &str) -> String {
    format!("{}:{}", VPS_DATA_PREFIX, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_counter_key() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            daily_counter_key(Origin::Crawled, date),
            "proxy:count:craw:20240131"
        );
        assert_eq!(
            daily_counter_key(Origin::Scanned, date),
            "proxy:count:scan:20240131"
        );
    }

    #[test]
    fn test_vps_data_key() {
        assert_eq!(vps_data_key("hk-1"), "proxy:vps:data:hk-1");
    }
}
