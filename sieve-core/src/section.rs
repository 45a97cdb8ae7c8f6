//! Address ranges ("sections") worth scanning
//!
//! A range covers whole /24 blocks inside a single /16: the first two octets
//! are shared by both bounds and only the third octet varies. Two merge
//! algorithms work on ranges:
//! - [`build_ranges`]: streaming compaction of freshly discovered addresses,
//!   a single pass over sorted input with a stack of open ranges
//! - [`merge_ranges`]: batch compaction of a backlog, a full pairwise join
//!   repeated until the range count stops changing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Invalid range bounds
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range {start}-{end} crosses a /16 boundary")]
    CrossesPrefix { start: Ipv4Addr, end: Ipv4Addr },

    #[error("range start {start} is after end {end}")]
    Inverted { start: Ipv4Addr, end: Ipv4Addr },

    #[error("invalid proxy count {0}")]
    InvalidCount(i64),
}

/// A run of /24 blocks sharing their first two octets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RangeRecord", into = "RangeRecord")]
pub struct AddressRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
    known_proxies: Option<u32>,
}

/// Wire form: `{"start":"1.2.3.0","end":"1.2.5.0","count":-1}`
#[derive(Serialize, Deserialize)]
struct RangeRecord {
    start: Ipv4Addr,
    end: Ipv4Addr,
    count: i64,
}

impl TryFrom<RangeRecord> for AddressRange {
    type Error = RangeError;

    fn try_from(record: RangeRecord) -> Result<Self, Self::Error> {
        let known_proxies = match record.count {
            -1 => None,
            n => Some(u32::try_from(n).map_err(|_| RangeError::InvalidCount(n))?),
        };
        Ok(AddressRange::new(record.start, record.end)?.with_known_proxies(known_proxies))
    }
}

impl From<AddressRange> for RangeRecord {
    fn from(range: AddressRange) -> Self {
        RangeRecord {
            start: range.start,
            end: range.end,
            count: range.known_proxies.map_or(-1, i64::from),
        }
    }
}

fn block_base(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 0)
}

impl AddressRange {
    /// Create a range with unknown proxy count; fourth octets are zeroed
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, RangeError> {
        let (start, end) = (block_base(start), block_base(end));
        let (s, e) = (start.octets(), end.octets());

        if s[..2] != e[..2] {
            return Err(RangeError::CrossesPrefix { start, end });
        }
        if s[2] > e[2] {
            return Err(RangeError::Inverted { start, end });
        }

        Ok(Self {
            start,
            end,
            known_proxies: None,
        })
    }

    /// The single /24 block containing `ip`
    pub fn block(ip: Ipv4Addr) -> Self {
        let base = block_base(ip);
        Self {
            start: base,
            end: base,
            known_proxies: None,
        }
    }

    pub fn with_known_proxies(mut self, count: Option<u32>) -> Self {
        self.known_proxies = count;
        self
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Proxies found by the last scan; `None` when never scanned
    pub fn known_proxies(&self) -> Option<u32> {
        self.known_proxies
    }

    pub fn is_unknown(&self) -> bool {
        self.known_proxies.is_none()
    }

    /// Scanned before and nothing was found
    pub fn is_known_empty(&self) -> bool {
        self.known_proxies == Some(0)
    }

    fn prefix(&self) -> [u8; 2] {
        let [a, b, _, _] = self.start.octets();
        [a, b]
    }

    fn first_block(&self) -> u8 {
        self.start.octets()[2]
    }

    fn last_block(&self) -> u8 {
        self.end.octets()[2]
    }

    /// Whether `ip` lives in the same /16 as this range
    pub fn shares_prefix(&self, ip: Ipv4Addr) -> bool {
        let [a, b, _, _] = ip.octets();
        self.prefix() == [a, b]
    }

    /// Number of /24 blocks covered
    pub fn block_count(&self) -> usize {
        usize::from(self.last_block() - self.first_block()) + 1
    }

    /// Intersection test on the third octet
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.first_block() <= other.last_block() && other.first_block() <= self.last_block()
    }

    /// Third-octet gap between the closer pair of endpoints (0 when overlapping)
    pub fn gap(&self, other: &AddressRange) -> u8 {
        if self.last_block() < other.first_block() {
            other.first_block() - self.last_block()
        } else if other.last_block() < self.first_block() {
            self.first_block() - other.last_block()
        } else {
            0
        }
    }

    /// Same /16 and intersecting or within `distance` blocks
    pub fn can_merge(&self, other: &AddressRange, distance: u8) -> bool {
        self.prefix() == other.prefix()
            && (self.overlaps(other) || self.gap(other) <= distance)
    }

    /// Span covering both ranges; the proxy count becomes unknown again
    pub fn merged(&self, other: &AddressRange) -> AddressRange {
        let [a, b] = self.prefix();
        let first = self.first_block().min(other.first_block());
        let last = self.last_block().max(other.last_block());
        AddressRange {
            start: Ipv4Addr::new(a, b, first, 0),
            end: Ipv4Addr::new(a, b, last, 0),
            known_proxies: None,
        }
    }

    /// Extend toward the block of `ip` when it lies within `distance`
    fn absorb(&mut self, ip: Ipv4Addr, distance: u8) -> bool {
        if !self.shares_prefix(ip) {
            return false;
        }
        let [a, b, c, _] = ip.octets();
        let (first, last) = (self.first_block(), self.last_block());

        if c < first && first - c <= distance {
            self.start = Ipv4Addr::new(a, b, c, 0);
        } else if c > last && c - last <= distance {
            self.end = Ipv4Addr::new(a, b, c, 0);
        } else if c < first || c > last {
            return false;
        }
        true
    }

    /// Number of probes a scan of this range issues
    pub fn probe_count(&self, ports: &[u16]) -> usize {
        self.block_count() * 256 * ports.len()
    }

    /// Every `(address, port)` pair in the range, ports varying fastest
    pub fn probes<'a>(&self, ports: &'a [u16]) -> impl Iterator<Item = SocketAddrV4> + 'a {
        let [a, b] = self.prefix();
        (self.first_block()..=self.last_block()).flat_map(move |c| {
            (0..=u8::MAX).flat_map(move |d| {
                ports
                    .iter()
                    .map(move |&port| SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port))
            })
        })
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Compact discovered addresses into ranges of unknown proxy count.
///
/// Addresses are sorted numerically first. Only the top of the stack is
/// considered for each address, so the result depends on sort order.
pub fn build_ranges(ips: &[Ipv4Addr], distance: u8) -> Vec<AddressRange> {
    let mut sorted = ips.to_vec();
    sorted.sort_unstable();

    let mut stack: Vec<AddressRange> = Vec::new();
    for ip in sorted {
        let absorbed = match stack.last_mut() {
            Some(top) => top.absorb(ip, distance),
            None => false,
        };
        if !absorbed {
            stack.push(AddressRange::block(ip));
        }
    }
    stack
}

/// Merge a backlog of ranges until no pass reduces the count.
///
/// Every range is tested against every range already kept in the pass, not
/// just its neighbour. Ranges that merge lose their proxy count.
pub fn merge_ranges(ranges: Vec<AddressRange>, distance: u8) -> Vec<AddressRange> {
    let mut current = ranges;
    loop {
        let before = current.len();
        let mut kept: Vec<AddressRange> = Vec::with_capacity(before);

        for range in current {
            match kept.iter_mut().find(|k| k.can_merge(&range, distance)) {
                Some(existing) => *existing = existing.merged(&range),
                None => kept.push(range),
            }
        }

        if kept.len() == before {
            return kept;
        }
        current = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str) -> AddressRange {
        AddressRange::new(ip(start), ip(end)).unwrap()
    }

    #[test]
    fn test_new_validates_bounds() {
        let r = range("10.1.4.77", "10.1.9.3");
        assert_eq!(r.start(), ip("10.1.4.0"));
        assert_eq!(r.end(), ip("10.1.9.0"));
        assert!(r.is_unknown());

        assert!(matches!(
            AddressRange::new(ip("10.1.4.0"), ip("10.2.4.0")),
            Err(RangeError::CrossesPrefix { .. })
        ));
        assert!(matches!(
            AddressRange::new(ip("10.1.9.0"), ip("10.1.4.0")),
            Err(RangeError::Inverted { .. })
        ));
    }

    #[test]
    fn test_build_merges_at_distance() {
        let ips = [ip("10.0.5.1"), ip("10.0.6.20"), ip("10.0.9.7")];

        let merged = build_ranges(&ips, 3);
        assert_eq!(merged, vec![range("10.0.5.0", "10.0.9.0")]);

        let split = build_ranges(&ips, 2);
        assert_eq!(
            split,
            vec![range("10.0.5.0", "10.0.6.0"), range("10.0.9.0", "10.0.9.0")]
        );
    }

    #[test]
    fn test_build_sorts_numerically() {
        // "10.0.10.1" sorts before "10.0.9.1" as a string
        let ips = [ip("10.0.10.1"), ip("10.0.9.1"), ip("10.0.100.1")];
        let ranges = build_ranges(&ips, 1);
        assert_eq!(
            ranges,
            vec![range("10.0.9.0", "10.0.10.0"), range("10.0.100.0", "10.0.100.0")]
        );
    }

    #[test]
    fn test_build_never_crosses_prefix() {
        let ips = [ip("10.0.255.1"), ip("10.1.0.1")];
        let ranges = build_ranges(&ips, 255);
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn test_build_collapses_same_block() {
        let ranges = build_ranges(&[ip("1.2.3.4"), ip("1.2.3.5"), ip("1.2.3.4")], 0);
        assert_eq!(ranges, vec![range("1.2.3.0", "1.2.3.0")]);
        assert!(build_ranges(&[], 3).is_empty());
    }

    #[test]
    fn test_gap_and_overlap() {
        let a = range("10.0.1.0", "10.0.4.0");
        let b = range("10.0.7.0", "10.0.8.0");
        assert_eq!(a.gap(&b), 3);
        assert_eq!(b.gap(&a), 3);
        assert!(!a.overlaps(&b));
        assert!(a.can_merge(&b, 3));
        assert!(!a.can_merge(&b, 2));

        let c = range("10.0.3.0", "10.0.7.0");
        assert!(a.overlaps(&c));
        assert_eq!(a.gap(&c), 0);
    }

    #[test]
    fn test_merge_ranges_full_join() {
        // Mergeable ranges are not neighbours in the input
        let ranges = vec![
            range("10.0.1.0", "10.0.1.0").with_known_proxies(Some(2)),
            range("10.0.20.0", "10.0.20.0"),
            range("10.0.3.0", "10.0.4.0").with_known_proxies(Some(0)),
            range("172.16.1.0", "172.16.1.0").with_known_proxies(Some(5)),
            range("10.0.18.0", "10.0.19.0"),
        ];

        let merged = merge_ranges(ranges, 2);
        assert_eq!(
            merged,
            vec![
                range("10.0.1.0", "10.0.4.0"),
                range("10.0.18.0", "10.0.20.0"),
                range("172.16.1.0", "172.16.1.0").with_known_proxies(Some(5)),
            ]
        );
        assert!(merged[0].is_unknown());
    }

    #[test]
    fn test_merge_ranges_reaches_fixed_point() {
        let ranges = vec![
            range("10.0.10.0", "10.0.10.0"),
            range("10.0.1.0", "10.0.1.0"),
            range("10.0.4.0", "10.0.4.0"),
            range("10.0.7.0", "10.0.7.0"),
        ];

        let once = merge_ranges(ranges, 3);
        assert_eq!(once, vec![range("10.0.1.0", "10.0.10.0")]);

        let twice = merge_ranges(once.clone(), 3);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_merge_keeps_counts_of_untouched_ranges() {
        let ranges = vec![
            range("10.0.1.0", "10.0.1.0").with_known_proxies(Some(1)),
            range("10.0.50.0", "10.0.50.0").with_known_proxies(Some(0)),
        ];
        assert_eq!(merge_ranges(ranges.clone(), 3), ranges);
    }

    #[test]
    fn test_probes_enumerate_cartesian_product() {
        let r = range("10.0.1.0", "10.0.2.0");
        let ports = [80, 8080, 3128];
        assert_eq!(r.probe_count(&ports), 2 * 256 * 3);

        let probes: Vec<_> = r.probes(&ports).collect();
        assert_eq!(probes.len(), r.probe_count(&ports));
        assert_eq!(probes[0], "10.0.1.0:80".parse().unwrap());
        assert_eq!(probes[1], "10.0.1.0:8080".parse().unwrap());
        assert_eq!(probes[3], "10.0.1.1:80".parse().unwrap());
        assert_eq!(*probes.last().unwrap(), "10.0.2.255:3128".parse().unwrap());

        assert_eq!(r.probes(&[]).count(), 0);
    }

    #[test]
    fn test_json_record() {
        let r = range("1.2.3.0", "1.2.5.0");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"start":"1.2.3.0","end":"1.2.5.0","count":-1}"#);

        let scanned: AddressRange =
            serde_json::from_str(r#"{"start":"1.2.3.0","end":"1.2.5.0","count":7}"#).unwrap();
        assert_eq!(scanned.known_proxies(), Some(7));

        assert!(serde_json::from_str::<AddressRange>(
            r#"{"start":"1.2.3.0","end":"1.3.5.0","count":-1}"#
        )
        .is_err());
    }
}
