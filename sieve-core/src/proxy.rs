//! Proxy records
//!
//! A proxy is identified by its address and port; the origin only records
//! how it was discovered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use thiserror::Error;

/// How a proxy candidate was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Extracted from a crawled proxy-list page
    #[default]
    Crawled,
    /// Found by scanning an address range
    Scanned,
}

impl Origin {
    /// Short tag used in per-day counter keys
    pub fn tag(&self) -> &'static str {
        match self {
            Origin::Crawled => "craw",
            Origin::Scanned => "scan",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Errors parsing a proxy from text
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyParseError {
    #[error("missing ':' separator in {0:?}")]
    MissingPort(String),

    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// A candidate HTTP proxy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Proxy {
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub origin: Origin,
}

impl Proxy {
    pub fn new(address: Ipv4Addr, port: u16, origin: Origin) -> Self {
        Self {
            address,
            port,
            origin,
        }
    }

    pub fn crawled(address: Ipv4Addr, port: u16) -> Self {
        Self::new(address, port, Origin::Crawled)
    }

    pub fn scanned(address: Ipv4Addr, port: u16) -> Self {
        Self::new(address, port, Origin::Scanned)
    }

    /// Socket address to route requests through
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }

    /// Parse an `ip` and a `port` string pair
    pub fn from_parts(ip: &str, port: &str, origin: Origin) -> Result<Self, ProxyParseError> {
        let address = ip
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ProxyParseError::InvalidAddress(ip.trim().to_string()))?;
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| ProxyParseError::InvalidPort(port.trim().to_string()))?;
        Ok(Self::new(address, port, origin))
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

/// Pool member form: `a.b.c.d:port`
impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for Proxy {
    type Err = ProxyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| ProxyParseError::MissingPort(s.to_string()))?;
        Self::from_parts(ip, port, Origin::Crawled)
    }
}
