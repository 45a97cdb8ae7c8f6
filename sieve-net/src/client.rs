//! HTTP client construction
//!
//! Builds reqwest clients that talk directly or relay through a candidate
//! proxy given as `ip:port`.

use reqwest::{Client, Proxy};
use std::net::SocketAddrV4;
use std::time::Duration;
use thiserror::Error;

/// Probe client configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Sent when a request carries no user agent of its own
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            connect_timeout_secs: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Errors from outbound requests
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Browser-like agent; some list sites and echo pages refuse bare clients
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Create an HTTP client, relaying through `via` when given
pub fn create_client(config: &ProbeConfig, via: Option<SocketAddrV4>) -> Result<Client, ProbeError> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .user_agent(config.user_agent.as_str());

    builder = match via {
        Some(addr) => {
            let proxy = Proxy::all(format!("http://{}", addr))
                .map_err(|e| ProbeError::ClientBuild(e.to_string()))?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| ProbeError::ClientBuild(e.to_string()))
}
