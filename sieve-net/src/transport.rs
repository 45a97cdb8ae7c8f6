//! Outbound request transport
//!
//! The `Transport` trait is the seam between components and the network;
//! components hold an `Arc<dyn Transport>` and tests substitute a scripted one.

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use std::net::SocketAddrV4;
use tracing::debug;

use crate::{create_client, ProbeConfig, ProbeError};

/// One outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub url: String,
    /// Candidate proxy to relay through; direct when `None`
    pub via: Option<SocketAddrV4>,
    pub user_agent: Option<String>,
    /// Zero means unbounded
    pub max_body_bytes: usize,
}

impl ProbeRequest {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            via: None,
            user_agent: None,
            max_body_bytes: 0,
        }
    }

    pub fn via(mut self, addr: SocketAddrV4) -> Self {
        self.via = Some(addr);
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        if !user_agent.is_empty() {
            self.user_agent = Some(user_agent.to_string());
        }
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }
}

/// GET and HEAD, optionally through a candidate proxy
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the body as text, failing with `BodyTooLarge` past the limit
    async fn get(&self, request: &ProbeRequest) -> Result<String, ProbeError>;

    /// Issue a HEAD request and return the status code
    async fn head(&self, request: &ProbeRequest) -> Result<u16, ProbeError>;
}

/// reqwest-backed transport
///
/// Direct requests share one client; relayed requests need a client per
/// candidate since reqwest binds proxies at build time.
pub struct HttpTransport {
    config: ProbeConfig,
    direct: Client,
}

impl HttpTransport {
    pub fn new(config: ProbeConfig) -> Result<Self, ProbeError> {
        let direct = create_client(&config, None)?;
        Ok(Self { config, direct })
    }

    fn client_for(&self, request: &ProbeRequest) -> Result<Client, ProbeError> {
        match request.via {
            Some(addr) => create_client(&self.config, Some(addr)),
            None => Ok(self.direct.clone()),
        }
    }

    fn builder(
        &self,
        client: &Client,
        method: reqwest::Method,
        request: &ProbeRequest,
    ) -> Result<reqwest::RequestBuilder, ProbeError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", request.url, e)))?;

        let mut builder = client.request(method, url);
        if let Some(ua) = &request.user_agent {
            builder = builder.header(USER_AGENT, ua.as_str());
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &ProbeRequest) -> Result<String, ProbeError> {
        let client = self.client_for(request)?;
        let mut response = self
            .builder(&client, reqwest::Method::GET, request)?
            .send()
            .await?;

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            append_limited(&mut body, &chunk, request.max_body_bytes)?;
        }

        debug!("GET {} returned {} bytes", request.url, body.len());
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn head(&self, request: &ProbeRequest) -> Result<u16, ProbeError> {
        let client = self.client_for(request)?;
        let response = self
            .builder(&client, reqwest::Method::HEAD, request)?
            .send()
            .await?;

        Ok(response.status().as_u16())
    }
}

/// Append a chunk unless the body would grow past `limit`
fn append_limited(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> Result<(), ProbeError> {
    if limit > 0 && body.len() + chunk.len() > limit {
        return Err(ProbeError::BodyTooLarge(limit));
    }
    body.extend_from_slice(chunk);
    Ok(())
}
