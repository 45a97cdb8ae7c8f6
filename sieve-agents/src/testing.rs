//! Scripted transport for agent tests

use async_trait::async_trait;
use parking_lot::Mutex;
use sieve_net::{ProbeError, ProbeRequest, Transport};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;

/// Serves fixed pages; relayed requests only succeed through live proxies
#[derive(Default)]
pub struct ScriptedTransport {
    pages: HashMap<String, String>,
    statuses: HashMap<String, u16>,
    live: HashSet<SocketAddrV4>,
    requests: Mutex<Vec<ProbeRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }

    pub fn with_live(mut self, addr: SocketAddrV4) -> Self {
        self.live.insert(addr);
        self
    }

    pub fn requests(&self) -> Vec<ProbeRequest> {
        self.requests.lock().clone()
    }

    fn reachable(&self, request: &ProbeRequest) -> Result<(), ProbeError> {
        self.requests.lock().push(request.clone());
        match request.via {
            Some(addr) if !self.live.contains(&addr) => {
                Err(ProbeError::ClientBuild(format!("{} refused", addr)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, request: &ProbeRequest) -> Result<String, ProbeError> {
        self.reachable(request)?;
        let body = self
            .pages
            .get(&request.url)
            .cloned()
            .ok_or_else(|| ProbeError::InvalidUrl(request.url.clone()))?;

        if request.max_body_bytes > 0 && body.len() > request.max_body_bytes {
            return Err(ProbeError::BodyTooLarge(request.max_body_bytes));
        }
        Ok(body)
    }

    async fn head(&self, request: &ProbeRequest) -> Result<u16, ProbeError> {
        self.reachable(request)?;
        Ok(self.statuses.get(&request.url).copied().unwrap_or(404))
    }
}
