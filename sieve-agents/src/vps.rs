//! Helper host registry
//!
//! Helper hosts with rotating public addresses send periodic heartbeats.
//! A host counts as alive for a fixed window after its current address was
//! first reported.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

use sieve_core::{vps_data_key, VPS_ALIVE_SECS, VPS_SET};
use sieve_store::{Store, StoreError};

/// Heartbeat state of one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpsRecord {
    pub address: Ipv4Addr,
    pub port: u16,
    /// Unix seconds when this address was first reported
    pub started_at: i64,
    pub left_secs: i64,
}

impl VpsRecord {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

pub struct VpsRegistry {
    store: Arc<dyn Store>,
    alive_secs: i64,
}

impl VpsRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            alive_secs: VPS_ALIVE_SECS,
        }
    }

    /// Record a heartbeat from `name`
    pub async fn register(&self, name: &str, address: Ipv4Addr, port: u16) -> Result<VpsRecord, StoreError> {
        self.register_at(name, address, port, Utc::now().timestamp()).await
    }

    /// Record a heartbeat observed at `now` (unix seconds)
    pub async fn register_at(
        &self,
        name: &str,
        address: Ipv4Addr,
        port: u16,
        now: i64,
    ) -> Result<VpsRecord, StoreError> {
        self.store.set_add(VPS_SET, name).await?;

        let key = vps_data_key(name);
        let previous = match self.store.get(&key).await? {
            Some(json) => match serde_json::from_str::<VpsRecord>(&json) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Replacing unreadable record of {}: {}", name, e);
                    None
                }
            },
            None => None,
        };

        let record = match previous {
            Some(prev) if prev.address == address && prev.port == port => VpsRecord {
                left_secs: self.alive_secs - (now - prev.started_at),
                ..prev
            },
            _ => {
                info!("Host {} now at {}:{}", name, address, port);
                VpsRecord {
                    address,
                    port,
                    started_at: now,
                    left_secs: self.alive_secs,
                }
            }
        };

        self.store.set(&key, &serde_json::to_string(&record)?).await?;
        Ok(record)
    }

    /// Endpoints of every host still inside its alive window
    pub async fn alive(&self) -> Result<Vec<String>, StoreError> {
        self.alive_at(Utc::now().timestamp()).await
    }

    pub async fn alive_at(&self, now: i64) -> Result<Vec<String>, StoreError> {
        let mut endpoints = Vec::new();

        for name in self.store.set_members(VPS_SET).await? {
            let Some(json) = self.store.get(&vps_data_key(&name)).await? else {
                continue;
            };
            match serde_json::from_str::<VpsRecord>(&json) {
                Ok(record) if now - record.started_at <= self.alive_secs => {
                    endpoints.push(record.endpoint());
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable record of {}: {}", name, e),
            }
        }

        endpoints.sort();
        Ok(endpoints)
    }
}
