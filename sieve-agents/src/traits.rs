//! Common traits for pipeline agents

use async_trait::async_trait;
use sieve_core::{ExtractError, Proxy};
use sieve_net::ProbeError;
use sieve_store::StoreError;
use thiserror::Error;

/// Errors from agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Network error: {0}")]
    Network(#[from] ProbeError),

    #[error("Worker pool closed")]
    PoolClosed,

    #[error("Cancelled")]
    Cancelled,
}

/// One stage of a validation chain
#[async_trait]
pub trait Validator: Send + Sync {
    /// Stage name for logs
    fn name(&self) -> &str;

    /// Probe the candidate
    async fn validate(&self, proxy: &Proxy) -> bool;

    /// Called after `validate` passed
    async fn on_success(&self, proxy: &Proxy);

    /// Called after `validate` failed
    async fn on_fail(&self, proxy: &Proxy);
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Unique agent ID
    pub id: String,
    /// Number of concurrent workers
    pub workers: usize,
    /// Capacity of the bounded work channel
    pub queue_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            workers: 3,
            queue_size: 100,
        }
    }
}

impl AgentConfig {
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Non-positive counts fall back to the defaults
    pub fn with_workers(mut self, workers: usize) -> Self {
        if workers > 0 {
            self.workers = workers;
        }
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        if queue_size > 0 {
            self.queue_size = queue_size;
        }
        self
    }
}
