//! History Checker
//!
//! Sweeps the whole history pool on a fixed interval. Each member gets a
//! HEAD request through it against the configured check URLs, and the count
//! of members still alive is published as a gauge.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sieve_core::{Proxy, COUNT_HISTORY, HISTORY_MAX_CHECK_URLS, POOL_HISTORY};
use sieve_net::{head_for_check, ProbeRequest, Transport, DEFAULT_USER_AGENT};
use sieve_store::Store;

use crate::{AgentConfig, AgentError, ValidationChain, Validator};

/// Status a check URL must answer with
pub const HISTORY_EXPECTED_STATUS: u16 = 200;

/// HEAD probe against up to the first few check URLs, stopping at the first pass
pub struct HistoryCheck {
    transport: Arc<dyn Transport>,
    check_urls: Vec<String>,
    user_agent: String,
}

impl HistoryCheck {
    pub fn new(transport: Arc<dyn Transport>, check_urls: Vec<String>) -> Self {
        Self {
            transport,
            check_urls,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        if !user_agent.is_empty() {
            self.user_agent = user_agent.to_string();
        }
        self
    }
}

#[async_trait]
impl Validator for HistoryCheck {
    fn name(&self) -> &str {
        "history"
    }

    async fn validate(&self, proxy: &Proxy) -> bool {
        for url in self.check_urls.iter().take(HISTORY_MAX_CHECK_URLS) {
            let request = ProbeRequest::new(url)
                .via(proxy.socket_addr())
                .user_agent(&self.user_agent);

            if head_for_check(self.transport.as_ref(), &request, HISTORY_EXPECTED_STATUS).await {
                return true;
            }
        }
        false
    }

    async fn on_success(&self, proxy: &Proxy) {
        debug!("History proxy {} still alive", proxy);
    }

    async fn on_fail(&self, proxy: &Proxy) {
        debug!("History proxy {} is down", proxy);
    }
}

/// Totals of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub members: usize,
    pub alive: usize,
}

/// Periodic re-validation of the history pool
pub struct HistoryChecker {
    config: AgentConfig,
    store: Arc<dyn Store>,
    chain: Arc<ValidationChain>,
    interval: Duration,
}

impl HistoryChecker {
    pub fn new(config: AgentConfig, store: Arc<dyn Store>, chain: ValidationChain) -> Self {
        Self {
            config,
            store,
            chain: Arc::new(chain),
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep, publish, sleep; until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("History checker {} running", self.config.id);

        loop {
            match self.sweep(&cancel).await {
                Ok(summary) => info!(
                    "History sweep: {} of {} proxies alive",
                    summary.alive, summary.members
                ),
                Err(AgentError::Cancelled) => break,
                Err(e) => error!("History sweep failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("History checker {} stopped", self.config.id);
    }

    /// Check every history member once and publish the alive count
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepSummary, AgentError> {
        let members = self.store.set_members(POOL_HISTORY).await?;
        let expected = members.len();

        let alive = if expected == 0 {
            0
        } else {
            self.check_members(members, cancel).await?
        };

        self.store.set(COUNT_HISTORY, &alive.to_string()).await?;
        Ok(SweepSummary {
            members: expected,
            alive,
        })
    }

    /// Fan members out over a sweep-scoped pool and count the passes
    async fn check_members(
        &self,
        members: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<usize, AgentError> {
        let expected = members.len();
        let (jobs_tx, jobs_rx) = mpsc::channel::<String>(self.config.queue_size);
        let (results_tx, mut results_rx) = mpsc::channel::<bool>(self.config.queue_size);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let mut pool = JoinSet::new();
        for _ in 0..self.config.workers {
            let jobs = jobs_rx.clone();
            let results = results_tx.clone();
            let chain = self.chain.clone();
            pool.spawn(async move {
                loop {
                    let next = jobs.lock().await.recv().await;
                    let Some(member) = next else {
                        break;
                    };
                    let alive = match member.parse::<Proxy>() {
                        Ok(proxy) => chain.run(&proxy).await > 0,
                        Err(e) => {
                            warn!("Unreadable history member {:?}: {}", member, e);
                            false
                        }
                    };
                    if results.send(alive).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(results_tx);

        pool.spawn(async move {
            for member in members {
                if jobs_tx.send(member).await.is_err() {
                    break;
                }
            }
        });

        let mut received = 0;
        let mut alive = 0;
        let outcome = loop {
            if received == expected {
                break Ok(alive);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(AgentError::Cancelled),
                result = results_rx.recv() => match result {
                    Some(passed) => {
                        received += 1;
                        if passed {
                            alive += 1;
                        }
                    }
                    None => break Err(AgentError::PoolClosed),
                }
            }
        };

        pool.abort_all();
        while pool.join_next().await.is_some() {}
        outcome
    }
}
