//! Anonymity Checker
//!
//! Drains the candidate queue into a worker pool. A candidate whose probe
//! page shows the leak word is promoted into the valid and history pools and
//! counted against its origin for the day.

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sieve_core::{
    daily_counter_key, Proxy, ANONYMITY_CHECK_WORD, CHECK_QUEUE, POOL_HISTORY, POOL_VALID,
};
use sieve_net::{get_for_check, ProbeRequest, Transport, DEFAULT_USER_AGENT};
use sieve_store::{pop_record, push_record, Store, StoreError};

use crate::{AgentConfig, ValidationChain, Validator};

/// Leak probe through the candidate
pub struct AnonymityCheck {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    check_url: String,
    max_body_bytes: usize,
    user_agent: String,
}

impl AnonymityCheck {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn Transport>, check_url: &str) -> Self {
        Self {
            store,
            transport,
            check_url: check_url.to_string(),
            max_body_bytes: 0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        if !user_agent.is_empty() {
            self.user_agent = user_agent.to_string();
        }
        self
    }

    /// Add to both pools and bump today's counter for the proxy's origin
    pub async fn promote(&self, proxy: &Proxy) -> Result<(), StoreError> {
        let member = proxy.to_string();
        self.store.set_add(POOL_VALID, &member).await?;
        self.store.set_add(POOL_HISTORY, &member).await?;

        let key = daily_counter_key(proxy.origin, Local::now().date_naive());
        self.store.incr(&key).await?;
        Ok(())
    }
}

#[async_trait]
impl Validator for AnonymityCheck {
    fn name(&self) -> &str {
        "anonymity"
    }

    async fn validate(&self, proxy: &Proxy) -> bool {
        let request = ProbeRequest::new(&self.check_url)
            .via(proxy.socket_addr())
            .user_agent(&self.user_agent)
            .max_body_bytes(self.max_body_bytes);

        get_for_check(self.transport.as_ref(), &request, ANONYMITY_CHECK_WORD).await
    }

    async fn on_success(&self, proxy: &Proxy) {
        info!("Found anonymous proxy {} ({})", proxy, proxy.origin);
        if let Err(e) = self.promote(proxy).await {
            error!("Failed to promote {}: {}", proxy, e);
        }
    }

    async fn on_fail(&self, proxy: &Proxy) {
        debug!("{} failed the anonymity check", proxy);
    }
}

/// Candidate queue puller feeding a fixed worker pool
///
/// On cancellation, candidates already popped but not yet checked are
/// pushed back; only checks in flight are lost.
pub struct AnonymityChecker {
    config: AgentConfig,
    store: Arc<dyn Store>,
    chain: Arc<ValidationChain>,
    backoff: Duration,
}

impl AnonymityChecker {
    pub fn new(config: AgentConfig, store: Arc<dyn Store>, chain: ValidationChain) -> Self {
        Self {
            config,
            store,
            chain: Arc::new(chain),
            backoff: Duration::from_secs(5),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn requeue(&self, proxy: &Proxy) {
        if let Err(e) = push_record(self.store.as_ref(), CHECK_QUEUE, proxy).await {
            error!("Lost candidate {} on shutdown: {}", proxy, e);
        }
    }

    /// Pull and check candidates until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel::<Proxy>(self.config.queue_size);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers {
            let rx = rx.clone();
            let chain = self.chain.clone();
            workers.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(proxy) = next else {
                        break;
                    };
                    chain.run(&proxy).await;
                }
            });
        }

        info!(
            "Anonymity checker {} running with {} workers",
            self.config.id, self.config.workers
        );

        // The pop itself is never raced against cancellation; a popped
        // candidate that cannot be handed to a worker goes back to the queue.
        while !cancel.is_cancelled() {
            match pop_record::<Proxy>(self.store.as_ref(), CHECK_QUEUE).await {
                Ok(Some(proxy)) => {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = tx.reserve() => permit.ok(),
                    };
                    match permit {
                        Some(permit) => {
                            permit.send(proxy);
                            continue;
                        }
                        None => {
                            if !cancel.is_cancelled() {
                                error!("Anonymity workers gone");
                            }
                            self.requeue(&proxy).await;
                            break;
                        }
                    }
                }
                Ok(None) => debug!("Candidate queue empty"),
                Err(StoreError::Codec(e)) => {
                    warn!("Dropping undecodable candidate: {}", e);
                    continue;
                }
                Err(e) => error!("Failed to pull candidate: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        drop(tx);
        workers.abort_all();
        while workers.join_next().await.is_some() {}

        // Candidates still buffered for workers go back as well
        let mut returned = 0;
        let mut buffered = rx.lock().await;
        while let Ok(proxy) = buffered.try_recv() {
            self.requeue(&proxy).await;
            returned += 1;
        }
        if returned > 0 {
            info!("Returned {} unchecked candidates to the queue", returned);
        }

        info!("Anonymity checker {} stopped", self.config.id);
    }
}
