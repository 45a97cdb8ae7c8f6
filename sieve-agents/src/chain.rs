//! Validation chain
//!
//! Runs every validator in order against one candidate and fires its
//! success or fail hook. The pass count is the chain's verdict.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, error, info};

use sieve_core::{CheckRule, Proxy, CHECK_QUEUE};
use sieve_net::{check_rule, Transport};
use sieve_store::{push_record, Store};

use crate::Validator;

/// Ordered validators sharing one candidate
#[derive(Clone, Default)]
pub struct ValidationChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidationChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every stage; returns how many passed
    pub async fn run(&self, proxy: &Proxy) -> usize {
        let mut passed = 0;
        for validator in &self.validators {
            if validator.validate(proxy).await {
                validator.on_success(proxy).await;
                passed += 1;
            } else {
                validator.on_fail(proxy).await;
            }
        }
        passed
    }
}

/// Plain HTTP reachability through the candidate
///
/// Each probe uses one rule picked at random. Passing candidates are queued
/// for the anonymity check.
pub struct ConnectivityCheck {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    rules: Vec<CheckRule>,
    user_agent: String,
}

impl ConnectivityCheck {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        rules: Vec<CheckRule>,
        user_agent: &str,
    ) -> Self {
        Self {
            store,
            transport,
            rules,
            user_agent: user_agent.to_string(),
        }
    }
}

#[async_trait]
impl Validator for ConnectivityCheck {
    fn name(&self) -> &str {
        "connectivity"
    }

    async fn validate(&self, proxy: &Proxy) -> bool {
        let Some(rule) = self.rules.choose(&mut rand::thread_rng()).cloned() else {
            return false;
        };
        check_rule(
            self.transport.as_ref(),
            &rule,
            proxy.socket_addr(),
            &self.user_agent,
        )
        .await
    }

    async fn on_success(&self, proxy: &Proxy) {
        info!("Scan found proxy {}", proxy);
        if let Err(e) = push_record(self.store.as_ref(), CHECK_QUEUE, proxy).await {
            error!("Failed to queue {} for checking: {}", proxy, e);
        }
    }

    async fn on_fail(&self, proxy: &Proxy) {
        debug!("{} is not a proxy ({})", proxy, proxy.origin);
    }
}
