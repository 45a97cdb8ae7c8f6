//! Pass/fail probes through a candidate proxy

use sieve_core::CheckRule;
use std::net::SocketAddrV4;
use tracing::debug;

use crate::{ProbeRequest, Transport};

/// GET through the candidate and look for `word` in the body
///
/// Any transport error, including an oversized body, counts as a failure.
pub async fn get_for_check(transport: &dyn Transport, request: &ProbeRequest, word: &str) -> bool {
    match transport.get(request).await {
        Ok(body) => {
            let found = body.contains(word);
            debug!("get for check {} via {:?}: {}", request.url, request.via, found);
            found
        }
        Err(e) => {
            debug!("get for check {} via {:?} failed: {}", request.url, request.via, e);
            false
        }
    }
}

/// HEAD through the candidate and compare the status code
pub async fn head_for_check(transport: &dyn Transport, request: &ProbeRequest, status: u16) -> bool {
    match transport.head(request).await {
        Ok(code) => code == status,
        Err(e) => {
            debug!("head for check {} via {:?} failed: {}", request.url, request.via, e);
            false
        }
    }
}

/// Run one check rule against a candidate
pub async fn check_rule(
    transport: &dyn Transport,
    rule: &CheckRule,
    via: SocketAddrV4,
    default_user_agent: &str,
) -> bool {
    let request = ProbeRequest::new(&rule.url)
        .via(via)
        .user_agent(rule.user_agent_or(default_user_agent))
        .max_body_bytes(rule.max_body_bytes);

    get_for_check(transport, &request, &rule.word).await
}
