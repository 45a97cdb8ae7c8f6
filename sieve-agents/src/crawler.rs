//! Frontier Crawler
//!
//! Walks proxy-list pages depth-first from a set of seed tasks.
//! - Candidates extracted from a page go to the candidate queue
//! - Their addresses are compacted into ranges for the scan backlog
//! - `page` results become child tasks one level deeper

use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use sieve_core::{
    build_ranges, CrawlTemplate, ExtractionResult, Origin, Proxy, ResultKind, CHECK_QUEUE,
    DEFAULT_DISTANCE, SCAN_BACKLOG,
};
use sieve_net::{ProbeRequest, Transport, DEFAULT_USER_AGENT};
use sieve_store::{push_record, Store};

use crate::{AgentConfig, AgentError};

/// A node of the crawl frontier
#[derive(Debug, Clone)]
pub struct CrawlTask {
    pub url: String,
    /// Falls back to the crawler's user agent when `None`
    pub user_agent: Option<String>,
    pub template: Arc<CrawlTemplate>,
    /// Upper bound of the politeness delay before fetching
    pub wait_secs: u64,
    pub depth: u32,
    pub max_depth: u32,
}

impl CrawlTask {
    pub fn seed(url: &str, template: Arc<CrawlTemplate>, max_depth: u32) -> Self {
        Self {
            url: url.to_string(),
            user_agent: None,
            template,
            wait_secs: 0,
            depth: 0,
            max_depth,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        if !user_agent.is_empty() {
            self.user_agent = Some(user_agent.to_string());
        }
        self
    }

    pub fn with_wait(mut self, wait_secs: u64) -> Self {
        self.wait_secs = wait_secs;
        self
    }

    /// Follow-up task one level deeper, inheriting everything but the URL
    pub fn child(&self, url: String) -> Self {
        Self {
            url,
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.depth >= self.max_depth
    }
}

/// Totals of one crawl run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Pages fetched and extracted
    pub pages: usize,
    /// Tasks aborted by a fetch or extraction failure
    pub failures: usize,
    /// Candidates queued for checking
    pub proxies: usize,
    /// Ranges queued for scanning
    pub ranges: usize,
}

/// Routed contents of one extracted page
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Harvest {
    pub proxies: Vec<Proxy>,
    /// Every address seen, whether or not its port parsed
    pub ips: Vec<Ipv4Addr>,
    pub pages: Vec<String>,
}

/// Route extraction results by entry name
///
/// `ip_port` wins over separate `ip`/`port` results. A single `port` value
/// applies to every `ip`; otherwise ports pair with ips by position.
pub fn harvest(results: &[ExtractionResult]) -> Harvest {
    let by_name: HashMap<&str, &ExtractionResult> = results
        .iter()
        .filter(|r| r.kind != ResultKind::Empty)
        .map(|r| (r.name.as_str(), r))
        .collect();

    let mut harvest = Harvest::default();

    if let Some(combined) = by_name.get("ip_port") {
        for pair in combined.values() {
            let Some((ip, port)) = pair.split_once(':') else {
                warn!("Skipping {:?}: no port", pair);
                continue;
            };
            harvest.collect(ip, port);
        }
    } else if let (Some(ips), Some(ports)) = (by_name.get("ip"), by_name.get("port")) {
        let ports: Vec<&str> = ports.values().collect();
        for (i, ip) in ips.values().enumerate() {
            let port = if ports.len() == 1 { ports.first() } else { ports.get(i) };
            match port {
                Some(port) => harvest.collect(ip, port),
                None => {
                    warn!("Skipping {}: no port at position {}", ip, i);
                    harvest.note_ip(ip);
                }
            }
        }
    }

    if let Some(pages) = by_name.get("page") {
        harvest.pages = pages.values().map(str::to_string).collect();
    }

    harvest
}

impl Harvest {
    fn note_ip(&mut self, ip: &str) {
        if let Ok(addr) = ip.trim().parse::<Ipv4Addr>() {
            self.ips.push(addr);
        }
    }

    fn collect(&mut self, ip: &str, port: &str) {
        self.note_ip(ip);
        match Proxy::from_parts(ip, port, Origin::Crawled) {
            Ok(proxy) => self.proxies.push(proxy),
            Err(e) => warn!("Skipping {}:{}: {}", ip.trim(), port.trim(), e),
        }
    }
}

/// Resolve a discovered link against the page it was found on
fn resolve(base: &str, link: &str) -> Option<String> {
    let resolved = match Url::parse(base) {
        Ok(base) => base.join(link),
        Err(_) => Url::parse(link),
    };
    resolved.ok().map(String::from)
}

/// Depth-first crawler over an explicit work-list
pub struct FrontierCrawler {
    config: AgentConfig,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    user_agent: String,
    distance: u8,
}

impl FrontierCrawler {
    pub fn new(config: AgentConfig, store: Arc<dyn Store>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            store,
            transport,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            distance: DEFAULT_DISTANCE,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        if !user_agent.is_empty() {
            self.user_agent = user_agent.to_string();
        }
        self
    }

    pub fn with_distance(mut self, distance: u8) -> Self {
        self.distance = distance;
        self
    }

    /// Crawl every seed and its descendants
    pub async fn crawl(&self, seeds: &[CrawlTask], cancel: &CancellationToken) -> CrawlReport {
        let mut report = CrawlReport::default();
        let mut frontier: Vec<CrawlTask> = seeds.iter().rev().cloned().collect();

        info!("Crawler {} starting with {} seeds", self.config.id, seeds.len());

        while let Some(task) = frontier.pop() {
            if cancel.is_cancelled() {
                info!("Crawler {} cancelled", self.config.id);
                break;
            }

            if task.is_terminal() {
                debug!("Dropping {} at depth {}", task.url, task.depth);
                continue;
            }

            if !self.politeness_delay(task.wait_secs, cancel).await {
                break;
            }

            match self.crawl_task(&task, &mut report).await {
                Ok(children) => frontier.extend(children.into_iter().rev()),
                Err(e) => {
                    warn!("Crawl task {} failed: {}", task.url, e);
                    report.failures += 1;
                }
            }
        }

        info!(
            "Crawler {} done: {} pages, {} failures, {} proxies, {} ranges",
            self.config.id, report.pages, report.failures, report.proxies, report.ranges
        );
        report
    }

    /// Sleep up to `wait_secs`; false when cancelled meanwhile
    async fn politeness_delay(&self, wait_secs: u64, cancel: &CancellationToken) -> bool {
        if wait_secs == 0 {
            return true;
        }
        let secs = rand::thread_rng().gen_range(0..wait_secs);

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
        }
    }

    async fn crawl_task(
        &self,
        task: &CrawlTask,
        report: &mut CrawlReport,
    ) -> Result<Vec<CrawlTask>, AgentError> {
        let user_agent = task.user_agent.as_deref().unwrap_or(&self.user_agent);
        let request = ProbeRequest::new(&task.url).user_agent(user_agent);

        let html = self.transport.get(&request).await?;
        let results = task.template.extract(&html)?;
        report.pages += 1;

        let harvest = harvest(&results);
        debug!(
            "{}: {} proxies, {} ips, {} pages",
            task.url,
            harvest.proxies.len(),
            harvest.ips.len(),
            harvest.pages.len()
        );

        for proxy in &harvest.proxies {
            match push_record(self.store.as_ref(), CHECK_QUEUE, proxy).await {
                Ok(()) => report.proxies += 1,
                Err(e) => error!("Failed to queue {}: {}", proxy, e),
            }
        }

        if !harvest.ips.is_empty() {
            for range in build_ranges(&harvest.ips, self.distance) {
                match push_record(self.store.as_ref(), SCAN_BACKLOG, &range).await {
                    Ok(()) => report.ranges += 1,
                    Err(e) => error!("Failed to queue range {}: {}", range, e),
                }
            }
        }

        let children = harvest
            .pages
            .iter()
            .filter_map(|link| match resolve(&task.url, link) {
                Some(url) => Some(task.child(url)),
                None => {
                    warn!("Skipping unresolvable link {:?} on {}", link, task.url);
                    None
                }
            })
            .collect();

        Ok(children)
    }
}
