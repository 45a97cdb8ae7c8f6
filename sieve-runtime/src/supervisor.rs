//! Loop supervisor
//!
//! Builds the store, transport and agents from [`Settings`] and runs the
//! selected loops until the shared token is cancelled:
//! - crawl: the seed list every `crawl.interval_secs`
//! - scan: backlog ranges through the connectivity chain
//! - anonymity: candidate queue into the valid and history pools
//! - history: periodic re-validation of the history pool

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sieve_agents::{
    load_rules, load_tasks, AgentConfig, AnonymityCheck, AnonymityChecker, BacklogMerger,
    ConfigError, ConnectivityCheck, CrawlReport, CrawlTask, FrontierCrawler, HistoryCheck,
    HistoryChecker, ScanScheduler, TemplateCache, ValidationChain, VpsRegistry,
};
use sieve_core::{
    daily_counter_key, Origin, CHECK_QUEUE, COUNT_HISTORY, POOL_HISTORY, POOL_VALID,
    SCAN_BACKLOG,
};
use sieve_net::{HttpTransport, Transport};
use sieve_store::{MemoryStore, RedisStore, Store};

use crate::settings::{Settings, StoreBackend};

/// Which loops `run` starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Loops {
    pub crawl: bool,
    pub scan: bool,
    pub anonymity: bool,
    pub history: bool,
}

impl Loops {
    pub fn all() -> Self {
        Self {
            crawl: true,
            scan: true,
            anonymity: true,
            history: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.crawl || self.scan || self.anonymity || self.history)
    }
}

/// Queue, pool and counter snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub check_queue: usize,
    pub backlog: usize,
    pub valid: usize,
    pub history: usize,
    pub crawled_today: i64,
    pub scanned_today: i64,
    /// Last published alive-history gauge
    pub history_alive: Option<i64>,
    pub vps: Vec<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "check queue:    {}", self.check_queue)?;
        writeln!(f, "scan backlog:   {}", self.backlog)?;
        writeln!(f, "valid pool:     {}", self.valid)?;
        writeln!(f, "history pool:   {}", self.history)?;
        writeln!(f, "crawled today:  {}", self.crawled_today)?;
        writeln!(f, "scanned today:  {}", self.scanned_today)?;
        match self.history_alive {
            Some(alive) => writeln!(f, "history alive:  {}", alive)?,
            None => writeln!(f, "history alive:  -")?,
        }
        write!(f, "vps alive:      {}", self.vps.len())?;
        for endpoint in &self.vps {
            write!(f, "\n  {}", endpoint)?;
        }
        Ok(())
    }
}

/// Owns the shared capabilities and the cancellation token
pub struct Supervisor {
    settings: Settings,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Connect the configured store and build the HTTP transport
    pub async fn connect(settings: Settings) -> Result<Self, anyhow::Error> {
        let store: Arc<dyn Store> = match settings.store.backend {
            StoreBackend::Memory => {
                warn!("Using the in-process store; nothing survives a restart");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Redis => {
                info!("Connecting to {}", settings.store.url);
                Arc::new(RedisStore::connect(&settings.store.url).await?)
            }
        };
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new((&settings.probe).into())?);

        Ok(Self::with_parts(settings, store, transport))
    }

    pub fn with_parts(
        settings: Settings,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings,
            store,
            transport,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by every loop; cancel it to stop `run`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn merger(&self) -> BacklogMerger {
        BacklogMerger::new(self.store.clone())
            .with_distance(self.settings.crawl.distance)
            .with_threshold(self.settings.scan.merge_threshold)
    }

    pub fn vps(&self) -> VpsRegistry {
        VpsRegistry::new(self.store.clone())
    }

    pub fn crawler(&self) -> FrontierCrawler {
        let crawler = FrontierCrawler::new(
            AgentConfig::default().with_id("crawler"),
            self.store.clone(),
            self.transport.clone(),
        )
        .with_distance(self.settings.crawl.distance);

        crawler.with_user_agent(self.user_agent(&self.settings.crawl.user_agent))
    }

    /// Loop-specific agent, else the probe-wide one
    fn user_agent<'a>(&'a self, own: &'a Option<String>) -> &'a str {
        own.as_deref()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or(&self.settings.probe.user_agent)
    }

    pub fn load_tasks(&self) -> Result<Vec<CrawlTask>, ConfigError> {
        let mut templates = TemplateCache::new(&self.settings.crawl.templates);
        load_tasks(&self.settings.crawl.tasks, &mut templates)
    }

    /// Crawl the seed list once
    pub async fn crawl_once(&self) -> Result<CrawlReport, anyhow::Error> {
        let tasks = self.load_tasks()?;
        Ok(self.crawler().crawl(&tasks, &self.cancel).await)
    }

    pub async fn status(&self) -> Result<StatusReport, anyhow::Error> {
        let today = Local::now().date_naive();
        let store = self.store.as_ref();

        Ok(StatusReport {
            check_queue: store.length(CHECK_QUEUE).await?,
            backlog: store.length(SCAN_BACKLOG).await?,
            valid: store.set_members(POOL_VALID).await?.len(),
            history: store.set_members(POOL_HISTORY).await?.len(),
            crawled_today: read_counter(store, &daily_counter_key(Origin::Crawled, today)).await?,
            scanned_today: read_counter(store, &daily_counter_key(Origin::Scanned, today)).await?,
            history_alive: store
                .get(COUNT_HISTORY)
                .await?
                .and_then(|v| v.parse().ok()),
            vps: self.vps().alive().await?,
        })
    }

    /// Run the selected loops until cancelled
    ///
    /// Every selected loop is built before any is spawned, so a bad file
    /// stops the process without partial startup.
    pub async fn run(&self, loops: Loops) -> Result<(), anyhow::Error> {
        if loops.is_empty() {
            warn!("No loops selected");
            return Ok(());
        }

        let crawl = match loops.crawl {
            true => Some((self.crawler(), self.load_tasks()?)),
            false => None,
        };
        let scanner = loops.scan.then(|| self.scanner()).transpose()?;
        let anonymity = loops.anonymity.then(|| self.anonymity_checker()).transpose()?;
        let history = loops.history.then(|| self.history_checker()).transpose()?;

        let mut set = JoinSet::new();

        if let Some((crawler, tasks)) = crawl {
            let interval = Duration::from_secs(self.settings.crawl.interval_secs);
            let cancel = self.cancel.clone();
            set.spawn(async move {
                crawl_loop(crawler, tasks, interval, cancel).await;
                "crawl"
            });
        }

        if let Some(scanner) = scanner {
            let cancel = self.cancel.clone();
            set.spawn(async move {
                scanner.run(cancel).await;
                "scan"
            });
        }

        if let Some(checker) = anonymity {
            let cancel = self.cancel.clone();
            set.spawn(async move {
                checker.run(cancel).await;
                "anonymity"
            });
        }

        if let Some(checker) = history {
            let cancel = self.cancel.clone();
            set.spawn(async move {
                checker.run(cancel).await;
                "history"
            });
        }

        info!("Supervisor started {} loops", set.len());

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(name) if self.cancel.is_cancelled() => info!("Loop {} stopped", name),
                Ok(name) => {
                    warn!("Loop {} exited early, stopping the rest", name);
                    self.cancel.cancel();
                }
                Err(e) => {
                    error!("Loop task failed: {}", e);
                    self.cancel.cancel();
                }
            }
        }

        info!("Supervisor stopped");
        Ok(())
    }

    fn scanner(&self) -> Result<ScanScheduler, ConfigError> {
        let scan = &self.settings.scan;
        let rules = load_rules(&scan.rules)?;
        let user_agent = self.user_agent(&scan.user_agent);

        let chain = ValidationChain::new().with(Arc::new(ConnectivityCheck::new(
            self.store.clone(),
            self.transport.clone(),
            rules,
            user_agent,
        )));

        let config = AgentConfig::default()
            .with_id("scanner")
            .with_workers(scan.workers)
            .with_queue_size(scan.queue_size);

        Ok(
            ScanScheduler::new(config, self.store.clone(), chain, scan.ports.clone())
                .with_merger(self.merger())
                .with_idle_delay(Duration::from_secs(scan.idle_secs)),
        )
    }

    fn anonymity_checker(&self) -> Result<AnonymityChecker, ConfigError> {
        let anony = &self.settings.checker.anony;
        if anony.check_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "checker.anony.check_url is required for the anonymity loop".into(),
            ));
        }

        let check = AnonymityCheck::new(self.store.clone(), self.transport.clone(), &anony.check_url)
            .with_max_body_bytes(anony.max_body_bytes)
            .with_user_agent(self.user_agent(&anony.user_agent));
        let config = AgentConfig::default()
            .with_id("anony")
            .with_workers(anony.workers)
            .with_queue_size(anony.queue_size);

        Ok(AnonymityChecker::new(
            config,
            self.store.clone(),
            ValidationChain::new().with(Arc::new(check)),
        )
        .with_backoff(Duration::from_secs(anony.backoff_secs)))
    }

    fn history_checker(&self) -> Result<HistoryChecker, ConfigError> {
        let history = &self.settings.checker.history;
        if history.check_urls.is_empty() {
            return Err(ConfigError::Invalid(
                "checker.history.check_urls is required for the history loop".into(),
            ));
        }

        let check = HistoryCheck::new(self.transport.clone(), history.check_urls.clone())
            .with_user_agent(self.user_agent(&history.user_agent));
        let config = AgentConfig::default()
            .with_id("history")
            .with_workers(history.workers)
            .with_queue_size(history.queue_size);

        Ok(HistoryChecker::new(
            config,
            self.store.clone(),
            ValidationChain::new().with(Arc::new(check)),
        )
        .with_interval(Duration::from_secs(history.interval_secs)))
    }
}

async fn read_counter(store: &dyn Store, key: &str) -> Result<i64, sieve_store::StoreError> {
    Ok(store
        .get(key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

async fn crawl_loop(
    crawler: FrontierCrawler,
    tasks: Vec<CrawlTask>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let report = crawler.crawl(&tasks, &cancel).await;
        info!(
            "Crawl pass: {} pages, {} proxies, {} ranges",
            report.pages, report.proxies, report.ranges
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
