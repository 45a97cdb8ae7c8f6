//! Scan Scheduler
//!
//! One cycle per backlog range:
//! - IDLE: pop a range, polling while the backlog is empty
//! - EXPAND: lazily enumerate every address of the range times every port
//! - DISPATCH: feed probes through a bounded channel to the worker pool
//! - COLLECT: wait for exactly one outcome per dispatched probe
//! - REQUEUE: push the range back with its new count, or prune it
//!
//! Workers are persistent and share one task receiver. Each probe carries
//! the reply sender of the cycle that dispatched it.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sieve_core::{AddressRange, Proxy, SCAN_BACKLOG};
use sieve_store::{pop_record, push_record, Store};

use crate::{AgentConfig, AgentError, BacklogMerger, ValidationChain};

/// One `(address, port)` probe
#[derive(Debug)]
pub struct ProbeTask {
    pub addr: SocketAddrV4,
    reply: mpsc::Sender<ProbeOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub addr: SocketAddrV4,
    pub live: bool,
}

/// Totals of one scan cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Probes dispatched and collected
    pub tasks: usize,
    /// Probes that passed the validation chain
    pub live: usize,
    /// Whether the range went back onto the backlog
    pub requeued: bool,
}

/// Whether a scanned range goes back onto the backlog
///
/// A range known to be empty that stays empty is pruned.
pub fn should_requeue(prior: Option<u32>, found: usize) -> bool {
    prior != Some(0) || found > 0
}

/// Live count as stored on a range, saturating at `u32::MAX`
fn stored_count(live: usize) -> u32 {
    u32::try_from(live).unwrap_or(u32::MAX)
}

/// Backlog-driven range scanner with a fixed worker pool
pub struct ScanScheduler {
    config: AgentConfig,
    store: Arc<dyn Store>,
    merger: BacklogMerger,
    ports: Arc<[u16]>,
    tasks: mpsc::Sender<ProbeTask>,
    workers: Vec<JoinHandle<()>>,
    idle_delay: Duration,
}

impl ScanScheduler {
    /// Spawn the worker pool; must be called inside a tokio runtime
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn Store>,
        chain: ValidationChain,
        ports: Vec<u16>,
    ) -> Self {
        let (tasks, receiver) = mpsc::channel(config.queue_size);
        let receiver = Arc::new(Mutex::new(receiver));
        let chain = Arc::new(chain);

        let workers = (0..config.workers)
            .map(|i| {
                let worker_id = format!("{}-{}", config.id, i + 1);
                tokio::spawn(probe_worker(worker_id, receiver.clone(), chain.clone()))
            })
            .collect();

        info!(
            "Scanner {} started {} workers over {} ports",
            config.id,
            config.workers,
            ports.len()
        );

        Self {
            merger: BacklogMerger::new(store.clone()),
            config,
            store,
            ports: ports.into(),
            tasks,
            workers,
            idle_delay: Duration::from_secs(5),
        }
    }

    pub fn with_merger(mut self, merger: BacklogMerger) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Scan ranges until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Scanner {} running", self.config.id);

        while !cancel.is_cancelled() {
            let idle = match self.run_cycle(&cancel).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(AgentError::Cancelled) => break,
                Err(e) => {
                    error!("Scan cycle failed: {}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_delay) => {}
                }
            }
        }

        info!("Scanner {} stopped", self.config.id);
    }

    /// Merge the backlog if due, then scan one range; `None` when idle
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<Option<ScanSummary>, AgentError> {
        if let Err(e) = self.merger.merge_backlog().await {
            warn!("Backlog merge failed: {}", e);
        }

        let Some(range) = pop_record::<AddressRange>(self.store.as_ref(), SCAN_BACKLOG).await? else {
            debug!("Scan backlog empty");
            return Ok(None);
        };

        self.scan_range(&range, cancel).await.map(Some)
    }

    /// Scan one range and requeue or prune it
    pub async fn scan_range(
        &self,
        range: &AddressRange,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, AgentError> {
        let expected = range.probe_count(&self.ports);
        info!("Scanning {}: {} probes", range, expected);

        let (live, collected) = match self.dispatch_and_collect(range, expected, cancel).await {
            Ok(counts) => counts,
            Err(e) => {
                // Interrupted ranges go back untouched
                if let Err(push) = push_record(self.store.as_ref(), SCAN_BACKLOG, range).await {
                    error!("Lost range {} after failed scan: {}", range, push);
                }
                return Err(e);
            }
        };
        info!("Range {} done: {} of {} probes live", range, live, collected);

        let requeued = should_requeue(range.known_proxies(), live);
        if requeued {
            let updated = range.with_known_proxies(Some(stored_count(live)));
            push_record(self.store.as_ref(), SCAN_BACKLOG, &updated).await?;
        } else {
            info!("Pruning dead range {}", range);
        }

        Ok(ScanSummary {
            tasks: collected,
            live,
            requeued,
        })
    }

    /// Dispatch every probe and block until `expected` outcomes arrive
    async fn dispatch_and_collect(
        &self,
        range: &AddressRange,
        expected: usize,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), AgentError> {
        let (reply, mut outcomes) = mpsc::channel(self.config.queue_size);

        let dispatcher = {
            let range = *range;
            let ports = self.ports.clone();
            let tasks = self.tasks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for addr in range.probes(&ports) {
                    let task = ProbeTask {
                        addr,
                        reply: reply.clone(),
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sent = tasks.send(task) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        let mut received = 0;
        let mut live = 0;
        while received < expected {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    dispatcher.abort();
                    return Err(AgentError::Cancelled);
                }
                outcome = outcomes.recv() => match outcome {
                    Some(outcome) => {
                        received += 1;
                        if outcome.live {
                            live += 1;
                        }
                    }
                    None => {
                        error!("Scan workers gone after {} of {} outcomes", received, expected);
                        return Err(AgentError::PoolClosed);
                    }
                }
            }
        }

        if let Err(e) = dispatcher.await {
            warn!("Dispatcher ended abnormally: {}", e);
        }
        Ok((live, received))
    }
}

impl Drop for ScanScheduler {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn probe_worker(
    worker_id: String,
    receiver: Arc<Mutex<mpsc::Receiver<ProbeTask>>>,
    chain: Arc<ValidationChain>,
) {
    debug!("Scan worker {} started", worker_id);
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };

        let proxy = Proxy::scanned(*task.addr.ip(), task.addr.port());
        let live = chain.run(&proxy).await > 0;

        // The cycle may have been cancelled; its outcome no longer matters
        let _ = task.reply.send(ProbeOutcome { addr: task.addr, live }).await;
    }
    debug!("Scan worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::ConnectivityCheck;
    use sieve_core::{CheckRule, CHECK_QUEUE};
    use sieve_store::{list_records, MemoryStore};
    use std::net::Ipv4Addr;

    const CHECK_URL: &str = "http://check.test/";

    fn scheduler(store: Arc<MemoryStore>, live: &[SocketAddrV4], ports: Vec<u16>) -> ScanScheduler {
        let mut transport = ScriptedTransport::new().with_page(CHECK_URL, "proxy ok");
        for addr in live {
            transport = transport.with_live(*addr);
        }
        let rules = vec![CheckRule::new(CHECK_URL, "proxy ok")];
        let check = ConnectivityCheck::new(store.clone(), Arc::new(transport), rules, "ua");
        let chain = ValidationChain::new().with(Arc::new(check));

        ScanScheduler::new(
            AgentConfig::default().with_id("scan").with_queue_size(16),
            store,
            chain,
            ports,
        )
    }

    fn block(c: u8) -> AddressRange {
        AddressRange::block(Ipv4Addr::new(10, 9, c, 0))
    }

    #[test]
    fn test_requeue_policy() {
        assert!(should_requeue(None, 0));
        assert!(should_requeue(None, 3));
        assert!(should_requeue(Some(2), 0));
        assert!(should_requeue(Some(0), 1));
        assert!(!should_requeue(Some(0), 0));
    }

    #[tokio::test]
    async fn test_barrier_collects_every_outcome() {
        let store = Arc::new(MemoryStore::new());
        let live = [
            SocketAddrV4::new(Ipv4Addr::new(10, 9, 1, 7), 80),
            SocketAddrV4::new(Ipv4Addr::new(10, 9, 2, 200), 8080),
        ];
        let scanner = scheduler(store.clone(), &live, vec![80, 8080]);

        let range = AddressRange::new(Ipv4Addr::new(10, 9, 1, 0), Ipv4Addr::new(10, 9, 2, 0)).unwrap();
        let summary = scanner.scan_range(&range, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.tasks, 2 * 256 * 2);
        assert_eq!(summary.live, 2);
        assert!(summary.requeued);

        let queued: Vec<Proxy> = list_records(store.as_ref(), CHECK_QUEUE).await.unwrap();
        assert_eq!(queued.len(), 2);

        let backlog: Vec<AddressRange> = list_records(store.as_ref(), SCAN_BACKLOG).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].known_proxies(), Some(2));
    }

    #[tokio::test]
    async fn test_zero_tasks_completes_immediately() {
        let store = Arc::new(MemoryStore::new());
        let scanner = scheduler(store.clone(), &[], Vec::new());

        let summary = scanner.scan_range(&block(1), &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.tasks, 0);
        assert_eq!(summary.live, 0);
    }

    #[tokio::test]
    async fn test_unknown_empty_range_requeued_with_zero() {
        let store = Arc::new(MemoryStore::new());
        let scanner = scheduler(store.clone(), &[], vec![3128]);

        let summary = scanner.scan_range(&block(4), &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.live, 0);
        assert!(summary.requeued);

        let backlog: Vec<AddressRange> = list_records(store.as_ref(), SCAN_BACKLOG).await.unwrap();
        assert_eq!(backlog[0].known_proxies(), Some(0));
    }

    #[test]
    fn test_stored_count_saturates() {
        assert_eq!(stored_count(0), 0);
        assert_eq!(stored_count(42), 42);
        assert_eq!(stored_count(u32::MAX as usize), u32::MAX);
        assert_eq!(stored_count(usize::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_known_empty_range_is_pruned() {
        let store = Arc::new(MemoryStore::new());
        let scanner = scheduler(store.clone(), &[], vec![3128]);

        let range = block(4).with_known_proxies(Some(0));
        let summary = scanner.scan_range(&range, &CancellationToken::new()).await.unwrap();
        assert!(!summary.requeued);
        assert_eq!(store.length(SCAN_BACKLOG).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cycle_pops_from_backlog() {
        let store = Arc::new(MemoryStore::new());
        let scanner = scheduler(store.clone(), &[], vec![80]);
        let cancel = CancellationToken::new();

        assert_eq!(scanner.run_cycle(&cancel).await.unwrap(), None);

        push_record(store.as_ref(), SCAN_BACKLOG, &block(8)).await.unwrap();
        let summary = scanner.run_cycle(&cancel).await.unwrap().unwrap();
        assert_eq!(summary.tasks, 256);
        assert_eq!(store.length(SCAN_BACKLOG).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scan_restores_range() {
        let store = Arc::new(MemoryStore::new());
        let scanner = scheduler(store.clone(), &[], vec![80]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scanner.scan_range(&block(1), &cancel).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));

        let backlog: Vec<AddressRange> = list_records(store.as_ref(), SCAN_BACKLOG).await.unwrap();
        assert_eq!(backlog, vec![block(1)]);
    }
}
