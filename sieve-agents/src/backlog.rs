//! Backlog re-merge
//!
//! Once the scan backlog grows past a threshold it is renamed aside,
//! compacted with the fixed-point merge and pushed back. The aside copy is
//! only dropped once every merged range is back; any earlier failure
//! restores it onto the live backlog unchanged.

use std::sync::Arc;
use tracing::{error, info, warn};

use sieve_core::{
    merge_ranges, AddressRange, BACKLOG_MERGE_THRESHOLD, DEFAULT_DISTANCE, SCAN_BACKLOG,
    SCAN_BACKLOG_ASIDE,
};
use sieve_store::{list_records, push_record, Store, StoreError};

use crate::AgentError;

/// What one merge attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Backlog at or below the threshold
    Skipped { pending: usize },
    Merged { before: usize, after: usize },
}

/// Re-compacts the scan backlog
pub struct BacklogMerger {
    store: Arc<dyn Store>,
    distance: u8,
    threshold: usize,
}

impl BacklogMerger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            distance: DEFAULT_DISTANCE,
            threshold: BACKLOG_MERGE_THRESHOLD,
        }
    }

    pub fn with_distance(mut self, distance: u8) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Merge the backlog if it is longer than the threshold
    pub async fn merge_backlog(&self) -> Result<MergeOutcome, AgentError> {
        let pending = self.store.length(SCAN_BACKLOG).await?;
        if pending <= self.threshold {
            return Ok(MergeOutcome::Skipped { pending });
        }
        self.force_merge().await
    }

    /// Merge the backlog regardless of its length
    pub async fn force_merge(&self) -> Result<MergeOutcome, AgentError> {
        match self.store.rename(SCAN_BACKLOG, SCAN_BACKLOG_ASIDE).await {
            Ok(()) => {}
            Err(StoreError::NoSuchKey(_)) => return Ok(MergeOutcome::Skipped { pending: 0 }),
            Err(e) => return Err(e.into()),
        }

        let ranges: Vec<AddressRange> =
            match list_records(self.store.as_ref(), SCAN_BACKLOG_ASIDE).await {
                Ok(ranges) => ranges,
                Err(e) => {
                    warn!("Backlog unreadable, restoring: {}", e);
                    self.restore().await;
                    return Err(e.into());
                }
            };

        let before = ranges.len();
        let merged = merge_ranges(ranges, self.distance);
        let after = merged.len();

        // The aside copy stays until every merged range is back
        for range in &merged {
            if let Err(e) = push_record(self.store.as_ref(), SCAN_BACKLOG, range).await {
                error!("Failed to re-queue merged range {}, restoring: {}", range, e);
                self.restore().await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.store.delete(SCAN_BACKLOG_ASIDE).await {
            warn!("Failed to clear drained backlog: {}", e);
            return Err(e.into());
        }

        info!("Backlog merged: {} ranges -> {}", before, after);
        Ok(MergeOutcome::Merged { before, after })
    }

    /// Move everything left aside back to the head of the live backlog
    async fn restore(&self) {
        let mut restored = 0;
        loop {
            match self
                .store
                .pop_right_push_left(SCAN_BACKLOG_ASIDE, SCAN_BACKLOG)
                .await
            {
                Ok(Some(_)) => restored += 1,
                Ok(None) => break,
                Err(e) => {
                    error!("Backlog restore stopped after {} entries: {}", restored, e);
                    return;
                }
            }
        }
        info!("Restored {} backlog entries", restored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sieve_store::MemoryStore;
    use std::net::Ipv4Addr;

    /// Memory store whose appends to the live backlog always fail
    struct RejectingPushes(MemoryStore);

    #[async_trait]
    impl Store for RejectingPushes {
        async fn push_right(&self, key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable(format!("push to {} refused", key)))
        }

        async fn pop_left(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.pop_left(key).await
        }

        async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
            self.0.range(key, start, stop).await
        }

        async fn length(&self, key: &str) -> Result<usize, StoreError> {
            self.0.length(key).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
            self.0.rename(from, to).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }

        async fn pop_right_push_left(&self, from: &str, to: &str) -> Result<Option<String>, StoreError> {
            self.0.pop_right_push_left(from, to).await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.0.set_add(key, member).await
        }

        async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.0.set_is_member(key, member).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.0.set_members(key).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.0.set(key, value).await
        }

        async fn incr(&self, key: &str) -> Result<i64, StoreError> {
            self.0.incr(key).await
        }
    }

    fn block(a: u8, b: u8, c: u8) -> AddressRange {
        AddressRange::block(Ipv4Addr::new(a, b, c, 0))
    }

    async fn seed(store: &MemoryStore, ranges: &[AddressRange]) {
        for range in ranges {
            push_record(store, SCAN_BACKLOG, range).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_below_threshold_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[block(1, 1, 1), block(1, 1, 2)]).await;

        let merger = BacklogMerger::new(store.clone());
        let outcome = merger.merge_backlog().await.unwrap();

        assert_eq!(outcome, MergeOutcome::Skipped { pending: 2 });
        assert_eq!(store.length(SCAN_BACKLOG).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_merge_above_threshold() {
        let store = Arc::new(MemoryStore::new());
        // two clusters in 10.0/16 plus one in 10.1/16
        seed(
            &store,
            &[block(10, 0, 1), block(10, 1, 1), block(10, 0, 50), block(10, 0, 3), block(10, 0, 52)],
        )
        .await;

        let merger = BacklogMerger::new(store.clone()).with_threshold(4);
        let outcome = merger.merge_backlog().await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { before: 5, after: 3 });

        let ranges: Vec<AddressRange> = list_records(store.as_ref(), SCAN_BACKLOG).await.unwrap();
        let mut shown: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        shown.sort();
        assert_eq!(shown, vec!["10.0.1.0-10.0.3.0", "10.0.50.0-10.0.52.0", "10.1.1.0-10.1.1.0"]);
        assert!(ranges.iter().all(|r| r.is_unknown()));
        assert_eq!(store.length(SCAN_BACKLOG_ASIDE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_merge_twice_is_stable() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[block(10, 0, 1), block(10, 0, 4), block(10, 0, 30)]).await;

        let merger = BacklogMerger::new(store.clone()).with_threshold(0);
        merger.force_merge().await.unwrap();
        let first: Vec<AddressRange> = list_records(store.as_ref(), SCAN_BACKLOG).await.unwrap();

        let outcome = merger.force_merge().await.unwrap();
        let second: Vec<AddressRange> = list_records(store.as_ref(), SCAN_BACKLOG).await.unwrap();

        assert_eq!(outcome, MergeOutcome::Merged { before: 2, after: 2 });
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_undecodable_entry_restores_everything() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[block(10, 0, 1), block(10, 0, 2)]).await;
        store.push_right(SCAN_BACKLOG, "garbage").await.unwrap();
        let before = store.range(SCAN_BACKLOG, 0, -1).await.unwrap();

        let merger = BacklogMerger::new(store.clone()).with_threshold(1);
        assert!(merger.merge_backlog().await.is_err());

        assert_eq!(store.range(SCAN_BACKLOG, 0, -1).await.unwrap(), before);
        assert_eq!(store.length(SCAN_BACKLOG_ASIDE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_backlog_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let merger = BacklogMerger::new(store);
        assert_eq!(
            merger.force_merge().await.unwrap(),
            MergeOutcome::Skipped { pending: 0 }
        );
    }

    #[tokio::test]
    async fn test_failed_requeue_keeps_every_range() {
        let inner = MemoryStore::new();
        let ranges = [block(10, 0, 1), block(10, 0, 2), block(10, 7, 9)];
        seed(&inner, &ranges).await;
        let before = inner.range(SCAN_BACKLOG, 0, -1).await.unwrap();

        let store = Arc::new(RejectingPushes(inner));
        let merger = BacklogMerger::new(store.clone()).with_threshold(0);
        let result = merger.force_merge().await;

        assert!(matches!(result, Err(AgentError::Store(StoreError::Unavailable(_)))));
        assert_eq!(store.range(SCAN_BACKLOG, 0, -1).await.unwrap(), before);
        assert_eq!(store.length(SCAN_BACKLOG_ASIDE).await.unwrap(), 0);
    }
}
