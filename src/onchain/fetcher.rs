//! Batched, cache-aware pool reads.
//!
//! `BatchFetcher` owns the TTL cache. A batch is split into fresh ids
//! (served from cache, no read issued) and stale ids (missing or expired).
//! Stale ids are read concurrently, one read per id, or in a single
//! `read_pools` call when the reader batches. Either way each id is
//! isolated: a failed read is logged and replaced with
//! `ContractSnapshot::fallback()`, it never fails the batch and is not
//! retried within it.

use crate::clock::Clock;
use crate::onchain::cache::{Lookup, TtlCache};
use crate::onchain::client::{PoolReader, ReadError};
use crate::pool::{ContractSnapshot, PoolId};
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a batch value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Fresh cache hit, no read issued.
    Cached,
    /// Successful read, written back to the cache.
    Read,
    /// Read failed, fallback value substituted.
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPool {
    pub id: PoolId,
    pub snapshot: ContractSnapshot,
    pub origin: Origin,
}

/// Per-batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub hits: usize,
    pub reads: usize,
    pub failures: usize,
}

impl BatchReport {
    pub fn record(&mut self, origin: Origin) {
        match origin {
            Origin::Cached => self.hits += 1,
            Origin::Read => self.reads += 1,
            Origin::Fallback => self.failures += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.hits + self.reads + self.failures
    }

    /// Every id in a non-empty batch fell back.
    pub fn all_failed(&self) -> bool {
        self.failures > 0 && self.failures == self.total()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub values: HashMap<PoolId, FetchedPool>,
    pub report: BatchReport,
}

impl BatchResult {
    pub fn get(&self, id: &PoolId) -> Option<&ContractSnapshot> {
        self.values.get(id).map(|f| &f.snapshot)
    }
}

pub struct BatchFetcher {
    reader: Arc<dyn PoolReader>,
    cache: TtlCache<ContractSnapshot>,
    /// Stamps cache writes at read completion. Without it a read is stamped
    /// with its batch's `now`.
    clock: Option<Arc<dyn Clock>>,
}

impl BatchFetcher {
    pub fn new(reader: Arc<dyn PoolReader>, ttl: Duration) -> Self {
        Self {
            reader,
            cache: TtlCache::new(ttl),
            clock: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.cache.ttl()
    }

    /// Drop the cached read for `id` so the next batch reads it again.
    pub fn invalidate(&self, id: &PoolId) -> bool {
        self.cache.invalidate(id)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Fetch a batch and collect it into a complete id → value mapping.
    pub async fn fetch_many(&self, ids: &[PoolId], now_ms: u64) -> BatchResult {
        let mut result = BatchResult::default();
        let items = self.fetch_stream(ids, now_ms);
        futures::pin_mut!(items);
        while let Some(item) = items.next().await {
            result.report.record(item.origin);
            result.values.insert(item.id.clone(), item);
        }

        debug!(
            hits = result.report.hits,
            reads = result.report.reads,
            failures = result.report.failures,
            source = self.reader.source_name(),
            "batch fetch complete"
        );
        result
    }

    /// Yield each id's value as soon as it settles: cache hits first, then
    /// reads in completion order. A slow read never holds back the others.
    /// A batching reader settles all stale ids together.
    pub fn fetch_stream<'a>(
        &'a self,
        ids: &[PoolId],
        now_ms: u64,
    ) -> impl Stream<Item = FetchedPool> + Send + 'a {
        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        let mut stale = Vec::new();

        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.cache.get(id, now_ms) {
                Lookup::Fresh(snapshot) => hits.push(FetchedPool {
                    id: id.clone(),
                    snapshot,
                    origin: Origin::Cached,
                }),
                Lookup::Stale(_) | Lookup::Missing => stale.push(id.clone()),
            }
        }

        let reads = if self.reader.batches_reads() && !stale.is_empty() {
            stream::once(self.read_batch(stale, now_ms))
                .flat_map(stream::iter)
                .left_stream()
        } else {
            stale
                .into_iter()
                .map(|id| self.read_one(id, now_ms))
                .collect::<FuturesUnordered<_>>()
                .right_stream()
        };

        stream::iter(hits).chain(reads)
    }

    async fn read_one(&self, id: PoolId, now_ms: u64) -> FetchedPool {
        let result = self.reader.read_pool(&id).await;
        self.settle(id, result, now_ms)
    }

    async fn read_batch(&self, ids: Vec<PoolId>, now_ms: u64) -> Vec<FetchedPool> {
        let mut results: HashMap<_, _> = self.reader.read_pools(&ids).await.into_iter().collect();
        debug!(pools = ids.len(), source = self.reader.source_name(), "batched read settled");
        ids.into_iter()
            .map(|id| {
                let result = results
                    .remove(&id)
                    .unwrap_or_else(|| Err(ReadError::NotFound(id.clone())));
                self.settle(id, result, now_ms)
            })
            .collect()
    }

    fn settle(
        &self,
        id: PoolId,
        result: Result<ContractSnapshot, ReadError>,
        now_ms: u64,
    ) -> FetchedPool {
        match result {
            Ok(snapshot) => {
                let fetched_at = self
                    .clock
                    .as_ref()
                    .map_or(now_ms, |clock| clock.now_ms().max(now_ms));
                self.cache.put(id.clone(), snapshot.clone(), fetched_at);
                FetchedPool {
                    id,
                    snapshot,
                    origin: Origin::Read,
                }
            }
            Err(e) => {
                warn!(
                    pool_id = %id,
                    source = self.reader.source_name(),
                    error = %e,
                    "pool read failed, using fallback"
                );
                FetchedPool {
                    id,
                    snapshot: ContractSnapshot::fallback(),
                    origin: Origin::Fallback,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::testing::ScriptedReader;
    use crate::pool::{PoolStatus, StatusTuple};

    const TTL: Duration = Duration::from_millis(30_000);

    fn fetcher(reader: &Arc<ScriptedReader>) -> BatchFetcher {
        BatchFetcher::new(reader.clone(), TTL)
    }

    #[tokio::test]
    async fn test_fresh_ids_are_not_read_again() {
        let reader = Arc::new(ScriptedReader::new());
        reader.set_participants(&PoolId::from(1), 3);
        let fetcher = fetcher(&reader);
        let ids = vec![PoolId::from(1)];

        let first = fetcher.fetch_many(&ids, 0).await;
        assert_eq!(first.report.reads, 1);

        let second = fetcher.fetch_many(&ids, 29_999).await;
        assert_eq!(second.report.hits, 1);
        assert_eq!(second.report.reads, 0);
        assert_eq!(reader.reads_for(&PoolId::from(1)), 1);
        assert_eq!(second.get(&PoolId::from(1)).unwrap().progress.participant_count, 3);
    }

    #[tokio::test]
    async fn test_expired_ids_are_read_exactly_once() {
        let reader = Arc::new(ScriptedReader::new());
        let fetcher = fetcher(&reader);
        let ids = vec![PoolId::from(1), PoolId::from(1)];

        fetcher.fetch_many(&ids, 0).await;
        let again = fetcher.fetch_many(&ids, 30_000).await;

        assert_eq!(again.report.reads, 1);
        assert_eq!(reader.reads_for(&PoolId::from(1)), 2);
    }

    #[tokio::test]
    async fn test_failed_read_falls_back_without_affecting_siblings() {
        let reader = Arc::new(ScriptedReader::new());
        let x = PoolId::from(10);
        let y = PoolId::from(11);
        reader.fail(&x);
        reader.set_participants(&y, 9);
        let fetcher = fetcher(&reader);

        let result = fetcher.fetch_many(&[x.clone(), y.clone()], 0).await;

        assert_eq!(result.values.len(), 2);
        assert_eq!(result.values[&x].origin, Origin::Fallback);
        assert_eq!(result.get(&x), Some(&ContractSnapshot::fallback()));
        assert_eq!(result.values[&y].origin, Origin::Read);
        assert_eq!(result.get(&y).unwrap().progress.participant_count, 9);
        assert_eq!(result.report, BatchReport { hits: 0, reads: 1, failures: 1 });
        assert!(!result.report.all_failed());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let reader = Arc::new(ScriptedReader::new());
        let id = PoolId::from(5);
        reader.fail(&id);
        let fetcher = fetcher(&reader);

        let first = fetcher.fetch_many(&[id.clone()], 0).await;
        assert!(first.report.all_failed());

        reader.recover(&id);
        reader.set_status(&id, StatusTuple::new(PoolStatus::Settled, true, true));
        let second = fetcher.fetch_many(&[id.clone()], 1).await;
        assert_eq!(second.values[&id].origin, Origin::Read);
        assert_eq!(second.get(&id).unwrap().status.status(), PoolStatus::Settled);
        assert_eq!(reader.reads_for(&id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_does_not_hold_back_fast_ones() {
        let reader = Arc::new(ScriptedReader::new());
        let slow = PoolId::from(1);
        let fast = PoolId::from(2);
        reader.delay(&slow, Duration::from_secs(5));
        let fetcher = fetcher(&reader);

        let order: Vec<PoolId> = fetcher
            .fetch_stream(&[slow.clone(), fast.clone()], 0)
            .map(|f| f.id)
            .collect()
            .await;

        assert_eq!(order, vec![fast, slow]);
    }

    #[tokio::test]
    async fn test_invalidate_forces_read() {
        let reader = Arc::new(ScriptedReader::new());
        let id = PoolId::from(8);
        let fetcher = fetcher(&reader);

        fetcher.fetch_many(&[id.clone()], 0).await;
        assert_eq!(fetcher.cached_len(), 1);
        assert!(fetcher.invalidate(&id));
        fetcher.fetch_many(&[id.clone()], 1).await;
        assert_eq!(reader.reads_for(&id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_is_stamped_when_it_completes() {
        let reader = Arc::new(ScriptedReader::new());
        let clock = Arc::new(crate::clock::ManualClock::new(0));
        let id = PoolId::from(4);
        reader.delay(&id, Duration::from_secs(5));
        let fetcher = BatchFetcher::new(reader.clone(), TTL).with_clock(clock.clone());

        let ids = [id.clone()];
        let (first, _) = tokio::join!(fetcher.fetch_many(&ids, 0), async {
            clock.set(5_000);
        });
        assert_eq!(first.report.reads, 1);

        // 31s after the batch started but only 26s after the read landed
        let second = fetcher.fetch_many(&ids, 31_000).await;
        assert_eq!(second.report.hits, 1);
        assert_eq!(reader.reads_for(&id), 1);

        fetcher.fetch_many(&ids, 35_000).await;
        assert_eq!(reader.reads_for(&id), 2);
    }

    #[tokio::test]
    async fn test_batching_reader_gets_one_call_per_batch() {
        let reader = Arc::new(ScriptedReader::new().batching());
        let cached = PoolId::from(1);
        let good = PoolId::from(2);
        let bad = PoolId::from(3);
        reader.set_participants(&good, 6);
        reader.fail(&bad);
        let fetcher = fetcher(&reader);

        fetcher.fetch_many(&[cached.clone()], 0).await;
        assert_eq!(reader.batch_calls(), 1);

        let ids = [cached.clone(), good.clone(), bad.clone(), good.clone()];
        let result = fetcher.fetch_many(&ids, 1_000).await;

        assert_eq!(reader.batch_calls(), 2);
        assert_eq!(reader.reads_for(&cached), 1);
        assert_eq!(reader.reads_for(&good), 1);
        assert_eq!(result.report, BatchReport { hits: 1, reads: 1, failures: 1 });
        assert_eq!(result.values[&bad].origin, Origin::Fallback);
        assert_eq!(result.get(&good).unwrap().progress.participant_count, 6);

        // fresh hits only: no call at all
        fetcher.fetch_many(&[cached, good], 2_000).await;
        assert_eq!(reader.batch_calls(), 2);
    }
}
