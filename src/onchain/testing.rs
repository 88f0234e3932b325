//! Scripted in-memory `PoolReader` for tests and offline runs.
//!
//! Counts reads per pool, tracks read concurrency, and can be told to fail
//! or delay individual pools. `batching()` makes it report batched reads.

use crate::onchain::client::{PoolRead, PoolReader, ReadError};
use crate::pool::{ContractSnapshot, PoolFlags, PoolId, PoolProgress, PoolStatus, StatusTuple};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedReader {
    snapshots: DashMap<PoolId, ContractSnapshot>,
    failing: DashSet<PoolId>,
    delays: DashMap<PoolId, Duration>,
    reads: DashMap<PoolId, usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batching: AtomicBool,
    batch_calls: AtomicUsize,
}

fn open_pool() -> ContractSnapshot {
    ContractSnapshot {
        flags: PoolFlags::default(),
        progress: PoolProgress::zeroed(),
        status: StatusTuple::new(PoolStatus::Active, false, false),
    }
}

impl ScriptedReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batching(self) -> Self {
        self.batching.store(true, Ordering::SeqCst);
        self
    }

    /// Number of `read_pools` calls received.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn set_snapshot(&self, id: &PoolId, snapshot: ContractSnapshot) {
        self.snapshots.insert(id.clone(), snapshot);
    }

    pub fn set_participants(&self, id: &PoolId, participants: u64) {
        self.snapshots
            .entry(id.clone())
            .or_insert_with(open_pool)
            .progress
            .participant_count = participants;
    }

    pub fn set_status(&self, id: &PoolId, status: StatusTuple) {
        self.snapshots.entry(id.clone()).or_insert_with(open_pool).status = status;
    }

    pub fn fail(&self, id: &PoolId) {
        self.failing.insert(id.clone());
    }

    pub fn recover(&self, id: &PoolId) {
        self.failing.remove(id);
    }

    pub fn delay(&self, id: &PoolId, delay: Duration) {
        self.delays.insert(id.clone(), delay);
    }

    pub fn reads_for(&self, id: &PoolId) -> usize {
        self.reads.get(id).map(|r| *r).unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.reads.iter().map(|r| *r.value()).sum()
    }

    /// Highest number of reads that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolReader for ScriptedReader {
    async fn read_pool(&self, id: &PoolId) -> Result<ContractSnapshot, ReadError> {
        *self.reads.entry(id.clone()).or_insert(0) += 1;
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let delay = self.delays.get(id).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(id) {
            return Err(ReadError::Transport(format!("scripted failure for pool {id}")));
        }
        Ok(self
            .snapshots
            .get(id)
            .map(|s| s.clone())
            .unwrap_or_else(open_pool))
    }

    async fn read_pools(&self, ids: &[PoolId]) -> Vec<PoolRead> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        join_all(ids.iter().map(|id| async move { (id.clone(), self.read_pool(id).await) })).await
    }

    fn batches_reads(&self) -> bool {
        self.batching.load(Ordering::SeqCst)
    }

    fn source_name(&self) -> &'static str {
        "scripted"
    }
}
