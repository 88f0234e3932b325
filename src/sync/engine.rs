//! Pool view merge core.
//!
//! `SyncEngine` owns the `pool id → PoolState` view and applies the merge
//! policy for each field family. It does no I/O and never awaits; the
//! runtime feeds it reconcile results and live events one at a time.
//!
//! Merge policy:
//! - reconcile results overwrite flags, progress and status wholesale
//! - `progress` / `status` events apply only when newer than the last event
//!   of the same kind for that pool (arrival order when untimestamped)
//! - `bet` / `liquidity_added` events are additive and self-heal on the next
//!   reconcile
//! - delivery ids seen inside the dedup window are dropped
//!
//! Every update builds a new `PoolState` and swaps the `Arc`, so a view
//! snapshot never contains a half-written pool.

use crate::onchain::fetcher::{BatchReport, BatchResult, Origin};
use crate::pool::{ContractSnapshot, PoolId, PoolState};
use crate::sync::events::{ActivityEvent, ActivityKind, ActivityPayload, ActivityRing, EventId};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection and freshness metadata exposed with every view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncHealth {
    pub connected: bool,
    /// Last successful reconcile, ms since epoch.
    pub last_updated_at: Option<u64>,
    /// Last accepted live event, ms since epoch.
    pub last_event_at: Option<u64>,
    pub error: Option<String>,
}

impl SyncHealth {
    pub fn is_stale(&self, now_ms: u64, stale_after: Duration) -> bool {
        match self.last_updated_at {
            Some(at) => now_ms.saturating_sub(at) >= stale_after.as_millis() as u64,
            None => true,
        }
    }
}

/// Read-only snapshot handed to consumers.
#[derive(Debug, Clone, Default)]
pub struct PoolView {
    pub pools: HashMap<PoolId, Arc<PoolState>>,
    pub health: SyncHealth,
    /// Recent accepted events, newest first.
    pub recent: Vec<ActivityEvent>,
}

impl PoolView {
    pub fn get(&self, id: &PoolId) -> Option<&PoolState> {
        self.pools.get(id).map(|p| p.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Delivery id already seen inside the dedup window.
    Duplicate,
    /// Not newer than the last applied event of the same kind.
    Stale,
}

pub struct SyncEngine {
    pools: HashMap<PoolId, Arc<PoolState>>,
    /// (pool, kind) → timestamp of the last applied ordered event
    last_applied: HashMap<(PoolId, ActivityKind), u64>,
    /// delivery id → time first seen
    seen: HashMap<String, u64>,
    seen_order: VecDeque<(String, u64)>,
    dedup_window_ms: u64,
    ring: ActivityRing,
    health: SyncHealth,
}

impl SyncEngine {
    pub fn new(activity_ring_size: usize, dedup_window: Duration) -> Self {
        Self {
            pools: HashMap::new(),
            last_applied: HashMap::new(),
            seen: HashMap::new(),
            seen_order: VecDeque::new(),
            dedup_window_ms: dedup_window.as_millis() as u64,
            ring: ActivityRing::new(activity_ring_size),
            health: SyncHealth::default(),
        }
    }

    pub fn pool(&self, id: &PoolId) -> Option<&PoolState> {
        self.pools.get(id).map(|p| p.as_ref())
    }

    pub fn health(&self) -> &SyncHealth {
        &self.health
    }

    pub fn view(&self) -> PoolView {
        PoolView {
            pools: self.pools.clone(),
            health: self.health.clone(),
            recent: self.ring.to_vec(),
        }
    }

    /// Authoritative overwrite of one pool's contract-sourced fields.
    /// Returns whether the visible state changed.
    pub fn apply_snapshot(&mut self, id: &PoolId, snapshot: ContractSnapshot) -> bool {
        let next = PoolState::from_snapshot(id.clone(), snapshot);
        self.replace(next)
    }

    /// Close out a reconcile whose successful reads were already applied.
    ///
    /// Fallback values only materialise pools that have never been seen; a
    /// known pool keeps its last good state. If every read failed the
    /// reconcile counts as failed and the view is left untouched.
    pub fn finish_reconcile(
        &mut self,
        report: BatchReport,
        fallbacks: Vec<(PoolId, ContractSnapshot)>,
        now_ms: u64,
    ) -> Vec<PoolId> {
        if report.all_failed() {
            self.record_reconcile_failure(format!("all {} pool reads failed", report.failures));
            return Vec::new();
        }

        let mut changed = Vec::new();
        for (id, snapshot) in fallbacks {
            if self.pools.contains_key(&id) {
                debug!(pool_id = %id, "read failed, keeping last known state");
                continue;
            }
            if self.apply_snapshot(&id, snapshot) {
                changed.push(id);
            }
        }

        self.health.last_updated_at = Some(now_ms);
        self.health.error = None;
        changed
    }

    /// Apply a whole batch at once. Returns the pools whose state changed.
    pub fn apply_reconcile(&mut self, batch: BatchResult, now_ms: u64) -> Vec<PoolId> {
        let mut changed = Vec::new();
        let mut fallbacks = Vec::new();

        for (id, fetched) in batch.values {
            match fetched.origin {
                Origin::Fallback => fallbacks.push((id, fetched.snapshot)),
                Origin::Cached | Origin::Read => {
                    if self.apply_snapshot(&id, fetched.snapshot) {
                        changed.push(id);
                    }
                }
            }
        }

        changed.extend(self.finish_reconcile(batch.report, fallbacks, now_ms));
        changed
    }

    /// A failed reconcile sets `error` and keeps the previous view.
    pub fn record_reconcile_failure(&mut self, error: String) {
        warn!(error = %error, "reconcile failed, keeping previous view");
        self.health.error = Some(error);
    }

    /// Returns whether the flag changed.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        let changed = self.health.connected != connected;
        self.health.connected = connected;
        changed
    }

    pub fn apply_event(&mut self, event: ActivityEvent, now_ms: u64) -> EventOutcome {
        self.prune_seen(now_ms);
        if let EventId::Delivery(key) = &event.id {
            if self.seen.contains_key(key) {
                debug!(event_id = %key, pool_id = %event.pool_id, "duplicate delivery dropped");
                return EventOutcome::Duplicate;
            }
        }

        let kind = event.kind();
        if matches!(kind, ActivityKind::Progress | ActivityKind::Status) {
            if let Some(ts) = event.timestamp {
                let key = (event.pool_id.clone(), kind);
                if let Some(&last) = self.last_applied.get(&key) {
                    if ts <= last {
                        debug!(
                            pool_id = %event.pool_id,
                            kind = %kind,
                            timestamp = ts,
                            last_applied = last,
                            "stale event dropped"
                        );
                        return EventOutcome::Stale;
                    }
                }
                self.last_applied.insert(key, ts);
            }
        }

        let mut next = self
            .pools
            .get(&event.pool_id)
            .map(|p| PoolState::clone(p))
            .unwrap_or_else(|| PoolState::placeholder(event.pool_id.clone()));

        match &event.payload {
            ActivityPayload::Bet { amount, .. } => {
                next.progress.participant_count = next.progress.participant_count.saturating_add(1);
                next.progress.bet_count = next.progress.bet_count.saturating_add(1);
                next.progress.total_volume = next.progress.total_volume.saturating_add(*amount);
            }
            ActivityPayload::PoolCreated { .. } => {}
            ActivityPayload::LiquidityAdded { amount } => {
                next.progress.total_volume = next.progress.total_volume.saturating_add(*amount);
            }
            ActivityPayload::Progress {
                fill_percentage,
                participant_count,
                bet_count,
            } => {
                next.progress.fill_percentage = *fill_percentage;
                next.progress.participant_count = *participant_count;
                next.progress.bet_count = *bet_count;
            }
            ActivityPayload::Status(status) => {
                next.status = *status;
            }
        }

        self.replace(next);

        if let EventId::Delivery(key) = &event.id {
            self.seen.insert(key.clone(), now_ms);
            self.seen_order.push_back((key.clone(), now_ms));
        }
        self.health.last_event_at = Some(now_ms);
        self.ring.push(event);
        EventOutcome::Applied
    }

    fn replace(&mut self, next: PoolState) -> bool {
        if self.pools.get(&next.id).map(|p| **p == next).unwrap_or(false) {
            return false;
        }
        self.pools.insert(next.id.clone(), Arc::new(next));
        true
    }

    fn prune_seen(&mut self, now_ms: u64) {
        while let Some((_, seen_at)) = self.seen_order.front() {
            if now_ms.saturating_sub(*seen_at) < self.dedup_window_ms {
                break;
            }
            if let Some((key, _)) = self.seen_order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }
}
