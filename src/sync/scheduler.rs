//! Periodic reconcile driver.
//!
//! One cycle = reconcile the tracked ids, then wait `interval`. The next
//! cycle is only armed after the previous reconcile settles, so cycles never
//! overlap. A manual `refetch` goes through the same per-id-set guard in
//! `SyncHandle::reconcile` and coalesces with an in-flight cycle.

use crate::pool::PoolId;
use crate::sync::runtime::{ReconcileOutcome, SyncError, SyncHandle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Running,
}

struct ActiveCycle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct RefreshScheduler {
    handle: SyncHandle,
    ids: Arc<Vec<PoolId>>,
    interval: Duration,
    state_tx: Arc<watch::Sender<SchedulerState>>,
    state_rx: watch::Receiver<SchedulerState>,
    running: Mutex<Option<ActiveCycle>>,
}

impl RefreshScheduler {
    pub fn new(handle: SyncHandle, ids: Vec<PoolId>, interval: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        Self {
            handle,
            ids: Arc::new(ids),
            interval,
            state_tx: Arc::new(state_tx),
            state_rx,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SchedulerState> {
        self.state_rx.clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_started(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Start the cycle with an immediate reconcile. No-op when already
    /// started.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("refresh scheduler already started");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(refresh_loop(
            self.handle.clone(),
            self.ids.clone(),
            self.interval,
            self.state_tx.clone(),
            stop_rx,
        ));

        info!(
            pools = self.ids.len(),
            interval_ms = self.interval.as_millis() as u64,
            "refresh scheduler started"
        );
        *running = Some(ActiveCycle { stop: stop_tx, task });
    }

    /// Reconcile now, outside the cycle. Coalesces with an in-flight cycle
    /// instead of starting a second read.
    pub async fn refetch(&self) -> Result<ReconcileOutcome, SyncError> {
        self.handle.reconcile(&self.ids).await
    }

    /// Cancel the pending cycle. Idempotent. A reconcile already in flight
    /// runs to completion and its results are applied; no further cycle is
    /// armed after it.
    pub fn stop(&self) {
        let taken = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = taken {
            let _ = running.stop.send(true);
            self.state_tx.send_replace(SchedulerState::Idle);
            info!("refresh scheduler stopped");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn refresh_loop(
    handle: SyncHandle,
    ids: Arc<Vec<PoolId>>,
    interval: Duration,
    state: Arc<watch::Sender<SchedulerState>>,
    mut stop: watch::Receiver<bool>,
) {
    // After `stop` the scheduler owns the state again; a finishing cycle
    // must not overwrite it (a restarted cycle may already be running).
    let publish = |stop: &watch::Receiver<bool>, next: SchedulerState| {
        if !*stop.borrow() {
            state.send_replace(next);
        }
    };

    loop {
        if *stop.borrow() {
            break;
        }

        publish(&stop, SchedulerState::Running);
        match handle.reconcile(&ids).await {
            Ok(ReconcileOutcome::Applied(report)) => {
                if report.all_failed() {
                    warn!(pools = ids.len(), "scheduled reconcile: every read failed");
                }
            }
            Ok(ReconcileOutcome::Coalesced) => {
                debug!("scheduled reconcile joined a manual refetch")
            }
            Err(SyncError::Stopped) => {
                warn!("sync engine stopped, ending refresh cycle");
                break;
            }
        }

        if *stop.borrow() {
            break;
        }
        publish(&stop, SchedulerState::Scheduled);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }
    }

    publish(&stop, SchedulerState::Idle);
}
