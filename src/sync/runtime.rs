//! Sync runtime: the task that owns the `SyncEngine`.
//!
//! Polling and push are two producers feeding one consumer. Reconciles and
//! live events are sent to the engine task as `Command`s over an unbounded
//! mpsc channel; the task applies them in arrival order and publishes a new
//! `PoolView` on a `watch` channel after each one. Reads never run on the
//! engine task, so a slow reconcile never holds back event folding.
//!
//! Reconciles for the same id-set never overlap: a second request while one
//! is in flight waits for it and returns `ReconcileOutcome::Coalesced`.

use crate::clock::Clock;
use crate::onchain::fetcher::{BatchFetcher, BatchReport, Origin};
use crate::pool::{ContractSnapshot, PoolId};
use crate::sync::engine::{EventOutcome, PoolView, SyncEngine};
use crate::sync::events::ActivityEvent;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync runtime has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This call ran the reconcile.
    Applied(BatchReport),
    /// Another reconcile for the same id-set was in flight; this call waited
    /// for it instead of issuing its own reads.
    Coalesced,
}

pub type ChangeCallback = Arc<dyn Fn(&PoolView) + Send + Sync>;

enum Command {
    Snapshot {
        id: PoolId,
        snapshot: ContractSnapshot,
    },
    FinishReconcile {
        report: BatchReport,
        fallbacks: Vec<(PoolId, ContractSnapshot)>,
        done: oneshot::Sender<()>,
    },
    Event(ActivityEvent),
    Connection(bool),
    Subscribe(Subscriber),
    Unsubscribe(u64),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct Subscriber {
    id: u64,
    /// Empty means every pool.
    pools: HashSet<PoolId>,
    on_change: ChangeCallback,
    active: Arc<AtomicBool>,
}

impl Subscriber {
    fn wants(&self, changed: &[PoolId]) -> bool {
        self.active.load(Ordering::SeqCst)
            && (self.pools.is_empty() || changed.iter().any(|id| self.pools.contains(id)))
    }
}

struct Shared {
    tx: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<Arc<PoolView>>,
    fetcher: BatchFetcher,
    clock: Arc<dyn Clock>,
    /// sorted id-set → reconcile in flight
    in_flight: InFlightMap,
    next_subscriber: AtomicU64,
}

/// Cloneable handle to a running sync engine.
#[derive(Clone)]
pub struct SyncHandle {
    inner: Arc<Shared>,
}

impl SyncHandle {
    /// Move the engine onto its own task. The returned `JoinHandle` finishes
    /// after `shutdown` or once every handle is dropped.
    /// The fetcher is switched to `clock` so reads are stamped when they land.
    pub fn spawn(
        engine: SyncEngine,
        fetcher: BatchFetcher,
        clock: Arc<dyn Clock>,
    ) -> (Self, JoinHandle<()>) {
        let fetcher = fetcher.with_clock(clock.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(Arc::new(engine.view()));

        let task = tokio::spawn(run_engine(engine, rx, view_tx, clock.clone()));

        let handle = Self {
            inner: Arc::new(Shared {
                tx,
                view: view_rx,
                fetcher,
                clock,
                in_flight: DashMap::new(),
                next_subscriber: AtomicU64::new(1),
            }),
        };
        (handle, task)
    }

    /// Current snapshot. Never blocks and never exposes a half-applied pool.
    pub fn view(&self) -> Arc<PoolView> {
        self.inner.view.borrow().clone()
    }

    /// A receiver that wakes on every published view.
    pub fn changes(&self) -> watch::Receiver<Arc<PoolView>> {
        self.inner.view.clone()
    }

    pub fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    fn send(&self, cmd: Command) -> Result<(), SyncError> {
        self.inner.tx.send(cmd).map_err(|_| SyncError::Stopped)
    }

    pub fn apply_event(&self, event: ActivityEvent) -> Result<(), SyncError> {
        self.send(Command::Event(event))
    }

    pub fn set_connected(&self, connected: bool) -> Result<(), SyncError> {
        self.send(Command::Connection(connected))
    }

    /// Drop a pool's cached read so the next reconcile reads it again.
    pub fn invalidate(&self, id: &PoolId) -> bool {
        self.inner.fetcher.invalidate(id)
    }

    /// Resolves once every command sent before it has been applied.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Flush(done_tx))?;
        done_rx.await.map_err(|_| SyncError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(Command::Shutdown);
    }

    /// Reconcile `ids` against the read source.
    ///
    /// Successful reads are applied as each one lands; failed ones are
    /// settled together at the end. Per-id read failures never surface as an
    /// error here; `Err` only means the engine task is gone.
    pub async fn reconcile(&self, ids: &[PoolId]) -> Result<ReconcileOutcome, SyncError> {
        let mut key = ids.to_vec();
        key.sort();
        key.dedup();

        let slot = InFlightSlot {
            map: &self.inner.in_flight,
            key,
        };
        let key = &slot.key;

        let lock = self.inner.in_flight.entry(key.clone()).or_default().clone();
        let _guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(pools = key.len(), "reconcile already in flight, joining it");
                let _settled = lock.lock_owned().await;
                return Ok(ReconcileOutcome::Coalesced);
            }
        };
        drop(lock);

        let now = self.inner.clock.now_ms();
        let mut report = BatchReport::default();
        let mut fallbacks = Vec::new();

        let items = self.inner.fetcher.fetch_stream(key, now);
        futures::pin_mut!(items);
        while let Some(item) = items.next().await {
            report.record(item.origin);
            match item.origin {
                Origin::Fallback => fallbacks.push((item.id, item.snapshot)),
                Origin::Cached | Origin::Read => self.send(Command::Snapshot {
                    id: item.id,
                    snapshot: item.snapshot,
                })?,
            }
        }
        drop(items);

        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::FinishReconcile {
            report,
            fallbacks,
            done: done_tx,
        })?;
        done_rx.await.map_err(|_| SyncError::Stopped)?;

        debug!(
            pools = key.len(),
            hits = report.hits,
            reads = report.reads,
            failures = report.failures,
            "reconcile applied"
        );
        Ok(ReconcileOutcome::Applied(report))
    }

    /// Call `on_change` with the new view whenever one of `ids` changes
    /// (any pool when `ids` is empty). Callbacks run on the engine task and
    /// should return quickly; a panicking callback is logged and skipped.
    pub fn subscribe<F>(&self, ids: impl IntoIterator<Item = PoolId>, on_change: F) -> Subscription
    where
        F: Fn(&PoolView) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber {
            id,
            pools: ids.into_iter().collect(),
            on_change: Arc::new(on_change),
            active: active.clone(),
        };

        if self.send(Command::Subscribe(subscriber)).is_err() {
            active.store(false, Ordering::SeqCst);
        }

        Subscription {
            handle: Unsubscribe {
                id,
                active,
                tx: self.inner.tx.clone(),
            },
        }
    }
}

type InFlightMap = DashMap<Vec<PoolId>, Arc<Mutex<()>>>;

/// Removes an id-set's reconcile lock once nobody holds or waits on it.
/// Declared before the guard in `reconcile` so it drops after it.
struct InFlightSlot<'a> {
    map: &'a InFlightMap,
    key: Vec<PoolId>,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.map.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Detaches a subscriber. Cloneable, idempotent, and safe to call from
/// inside the subscriber's own callback.
#[derive(Clone)]
pub struct Unsubscribe {
    id: u64,
    active: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Command>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Command::Unsubscribe(self.id));
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Live subscription. Unsubscribes when dropped.
pub struct Subscription {
    handle: Unsubscribe,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// A detached unsubscribe handle, e.g. for use inside the callback.
    pub fn handle(&self) -> Unsubscribe {
        self.handle.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

async fn run_engine(
    mut engine: SyncEngine,
    mut rx: mpsc::UnboundedReceiver<Command>,
    view_tx: watch::Sender<Arc<PoolView>>,
    clock: Arc<dyn Clock>,
) {
    let mut subscribers: HashMap<u64, Subscriber> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        let mut reply = None;
        let changed: Vec<PoolId> = match cmd {
            Command::Snapshot { id, snapshot } => {
                if engine.apply_snapshot(&id, snapshot) {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            Command::FinishReconcile {
                report,
                fallbacks,
                done,
            } => {
                reply = Some(done);
                engine.finish_reconcile(report, fallbacks, clock.now_ms())
            }
            Command::Event(event) => {
                let pool_id = event.pool_id.clone();
                match engine.apply_event(event, clock.now_ms()) {
                    EventOutcome::Applied => vec![pool_id],
                    EventOutcome::Duplicate | EventOutcome::Stale => Vec::new(),
                }
            }
            Command::Connection(connected) => {
                if engine.set_connected(connected) {
                    info!(connected = connected, "live channel state changed");
                }
                Vec::new()
            }
            Command::Subscribe(subscriber) => {
                subscribers.insert(subscriber.id, subscriber);
                continue;
            }
            Command::Unsubscribe(id) => {
                subscribers.remove(&id);
                continue;
            }
            Command::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            Command::Shutdown => break,
        };

        let view = Arc::new(engine.view());
        view_tx.send_replace(view.clone());

        if !changed.is_empty() {
            notify(&subscribers, &changed, &view);
        }
        if let Some(done) = reply {
            let _ = done.send(());
        }
    }

    info!("sync engine task stopped");
}

fn notify(subscribers: &HashMap<u64, Subscriber>, changed: &[PoolId], view: &PoolView) {
    for subscriber in subscribers.values() {
        if !subscriber.wants(changed) {
            continue;
        }
        let on_change = subscriber.on_change.clone();
        if catch_unwind(AssertUnwindSafe(|| on_change(view))).is_err() {
            warn!(subscriber = subscriber.id, "subscriber callback panicked");
        }
    }
}
