//! Pool state synchronization.
//!
//! Two producers feed one owner of pool state:
//! - periodic reconciles (`RefreshScheduler` → `SyncHandle::reconcile`),
//!   which read the authoritative contract values through `BatchFetcher`
//! - live activity events (`ws::LiveChannel` → `SyncHandle::apply_event`),
//!   folded in optimistically between reconciles
//!
//! `SyncEngine` holds the merge rules and is plain synchronous code;
//! `runtime` moves it onto a task and publishes immutable `PoolView`
//! snapshots to readers and subscribers.

pub mod engine;
pub mod events;
pub mod runtime;
pub mod scheduler;

pub use engine::{EventOutcome, PoolView, SyncEngine, SyncHealth};
pub use events::{decode_event, ActivityEvent, ActivityKind, ActivityPayload, ActivityRing, EventId};
pub use runtime::{ReconcileOutcome, Subscription, SyncError, SyncHandle, Unsubscribe};
pub use scheduler::{RefreshScheduler, SchedulerState};
