use alloy::primitives::U256;
use poolsync::clock::ManualClock;
use poolsync::onchain::testing::ScriptedReader;
use poolsync::onchain::{BatchFetcher, Origin};
use poolsync::pool::{ContractSnapshot, PoolId, PoolStatus, StatusTuple};
use poolsync::sync::{
    decode_event, ActivityEvent, EventId, ReconcileOutcome, RefreshScheduler, SyncEngine,
    SyncHandle,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TTL_MS: u64 = 30_000;

fn runtime(reader: Arc<ScriptedReader>, clock: Arc<ManualClock>) -> SyncHandle {
    let fetcher = BatchFetcher::new(reader, Duration::from_millis(TTL_MS));
    let engine = SyncEngine::new(50, Duration::from_secs(60));
    let (handle, _task) = SyncHandle::spawn(engine, fetcher, clock);
    handle
}

#[tokio::test]
async fn freshness_scenario_reads_once_per_ttl() {
    let reader = Arc::new(ScriptedReader::new());
    let clock = Arc::new(ManualClock::new(0));
    let handle = runtime(reader.clone(), clock.clone());
    let id = PoolId::from(42);
    reader.set_participants(&id, 5);

    // t=0: first read
    handle.reconcile(&[id.clone()]).await.unwrap();
    assert_eq!(reader.reads_for(&id), 1);

    // t=10000: a bet lands; a refetch inside the TTL does not read
    clock.set(10_000);
    handle
        .apply_event(ActivityEvent::bet(EventId::Local(0), id.clone(), U256::from(10u64)))
        .unwrap();
    handle.flush().await.unwrap();
    assert_eq!(handle.view().get(&id).unwrap().progress.participant_count, 6);

    handle.reconcile(&[id.clone()]).await.unwrap();
    assert_eq!(reader.reads_for(&id), 1);

    // t=31000: entry expired, exactly one new read and the contract value wins
    clock.set(31_000);
    reader.set_participants(&id, 6);
    let outcome = handle.reconcile(&[id.clone()]).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied(report) if report.reads == 1));
    assert_eq!(reader.reads_for(&id), 2);
    assert_eq!(handle.view().get(&id).unwrap().progress.participant_count, 6);
    assert_eq!(handle.view().health.last_updated_at, Some(31_000));
}

#[tokio::test]
async fn failed_read_falls_back_without_affecting_siblings() {
    let reader = Arc::new(ScriptedReader::new());
    let x = PoolId::from(1);
    let y = PoolId::from(2);
    reader.fail(&x);
    reader.set_participants(&y, 3);

    let fetcher = BatchFetcher::new(reader.clone(), Duration::from_millis(TTL_MS));
    let batch = fetcher.fetch_many(&[x.clone(), y.clone()], 0).await;

    assert_eq!(batch.values.len(), 2);
    assert_eq!(batch.values[&x].origin, Origin::Fallback);
    assert_eq!(batch.get(&x), Some(&ContractSnapshot::fallback()));
    assert_eq!(batch.values[&y].origin, Origin::Read);
    assert_eq!(batch.get(&y).unwrap().progress.participant_count, 3);

    // the failed id is read again next time, the good one is cached
    reader.recover(&x);
    fetcher.fetch_many(&[x.clone(), y.clone()], 1_000).await;
    assert_eq!(reader.reads_for(&x), 2);
    assert_eq!(reader.reads_for(&y), 1);
}

#[tokio::test]
async fn reconcile_overrides_optimistic_drift() {
    let reader = Arc::new(ScriptedReader::new());
    let clock = Arc::new(ManualClock::new(0));
    let handle = runtime(reader.clone(), clock.clone());
    let id = PoolId::from(7);
    reader.set_participants(&id, 5);
    handle.reconcile(&[id.clone()]).await.unwrap();

    for seq in 0..3 {
        handle
            .apply_event(ActivityEvent::bet(EventId::Local(seq), id.clone(), U256::from(1u64)))
            .unwrap();
    }
    handle.flush().await.unwrap();
    assert_eq!(handle.view().get(&id).unwrap().progress.participant_count, 8);

    reader.set_participants(&id, 7);
    clock.set(TTL_MS);
    handle.reconcile(&[id.clone()]).await.unwrap();
    assert_eq!(handle.view().get(&id).unwrap().progress.participant_count, 7);
}

#[tokio::test]
async fn redelivered_and_out_of_order_events_are_no_ops() {
    let reader = Arc::new(ScriptedReader::new());
    let clock = Arc::new(ManualClock::new(0));
    let handle = runtime(reader, clock);
    let id = PoolId::from(3);

    let newer = concat!(
        r#"{"type":"progress","poolId":3,"timestamp":2000,"id":"a","#,
        r#""fillPercentage":60,"participantCount":9,"betCount":12}"#
    );
    let older = concat!(
        r#"{"type":"progress","poolId":3,"timestamp":1000,"id":"b","#,
        r#""fillPercentage":20,"participantCount":2,"betCount":2}"#
    );
    let bet = r#"{"type":"bet","poolId":3,"id":"c","amount":"1"}"#;

    for (seq, text) in [newer, older, bet, bet, newer].iter().enumerate() {
        handle.apply_event(decode_event(text, seq as u64).unwrap()).unwrap();
    }
    handle.flush().await.unwrap();

    let view = handle.view();
    let pool = view.get(&id).unwrap();
    assert_eq!(pool.progress.fill_percentage, 60.0);
    assert_eq!(pool.progress.participant_count, 10);
    assert_eq!(pool.progress.bet_count, 13);
}

#[tokio::test]
async fn status_changes_are_atomic_for_subscribers() {
    let reader = Arc::new(ScriptedReader::new());
    let clock = Arc::new(ManualClock::new(0));
    let handle = runtime(reader.clone(), clock);
    let id = PoolId::from(5);
    handle.reconcile(&[id.clone()]).await.unwrap();

    let torn = Arc::new(AtomicUsize::new(0));
    let seen = torn.clone();
    let watched = id.clone();
    let _sub = handle.subscribe(vec![id.clone()], move |view| {
        if let Some(pool) = view.get(&watched) {
            if pool.status.can_bet() != (pool.status.status() == PoolStatus::Active) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let closed = StatusTuple::new(PoolStatus::Closed, true, false);
    handle
        .apply_event(ActivityEvent::status(EventId::Local(1), id.clone(), Some(10), closed))
        .unwrap();
    handle.flush().await.unwrap();

    let view = handle.view();
    let status = view.get(&id).unwrap().status;
    assert_eq!(status.status(), PoolStatus::Closed);
    assert!(!status.can_bet());
    assert!(status.is_event_started());
    assert_eq!(torn.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduler_never_overlaps_reconciles() {
    let reader = Arc::new(ScriptedReader::new());
    let clock = Arc::new(ManualClock::new(0));
    let handle = runtime(reader.clone(), clock.clone());
    let ids = vec![PoolId::from(1), PoolId::from(2)];
    for id in &ids {
        reader.delay(id, Duration::from_secs(40));
    }

    let scheduler = RefreshScheduler::new(handle, ids.clone(), Duration::from_secs(30));
    scheduler.start();

    for _ in 0..10 {
        clock.advance(TTL_MS);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let _ = scheduler.refetch().await.unwrap();
    }
    scheduler.stop();

    // two ids read concurrently per cycle, never two cycles at once
    assert!(reader.max_in_flight() <= ids.len());
    assert!(reader.total_reads() >= 2 * ids.len());
}

#[tokio::test]
async fn disconnect_keeps_data() {
    let reader = Arc::new(ScriptedReader::new());
    let clock = Arc::new(ManualClock::new(0));
    let handle = runtime(reader.clone(), clock);
    let id = PoolId::from(11);
    reader.set_participants(&id, 4);
    handle.reconcile(&[id.clone()]).await.unwrap();

    handle.set_connected(true).unwrap();
    handle.set_connected(false).unwrap();
    handle.flush().await.unwrap();

    let view = handle.view();
    assert!(!view.health.connected);
    assert_eq!(view.get(&id).unwrap().progress.participant_count, 4);
}
