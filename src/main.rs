use poolsync::backend::BackendPoolReader;
use poolsync::clock::{Clock, SystemClock};
use poolsync::config::{Config, ReadSource};
use poolsync::onchain::abi::verify_selectors;
use poolsync::onchain::{BatchFetcher, PoolReader, RpcPoolReader};
use poolsync::pool::{PoolId, PoolState};
use poolsync::sync::{RefreshScheduler, SyncEngine, SyncHandle};
use poolsync::ws::{LiveChannel, LiveMessage, LiveTopic};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

const CONFIG_FILE: &str = "poolsync.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_FILE).exists() {
        Config::load(Path::new(CONFIG_FILE))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("poolsync v{} starting", env!("CARGO_PKG_VERSION"));

    for (signature, ok) in verify_selectors() {
        if !ok {
            error!(signature = %signature, "selector mismatch in contract bindings");
        }
    }

    // --- Read source ---
    let reader: Arc<dyn PoolReader> = match config.sync.source {
        ReadSource::Rpc => {
            let reader = RpcPoolReader::new(&config.chain.rpc_url, &config.chain.pool_contract)?;
            info!(
                rpc = %config.chain.rpc_url,
                contract = %reader.contract(),
                "reading pools from chain"
            );
            Arc::new(reader)
        }
        ReadSource::Backend => {
            info!(api = %config.backend.api_url, "reading pools through backend");
            Arc::new(BackendPoolReader::new(
                config.backend.api_url.clone(),
                config.backend.request_timeout(),
            )?)
        }
    };

    let pool_ids = config.sync.pool_ids.clone();
    if pool_ids.is_empty() {
        warn!("no pools configured in sync.pool_ids - nothing to track");
    }

    // --- Sync runtime ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let fetcher = BatchFetcher::new(reader, config.sync.cache_ttl());
    let engine = SyncEngine::new(config.sync.activity_ring_size, config.sync.dedup_window());
    let (handle, engine_task) = SyncHandle::spawn(engine, fetcher, clock.clone());

    let stale_after = config.sync.stale_after();
    let summary_clock = clock.clone();
    let last_seen: Mutex<HashMap<PoolId, Arc<PoolState>>> = Mutex::new(HashMap::new());
    let _summary = handle.subscribe(pool_ids.clone(), move |view| {
        let now = summary_clock.now_ms();
        let mut last_seen = last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0usize;
        for (id, pool) in &view.pools {
            if last_seen.get(id).is_some_and(|seen| Arc::ptr_eq(seen, pool)) {
                continue;
            }
            changed += 1;
            debug!(
                pool_id = %id,
                status = %pool.status.status(),
                can_bet = pool.status.can_bet(),
                fill = pool.progress.fill_percentage,
                participants = pool.progress.participant_count,
                volume = %pool.progress.total_volume,
                "pool updated"
            );
            last_seen.insert(id.clone(), pool.clone());
        }
        if changed > 0 {
            info!(changed, tracked = view.pools.len(), "pool view updated");
        }
        if view.health.is_stale(now, stale_after) {
            warn!(
                last_updated_at = ?view.health.last_updated_at,
                error = ?view.health.error,
                "pool view is stale"
            );
        }
    });

    // --- Live channel ---
    let live = if config.live.is_active() {
        let channel = LiveChannel::new(config.live.ws_url.clone(), pool_ids.clone());

        let h = handle.clone();
        channel.on(LiveTopic::Connected, move |_| {
            let _ = h.set_connected(true);
        });
        let h = handle.clone();
        channel.on(LiveTopic::Disconnected, move |_| {
            let _ = h.set_connected(false);
        });
        let h = handle.clone();
        channel.on(LiveTopic::AnyActivity, move |message| {
            if let LiveMessage::Activity(event) = message {
                let _ = h.apply_event(event.clone());
            }
        });

        channel.connect()?;
        Some(channel)
    } else {
        info!("live channel disabled, relying on periodic reconcile only");
        None
    };

    // --- Refresh cycle ---
    let scheduler =
        RefreshScheduler::new(handle.clone(), pool_ids, config.sync.refresh_interval());
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler.stop();
    if let Some(channel) = &live {
        channel.close();
    }
    handle.shutdown();
    let _ = engine_task.await;

    info!("poolsync stopped");
    Ok(())
}
