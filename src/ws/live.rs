//! Live pool activity channel.
//!
//! Connects to the activity websocket, subscribes to the tracked pools and
//! dispatches decoded events to registered handlers. Reconnects forever with
//! exponential backoff until `close` is called. The server may redeliver
//! events after a reconnect; the sync engine drops those.
//!
//! Protocol:
//!   → { "type": "subscribe", "pools": ["1", "2"] }
//!   ← { "type": "bet", "poolId": 1, "amount": "100", "id": "0xabc:0", ... }

use crate::pool::PoolId;
use crate::sync::events::{decode_event, ActivityEvent, ActivityKind};
use crate::ws::WsError;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_BASE: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Disconnected,
}

/// What a handler listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveTopic {
    Connected,
    Disconnected,
    Activity(ActivityKind),
    /// Every activity event regardless of kind.
    AnyActivity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveMessage {
    Connected,
    Disconnected,
    Activity(ActivityEvent),
}

impl LiveMessage {
    fn matches(&self, topic: LiveTopic) -> bool {
        match (self, topic) {
            (LiveMessage::Connected, LiveTopic::Connected) => true,
            (LiveMessage::Disconnected, LiveTopic::Disconnected) => true,
            (LiveMessage::Activity(_), LiveTopic::AnyActivity) => true,
            (LiveMessage::Activity(event), LiveTopic::Activity(kind)) => event.kind() == kind,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type LiveHandler = Arc<dyn Fn(&LiveMessage) + Send + Sync>;

struct Inner {
    url: String,
    pools: Vec<PoolId>,
    handlers: DashMap<HandlerId, (LiveTopic, LiveHandler)>,
    next_handler: AtomicU64,
    local_seq: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
}

impl Inner {
    fn dispatch(&self, message: &LiveMessage) {
        // Handlers may call `on`/`off`; never hold a map guard while calling them.
        let targets: Vec<(HandlerId, LiveHandler)> = self
            .handlers
            .iter()
            .filter(|entry| message.matches(entry.value().0))
            .map(|entry| (*entry.key(), entry.value().1.clone()))
            .collect();

        for (id, handler) in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                warn!(handler = id.0, "live handler panicked");
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }

    fn handle_text(&self, text: &str) {
        let seq = self.local_seq.fetch_add(1, Ordering::SeqCst);
        match decode_event(text, seq) {
            Ok(event) => {
                debug!(pool_id = %event.pool_id, kind = %event.kind(), "live event");
                self.dispatch(&LiveMessage::Activity(event));
            }
            Err(e) => debug!(error = %e, "skipping undecodable live message"),
        }
    }
}

/// Websocket connector for live pool activity.
pub struct LiveChannel {
    inner: Arc<Inner>,
    state_rx: watch::Receiver<ChannelState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveChannel {
    pub fn new(url: impl Into<String>, pools: Vec<PoolId>) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                pools,
                handlers: DashMap::new(),
                next_handler: AtomicU64::new(1),
                local_seq: AtomicU64::new(0),
                state_tx,
            }),
            state_rx,
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    pub fn on<F>(&self, topic: LiveTopic, handler: F) -> HandlerId
    where
        F: Fn(&LiveMessage) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::SeqCst));
        self.inner.handlers.insert(id, (topic, Arc::new(handler)));
        id
    }

    /// Returns false if the handler was already removed.
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(&id).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Spawn the connection loop. Calling it again while running returns
    /// without starting a second connection.
    pub fn connect(&self) -> Result<(), WsError> {
        url::Url::parse(&self.inner.url)?;

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        *task = Some(tokio::spawn(run_live_connection(self.inner.clone())));
        Ok(())
    }

    /// Stop reconnecting and drop the socket. Idempotent.
    pub fn close(&self) {
        let taken = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = taken {
            task.abort();
            if *self.state_rx.borrow() != ChannelState::Disconnected {
                self.inner.set_state(ChannelState::Disconnected);
                self.inner.dispatch(&LiveMessage::Disconnected);
            }
            info!(url = %self.inner.url, "live channel closed");
        }
    }

    #[cfg(test)]
    fn inject(&self, text: &str) {
        self.inner.handle_text(text);
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn run_live_connection(inner: Arc<Inner>) {
    let mut backoff = RECONNECT_BASE;

    loop {
        info!(url = %inner.url, "connecting to live channel");
        inner.set_state(ChannelState::Connecting);

        match connect_and_stream(&inner).await {
            Ok(()) => {
                info!("live channel closed cleanly");
                backoff = RECONNECT_BASE;
            }
            Err(e) => {
                error!(error = %e, "live channel error");
            }
        }

        if *inner.state_tx.borrow() == ChannelState::Connected {
            inner.set_state(ChannelState::Disconnected);
            inner.dispatch(&LiveMessage::Disconnected);
        } else {
            inner.set_state(ChannelState::Disconnected);
        }

        info!(delay = ?backoff, "reconnecting to live channel");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_RECONNECT_DELAY);
    }
}

fn subscribe_message(pools: &[PoolId]) -> String {
    serde_json::json!({
        "type": "subscribe",
        "pools": pools,
    })
    .to_string()
}

async fn connect_and_stream(inner: &Inner) -> Result<(), WsError> {
    let (ws_stream, _response) = connect_async(inner.url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    write.send(Message::Text(subscribe_message(&inner.pools))).await?;
    info!(pools = inner.pools.len(), "live channel connected and subscribed");

    inner.set_state(ChannelState::Connected);
    inner.dispatch(&LiveMessage::Connected);

    let (ping_tx, mut ping_rx) = mpsc::channel::<()>(1);
    let mut ping_interval = interval(PING_INTERVAL);
    let ping_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        warn!(error = %e, "failed to send live channel ping");
                        break;
                    }
                }
                _ = ping_rx.recv() => break,
            }
        }
    });

    // A stream that ends without a close frame counts as an unexpected drop.
    let mut result = Err(WsError::Closed);
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => inner.handle_text(&text),
            Ok(Message::Pong(_)) => debug!("live channel pong"),
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "live channel received close frame");
                result = Ok(());
                break;
            }
            Ok(_) => {}
            Err(e) => {
                result = Err(WsError::Connection(e));
                break;
            }
        }
    }

    let _ = ping_tx.send(()).await;
    let _ = ping_handle.await;

    result
}
