//! Push side of pool synchronisation: the live activity websocket.

pub mod live;

pub use live::{ChannelState, HandlerId, LiveChannel, LiveHandler, LiveMessage, LiveTopic};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WsError {
    #[error("live channel connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid live channel url: {0}")]
    Url(#[from] url::ParseError),
    #[error("live channel closed by server")]
    Closed,
}
