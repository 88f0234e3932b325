//! Live activity events.
//!
//! Every message from the live channel is decoded into an `ActivityEvent`
//! whose payload is a closed set of variants, so the merge rules in
//! `SyncEngine::apply_event` are an exhaustive match.
//!
//! Wire shape (JSON, one object per message):
//!   { "type": "progress", "poolId": 42, "timestamp": 1700000000000,
//!     "id": "0xabc:3", "fillPercentage": 40, "participantCount": 5, "betCount": 7 }

use crate::pool::{clamp_fill, de_u256, PoolId, PoolStatus, StatusTuple};
use alloy::primitives::U256;
use serde::Deserialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Bet,
    PoolCreated,
    LiquidityAdded,
    Progress,
    Status,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Bet => write!(f, "bet"),
            ActivityKind::PoolCreated => write!(f, "pool_created"),
            ActivityKind::LiquidityAdded => write!(f, "liquidity_added"),
            ActivityKind::Progress => write!(f, "progress"),
            ActivityKind::Status => write!(f, "status"),
        }
    }
}

/// Delivery identity. Ids supplied by the channel survive redelivery and are
/// used for duplicate suppression; local ids are unique per delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    Delivery(String),
    Local(u64),
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventId::Delivery(id) => f.write_str(id),
            EventId::Local(seq) => write!(f, "local-{seq}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityPayload {
    Bet {
        amount: U256,
        bettor: Option<String>,
    },
    PoolCreated {
        creator: Option<String>,
    },
    LiquidityAdded {
        amount: U256,
    },
    Progress {
        fill_percentage: f64,
        participant_count: u64,
        bet_count: u64,
    },
    Status(StatusTuple),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEvent {
    pub id: EventId,
    pub pool_id: PoolId,
    /// Producer timestamp in ms, when the channel supplies one.
    pub timestamp: Option<u64>,
    pub payload: ActivityPayload,
}

impl ActivityEvent {
    pub fn kind(&self) -> ActivityKind {
        match self.payload {
            ActivityPayload::Bet { .. } => ActivityKind::Bet,
            ActivityPayload::PoolCreated { .. } => ActivityKind::PoolCreated,
            ActivityPayload::LiquidityAdded { .. } => ActivityKind::LiquidityAdded,
            ActivityPayload::Progress { .. } => ActivityKind::Progress,
            ActivityPayload::Status(_) => ActivityKind::Status,
        }
    }

    pub fn bet(id: EventId, pool_id: PoolId, amount: U256) -> Self {
        Self {
            id,
            pool_id,
            timestamp: None,
            payload: ActivityPayload::Bet { amount, bettor: None },
        }
    }

    pub fn progress(
        id: EventId,
        pool_id: PoolId,
        timestamp: Option<u64>,
        fill_percentage: f64,
        participant_count: u64,
        bet_count: u64,
    ) -> Self {
        Self {
            id,
            pool_id,
            timestamp,
            payload: ActivityPayload::Progress {
                fill_percentage: clamp_fill(fill_percentage),
                participant_count,
                bet_count,
            },
        }
    }

    pub fn status(
        id: EventId,
        pool_id: PoolId,
        timestamp: Option<u64>,
        status: StatusTuple,
    ) -> Self {
        Self {
            id,
            pool_id,
            timestamp,
            payload: ActivityPayload::Status(status),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "poolId")]
    pool_id: PoolId,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(flatten)]
    body: WireBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBody {
    Bet {
        #[serde(default = "zero_amount", deserialize_with = "de_u256")]
        amount: U256,
        #[serde(default)]
        bettor: Option<String>,
    },
    PoolCreated {
        #[serde(default)]
        creator: Option<String>,
    },
    LiquidityAdded {
        #[serde(default = "zero_amount", deserialize_with = "de_u256")]
        amount: U256,
    },
    Progress {
        #[serde(rename = "fillPercentage", default)]
        fill_percentage: f64,
        #[serde(rename = "participantCount", default)]
        participant_count: u64,
        #[serde(rename = "betCount", default)]
        bet_count: u64,
    },
    Status {
        status: PoolStatus,
        #[serde(rename = "isEventStarted", default)]
        is_event_started: bool,
        #[serde(rename = "isPoolFilled", default)]
        is_pool_filled: bool,
    },
}

fn zero_amount() -> U256 {
    U256::ZERO
}

/// Decode one live-channel message. `local_seq` names the event when the
/// channel did not supply an id.
pub fn decode_event(text: &str, local_seq: u64) -> Result<ActivityEvent, serde_json::Error> {
    let wire: WireEvent = serde_json::from_str(text)?;

    let payload = match wire.body {
        WireBody::Bet { amount, bettor } => ActivityPayload::Bet { amount, bettor },
        WireBody::PoolCreated { creator } => ActivityPayload::PoolCreated { creator },
        WireBody::LiquidityAdded { amount } => ActivityPayload::LiquidityAdded { amount },
        WireBody::Progress {
            fill_percentage,
            participant_count,
            bet_count,
        } => ActivityPayload::Progress {
            fill_percentage: clamp_fill(fill_percentage),
            participant_count,
            bet_count,
        },
        // canBet on the wire is ignored; it is derived from status.
        WireBody::Status {
            status,
            is_event_started,
            is_pool_filled,
        } => ActivityPayload::Status(StatusTuple::new(status, is_event_started, is_pool_filled)),
    };

    let id = match wire.id {
        Some(id) if !id.is_empty() => EventId::Delivery(id),
        _ => EventId::Local(local_seq),
    };

    Ok(ActivityEvent {
        id,
        pool_id: wire.pool_id,
        timestamp: wire.timestamp,
        payload,
    })
}

/// The most recent accepted events, newest first. Display only.
#[derive(Debug, Clone)]
pub struct ActivityRing {
    capacity: usize,
    events: VecDeque<ActivityEvent>,
}

impl ActivityRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, event: ActivityEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_back();
        }
        self.events.push_front(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ActivityEvent> {
        self.events.iter().cloned().collect()
    }
}
