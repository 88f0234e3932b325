//! Pool data model shared by the cache, the readers and the sync engine.
//!
//! A pool's contract-sourced state is split into three field families that
//! are merged under different rules:
//! - `PoolFlags`: decoded from the packed on-chain integer, never patched
//! - `PoolProgress`: fill / participant / volume aggregates
//! - `StatusTuple`: lifecycle status plus the booleans coupled to it

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Stable pool identifier. Numeric on-chain ids and string backend ids are
/// both carried as their canonical decimal/string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as a contract argument. `None` for non-numeric ids.
    pub fn to_u256(&self) -> Option<U256> {
        U256::from_str_radix(&self.0, 10).ok()
    }
}

impl From<u64> for PoolId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for PoolId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PoolId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Num(u64),
            Str(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Num(n) => PoolId::from(n),
            RawId::Str(s) => PoolId::new(s),
        })
    }
}

const FLAG_SETTLED: u64 = 1 << 0;
const FLAG_CREATOR_SIDE_WON: u64 = 1 << 1;
const KNOWN_FLAGS: u64 = FLAG_SETTLED | FLAG_CREATOR_SIDE_WON;

/// Booleans decoded from the packed flags word. Only constructible from the
/// packed source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolFlags {
    settled: bool,
    creator_side_won: bool,
    /// Bits above the known ones, kept verbatim.
    reserved: u64,
}

impl PoolFlags {
    pub fn from_packed(packed: u64) -> Self {
        Self {
            settled: packed & FLAG_SETTLED != 0,
            creator_side_won: packed & FLAG_CREATOR_SIDE_WON != 0,
            reserved: packed & !KNOWN_FLAGS,
        }
    }

    pub fn settled(&self) -> bool {
        self.settled
    }

    pub fn creator_side_won(&self) -> bool {
        self.creator_side_won
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn packed(&self) -> u64 {
        let mut packed = self.reserved;
        if self.settled {
            packed |= FLAG_SETTLED;
        }
        if self.creator_side_won {
            packed |= FLAG_CREATOR_SIDE_WON;
        }
        packed
    }
}

/// Mutable aggregate fields of a pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolProgress {
    /// 0–100, always clamped.
    pub fill_percentage: f64,
    pub participant_count: u64,
    /// Total staked volume in base units.
    pub total_volume: U256,
    pub bet_count: u64,
}

impl PoolProgress {
    pub fn new(
        fill_percentage: f64,
        participant_count: u64,
        total_volume: U256,
        bet_count: u64,
    ) -> Self {
        Self {
            fill_percentage: clamp_fill(fill_percentage),
            participant_count,
            total_volume,
            bet_count,
        }
    }

    pub fn zeroed() -> Self {
        Self::new(0.0, 0, U256::ZERO, 0)
    }
}

impl Default for PoolProgress {
    fn default() -> Self {
        Self::zeroed()
    }
}

pub fn clamp_fill(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Active,
    Closed,
    Settled,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStatus::Active => write!(f, "active"),
            PoolStatus::Closed => write!(f, "closed"),
            PoolStatus::Settled => write!(f, "settled"),
        }
    }
}

impl FromStr for PoolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "open" => Ok(PoolStatus::Active),
            "closed" => Ok(PoolStatus::Closed),
            "settled" | "resolved" => Ok(PoolStatus::Settled),
            other => Err(format!("unknown pool status: {other}")),
        }
    }
}

/// Lifecycle status and its coupled booleans. Always replaced as a whole;
/// `can_bet` is derived so it cannot disagree with `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusTuple {
    status: PoolStatus,
    can_bet: bool,
    is_event_started: bool,
    is_pool_filled: bool,
}

impl StatusTuple {
    pub fn new(status: PoolStatus, is_event_started: bool, is_pool_filled: bool) -> Self {
        Self {
            status,
            can_bet: status == PoolStatus::Active,
            is_event_started,
            is_pool_filled,
        }
    }

    /// Derive the lifecycle from contract data: settled beats everything,
    /// a started event or a full pool closes betting.
    pub fn derive(flags: &PoolFlags, is_event_started: bool, is_pool_filled: bool) -> Self {
        let status = if flags.settled() {
            PoolStatus::Settled
        } else if is_event_started || is_pool_filled {
            PoolStatus::Closed
        } else {
            PoolStatus::Active
        };
        Self::new(status, is_event_started, is_pool_filled)
    }

    pub fn status(&self) -> PoolStatus {
        self.status
    }

    pub fn can_bet(&self) -> bool {
        self.can_bet
    }

    pub fn is_event_started(&self) -> bool {
        self.is_event_started
    }

    pub fn is_pool_filled(&self) -> bool {
        self.is_pool_filled
    }
}

/// The contract-sourced subset of a pool, as returned by one read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractSnapshot {
    pub flags: PoolFlags,
    pub progress: PoolProgress,
    pub status: StatusTuple,
}

impl ContractSnapshot {
    /// Substituted for a failed read: all flags false, zeroed progress and
    /// betting closed.
    pub fn fallback() -> Self {
        Self {
            flags: PoolFlags::default(),
            progress: PoolProgress::zeroed(),
            status: StatusTuple::new(PoolStatus::Closed, false, false),
        }
    }
}

/// One synchronised pool as seen by consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolState {
    pub id: PoolId,
    pub flags: PoolFlags,
    pub progress: PoolProgress,
    pub status: StatusTuple,
}

impl PoolState {
    /// Placeholder for a pool first seen through a live event.
    pub fn placeholder(id: PoolId) -> Self {
        Self {
            id,
            flags: PoolFlags::default(),
            progress: PoolProgress::zeroed(),
            status: StatusTuple::new(PoolStatus::Active, false, false),
        }
    }

    pub fn from_snapshot(id: PoolId, snapshot: ContractSnapshot) -> Self {
        Self {
            id,
            flags: snapshot.flags,
            progress: snapshot.progress,
            status: snapshot.status,
        }
    }
}

/// Accepts a decimal string, a `0x` hex string or a JSON integer.
pub(crate) fn de_u256<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAmount {
        Num(u64),
        Str(String),
    }

    match RawAmount::deserialize(deserializer)? {
        RawAmount::Num(n) => Ok(U256::from(n)),
        RawAmount::Str(s) => parse_u256(&s).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn parse_u256(raw: &str) -> Result<U256, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(raw, 10),
    };
    parsed.map_err(|e| format!("invalid amount {raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_decode_known_and_reserved_bits() {
        let flags = PoolFlags::from_packed(0b1011);
        assert!(flags.settled());
        assert!(flags.creator_side_won());
        assert_eq!(flags.reserved(), 0b1000);
        assert_eq!(flags.packed(), 0b1011);

        let none = PoolFlags::from_packed(0);
        assert!(!none.settled());
        assert!(!none.creator_side_won());
    }

    #[test]
    fn test_fill_percentage_is_clamped() {
        assert_eq!(PoolProgress::new(140.0, 0, U256::ZERO, 0).fill_percentage, 100.0);
        assert_eq!(PoolProgress::new(-3.0, 0, U256::ZERO, 0).fill_percentage, 0.0);
        assert_eq!(clamp_fill(f64::NAN), 0.0);
    }

    #[test]
    fn test_status_tuple_can_bet_follows_status() {
        assert!(StatusTuple::new(PoolStatus::Active, false, false).can_bet());
        assert!(!StatusTuple::new(PoolStatus::Closed, false, false).can_bet());
        assert!(!StatusTuple::new(PoolStatus::Settled, true, true).can_bet());
    }

    #[test]
    fn test_status_derivation_from_contract_data() {
        let open = PoolFlags::from_packed(0);
        let settled = PoolFlags::from_packed(1);
        assert_eq!(StatusTuple::derive(&open, false, false).status(), PoolStatus::Active);
        assert_eq!(StatusTuple::derive(&open, true, false).status(), PoolStatus::Closed);
        assert_eq!(StatusTuple::derive(&open, false, true).status(), PoolStatus::Closed);
        assert_eq!(StatusTuple::derive(&settled, false, false).status(), PoolStatus::Settled);
    }

    #[test]
    fn test_fallback_has_betting_closed() {
        let fallback = ContractSnapshot::fallback();
        assert!(!fallback.flags.settled());
        assert!(!fallback.status.can_bet());
        assert_eq!(fallback.progress, PoolProgress::zeroed());
    }

    #[test]
    fn test_pool_id_accepts_numbers_and_strings() {
        let ids: Vec<PoolId> = serde_json::from_str(r#"[42, "43", " abc "]"#).unwrap();
        assert_eq!(ids[0], PoolId::from(42));
        assert_eq!(ids[1].to_u256(), Some(U256::from(43)));
        assert_eq!(ids[2].as_str(), "abc");
        assert_eq!(ids[2].to_u256(), None);
    }

    #[test]
    fn test_large_volumes_keep_precision() {
        // 10^30 base units, beyond f64 integer precision
        let v = parse_u256("1000000000000000000000000000001").unwrap();
        assert_eq!(v.to_string(), "1000000000000000000000000000001");
        assert_eq!(parse_u256("0x10").unwrap(), U256::from(16));
        assert!(parse_u256("12.5").is_err());
    }
}
