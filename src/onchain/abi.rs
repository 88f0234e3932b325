//! Pool contract view-function bindings and return-value decoding.
//!
//! Only the read path is bound here. The decoded words are turned into a
//! `ContractSnapshot` by `decode_pool_state`, which owns all the derivation
//! rules (packed flags, fill percentage, lifecycle status).

use crate::pool::{ContractSnapshot, PoolFlags, PoolProgress, StatusTuple};
use alloy::primitives::{keccak256, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

sol! {
    #[sol(rpc)]
    interface IPredictionPools {
        /// Packed flags: bit 0 settled, bit 1 creator side won, rest reserved.
        function getPoolState(uint256 poolId) external view returns (
            uint256 packedFlags,
            uint256 totalVolume,
            uint256 maxVolume,
            uint256 participantCount,
            uint256 betCount,
            bool eventStarted
        );
    }
}

/// Solidity signature of the pool read, used to cross-check the selector.
pub const GET_POOL_STATE_SIGNATURE: &str = "getPoolState(uint256)";

/// Raw words returned by `getPoolState`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStateWords {
    pub packed_flags: U256,
    pub total_volume: U256,
    pub max_volume: U256,
    pub participant_count: U256,
    pub bet_count: U256,
    pub event_started: bool,
}

impl From<IPredictionPools::getPoolStateReturn> for PoolStateWords {
    fn from(ret: IPredictionPools::getPoolStateReturn) -> Self {
        Self {
            packed_flags: ret.packedFlags,
            total_volume: ret.totalVolume,
            max_volume: ret.maxVolume,
            participant_count: ret.participantCount,
            bet_count: ret.betCount,
            event_started: ret.eventStarted,
        }
    }
}

/// Fill percentage with two decimals, computed in integer math so large
/// volumes do not lose precision before the final division.
pub fn fill_percentage(total: U256, max: U256) -> f64 {
    if max.is_zero() {
        return 0.0;
    }
    let basis_points = total.saturating_mul(U256::from(10_000u64)) / max;
    let capped = basis_points.min(U256::from(10_000u64));
    capped.to::<u64>() as f64 / 100.0
}

fn saturating_u64(word: U256) -> u64 {
    if word > U256::from(u64::MAX) {
        u64::MAX
    } else {
        word.to::<u64>()
    }
}

pub fn decode_pool_state(words: &PoolStateWords) -> ContractSnapshot {
    let flags = PoolFlags::from_packed(saturating_u64(words.packed_flags));
    let is_pool_filled = !words.max_volume.is_zero() && words.total_volume >= words.max_volume;
    let progress = PoolProgress::new(
        fill_percentage(words.total_volume, words.max_volume),
        saturating_u64(words.participant_count),
        words.total_volume,
        saturating_u64(words.bet_count),
    );
    let status = StatusTuple::derive(&flags, words.event_started, is_pool_filled);

    ContractSnapshot {
        flags,
        progress,
        status,
    }
}

/// Check the generated selector against the signature hash.
/// Call this at startup to catch binding drift.
pub fn verify_selectors() -> Vec<(String, bool)> {
    let computed = keccak256(GET_POOL_STATE_SIGNATURE.as_bytes());
    let matches = computed[..4] == IPredictionPools::getPoolStateCall::SELECTOR;
    vec![(GET_POOL_STATE_SIGNATURE.to_string(), matches)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolStatus;

    fn words(total: u64, max: u64, flags: u64, started: bool) -> PoolStateWords {
        PoolStateWords {
            packed_flags: U256::from(flags),
            total_volume: U256::from(total),
            max_volume: U256::from(max),
            participant_count: U256::from(4u64),
            bet_count: U256::from(6u64),
            event_started: started,
        }
    }

    #[test]
    fn test_selector_matches_signature() {
        assert!(verify_selectors().iter().all(|(_, ok)| *ok));
    }

    #[test]
    fn test_fill_percentage_integer_math() {
        assert_eq!(fill_percentage(U256::from(1u64), U256::from(3u64)), 33.33);
        assert_eq!(fill_percentage(U256::from(5u64), U256::from(4u64)), 100.0);
        assert_eq!(fill_percentage(U256::from(5u64), U256::ZERO), 0.0);

        let wei = U256::from(10u64).pow(U256::from(30u64));
        assert_eq!(fill_percentage(wei, wei * U256::from(2u64)), 50.0);
    }

    #[test]
    fn test_decode_open_pool() {
        let snapshot = decode_pool_state(&words(250, 1000, 0, false));
        assert_eq!(snapshot.progress.fill_percentage, 25.0);
        assert_eq!(snapshot.progress.participant_count, 4);
        assert_eq!(snapshot.progress.bet_count, 6);
        assert_eq!(snapshot.status.status(), PoolStatus::Active);
        assert!(snapshot.status.can_bet());
    }

    #[test]
    fn test_decode_filled_and_settled_pools() {
        let filled = decode_pool_state(&words(1000, 1000, 0, false));
        assert!(filled.status.is_pool_filled());
        assert_eq!(filled.status.status(), PoolStatus::Closed);

        let settled = decode_pool_state(&words(1000, 1000, 0b11, true));
        assert!(settled.flags.settled());
        assert!(settled.flags.creator_side_won());
        assert_eq!(settled.status.status(), PoolStatus::Settled);
        assert!(!settled.status.can_bet());
    }
}
