//! On-chain read path for pool state.
//!
//! Architecture:
//! - `PoolReader`: the contract read boundary (one typed read per pool id)
//! - `RpcPoolReader`: reads the pool contract over JSON-RPC via alloy
//! - `TtlCache`: last successful read per pool with lazy freshness checks
//! - `BatchFetcher`: owns the cache, reads stale ids concurrently and
//!   substitutes a fallback value for each failed read
//!
//! The sync engine only ever sees `BatchFetcher` output; the cache is never
//! handed out.

pub mod abi;
pub mod cache;
pub mod client;
pub mod fetcher;
pub mod testing;

pub use cache::{Lookup, TtlCache};
pub use client::{PoolRead, PoolReader, ReadError, RpcPoolReader};
pub use fetcher::{BatchFetcher, BatchReport, BatchResult, FetchedPool, Origin};
