//! Real-time prediction-pool state synchronisation.
//!
//! Contract reads go through a TTL cache (`onchain`), live activity arrives
//! over a websocket (`ws`), and `sync` merges both into one consistent view
//! that consumers read or subscribe to.

pub mod backend;
pub mod clock;
pub mod config;
pub mod onchain;
pub mod pool;
pub mod sync;
pub mod ws;
