//! Contract read boundary.
//!
//! `PoolReader` is the single seam through which reconciliation reads pool
//! state. `RpcPoolReader` reads straight from the pool contract over JSON-RPC;
//! `crate::backend::BackendPoolReader` reads the same subset through the REST
//! proxy. Neither retries: a failed read is reported once and the batch
//! fetcher substitutes the fallback value.

use crate::onchain::abi::{decode_pool_state, IPredictionPools, PoolStateWords};
use crate::pool::{ContractSnapshot, PoolId};
use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use futures::future::join_all;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone)]
pub enum ReadError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("contract call reverted or failed: {0}")]
    Contract(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("pool {0} not present in response")]
    NotFound(PoolId),
    #[error("pool id {0} is not a valid contract argument")]
    InvalidPoolId(PoolId),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

impl From<reqwest::Error> for ReadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ReadError::Decode(e.to_string())
        } else {
            ReadError::Transport(e.to_string())
        }
    }
}

/// One id's outcome from `PoolReader::read_pools`.
pub type PoolRead = (PoolId, Result<ContractSnapshot, ReadError>);

/// One typed read of a pool's contract-sourced state.
#[async_trait]
pub trait PoolReader: Send + Sync {
    async fn read_pool(&self, id: &PoolId) -> Result<ContractSnapshot, ReadError>;

    /// Read several pools, one result per id. The default issues one
    /// `read_pool` per id concurrently.
    async fn read_pools(&self, ids: &[PoolId]) -> Vec<PoolRead> {
        join_all(ids.iter().map(|id| async move { (id.clone(), self.read_pool(id).await) })).await
    }

    /// True when `read_pools` costs a single round trip, so the batch
    /// fetcher should prefer it over per-id reads.
    fn batches_reads(&self) -> bool {
        false
    }

    /// Short label for logs.
    fn source_name(&self) -> &'static str;
}

#[async_trait]
impl<R: PoolReader + ?Sized> PoolReader for Arc<R> {
    async fn read_pool(&self, id: &PoolId) -> Result<ContractSnapshot, ReadError> {
        (**self).read_pool(id).await
    }

    async fn read_pools(&self, ids: &[PoolId]) -> Vec<PoolRead> {
        (**self).read_pools(ids).await
    }

    fn batches_reads(&self) -> bool {
        (**self).batches_reads()
    }

    fn source_name(&self) -> &'static str {
        (**self).source_name()
    }
}

/// Reads pool state from the pool contract over HTTP JSON-RPC.
pub struct RpcPoolReader {
    provider: DynProvider,
    contract: Address,
}

impl RpcPoolReader {
    pub fn new(rpc_url: &str, contract: &str) -> Result<Self, ReadError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| ReadError::Endpoint(format!("{rpc_url}: {e}")))?;
        let contract = Address::from_str(contract)
            .map_err(|e| ReadError::Endpoint(format!("contract address {contract}: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();

        Ok(Self { provider, contract })
    }

    pub fn contract(&self) -> Address {
        self.contract
    }
}

#[async_trait]
impl PoolReader for RpcPoolReader {
    async fn read_pool(&self, id: &PoolId) -> Result<ContractSnapshot, ReadError> {
        let arg = id.to_u256().ok_or_else(|| ReadError::InvalidPoolId(id.clone()))?;
        let pools = IPredictionPools::new(self.contract, self.provider.clone());

        let ret = pools.getPoolState(arg).call().await.map_err(|e| match e {
            alloy::contract::Error::TransportError(t) => ReadError::Transport(t.to_string()),
            other => ReadError::Contract(other.to_string()),
        })?;

        let words = PoolStateWords::from(ret);
        debug!(pool_id = %id, flags = %words.packed_flags, "pool state read from contract");
        Ok(decode_pool_state(&words))
    }

    fn source_name(&self) -> &'static str {
        "rpc"
    }
}
