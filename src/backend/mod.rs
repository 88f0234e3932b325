//! REST backend reader.
//!
//! Reads the contract-sourced pool subset through the backend proxy:
//!   GET {api_url}/pools?ids=1,2,3  → { "1": { ...pool fields... }, ... }
//!
//! A whole batch of stale ids goes out as one request. Any non-2xx status,
//! transport error or missing id is a read failure and is handled by the
//! batch fetcher exactly like a failed contract read.

use crate::onchain::client::{PoolRead, PoolReader, ReadError};
use crate::pool::{
    de_u256, ContractSnapshot, PoolFlags, PoolId, PoolProgress, PoolStatus, StatusTuple,
};
use alloy::primitives::U256;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Backend pool record (contract-sourced fields only).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendPool {
    /// Packed flags word, same layout as on-chain.
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub fill_percentage: f64,
    #[serde(default)]
    pub participant_count: u64,
    #[serde(default = "zero_volume", deserialize_with = "de_u256")]
    pub total_volume: U256,
    #[serde(default)]
    pub bet_count: u64,
    #[serde(default)]
    pub status: Option<PoolStatus>,
    #[serde(default)]
    pub is_event_started: bool,
    #[serde(default)]
    pub is_pool_filled: bool,
}

fn zero_volume() -> U256 {
    U256::ZERO
}

impl BackendPool {
    pub fn into_snapshot(self) -> ContractSnapshot {
        let flags = PoolFlags::from_packed(self.flags);
        let status = match self.status {
            // A settled flag always wins over whatever status string came back.
            Some(_) if flags.settled() => {
                StatusTuple::new(PoolStatus::Settled, self.is_event_started, self.is_pool_filled)
            }
            Some(status) => StatusTuple::new(status, self.is_event_started, self.is_pool_filled),
            None => StatusTuple::derive(&flags, self.is_event_started, self.is_pool_filled),
        };

        ContractSnapshot {
            flags,
            progress: PoolProgress::new(
                self.fill_percentage,
                self.participant_count,
                self.total_volume,
                self.bet_count,
            ),
            status,
        }
    }
}

/// HTTP client for the backend pool endpoint.
pub struct BackendPoolReader {
    http: Client,
    api_url: String,
}

impl BackendPoolReader {
    pub fn new(api_url: String, timeout: Duration) -> Result<Self, ReadError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch several pools with one request.
    pub async fn fetch_pools(
        &self,
        ids: &[PoolId],
    ) -> Result<HashMap<PoolId, ContractSnapshot>, ReadError> {
        let joined = ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(",");
        let url = format!("{}/pools", self.api_url);

        let resp = self.http.get(&url).query(&[("ids", joined.as_str())]).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReadError::Status { status, body });
        }

        let body = resp.text().await?;
        let pools = parse_pools_response(&body)?;
        debug!(requested = ids.len(), returned = pools.len(), "backend pools fetched");
        Ok(pools)
    }
}

pub fn parse_pools_response(body: &str) -> Result<HashMap<PoolId, ContractSnapshot>, ReadError> {
    let raw: HashMap<String, BackendPool> =
        serde_json::from_str(body).map_err(|e| ReadError::Decode(e.to_string()))?;
    Ok(raw
        .into_iter()
        .map(|(id, pool)| (PoolId::new(id), pool.into_snapshot()))
        .collect())
}

/// Give every requested id its own result from one batch response. Ids the
/// backend left out are `NotFound`; a failed request fails every id.
pub fn split_batch(
    ids: &[PoolId],
    response: Result<HashMap<PoolId, ContractSnapshot>, ReadError>,
) -> Vec<PoolRead> {
    match response {
        Ok(mut pools) => ids
            .iter()
            .map(|id| {
                let result = pools.remove(id).ok_or_else(|| ReadError::NotFound(id.clone()));
                (id.clone(), result)
            })
            .collect(),
        Err(e) => ids.iter().map(|id| (id.clone(), Err(e.clone()))).collect(),
    }
}

#[async_trait]
impl PoolReader for BackendPoolReader {
    async fn read_pool(&self, id: &PoolId) -> Result<ContractSnapshot, ReadError> {
        let mut pools = self.fetch_pools(std::slice::from_ref(id)).await?;
        pools.remove(id).ok_or_else(|| ReadError::NotFound(id.clone()))
    }

    async fn read_pools(&self, ids: &[PoolId]) -> Vec<PoolRead> {
        if ids.is_empty() {
            return Vec::new();
        }
        split_batch(ids, self.fetch_pools(ids).await)
    }

    fn batches_reads(&self) -> bool {
        true
    }

    fn source_name(&self) -> &'static str {
        "backend"
    }
}
