// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Access to on-chain events and state.

use std::collections::{HashMap, HashSet};

use alloy::{
    primitives::{Address, U256},
    providers::{
        fillers::{ChainIdFiller, FillProvider, JoinFill},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::{
        client::RpcClient,
        types::{BlockId, BlockNumberOrTag, Filter, Log},
    },
    sol_types::SolEvent,
    transports::layers::RetryBackoffLayer,
};
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use tokio::sync::Mutex;
use url::Url;

use crate::{
    config::PoolConfig,
    events::{
        decode_lock_log, decode_pool_log, ChainEvent, ILockingToken, IPoolShare, IPoolVault,
        LockTransfer, PoolEvent, PoolEventCategory,
    },
};

/// Chunk size for log queries to avoid rate limiting
pub const LOG_QUERY_CHUNK_SIZE: u64 = 5000;

/// Number of concurrent block header requests.
const BLOCK_FETCH_CHUNK_SIZE: usize = 50;

/// Absolute pool state at a block, in vault token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolState {
    pub tokens: Vec<Address>,
    pub total_supply: U256,
    pub balances: Vec<U256>,
}

/// Supplies decoded events, block timestamps and absolute state for one chain.
///
/// Retry policy belongs to implementations; callers treat every error as fatal.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn latest_block(&self) -> anyhow::Result<u64>;

    /// First block with a timestamp at or after `timestamp`, or `latest + 1` if there is none yet.
    async fn block_at_or_after(&self, timestamp: u64) -> anyhow::Result<u64>;

    async fn fetch_pool_events(
        &self,
        pool: &PoolConfig,
        category: PoolEventCategory,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<ChainEvent<PoolEvent>>>;

    async fn fetch_lock_events(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<ChainEvent<LockTransfer>>>;

    async fn resolve_block_timestamps(&self, blocks: &[u64]) -> anyhow::Result<HashMap<u64, u64>>;

    async fn fetch_pool_state(&self, pool: &PoolConfig, at_block: u64) -> anyhow::Result<PoolState>;
}

/// Query logs in chunks to avoid rate limiting
pub async fn query_logs_chunked<P: Provider>(
    provider: &P,
    filter: Filter,
    from_block: u64,
    to_block: u64,
) -> anyhow::Result<Vec<Log>> {
    let mut all_logs = Vec::new();
    let mut current_from = from_block;

    while current_from <= to_block {
        let current_to = (current_from + LOG_QUERY_CHUNK_SIZE - 1).min(to_block);

        let chunk_filter = filter
            .clone()
            .from_block(BlockNumberOrTag::Number(current_from))
            .to_block(BlockNumberOrTag::Number(current_to));

        let logs = provider
            .get_logs(&chunk_filter)
            .await
            .with_context(|| format!("eth_getLogs failed for blocks {current_from}..={current_to}"))?;
        all_logs.extend(logs);

        current_from = current_to + 1;
    }

    Ok(all_logs)
}

pub type ProviderType = FillProvider<JoinFill<Identity, ChainIdFiller>, RootProvider>;

/// [EventSource] backed by a JSON-RPC provider.
pub struct RpcEventSource<P> {
    provider: P,
    chain_id: u64,
    block_timestamp_cache: Mutex<HashMap<u64, u64>>,
}

impl RpcEventSource<ProviderType> {
    /// Connects over HTTP with retry and backoff.
    pub async fn connect(rpc_url: Url) -> anyhow::Result<Self> {
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .filler(ChainIdFiller::default())
            .connect_client(
                RpcClient::builder().layer(RetryBackoffLayer::new(3, 1000, 200)).http(rpc_url),
            );
        let chain_id = provider.get_chain_id().await.context("failed to query chain id")?;
        Ok(Self::new(provider, chain_id))
    }
}

impl<P: Provider> RpcEventSource<P> {
    pub fn new(provider: P, chain_id: u64) -> Self {
        Self { provider, chain_id, block_timestamp_cache: Mutex::new(HashMap::new()) }
    }

    async fn block_timestamp(&self, block: u64) -> anyhow::Result<u64> {
        if let Some(ts) = self.block_timestamp_cache.lock().await.get(&block) {
            return Ok(*ts);
        }
        let header = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block))
            .await?
            .with_context(|| format!("block {block} not found"))?;
        let ts = header.header.timestamp;
        self.block_timestamp_cache.lock().await.insert(block, ts);
        Ok(ts)
    }

    fn pool_filters(pool: &PoolConfig, category: PoolEventCategory) -> Vec<Filter> {
        match category {
            PoolEventCategory::SupplyChanges => {
                let transfers =
                    Filter::new().address(pool.pool).event_signature(IPoolShare::Transfer::SIGNATURE_HASH);
                vec![
                    transfers.clone().topic1(Address::ZERO.into_word()),
                    transfers.topic2(Address::ZERO.into_word()),
                ]
            }
            PoolEventCategory::LiquidityChanges => vec![Filter::new()
                .address(pool.vault)
                .event_signature(vec![
                    IPoolVault::LiquidityAdded::SIGNATURE_HASH,
                    IPoolVault::LiquidityRemoved::SIGNATURE_HASH,
                ])
                .topic1(pool.pool.into_word())],
            PoolEventCategory::Swaps => vec![Filter::new()
                .address(pool.vault)
                .event_signature(IPoolVault::Swap::SIGNATURE_HASH)
                .topic1(pool.pool.into_word())],
        }
    }
}

#[async_trait]
impl<P: Provider> EventSource for RpcEventSource<P> {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_block(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block_at_or_after(&self, timestamp: u64) -> anyhow::Result<u64> {
        let latest = self.latest_block().await?;
        if self.block_timestamp(latest).await? < timestamp {
            return Ok(latest + 1);
        }

        let (mut lo, mut hi) = (0u64, latest);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.block_timestamp(mid).await? >= timestamp {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    async fn fetch_pool_events(
        &self,
        pool: &PoolConfig,
        category: PoolEventCategory,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<ChainEvent<PoolEvent>>> {
        let mut events = Vec::new();
        for filter in Self::pool_filters(pool, category) {
            let logs = query_logs_chunked(&self.provider, filter, from_block, to_block).await?;
            for log in &logs {
                events.push(decode_pool_log(log, category)?);
            }
        }
        tracing::debug!(
            "Fetched {} {} events for pool {:#x} on chain {} (blocks {}..={})",
            events.len(),
            category.as_str(),
            pool.pool,
            self.chain_id,
            from_block,
            to_block
        );
        Ok(events)
    }

    async fn fetch_lock_events(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<ChainEvent<LockTransfer>>> {
        let filter =
            Filter::new().address(token).event_signature(ILockingToken::Transfer::SIGNATURE_HASH);
        let logs = query_logs_chunked(&self.provider, filter, from_block, to_block).await?;
        let events = logs.iter().map(decode_lock_log).collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            "Fetched {} locking token transfers for {:#x} on chain {}",
            events.len(),
            token,
            self.chain_id
        );
        Ok(events)
    }

    async fn resolve_block_timestamps(&self, blocks: &[u64]) -> anyhow::Result<HashMap<u64, u64>> {
        let unique: HashSet<u64> = blocks.iter().copied().collect();
        let unique: Vec<u64> = unique.into_iter().collect();

        let mut timestamps = HashMap::with_capacity(unique.len());
        for chunk in unique.chunks(BLOCK_FETCH_CHUNK_SIZE) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|&block| async move { Ok::<_, anyhow::Error>((block, self.block_timestamp(block).await?)) })
                .collect();
            timestamps.extend(try_join_all(futures).await?);
        }
        Ok(timestamps)
    }

    async fn fetch_pool_state(&self, pool: &PoolConfig, at_block: u64) -> anyhow::Result<PoolState> {
        let block = BlockId::number(at_block);
        let share = IPoolShare::new(pool.pool, &self.provider);
        let vault = IPoolVault::new(pool.vault, &self.provider);

        let total_supply_call = share.totalSupply().block(block);
        let token_info_call = vault.getPoolTokenInfo(pool.pool).block(block);
        let (total_supply, token_info) =
            tokio::join!(total_supply_call.call(), token_info_call.call());
        let total_supply = total_supply.context("totalSupply call failed")?;
        let token_info = token_info.context("getPoolTokenInfo call failed")?;

        if token_info.tokens.len() != token_info.balancesRaw.len() {
            bail!(
                "pool {:#x} returned {} tokens but {} balances",
                pool.pool,
                token_info.tokens.len(),
                token_info.balancesRaw.len()
            );
        }

        Ok(PoolState {
            tokens: token_info.tokens,
            total_supply,
            balances: token_info.balancesRaw,
        })
    }
}
