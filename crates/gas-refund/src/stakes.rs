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

//! Cross-chain stake scores.
//!
//! On each chain an account's locked pool shares are worth
//! `locked * pool_tracked_balance / pool_total_supply` reward tokens. The stake score is that
//! underlying amount weighted by the stake power multiplier, summed over chains.

use std::{collections::BTreeMap, sync::Arc};

use alloy::primitives::{Address, U256};
use futures_util::future::try_join_all;

use crate::{
    config::ChainConfig,
    errors::RefundError,
    locked::{LoadedLockedBalances, LockedBalanceTracker},
    pool::{LoadedPoolState, PoolStateTracker},
    source::EventSource,
};

const BPS: u64 = 10_000;

/// Balances a per-chain stake score was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportingBalances {
    pub locked_balance: U256,
    pub pool_total_supply: U256,
    pub pool_tracked_balance: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainStake {
    pub stake_score: U256,
    pub balances: SupportingBalances,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StakedScore {
    pub combined: U256,
    pub by_chain: BTreeMap<u64, ChainStake>,
}

impl StakedScore {
    /// Chains with a non-zero score.
    pub fn contributing_chains(&self) -> impl Iterator<Item = (u64, &ChainStake)> {
        self.by_chain.iter().filter(|(_, s)| !s.stake_score.is_zero()).map(|(c, s)| (*c, s))
    }
}

/// Score weighting shared by all chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeParams {
    pub staking_activation_timestamp: u64,
    pub stake_power_multiplier_bps: u64,
}

/// Trackers for one chain, not yet loaded.
pub struct ChainStakeTracker {
    chain_id: u64,
    staking_start_timestamp: u64,
    pool: PoolStateTracker,
    locked: LockedBalanceTracker,
}

impl ChainStakeTracker {
    pub fn new(chain: &ChainConfig, source: Arc<dyn EventSource>) -> Result<Self, RefundError> {
        if source.chain_id() != chain.chain_id {
            return Err(RefundError::Config(format!(
                "event source for chain {} configured as chain {}",
                source.chain_id(),
                chain.chain_id
            )));
        }
        Ok(Self {
            chain_id: chain.chain_id,
            staking_start_timestamp: chain.staking_start_timestamp,
            pool: PoolStateTracker::new(chain.pool.clone(), source.clone()),
            locked: LockedBalanceTracker::new(
                chain.locking_token,
                chain.locking_token_deployment_block,
                source,
            ),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn load(&self, start_time: u64, end_time: u64) -> Result<LoadedChainStake, RefundError> {
        let (pool, locked) = tokio::try_join!(
            self.pool.load(start_time, end_time),
            self.locked.load(start_time, end_time)
        )?;
        Ok(LoadedChainStake {
            chain_id: self.chain_id,
            staking_start_timestamp: self.staking_start_timestamp,
            pool,
            locked,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoadedChainStake {
    pub chain_id: u64,
    pub staking_start_timestamp: u64,
    pub pool: LoadedPoolState,
    pub locked: LoadedLockedBalances,
}

impl LoadedChainStake {
    fn stake_at(
        &self,
        account: &Address,
        timestamp: u64,
        multiplier_bps: u64,
    ) -> Result<ChainStake, RefundError> {
        if timestamp < self.staking_start_timestamp {
            return Ok(ChainStake::default());
        }
        let locked_balance = self.locked.balance_of(account, timestamp)?;
        let pool = self.pool.state_at(timestamp)?;
        let balances = SupportingBalances {
            locked_balance,
            pool_total_supply: pool.total_supply,
            pool_tracked_balance: pool.tracked_balance,
        };
        if locked_balance.is_zero() || pool.total_supply.is_zero() {
            return Ok(ChainStake { stake_score: U256::ZERO, balances });
        }
        let underlying = locked_balance
            .checked_mul(pool.tracked_balance)
            .ok_or(RefundError::Arithmetic("underlying stake"))?
            / pool.total_supply;
        let stake_score = underlying
            .checked_mul(U256::from(multiplier_bps))
            .ok_or(RefundError::Arithmetic("stake score"))?
            / U256::from(BPS);
        Ok(ChainStake { stake_score, balances })
    }
}

/// Combines loaded per-chain stakes into [StakedScore]s.
#[derive(Debug, Clone)]
pub struct StakeScoreAggregator {
    params: StakeParams,
    chains: BTreeMap<u64, LoadedChainStake>,
}

impl StakeScoreAggregator {
    pub fn new(params: StakeParams, chains: impl IntoIterator<Item = LoadedChainStake>) -> Self {
        Self { params, chains: chains.into_iter().map(|c| (c.chain_id, c)).collect() }
    }

    /// Loads every chain concurrently.
    pub async fn load(
        params: StakeParams,
        trackers: &[ChainStakeTracker],
        start_time: u64,
        end_time: u64,
    ) -> Result<Self, RefundError> {
        tracing::info!(
            "Loading stakes on {} chains for [{}, {}]",
            trackers.len(),
            start_time,
            end_time
        );
        let loaded = try_join_all(trackers.iter().map(|t| t.load(start_time, end_time))).await?;
        Ok(Self::new(params, loaded))
    }

    pub fn compute_stake_score(&self, account: &Address, timestamp: u64) -> Result<StakedScore, RefundError> {
        if timestamp < self.params.staking_activation_timestamp {
            return Ok(StakedScore::default());
        }
        let mut score = StakedScore::default();
        for (chain_id, chain) in &self.chains {
            let stake = chain.stake_at(account, timestamp, self.params.stake_power_multiplier_bps)?;
            score.combined = score
                .combined
                .checked_add(stake.stake_score)
                .ok_or(RefundError::Arithmetic("combined stake score"))?;
            score.by_chain.insert(*chain_id, stake);
        }
        Ok(score)
    }
}
