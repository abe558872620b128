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

//! Differential reconstruction of a two-token pool: share supply and both token balances.
//!
//! A load fetches the absolute state just before the interval and every supply, liquidity
//! and swap event inside it, then folds the events into three delta series. Queries inside the
//! interval are answered as `initial + prefix sum` without touching the chain again.
//!
//! Event-to-delta rules:
//! - share mint `+amount` / burn `-amount` on the supply series
//! - liquidity add `+(amount - fee / 2)` per token, removal the negation
//! - swap: token in `+(amount_in - fee / 2)`, token out `-amount_out`

use std::{collections::HashMap, sync::Arc};

use alloy::primitives::{Address, I256, U256};
use tokio::sync::OnceCell;

use crate::{
    config::PoolConfig,
    errors::RefundError,
    events::{ChainEvent, PoolEvent, PoolEventCategory},
    source::EventSource,
    timeseries::{signed, Delta, TimeSeries},
};

/// Pool state at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub total_supply: U256,
    /// Balance of the reward token.
    pub tracked_balance: U256,
    /// Balance of the other pool token.
    pub paired_balance: U256,
}

/// Position of the reward token within the vault's token list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenOrder {
    pub tracked: Address,
    pub paired: Address,
    pub tracked_index: usize,
}

impl TokenOrder {
    pub fn resolve(tokens: &[Address], tracked_token: Option<Address>) -> Result<Self, RefundError> {
        if tokens.len() != 2 {
            return Err(RefundError::invariant(format!(
                "expected a two-token pool, got {} tokens",
                tokens.len()
            )));
        }
        let tracked_index = match tracked_token {
            Some(token) => tokens.iter().position(|t| *t == token).ok_or_else(|| {
                RefundError::invariant(format!("token {token:#x} is not part of the pool"))
            })?,
            None => 0,
        };
        Ok(Self {
            tracked: tokens[tracked_index],
            paired: tokens[1 - tracked_index],
            tracked_index,
        })
    }

    /// Splits a per-token array into `(tracked, paired)`.
    pub fn split<T: Copy>(&self, values: &[T]) -> Result<(T, T), RefundError> {
        if values.len() != 2 {
            return Err(RefundError::invariant(format!(
                "expected 2 per-token values, got {}",
                values.len()
            )));
        }
        Ok((values[self.tracked_index], values[1 - self.tracked_index]))
    }
}

/// Deltas accumulated from a batch of pool events.
#[derive(Debug, Clone, Default)]
pub struct PoolDeltas {
    pub supply: Vec<Delta>,
    pub tracked: Vec<Delta>,
    pub paired: Vec<Delta>,
}

fn net_of_half_fee(amount: U256, fee: U256) -> Result<I256, RefundError> {
    Ok(signed(amount)? - signed(fee / U256::from(2))?)
}

impl PoolDeltas {
    /// Returns the accumulator extended by one event.
    pub fn apply(
        mut self,
        order: &TokenOrder,
        timestamp: u64,
        event: &PoolEvent,
    ) -> Result<Self, RefundError> {
        match event {
            PoolEvent::SharesMinted { amount } => {
                self.supply.push(Delta::new(timestamp, signed(*amount)?));
            }
            PoolEvent::SharesBurned { amount } => {
                self.supply.push(Delta::new(timestamp, -signed(*amount)?));
            }
            PoolEvent::LiquidityAdded { amounts, swap_fees }
            | PoolEvent::LiquidityRemoved { amounts, swap_fees } => {
                let (tracked_amount, paired_amount) = order.split(amounts)?;
                let (tracked_fee, paired_fee) = order.split(swap_fees)?;
                let mut tracked = net_of_half_fee(tracked_amount, tracked_fee)?;
                let mut paired = net_of_half_fee(paired_amount, paired_fee)?;
                if matches!(event, PoolEvent::LiquidityRemoved { .. }) {
                    tracked = -tracked;
                    paired = -paired;
                }
                self.tracked.push(Delta::new(timestamp, tracked));
                self.paired.push(Delta::new(timestamp, paired));
            }
            PoolEvent::Swap { token_in, token_out, amount_in, amount_out, swap_fee } => {
                let incoming = net_of_half_fee(*amount_in, swap_fee.unwrap_or(U256::ZERO))?;
                let outgoing = -signed(*amount_out)?;
                if *token_in == order.tracked {
                    self.tracked.push(Delta::new(timestamp, incoming));
                    self.paired.push(Delta::new(timestamp, outgoing));
                } else if *token_out == order.tracked {
                    self.paired.push(Delta::new(timestamp, incoming));
                    self.tracked.push(Delta::new(timestamp, outgoing));
                } else {
                    return Err(RefundError::invariant(format!(
                        "swap {token_in:#x} -> {token_out:#x} does not involve tracked token {:#x}",
                        order.tracked
                    )));
                }
            }
        }
        Ok(self)
    }

    /// Folds timestamped events into a fresh accumulator.
    pub fn fold<'a>(
        order: &TokenOrder,
        events: impl IntoIterator<Item = (u64, &'a PoolEvent)>,
    ) -> Result<Self, RefundError> {
        events
            .into_iter()
            .try_fold(PoolDeltas::default(), |acc, (timestamp, event)| acc.apply(order, timestamp, event))
    }
}

/// Pool state reconstructed over `[start_time, end_time]`.
#[derive(Debug, Clone)]
pub struct LoadedPoolState {
    pub chain_id: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub start_block: u64,
    pub end_block: u64,
    pub token_order: TokenOrder,
    /// Absolute state as of `start_block - 1`.
    pub init: PoolSnapshot,
    supply: TimeSeries,
    tracked: TimeSeries,
    paired: TimeSeries,
}

impl LoadedPoolState {
    pub fn from_parts(
        chain_id: u64,
        (start_time, end_time): (u64, u64),
        (start_block, end_block): (u64, u64),
        token_order: TokenOrder,
        init: PoolSnapshot,
        deltas: PoolDeltas,
    ) -> Result<Self, RefundError> {
        Ok(Self {
            chain_id,
            start_time,
            end_time,
            start_block,
            end_block,
            token_order,
            init,
            supply: TimeSeries::from_deltas(deltas.supply)?,
            tracked: TimeSeries::from_deltas(deltas.tracked)?,
            paired: TimeSeries::from_deltas(deltas.paired)?,
        })
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        (self.start_time..=self.end_time).contains(&timestamp)
    }

    /// State at `timestamp`; fails outside the loaded interval.
    pub fn state_at(&self, timestamp: u64) -> Result<PoolSnapshot, RefundError> {
        if !self.contains(timestamp) {
            return Err(RefundError::OutOfRange {
                timestamp,
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(PoolSnapshot {
            total_supply: self.supply.reduce_at(self.init.total_supply, timestamp)?,
            tracked_balance: self.tracked.reduce_at(self.init.tracked_balance, timestamp)?,
            paired_balance: self.paired.reduce_at(self.init.paired_balance, timestamp)?,
        })
    }
}

/// Resolves the block range covering `[start_time, end_time]`.
pub(crate) async fn resolve_block_range(
    source: &dyn EventSource,
    start_time: u64,
    end_time: u64,
) -> Result<(u64, u64), RefundError> {
    let chain_id = source.chain_id();
    if start_time > end_time {
        return Err(RefundError::invariant(format!(
            "interval start {start_time} is after its end {end_time}"
        )));
    }
    let start_block = source
        .block_at_or_after(start_time)
        .await
        .map_err(|e| RefundError::fetch(chain_id, "resolve interval start block", e))?;
    let end_block = source
        .block_at_or_after(end_time.saturating_add(1))
        .await
        .map_err(|e| RefundError::fetch(chain_id, "resolve interval end block", e))?
        .saturating_sub(1);
    Ok((start_block, end_block))
}

/// Timestamps for the blocks of the given events.
pub(crate) async fn event_timestamps<E>(
    source: &dyn EventSource,
    events: &[&ChainEvent<E>],
) -> Result<HashMap<u64, u64>, RefundError> {
    let blocks: Vec<u64> = events.iter().map(|e| e.block_number).collect();
    if blocks.is_empty() {
        return Ok(HashMap::new());
    }
    source
        .resolve_block_timestamps(&blocks)
        .await
        .map_err(|e| RefundError::fetch(source.chain_id(), "resolve block timestamps", e))
}

pub(crate) fn timestamp_of(timestamps: &HashMap<u64, u64>, block: u64) -> Result<u64, RefundError> {
    timestamps
        .get(&block)
        .copied()
        .ok_or_else(|| RefundError::invariant(format!("missing timestamp for block {block}")))
}

/// Loads [LoadedPoolState]s for one pool on one chain.
pub struct PoolStateTracker {
    pool: PoolConfig,
    source: Arc<dyn EventSource>,
    token_order: OnceCell<TokenOrder>,
}

impl PoolStateTracker {
    pub fn new(pool: PoolConfig, source: Arc<dyn EventSource>) -> Self {
        Self { pool, source, token_order: OnceCell::new() }
    }

    pub fn chain_id(&self) -> u64 {
        self.source.chain_id()
    }

    async fn fetch_category(
        &self,
        category: PoolEventCategory,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent<PoolEvent>>, RefundError> {
        if from_block > to_block {
            return Ok(Vec::new());
        }
        self.source
            .fetch_pool_events(&self.pool, category, from_block, to_block)
            .await
            .map_err(|e| {
                RefundError::fetch(
                    self.chain_id(),
                    match category {
                        PoolEventCategory::SupplyChanges => "load pool supply changes",
                        PoolEventCategory::LiquidityChanges => "load pool liquidity changes",
                        PoolEventCategory::Swaps => "load pool swaps",
                    },
                    e,
                )
            })
    }

    pub async fn load(&self, start_time: u64, end_time: u64) -> Result<LoadedPoolState, RefundError> {
        let chain_id = self.chain_id();
        let (start_block, end_block) =
            resolve_block_range(self.source.as_ref(), start_time, end_time).await?;
        let init_block = start_block.saturating_sub(1);

        let init_state = self
            .source
            .fetch_pool_state(&self.pool, init_block)
            .await
            .map_err(|e| RefundError::fetch(chain_id, "fetch initial pool state", e))?;
        let order = *self
            .token_order
            .get_or_try_init(|| async { TokenOrder::resolve(&init_state.tokens, self.pool.tracked_token) })
            .await?;
        let (tracked_balance, paired_balance) = order.split(&init_state.balances)?;
        let init = PoolSnapshot { total_supply: init_state.total_supply, tracked_balance, paired_balance };

        let (supply, liquidity, swaps) = tokio::try_join!(
            self.fetch_category(PoolEventCategory::SupplyChanges, start_block, end_block),
            self.fetch_category(PoolEventCategory::LiquidityChanges, start_block, end_block),
            self.fetch_category(PoolEventCategory::Swaps, start_block, end_block),
        )?;

        let mut events: Vec<&ChainEvent<PoolEvent>> =
            supply.iter().chain(liquidity.iter()).chain(swaps.iter()).collect();
        events.sort_by_key(|e| e.position());

        let timestamps = event_timestamps(self.source.as_ref(), &events).await?;
        let timestamped = events
            .iter()
            .map(|e| Ok((timestamp_of(&timestamps, e.block_number)?, &e.event)))
            .collect::<Result<Vec<_>, RefundError>>()?;
        let deltas = PoolDeltas::fold(&order, timestamped)?;

        tracing::debug!(
            "Loaded pool {:#x} on chain {}: blocks {}..={}, {} supply, {} liquidity, {} swap events",
            self.pool.pool,
            chain_id,
            start_block,
            end_block,
            supply.len(),
            liquidity.len(),
            swaps.len()
        );

        LoadedPoolState::from_parts(chain_id, (start_time, end_time), (start_block, end_block), order, init, deltas)
    }
}
