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

//! Per-account balances of the locking token, reconstructed from its transfers.

use std::{collections::HashMap, sync::Arc};

use alloy::primitives::{Address, U256};

use crate::{
    errors::RefundError,
    events::{ChainEvent, LockTransfer},
    pool::{event_timestamps, resolve_block_range, timestamp_of},
    source::EventSource,
    timeseries::{signed, Delta, TimeSeries},
};

/// Balances as of `start_block - 1`, folded from every transfer since deployment.
fn fold_initial_balances(
    transfers: &[ChainEvent<LockTransfer>],
) -> Result<HashMap<Address, U256>, RefundError> {
    transfers.iter().try_fold(HashMap::new(), |mut balances, e| {
        let LockTransfer { from, to, value } = e.event;
        if from != Address::ZERO {
            let balance: &mut U256 = balances.entry(from).or_default();
            *balance = balance.checked_sub(value).ok_or_else(|| {
                RefundError::invariant(format!(
                    "locked balance of {from:#x} goes negative at block {}",
                    e.block_number
                ))
            })?;
        }
        if to != Address::ZERO {
            let balance: &mut U256 = balances.entry(to).or_default();
            *balance = balance.checked_add(value).ok_or(RefundError::Arithmetic("locked balance"))?;
        }
        Ok(balances)
    })
}

#[derive(Debug, Clone)]
pub struct LoadedLockedBalances {
    pub chain_id: u64,
    pub start_time: u64,
    pub end_time: u64,
    init: HashMap<Address, U256>,
    deltas: HashMap<Address, TimeSeries>,
}

impl LoadedLockedBalances {
    /// Balance of `account` at `timestamp`; fails outside the loaded interval.
    pub fn balance_of(&self, account: &Address, timestamp: u64) -> Result<U256, RefundError> {
        if !(self.start_time..=self.end_time).contains(&timestamp) {
            return Err(RefundError::OutOfRange {
                timestamp,
                start: self.start_time,
                end: self.end_time,
            });
        }
        let init = self.init.get(account).copied().unwrap_or_default();
        match self.deltas.get(account) {
            Some(series) => series.reduce_at(init, timestamp),
            None => Ok(init),
        }
    }
}

pub struct LockedBalanceTracker {
    token: Address,
    deployment_block: u64,
    source: Arc<dyn EventSource>,
}

impl LockedBalanceTracker {
    pub fn new(token: Address, deployment_block: u64, source: Arc<dyn EventSource>) -> Self {
        Self { token, deployment_block, source }
    }

    pub async fn load(&self, start_time: u64, end_time: u64) -> Result<LoadedLockedBalances, RefundError> {
        let chain_id = self.source.chain_id();
        let (start_block, end_block) =
            resolve_block_range(self.source.as_ref(), start_time, end_time).await?;

        let to_block = end_block.max(start_block.saturating_sub(1));
        let transfers = if self.deployment_block > to_block {
            Vec::new()
        } else {
            self.source
                .fetch_lock_events(self.token, self.deployment_block, to_block)
                .await
                .map_err(|e| RefundError::fetch(chain_id, "load locking token transfers", e))?
        };
        let (mut before, mut inside): (Vec<_>, Vec<_>) =
            transfers.into_iter().partition(|e| e.block_number < start_block);
        before.sort_by_key(|e| e.position());
        inside.sort_by_key(|e| e.position());

        let init = fold_initial_balances(&before)?;

        let refs: Vec<&ChainEvent<LockTransfer>> = inside.iter().collect();
        let timestamps = event_timestamps(self.source.as_ref(), &refs).await?;
        let mut per_account: HashMap<Address, Vec<Delta>> = HashMap::new();
        for e in &inside {
            let ts = timestamp_of(&timestamps, e.block_number)?;
            let value = signed(e.event.value)?;
            if e.event.from != Address::ZERO {
                per_account.entry(e.event.from).or_default().push(Delta::new(ts, -value));
            }
            if e.event.to != Address::ZERO {
                per_account.entry(e.event.to).or_default().push(Delta::new(ts, value));
            }
        }
        let deltas = per_account
            .into_iter()
            .map(|(account, deltas)| Ok((account, TimeSeries::from_deltas(deltas)?)))
            .collect::<Result<_, RefundError>>()?;

        tracing::debug!(
            "Loaded locking token {:#x} on chain {}: {} accounts before block {}, {} transfers in interval",
            self.token,
            chain_id,
            init.len(),
            start_block,
            inside.len()
        );

        Ok(LoadedLockedBalances { chain_id, start_time, end_time, init, deltas })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEventSource;
    use alloy::primitives::address;

    const TOKEN: Address = address!("0x00000000000000000000000000000000000000aa");
    const ALICE: Address = address!("0x0000000000000000000000000000000000000a11");
    const BOB: Address = address!("0x0000000000000000000000000000000000000b0b");

    fn transfer(block: u64, from: Address, to: Address, value: u64) -> ChainEvent<LockTransfer> {
        ChainEvent::new(block, 0, 0, LockTransfer { from, to, value: U256::from(value) })
    }

    fn source() -> MockEventSource {
        // blocks 90..=110, block 100 at t=1000
        let mut source = MockEventSource::new(10).with_blocks(90..=110, 900, 10);
        source.add_lock_event(transfer(91, Address::ZERO, ALICE, 1_000));
        source.add_lock_event(transfer(95, ALICE, BOB, 300));
        source.add_lock_event(transfer(102, Address::ZERO, BOB, 50));
        source.add_lock_event(transfer(105, ALICE, Address::ZERO, 700));
        source
    }

    #[tokio::test]
    async fn test_initial_balances_and_deltas() {
        let tracker = LockedBalanceTracker::new(TOKEN, 90, Arc::new(source()));
        let balances = tracker.load(1000, 1100).await.unwrap();

        assert_eq!(balances.balance_of(&ALICE, 1000).unwrap(), U256::from(700));
        assert_eq!(balances.balance_of(&BOB, 1000).unwrap(), U256::from(300));
        assert_eq!(balances.balance_of(&BOB, 1020).unwrap(), U256::from(350));
        assert_eq!(balances.balance_of(&ALICE, 1049).unwrap(), U256::from(700));
        assert_eq!(balances.balance_of(&ALICE, 1050).unwrap(), U256::ZERO);
        assert_eq!(balances.balance_of(&Address::ZERO, 1050).unwrap(), U256::ZERO);
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let tracker = LockedBalanceTracker::new(TOKEN, 90, Arc::new(source()));
        let balances = tracker.load(1000, 1100).await.unwrap();
        assert!(matches!(balances.balance_of(&ALICE, 999), Err(RefundError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn test_negative_history_is_invariant_violation() {
        let mut source = MockEventSource::new(10).with_blocks(90..=110, 900, 10);
        source.add_lock_event(transfer(91, ALICE, BOB, 1));
        let tracker = LockedBalanceTracker::new(TOKEN, 90, Arc::new(source));
        assert!(matches!(tracker.load(1000, 1100).await, Err(RefundError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_tagged() {
        let tracker = LockedBalanceTracker::new(TOKEN, 90, Arc::new(source().failing_locks()));
        assert!(matches!(
            tracker.load(1000, 1100).await,
            Err(RefundError::Fetch { chain_id: 10, operation: "load locking token transfers", .. })
        ));
    }
}
