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

//! In-memory fixtures for tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use alloy::primitives::{Address, B256, U256};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    budget::{BudgetHistory, BudgetTotals},
    config::PoolConfig,
    events::{ChainEvent, LockTransfer, PoolEvent, PoolEventCategory},
    source::{EventSource, PoolState},
    store::TransactionStore,
    transaction::{TransactionRecord, TransactionStatus},
};

/// An [EventSource] serving a fixed set of blocks and events.
#[derive(Debug, Default)]
pub struct MockEventSource {
    chain_id: u64,
    blocks: BTreeMap<u64, u64>,
    pool_states: BTreeMap<u64, PoolState>,
    pool_events: HashMap<PoolEventCategory, Vec<ChainEvent<PoolEvent>>>,
    lock_events: Vec<ChainEvent<LockTransfer>>,
    failing_category: Option<PoolEventCategory>,
    failing_locks: bool,
    pool_state_calls: AtomicUsize,
}

impl MockEventSource {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id, ..Default::default() }
    }

    /// Adds `blocks`, the first at `first_timestamp` and each following one `step` seconds later.
    pub fn with_blocks(mut self, blocks: RangeInclusive<u64>, first_timestamp: u64, step: u64) -> Self {
        let first = *blocks.start();
        for block in blocks {
            self.blocks.insert(block, first_timestamp + (block - first) * step);
        }
        self
    }

    /// Makes every fetch of `category` fail.
    pub fn failing(mut self, category: PoolEventCategory) -> Self {
        self.failing_category = Some(category);
        self
    }

    /// Makes every locking token fetch fail.
    pub fn failing_locks(mut self) -> Self {
        self.failing_locks = true;
        self
    }

    /// Sets the pool state from `block` on.
    pub fn add_pool_state(&mut self, block: u64, state: PoolState) {
        self.pool_states.insert(block, state);
    }

    pub fn add_pool_event(&mut self, category: PoolEventCategory, event: ChainEvent<PoolEvent>) {
        self.pool_events.entry(category).or_default().push(event);
    }

    pub fn add_lock_event(&mut self, event: ChainEvent<LockTransfer>) {
        self.lock_events.push(event);
    }

    pub fn pool_state_calls(&self) -> usize {
        self.pool_state_calls.load(Ordering::SeqCst)
    }

    fn in_range<E: Clone>(events: &[ChainEvent<E>], from: u64, to: u64) -> Vec<ChainEvent<E>> {
        events.iter().filter(|e| (from..=to).contains(&e.block_number)).cloned().collect()
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_block(&self) -> anyhow::Result<u64> {
        self.blocks.keys().next_back().copied().ok_or_else(|| anyhow!("no blocks"))
    }

    async fn block_at_or_after(&self, timestamp: u64) -> anyhow::Result<u64> {
        match self.blocks.iter().find(|(_, ts)| **ts >= timestamp) {
            Some((block, _)) => Ok(*block),
            None => Ok(self.latest_block().await? + 1),
        }
    }

    async fn fetch_pool_events(
        &self,
        _pool: &PoolConfig,
        category: PoolEventCategory,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<ChainEvent<PoolEvent>>> {
        if self.failing_category == Some(category) {
            bail!("rpc unavailable");
        }
        let events = self.pool_events.get(&category).map(Vec::as_slice).unwrap_or_default();
        Ok(Self::in_range(events, from_block, to_block))
    }

    async fn fetch_lock_events(
        &self,
        _token: Address,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<ChainEvent<LockTransfer>>> {
        if self.failing_locks {
            bail!("rpc unavailable");
        }
        Ok(Self::in_range(&self.lock_events, from_block, to_block))
    }

    async fn resolve_block_timestamps(&self, blocks: &[u64]) -> anyhow::Result<HashMap<u64, u64>> {
        blocks
            .iter()
            .map(|block| {
                let ts = self.blocks.get(block).ok_or_else(|| anyhow!("unknown block {block}"))?;
                Ok((*block, *ts))
            })
            .collect()
    }

    async fn fetch_pool_state(&self, _pool: &PoolConfig, at_block: u64) -> anyhow::Result<PoolState> {
        self.pool_state_calls.fetch_add(1, Ordering::SeqCst);
        self.pool_states
            .range(..=at_block)
            .next_back()
            .map(|(_, state)| state.clone())
            .ok_or_else(|| anyhow!("no pool state at block {at_block}"))
    }
}

/// An idle record on chain 1 whose hash ends in `hash_byte`.
pub fn record(
    epoch: u64,
    address: Address,
    hash_byte: u8,
    timestamp: u64,
    gross_usd_cost: Decimal,
    reward_token_usd: Decimal,
    total_stake_score: U256,
) -> TransactionRecord {
    TransactionRecord {
        epoch,
        address,
        chain_id: 1,
        hash: B256::with_last_byte(hash_byte),
        block_number: timestamp,
        timestamp,
        contract: Address::ZERO,
        gross_usd_cost,
        reward_token_usd,
        total_stake_score,
        refunded_amount: U256::ZERO,
        refunded_usd: Decimal::ZERO,
        boost_factor: Decimal::ONE,
        is_migration: false,
        status: TransactionStatus::Idle,
    }
}

/// A [TransactionStore] over a vector of records.
///
/// Rows are matched by `(chain_id, hash, timestamp)` so that duplicate keys can be modelled.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<Vec<TransactionRecord>>,
    migrations: HashSet<B256>,
    last_finalized_epoch: Option<u64>,
    extra_idle: u64,
    update_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new(mut rows: Vec<TransactionRecord>) -> Self {
        rows.sort_by_key(|r| (r.timestamp, r.hash));
        Self { rows: Mutex::new(rows), ..Default::default() }
    }

    pub fn with_migrations(mut self, hashes: impl IntoIterator<Item = B256>) -> Self {
        self.migrations.extend(hashes);
        self
    }

    pub fn with_last_finalized_epoch(mut self, epoch: u64) -> Self {
        self.last_finalized_epoch = Some(epoch);
        self
    }

    /// Pretends `count` idle records exist outside the scanned range.
    pub fn with_extra_idle(mut self, count: u64) -> Self {
        self.extra_idle = count;
        self
    }

    /// Snapshot of all rows in `(timestamp, hash)` order.
    pub fn rows(&self) -> Vec<TransactionRecord> {
        self.lock().clone()
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TransactionRecord>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BudgetHistory for InMemoryStore {
    async fn budget_totals(&self, from_epoch: u64, to_epoch: u64) -> anyhow::Result<BudgetTotals> {
        let mut totals = BudgetTotals::default();
        for row in self.lock().iter() {
            if row.status != TransactionStatus::Validated
                || row.is_migration
                || !(from_epoch..to_epoch).contains(&row.epoch)
            {
                continue;
            }
            totals.global_spend += row.refunded_amount;
            *totals.usd_by_address.entry(row.address).or_default() += row.refunded_usd;
        }
        Ok(totals)
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn last_finalized_epoch(&self) -> anyhow::Result<Option<u64>> {
        Ok(self.last_finalized_epoch)
    }

    async fn migration_hashes(&self) -> anyhow::Result<HashSet<B256>> {
        Ok(self.migrations.clone())
    }

    async fn fetch_transactions(
        &self,
        from_epoch: u64,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<TransactionRecord>> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| r.epoch >= from_epoch)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn update_transactions(&self, records: &[TransactionRecord]) -> anyhow::Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.lock();
        for update in records {
            let row = rows
                .iter_mut()
                .find(|r| (r.chain_id, r.hash, r.timestamp) == (update.chain_id, update.hash, update.timestamp))
                .ok_or_else(|| anyhow!("no row {}:{:#x}", update.chain_id, update.hash))?;
            row.status = update.status;
            row.refunded_amount = update.refunded_amount;
            row.refunded_usd = update.refunded_usd;
            row.boost_factor = update.boost_factor;
        }
        Ok(())
    }

    async fn count_idle(&self) -> anyhow::Result<u64> {
        let idle = self.lock().iter().filter(|r| r.status == TransactionStatus::Idle).count() as u64;
        Ok(idle + self.extra_idle)
    }
}
