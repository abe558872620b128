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

//! Turns externally discovered transactions into idle refund records.

use std::collections::HashSet;

use alloy::primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    epoch::EpochCalculator,
    errors::RefundError,
    pricing::{PriceQuote, PriceResolver},
    refund::{compute_refund, refund_percent, u256_to_decimal, usd_to_amount, WEI_PER_TOKEN},
    stakes::{StakeScoreAggregator, StakedScore},
    transaction::{StakeSnapshotRow, TransactionRecord, TransactionStatus},
};

/// A transaction sent by a staker, as found by the transaction scanner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundCandidate {
    pub chain_id: u64,
    pub hash: B256,
    pub from: Address,
    pub contract: Address,
    pub block_number: u64,
    pub timestamp: u64,
    pub gas_used: u64,
    /// Effective gas price in chain-currency wei.
    pub gas_price: U256,
    /// Gas cost in USD when known independently of the chain currency price.
    #[serde(default)]
    pub gross_usd_override: Option<Decimal>,
    #[serde(default)]
    pub is_migration: bool,
}

impl RefundCandidate {
    pub fn key(&self) -> (u64, B256) {
        (self.chain_id, self.hash)
    }

    /// Gas cost in USD at `chain_currency_usd`.
    pub fn gross_usd(&self, chain_currency_usd: Decimal) -> Result<Decimal, RefundError> {
        if let Some(usd) = self.gross_usd_override {
            return Ok(usd);
        }
        let wei = U256::from(self.gas_used)
            .checked_mul(self.gas_price)
            .ok_or(RefundError::Arithmetic("gas cost"))?;
        u256_to_decimal(wei)?
            .checked_div(WEI_PER_TOKEN)
            .and_then(|native| native.checked_mul(chain_currency_usd))
            .ok_or(RefundError::Arithmetic("gas cost in usd"))
    }
}

/// An idle record together with the stakes it was scored with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTransaction {
    pub record: TransactionRecord,
    pub snapshots: Vec<StakeSnapshotRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedBatch {
    pub records: Vec<TransactionRecord>,
    pub snapshots: Vec<StakeSnapshotRow>,
    /// Candidates below the minimum stake.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RefundableTxBuilder {
    min_stake_score: U256,
}

impl RefundableTxBuilder {
    pub fn new(min_stake_score: U256) -> Self {
        Self { min_stake_score }
    }

    /// Builds the idle record of a candidate, or `None` if its stake is below the minimum.
    ///
    /// Regular records carry the nominal refund; migrations carry the full gas cost.
    pub fn build(
        &self,
        candidate: &RefundCandidate,
        score: &StakedScore,
        quote: &PriceQuote,
        epoch: u64,
    ) -> Result<Option<IndexedTransaction>, RefundError> {
        if score.combined < self.min_stake_score {
            return Ok(None);
        }
        let gross_usd_cost = candidate.gross_usd(quote.chain_currency_usd)?;
        let (refunded_amount, refunded_usd) = if candidate.is_migration {
            (usd_to_amount(gross_usd_cost, quote.reward_token_usd)?, gross_usd_cost)
        } else {
            let nominal =
                compute_refund(gross_usd_cost, quote.reward_token_usd, refund_percent(score.combined)?)?;
            (nominal.amount, nominal.usd)
        };

        let record = TransactionRecord {
            epoch,
            address: candidate.from,
            chain_id: candidate.chain_id,
            hash: candidate.hash,
            block_number: candidate.block_number,
            timestamp: candidate.timestamp,
            contract: candidate.contract,
            gross_usd_cost,
            reward_token_usd: quote.reward_token_usd,
            total_stake_score: score.combined,
            refunded_amount,
            refunded_usd,
            boost_factor: Decimal::ONE,
            is_migration: candidate.is_migration,
            status: TransactionStatus::Idle,
        };
        let snapshots = compose_stake_snapshots(score.contributing_chains().map(|(chain_id, stake)| {
            StakeSnapshotRow {
                tx_chain_id: candidate.chain_id,
                tx_hash: candidate.hash,
                staker: candidate.from,
                stake_chain_id: chain_id,
                stake_score: stake.stake_score,
                locked_balance: stake.balances.locked_balance,
                pool_total_supply: stake.balances.pool_total_supply,
                pool_tracked_balance: stake.balances.pool_tracked_balance,
            }
        }))?;
        Ok(Some(IndexedTransaction { record, snapshots }))
    }
}

/// Collects snapshot rows, failing on a repeated `(tx chain, tx hash, staker, stake chain)`.
pub fn compose_stake_snapshots(
    rows: impl IntoIterator<Item = StakeSnapshotRow>,
) -> Result<Vec<StakeSnapshotRow>, RefundError> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .map(|row| {
            if !seen.insert(row.key()) {
                return Err(RefundError::DuplicateSnapshot {
                    tx_chain_id: row.tx_chain_id,
                    tx_hash: row.tx_hash,
                    staker: row.staker,
                    stake_chain_id: row.stake_chain_id,
                });
            }
            Ok(row)
        })
        .collect()
}

/// Scores and prices every candidate inside the loaded interval.
pub fn index_candidates(
    builder: &RefundableTxBuilder,
    calendar: &EpochCalculator,
    aggregator: &StakeScoreAggregator,
    prices: &dyn PriceResolver,
    candidates: &[RefundCandidate],
) -> Result<IndexedBatch, RefundError> {
    let mut batch = IndexedBatch::default();
    let mut seen = HashSet::new();
    let mut snapshots = Vec::new();
    for candidate in candidates {
        if !seen.insert(candidate.key()) {
            tracing::warn!(
                "Skipping repeated candidate {}:{:#x}",
                candidate.chain_id,
                candidate.hash
            );
            continue;
        }
        let epoch = calendar.epoch_for_timestamp(candidate.timestamp).ok_or_else(|| {
            RefundError::invariant(format!(
                "candidate {:#x} at {} predates the epoch calendar",
                candidate.hash, candidate.timestamp
            ))
        })?;
        let score = aggregator.compute_stake_score(&candidate.from, candidate.timestamp)?;
        let quote = prices.resolve(candidate.timestamp)?;
        match builder.build(candidate, &score, &quote, epoch)? {
            Some(indexed) => {
                batch.records.push(indexed.record);
                snapshots.extend(indexed.snapshots);
            }
            None => batch.dropped += 1,
        }
    }
    batch.snapshots = compose_stake_snapshots(snapshots)?;
    tracing::info!(
        "Indexed {} refundable transactions with {} stake snapshots ({} below minimum stake)",
        batch.records.len(),
        batch.snapshots.len(),
        batch.dropped
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stakes::{ChainStake, SupportingBalances};
    use alloy::primitives::address;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    const ALICE: Address = address!("0x00000000000000000000000000000000000a11ce");

    fn tokens(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000_000_000_000u64)
    }

    fn candidate() -> RefundCandidate {
        RefundCandidate {
            chain_id: 1,
            hash: B256::with_last_byte(7),
            from: ALICE,
            contract: address!("0x00000000000000000000000000000000000000cc"),
            block_number: 100,
            timestamp: 1_000,
            gas_used: 100_000,
            // 100k gas at 20 gwei = 0.002 ETH
            gas_price: U256::from(20_000_000_000u64),
            gross_usd_override: None,
            is_migration: false,
        }
    }

    fn quote() -> PriceQuote {
        PriceQuote { reward_token_usd: dec!(0.5), chain_currency_usd: dec!(2500) }
    }

    fn score(by_chain: &[(u64, u64)]) -> StakedScore {
        let by_chain: BTreeMap<u64, ChainStake> = by_chain
            .iter()
            .map(|&(chain, n)| {
                (
                    chain,
                    ChainStake {
                        stake_score: tokens(n),
                        balances: SupportingBalances { locked_balance: tokens(n), ..Default::default() },
                    },
                )
            })
            .collect();
        let combined = by_chain.values().fold(U256::ZERO, |acc, s| acc + s.stake_score);
        StakedScore { combined, by_chain }
    }

    #[test]
    fn test_gross_usd() {
        assert_eq!(candidate().gross_usd(dec!(2500)).unwrap(), dec!(5));
        let overridden = RefundCandidate { gross_usd_override: Some(dec!(1.23)), ..candidate() };
        assert_eq!(overridden.gross_usd(dec!(2500)).unwrap(), dec!(1.23));
    }

    #[test]
    fn test_build_idle_record_with_snapshots() {
        let builder = RefundableTxBuilder::new(tokens(100));
        let score = score(&[(1, 1_000_000_000), (10, 0), (8453, 500)]);
        let indexed = builder.build(&candidate(), &score, &quote(), 61).unwrap().unwrap();

        let record = &indexed.record;
        assert_eq!(record.status, TransactionStatus::Idle);
        assert_eq!(record.epoch, 61);
        assert_eq!(record.gross_usd_cost, dec!(5));
        // 95% of $5 at $0.5
        assert_eq!(record.refunded_usd, dec!(4.75));
        assert_eq!(record.refunded_amount, tokens(9) + tokens(1) * U256::from(5) / U256::from(10));
        assert_eq!(record.total_stake_score, score.combined);

        // chains without stake get no snapshot
        let chains: Vec<u64> = indexed.snapshots.iter().map(|s| s.stake_chain_id).collect();
        assert_eq!(chains, vec![1, 8453]);
        assert!(indexed.snapshots.iter().all(|s| s.tx_hash == record.hash && s.staker == ALICE));
    }

    #[test]
    fn test_below_min_stake_dropped() {
        let builder = RefundableTxBuilder::new(tokens(100));
        assert!(builder.build(&candidate(), &score(&[(1, 99)]), &quote(), 61).unwrap().is_none());
    }

    #[test]
    fn test_sub_token_score_never_indexed_with_one_token_minimum() {
        let builder = RefundableTxBuilder::new(tokens(1));
        let dust = StakedScore { combined: U256::from(999u64), by_chain: BTreeMap::new() };
        assert!(builder.build(&candidate(), &dust, &quote(), 61).unwrap().is_none());
        assert!(builder.build(&candidate(), &score(&[(1, 1)]), &quote(), 61).unwrap().is_some());
    }

    #[test]
    fn test_migration_carries_full_cost() {
        let builder = RefundableTxBuilder::new(U256::ZERO);
        let migration = RefundCandidate { is_migration: true, ..candidate() };
        let indexed = builder.build(&migration, &score(&[(1, 1)]), &quote(), 61).unwrap().unwrap();
        assert_eq!(indexed.record.refunded_usd, dec!(5));
        assert_eq!(indexed.record.refunded_amount, tokens(10));
        assert!(indexed.record.is_migration);
    }

    #[test]
    fn test_duplicate_snapshot_is_fatal() {
        let row = StakeSnapshotRow {
            tx_chain_id: 1,
            tx_hash: B256::with_last_byte(1),
            staker: ALICE,
            stake_chain_id: 10,
            stake_score: U256::from(1),
            locked_balance: U256::from(1),
            pool_total_supply: U256::from(1),
            pool_tracked_balance: U256::from(1),
        };
        let other_chain = StakeSnapshotRow { stake_chain_id: 8453, ..row.clone() };
        assert_eq!(compose_stake_snapshots(vec![row.clone(), other_chain]).unwrap().len(), 2);
        assert!(matches!(
            compose_stake_snapshots(vec![row.clone(), row]),
            Err(RefundError::DuplicateSnapshot { stake_chain_id: 10, .. })
        ));
    }
}
