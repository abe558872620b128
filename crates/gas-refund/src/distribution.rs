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

//! Split of validated refunds across the chains the refunds are claimed on.
//!
//! A refund is claimable on each chain the sender staked on, in proportion to the stake score
//! there. Integer division leaves a remainder, which goes to the chain with the largest score
//! so that the per-chain claims always add up to the refunded amount.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::{B256, U256};

use crate::{
    errors::RefundError,
    transaction::{StakeSnapshotRow, TransactionRecord, TransactionStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainDistribution {
    /// Reward tokens claimable on this chain.
    pub claimable: U256,
    /// Reward tokens refunded for transactions sent on this chain.
    pub refunded: U256,
    /// Transactions sent on this chain.
    pub transactions: u64,
}

/// Distribution keyed by `(epoch, chain_id)`.
pub type EpochDistribution = BTreeMap<(u64, u64), ChainDistribution>;

/// Splits `amount` proportionally to `(chain, score)` weights.
pub fn split_by_score(amount: U256, weights: &[(u64, U256)]) -> Result<Vec<(u64, U256)>, RefundError> {
    let total = weights.iter().try_fold(U256::ZERO, |acc, (_, w)| acc.checked_add(*w));
    let total = total.ok_or(RefundError::Arithmetic("total stake score"))?;
    if total.is_zero() {
        return Err(RefundError::invariant("cannot split a refund over zero stake"));
    }

    let mut shares = weights
        .iter()
        .map(|(chain, weight)| {
            let share = amount.checked_mul(*weight).ok_or(RefundError::Arithmetic("stake share"))? / total;
            Ok((*chain, share))
        })
        .collect::<Result<Vec<_>, RefundError>>()?;

    let assigned = shares.iter().fold(U256::ZERO, |acc, (_, s)| acc + *s);
    let remainder = amount - assigned;
    if !remainder.is_zero() {
        // largest score wins, lowest chain id on ties
        let largest = weights
            .iter()
            .enumerate()
            .max_by(|(_, (ca, wa)), (_, (cb, wb))| wa.cmp(wb).then(cb.cmp(ca)))
            .map(|(idx, _)| idx)
            .ok_or_else(|| RefundError::invariant("no chain to assign remainder to"))?;
        shares[largest].1 += remainder;
    }
    Ok(shares)
}

/// Aggregates validated refunds per `(epoch, chain)`.
///
/// Refunds without stake snapshots are claimable on the chain they were sent on.
pub fn distribute(
    records: &[TransactionRecord],
    snapshots: &[StakeSnapshotRow],
) -> Result<EpochDistribution, RefundError> {
    let mut weights: HashMap<(u64, B256), Vec<(u64, U256)>> = HashMap::new();
    for row in snapshots {
        weights.entry((row.tx_chain_id, row.tx_hash)).or_default().push((row.stake_chain_id, row.stake_score));
    }

    let mut distribution = EpochDistribution::new();
    for tx in records.iter().filter(|r| r.status == TransactionStatus::Validated) {
        let sent_on = distribution.entry((tx.epoch, tx.chain_id)).or_default();
        sent_on.refunded += tx.refunded_amount;
        sent_on.transactions += 1;
        if tx.refunded_amount.is_zero() {
            continue;
        }

        let shares = match weights.get(&tx.key()) {
            Some(w) if w.iter().any(|(_, s)| !s.is_zero()) => split_by_score(tx.refunded_amount, w)?,
            _ => vec![(tx.chain_id, tx.refunded_amount)],
        };
        for (chain_id, share) in shares {
            distribution.entry((tx.epoch, chain_id)).or_default().claimable += share;
        }
    }
    Ok(distribution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use alloy::primitives::address;
    use rust_decimal_macros::dec;

    fn snapshot(tx: &TransactionRecord, stake_chain_id: u64, score: u64) -> StakeSnapshotRow {
        StakeSnapshotRow {
            tx_chain_id: tx.chain_id,
            tx_hash: tx.hash,
            staker: tx.address,
            stake_chain_id,
            stake_score: U256::from(score),
            locked_balance: U256::ZERO,
            pool_total_supply: U256::ZERO,
            pool_tracked_balance: U256::ZERO,
        }
    }

    #[test]
    fn test_split_assigns_remainder_to_largest_score() {
        let shares = split_by_score(U256::from(100), &[(1, U256::from(1)), (10, U256::from(2))]).unwrap();
        assert_eq!(shares, vec![(1, U256::from(33)), (10, U256::from(67))]);

        let tied = split_by_score(U256::from(101), &[(10, U256::from(1)), (1, U256::from(1))]).unwrap();
        assert_eq!(tied, vec![(10, U256::from(50)), (1, U256::from(51))]);

        assert!(split_by_score(U256::from(1), &[(1, U256::ZERO)]).is_err());
    }

    #[test]
    fn test_distribute_per_epoch_and_chain() {
        let alice = address!("0x00000000000000000000000000000000000a11ce");
        let mut staked = record(61, alice, 1, 100, dec!(1), dec!(1), U256::from(3));
        staked.status = TransactionStatus::Validated;
        staked.refunded_amount = U256::from(1_000);
        let mut unstaked = record(61, alice, 2, 110, dec!(1), dec!(1), U256::ZERO);
        unstaked.status = TransactionStatus::Validated;
        unstaked.chain_id = 10;
        unstaked.refunded_amount = U256::from(5);
        let mut rejected = record(61, alice, 3, 120, dec!(1), dec!(1), U256::ZERO);
        rejected.status = TransactionStatus::Rejected;
        rejected.refunded_amount = U256::from(7);

        let snapshots = vec![snapshot(&staked, 1, 1), snapshot(&staked, 8453, 2)];
        let distribution = distribute(&[staked, unstaked, rejected], &snapshots).unwrap();

        assert_eq!(
            distribution[&(61, 1)],
            ChainDistribution { claimable: U256::from(333), refunded: U256::from(1_000), transactions: 1 }
        );
        assert_eq!(
            distribution[&(61, 8453)],
            ChainDistribution { claimable: U256::from(667), refunded: U256::ZERO, transactions: 0 }
        );
        assert_eq!(
            distribution[&(61, 10)],
            ChainDistribution { claimable: U256::from(5), refunded: U256::from(5), transactions: 1 }
        );
        let claimable = distribution.values().fold(U256::ZERO, |acc, d| acc + d.claimable);
        assert_eq!(claimable, U256::from(1_005));
    }
}
