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

use std::sync::Arc;

use alloy::primitives::{address, Address, B256, U256};
use async_trait::async_trait;
use gas_refund::{
    boost::{BoostFactors, BoostProvider, NoBoost},
    budget::EpochCapTier,
    config::{ChainConfig, PoolConfig, ProgramEpochs},
    distribution::{ChainDistribution, EpochDistribution},
    events::{ChainEvent, LockTransfer},
    indexing::RefundCandidate,
    pricing::{Last24hAvgPriceResolver, PriceHistory, PriceSample},
    source::PoolState,
    testing::{record, MockEventSource},
    AccountingYear, BudgetCaps, BudgetHistory, EpochCalculator, EventSource, ProgramConfig,
    RefundError, StakeSnapshotRow, TransactionRecord, TransactionStatus, TransactionStore,
    TransactionValidator, ValidatorConfig,
};
use gas_refund_indexer::{
    db::DbError,
    service::{GasRefundService, GasRefundServiceConfig},
    test_utils::TestDb,
};
use rust_decimal_macros::dec;

const ALICE: Address = address!("0x00000000000000000000000000000000000a11ce");
const BOB: Address = address!("0x0000000000000000000000000000000000000b0b");
const XYZ: Address = address!("0x00000000000000000000000000000000000000a1");
const WETH: Address = address!("0x00000000000000000000000000000000000000b2");

fn tokens(n: u64) -> U256 {
    U256::from(n) * U256::from(1_000_000_000_000_000_000u64)
}

fn max_score() -> U256 {
    tokens(1_000_000_000)
}

fn validator_config(current_epoch: u64, boost_start_epoch: u64) -> ValidatorConfig {
    ValidatorConfig {
        caps: BudgetCaps {
            global_yearly: tokens(1_000),
            address_yearly_usd: dec!(100),
            epoch_tiers: vec![EpochCapTier { from_epoch: 0, cap_usd: dec!(40) }],
            epoch_budget_start_epoch: 10,
        },
        program: ProgramEpochs {
            genesis_epoch: 10,
            deduplication_start_epoch: 10,
            epoch_budget_start_epoch: 10,
            boost_start_epoch,
            reduced_epoch_cap_start_epoch: 30,
        },
        accounting_year: AccountingYear { genesis_epoch: 10, epochs_per_year: 4 },
        current_epoch,
        page_size: 2,
    }
}

fn snapshot(tx: &TransactionRecord, stake_chain_id: u64, score: U256) -> StakeSnapshotRow {
    StakeSnapshotRow {
        tx_chain_id: tx.chain_id,
        tx_hash: tx.hash,
        staker: tx.address,
        stake_chain_id,
        stake_score: score,
        locked_balance: tokens(1),
        pool_total_supply: tokens(2),
        pool_tracked_balance: tokens(3),
    }
}

struct FailingBoost;

#[async_trait]
impl BoostProvider for FailingBoost {
    async fn boost_factors(&self, _epoch: u64) -> anyhow::Result<BoostFactors> {
        anyhow::bail!("boost api unavailable")
    }
}

#[tokio::test]
async fn test_insert_never_overwrites() {
    let test_db = TestDb::new().await.unwrap();
    let original = record(10, ALICE, 1, 1_500, dec!(12.5), dec!(0.5), max_score());

    let run = test_db.db.begin_run().await.unwrap();
    let inserted = run.insert_transactions(std::slice::from_ref(&original)).await.unwrap();
    assert!(inserted.contains(&original.key()));

    let changed = TransactionRecord { gross_usd_cost: dec!(99), ..original.clone() };
    assert!(run.insert_transactions(&[changed]).await.unwrap().is_empty());
    run.commit().await.unwrap();

    let rows = test_db.db.transactions(0).await.unwrap();
    assert_eq!(rows, vec![original]);
}

#[tokio::test]
async fn test_fetch_pages_in_timestamp_then_hash_order() {
    let test_db = TestDb::new().await.unwrap();
    let records = vec![
        record(11, ALICE, 3, 200, dec!(1), dec!(1), max_score()),
        record(10, ALICE, 2, 100, dec!(1), dec!(1), max_score()),
        record(10, BOB, 1, 100, dec!(1), dec!(1), max_score()),
        record(12, BOB, 4, 300, dec!(1), dec!(1), max_score()),
    ];

    let run = test_db.db.begin_run().await.unwrap();
    run.insert_transactions(&records).await.unwrap();

    let first = run.fetch_transactions(10, 0, 2).await.unwrap();
    let second = run.fetch_transactions(10, 2, 2).await.unwrap();
    let hashes: Vec<B256> = first.iter().chain(second.iter()).map(|r| r.hash).collect();
    assert_eq!(
        hashes,
        vec![B256::with_last_byte(1), B256::with_last_byte(2), B256::with_last_byte(3), B256::with_last_byte(4)]
    );

    let from_11 = run.fetch_transactions(11, 0, 10).await.unwrap();
    assert_eq!(from_11.len(), 2);
    assert_eq!(run.count_idle().await.unwrap(), 4);
}

#[tokio::test]
async fn test_budget_totals_count_validated_non_migrations() {
    let test_db = TestDb::new().await.unwrap();
    let mut validated = record(10, ALICE, 1, 100, dec!(10), dec!(1), max_score());
    validated.status = TransactionStatus::Validated;
    validated.refunded_amount = tokens(5);
    validated.refunded_usd = dec!(5);
    let mut rejected = record(10, ALICE, 2, 110, dec!(10), dec!(1), max_score());
    rejected.status = TransactionStatus::Rejected;
    rejected.refunded_amount = tokens(7);
    rejected.refunded_usd = dec!(7);
    let mut migration = record(11, BOB, 3, 120, dec!(10), dec!(1), max_score());
    migration.status = TransactionStatus::Validated;
    migration.is_migration = true;
    migration.refunded_amount = tokens(10);
    migration.refunded_usd = dec!(10);
    let mut later = record(12, BOB, 4, 130, dec!(10), dec!(1), max_score());
    later.status = TransactionStatus::Validated;
    later.refunded_amount = tokens(3);
    later.refunded_usd = dec!(3);

    let run = test_db.db.begin_run().await.unwrap();
    run.insert_transactions(&[validated, rejected, migration.clone(), later]).await.unwrap();

    let totals = run.budget_totals(10, 12).await.unwrap();
    assert_eq!(totals.global_spend, tokens(5));
    assert_eq!(totals.usd_by_address.get(&ALICE), Some(&dec!(5)));
    assert!(!totals.usd_by_address.contains_key(&BOB));

    let migrations = run.migration_hashes().await.unwrap();
    assert_eq!(migrations.len(), 1);
    assert!(migrations.contains(&migration.hash));
}

#[tokio::test]
async fn test_duplicate_snapshot_is_fatal() {
    let test_db = TestDb::new().await.unwrap();
    let tx = record(10, ALICE, 1, 100, dec!(1), dec!(1), max_score());
    let row = snapshot(&tx, 8453, tokens(4));

    let run = test_db.db.begin_run().await.unwrap();
    run.insert_transactions(std::slice::from_ref(&tx)).await.unwrap();
    assert_eq!(run.write_stake_snapshots(std::slice::from_ref(&row)).await.unwrap(), 1);

    let err = run.write_stake_snapshots(&[row]).await.unwrap_err();
    assert!(matches!(err, DbError::DuplicateSnapshot { stake_chain_id: 8453, .. }));

    // the run stays usable after the failed savepoint
    run.commit().await.unwrap();
    let stored = test_db.db.stake_snapshots(10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].stake_score, tokens(4));
    assert_eq!(stored[0].pool_tracked_balance, tokens(3));
}

#[tokio::test]
async fn test_validation_run_is_idempotent() {
    let test_db = TestDb::new().await.unwrap();
    let records = vec![
        record(10, ALICE, 1, 100, dec!(30), dec!(1), max_score()),
        record(10, ALICE, 2, 110, dec!(30), dec!(1), max_score()),
        record(11, BOB, 3, 200, dec!(10), dec!(0.5), max_score()),
    ];
    let run = test_db.db.begin_run().await.unwrap();
    run.insert_transactions(&records).await.unwrap();
    let first = TransactionValidator::new(validator_config(20, 30), &run, &NoBoost).run().await.unwrap();
    run.commit().await.unwrap();
    assert_eq!(first.updated, 3);
    assert_eq!(first.capped, 1);
    let after_first = test_db.db.transactions(0).await.unwrap();

    // $28.5 fills most of the $40 epoch budget, the second refund is clipped to $11.5
    assert_eq!(after_first[0].refunded_usd, dec!(28.5));
    assert_eq!(after_first[1].refunded_usd, dec!(11.5));
    assert_eq!(after_first[1].refunded_amount, tokens(11) + tokens(1) / U256::from(2));
    assert_eq!(after_first[2].refunded_amount, tokens(19));
    assert!(after_first.iter().all(|r| r.status == TransactionStatus::Validated));

    let run = test_db.db.begin_run().await.unwrap();
    let second = TransactionValidator::new(validator_config(20, 30), &run, &NoBoost).run().await.unwrap();
    run.commit().await.unwrap();
    assert_eq!(second.updated, 0);
    assert_eq!(second.scanned, 3);
    assert_eq!(test_db.db.transactions(0).await.unwrap(), after_first);
}

#[tokio::test]
async fn test_failed_validation_rolls_back() {
    let test_db = TestDb::new().await.unwrap();
    let run = test_db.db.begin_run().await.unwrap();
    run.insert_transactions(&[record(10, ALICE, 1, 100, dec!(30), dec!(1), max_score())])
        .await
        .unwrap();

    let result = TransactionValidator::new(validator_config(20, 10), &run, &FailingBoost).run().await;
    assert!(matches!(result, Err(RefundError::Boost { epoch: 10, .. })));
    run.rollback().await.unwrap();

    assert!(test_db.db.transactions(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_distribution_finalizes_epoch() {
    let test_db = TestDb::new().await.unwrap();
    let mut distribution = EpochDistribution::new();
    distribution.insert(
        (10, 1),
        ChainDistribution { claimable: tokens(3), refunded: tokens(4), transactions: 2 },
    );
    distribution.insert(
        (10, 8453),
        ChainDistribution { claimable: tokens(1), refunded: U256::ZERO, transactions: 0 },
    );
    distribution.insert((11, 1), ChainDistribution::default());

    let run = test_db.db.begin_run().await.unwrap();
    run.record_distribution(10, &distribution).await.unwrap();
    run.commit().await.unwrap();

    let stored = test_db.db.distribution(10).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[&(10, 1)], distribution[&(10, 1)]);
    assert!(test_db.db.distribution(11).await.unwrap().is_empty());
    assert_eq!(test_db.db.last_finalized_epoch().await.unwrap(), Some(10));

    // validation resumes after the finalized epoch
    let run = test_db.db.begin_run().await.unwrap();
    let validator = TransactionValidator::new(validator_config(20, 30), &run, &NoBoost);
    assert_eq!(validator.start_epoch().await.unwrap(), 11);
}

/// Chain 1 with Alice locking every share of a pool backed by 4M XYZ; blocks every 10s from 100.
fn program() -> ProgramConfig {
    ProgramConfig {
        chains: vec![ChainConfig {
            chain_id: 1,
            locking_token: address!("0x00000000000000000000000000000000000000aa"),
            locking_token_deployment_block: 90,
            pool: PoolConfig {
                pool: address!("0x00000000000000000000000000000000000000c3"),
                vault: address!("0x00000000000000000000000000000000000000d4"),
                tracked_token: Some(XYZ),
            },
            staking_start_timestamp: 0,
        }],
        staking_activation_timestamp: 0,
        epochs: EpochCalculator::new(10, 1_000, 1_000),
        program: ProgramEpochs {
            genesis_epoch: 10,
            deduplication_start_epoch: 10,
            epoch_budget_start_epoch: 10,
            boost_start_epoch: 20,
            reduced_epoch_cap_start_epoch: 30,
        },
        calc_time_offset_secs: 0,
        validation_page_size: 100,
        ..Default::default()
    }
}

fn chain_source() -> Arc<dyn EventSource> {
    let mut source = MockEventSource::new(1).with_blocks(90..=400, 100, 10);
    source.add_pool_state(
        0,
        PoolState {
            tokens: vec![XYZ, WETH],
            total_supply: tokens(1_000_000),
            balances: vec![tokens(4_000_000), tokens(10)],
        },
    );
    source.add_lock_event(ChainEvent::new(
        91,
        0,
        0,
        LockTransfer { from: Address::ZERO, to: ALICE, value: tokens(1_000_000) },
    ));
    Arc::new(source)
}

fn prices() -> Arc<Last24hAvgPriceResolver> {
    let reward = PriceHistory::from(vec![PriceSample { timestamp: 1_400, usd: dec!(0.5) }]);
    let chain = PriceHistory::from(vec![PriceSample { timestamp: 1_400, usd: dec!(2000) }]);
    Arc::new(Last24hAvgPriceResolver::new(reward, chain))
}

fn candidate(hash_byte: u8, timestamp: u64) -> RefundCandidate {
    RefundCandidate {
        chain_id: 1,
        hash: B256::with_last_byte(hash_byte),
        from: ALICE,
        contract: address!("0x00000000000000000000000000000000000000cc"),
        block_number: 90 + (timestamp - 100) / 10,
        timestamp,
        gas_used: 21_000,
        gas_price: U256::from(1_000_000_000u64),
        gross_usd_override: Some(dec!(10)),
        is_migration: false,
    }
}

async fn service(test_db: &TestDb, finalize: bool) -> GasRefundService {
    let db = gas_refund_indexer::db::RefundsDb::new(&test_db.db_url).await.unwrap();
    GasRefundService::new(
        db,
        program(),
        vec![chain_source()],
        prices(),
        Arc::new(NoBoost),
        GasRefundServiceConfig { finalize },
    )
    .unwrap()
}

#[tokio::test]
async fn test_service_indexes_validates_and_finalizes() {
    let test_db = TestDb::new().await.unwrap();
    let service = service(&test_db, true).await;
    let candidates = vec![candidate(1, 1_500), candidate(2, 2_500)];

    let run = service.run_epoch_at(10, &candidates, 2_500).await.unwrap();
    assert_eq!(run.inserted, 1);
    assert_eq!(run.skipped_candidates, 1);
    assert_eq!(run.snapshots, 1);
    assert_eq!((run.start_time, run.end_time), (1_000, 1_999));
    assert!(run.finalized);

    let rows = test_db.db.transactions(0).await.unwrap();
    assert_eq!(rows.len(), 1);
    // 10M score gives 95% of $10 at $0.5
    assert_eq!(rows[0].status, TransactionStatus::Validated);
    assert_eq!(rows[0].refunded_usd, dec!(9.5));
    assert_eq!(rows[0].refunded_amount, tokens(19));
    assert_eq!(rows[0].total_stake_score, tokens(10_000_000));

    let snapshots = test_db.db.stake_snapshots(10).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].locked_balance, tokens(1_000_000));
    assert_eq!(test_db.db.distribution(10).await.unwrap()[&(10, 1)].claimable, tokens(19));
    assert_eq!(test_db.db.last_finalized_epoch().await.unwrap(), Some(10));

    // rerunning the finalized epoch changes nothing
    let again = service.run_epoch_at(10, &candidates, 2_500).await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.validation.scanned, 0);
    assert_eq!(test_db.db.transactions(0).await.unwrap(), rows);
}

#[tokio::test]
async fn test_service_does_not_finalize_running_epoch() {
    let test_db = TestDb::new().await.unwrap();
    let service = service(&test_db, true).await;

    let run = service.run_epoch_at(10, &[candidate(1, 1_500)], 1_800).await.unwrap();
    assert_eq!(run.end_time, 1_800);
    assert!(!run.finalized);
    assert_eq!(run.validation.validated, 1);
    assert_eq!(test_db.db.last_finalized_epoch().await.unwrap(), None);
    assert_eq!(run.distribution[&(10, 1)].refunded, tokens(19));
    assert_eq!(test_db.db.transactions(10).await.unwrap()[0].refunded_usd, dec!(9.5));
    assert!(test_db.db.transactions(11).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_service_rejects_epoch_after_cutoff() {
    let test_db = TestDb::new().await.unwrap();
    let service = service(&test_db, false).await;
    assert!(service.run_epoch_at(11, &[], 1_500).await.is_err());
    assert!(test_db.db.transactions(0).await.unwrap().is_empty());
}
