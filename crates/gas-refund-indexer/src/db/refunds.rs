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

//! Refund records, stake snapshots and distributions in a SQL database.
//!
//! Writes happen through a [RefundsRun], which wraps a single database transaction so that an
//! epoch is indexed, validated and distributed atomically.

use std::{collections::HashSet, fmt::Display, str::FromStr};

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use gas_refund::{
    distribution::{ChainDistribution, EpochDistribution},
    BudgetHistory, BudgetTotals, StakeSnapshotRow, TransactionRecord, TransactionStatus,
    TransactionStore,
};
use rust_decimal::Decimal;
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    Any, AnyConnection, AnyPool, Connection, Row, Transaction,
};
use tokio::sync::Mutex;

use super::DbError;

const LAST_FINALIZED_EPOCH_KEY: &str = "gas_refund_last_finalized_epoch";

const TX_COLUMNS: &str = "chain_id, hash, epoch, address, block_number, block_timestamp, contract, \
    gross_usd_cost, reward_token_usd, total_stake_score, refunded_amount, refunded_usd, \
    boost_factor, is_migration, status";

const SNAPSHOT_COLUMNS: &str = "s.tx_chain_id, s.tx_hash, s.staker, s.stake_chain_id, s.stake_score, \
    s.locked_balance, s.pool_total_supply, s.pool_tracked_balance";

/// Convert a U256 to a zero-padded string for proper database sorting
/// U256 max value has 78 decimal digits (2^256 ≈ 1.15 * 10^77)
fn pad_u256(value: U256) -> String {
    format!("{:0>78}", value)
}

/// Convert a zero-padded string back to U256
fn unpad_u256(s: &str) -> Result<U256, DbError> {
    U256::from_str(s.trim_start_matches('0')).or_else(|_| {
        // If trimming all zeros, the value is 0
        if s.chars().all(|c| c == '0') {
            Ok(U256::ZERO)
        } else {
            Err(DbError::BadValue(format!("Invalid U256 string: {}", s)))
        }
    })
}

fn parse_column<T>(column: &str, raw: &str) -> Result<T, DbError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e| DbError::BadValue(format!("{column} = {raw:?}: {e}")))
}

fn text(row: &AnyRow, column: &str) -> Result<String, DbError> {
    Ok(row.try_get::<String, _>(column)?)
}

fn unsigned(row: &AnyRow, column: &str) -> Result<u64, DbError> {
    let value = row.try_get::<i64, _>(column)?;
    u64::try_from(value).map_err(|_| DbError::BadValue(format!("{column} = {value}")))
}

fn record_from_row(row: &AnyRow) -> Result<TransactionRecord, DbError> {
    Ok(TransactionRecord {
        chain_id: unsigned(row, "chain_id")?,
        hash: parse_column("hash", &text(row, "hash")?)?,
        epoch: unsigned(row, "epoch")?,
        address: parse_column("address", &text(row, "address")?)?,
        block_number: unsigned(row, "block_number")?,
        timestamp: unsigned(row, "block_timestamp")?,
        contract: parse_column("contract", &text(row, "contract")?)?,
        gross_usd_cost: parse_column("gross_usd_cost", &text(row, "gross_usd_cost")?)?,
        reward_token_usd: parse_column("reward_token_usd", &text(row, "reward_token_usd")?)?,
        total_stake_score: unpad_u256(&text(row, "total_stake_score")?)?,
        refunded_amount: unpad_u256(&text(row, "refunded_amount")?)?,
        refunded_usd: parse_column("refunded_usd", &text(row, "refunded_usd")?)?,
        boost_factor: parse_column("boost_factor", &text(row, "boost_factor")?)?,
        is_migration: row.try_get::<i32, _>("is_migration")? != 0,
        status: parse_column("status", &text(row, "status")?)?,
    })
}

fn snapshot_from_row(row: &AnyRow) -> Result<StakeSnapshotRow, DbError> {
    Ok(StakeSnapshotRow {
        tx_chain_id: unsigned(row, "tx_chain_id")?,
        tx_hash: parse_column("tx_hash", &text(row, "tx_hash")?)?,
        staker: parse_column("staker", &text(row, "staker")?)?,
        stake_chain_id: unsigned(row, "stake_chain_id")?,
        stake_score: unpad_u256(&text(row, "stake_score")?)?,
        locked_balance: unpad_u256(&text(row, "locked_balance")?)?,
        pool_total_supply: unpad_u256(&text(row, "pool_total_supply")?)?,
        pool_tracked_balance: unpad_u256(&text(row, "pool_tracked_balance")?)?,
    })
}

/// Inserts records that do not exist yet and returns the keys that were inserted.
async fn insert_transactions(
    conn: &mut AnyConnection,
    records: &[TransactionRecord],
) -> Result<HashSet<(u64, B256)>, DbError> {
    let sql = format!(
        r#"
        INSERT INTO gas_refund_transactions ({TX_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (chain_id, hash) DO NOTHING
        "#
    );
    let mut inserted = HashSet::new();
    for record in records {
        let result = sqlx::query(&sql)
            .bind(record.chain_id as i64)
            .bind(format!("{:#x}", record.hash))
            .bind(record.epoch as i64)
            .bind(format!("{:#x}", record.address))
            .bind(record.block_number as i64)
            .bind(record.timestamp as i64)
            .bind(format!("{:#x}", record.contract))
            .bind(record.gross_usd_cost.to_string())
            .bind(record.reward_token_usd.to_string())
            .bind(pad_u256(record.total_stake_score))
            .bind(pad_u256(record.refunded_amount))
            .bind(record.refunded_usd.to_string())
            .bind(record.boost_factor.to_string())
            .bind(if record.is_migration { 1i32 } else { 0i32 })
            .bind(record.status.as_str())
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() > 0 {
            inserted.insert(record.key());
        }
    }
    Ok(inserted)
}

/// Writes each snapshot in its own savepoint.
///
/// A repeated key aborts the write. Any other failing row is logged and skipped.
async fn write_stake_snapshots(
    conn: &mut AnyConnection,
    rows: &[StakeSnapshotRow],
) -> Result<u64, DbError> {
    let sql = r#"
        INSERT INTO gas_refund_stake_snapshots
            (tx_chain_id, tx_hash, staker, stake_chain_id, stake_score, locked_balance,
             pool_total_supply, pool_tracked_balance)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    "#;
    let mut written = 0;
    for row in rows {
        let mut savepoint = conn.begin().await?;
        let result = sqlx::query(sql)
            .bind(row.tx_chain_id as i64)
            .bind(format!("{:#x}", row.tx_hash))
            .bind(format!("{:#x}", row.staker))
            .bind(row.stake_chain_id as i64)
            .bind(pad_u256(row.stake_score))
            .bind(pad_u256(row.locked_balance))
            .bind(pad_u256(row.pool_total_supply))
            .bind(pad_u256(row.pool_tracked_balance))
            .execute(&mut *savepoint)
            .await;
        match result {
            Ok(_) => {
                savepoint.commit().await?;
                written += 1;
            }
            Err(err) => {
                savepoint.rollback().await?;
                if err.as_database_error().is_some_and(|e| e.is_unique_violation()) {
                    return Err(DbError::DuplicateSnapshot {
                        tx_chain_id: row.tx_chain_id,
                        tx_hash: row.tx_hash,
                        stake_chain_id: row.stake_chain_id,
                    });
                }
                tracing::warn!(
                    "Skipping stake snapshot of tx {}:{:#x} on chain {}: {:?}",
                    row.tx_chain_id,
                    row.tx_hash,
                    row.stake_chain_id,
                    err
                );
            }
        }
    }
    Ok(written)
}

async fn update_transactions(
    conn: &mut AnyConnection,
    records: &[TransactionRecord],
) -> Result<(), DbError> {
    let sql = r#"
        UPDATE gas_refund_transactions
        SET status = $1, refunded_amount = $2, refunded_usd = $3, boost_factor = $4,
            updated_at = CURRENT_TIMESTAMP
        WHERE chain_id = $5 AND hash = $6
    "#;
    for record in records {
        let result = sqlx::query(sql)
            .bind(record.status.as_str())
            .bind(pad_u256(record.refunded_amount))
            .bind(record.refunded_usd.to_string())
            .bind(record.boost_factor.to_string())
            .bind(record.chain_id as i64)
            .bind(format!("{:#x}", record.hash))
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::BadValue(format!(
                "no transaction {}:{:#x} to update",
                record.chain_id, record.hash
            )));
        }
    }
    Ok(())
}

async fn fetch_transactions(
    conn: &mut AnyConnection,
    from_epoch: u64,
    offset: u64,
    limit: u64,
) -> Result<Vec<TransactionRecord>, DbError> {
    let sql = format!(
        r#"
        SELECT {TX_COLUMNS} FROM gas_refund_transactions
        WHERE epoch >= $1
        ORDER BY block_timestamp, hash, chain_id
        LIMIT $2 OFFSET $3
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(from_epoch as i64)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(record_from_row).collect()
}

async fn transactions_in_epoch(
    conn: &mut AnyConnection,
    epoch: u64,
) -> Result<Vec<TransactionRecord>, DbError> {
    let sql = format!(
        "SELECT {TX_COLUMNS} FROM gas_refund_transactions WHERE epoch = $1 \
         ORDER BY block_timestamp, hash, chain_id"
    );
    let rows = sqlx::query(&sql).bind(epoch as i64).fetch_all(&mut *conn).await?;
    rows.iter().map(record_from_row).collect()
}

async fn stake_snapshots_in_epoch(
    conn: &mut AnyConnection,
    epoch: u64,
) -> Result<Vec<StakeSnapshotRow>, DbError> {
    let sql = format!(
        r#"
        SELECT {SNAPSHOT_COLUMNS}
        FROM gas_refund_stake_snapshots s
        JOIN gas_refund_transactions t ON t.chain_id = s.tx_chain_id AND t.hash = s.tx_hash
        WHERE t.epoch = $1
        ORDER BY s.tx_chain_id, s.tx_hash, s.stake_chain_id
        "#
    );
    let rows = sqlx::query(&sql).bind(epoch as i64).fetch_all(&mut *conn).await?;
    rows.iter().map(snapshot_from_row).collect()
}

async fn budget_totals(
    conn: &mut AnyConnection,
    from_epoch: u64,
    to_epoch: u64,
) -> Result<BudgetTotals, DbError> {
    let rows = sqlx::query(
        r#"
        SELECT address, refunded_amount, refunded_usd FROM gas_refund_transactions
        WHERE status = $1 AND is_migration = 0 AND epoch >= $2 AND epoch < $3
        "#,
    )
    .bind(TransactionStatus::Validated.as_str())
    .bind(from_epoch as i64)
    .bind(to_epoch as i64)
    .fetch_all(&mut *conn)
    .await?;

    let mut totals = BudgetTotals::default();
    for row in &rows {
        let address: Address = parse_column("address", &text(row, "address")?)?;
        let usd: Decimal = parse_column("refunded_usd", &text(row, "refunded_usd")?)?;
        totals.global_spend = totals
            .global_spend
            .checked_add(unpad_u256(&text(row, "refunded_amount")?)?)
            .ok_or_else(|| DbError::BadValue("global spend overflows".into()))?;
        *totals.usd_by_address.entry(address).or_default() += usd;
    }
    Ok(totals)
}

async fn migration_hashes(conn: &mut AnyConnection) -> Result<HashSet<B256>, DbError> {
    let rows = sqlx::query("SELECT hash FROM gas_refund_transactions WHERE is_migration = 1")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(|row| parse_column("hash", &text(row, "hash")?)).collect()
}

async fn count_idle(conn: &mut AnyConnection) -> Result<u64, DbError> {
    let row = sqlx::query("SELECT COUNT(*) AS idle FROM gas_refund_transactions WHERE status = $1")
        .bind(TransactionStatus::Idle.as_str())
        .fetch_one(&mut *conn)
        .await?;
    unsigned(&row, "idle")
}

async fn last_finalized_epoch(conn: &mut AnyConnection) -> Result<Option<u64>, DbError> {
    let row = sqlx::query("SELECT value FROM indexer_state WHERE key = $1")
        .bind(LAST_FINALIZED_EPOCH_KEY)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(Some(parse_column("value", &text(&row, "value")?)?)),
        None => Ok(None),
    }
}

/// Stores the per-chain split of `epoch` and marks the epoch finalized.
async fn record_distribution(
    conn: &mut AnyConnection,
    epoch: u64,
    distribution: &EpochDistribution,
) -> Result<(), DbError> {
    let sql = r#"
        INSERT INTO gas_refund_distributions (epoch, chain_id, claimable, refunded, transactions, updated_at)
        VALUES ($1, $2, $3, $4, $5, CURRENT_TIMESTAMP)
        ON CONFLICT (epoch, chain_id)
        DO UPDATE SET claimable = $3, refunded = $4, transactions = $5, updated_at = CURRENT_TIMESTAMP
    "#;
    for (&(entry_epoch, chain_id), entry) in distribution.range((epoch, 0)..=(epoch, u64::MAX)) {
        sqlx::query(sql)
            .bind(entry_epoch as i64)
            .bind(chain_id as i64)
            .bind(pad_u256(entry.claimable))
            .bind(pad_u256(entry.refunded))
            .bind(entry.transactions as i64)
            .execute(&mut *conn)
            .await?;
    }

    let finalized = last_finalized_epoch(&mut *conn).await?.map_or(epoch, |last| last.max(epoch));
    sqlx::query(
        r#"
        INSERT INTO indexer_state (key, value, updated_at)
        VALUES ($1, $2, CURRENT_TIMESTAMP)
        ON CONFLICT (key)
        DO UPDATE SET value = $2, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(LAST_FINALIZED_EPOCH_KEY)
    .bind(finalized.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn distribution(conn: &mut AnyConnection, epoch: u64) -> Result<EpochDistribution, DbError> {
    let rows = sqlx::query(
        "SELECT epoch, chain_id, claimable, refunded, transactions FROM gas_refund_distributions \
         WHERE epoch = $1",
    )
    .bind(epoch as i64)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| {
            let key = (unsigned(row, "epoch")?, unsigned(row, "chain_id")?);
            let entry = ChainDistribution {
                claimable: unpad_u256(&text(row, "claimable")?)?,
                refunded: unpad_u256(&text(row, "refunded")?)?,
                transactions: unsigned(row, "transactions")?,
            };
            Ok::<_, DbError>((key, entry))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RefundsDb {
    pool: AnyPool,
}

impl RefundsDb {
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(5).connect(database_url).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Opens a database transaction that scopes every write of one run.
    pub async fn begin_run(&self) -> Result<RefundsRun, DbError> {
        let tx = self.pool.begin().await?;
        Ok(RefundsRun { tx: Mutex::new(tx) })
    }

    /// Committed records with `epoch >= from_epoch`, in validation order.
    pub async fn transactions(&self, from_epoch: u64) -> Result<Vec<TransactionRecord>, DbError> {
        let mut conn = self.pool.acquire().await?;
        fetch_transactions(&mut conn, from_epoch, 0, i64::MAX as u64).await
    }

    pub async fn stake_snapshots(&self, epoch: u64) -> Result<Vec<StakeSnapshotRow>, DbError> {
        let mut conn = self.pool.acquire().await?;
        stake_snapshots_in_epoch(&mut conn, epoch).await
    }

    pub async fn distribution(&self, epoch: u64) -> Result<EpochDistribution, DbError> {
        let mut conn = self.pool.acquire().await?;
        distribution(&mut conn, epoch).await
    }

    pub async fn last_finalized_epoch(&self) -> Result<Option<u64>, DbError> {
        let mut conn = self.pool.acquire().await?;
        last_finalized_epoch(&mut conn).await
    }
}

/// Transaction-scoped view of [RefundsDb].
///
/// Nothing is visible to other connections until [RefundsRun::commit]. Dropping the run rolls
/// every write back.
pub struct RefundsRun {
    tx: Mutex<Transaction<'static, Any>>,
}

impl RefundsRun {
    pub async fn insert_transactions(
        &self,
        records: &[TransactionRecord],
    ) -> Result<HashSet<(u64, B256)>, DbError> {
        let mut tx = self.tx.lock().await;
        insert_transactions(&mut tx, records).await
    }

    pub async fn write_stake_snapshots(&self, rows: &[StakeSnapshotRow]) -> Result<u64, DbError> {
        let mut tx = self.tx.lock().await;
        write_stake_snapshots(&mut tx, rows).await
    }

    pub async fn transactions_in_epoch(&self, epoch: u64) -> Result<Vec<TransactionRecord>, DbError> {
        let mut tx = self.tx.lock().await;
        transactions_in_epoch(&mut tx, epoch).await
    }

    pub async fn stake_snapshots_in_epoch(
        &self,
        epoch: u64,
    ) -> Result<Vec<StakeSnapshotRow>, DbError> {
        let mut tx = self.tx.lock().await;
        stake_snapshots_in_epoch(&mut tx, epoch).await
    }

    pub async fn record_distribution(
        &self,
        epoch: u64,
        distribution: &EpochDistribution,
    ) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        record_distribution(&mut tx, epoch, distribution).await
    }

    pub async fn commit(self) -> Result<(), DbError> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), DbError> {
        self.tx.into_inner().rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl BudgetHistory for RefundsRun {
    async fn budget_totals(&self, from_epoch: u64, to_epoch: u64) -> anyhow::Result<BudgetTotals> {
        let mut tx = self.tx.lock().await;
        Ok(budget_totals(&mut tx, from_epoch, to_epoch).await?)
    }
}

#[async_trait]
impl TransactionStore for RefundsRun {
    async fn last_finalized_epoch(&self) -> anyhow::Result<Option<u64>> {
        let mut tx = self.tx.lock().await;
        Ok(last_finalized_epoch(&mut tx).await?)
    }

    async fn migration_hashes(&self) -> anyhow::Result<HashSet<B256>> {
        let mut tx = self.tx.lock().await;
        Ok(migration_hashes(&mut tx).await?)
    }

    async fn fetch_transactions(
        &self,
        from_epoch: u64,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<TransactionRecord>> {
        let mut tx = self.tx.lock().await;
        Ok(fetch_transactions(&mut tx, from_epoch, offset, limit).await?)
    }

    async fn update_transactions(&self, records: &[TransactionRecord]) -> anyhow::Result<()> {
        let mut tx = self.tx.lock().await;
        Ok(update_transactions(&mut tx, records).await?)
    }

    async fn count_idle(&self) -> anyhow::Result<u64> {
        let mut tx = self.tx.lock().await;
        Ok(count_idle(&mut tx).await?)
    }
}
