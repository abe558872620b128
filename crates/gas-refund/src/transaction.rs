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

use std::{fmt, str::FromStr};

use alloy::primitives::{Address, B256, U256};
use rust_decimal::Decimal;

use crate::errors::RefundError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Idle,
    Validated,
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Idle => "idle",
            TransactionStatus::Validated => "validated",
            TransactionStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = RefundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TransactionStatus::Idle),
            "validated" => Ok(TransactionStatus::Validated),
            "rejected" => Ok(TransactionStatus::Rejected),
            other => Err(RefundError::invariant(format!("unknown transaction status {other:?}"))),
        }
    }
}

/// A refund candidate. Exactly one record exists per `(chain_id, hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub epoch: u64,
    /// Sender of the transaction.
    pub address: Address,
    pub chain_id: u64,
    pub hash: B256,
    pub block_number: u64,
    pub timestamp: u64,
    /// Contract the transaction called.
    pub contract: Address,
    pub gross_usd_cost: Decimal,
    /// Reward token price used for this transaction.
    pub reward_token_usd: Decimal,
    /// Combined stake score of the sender at `timestamp`.
    pub total_stake_score: U256,
    pub refunded_amount: U256,
    pub refunded_usd: Decimal,
    pub boost_factor: Decimal,
    /// One-time migration refund, paid in full and exempt from budgets.
    pub is_migration: bool,
    pub status: TransactionStatus,
}

impl TransactionRecord {
    pub fn key(&self) -> (u64, B256) {
        (self.chain_id, self.hash)
    }

    /// True if any field the validator owns differs from `other`.
    pub fn validation_differs(&self, other: &TransactionRecord) -> bool {
        self.status != other.status
            || self.refunded_amount != other.refunded_amount
            || self.refunded_usd != other.refunded_usd
            || self.boost_factor != other.boost_factor
    }
}

/// Per-chain stake of the sender behind a refunded transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeSnapshotRow {
    pub tx_chain_id: u64,
    pub tx_hash: B256,
    pub staker: Address,
    pub stake_chain_id: u64,
    pub stake_score: U256,
    pub locked_balance: U256,
    pub pool_total_supply: U256,
    pub pool_tracked_balance: U256,
}

impl StakeSnapshotRow {
    pub fn key(&self) -> (u64, B256, Address, u64) {
        (self.tx_chain_id, self.tx_hash, self.staker, self.stake_chain_id)
    }
}
