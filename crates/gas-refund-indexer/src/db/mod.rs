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

pub mod refunds;

use alloy::primitives::B256;
use thiserror::Error;

pub use refunds::{RefundsDb, RefundsRun};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQL error {0:?}")]
    SqlErr(#[from] sqlx::Error),

    #[error("SQL Migration error {0:?}")]
    MigrateErr(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid column value: {0}")]
    BadValue(String),

    #[error("Duplicate stake snapshot for tx {tx_chain_id}:{tx_hash:#x} on chain {stake_chain_id}")]
    DuplicateSnapshot { tx_chain_id: u64, tx_hash: B256, stake_chain_id: u64 },

    #[error("Error: {0}")]
    Error(#[from] anyhow::Error),
}
