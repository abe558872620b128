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

use alloy::primitives::{Address, B256};
use thiserror::Error;

/// Errors produced by the refund computation.
///
/// Everything except [RefundError::Store] and [RefundError::Fetch] signals a logic error in
/// either this crate or its inputs and must abort the run.
#[derive(Error, Debug)]
pub enum RefundError {
    #[error("timestamp {timestamp} is outside the loaded interval [{start}, {end}]")]
    OutOfRange { timestamp: u64, start: u64, end: u64 },

    #[error("failed to {operation} on chain {chain_id}: {source:#}")]
    Fetch {
        chain_id: u64,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to fetch boost factors for epoch {epoch}: {source:#}")]
    Boost {
        epoch: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(
        "duplicate stake snapshot for tx {tx_chain_id}:{tx_hash:#x}, staker {staker:#x}, stake chain {stake_chain_id}"
    )]
    DuplicateSnapshot { tx_chain_id: u64, tx_hash: B256, staker: Address, stake_chain_id: u64 },

    #[error("arithmetic overflow in {0}")]
    Arithmetic(&'static str),

    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RefundError {
    pub(crate) fn fetch(chain_id: u64, operation: &'static str, source: anyhow::Error) -> Self {
        RefundError::Fetch { chain_id, operation, source }
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        RefundError::Invariant(msg.into())
    }
}
