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

//! Gas refund computation for stakers of a two-token weighted pool.
//!
//! On-chain state (pool supply and balances, locked pool shares) is reconstructed differentially
//! from events, turned into per-account stake scores, and used to size refunds of transaction
//! gas costs. Refunds are validated against per-address and global budgets before distribution.

pub mod boost;
pub mod budget;
pub mod config;
pub mod distribution;
pub mod epoch;
pub mod errors;
pub mod events;
pub mod indexing;
pub mod locked;
pub mod pool;
pub mod pricing;
pub mod refund;
pub mod source;
pub mod stakes;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod timeseries;
pub mod transaction;
pub mod validator;

pub use budget::{BudgetCaps, BudgetGuardian, BudgetHistory, BudgetTotals};
pub use config::ProgramConfig;
pub use epoch::{AccountingYear, EpochCalculator};
pub use errors::RefundError;
pub use pool::{LoadedPoolState, PoolSnapshot, PoolStateTracker};
pub use source::{EventSource, RpcEventSource};
pub use stakes::{ChainStakeTracker, StakeParams, StakeScoreAggregator, StakedScore};
pub use store::TransactionStore;
pub use transaction::{StakeSnapshotRow, TransactionRecord, TransactionStatus};
pub use validator::{TransactionValidator, ValidationSummary, ValidatorConfig};
