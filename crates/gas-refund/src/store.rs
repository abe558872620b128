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

use std::collections::HashSet;

use alloy::primitives::B256;
use async_trait::async_trait;

use crate::{budget::BudgetHistory, transaction::TransactionRecord};

/// Persisted refund candidates, as seen by the validator.
///
/// A validation run must see a consistent view and have its updates applied atomically;
/// implementations backed by a database scope the whole run in one transaction.
#[async_trait]
pub trait TransactionStore: BudgetHistory {
    /// Last epoch whose refunds were distributed and can no longer change.
    async fn last_finalized_epoch(&self) -> anyhow::Result<Option<u64>>;

    /// Hashes of every migration transaction.
    async fn migration_hashes(&self) -> anyhow::Result<HashSet<B256>>;

    /// Records with `epoch >= from_epoch`, ordered by `(timestamp, hash)`.
    async fn fetch_transactions(
        &self,
        from_epoch: u64,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<TransactionRecord>>;

    /// Overwrites status, amounts and boost factor of existing records.
    async fn update_transactions(&self, records: &[TransactionRecord]) -> anyhow::Result<()>;

    async fn count_idle(&self) -> anyhow::Result<u64>;
}
