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

//! Validation of persisted refund candidates.
//!
//! Every record from the first unfinalized epoch on is re-evaluated in `(timestamp, hash)` order.
//! Refunds are recomputed from the stored stake score and gas cost, then either rejected or
//! clipped against the [BudgetGuardian]. The outcome depends only on the persisted inputs, so
//! repeated runs over unchanged data write nothing.

use std::collections::HashSet;

use alloy::primitives::B256;
use rust_decimal::Decimal;

use crate::{
    boost::{BoostCache, BoostProvider},
    budget::{BudgetCaps, BudgetGuardian},
    config::{ProgramConfig, ProgramEpochs},
    epoch::AccountingYear,
    errors::RefundError,
    refund::{boosted_score, compute_refund, refund_percent, MAX_REFUND_PERCENT},
    store::TransactionStore,
    transaction::{TransactionRecord, TransactionStatus},
};

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub caps: BudgetCaps,
    pub program: ProgramEpochs,
    pub accounting_year: AccountingYear,
    /// Epoch in progress when the run started.
    pub current_epoch: u64,
    pub page_size: u64,
}

impl ValidatorConfig {
    pub fn from_program(config: &ProgramConfig, current_epoch: u64) -> Self {
        Self {
            caps: config.budget_caps(),
            program: config.program,
            accounting_year: config.accounting_year(),
            current_epoch,
            page_size: config.validation_page_size,
        }
    }
}

/// Counters of a validation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub start_epoch: u64,
    pub pages: u64,
    pub scanned: u64,
    pub validated: u64,
    pub rejected: u64,
    pub capped: u64,
    /// Records written back because a validator-owned field changed.
    pub updated: u64,
}

/// Mutable state of one scan.
struct Scan<'a> {
    config: &'a ValidatorConfig,
    guardian: BudgetGuardian,
    boosts: BoostCache<'a>,
    migrations: HashSet<B256>,
    current_epoch: u64,
    seen_in_epoch: HashSet<(u64, B256)>,
    summary: ValidationSummary,
}

impl Scan<'_> {
    fn enter_epoch(&mut self, epoch: u64) {
        if epoch == self.current_epoch {
            return;
        }
        let year = &self.config.accounting_year;
        tracing::debug!("Validation crossed from epoch {} to {}", self.current_epoch, epoch);
        self.guardian.reset_epoch_budget_state();
        self.seen_in_epoch.clear();
        if !year.same_year(self.current_epoch, epoch) {
            tracing::info!(
                "Epoch {} starts accounting year {}, resetting yearly budgets",
                epoch,
                year.year_index(epoch)
            );
            self.guardian.reset_yearly_budget_state();
        }
        self.current_epoch = epoch;
    }

    fn is_rejected(&self, tx: &TransactionRecord) -> bool {
        let program = &self.config.program;
        let guardian = &self.guardian;
        guardian.is_max_yearly_global_budget_spent()
            || guardian.has_spent_yearly_budget(&tx.address)
            || (guardian.caps().epoch_budget_applies(tx.epoch)
                && guardian.has_spent_epoch_budget(&tx.address, tx.epoch))
            || (tx.epoch >= program.deduplication_start_epoch
                && self.seen_in_epoch.contains(&tx.key()))
            || self.migrations.contains(&tx.hash)
    }

    /// Re-evaluates one record and returns it if anything changed.
    async fn process(&mut self, tx: &TransactionRecord) -> Result<Option<TransactionRecord>, RefundError> {
        self.enter_epoch(tx.epoch);
        let program = self.config.program;

        if tx.is_migration && !self.migrations.contains(&tx.hash) {
            return Err(RefundError::invariant(format!(
                "migration tx {}:{:#x} is missing from the migration set",
                tx.chain_id, tx.hash
            )));
        }

        let boosted_epoch = tx.epoch >= program.boost_start_epoch;
        let boost_factor = if boosted_epoch {
            self.boosts.factor(tx.epoch, &tx.address).await?
        } else {
            tx.boost_factor
        };
        let in_grace_period = boosted_epoch && self.config.current_epoch > tx.epoch;
        let score = if in_grace_period {
            boosted_score(tx.total_stake_score, boost_factor)?
        } else {
            tx.total_stake_score
        };
        let percent = refund_percent(score)?;
        if percent > MAX_REFUND_PERCENT {
            return Err(RefundError::invariant(format!("refund percent {percent} above maximum")));
        }
        let nominal = compute_refund(tx.gross_usd_cost, tx.reward_token_usd, percent)?;

        let mut next = tx.clone();
        next.boost_factor = boost_factor;

        if !tx.is_migration && self.is_rejected(tx) {
            next.status = TransactionStatus::Rejected;
            self.summary.rejected += 1;
        } else {
            next.status = TransactionStatus::Validated;
            self.summary.validated += 1;
            if tx.is_migration {
                if tx.refunded_amount < nominal.amount {
                    return Err(RefundError::invariant(format!(
                        "migration tx {}:{:#x} recorded {} but recomputes to {}",
                        tx.chain_id, tx.hash, tx.refunded_amount, nominal.amount
                    )));
                }
            } else {
                let capped =
                    self.guardian.cap_payout(&tx.address, tx.epoch, nominal, tx.reward_token_usd)?;
                if let Some(reason) = capped.capped_by {
                    tracing::debug!(
                        "Capped refund of {}:{:#x} by {:?}: {} -> {} USD",
                        tx.chain_id,
                        tx.hash,
                        reason,
                        nominal.usd,
                        capped.payout.usd
                    );
                    self.summary.capped += 1;
                }
                self.guardian.record_payout(tx.address, tx.epoch, &capped.payout)?;
                next.refunded_amount = capped.payout.amount;
                next.refunded_usd = capped.payout.usd;
            }
        }
        self.seen_in_epoch.insert(tx.key());

        Ok(next.validation_differs(tx).then_some(next))
    }
}

pub struct TransactionValidator<'a> {
    config: ValidatorConfig,
    store: &'a dyn TransactionStore,
    boosts: &'a dyn BoostProvider,
}

impl<'a> TransactionValidator<'a> {
    pub fn new(
        config: ValidatorConfig,
        store: &'a dyn TransactionStore,
        boosts: &'a dyn BoostProvider,
    ) -> Self {
        Self { config, store, boosts }
    }

    /// First epoch whose records may still change.
    pub async fn start_epoch(&self) -> Result<u64, RefundError> {
        let genesis = self.config.program.genesis_epoch;
        let last_finalized = self.store.last_finalized_epoch().await.map_err(RefundError::Store)?;
        Ok(last_finalized.map_or(genesis, |epoch| (epoch + 1).max(genesis)))
    }

    pub async fn run(&self) -> Result<ValidationSummary, RefundError> {
        let start_epoch = self.start_epoch().await?;
        let first_epoch_of_year = self.config.accounting_year.first_epoch_of_year(start_epoch);
        tracing::info!(
            "Validating transactions from epoch {} (accounting year starts at epoch {})",
            start_epoch,
            first_epoch_of_year
        );

        let guardian = BudgetGuardian::load_state(
            self.config.caps.clone(),
            self.store,
            first_epoch_of_year,
            start_epoch,
        )
        .await?;
        let migrations = self.store.migration_hashes().await.map_err(RefundError::Store)?;

        let mut scan = Scan {
            config: &self.config,
            guardian,
            boosts: BoostCache::new(self.boosts),
            migrations,
            current_epoch: start_epoch,
            seen_in_epoch: HashSet::new(),
            summary: ValidationSummary { start_epoch, ..Default::default() },
        };

        let page_size = self.config.page_size.max(1);
        let mut offset = 0u64;
        loop {
            let page = self
                .store
                .fetch_transactions(start_epoch, offset, page_size)
                .await
                .map_err(RefundError::Store)?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            scan.summary.pages += 1;
            scan.summary.scanned += page.len() as u64;

            let mut updated = Vec::new();
            for tx in &page {
                if let Some(next) = scan.process(tx).await? {
                    updated.push(next);
                }
            }
            if !updated.is_empty() {
                self.store.update_transactions(&updated).await.map_err(RefundError::Store)?;
                scan.summary.updated += updated.len() as u64;
            }
            tracing::debug!(
                "Validated page {} ({} records, {} updated)",
                scan.summary.pages,
                page.len(),
                updated.len()
            );
            if (page.len() as u64) < page_size {
                break;
            }
        }

        let idle = self.store.count_idle().await.map_err(RefundError::Store)?;
        if idle != 0 {
            return Err(RefundError::invariant(format!(
                "{idle} transactions are still idle after validation"
            )));
        }

        let summary = scan.summary;
        tracing::info!(
            "Validation done: {} scanned, {} validated ({} capped), {} rejected, {} updated",
            summary.scanned,
            summary.validated,
            summary.capped,
            summary.rejected,
            summary.updated
        );
        Ok(summary)
    }
}
