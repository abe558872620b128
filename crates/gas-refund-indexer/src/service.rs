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

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use gas_refund::{
    boost::BoostProvider,
    distribution::{distribute, EpochDistribution},
    indexing::{index_candidates, IndexedBatch, RefundCandidate, RefundableTxBuilder},
    pricing::PriceResolver,
    ChainStakeTracker, EventSource, ProgramConfig, StakeScoreAggregator, TransactionValidator,
    ValidationSummary, ValidatorConfig,
};

use crate::db::{RefundsDb, RefundsRun};

#[derive(Debug, Clone, Copy, Default)]
pub struct GasRefundServiceConfig {
    /// Store the distribution and mark the epoch finalized once it has fully elapsed.
    pub finalize: bool,
}

/// Outcome of [GasRefundService::run_epoch].
#[derive(Debug, Clone, Default)]
pub struct EpochRun {
    pub epoch: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub inserted: usize,
    pub snapshots: u64,
    pub skipped_candidates: usize,
    pub validation: ValidationSummary,
    pub distribution: EpochDistribution,
    pub finalized: bool,
}

pub struct GasRefundService {
    db: RefundsDb,
    program: ProgramConfig,
    trackers: Vec<ChainStakeTracker>,
    prices: Arc<dyn PriceResolver>,
    boosts: Arc<dyn BoostProvider>,
    config: GasRefundServiceConfig,
}

impl GasRefundService {
    /// Builds one stake tracker per configured chain from the matching source.
    pub fn new(
        db: RefundsDb,
        program: ProgramConfig,
        sources: Vec<Arc<dyn EventSource>>,
        prices: Arc<dyn PriceResolver>,
        boosts: Arc<dyn BoostProvider>,
        config: GasRefundServiceConfig,
    ) -> Result<Self> {
        program.validate()?;
        let mut by_chain: HashMap<u64, Arc<dyn EventSource>> =
            sources.into_iter().map(|s| (s.chain_id(), s)).collect();
        let trackers = program
            .chains
            .iter()
            .map(|chain| {
                let source = by_chain
                    .remove(&chain.chain_id)
                    .with_context(|| format!("no event source for chain {}", chain.chain_id))?;
                Ok(ChainStakeTracker::new(chain, source)?)
            })
            .collect::<Result<Vec<_>>>()?;
        for chain_id in by_chain.keys() {
            tracing::warn!("Ignoring event source for unconfigured chain {}", chain_id);
        }
        Ok(Self { db, program, trackers, prices, boosts, config })
    }

    pub fn db(&self) -> &RefundsDb {
        &self.db
    }

    pub async fn run_epoch(&self, epoch: u64, candidates: &[RefundCandidate]) -> Result<EpochRun> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        self.run_epoch_at(epoch, candidates, now).await
    }

    /// Indexes `candidates` of `epoch` and revalidates every unfinalized record as of `now`.
    ///
    /// All writes share one database transaction; on any error nothing is committed.
    pub async fn run_epoch_at(
        &self,
        epoch: u64,
        candidates: &[RefundCandidate],
        now: u64,
    ) -> Result<EpochRun> {
        let run_start = std::time::Instant::now();
        let calendar = &self.program.epochs;
        let boundary =
            calendar.epoch_boundary(epoch).with_context(|| format!("epoch {epoch} predates the calendar"))?;
        let cutoff = now.saturating_sub(self.program.calc_time_offset_secs);
        let end_time = boundary.end_time.min(cutoff);
        if end_time < boundary.start_time {
            bail!("epoch {} starts at {}, after the cutoff {}", epoch, boundary.start_time, cutoff);
        }
        let current_epoch = calendar
            .epoch_for_timestamp(now)
            .with_context(|| format!("current time {now} predates the calendar"))?;
        tracing::info!(
            "Processing epoch {} over [{}, {}] (current epoch {})",
            epoch,
            boundary.start_time,
            end_time,
            current_epoch
        );

        let aggregator = StakeScoreAggregator::load(
            self.program.stake_params(),
            &self.trackers,
            boundary.start_time,
            end_time,
        )
        .await
        .context("failed to load stakes")?;

        let (in_range, skipped): (Vec<RefundCandidate>, Vec<RefundCandidate>) = candidates
            .iter()
            .cloned()
            .partition(|c| (boundary.start_time..=end_time).contains(&c.timestamp));
        for candidate in &skipped {
            tracing::warn!(
                "Skipping candidate {}:{:#x} at {} outside [{}, {}]",
                candidate.chain_id,
                candidate.hash,
                candidate.timestamp,
                boundary.start_time,
                end_time
            );
        }

        let builder = RefundableTxBuilder::new(self.program.min_stake_score());
        let batch = index_candidates(&builder, calendar, &aggregator, self.prices.as_ref(), &in_range)?;

        let run = self.db.begin_run().await?;
        // the epoch is complete once its last second is inside the loaded interval
        let complete = end_time == boundary.end_time;
        let result = self.run_in_transaction(&run, epoch, current_epoch, &batch, complete).await;
        let mut outcome = match result {
            Ok(outcome) => {
                run.commit().await?;
                outcome
            }
            Err(err) => {
                if let Err(rollback_err) = run.rollback().await {
                    tracing::error!("Failed to roll back epoch {} run: {:?}", epoch, rollback_err);
                }
                return Err(err);
            }
        };

        outcome.start_time = boundary.start_time;
        outcome.end_time = end_time;
        outcome.skipped_candidates = skipped.len();
        for (&(_, chain_id), entry) in &outcome.distribution {
            tracing::info!(
                "Epoch {} chain {}: {} transactions, {} refunded, {} claimable",
                epoch,
                chain_id,
                entry.transactions,
                entry.refunded,
                entry.claimable
            );
        }
        tracing::info!("Epoch {} processed in {:?}", epoch, run_start.elapsed());
        Ok(outcome)
    }

    async fn run_in_transaction(
        &self,
        run: &RefundsRun,
        epoch: u64,
        current_epoch: u64,
        batch: &IndexedBatch,
        complete: bool,
    ) -> Result<EpochRun> {
        let inserted = run.insert_transactions(&batch.records).await?;
        let snapshots: Vec<_> = batch
            .snapshots
            .iter()
            .filter(|s| inserted.contains(&(s.tx_chain_id, s.tx_hash)))
            .cloned()
            .collect();
        let written = run.write_stake_snapshots(&snapshots).await?;
        tracing::info!(
            "Inserted {} of {} records and {} stake snapshots",
            inserted.len(),
            batch.records.len(),
            written
        );

        let validator = TransactionValidator::new(
            ValidatorConfig::from_program(&self.program, current_epoch),
            run,
            self.boosts.as_ref(),
        );
        let validation = validator.run().await.context("validation failed")?;

        let records = run.transactions_in_epoch(epoch).await?;
        let stake_snapshots = run.stake_snapshots_in_epoch(epoch).await?;
        let distribution = distribute(&records, &stake_snapshots)?;

        let finalized = self.config.finalize && complete;
        if finalized {
            run.record_distribution(epoch, &distribution).await?;
            tracing::info!("Finalized epoch {}", epoch);
        }

        Ok(EpochRun {
            epoch,
            inserted: inserted.len(),
            snapshots: written,
            validation,
            distribution,
            finalized,
            ..Default::default()
        })
    }
}
