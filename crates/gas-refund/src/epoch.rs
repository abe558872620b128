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

//! Epoch calendar of the refund program.
//!
//! Epochs are fixed-duration periods numbered from a reference epoch:
//! - `epoch(ts) = first_epoch + (ts - first_epoch_start_time) / epoch_duration`
//! - `start(epoch) = first_epoch_start_time + (epoch - first_epoch) * epoch_duration`
//! - `end(epoch) = start(epoch + 1) - 1`
//!
//! Accounting years are groups of [EPOCHS_PER_YEAR] epochs counted from the program genesis
//! epoch; yearly budgets are scoped to one such group.

use serde::Deserialize;

/// Four weeks.
pub const EPOCH_DURATION: u64 = 4 * 7 * 24 * 60 * 60;

/// First epoch computed on the current staking system.
pub const DEFAULT_FIRST_EPOCH: u64 = 56;

/// Start time of [DEFAULT_FIRST_EPOCH], also the staking activation time.
pub const DEFAULT_FIRST_EPOCH_START_TIME: u64 = 1734955200;

pub const EPOCHS_PER_YEAR: u64 = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochBoundary {
    pub epoch_number: u64,
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EpochCalculator {
    first_epoch: u64,
    first_epoch_start_time: u64,
    epoch_duration: u64,
}

impl Default for EpochCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_FIRST_EPOCH, DEFAULT_FIRST_EPOCH_START_TIME, EPOCH_DURATION)
    }
}

impl EpochCalculator {
    pub fn new(first_epoch: u64, first_epoch_start_time: u64, epoch_duration: u64) -> Self {
        Self { first_epoch, first_epoch_start_time, epoch_duration }
    }

    pub fn first_epoch(&self) -> u64 {
        self.first_epoch
    }

    pub fn epoch_duration(&self) -> u64 {
        self.epoch_duration
    }

    /// Returns None if the timestamp is before the first epoch.
    pub fn epoch_for_timestamp(&self, timestamp: u64) -> Option<u64> {
        if timestamp < self.first_epoch_start_time || self.epoch_duration == 0 {
            return None;
        }
        Some(self.first_epoch + (timestamp - self.first_epoch_start_time) / self.epoch_duration)
    }

    /// Returns None for epochs before the first epoch.
    pub fn epoch_start_time(&self, epoch: u64) -> Option<u64> {
        let offset = epoch.checked_sub(self.first_epoch)?;
        Some(self.first_epoch_start_time + offset * self.epoch_duration)
    }

    /// Last second of the epoch, inclusive.
    pub fn epoch_end_time(&self, epoch: u64) -> Option<u64> {
        Some(self.epoch_start_time(epoch + 1)? - 1)
    }

    pub fn epoch_boundary(&self, epoch: u64) -> Option<EpochBoundary> {
        Some(EpochBoundary {
            epoch_number: epoch,
            start_time: self.epoch_start_time(epoch)?,
            end_time: self.epoch_end_time(epoch)?,
        })
    }
}

/// Groups epochs into accounting years.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountingYear {
    pub genesis_epoch: u64,
    pub epochs_per_year: u64,
}

impl AccountingYear {
    pub fn new(genesis_epoch: u64) -> Self {
        Self { genesis_epoch, epochs_per_year: EPOCHS_PER_YEAR }
    }

    /// Epochs before genesis all belong to year 0.
    pub fn year_index(&self, epoch: u64) -> u64 {
        epoch.saturating_sub(self.genesis_epoch) / self.epochs_per_year
    }

    pub fn first_epoch_of_year(&self, epoch: u64) -> u64 {
        self.genesis_epoch + self.year_index(epoch) * self.epochs_per_year
    }

    pub fn same_year(&self, a: u64, b: u64) -> bool {
        self.year_index(a) == self.year_index(b)
    }
}
