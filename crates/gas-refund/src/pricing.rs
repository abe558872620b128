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

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::errors::RefundError;

/// Length of the averaging window.
pub const PRICE_WINDOW_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PriceSample {
    pub timestamp: u64,
    pub usd: Decimal,
}

/// USD price samples of one asset, kept sorted by timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<PriceSample>")]
pub struct PriceHistory {
    samples: Vec<PriceSample>,
}

impl From<Vec<PriceSample>> for PriceHistory {
    fn from(mut samples: Vec<PriceSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { samples }
    }
}

impl PriceHistory {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the samples in `(at - window, at]`.
    pub fn average(&self, at: u64, window: u64) -> Option<Decimal> {
        let from = self.samples.partition_point(|s| s.timestamp + window <= at);
        let to = self.samples.partition_point(|s| s.timestamp <= at);
        let window = self.samples.get(from..to).filter(|w| !w.is_empty())?;
        let sum = window.iter().try_fold(Decimal::ZERO, |acc, s| acc.checked_add(s.usd))?;
        sum.checked_div(Decimal::from(window.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceQuote {
    pub reward_token_usd: Decimal,
    /// Price of the native currency gas is paid in.
    pub chain_currency_usd: Decimal,
}

pub trait PriceResolver: Send + Sync {
    fn resolve(&self, unix_time: u64) -> Result<PriceQuote, RefundError>;
}

/// Resolves prices as trailing 24 hour averages.
#[derive(Debug, Clone, Default)]
pub struct Last24hAvgPriceResolver {
    reward_token: PriceHistory,
    chain_currency: PriceHistory,
}

impl Last24hAvgPriceResolver {
    pub fn new(reward_token: PriceHistory, chain_currency: PriceHistory) -> Self {
        Self { reward_token, chain_currency }
    }
}

impl PriceResolver for Last24hAvgPriceResolver {
    fn resolve(&self, unix_time: u64) -> Result<PriceQuote, RefundError> {
        let average = |history: &PriceHistory, asset: &str| {
            history
                .average(unix_time, PRICE_WINDOW_SECS)
                .filter(|p| p.is_sign_positive() && !p.is_zero())
                .ok_or_else(|| {
                    RefundError::invariant(format!("no {asset} price in the 24h before {unix_time}"))
                })
        };
        let reward_token_usd = average(&self.reward_token, "reward token")?;
        let chain_currency_usd = average(&self.chain_currency, "chain currency")?;
        Ok(PriceQuote { reward_token_usd, chain_currency_usd })
    }
}
