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

//! Per-account score boost factors published by an external staking service.

use std::collections::HashMap;

use alloy::primitives::Address;
use anyhow::Context;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::errors::RefundError;

pub type BoostFactors = HashMap<Address, Decimal>;

#[async_trait]
pub trait BoostProvider: Send + Sync {
    /// Boost factors for `epoch`. Accounts without an entry are not boosted.
    async fn boost_factors(&self, epoch: u64) -> anyhow::Result<BoostFactors>;
}

/// Provider for programs without boosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBoost;

#[async_trait]
impl BoostProvider for NoBoost {
    async fn boost_factors(&self, _epoch: u64) -> anyhow::Result<BoostFactors> {
        Ok(BoostFactors::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoostEntry {
    account: Address,
    #[serde(alias = "paraBoostFactor")]
    boost_factor: Decimal,
}

/// Fetches boosts from `GET {base}/paraboost/v3/list?epoch=N`.
///
/// The service numbers epochs from the first boosted epoch, so `epoch_offset` is subtracted
/// from program epochs before querying.
#[derive(Debug, Clone)]
pub struct HttpBoostProvider {
    client: reqwest::Client,
    base_url: Url,
    epoch_offset: u64,
}

impl HttpBoostProvider {
    pub fn new(base_url: Url, epoch_offset: u64) -> Self {
        Self { client: reqwest::Client::new(), base_url, epoch_offset }
    }

    fn list_url(&self, epoch: u64) -> anyhow::Result<Url> {
        let service_epoch = epoch.checked_sub(self.epoch_offset).with_context(|| {
            format!("epoch {epoch} is before the first boosted epoch {}", self.epoch_offset)
        })?;
        let mut url = self.base_url.join("paraboost/v3/list")?;
        url.query_pairs_mut().append_pair("epoch", &service_epoch.to_string());
        Ok(url)
    }
}

#[async_trait]
impl BoostProvider for HttpBoostProvider {
    async fn boost_factors(&self, epoch: u64) -> anyhow::Result<BoostFactors> {
        let url = self.list_url(epoch)?;
        let entries: Vec<BoostEntry> = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to query {url}"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid boost list from {url}"))?;
        tracing::debug!("Fetched {} boost factors for epoch {}", entries.len(), epoch);
        Ok(entries.into_iter().map(|e| (e.account, e.boost_factor)).collect())
    }
}

/// Boosts never reduce a score.
pub fn validate_factors(factors: &BoostFactors) -> Result<(), RefundError> {
    match factors.iter().find(|(_, f)| **f < Decimal::ONE) {
        Some((account, factor)) => Err(RefundError::invariant(format!(
            "boost factor {factor} of {account:#x} is below 1"
        ))),
        None => Ok(()),
    }
}

/// Remembers the factors of the most recently requested epoch.
pub struct BoostCache<'a> {
    provider: &'a dyn BoostProvider,
    current: Option<(u64, BoostFactors)>,
}

impl<'a> BoostCache<'a> {
    pub fn new(provider: &'a dyn BoostProvider) -> Self {
        Self { provider, current: None }
    }

    pub async fn factors(&mut self, epoch: u64) -> Result<&BoostFactors, RefundError> {
        let cached = matches!(&self.current, Some((e, _)) if *e == epoch);
        if !cached {
            let factors = self
                .provider
                .boost_factors(epoch)
                .await
                .map_err(|source| RefundError::Boost { epoch, source })?;
            validate_factors(&factors)?;
            self.current = Some((epoch, factors));
        }
        match &self.current {
            Some((_, factors)) => Ok(factors),
            None => Err(RefundError::invariant("boost cache is empty after refresh")),
        }
    }

    /// Factor of `account` in `epoch`, 1 when the account has none.
    pub async fn factor(&mut self, epoch: u64, account: &Address) -> Result<Decimal, RefundError> {
        Ok(self.factors(epoch).await?.get(account).copied().unwrap_or(Decimal::ONE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ALICE: Address = address!("0x0000000000000000000000000000000000000a11");

    struct CountingProvider {
        calls: AtomicUsize,
        factor: Decimal,
    }

    #[async_trait]
    impl BoostProvider for CountingProvider {
        async fn boost_factors(&self, _epoch: u64) -> anyhow::Result<BoostFactors> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HashMap::from([(ALICE, self.factor)]))
        }
    }

    #[tokio::test]
    async fn test_cache_fetches_once_per_epoch() {
        let provider = CountingProvider { calls: AtomicUsize::new(0), factor: dec!(1.5) };
        let mut cache = BoostCache::new(&provider);
        let bob = address!("0x0000000000000000000000000000000000000b0b");

        assert_eq!(cache.factor(40, &ALICE).await.unwrap(), dec!(1.5));
        assert_eq!(cache.factor(40, &bob).await.unwrap(), Decimal::ONE);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        cache.factor(41, &ALICE).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factor_below_one_rejected() {
        let provider = CountingProvider { calls: AtomicUsize::new(0), factor: dec!(0.9) };
        let mut cache = BoostCache::new(&provider);
        assert!(matches!(cache.factor(40, &ALICE).await, Err(RefundError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_no_boost() {
        let mut cache = BoostCache::new(&NoBoost);
        assert_eq!(cache.factor(1, &ALICE).await.unwrap(), Decimal::ONE);
    }

    #[test]
    fn test_list_url() {
        let provider = HttpBoostProvider::new(Url::parse("http://boost.local/api/").unwrap(), 32);
        assert_eq!(
            provider.list_url(40).unwrap().as_str(),
            "http://boost.local/api/paraboost/v3/list?epoch=8"
        );
        assert!(provider.list_url(31).is_err());
    }

    #[test]
    fn test_entry_deserialization() {
        let entries: Vec<BoostEntry> = serde_json::from_str(
            r#"[{"account": "0x0000000000000000000000000000000000000a11", "score": "10", "paraBoostFactor": "1.25"}]"#,
        )
        .unwrap();
        assert_eq!(entries[0].account, ALICE);
        assert_eq!(entries[0].boost_factor, dec!(1.25));
    }
}
