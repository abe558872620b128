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

//! Program configuration.
//!
//! Every field has a compiled-in default matching the production deployment; a TOML file only
//! needs to contain overrides.

use std::path::Path;

use alloy::primitives::{address, Address, U256};
use anyhow::Context;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    budget::{BudgetCaps, EpochCapTier},
    epoch::{AccountingYear, EpochCalculator, DEFAULT_FIRST_EPOCH_START_TIME},
    errors::RefundError,
    stakes::StakeParams,
};

pub const CHAIN_ID_MAINNET: u64 = 1;
pub const CHAIN_ID_OPTIMISM: u64 = 10;
pub const CHAIN_ID_BASE: u64 = 8453;

/// Vault holding the balances of every weighted pool; same address on all chains.
pub const POOL_VAULT_ADDRESS: Address = address!("0xbA1333333333a1BA1108E8412f11850A5C319bA9");

const WEI_PER_TOKEN: u64 = 1_000_000_000_000_000_000;

/// A two-token weighted pool whose shares are locked in the staking token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Pool share token; also the pool identifier in vault events.
    pub pool: Address,
    pub vault: Address,
    /// Reward token held by the pool. When unset, the first token reported by the vault is
    /// assumed to be the reward token.
    #[serde(default)]
    pub tracked_token: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Staking token that locks pool shares.
    pub locking_token: Address,
    /// Block at which the locking token was deployed; transfers are folded from here.
    #[serde(default)]
    pub locking_token_deployment_block: u64,
    pub pool: PoolConfig,
    /// Stakes on this chain count from this time on.
    pub staking_start_timestamp: u64,
}

/// Epoch numbers at which program rules changed, on the [EpochCalculator] numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProgramEpochs {
    /// First epoch of the refund program; accounting years are counted from here.
    pub genesis_epoch: u64,
    /// Duplicate `(chain, hash)` rejection applies from this epoch.
    pub deduplication_start_epoch: u64,
    /// Per-epoch address budgets apply from this epoch.
    pub epoch_budget_start_epoch: u64,
    /// Boost factors and the raised epoch cap apply from this epoch.
    pub boost_start_epoch: u64,
    /// Reduced epoch cap applies from this epoch.
    pub reduced_epoch_cap_start_epoch: u64,
}

impl Default for ProgramEpochs {
    fn default() -> Self {
        Self {
            genesis_epoch: 61,
            deduplication_start_epoch: 61,
            epoch_budget_start_epoch: 63,
            boost_start_epoch: 65,
            reduced_epoch_cap_start_epoch: 70,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Global yearly budget, in whole reward tokens.
    pub global_yearly_cap_tokens: u64,
    pub address_yearly_cap_usd: Decimal,
    pub initial_epoch_cap_usd: Decimal,
    pub boosted_epoch_cap_usd: Decimal,
    pub reduced_epoch_cap_usd: Decimal,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            global_yearly_cap_tokens: 30_000_000,
            address_yearly_cap_usd: Decimal::from(30_000),
            initial_epoch_cap_usd: Decimal::from(1_250),
            boosted_epoch_cap_usd: Decimal::from(2_500),
            reduced_epoch_cap_usd: Decimal::from(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub chains: Vec<ChainConfig>,
    /// No chain contributes to stake scores before this time.
    pub staking_activation_timestamp: u64,
    /// Weight of the locked balance in the stake score, in basis points.
    pub stake_power_multiplier_bps: u64,
    /// Candidates with a combined stake below this many whole tokens are not refundable.
    pub min_stake_tokens: u64,
    pub epochs: EpochCalculator,
    pub program: ProgramEpochs,
    pub budget: BudgetConfig,
    /// Seconds subtracted from "now" when choosing the end of the loaded interval.
    pub calc_time_offset_secs: u64,
    pub validation_page_size: u64,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            chains: default_chains(),
            staking_activation_timestamp: DEFAULT_FIRST_EPOCH_START_TIME,
            stake_power_multiplier_bps: 25_000,
            min_stake_tokens: 0,
            epochs: EpochCalculator::default(),
            program: ProgramEpochs::default(),
            budget: BudgetConfig::default(),
            calc_time_offset_secs: 3600,
            validation_page_size: 1000,
        }
    }
}

fn default_chains() -> Vec<ChainConfig> {
    // Locking tokens were deployed on May 14 2025; stakes count a few seconds after deployment.
    vec![
        ChainConfig {
            chain_id: CHAIN_ID_MAINNET,
            locking_token: address!("0x53fE8d8C00F9FBF55C4276b9cf8451f586D21055"),
            locking_token_deployment_block: 0,
            pool: PoolConfig {
                pool: address!("0x01b3F3aabFf34e266A98e771438320DF98d447dD"),
                vault: POOL_VAULT_ADDRESS,
                tracked_token: None,
            },
            staking_start_timestamp: 1747205272,
        },
        ChainConfig {
            chain_id: CHAIN_ID_OPTIMISM,
            locking_token: address!("0xCbed2888F7F969841a2df28DDA972D40264FCcda"),
            locking_token_deployment_block: 0,
            pool: PoolConfig {
                pool: address!("0x4291b31b17511A26E4131da396145Ef6A5f83875"),
                vault: POOL_VAULT_ADDRESS,
                tracked_token: None,
            },
            staking_start_timestamp: 1747206298,
        },
        ChainConfig {
            chain_id: CHAIN_ID_BASE,
            locking_token: address!("0xa85A6Ccff277a69B80FCd33Bec7DE066147ABF75"),
            locking_token_deployment_block: 0,
            pool: PoolConfig {
                pool: address!("0xEe1e5301dc293E1468fAc27B9b53F309f0AE8344"),
                vault: POOL_VAULT_ADDRESS,
                tracked_token: None,
            },
            staking_start_timestamp: 1747206122,
        },
    ]
}

impl ProgramConfig {
    /// Loads overrides from a TOML file on top of the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RefundError> {
        if self.chains.is_empty() {
            return Err(RefundError::Config("no chains configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(RefundError::Config(format!("chain {} configured twice", chain.chain_id)));
            }
        }
        if self.stake_power_multiplier_bps == 0 {
            return Err(RefundError::Config("stake power multiplier must be positive".into()));
        }
        if self.validation_page_size == 0 {
            return Err(RefundError::Config("validation page size must be positive".into()));
        }
        if self.epochs.epoch_duration() == 0 {
            return Err(RefundError::Config("epoch duration must be positive".into()));
        }
        let p = &self.program;
        if p.boost_start_epoch > p.reduced_epoch_cap_start_epoch {
            return Err(RefundError::Config(
                "boost start epoch must not come after the reduced cap epoch".into(),
            ));
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    pub fn accounting_year(&self) -> AccountingYear {
        AccountingYear::new(self.program.genesis_epoch)
    }

    pub fn stake_params(&self) -> StakeParams {
        StakeParams {
            staking_activation_timestamp: self.staking_activation_timestamp,
            stake_power_multiplier_bps: self.stake_power_multiplier_bps,
        }
    }

    pub fn min_stake_score(&self) -> U256 {
        U256::from(self.min_stake_tokens) * U256::from(WEI_PER_TOKEN)
    }

    pub fn budget_caps(&self) -> BudgetCaps {
        let b = &self.budget;
        let p = &self.program;
        BudgetCaps {
            global_yearly: U256::from(b.global_yearly_cap_tokens) * U256::from(WEI_PER_TOKEN),
            address_yearly_usd: b.address_yearly_cap_usd,
            epoch_tiers: vec![
                EpochCapTier { from_epoch: 0, cap_usd: b.initial_epoch_cap_usd },
                EpochCapTier { from_epoch: p.boost_start_epoch, cap_usd: b.boosted_epoch_cap_usd },
                EpochCapTier {
                    from_epoch: p.reduced_epoch_cap_start_epoch,
                    cap_usd: b.reduced_epoch_cap_usd,
                },
            ],
            epoch_budget_start_epoch: p.epoch_budget_start_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProgramConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chains.len(), 3);
        assert!(config.chain(CHAIN_ID_BASE).is_some());
        assert_eq!(
            config.budget_caps().global_yearly,
            U256::from(30_000_000u64) * U256::from(WEI_PER_TOKEN)
        );
    }

    #[test]
    fn test_toml_overrides() {
        let raw = r#"
            stake_power_multiplier_bps = 10000
            min_stake_tokens = 500

            [program]
            genesis_epoch = 60

            [budget]
            address_yearly_cap_usd = "100"

            [[chains]]
            chain_id = 31337
            locking_token = "0x00000000000000000000000000000000000000aa"
            staking_start_timestamp = 0

            [chains.pool]
            pool = "0x00000000000000000000000000000000000000bb"
            vault = "0x00000000000000000000000000000000000000cc"
        "#;
        let config = ProgramConfig::from_toml(raw).unwrap();

        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].pool.tracked_token, None);
        assert_eq!(config.program.genesis_epoch, 60);
        assert_eq!(config.program.boost_start_epoch, 65);
        assert_eq!(config.budget.address_yearly_cap_usd, Decimal::from(100));
        assert_eq!(config.budget.reduced_epoch_cap_usd, Decimal::from(500));
        assert_eq!(config.min_stake_score(), U256::from(500u64) * U256::from(WEI_PER_TOKEN));
    }

    #[test]
    fn test_duplicate_chain_rejected() {
        let mut config = ProgramConfig::default();
        config.chains.push(config.chains[0].clone());
        assert!(matches!(config.validate(), Err(RefundError::Config(_))));
    }
}
