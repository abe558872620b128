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

//! Spend accounting against the three nested refund budgets.
//!
//! The guardian is seeded from persisted totals for the current accounting year and is then
//! mutated in memory only, by a single validation pass.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    errors::RefundError,
    refund::{amount_to_usd, usd_to_amount, RefundAmount},
};

/// Epoch cap in USD applying from `from_epoch` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochCapTier {
    pub from_epoch: u64,
    pub cap_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetCaps {
    /// Reward-token wei refundable per accounting year, all addresses combined.
    pub global_yearly: U256,
    pub address_yearly_usd: Decimal,
    /// Sorted by `from_epoch`.
    pub epoch_tiers: Vec<EpochCapTier>,
    /// Epoch budgets are only enforced from this epoch on.
    pub epoch_budget_start_epoch: u64,
}

impl BudgetCaps {
    pub fn epoch_cap_usd(&self, epoch: u64) -> Decimal {
        self.epoch_tiers
            .iter()
            .rev()
            .find(|tier| tier.from_epoch <= epoch)
            .map(|tier| tier.cap_usd)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn epoch_budget_applies(&self, epoch: u64) -> bool {
        epoch >= self.epoch_budget_start_epoch
    }
}

/// Persisted spend of validated refunds over an epoch range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetTotals {
    pub global_spend: U256,
    pub usd_by_address: HashMap<Address, Decimal>,
}

/// Source of historical spend totals.
#[async_trait]
pub trait BudgetHistory: Send + Sync {
    /// Totals of validated refunds with `from_epoch <= epoch < to_epoch`.
    async fn budget_totals(&self, from_epoch: u64, to_epoch: u64) -> anyhow::Result<BudgetTotals>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetState {
    pub global_yearly_spend: U256,
    pub per_address_yearly_spend: HashMap<Address, Decimal>,
    pub per_address_epoch_spend: HashMap<Address, Decimal>,
}

/// Which budget clipped a payout first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapReason {
    AddressYearly,
    AddressEpoch,
    GlobalYearly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedPayout {
    pub payout: RefundAmount,
    pub capped_by: Option<CapReason>,
}

impl CappedPayout {
    pub fn is_capped(&self) -> bool {
        self.capped_by.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BudgetGuardian {
    caps: BudgetCaps,
    state: BudgetState,
}

impl BudgetGuardian {
    pub fn new(caps: BudgetCaps) -> Self {
        Self { caps, state: BudgetState::default() }
    }

    /// The epoch map always starts empty: validation recomputes whole epochs.
    pub fn from_totals(caps: BudgetCaps, totals: BudgetTotals) -> Self {
        Self {
            caps,
            state: BudgetState {
                global_yearly_spend: totals.global_spend,
                per_address_yearly_spend: totals.usd_by_address,
                per_address_epoch_spend: HashMap::new(),
            },
        }
    }

    /// Seeds the guardian with validated spend for `from_epoch <= epoch < to_epoch`.
    pub async fn load_state(
        caps: BudgetCaps,
        history: &(impl BudgetHistory + ?Sized),
        from_epoch: u64,
        to_epoch: u64,
    ) -> Result<Self, RefundError> {
        let totals = if from_epoch < to_epoch {
            history.budget_totals(from_epoch, to_epoch).await.map_err(RefundError::Store)?
        } else {
            BudgetTotals::default()
        };
        tracing::info!(
            "Loaded budget state for epochs [{}, {}): global spend {}, {} addresses",
            from_epoch,
            to_epoch,
            totals.global_spend,
            totals.usd_by_address.len()
        );
        Ok(Self::from_totals(caps, totals))
    }

    pub fn caps(&self) -> &BudgetCaps {
        &self.caps
    }

    pub fn state(&self) -> &BudgetState {
        &self.state
    }

    pub fn yearly_spend(&self, address: &Address) -> Decimal {
        self.state.per_address_yearly_spend.get(address).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn epoch_spend(&self, address: &Address) -> Decimal {
        self.state.per_address_epoch_spend.get(address).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn is_max_yearly_global_budget_spent(&self) -> bool {
        self.state.global_yearly_spend >= self.caps.global_yearly
    }

    pub fn has_spent_yearly_budget(&self, address: &Address) -> bool {
        self.yearly_spend(address) >= self.caps.address_yearly_usd
    }

    pub fn has_spent_epoch_budget(&self, address: &Address, epoch: u64) -> bool {
        self.epoch_spend(address) >= self.caps.epoch_cap_usd(epoch)
    }

    pub fn increase_global_spend(&mut self, amount: U256) -> Result<(), RefundError> {
        self.state.global_yearly_spend = self
            .state
            .global_yearly_spend
            .checked_add(amount)
            .ok_or(RefundError::Arithmetic("global spend"))?;
        Ok(())
    }

    pub fn increase_yearly_spend(&mut self, address: Address, usd: Decimal) -> Result<(), RefundError> {
        increase(&mut self.state.per_address_yearly_spend, address, usd)
    }

    pub fn increase_epoch_spend(&mut self, address: Address, usd: Decimal) -> Result<(), RefundError> {
        increase(&mut self.state.per_address_epoch_spend, address, usd)
    }

    pub fn reset_epoch_budget_state(&mut self) {
        self.state.per_address_epoch_spend.clear();
    }

    pub fn reset_yearly_budget_state(&mut self) {
        self.state.global_yearly_spend = U256::ZERO;
        self.state.per_address_yearly_spend.clear();
    }

    /// Clips a payout so that no budget is exceeded.
    ///
    /// The address budgets are applied first (yearly, then epoch from the configured epoch on)
    /// and the global budget last, each taking the minimum with whatever was already clipped.
    /// When both address budgets bind the payout is the smaller room, reported as `AddressYearly`.
    /// No room yields a zero payout.
    pub fn cap_payout(
        &self,
        address: &Address,
        epoch: u64,
        payout: RefundAmount,
        reward_token_usd: Decimal,
    ) -> Result<CappedPayout, RefundError> {
        let mut usd = payout.usd;
        let mut amount = payout.amount;
        let mut capped_by = None;

        let yearly_spent = self.yearly_spend(address);
        if yearly_spent + usd > self.caps.address_yearly_usd {
            let room = self.caps.address_yearly_usd - yearly_spent;
            if room.is_sign_negative() {
                return Err(RefundError::invariant(format!(
                    "address {address:#x} yearly spend {yearly_spent} is above the cap"
                )));
            }
            usd = room;
            amount = usd_to_amount(room, reward_token_usd)?.min(payout.amount);
            capped_by = Some(CapReason::AddressYearly);
        }

        if self.caps.epoch_budget_applies(epoch) {
            let cap = self.caps.epoch_cap_usd(epoch);
            let epoch_spent = self.epoch_spend(address);
            if epoch_spent + usd > cap {
                let room = cap - epoch_spent;
                if room.is_sign_negative() {
                    return Err(RefundError::invariant(format!(
                        "address {address:#x} epoch {epoch} spend {epoch_spent} is above the cap"
                    )));
                }
                usd = room;
                amount = usd_to_amount(room, reward_token_usd)?.min(payout.amount);
                capped_by = capped_by.or(Some(CapReason::AddressEpoch));
            }
        }

        let global_spent = self.state.global_yearly_spend;
        if global_spent.saturating_add(amount) > self.caps.global_yearly {
            let room = self.caps.global_yearly.saturating_sub(global_spent);
            amount = amount.min(room);
            usd = usd.min(amount_to_usd(amount, reward_token_usd)?);
            capped_by = capped_by.or(Some(CapReason::GlobalYearly));
        }

        Ok(CappedPayout { payout: RefundAmount { amount, usd }, capped_by })
    }

    /// Adds a validated payout to the running totals.
    pub fn record_payout(
        &mut self,
        address: Address,
        epoch: u64,
        payout: &RefundAmount,
    ) -> Result<(), RefundError> {
        if self.caps.epoch_budget_applies(epoch) {
            self.increase_epoch_spend(address, payout.usd)?;
        }
        self.increase_yearly_spend(address, payout.usd)?;
        self.increase_global_spend(payout.amount)
    }
}

fn increase(
    map: &mut HashMap<Address, Decimal>,
    address: Address,
    usd: Decimal,
) -> Result<(), RefundError> {
    if usd.is_sign_negative() && !usd.is_zero() {
        return Err(RefundError::invariant(format!(
            "spend increase for {address:#x} must not be negative, got {usd}"
        )));
    }
    let entry = map.entry(address).or_insert(Decimal::ZERO);
    *entry = entry.checked_add(usd).ok_or(RefundError::Arithmetic("address spend"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use rust_decimal_macros::dec;

    const ALICE: Address = address!("0x00000000000000000000000000000000000a11ce");
    const BOB: Address = address!("0x0000000000000000000000000000000000000b0b");

    fn tokens(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000_000_000_000u64)
    }

    fn caps() -> BudgetCaps {
        BudgetCaps {
            global_yearly: tokens(1_000),
            address_yearly_usd: dec!(100),
            epoch_tiers: vec![
                EpochCapTier { from_epoch: 0, cap_usd: dec!(40) },
                EpochCapTier { from_epoch: 20, cap_usd: dec!(60) },
                EpochCapTier { from_epoch: 30, cap_usd: dec!(10) },
            ],
            epoch_budget_start_epoch: 10,
        }
    }

    // token at $1 so usd and whole tokens line up
    fn payout(usd: u64) -> RefundAmount {
        RefundAmount { amount: tokens(usd), usd: Decimal::from(usd) }
    }

    struct FixedHistory(BudgetTotals);

    #[async_trait]
    impl BudgetHistory for FixedHistory {
        async fn budget_totals(&self, _: u64, _: u64) -> anyhow::Result<BudgetTotals> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_epoch_cap_tiers() {
        let caps = caps();
        assert_eq!(caps.epoch_cap_usd(5), dec!(40));
        assert_eq!(caps.epoch_cap_usd(20), dec!(60));
        assert_eq!(caps.epoch_cap_usd(29), dec!(60));
        assert_eq!(caps.epoch_cap_usd(31), dec!(10));
        assert!(!caps.epoch_budget_applies(9));
        assert!(caps.epoch_budget_applies(10));
    }

    #[tokio::test]
    async fn test_load_state_seeds_yearly_only() {
        let totals = BudgetTotals {
            global_spend: tokens(5),
            usd_by_address: HashMap::from([(ALICE, dec!(100))]),
        };
        let guardian =
            BudgetGuardian::load_state(caps(), &FixedHistory(totals), 1, 4).await.unwrap();

        assert_eq!(guardian.state().global_yearly_spend, tokens(5));
        assert!(guardian.has_spent_yearly_budget(&ALICE));
        assert!(!guardian.has_spent_yearly_budget(&BOB));
        assert!(guardian.state().per_address_epoch_spend.is_empty());

        let empty =
            BudgetGuardian::load_state(caps(), &FixedHistory(BudgetTotals::default()), 4, 4)
                .await
                .unwrap();
        assert_eq!(empty.state(), &BudgetState::default());
    }

    #[test]
    fn test_uncapped_payout() {
        let guardian = BudgetGuardian::new(caps());
        let capped = guardian.cap_payout(&ALICE, 5, payout(30), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(30));
        assert!(!capped.is_capped());
    }

    #[test]
    fn test_yearly_cap_clips_to_remaining_room() {
        let mut guardian = BudgetGuardian::new(caps());
        guardian.increase_yearly_spend(ALICE, dec!(90)).unwrap();

        let capped = guardian.cap_payout(&ALICE, 5, payout(30), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(10));
        assert_eq!(capped.capped_by, Some(CapReason::AddressYearly));
    }

    #[test]
    fn test_epoch_cap_applies_from_start_epoch() {
        let mut guardian = BudgetGuardian::new(caps());
        guardian.increase_epoch_spend(ALICE, dec!(35)).unwrap();

        // before the epoch budget start only the yearly cap matters
        let early = guardian.cap_payout(&ALICE, 9, payout(20), Decimal::ONE).unwrap();
        assert!(!early.is_capped());

        let capped = guardian.cap_payout(&ALICE, 12, payout(20), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(5));
        assert_eq!(capped.capped_by, Some(CapReason::AddressEpoch));
    }

    #[test]
    fn test_yearly_then_epoch_clip_takes_smaller_room() {
        // yearly room 20, epoch room 5
        let mut guardian = BudgetGuardian::new(caps());
        guardian.increase_yearly_spend(ALICE, dec!(80)).unwrap();
        guardian.increase_epoch_spend(ALICE, dec!(35)).unwrap();

        let capped = guardian.cap_payout(&ALICE, 12, payout(50), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(5));
        assert_eq!(capped.capped_by, Some(CapReason::AddressYearly));

        // yearly room 3 already fits the epoch room
        guardian.increase_yearly_spend(ALICE, dec!(17)).unwrap();
        let capped = guardian.cap_payout(&ALICE, 12, payout(50), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(3));
        assert_eq!(capped.capped_by, Some(CapReason::AddressYearly));

        // before the epoch budget starts only the yearly room applies
        let capped = guardian.cap_payout(&ALICE, 9, payout(50), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(3));
    }

    #[test]
    fn test_global_cap_takes_minimum() {
        let mut guardian = BudgetGuardian::new(caps());
        guardian.increase_global_spend(tokens(995)).unwrap();

        let capped = guardian.cap_payout(&BOB, 5, payout(30), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(5));
        assert_eq!(capped.capped_by, Some(CapReason::GlobalYearly));

        // address clip to 10, global room of 5 wins
        guardian.increase_yearly_spend(BOB, dec!(90)).unwrap();
        let capped = guardian.cap_payout(&BOB, 5, payout(30), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, payout(5));
        assert_eq!(capped.capped_by, Some(CapReason::AddressYearly));
    }

    #[test]
    fn test_zero_room_yields_zero_payout() {
        let mut guardian = BudgetGuardian::new(caps());
        guardian.increase_yearly_spend(ALICE, dec!(100)).unwrap();

        let capped = guardian.cap_payout(&ALICE, 5, payout(30), Decimal::ONE).unwrap();
        assert_eq!(capped.payout, RefundAmount::ZERO);
        assert!(capped.is_capped());
    }

    #[test]
    fn test_overspent_address_is_invariant_violation() {
        let mut guardian = BudgetGuardian::new(caps());
        guardian.increase_yearly_spend(ALICE, dec!(101)).unwrap();
        assert!(matches!(
            guardian.cap_payout(&ALICE, 5, payout(1), Decimal::ONE),
            Err(RefundError::Invariant(_))
        ));
    }

    #[test]
    fn test_predicates_and_resets() {
        let mut guardian = BudgetGuardian::new(caps());
        guardian.record_payout(ALICE, 31, &payout(10)).unwrap();

        assert!(guardian.has_spent_epoch_budget(&ALICE, 31));
        assert!(!guardian.has_spent_epoch_budget(&ALICE, 25));
        assert_eq!(guardian.yearly_spend(&ALICE), dec!(10));
        assert_eq!(guardian.state().global_yearly_spend, tokens(10));

        guardian.reset_epoch_budget_state();
        assert!(!guardian.has_spent_epoch_budget(&ALICE, 31));
        assert_eq!(guardian.yearly_spend(&ALICE), dec!(10));

        guardian.increase_global_spend(tokens(990)).unwrap();
        assert!(guardian.is_max_yearly_global_budget_spent());
        guardian.reset_yearly_budget_state();
        assert!(!guardian.is_max_yearly_global_budget_spent());
        assert_eq!(guardian.yearly_spend(&ALICE), Decimal::ZERO);
    }

    #[test]
    fn test_negative_increase_rejected() {
        let mut guardian = BudgetGuardian::new(caps());
        assert!(guardian.increase_yearly_spend(ALICE, dec!(-1)).is_err());
        assert!(guardian.increase_epoch_spend(ALICE, dec!(-0.01)).is_err());
    }

    #[test]
    fn test_record_payout_skips_epoch_map_before_start() {
        let mut guardian = BudgetGuardian::new(caps());
        guardian.record_payout(BOB, 3, &payout(7)).unwrap();
        assert_eq!(guardian.epoch_spend(&BOB), Decimal::ZERO);
        assert_eq!(guardian.yearly_spend(&BOB), dec!(7));
    }
}
