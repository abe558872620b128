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

//! Refund percentage curve and the conversions between USD and reward-token amounts.

use alloy::primitives::U256;
use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal, MathematicalOps, RoundingStrategy,
};

use crate::errors::RefundError;

/// Refunds never exceed 95% of the gas cost.
pub const MAX_REFUND_PERCENT: Decimal = Decimal::from_parts(95, 0, 0, false, 2);

/// Any staker with a non-zero score gets at least 25%.
pub const MIN_REFUND_PERCENT: Decimal = Decimal::from_parts(25, 0, 0, false, 2);

const CURVE_SCALE: Decimal = Decimal::from_parts(152_003, 0, 0, false, 6);
const CURVE_SLOPE: Decimal = Decimal::from_parts(517_947, 0, 0, false, 9);

/// 10^18 as a decimal.
pub const WEI_PER_TOKEN: Decimal = Decimal::from_parts(2_808_348_672, 232_830_643, 0, false, 0);

/// A payout expressed both in reward-token wei and in USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundAmount {
    pub amount: U256,
    pub usd: Decimal,
}

impl RefundAmount {
    pub const ZERO: RefundAmount = RefundAmount { amount: U256::ZERO, usd: Decimal::ZERO };
}

/// Refund percentage for a stake score expressed in wei.
///
/// `clamp(0.152003 * ln(0.000517947 * score / 1e18), 25%, 95%)`, or zero without stake.
pub fn refund_percent(score: U256) -> Result<Decimal, RefundError> {
    let normalized = score / U256::from(1_000_000_000_000_000_000u64);
    // Sub-token scores pay nothing instead of the floor. Any minimum stake of one token or more
    // drops such senders at indexing, so validated records never take this branch.
    if normalized.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let x = CURVE_SLOPE
        .checked_mul(u256_to_decimal(normalized)?)
        .ok_or(RefundError::Arithmetic("refund curve input"))?;
    let raw = x
        .checked_ln()
        .and_then(|ln| ln.checked_mul(CURVE_SCALE))
        .ok_or(RefundError::Arithmetic("refund curve"))?;
    Ok(raw.min(MAX_REFUND_PERCENT).max(MIN_REFUND_PERCENT))
}

/// `floor(score * boost)`.
pub fn boosted_score(score: U256, boost: Decimal) -> Result<U256, RefundError> {
    if boost.is_sign_negative() {
        return Err(RefundError::invariant(format!("negative boost factor {boost}")));
    }
    let mantissa = U256::from(boost.mantissa().unsigned_abs());
    let divisor = U256::from(10u64).pow(U256::from(boost.scale()));
    let scaled = score.checked_mul(mantissa).ok_or(RefundError::Arithmetic("boosted score"))?;
    Ok(scaled / divisor)
}

/// Nominal refund for a gas cost: `usd = gross * percent`, `amount = trunc(usd * 1e18 / price)`.
pub fn compute_refund(
    gross_usd: Decimal,
    reward_token_usd: Decimal,
    percent: Decimal,
) -> Result<RefundAmount, RefundError> {
    if percent.is_zero() {
        return Ok(RefundAmount::ZERO);
    }
    if gross_usd.is_sign_negative() || percent.is_sign_negative() {
        return Err(RefundError::invariant(format!(
            "negative refund input: gross {gross_usd}, percent {percent}"
        )));
    }
    let usd = gross_usd.checked_mul(percent).ok_or(RefundError::Arithmetic("refund usd"))?;
    let amount = usd_to_amount_exact(usd, reward_token_usd)?.trunc();
    Ok(RefundAmount { amount: decimal_to_u256(amount)?, usd })
}

/// Reward-token wei worth `usd`, rounded half away from zero.
pub fn usd_to_amount(usd: Decimal, reward_token_usd: Decimal) -> Result<U256, RefundError> {
    let exact = usd_to_amount_exact(usd, reward_token_usd)?;
    decimal_to_u256(exact.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
}

/// USD value of `amount` wei.
pub fn amount_to_usd(amount: U256, reward_token_usd: Decimal) -> Result<Decimal, RefundError> {
    u256_to_decimal(amount)?
        .checked_mul(reward_token_usd)
        .and_then(|v| v.checked_div(WEI_PER_TOKEN))
        .ok_or(RefundError::Arithmetic("amount to usd"))
}

fn usd_to_amount_exact(usd: Decimal, reward_token_usd: Decimal) -> Result<Decimal, RefundError> {
    if reward_token_usd <= Decimal::ZERO {
        return Err(RefundError::invariant(format!(
            "reward token price must be positive, got {reward_token_usd}"
        )));
    }
    usd.checked_mul(WEI_PER_TOKEN)
        .and_then(|v| v.checked_div(reward_token_usd))
        .ok_or(RefundError::Arithmetic("usd to amount"))
}

pub fn u256_to_decimal(value: U256) -> Result<Decimal, RefundError> {
    let value = u128::try_from(value).map_err(|_| RefundError::Arithmetic("u256 to decimal"))?;
    Decimal::from_u128(value).ok_or(RefundError::Arithmetic("u256 to decimal"))
}

/// Integer part of a non-negative decimal.
pub fn decimal_to_u256(value: Decimal) -> Result<U256, RefundError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(RefundError::invariant(format!("negative amount {value}")));
    }
    value.trunc().to_u128().map(U256::from).ok_or(RefundError::Arithmetic("decimal to u256"))
}
