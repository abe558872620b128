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

//! Sorted delta series reducible to an absolute value at any timestamp.

use alloy::primitives::{I256, U256};

use crate::errors::RefundError;

/// A signed change to a tracked metric, attributed to a block timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub timestamp: u64,
    pub value: I256,
}

impl Delta {
    pub fn new(timestamp: u64, value: I256) -> Self {
        Self { timestamp, value }
    }
}

/// Immutable series of deltas.
///
/// Construction sorts the input and precomputes cumulative sums, so the series can never be
/// queried unsorted and each lookup is a binary search. Deltas sharing a timestamp are summed.
#[derive(Debug, Clone, Default)]
pub struct TimeSeries {
    timestamps: Vec<u64>,
    cumulative: Vec<I256>,
}

impl TimeSeries {
    pub fn from_deltas(deltas: impl IntoIterator<Item = Delta>) -> Result<Self, RefundError> {
        let mut deltas: Vec<Delta> = deltas.into_iter().collect();
        deltas.sort_by_key(|d| d.timestamp);

        let mut timestamps = Vec::with_capacity(deltas.len());
        let mut cumulative = Vec::with_capacity(deltas.len());
        let mut running = I256::ZERO;
        for delta in deltas {
            running = running
                .checked_add(delta.value)
                .ok_or(RefundError::Arithmetic("cumulative delta overflow"))?;
            timestamps.push(delta.timestamp);
            cumulative.push(running);
        }

        Ok(Self { timestamps, cumulative })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Sum of all deltas with `timestamp <= at`.
    pub fn sum_until(&self, at: u64) -> I256 {
        let idx = self.timestamps.partition_point(|t| *t <= at);
        if idx == 0 {
            I256::ZERO
        } else {
            self.cumulative[idx - 1]
        }
    }

    /// `init + sum_until(at)`, failing if the result would be negative.
    pub fn reduce_at(&self, init: U256, at: u64) -> Result<U256, RefundError> {
        apply_delta(init, self.sum_until(at))
    }
}

/// Applies a signed delta to an absolute value.
pub fn apply_delta(init: U256, delta: I256) -> Result<U256, RefundError> {
    let init = I256::try_from(init)
        .map_err(|_| RefundError::Arithmetic("absolute value does not fit a signed integer"))?;
    let value = init
        .checked_add(delta)
        .ok_or(RefundError::Arithmetic("delta reduction"))?;
    if value.is_negative() {
        return Err(RefundError::invariant(format!(
            "reconstructed value is negative: {init} + {delta}"
        )));
    }
    Ok(value.into_raw())
}

/// Converts an unsigned event amount into a signed delta.
pub fn signed(amount: U256) -> Result<I256, RefundError> {
    I256::try_from(amount).map_err(|_| RefundError::Arithmetic("event amount exceeds i256"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(timestamp: u64, value: i64) -> Delta {
        Delta::new(timestamp, I256::try_from(value).unwrap())
    }

    #[test]
    fn test_unsorted_input_is_sorted_on_construction() {
        let series = TimeSeries::from_deltas(vec![d(30, 5), d(10, 1), d(20, -3)]).unwrap();

        assert_eq!(series.sum_until(9), I256::ZERO);
        assert_eq!(series.sum_until(10), I256::try_from(1).unwrap());
        assert_eq!(series.sum_until(25), I256::try_from(-2).unwrap());
        assert_eq!(series.sum_until(30), I256::try_from(3).unwrap());
        assert_eq!(series.sum_until(u64::MAX), I256::try_from(3).unwrap());
    }

    #[test]
    fn test_equal_timestamps_are_summed() {
        let series = TimeSeries::from_deltas(vec![d(10, 7), d(10, -2), d(10, 4)]).unwrap();
        assert_eq!(series.sum_until(10), I256::try_from(9).unwrap());
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn test_reduce_at_rejects_negative_balance() {
        let series = TimeSeries::from_deltas(vec![d(1, -11)]).unwrap();
        assert_eq!(series.reduce_at(U256::from(11), 1).unwrap(), U256::ZERO);
        assert!(matches!(series.reduce_at(U256::from(10), 1), Err(RefundError::Invariant(_))));
    }

    #[test]
    fn test_cumulative_overflow_is_arithmetic_error() {
        let deltas = vec![Delta::new(1, I256::MAX), Delta::new(2, I256::ONE)];
        assert!(matches!(TimeSeries::from_deltas(deltas), Err(RefundError::Arithmetic(_))));

        let deltas = vec![Delta::new(1, I256::MIN), Delta::new(2, I256::MINUS_ONE)];
        assert!(matches!(TimeSeries::from_deltas(deltas), Err(RefundError::Arithmetic(_))));
    }

    #[test]
    fn test_empty_series() {
        let series = TimeSeries::default();
        assert!(series.is_empty());
        assert_eq!(series.reduce_at(U256::from(42), u64::MAX).unwrap(), U256::from(42));
    }

    proptest! {
        #[test]
        fn prefix_sum_matches_naive_scan(
            raw in proptest::collection::vec((0u64..200, -1_000_000i64..1_000_000), 0..64),
            at in 0u64..220,
        ) {
            let deltas: Vec<Delta> = raw.iter().map(|(t, v)| d(*t, *v)).collect();
            let series = TimeSeries::from_deltas(deltas.clone()).unwrap();

            let naive: i64 = raw.iter().filter(|(t, _)| *t <= at).map(|(_, v)| *v).sum();
            prop_assert_eq!(series.sum_until(at), I256::try_from(naive).unwrap());
        }
    }
}
