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

//! Contract bindings and the typed events decoded from their logs.

use alloy::{
    primitives::{Address, U256},
    rpc::types::Log,
    sol,
};

use crate::errors::RefundError;

sol! {
    /// ERC20 share token of the weighted pool. Mints and burns track the pool supply.
    #[sol(rpc)]
    interface IPoolShare {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function totalSupply() external view returns (uint256);
    }

    /// Subset of the pool vault used to reconstruct pool balances.
    #[sol(rpc)]
    interface IPoolVault {
        struct TokenInfo {
            uint8 tokenType;
            address rateProvider;
            bool paysYieldFees;
        }

        event LiquidityAdded(
            address indexed pool,
            address indexed liquidityProvider,
            uint8 indexed kind,
            uint256 totalSupply,
            uint256[] amountsAddedRaw,
            uint256[] swapFeeAmountsRaw
        );

        event LiquidityRemoved(
            address indexed pool,
            address indexed liquidityProvider,
            uint8 indexed kind,
            uint256 totalSupply,
            uint256[] amountsRemovedRaw,
            uint256[] swapFeeAmountsRaw
        );

        event Swap(
            address indexed pool,
            address indexed tokenIn,
            address indexed tokenOut,
            uint256 amountIn,
            uint256 amountOut,
            uint256 swapFeePercentage,
            uint256 swapFeeAmount
        );

        function getPoolTokenInfo(address pool)
            external
            view
            returns (
                address[] memory tokens,
                TokenInfo[] memory tokenInfo,
                uint256[] memory balancesRaw,
                uint256[] memory lastBalancesLiveScaled18
            );
    }

    /// Staking token that locks pool shares.
    interface ILockingToken {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// The independently loadable groups of pool events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventCategory {
    SupplyChanges,
    LiquidityChanges,
    Swaps,
}

impl PoolEventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEventCategory::SupplyChanges => "supply changes",
            PoolEventCategory::LiquidityChanges => "liquidity changes",
            PoolEventCategory::Swaps => "swaps",
        }
    }
}

/// Pool events with the token amounts in vault token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    SharesMinted { amount: U256 },
    SharesBurned { amount: U256 },
    LiquidityAdded { amounts: Vec<U256>, swap_fees: Vec<U256> },
    LiquidityRemoved { amounts: Vec<U256>, swap_fees: Vec<U256> },
    Swap {
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        amount_out: U256,
        swap_fee: Option<U256>,
    },
}

/// Transfer of the locking token between two accounts; the zero address marks mint or burn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTransfer {
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// A decoded event with its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent<E> {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub event: E,
}

impl<E> ChainEvent<E> {
    pub fn new(block_number: u64, transaction_index: u64, log_index: u64, event: E) -> Self {
        Self { block_number, transaction_index, log_index, event }
    }

    pub fn position(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }
}

fn position(log: &Log) -> Result<(u64, u64, u64), RefundError> {
    match (log.block_number, log.transaction_index, log.log_index) {
        (Some(block), Some(tx), Some(idx)) => Ok((block, tx, idx)),
        _ => Err(RefundError::invariant(format!(
            "log without position: tx {:?}",
            log.transaction_hash
        ))),
    }
}

fn decode_failed(what: &str, err: impl std::fmt::Display) -> RefundError {
    RefundError::invariant(format!("failed to decode {what} log: {err}"))
}

/// Decodes a pool log of the given category.
pub fn decode_pool_log(
    log: &Log,
    category: PoolEventCategory,
) -> Result<ChainEvent<PoolEvent>, RefundError> {
    let (block, tx, idx) = position(log)?;
    let event = match category {
        PoolEventCategory::SupplyChanges => {
            let decoded = log
                .log_decode::<IPoolShare::Transfer>()
                .map_err(|e| decode_failed("pool share transfer", e))?;
            let data = decoded.inner.data;
            if data.from == Address::ZERO {
                PoolEvent::SharesMinted { amount: data.value }
            } else if data.to == Address::ZERO {
                PoolEvent::SharesBurned { amount: data.value }
            } else {
                return Err(RefundError::invariant(format!(
                    "pool share transfer {:#x} -> {:#x} is neither a mint nor a burn",
                    data.from, data.to
                )));
            }
        }
        PoolEventCategory::LiquidityChanges => {
            if let Ok(decoded) = log.log_decode::<IPoolVault::LiquidityAdded>() {
                let data = decoded.inner.data;
                PoolEvent::LiquidityAdded {
                    amounts: data.amountsAddedRaw,
                    swap_fees: data.swapFeeAmountsRaw,
                }
            } else {
                let decoded = log
                    .log_decode::<IPoolVault::LiquidityRemoved>()
                    .map_err(|e| decode_failed("liquidity", e))?;
                let data = decoded.inner.data;
                PoolEvent::LiquidityRemoved {
                    amounts: data.amountsRemovedRaw,
                    swap_fees: data.swapFeeAmountsRaw,
                }
            }
        }
        PoolEventCategory::Swaps => {
            let decoded =
                log.log_decode::<IPoolVault::Swap>().map_err(|e| decode_failed("swap", e))?;
            let data = decoded.inner.data;
            PoolEvent::Swap {
                token_in: data.tokenIn,
                token_out: data.tokenOut,
                amount_in: data.amountIn,
                amount_out: data.amountOut,
                swap_fee: Some(data.swapFeeAmount),
            }
        }
    };
    Ok(ChainEvent::new(block, tx, idx, event))
}

pub fn decode_lock_log(log: &Log) -> Result<ChainEvent<LockTransfer>, RefundError> {
    let (block, tx, idx) = position(log)?;
    let decoded = log
        .log_decode::<ILockingToken::Transfer>()
        .map_err(|e| decode_failed("locking token transfer", e))?;
    let data = decoded.inner.data;
    Ok(ChainEvent::new(
        block,
        tx,
        idx,
        LockTransfer { from: data.from, to: data.to, value: data.value },
    ))
}
