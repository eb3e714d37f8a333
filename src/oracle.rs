//! USD valuation of token amounts.
//!
//! Known dollar-pegged stablecoins are valued in-core (`amount / 10^decimals`
//! dollars, truncated to microdollars) without touching the oracle. Anything
//! else goes through the [`PriceOracle`] capability; its conversions are
//! truncated, never rounded, before entering the ledger.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::usd::UsdAmount;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("price unavailable: {0}")]
    Unavailable(String),
    #[error("amount out of range")]
    OutOfRange,
}

/// External price source for non-stablecoin assets.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// USD value of `amount` smallest units of the token, truncated to
    /// microdollars.
    async fn token_value_usd(
        &self,
        chain_id: u64,
        token_address: &Address,
        amount: U256,
        decimals: u8,
    ) -> Result<UsdAmount, OracleError>;
}

/// Value a dollar-pegged amount without an external source.
pub fn pegged_usd_value(amount: U256, decimals: u8) -> Result<UsdAmount, OracleError> {
    let raw = u128::try_from(amount).map_err(|_| OracleError::OutOfRange)?;
    UsdAmount::from_pegged_units(raw, decimals as u32).map_err(|_| OracleError::OutOfRange)
}

/// Fixed-price oracle for tests: one token is worth a constant number of
/// microdollars.
pub struct FixedPriceOracle {
    micros_per_token: u128,
}

impl FixedPriceOracle {
    pub fn new(micros_per_token: u64) -> Self {
        Self {
            micros_per_token: micros_per_token as u128,
        }
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn token_value_usd(
        &self,
        _chain_id: u64,
        _token_address: &Address,
        amount: U256,
        decimals: u8,
    ) -> Result<UsdAmount, OracleError> {
        let raw = u128::try_from(amount).map_err(|_| OracleError::OutOfRange)?;
        let micros = raw
            .checked_mul(self.micros_per_token)
            .ok_or(OracleError::OutOfRange)?
            / 10u128.pow(decimals as u32);
        u64::try_from(micros)
            .map(UsdAmount::from_micros)
            .map_err(|_| OracleError::OutOfRange)
    }
}
