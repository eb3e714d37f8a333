//! Exact USD amounts for the spending ledger.
//!
//! Every ledger quantity is a non-negative integer number of microdollars
//! (1/1,000,000 USD). No floating point is used anywhere in limit arithmetic;
//! decimal input is parsed with [`rust_decimal`] and truncated (never
//! rounded) to six fractional digits.
//!
//! Serialized as a stringified decimal to avoid loss of precision in JSON:
//! 1.5 USD becomes `"1.5"`, 100 USD becomes `"100"`.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Microdollars per whole dollar.
pub const MICROS_PER_USD: u64 = 1_000_000;

/// A non-negative USD amount with fixed 6-decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UsdAmount(u64);

#[derive(Debug, thiserror::Error)]
pub enum UsdAmountError {
    #[error("invalid USD amount format")]
    InvalidFormat,
    #[error("negative USD amount is not allowed")]
    Negative,
    #[error("USD amount out of range")]
    OutOfRange,
}

impl UsdAmount {
    pub const ZERO: UsdAmount = UsdAmount(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Whole dollars, exact only when the value has no fractional part.
    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars * MICROS_PER_USD)
    }

    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: UsdAmount) -> Option<UsdAmount> {
        self.0.checked_add(rhs.0).map(UsdAmount)
    }

    pub fn saturating_sub(self, rhs: UsdAmount) -> UsdAmount {
        UsdAmount(self.0.saturating_sub(rhs.0))
    }

    /// Truncates a decimal dollar value to microdollars.
    ///
    /// Fractional digits beyond the sixth are dropped, matching the
    /// truncate-not-round rule for oracle conversions.
    pub fn from_decimal(value: Decimal) -> Result<Self, UsdAmountError> {
        if value.is_sign_negative() {
            return Err(UsdAmountError::Negative);
        }
        let truncated = value.trunc_with_scale(6);
        let mantissa = truncated.mantissa().unsigned_abs();
        let scale = truncated.scale();
        // scale ≤ 6 after trunc_with_scale
        let micros = mantissa
            .checked_mul(10u128.pow(6 - scale))
            .ok_or(UsdAmountError::OutOfRange)?;
        u64::try_from(micros)
            .map(UsdAmount)
            .map_err(|_| UsdAmountError::OutOfRange)
    }

    /// Converts a token amount in smallest units to USD at a 1:1 dollar peg.
    ///
    /// This is the stablecoin fast path: `amount / 10^decimals` dollars,
    /// truncated to microdollars. For 6-decimal tokens the mapping is
    /// one-for-one with microdollars.
    pub fn from_pegged_units(amount: u128, decimals: u32) -> Result<Self, UsdAmountError> {
        let micros = if decimals >= 6 {
            amount / 10u128.pow(decimals - 6)
        } else {
            amount
                .checked_mul(10u128.pow(6 - decimals))
                .ok_or(UsdAmountError::OutOfRange)?
        };
        u64::try_from(micros)
            .map(UsdAmount)
            .map_err(|_| UsdAmountError::OutOfRange)
    }

    fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0 as i128, 6).normalize()
    }
}

impl FromStr for UsdAmount {
    type Err = UsdAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = Decimal::from_str(s).map_err(|_| UsdAmountError::InvalidFormat)?;
        Self::from_decimal(parsed)
    }
}

impl Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Serialize for UsdAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UsdAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        UsdAmount::from_str(&s).map_err(serde::de::Error::custom)
    }
}
