//! Money in integer minor currency units
//!
//! All amounts are carried as i64 minor units (cents, kobo, ...) to avoid
//! floating-point drift in the ledger. Arithmetic is checked; overflow is an
//! explicit error, never a wrap.

use crate::{CourierPayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An amount in minor currency units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Money(pub i64);

impl Money {
    /// Create an amount from minor units
    pub fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Create an amount from whole major units (e.g. dollars), for tests
    /// and fixtures
    pub fn from_major(major: i64) -> Self {
        Self(major * 100)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn minor(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Checked addition
    pub fn checked_add(self, other: Self) -> Result<Self> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(CourierPayError::AmountOverflow)
    }

    /// Checked subtraction
    pub fn checked_sub(self, other: Self) -> Result<Self> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(CourierPayError::AmountOverflow)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// ISO-4217 style currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(pub String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The computed division of a payment's total.
///
/// Invariant: `platform_fee + company_amount == total` of the payment this
/// split was computed for. `driver_amount` is informational when a driver
/// compensation policy is active; it is not an independent ledger leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundSplit {
    pub platform_fee: Money,
    pub company_amount: Money,
    pub driver_amount: Option<Money>,
}

impl FundSplit {
    /// Verify the split sums exactly to the given total
    pub fn sums_to(&self, total: Money) -> bool {
        self.platform_fee
            .checked_add(self.company_amount)
            .map(|sum| sum == total)
            .unwrap_or(false)
    }
}
