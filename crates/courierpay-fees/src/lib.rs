//! CourierPay Fee Engine
//!
//! Pure split calculation: given a payment total and a fee policy, compute
//! the platform fee and the company share. The company share is derived by
//! subtraction rather than rounded independently, so the two parts always
//! sum exactly to the total.

use courierpay_types::{CourierPayError, FundSplit, Money, Result};
use serde::{Deserialize, Serialize};

/// Driver compensation policy, configurable per payment method.
///
/// The escrow flow defaults to `None`: the driver is settled through the
/// company's payroll, so the ledger invariant stays a two-way split. Cash
/// collection flows may hand the driver the full amount or a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverCompensation {
    #[default]
    None,
    /// Driver keeps the full collected amount (cash on delivery)
    FullAmount,
    /// Driver receives this percentage of the company share
    Percent(u8),
}

/// Fee policy applied when computing a split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Platform fee percentage, 0..=100
    pub platform_fee_percent: u8,
    pub driver_policy: DriverCompensation,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            platform_fee_percent: 10,
            driver_policy: DriverCompensation::None,
        }
    }
}

impl FeePolicy {
    pub fn with_fee_percent(percent: u8) -> Self {
        Self {
            platform_fee_percent: percent,
            ..Self::default()
        }
    }
}

/// Compute the fund split for a payment total.
///
/// `platform_fee = round(total * pct / 100)` with half-up rounding;
/// `company_amount = total - platform_fee`. Pure and deterministic.
pub fn compute_split(total: Money, policy: &FeePolicy) -> Result<FundSplit> {
    if !total.is_positive() {
        return Err(CourierPayError::validation(
            "total_amount",
            "must be a positive amount in minor units",
        ));
    }
    if policy.platform_fee_percent > 100 {
        return Err(CourierPayError::validation(
            "platform_fee_percent",
            "must be between 0 and 100",
        ));
    }

    let pct = policy.platform_fee_percent as i64;
    // Half-up rounding in integer space: (n * pct + 50) / 100
    let platform_fee = total
        .minor()
        .checked_mul(pct)
        .and_then(|scaled| scaled.checked_add(50))
        .map(|scaled| scaled / 100)
        .ok_or(CourierPayError::AmountOverflow)?;
    let platform_fee = Money::from_minor(platform_fee);
    let company_amount = total.checked_sub(platform_fee)?;

    let driver_amount = match policy.driver_policy {
        DriverCompensation::None => None,
        DriverCompensation::FullAmount => Some(total),
        DriverCompensation::Percent(p) => {
            if p > 100 {
                return Err(CourierPayError::validation(
                    "driver_percent",
                    "must be between 0 and 100",
                ));
            }
            let share = company_amount
                .minor()
                .checked_mul(p as i64)
                .and_then(|scaled| scaled.checked_add(50))
                .map(|scaled| scaled / 100)
                .ok_or(CourierPayError::AmountOverflow)?;
            Some(Money::from_minor(share))
        }
    };

    Ok(FundSplit {
        platform_fee,
        company_amount,
        driver_amount,
    })
}
