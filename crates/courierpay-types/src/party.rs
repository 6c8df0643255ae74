//! Company and driver collaborator aggregates
//!
//! The engine increments balances and counters during settlement; it does
//! not own identity or onboarding for either party.

use crate::{CompanyId, DriverId, Money, Result};
use serde::{Deserialize, Serialize};

/// Running balance and lifetime earnings for a delivery company
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyAccount {
    pub id: CompanyId,
    pub balance: Money,
    pub total_earnings: Money,
}

impl CompanyAccount {
    pub fn new(id: CompanyId) -> Self {
        Self {
            id,
            balance: Money::zero(),
            total_earnings: Money::zero(),
        }
    }

    /// Credit settlement proceeds
    pub fn credit(&mut self, amount: Money) -> Result<()> {
        self.balance = self.balance.checked_add(amount)?;
        self.total_earnings = self.total_earnings.checked_add(amount)?;
        Ok(())
    }
}

/// Delivery and earnings counters for a driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    pub id: DriverId,
    pub completed_deliveries: u64,
    pub total_earnings: Money,
}

impl DriverRecord {
    pub fn new(id: DriverId) -> Self {
        Self {
            id,
            completed_deliveries: 0,
            total_earnings: Money::zero(),
        }
    }

    /// Record a settled delivery and any driver share
    pub fn record_delivery(&mut self, earnings: Money) -> Result<()> {
        self.completed_deliveries += 1;
        self.total_earnings = self.total_earnings.checked_add(earnings)?;
        Ok(())
    }
}
