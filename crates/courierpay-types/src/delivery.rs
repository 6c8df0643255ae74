//! Delivery collaborator aggregate
//!
//! The engine does not own delivery lifecycle transitions; it reads the
//! status to gate settlement and writes back the payment-status mirror.

use crate::{CompanyId, CustomerId, DeliveryId, DriverId, PaymentState};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery lifecycle status (owned by the delivery service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Accepted,
    InTransit,
    Completed,
    Cancelled,
}

impl DeliveryStatus {
    /// The precondition gating settlement
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::InTransit => "in_transit",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Payment-status mirror written back onto the delivery by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMirror {
    Unpaid,
    Held,
    Released,
    Refunded,
    Disputed,
    Failed,
}

impl From<PaymentState> for PaymentMirror {
    fn from(state: PaymentState) -> Self {
        match state {
            PaymentState::Pending => Self::Unpaid,
            PaymentState::Held => Self::Held,
            PaymentState::Released => Self::Released,
            PaymentState::Refunded => Self::Refunded,
            PaymentState::Disputed => Self::Disputed,
            PaymentState::Failed => Self::Failed,
        }
    }
}

/// The slice of a delivery the payment engine consumes and updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub customer_id: CustomerId,
    pub driver_id: Option<DriverId>,
    pub company_id: Option<CompanyId>,
    pub status: DeliveryStatus,
    pub payment_status: PaymentMirror,
}

impl Delivery {
    pub fn new(id: DeliveryId, customer_id: CustomerId) -> Self {
        Self {
            id,
            customer_id,
            driver_id: None,
            company_id: None,
            status: DeliveryStatus::Accepted,
            payment_status: PaymentMirror::Unpaid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_gates_settlement() {
        assert!(DeliveryStatus::Completed.is_completed());
        assert!(!DeliveryStatus::InTransit.is_completed());
        assert!(!DeliveryStatus::Cancelled.is_completed());
    }

    #[test]
    fn mirror_tracks_state() {
        assert_eq!(PaymentMirror::from(PaymentState::Held), PaymentMirror::Held);
        assert_eq!(
            PaymentMirror::from(PaymentState::Pending),
            PaymentMirror::Unpaid
        );
    }
}
