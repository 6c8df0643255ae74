//! The Payment ledger entity and its state machine
//!
//! A Payment is the ledger entry for one delivery's money flow. The state
//! machine here is declarative only; the ledger's `transition` method is the
//! single choke point that applies it.

use crate::{
    AuditEntry, CompanyId, Currency, CustomerId, DeliveryId, DisputeRecord, DriverId, FundSplit,
    Money, PaymentId, ProcessorRef, TransferId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a payment in the escrow lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Created, awaiting processor confirmation of the charge
    Pending,
    /// Funds held by the processor, awaiting delivery completion
    Held,
    /// Funds released to the company (terminal)
    Released,
    /// Funds returned to the customer (terminal)
    Refunded,
    /// Held funds frozen pending dispute resolution
    Disputed,
    /// Charge failed at the processor (terminal)
    Failed,
}

impl PaymentState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Failed)
    }

    /// The complete transition table. Any pair not listed here is illegal.
    ///
    /// ```text
    /// pending  -> held | failed
    /// held     -> released | refunded | disputed
    /// disputed -> released | refunded
    /// ```
    pub fn can_transition(from: PaymentState, to: PaymentState) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Held)
                | (Self::Pending, Self::Failed)
                | (Self::Held, Self::Released)
                | (Self::Held, Self::Refunded)
                | (Self::Held, Self::Disputed)
                | (Self::Disputed, Self::Released)
                | (Self::Disputed, Self::Refunded)
        )
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Held => "held",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// The ledger entry for one delivery's money flow.
///
/// Created when a customer initiates payment, mutated only through the
/// ledger, never deleted. Refund and failure are terminal states, not
/// deletions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    /// Processor-assigned reference; set once checkout is created
    pub processor_ref: Option<ProcessorRef>,
    pub delivery_id: DeliveryId,
    pub customer_id: CustomerId,
    /// Set progressively as the delivery is assigned
    pub driver_id: Option<DriverId>,
    pub company_id: Option<CompanyId>,
    pub currency: Currency,
    pub total_amount: Money,
    /// Computed by the split calculator; immutable afterwards except through
    /// dispute resolution
    pub split: Option<FundSplit>,
    pub state: PaymentState,
    /// Reason stored verbatim from the processor on a failed charge
    pub failure_reason: Option<String>,
    /// Stamped inside the atomic settlement unit
    pub settled_at: Option<DateTime<Utc>>,
    /// Processor-side transfer reference. A `Released` payment with no
    /// transfer id is released-pending-transfer and safe to re-drive.
    pub transfer_id: Option<TransferId>,
    /// Processor-side refund reference (post-refund or dispute split)
    pub refund_id: Option<TransferId>,
    pub dispute: Option<DisputeRecord>,
    /// Append-only, ordered; every transition appends exactly one entry
    pub audit_log: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// True once the settlement orchestrator has fully completed, i.e. the
    /// transfer id is durably recorded
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some() && self.transfer_id.is_some()
    }

    /// Released but the external transfer has not been recorded yet
    pub fn is_pending_transfer(&self) -> bool {
        self.state == PaymentState::Released && self.transfer_id.is_none()
    }
}
