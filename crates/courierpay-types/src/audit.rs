//! Append-only audit log types
//!
//! Every consequential action on a payment produces exactly one audit entry.
//! The action set is a closed tagged enum so consumers can exhaustively
//! handle every kind.

use crate::{Actor, Money, PaymentState, TransferId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Types of auditable payment actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Payment created in pending state
    Created { total_amount: Money },
    /// Processor confirmed the charge; funds are held
    ChargeHeld { confirmed_amount: Money },
    /// Processor reported the charge failed
    ChargeFailed { reason: String },
    /// Processor-confirmed amount differed from the requested amount;
    /// flagged for manual reconciliation, never auto-corrected
    ReconciliationAnomaly {
        expected: Money,
        confirmed: Money,
    },
    /// Split computed and funds released inside the settlement unit
    Settled {
        platform_fee: Money,
        company_amount: Money,
    },
    /// Processor-side transfer reference durably recorded
    TransferRecorded { transfer_id: TransferId },
    /// Funds returned to the customer
    Refunded { refund_id: Option<TransferId> },
    /// Dispute opened against a held payment
    DisputeOpened { reason: String },
    /// Evidence attached to an open dispute
    EvidenceAttached { evidence_kind: String },
    /// Dispute resolved with a terminal decision
    DisputeResolved { decision: String },
    /// A transition was attempted from a state that does not allow it;
    /// kept as a forensic trail for processor anomalies
    TransitionRejected {
        from: PaymentState,
        attempted: PaymentState,
    },
    /// An outbound transfer/refund call failed and will be retried
    ExternalCallFailed { operation: String, reason: String },
}

impl AuditEvent {
    /// Short tag for log lines and API payloads
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::ChargeHeld { .. } => "charge_held",
            Self::ChargeFailed { .. } => "charge_failed",
            Self::ReconciliationAnomaly { .. } => "reconciliation_anomaly",
            Self::Settled { .. } => "settled",
            Self::TransferRecorded { .. } => "transfer_recorded",
            Self::Refunded { .. } => "refunded",
            Self::DisputeOpened { .. } => "dispute_opened",
            Self::EvidenceAttached { .. } => "evidence_attached",
            Self::DisputeResolved { .. } => "dispute_resolved",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::ExternalCallFailed { .. } => "external_call_failed",
        }
    }
}

/// One entry in a payment's append-only audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: AuditEvent,
    pub actor: Actor,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(event: AuditEvent, actor: Actor) -> Self {
        Self {
            event,
            actor,
            at: Utc::now(),
        }
    }
}
