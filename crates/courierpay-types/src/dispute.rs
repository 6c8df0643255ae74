//! Dispute types
//!
//! A held payment can be frozen by a dispute and later resolved into
//! exactly one terminal outcome by an authorized actor.

use crate::{Actor, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dispute sub-record attached to a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub raised_by: Actor,
    pub reason: String,
    pub evidence: Vec<Evidence>,
    pub opened_at: DateTime<Utc>,
    pub resolution: Option<DisputeResolution>,
}

impl DisputeRecord {
    pub fn new(raised_by: Actor, reason: impl Into<String>) -> Self {
        Self {
            raised_by,
            reason: reason.into(),
            evidence: Vec::new(),
            opened_at: Utc::now(),
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// A piece of evidence submitted to an open dispute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub submitted_by: Actor,
    /// Free-form kind label ("photo", "chat_transcript", ...)
    pub kind: String,
    /// Content or a reference to externally stored content
    pub content: String,
    pub submitted_at: DateTime<Utc>,
}

/// Terminal decision for a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DisputeDecision {
    /// Return the full amount to the customer
    FullRefund,
    /// Release the full amount to the company
    FullRelease,
    /// Arbitrary split; the two parts must sum exactly to the payment total
    Split {
        customer_amount: Money,
        company_amount: Money,
    },
}

impl DisputeDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FullRefund => "full_refund",
            Self::FullRelease => "full_release",
            Self::Split { .. } => "split",
        }
    }
}

/// Recorded outcome of a resolved dispute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub decision: DisputeDecision,
    pub resolved_by: Actor,
    pub resolved_at: DateTime<Utc>,
}
