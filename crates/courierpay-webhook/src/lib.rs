//! CourierPay Webhook Ingestor
//!
//! Accepts inbound processor events, verifies authenticity, deduplicates,
//! and maps them to state-machine transitions. Processors redeliver events,
//! so every path through here must be idempotent:
//!
//! - signature check first; a failure mutates nothing and leaks nothing
//! - a replayed event id short-circuits before touching the ledger
//! - an event whose outcome the ledger already reflects (e.g. `held` for a
//!   second "charge succeeded") is acknowledged as a duplicate
//! - an event the state machine cannot apply (out-of-order delivery) is
//!   discarded, never applied blindly

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use courierpay_gateway::{signature, ChargeOutcome};
use courierpay_ledger::EscrowLedger;
use courierpay_types::{
    CourierPayError, Currency, Money, Payment, PaymentState, ProcessorRef, Result,
};

/// Wire shape of a processor event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorEvent {
    /// Processor-unique event id (distinct from the charge reference)
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub reference: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// What ingestion did with an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// A state transition was applied
    Applied {
        payment_id: String,
        new_state: PaymentState,
    },
    /// Redelivery of an event whose effect the ledger already reflects
    Duplicate,
    /// Recognized payload, but the event type carries no state change
    Ignored { event_type: String },
}

/// Upper bound on the in-process event-id cache. Past it the cache resets
/// and replays of evicted ids fall through to the ledger's state-outcome
/// check, which remains the durable dedup layer.
const DEFAULT_SEEN_EVENTS_CAP: usize = 100_000;

/// The webhook ingestion layer
pub struct WebhookIngestor {
    ledger: EscrowLedger,
    secret: String,
    /// Event ids already processed in this process lifetime, bounded by
    /// `seen_events_cap`
    seen_events: DashSet<String>,
    seen_events_cap: usize,
}

impl WebhookIngestor {
    pub fn new(ledger: EscrowLedger, secret: impl Into<String>) -> Self {
        Self {
            ledger,
            secret: secret.into(),
            seen_events: DashSet::new(),
            seen_events_cap: DEFAULT_SEEN_EVENTS_CAP,
        }
    }

    pub fn with_seen_events_cap(mut self, cap: usize) -> Self {
        self.seen_events_cap = cap.max(1);
        self
    }

    /// Process one raw webhook delivery. Returns only after the effect (if
    /// any) is durably recorded, so an acknowledgement always implies
    /// durability.
    pub async fn ingest(&self, payload: &[u8], signature_header: &str) -> Result<IngestOutcome> {
        // Authenticity before anything else; the error carries no hint of
        // whether the reference exists.
        signature::verify(payload, signature_header, &self.secret)?;

        let event: ProcessorEvent = serde_json::from_slice(payload).map_err(|e| {
            CourierPayError::validation("payload", format!("malformed event: {}", e))
        })?;

        if self.seen_events.contains(&event.id) {
            info!(event_id = %event.id, "Replayed event id, skipping");
            return Ok(IngestOutcome::Duplicate);
        }

        let outcome = match event.event_type.as_str() {
            "charge.succeeded" => {
                let amount = event.data.amount.ok_or_else(|| {
                    CourierPayError::validation("amount", "missing on charge.succeeded")
                })?;
                let currency = event
                    .data
                    .currency
                    .clone()
                    .map(Currency::new)
                    .unwrap_or_else(Currency::usd);
                self.apply_charge_outcome(
                    &ProcessorRef::new(event.data.reference.clone()),
                    ChargeOutcome::Succeeded {
                        amount: Money::from_minor(amount),
                        currency,
                    },
                )
                .await?
            }
            "charge.failed" => {
                let reason = event
                    .data
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unspecified".to_string());
                self.apply_charge_outcome(
                    &ProcessorRef::new(event.data.reference.clone()),
                    ChargeOutcome::Failed { reason },
                )
                .await?
            }
            other => {
                // Acknowledge so the processor stops retrying; no mutation.
                info!(event_type = other, "Unrecognized event type acknowledged");
                IngestOutcome::Ignored {
                    event_type: other.to_string(),
                }
            }
        };

        if self.seen_events.len() >= self.seen_events_cap {
            info!(cap = self.seen_events_cap, "Event id cache full, resetting");
            self.seen_events.clear();
        }
        self.seen_events.insert(event.id);
        Ok(outcome)
    }

    /// Map a charge outcome onto the ledger. Shared by the webhook path and
    /// the verification polling path so the two cannot diverge.
    pub async fn apply_charge_outcome(
        &self,
        reference: &ProcessorRef,
        outcome: ChargeOutcome,
    ) -> Result<IngestOutcome> {
        let payment = self.ledger.payment_by_reference(reference).await?;

        match outcome {
            ChargeOutcome::Succeeded { amount, .. } => {
                if let Some(duplicate) = already_reflects(&payment, PaymentState::Held) {
                    return Ok(duplicate);
                }
                let updated = self.ledger.record_charge_held(&payment.id, amount).await?;
                Ok(IngestOutcome::Applied {
                    payment_id: updated.id.to_string(),
                    new_state: updated.state,
                })
            }
            ChargeOutcome::Failed { reason } => {
                if let Some(duplicate) = already_reflects(&payment, PaymentState::Failed) {
                    return Ok(duplicate);
                }
                let updated = self
                    .ledger
                    .record_charge_failed(&payment.id, reason)
                    .await?;
                Ok(IngestOutcome::Applied {
                    payment_id: updated.id.to_string(),
                    new_state: updated.state,
                })
            }
            ChargeOutcome::Pending => Ok(IngestOutcome::Ignored {
                event_type: "charge.pending".to_string(),
            }),
        }
    }
}

/// Idempotency and ordering guard: if the payment already reflects (or has
/// moved past) the event's outcome, the event is a duplicate or arrived out
/// of order and is discarded without mutation.
fn already_reflects(payment: &Payment, target: PaymentState) -> Option<IngestOutcome> {
    if payment.state == target {
        info!(payment_id = %payment.id, state = %payment.state,
              "Event outcome already reflected, no-op");
        return Some(IngestOutcome::Duplicate);
    }
    if payment.state != PaymentState::Pending {
        // e.g. a stale "failed" arriving after the charge was held and the
        // payment has moved on; the source-state check makes it inert.
        warn!(payment_id = %payment.id, state = %payment.state, attempted = %target,
              "Out-of-order event discarded");
        return Some(IngestOutcome::Duplicate);
    }
    None
}
