//! CourierPay Ledger - the durable record of escrowed payments
//!
//! The ledger is:
//! - Payment-keyed, with a processor-reference index for webhook lookups
//! - The single choke point for state transitions (no other component
//!   writes the `state` field)
//! - Compare-and-swap guarded: every transition names the state it expects,
//!   so a losing concurrent writer observes `StateConflict` instead of
//!   corrupting state
//! - Atomic across aggregates: payments, deliveries, company accounts and
//!   driver records live under one write lock, so the settlement unit
//!   (split + release + balance + counters) commits as a whole or not at all
//!
//! # Invariants
//!
//! 1. One payment per delivery
//! 2. Every transition appends exactly one audit entry
//! 3. A payment is released or refunded at most once
//! 4. Audit entries are never mutated or reordered

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use courierpay_types::{
    Actor, AuditEntry, AuditEvent, CompanyAccount, CompanyId, CourierPayError, Currency,
    CustomerId, Delivery, DeliveryId, DisputeRecord, DriverId, DriverRecord, FundSplit, Money,
    Payment, PaymentId, PaymentMirror, PaymentState, ProcessorRef, Result, TransferId,
};

/// Everything the engine persists, guarded by one lock so cross-aggregate
/// commits cannot be observed half-written.
#[derive(Default)]
struct LedgerState {
    payments: HashMap<PaymentId, Payment>,
    by_reference: HashMap<ProcessorRef, PaymentId>,
    by_delivery: HashMap<DeliveryId, PaymentId>,
    deliveries: HashMap<DeliveryId, Delivery>,
    companies: HashMap<CompanyId, CompanyAccount>,
    drivers: HashMap<DriverId, DriverRecord>,
}

/// The escrow payment ledger.
///
/// Thread-safe and cloneable; clones share the same underlying state.
#[derive(Clone, Default)]
pub struct EscrowLedger {
    state: Arc<RwLock<LedgerState>>,
}

/// Parameters for creating a payment
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub delivery_id: DeliveryId,
    pub customer_id: CustomerId,
    pub currency: Currency,
    pub total_amount: Money,
}

impl EscrowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Collaborator aggregates
    // ========================================================================

    /// Register a delivery slice for the engine to consume. In production
    /// this mirrors the delivery service's records.
    pub async fn upsert_delivery(&self, delivery: Delivery) {
        let mut state = self.state.write().await;
        state.deliveries.insert(delivery.id.clone(), delivery);
    }

    /// Owned by the delivery service: advance the delivery's own status.
    pub async fn set_delivery_status(
        &self,
        delivery_id: &DeliveryId,
        status: courierpay_types::DeliveryStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let delivery =
            state
                .deliveries
                .get_mut(delivery_id)
                .ok_or_else(|| CourierPayError::DeliveryNotFound {
                    delivery_id: delivery_id.to_string(),
                })?;
        delivery.status = status;
        Ok(())
    }

    pub async fn delivery(&self, delivery_id: &DeliveryId) -> Result<Delivery> {
        let state = self.state.read().await;
        state
            .deliveries
            .get(delivery_id)
            .cloned()
            .ok_or_else(|| CourierPayError::DeliveryNotFound {
                delivery_id: delivery_id.to_string(),
            })
    }

    pub async fn company_account(&self, company_id: &CompanyId) -> Option<CompanyAccount> {
        self.state.read().await.companies.get(company_id).cloned()
    }

    pub async fn driver_record(&self, driver_id: &DriverId) -> Option<DriverRecord> {
        self.state.read().await.drivers.get(driver_id).cloned()
    }

    // ========================================================================
    // Payment lifecycle
    // ========================================================================

    /// Create a pending payment for a delivery (1:1; a second payment for
    /// the same delivery is rejected).
    pub async fn create_payment(&self, new: NewPayment, actor: Actor) -> Result<Payment> {
        if !new.total_amount.is_positive() {
            return Err(CourierPayError::validation(
                "total_amount",
                "must be a positive amount in minor units",
            ));
        }

        let mut state = self.state.write().await;
        if state.by_delivery.contains_key(&new.delivery_id) {
            return Err(CourierPayError::DuplicateDeliveryPayment {
                delivery_id: new.delivery_id.to_string(),
            });
        }
        let delivery = state.deliveries.get(&new.delivery_id).cloned().ok_or_else(|| {
            CourierPayError::DeliveryNotFound {
                delivery_id: new.delivery_id.to_string(),
            }
        })?;

        let now = Utc::now();
        let payment = Payment {
            id: PaymentId::new(),
            processor_ref: None,
            delivery_id: new.delivery_id.clone(),
            customer_id: new.customer_id,
            driver_id: delivery.driver_id.clone(),
            company_id: delivery.company_id.clone(),
            currency: new.currency,
            total_amount: new.total_amount,
            split: None,
            state: PaymentState::Pending,
            failure_reason: None,
            settled_at: None,
            transfer_id: None,
            refund_id: None,
            dispute: None,
            audit_log: vec![AuditEntry::new(
                AuditEvent::Created {
                    total_amount: new.total_amount,
                },
                actor,
            )],
            created_at: now,
            updated_at: now,
        };

        state
            .by_delivery
            .insert(new.delivery_id, payment.id.clone());
        state.payments.insert(payment.id.clone(), payment.clone());
        info!(payment_id = %payment.id, amount = %payment.total_amount, "Payment created");
        Ok(payment)
    }

    /// Persist the processor-assigned reference. Must happen before the
    /// customer is redirected to checkout.
    pub async fn attach_processor_ref(
        &self,
        payment_id: &PaymentId,
        reference: ProcessorRef,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.by_reference.get(&reference) {
            if existing != payment_id {
                return Err(CourierPayError::DuplicateReference {
                    reference: reference.to_string(),
                });
            }
        }
        let payment = get_payment_mut(&mut state.payments, payment_id)?;
        payment.processor_ref = Some(reference.clone());
        payment.updated_at = Utc::now();
        let snapshot = payment.clone();
        state.by_reference.insert(reference, payment_id.clone());
        Ok(snapshot)
    }

    pub async fn payment(&self, payment_id: &PaymentId) -> Result<Payment> {
        let state = self.state.read().await;
        state
            .payments
            .get(payment_id)
            .cloned()
            .ok_or_else(|| CourierPayError::PaymentNotFound {
                payment_id: payment_id.to_string(),
            })
    }

    pub async fn payment_by_reference(&self, reference: &ProcessorRef) -> Result<Payment> {
        let state = self.state.read().await;
        state
            .by_reference
            .get(reference)
            .and_then(|id| state.payments.get(id))
            .cloned()
            .ok_or_else(|| CourierPayError::PaymentNotFound {
                payment_id: reference.to_string(),
            })
    }

    // ========================================================================
    // State machine choke point
    // ========================================================================

    /// Apply one state transition as a conditional write.
    ///
    /// The transition must be listed in the state machine AND the payment's
    /// current state must equal `expected` (compare-and-swap). Exactly one
    /// audit entry is appended, and the delivery payment-status mirror is
    /// synchronized in the same commit.
    pub async fn transition(
        &self,
        payment_id: &PaymentId,
        expected: PaymentState,
        to: PaymentState,
        actor: Actor,
        event: AuditEvent,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;

        cas(payment, expected, to, &actor)?;
        payment.audit_log.push(AuditEntry::new(event, actor));
        let snapshot = payment.clone();
        let delivery_id = snapshot.delivery_id.clone();

        if let Some(delivery) = state.deliveries.get_mut(&delivery_id) {
            delivery.payment_status = PaymentMirror::from(to);
        }

        info!(payment_id = %payment_id, from = %expected, to = %to, "Payment transitioned");
        Ok(snapshot)
    }

    // ========================================================================
    // Webhook-side mutations
    // ========================================================================

    /// Record the processor-confirmed hold: pending -> held, storing the
    /// confirmed amount. A confirmed amount differing from the requested one
    /// appends a reconciliation anomaly entry in the same commit.
    pub async fn record_charge_held(
        &self,
        payment_id: &PaymentId,
        confirmed_amount: Money,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;

        cas(
            payment,
            PaymentState::Pending,
            PaymentState::Held,
            &Actor::System,
        )?;

        let expected_amount = payment.total_amount;
        if confirmed_amount != expected_amount {
            warn!(payment_id = %payment_id, expected = %expected_amount,
                  confirmed = %confirmed_amount,
                  "Processor-confirmed amount differs from requested; flagged for reconciliation");
            payment.audit_log.push(AuditEntry::new(
                AuditEvent::ReconciliationAnomaly {
                    expected: expected_amount,
                    confirmed: confirmed_amount,
                },
                Actor::System,
            ));
            // Record what the processor actually captured, not what was asked.
            payment.total_amount = confirmed_amount;
        }

        payment.audit_log.push(AuditEntry::new(
            AuditEvent::ChargeHeld {
                confirmed_amount,
            },
            Actor::System,
        ));
        let snapshot = payment.clone();
        let delivery_id = snapshot.delivery_id.clone();
        if let Some(delivery) = state.deliveries.get_mut(&delivery_id) {
            delivery.payment_status = PaymentMirror::Held;
        }
        info!(payment_id = %payment_id, amount = %confirmed_amount, "Charge held in escrow");
        Ok(snapshot)
    }

    /// Record a failed charge: pending -> failed, reason stored verbatim.
    pub async fn record_charge_failed(
        &self,
        payment_id: &PaymentId,
        reason: String,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;

        cas(
            payment,
            PaymentState::Pending,
            PaymentState::Failed,
            &Actor::System,
        )?;
        payment.failure_reason = Some(reason.clone());
        payment
            .audit_log
            .push(AuditEntry::new(AuditEvent::ChargeFailed { reason }, Actor::System));
        let snapshot = payment.clone();
        let delivery_id = snapshot.delivery_id.clone();
        if let Some(delivery) = state.deliveries.get_mut(&delivery_id) {
            delivery.payment_status = PaymentMirror::Failed;
        }
        Ok(snapshot)
    }

    // ========================================================================
    // Settlement unit
    // ========================================================================

    /// The atomic settlement commit: under a single write guard, verify the
    /// held state, write the split, release, stamp `settled_at`, credit the
    /// company balance and bump the driver counters. The processor transfer
    /// happens outside; its id is recorded by [`record_transfer`].
    ///
    /// Idempotent: a payment already released returns its current snapshot
    /// with `already_settled = true` and mutates nothing.
    ///
    /// [`record_transfer`]: EscrowLedger::record_transfer
    pub async fn apply_settlement(
        &self,
        payment_id: &PaymentId,
        split: FundSplit,
        actor: Actor,
    ) -> Result<(Payment, bool)> {
        let mut state = self.state.write().await;

        let payment = get_payment_mut(&mut state.payments, payment_id)?;

        // Re-entry (webhook replay, retried settle call) is a no-op, but
        // only when the payment actually ended up released. A refunded
        // dispute resolution also stamps `settled_at`; settling it would be
        // a second payout, so fall through and let the CAS reject it.
        if payment.settled_at.is_some() && payment.state == PaymentState::Released {
            return Ok((payment.clone(), true));
        }

        // Validation before any mutation
        if !split.sums_to(payment.total_amount) {
            return Err(CourierPayError::validation(
                "split",
                "platform fee and company amount must sum to the payment total",
            ));
        }

        cas(payment, PaymentState::Held, PaymentState::Released, &actor)?;
        payment.split = Some(split);
        payment.settled_at = Some(Utc::now());
        payment.audit_log.push(AuditEntry::new(
            AuditEvent::Settled {
                platform_fee: split.platform_fee,
                company_amount: split.company_amount,
            },
            actor,
        ));
        let snapshot = payment.clone();

        if let Some(delivery) = state.deliveries.get_mut(&snapshot.delivery_id) {
            delivery.payment_status = PaymentMirror::Released;
        }
        if let Some(company_id) = snapshot.company_id.clone() {
            let account = state
                .companies
                .entry(company_id.clone())
                .or_insert_with(|| CompanyAccount::new(company_id));
            account.credit(split.company_amount)?;
        }
        if let Some(driver_id) = snapshot.driver_id.clone() {
            let record = state
                .drivers
                .entry(driver_id.clone())
                .or_insert_with(|| DriverRecord::new(driver_id));
            record.record_delivery(split.driver_amount.unwrap_or_else(Money::zero))?;
        }

        info!(payment_id = %payment_id, fee = %split.platform_fee,
              company = %split.company_amount, "Settlement applied");
        Ok((snapshot, false))
    }

    /// Durably record the processor-side transfer reference after the
    /// external call succeeds. Idempotent for the same transfer id.
    pub async fn record_transfer(
        &self,
        payment_id: &PaymentId,
        transfer_id: TransferId,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;

        if let Some(existing) = &payment.transfer_id {
            if *existing == transfer_id {
                return Ok(payment.clone());
            }
            return Err(CourierPayError::internal(format!(
                "payment {} already has transfer {}, refusing to overwrite with {}",
                payment_id, existing, transfer_id
            )));
        }

        payment.transfer_id = Some(transfer_id.clone());
        payment.updated_at = Utc::now();
        payment.audit_log.push(AuditEntry::new(
            AuditEvent::TransferRecorded { transfer_id },
            Actor::System,
        ));
        Ok(payment.clone())
    }

    /// Record the processor-side refund reference.
    pub async fn record_refund(
        &self,
        payment_id: &PaymentId,
        refund_id: TransferId,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;
        if payment.refund_id.is_none() {
            payment.refund_id = Some(refund_id);
            payment.updated_at = Utc::now();
        }
        Ok(payment.clone())
    }

    /// Append a forensic audit entry outside a transition (external call
    /// failures, evidence, resolution details).
    pub async fn append_audit(
        &self,
        payment_id: &PaymentId,
        event: AuditEvent,
        actor: Actor,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;
        payment.audit_log.push(AuditEntry::new(event, actor));
        Ok(())
    }

    // ========================================================================
    // Dispute-side mutations
    // ========================================================================

    /// Attach a dispute record in the same commit as the held -> disputed
    /// transition.
    pub async fn open_dispute(
        &self,
        payment_id: &PaymentId,
        record: DisputeRecord,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;

        cas(
            payment,
            PaymentState::Held,
            PaymentState::Disputed,
            &record.raised_by,
        )?;
        payment.audit_log.push(AuditEntry::new(
            AuditEvent::DisputeOpened {
                reason: record.reason.clone(),
            },
            record.raised_by.clone(),
        ));
        payment.dispute = Some(record);
        let snapshot = payment.clone();
        let delivery_id = snapshot.delivery_id.clone();
        if let Some(delivery) = state.deliveries.get_mut(&delivery_id) {
            delivery.payment_status = PaymentMirror::Disputed;
        }
        Ok(snapshot)
    }

    /// Mutate the open dispute record (evidence, resolution) under the
    /// ledger lock. The closure sees the record only while the payment is
    /// actually disputed or already carries a dispute.
    pub async fn with_dispute_mut<F>(&self, payment_id: &PaymentId, f: F) -> Result<Payment>
    where
        F: FnOnce(&mut DisputeRecord) -> Result<Option<AuditEntry>>,
    {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;
        let dispute = payment
            .dispute
            .as_mut()
            .ok_or_else(|| CourierPayError::DisputeNotFound {
                payment_id: payment_id.to_string(),
            })?;
        if let Some(entry) = f(dispute)? {
            payment.audit_log.push(entry);
        }
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    /// Resolution commit: disputed -> released/refunded with the resolution
    /// recorded, the mirror synced, and (on release) the company credited
    /// with its share — all under one write guard.
    pub async fn apply_resolution(
        &self,
        payment_id: &PaymentId,
        to: PaymentState,
        resolution: courierpay_types::DisputeResolution,
        company_share: Option<Money>,
    ) -> Result<Payment> {
        let mut state = self.state.write().await;
        let payment = get_payment_mut(&mut state.payments, payment_id)?;

        if payment.dispute.is_none() {
            return Err(CourierPayError::DisputeNotFound {
                payment_id: payment_id.to_string(),
            });
        }

        let actor = resolution.resolved_by.clone();
        let decision_label = resolution.decision.label().to_string();
        cas(payment, PaymentState::Disputed, to, &actor)?;
        if let Some(dispute) = payment.dispute.as_mut() {
            dispute.resolution = Some(resolution);
        }
        payment.settled_at = Some(Utc::now());
        payment.audit_log.push(AuditEntry::new(
            AuditEvent::DisputeResolved {
                decision: decision_label,
            },
            actor,
        ));
        let snapshot = payment.clone();
        let delivery_id = snapshot.delivery_id.clone();

        if let Some(delivery) = state.deliveries.get_mut(&delivery_id) {
            delivery.payment_status = PaymentMirror::from(to);
        }
        if let (Some(company_id), Some(share)) = (snapshot.company_id.clone(), company_share) {
            let account = state
                .companies
                .entry(company_id.clone())
                .or_insert_with(|| CompanyAccount::new(company_id));
            account.credit(share)?;
        }

        info!(payment_id = %payment_id, to = %to, "Dispute resolution applied");
        Ok(snapshot)
    }
}

/// The single state-writing primitive: compare-and-swap against the caller's
/// expected state, reject transitions the state machine does not list (with a
/// forensic audit entry), then write the new state. Every mutator above runs
/// this under the same write guard as its other effects.
fn cas(payment: &mut Payment, expected: PaymentState, to: PaymentState, actor: &Actor) -> Result<()> {
    if payment.state != expected {
        return Err(CourierPayError::StateConflict {
            payment_id: payment.id.to_string(),
            expected,
            found: payment.state,
        });
    }
    if !PaymentState::can_transition(payment.state, to) {
        warn!(payment_id = %payment.id, from = %payment.state, attempted = %to,
              "Illegal transition rejected");
        payment.audit_log.push(AuditEntry::new(
            AuditEvent::TransitionRejected {
                from: payment.state,
                attempted: to,
            },
            actor.clone(),
        ));
        return Err(CourierPayError::IllegalTransition {
            payment_id: payment.id.to_string(),
            from: payment.state,
            attempted: to,
        });
    }
    payment.state = to;
    payment.updated_at = Utc::now();
    Ok(())
}

fn get_payment_mut<'a>(
    payments: &'a mut HashMap<PaymentId, Payment>,
    payment_id: &PaymentId,
) -> Result<&'a mut Payment> {
    payments
        .get_mut(payment_id)
        .ok_or_else(|| CourierPayError::PaymentNotFound {
            payment_id: payment_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courierpay_types::DeliveryStatus;

    async fn seeded_ledger() -> (EscrowLedger, Payment) {
        let ledger = EscrowLedger::new();
        let delivery_id = DeliveryId::new();
        let customer_id = CustomerId::new();
        let mut delivery = Delivery::new(delivery_id.clone(), customer_id.clone());
        delivery.company_id = Some(CompanyId::new());
        delivery.driver_id = Some(DriverId::new());
        ledger.upsert_delivery(delivery).await;

        let payment = ledger
            .create_payment(
                NewPayment {
                    delivery_id,
                    customer_id,
                    currency: Currency::usd(),
                    total_amount: Money::from_minor(10_000),
                },
                Actor::System,
            )
            .await
            .unwrap();
        (ledger, payment)
    }

    fn split_10k() -> FundSplit {
        FundSplit {
            platform_fee: Money::from_minor(1_000),
            company_amount: Money::from_minor(9_000),
            driver_amount: None,
        }
    }

    #[tokio::test]
    async fn create_payment_is_one_per_delivery() {
        let (ledger, payment) = seeded_ledger().await;
        let dup = ledger
            .create_payment(
                NewPayment {
                    delivery_id: payment.delivery_id.clone(),
                    customer_id: payment.customer_id.clone(),
                    currency: Currency::usd(),
                    total_amount: Money::from_minor(5_000),
                },
                Actor::System,
            )
            .await;
        assert!(matches!(
            dup,
            Err(CourierPayError::DuplicateDeliveryPayment { .. })
        ));
    }

    #[tokio::test]
    async fn charge_held_syncs_delivery_mirror() {
        let (ledger, payment) = seeded_ledger().await;
        let held = ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();
        assert_eq!(held.state, PaymentState::Held);

        let delivery = ledger.delivery(&payment.delivery_id).await.unwrap();
        assert_eq!(delivery.payment_status, PaymentMirror::Held);
        // Exactly one held entry after the created entry
        assert_eq!(held.audit_log.len(), 2);
    }

    #[tokio::test]
    async fn amount_mismatch_flags_anomaly_and_keeps_confirmed() {
        let (ledger, payment) = seeded_ledger().await;
        let held = ledger
            .record_charge_held(&payment.id, Money::from_minor(9_950))
            .await
            .unwrap();
        assert_eq!(held.total_amount, Money::from_minor(9_950));
        assert!(held
            .audit_log
            .iter()
            .any(|e| matches!(e.event, AuditEvent::ReconciliationAnomaly { .. })));
    }

    #[tokio::test]
    async fn transition_cas_rejects_stale_expectation() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();

        // Expecting Pending when the payment is already Held loses the CAS
        let result = ledger
            .transition(
                &payment.id,
                PaymentState::Pending,
                PaymentState::Failed,
                Actor::System,
                AuditEvent::ChargeFailed {
                    reason: "late".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(CourierPayError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn illegal_transition_leaves_forensic_entry() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();

        let result = ledger
            .transition(
                &payment.id,
                PaymentState::Held,
                PaymentState::Failed,
                Actor::System,
                AuditEvent::ChargeFailed {
                    reason: "out of order".into(),
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(CourierPayError::IllegalTransition { .. })
        ));

        let payment = ledger.payment(&payment.id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Held);
        assert!(payment
            .audit_log
            .iter()
            .any(|e| matches!(e.event, AuditEvent::TransitionRejected { .. })));
    }

    #[tokio::test]
    async fn settlement_updates_all_aggregates_atomically() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();
        ledger
            .set_delivery_status(&payment.delivery_id, DeliveryStatus::Completed)
            .await
            .unwrap();

        let (settled, already) = ledger
            .apply_settlement(&payment.id, split_10k(), Actor::System)
            .await
            .unwrap();
        assert!(!already);
        assert_eq!(settled.state, PaymentState::Released);
        assert!(settled.settled_at.is_some());

        let company = ledger
            .company_account(settled.company_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(company.balance, Money::from_minor(9_000));

        let driver = ledger
            .driver_record(settled.driver_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(driver.completed_deliveries, 1);

        let delivery = ledger.delivery(&payment.delivery_id).await.unwrap();
        assert_eq!(delivery.payment_status, PaymentMirror::Released);
    }

    #[tokio::test]
    async fn settlement_reentry_is_noop() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();

        let (first, _) = ledger
            .apply_settlement(&payment.id, split_10k(), Actor::System)
            .await
            .unwrap();
        let (second, already) = ledger
            .apply_settlement(&payment.id, split_10k(), Actor::System)
            .await
            .unwrap();
        assert!(already);
        assert_eq!(first.settled_at, second.settled_at);

        // Company balance credited exactly once
        let company = ledger
            .company_account(first.company_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(company.balance, Money::from_minor(9_000));
    }

    #[tokio::test]
    async fn settlement_rejected_on_refunded_payment() {
        // A refunded dispute resolution stamps settled_at too; a later
        // settlement attempt must lose the CAS, not no-op into a payout.
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();
        ledger
            .open_dispute(
                &payment.id,
                DisputeRecord::new(Actor::System, "chargeback"),
            )
            .await
            .unwrap();
        ledger
            .apply_resolution(
                &payment.id,
                PaymentState::Refunded,
                courierpay_types::DisputeResolution {
                    decision: courierpay_types::DisputeDecision::FullRefund,
                    resolved_by: Actor::System,
                    resolved_at: Utc::now(),
                },
                None,
            )
            .await
            .unwrap();

        let result = ledger
            .apply_settlement(&payment.id, split_10k(), Actor::System)
            .await;
        assert!(matches!(result, Err(CourierPayError::StateConflict { .. })));

        let payment = ledger.payment(&payment.id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Refunded);
        assert!(ledger
            .company_account(payment.company_id.as_ref().unwrap())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn settlement_rejects_bad_split() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();

        let bad = FundSplit {
            platform_fee: Money::from_minor(1_000),
            company_amount: Money::from_minor(8_999),
            driver_amount: None,
        };
        let result = ledger.apply_settlement(&payment.id, bad, Actor::System).await;
        assert!(matches!(
            result,
            Err(CourierPayError::ValidationFailure { .. })
        ));
        // Nothing mutated
        let payment = ledger.payment(&payment.id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Held);
        assert!(payment.split.is_none());
    }

    #[tokio::test]
    async fn record_transfer_is_idempotent_per_id() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();
        ledger
            .apply_settlement(&payment.id, split_10k(), Actor::System)
            .await
            .unwrap();

        let tid = TransferId::new("tr_1");
        ledger.record_transfer(&payment.id, tid.clone()).await.unwrap();
        // Same id again: fine. Different id: refused.
        ledger.record_transfer(&payment.id, tid).await.unwrap();
        let clash = ledger
            .record_transfer(&payment.id, TransferId::new("tr_2"))
            .await;
        assert!(clash.is_err());
    }

    #[tokio::test]
    async fn concurrent_settlements_credit_once() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();

        let a = {
            let ledger = ledger.clone();
            let id = payment.id.clone();
            tokio::spawn(async move {
                ledger.apply_settlement(&id, split_10k(), Actor::System).await
            })
        };
        let b = {
            let ledger = ledger.clone();
            let id = payment.id.clone();
            tokio::spawn(async move {
                ledger.apply_settlement(&id, split_10k(), Actor::System).await
            })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        let fresh: Vec<bool> = [ra, rb]
            .into_iter()
            .map(|r| !r.unwrap().1)
            .collect();
        // Exactly one of the two performed the settlement
        assert_eq!(fresh.iter().filter(|f| **f).count(), 1);

        let settled = ledger.payment(&payment.id).await.unwrap();
        let company = ledger
            .company_account(settled.company_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(company.balance, Money::from_minor(9_000));
    }

    #[tokio::test]
    async fn dispute_freezes_and_resolution_releases() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();

        ledger
            .open_dispute(
                &payment.id,
                DisputeRecord::new(Actor::Admin("ops".into()), "item missing"),
            )
            .await
            .unwrap();
        let disputed = ledger.payment(&payment.id).await.unwrap();
        assert_eq!(disputed.state, PaymentState::Disputed);

        let resolution = courierpay_types::DisputeResolution {
            decision: courierpay_types::DisputeDecision::FullRelease,
            resolved_by: Actor::Admin("ops".into()),
            resolved_at: Utc::now(),
        };
        let resolved = ledger
            .apply_resolution(
                &payment.id,
                PaymentState::Released,
                resolution,
                Some(Money::from_minor(9_000)),
            )
            .await
            .unwrap();
        assert_eq!(resolved.state, PaymentState::Released);
        assert!(resolved.dispute.unwrap().is_resolved());

        let company = ledger
            .company_account(resolved.company_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(company.balance, Money::from_minor(9_000));
    }

    #[tokio::test]
    async fn resolution_cannot_go_back_to_held() {
        let (ledger, payment) = seeded_ledger().await;
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();
        ledger
            .open_dispute(
                &payment.id,
                DisputeRecord::new(Actor::System, "test"),
            )
            .await
            .unwrap();

        let resolution = courierpay_types::DisputeResolution {
            decision: courierpay_types::DisputeDecision::FullRefund,
            resolved_by: Actor::System,
            resolved_at: Utc::now(),
        };
        let result = ledger
            .apply_resolution(&payment.id, PaymentState::Held, resolution, None)
            .await;
        assert!(matches!(
            result,
            Err(CourierPayError::IllegalTransition { .. })
        ));
    }
}
