//! CourierPay Disputes - freezing, evidence, terminal resolution
//!
//! A dispute intercepts a held payment before the default settlement flow
//! releases it. Resolution commits the local outcome atomically first, then
//! drives the external refund/transfer under stable idempotency keys, so a
//! partial failure leaves the payment in its terminal state with the payout
//! still re-drivable.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use courierpay_gateway::{ProcessorClient, RefundRequest, TransferRequest};
use courierpay_ledger::EscrowLedger;
use courierpay_settlement::{with_retry, Notifier, RetryPolicy};
use courierpay_types::{
    Actor, AuditEntry, AuditEvent, CourierPayError, DisputeDecision, DisputeRecord,
    DisputeResolution, Evidence, Money, Payment, PaymentId, PaymentState, Result, TransferId,
};

/// Result of a dispute resolution run
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub payment_id: PaymentId,
    pub final_state: PaymentState,
    pub decision: DisputeDecision,
    pub refund_id: Option<TransferId>,
    pub transfer_id: Option<TransferId>,
    /// True when the dispute was already resolved and this run only
    /// returned (or re-drove) the prior outcome
    pub already_resolved: bool,
}

pub struct DisputeDesk {
    ledger: EscrowLedger,
    processor: Arc<dyn ProcessorClient>,
    notifier: Arc<dyn Notifier>,
    retry_policy: RetryPolicy,
}

impl DisputeDesk {
    pub fn new(
        ledger: EscrowLedger,
        processor: Arc<dyn ProcessorClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ledger,
            processor,
            notifier,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    fn refund_key(payment_id: &PaymentId) -> String {
        format!("dispute-refund-{}", payment_id)
    }

    fn transfer_key(payment_id: &PaymentId) -> String {
        format!("dispute-transfer-{}", payment_id)
    }

    /// Freeze a held payment: held -> disputed with the record attached in
    /// the same commit.
    pub async fn open(
        &self,
        payment_id: &PaymentId,
        raised_by: Actor,
        reason: impl Into<String>,
    ) -> Result<Payment> {
        let record = DisputeRecord::new(raised_by, reason);
        let payment = self.ledger.open_dispute(payment_id, record).await?;
        info!(payment_id = %payment_id, "Dispute opened, funds frozen");

        if let Some(company_id) = &payment.company_id {
            self.notifier
                .notify(
                    &company_id.to_string(),
                    "Payment disputed",
                    &format!("Payment for delivery {} is frozen pending resolution", payment.delivery_id),
                    serde_json::json!({ "payment_id": payment.id.to_string() }),
                )
                .await;
        }
        Ok(payment)
    }

    /// Attach evidence to an open, unresolved dispute.
    pub async fn attach_evidence(
        &self,
        payment_id: &PaymentId,
        submitted_by: Actor,
        kind: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Payment> {
        let kind = kind.into();
        let content = content.into();
        self.ledger
            .with_dispute_mut(payment_id, |dispute| {
                if dispute.is_resolved() {
                    return Err(CourierPayError::validation(
                        "dispute",
                        "cannot attach evidence to a resolved dispute",
                    ));
                }
                dispute.evidence.push(Evidence {
                    submitted_by: submitted_by.clone(),
                    kind: kind.clone(),
                    content,
                    submitted_at: Utc::now(),
                });
                Ok(Some(AuditEntry::new(
                    AuditEvent::EvidenceAttached {
                        evidence_kind: kind.clone(),
                    },
                    submitted_by,
                )))
            })
            .await
    }

    /// Resolve a dispute into its terminal outcome.
    ///
    /// The ledger commit (state, resolution record, company credit) happens
    /// first; the processor refund/transfer follow under stable keys, so a
    /// failed external call can be re-driven by calling resolve again.
    /// Resolving an already-resolved dispute returns the prior outcome.
    pub async fn resolve(
        &self,
        payment_id: &PaymentId,
        decision: DisputeDecision,
        resolved_by: Actor,
    ) -> Result<ResolutionOutcome> {
        let payment = self.ledger.payment(payment_id).await?;
        let dispute = payment
            .dispute
            .as_ref()
            .ok_or_else(|| CourierPayError::DisputeNotFound {
                payment_id: payment_id.to_string(),
            })?;

        // Terminal: a second resolve re-drives any missing payout legs under
        // the original decision and returns the recorded outcome.
        if let Some(resolution) = &dispute.resolution {
            let recorded = resolution.decision;
            let (refund_id, transfer_id) = self.drive_externals(&payment, recorded).await?;
            return Ok(ResolutionOutcome {
                payment_id: payment_id.clone(),
                final_state: payment.state,
                decision: recorded,
                refund_id,
                transfer_id,
                already_resolved: true,
            });
        }

        // All validation happens before any mutation.
        self.validate_decision(&payment, decision)?;

        let (target, company_share) = match decision {
            DisputeDecision::FullRefund => (PaymentState::Refunded, None),
            DisputeDecision::FullRelease => {
                (PaymentState::Released, Some(payment.total_amount))
            }
            DisputeDecision::Split { company_amount, .. } => {
                (PaymentState::Released, Some(company_amount))
            }
        };

        let resolution = DisputeResolution {
            decision,
            resolved_by: resolved_by.clone(),
            resolved_at: Utc::now(),
        };
        let resolved = self
            .ledger
            .apply_resolution(payment_id, target, resolution, company_share)
            .await?;

        let (refund_id, transfer_id) = self.drive_externals(&resolved, decision).await?;

        self.send_notifications(&resolved, decision).await;

        Ok(ResolutionOutcome {
            payment_id: payment_id.clone(),
            final_state: resolved.state,
            decision,
            refund_id,
            transfer_id,
            already_resolved: false,
        })
    }

    fn validate_decision(&self, payment: &Payment, decision: DisputeDecision) -> Result<()> {
        match decision {
            DisputeDecision::Split {
                customer_amount,
                company_amount,
            } => {
                if customer_amount.minor() <= 0 || company_amount.minor() <= 0 {
                    return Err(CourierPayError::validation(
                        "decision",
                        "split amounts must both be positive",
                    ));
                }
                if customer_amount.checked_add(company_amount)? != payment.total_amount {
                    return Err(CourierPayError::validation(
                        "decision",
                        "split amounts must sum exactly to the payment total",
                    ));
                }
                if payment.processor_ref.is_none() {
                    return Err(CourierPayError::validation(
                        "payment",
                        "payment has no processor reference to refund against",
                    ));
                }
                if payment.company_id.is_none() {
                    return Err(CourierPayError::validation(
                        "payment",
                        "payment has no company to pay out to",
                    ));
                }
            }
            DisputeDecision::FullRefund => {
                if payment.processor_ref.is_none() {
                    return Err(CourierPayError::validation(
                        "payment",
                        "payment has no processor reference to refund against",
                    ));
                }
            }
            DisputeDecision::FullRelease => {
                if payment.company_id.is_none() {
                    return Err(CourierPayError::validation(
                        "payment",
                        "payment has no company to pay out to",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Run the refund and/or transfer legs the decision requires, skipping
    /// any leg already recorded on the payment.
    async fn drive_externals(
        &self,
        payment: &Payment,
        decision: DisputeDecision,
    ) -> Result<(Option<TransferId>, Option<TransferId>)> {
        let (refund_amount, transfer_amount) = match decision {
            DisputeDecision::FullRefund => (Some(payment.total_amount), None),
            DisputeDecision::FullRelease => (None, Some(payment.total_amount)),
            DisputeDecision::Split {
                customer_amount,
                company_amount,
            } => (Some(customer_amount), Some(company_amount)),
        };

        let mut refund_id = payment.refund_id.clone();
        let mut transfer_id = payment.transfer_id.clone();

        if let Some(amount) = refund_amount {
            if refund_id.is_none() {
                refund_id = Some(self.run_refund(payment, amount).await?);
            }
        }
        if let Some(amount) = transfer_amount {
            if transfer_id.is_none() {
                transfer_id = Some(self.run_transfer(payment, amount).await?);
            }
        }
        Ok((refund_id, transfer_id))
    }

    async fn run_refund(&self, payment: &Payment, amount: Money) -> Result<TransferId> {
        let reference = payment.processor_ref.clone().ok_or_else(|| {
            CourierPayError::validation(
                "payment",
                "payment has no processor reference to refund against",
            )
        })?;
        let request = RefundRequest {
            reference,
            amount,
            idempotency_key: Self::refund_key(&payment.id),
        };
        let result = with_retry(&self.retry_policy, "dispute_refund", || {
            let request = request.clone();
            let processor = Arc::clone(&self.processor);
            async move { processor.refund(request).await }
        })
        .await;

        match result {
            Ok(receipt) => {
                self.ledger
                    .record_refund(&payment.id, receipt.refund_id.clone())
                    .await?;
                self.ledger
                    .append_audit(
                        &payment.id,
                        AuditEvent::Refunded {
                            refund_id: Some(receipt.refund_id.clone()),
                        },
                        Actor::System,
                    )
                    .await?;
                Ok(receipt.refund_id)
            }
            Err(err) => {
                warn!(payment_id = %payment.id, error = %err,
                      "Dispute refund failed after retries, re-drivable under the same key");
                self.ledger
                    .append_audit(
                        &payment.id,
                        AuditEvent::ExternalCallFailed {
                            operation: "refund".to_string(),
                            reason: err.to_string(),
                        },
                        Actor::System,
                    )
                    .await?;
                Err(err)
            }
        }
    }

    async fn run_transfer(&self, payment: &Payment, amount: Money) -> Result<TransferId> {
        let recipient = payment.company_id.clone().ok_or_else(|| {
            CourierPayError::validation("payment", "payment has no company to pay out to")
        })?;
        let request = TransferRequest {
            recipient,
            amount,
            currency: payment.currency.clone(),
            idempotency_key: Self::transfer_key(&payment.id),
        };
        let result = with_retry(&self.retry_policy, "dispute_transfer", || {
            let request = request.clone();
            let processor = Arc::clone(&self.processor);
            async move { processor.transfer(request).await }
        })
        .await;

        match result {
            Ok(receipt) => {
                self.ledger
                    .record_transfer(&payment.id, receipt.transfer_id.clone())
                    .await?;
                Ok(receipt.transfer_id)
            }
            Err(err) => {
                warn!(payment_id = %payment.id, error = %err,
                      "Dispute transfer failed after retries, re-drivable under the same key");
                self.ledger
                    .append_audit(
                        &payment.id,
                        AuditEvent::ExternalCallFailed {
                            operation: "transfer".to_string(),
                            reason: err.to_string(),
                        },
                        Actor::System,
                    )
                    .await?;
                Err(err)
            }
        }
    }

    async fn send_notifications(&self, payment: &Payment, decision: DisputeDecision) {
        self.notifier
            .notify(
                &payment.customer_id.to_string(),
                "Dispute resolved",
                &format!("Your dispute was resolved: {}", decision.label()),
                serde_json::json!({ "payment_id": payment.id.to_string() }),
            )
            .await;
        if let Some(company_id) = &payment.company_id {
            self.notifier
                .notify(
                    &company_id.to_string(),
                    "Dispute resolved",
                    &format!("Dispute on delivery {} resolved: {}", payment.delivery_id, decision.label()),
                    serde_json::json!({ "payment_id": payment.id.to_string() }),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courierpay_gateway::MockProcessor;
    use courierpay_ledger::NewPayment;
    use courierpay_settlement::NullNotifier;
    use courierpay_types::{
        CompanyId, Currency, CustomerId, Delivery, DeliveryId, DriverId, ProcessorRef,
    };
    use std::time::Duration;

    struct Fixture {
        ledger: EscrowLedger,
        processor: MockProcessor,
        desk: DisputeDesk,
        payment_id: PaymentId,
    }

    async fn held_fixture() -> Fixture {
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
        ledger
            .attach_processor_ref(&payment.id, ProcessorRef::new("ch_disp_1"))
            .await
            .unwrap();
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();

        let processor = MockProcessor::new();
        let desk = DisputeDesk::new(
            ledger.clone(),
            Arc::new(processor.clone()),
            Arc::new(NullNotifier),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        });

        Fixture {
            ledger,
            processor,
            desk,
            payment_id: payment.id,
        }
    }

    #[tokio::test]
    async fn open_freezes_held_payment() {
        let f = held_fixture().await;
        let payment = f
            .desk
            .open(&f.payment_id, Actor::System, "item damaged")
            .await
            .unwrap();
        assert_eq!(payment.state, PaymentState::Disputed);
        assert!(payment.dispute.is_some());
    }

    #[tokio::test]
    async fn cannot_open_on_pending_payment() {
        let ledger = EscrowLedger::new();
        let delivery_id = DeliveryId::new();
        let customer_id = CustomerId::new();
        ledger
            .upsert_delivery(Delivery::new(delivery_id.clone(), customer_id.clone()))
            .await;
        let payment = ledger
            .create_payment(
                NewPayment {
                    delivery_id,
                    customer_id,
                    currency: Currency::usd(),
                    total_amount: Money::from_minor(5_000),
                },
                Actor::System,
            )
            .await
            .unwrap();

        let desk = DisputeDesk::new(
            ledger,
            Arc::new(MockProcessor::new()),
            Arc::new(NullNotifier),
        );
        let result = desk.open(&payment.id, Actor::System, "too early").await;
        assert!(matches!(result, Err(CourierPayError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn evidence_only_while_unresolved() {
        let f = held_fixture().await;
        f.desk
            .open(&f.payment_id, Actor::System, "wrong item")
            .await
            .unwrap();
        let payment = f
            .desk
            .attach_evidence(&f.payment_id, Actor::System, "photo", "https://img/1")
            .await
            .unwrap();
        assert_eq!(payment.dispute.as_ref().unwrap().evidence.len(), 1);

        f.desk
            .resolve(&f.payment_id, DisputeDecision::FullRefund, Actor::System)
            .await
            .unwrap();
        let result = f
            .desk
            .attach_evidence(&f.payment_id, Actor::System, "photo", "https://img/2")
            .await;
        assert!(matches!(
            result,
            Err(CourierPayError::ValidationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn full_refund_resolves_to_refunded() {
        let f = held_fixture().await;
        f.desk
            .open(&f.payment_id, Actor::System, "never delivered")
            .await
            .unwrap();

        let outcome = f
            .desk
            .resolve(&f.payment_id, DisputeDecision::FullRefund, Actor::System)
            .await
            .unwrap();
        assert_eq!(outcome.final_state, PaymentState::Refunded);
        assert!(outcome.refund_id.is_some());
        assert!(outcome.transfer_id.is_none());

        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Refunded);
        assert_eq!(payment.refund_id, outcome.refund_id);
        // No company credit on a full refund
        assert!(f
            .ledger
            .company_account(payment.company_id.as_ref().unwrap())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn split_resolution_uses_distinct_keys() {
        // Scenario D: 4,000 to the customer, 6,000 to the company
        let f = held_fixture().await;
        f.desk
            .open(&f.payment_id, Actor::System, "partial damage")
            .await
            .unwrap();

        let outcome = f
            .desk
            .resolve(
                &f.payment_id,
                DisputeDecision::Split {
                    customer_amount: Money::from_minor(4_000),
                    company_amount: Money::from_minor(6_000),
                },
                Actor::System,
            )
            .await
            .unwrap();
        assert_eq!(outcome.final_state, PaymentState::Released);
        assert!(outcome.refund_id.is_some());
        assert!(outcome.transfer_id.is_some());

        let keys = f.processor.distinct_keys().await;
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&format!("dispute-refund-{}", f.payment_id)));
        assert!(keys.contains(&format!("dispute-transfer-{}", f.payment_id)));

        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Released);
        assert!(payment.dispute.as_ref().unwrap().is_resolved());
        // Company credited its part only
        let company = f
            .ledger
            .company_account(payment.company_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(company.balance, Money::from_minor(6_000));
    }

    #[tokio::test]
    async fn split_must_sum_to_total() {
        let f = held_fixture().await;
        f.desk
            .open(&f.payment_id, Actor::System, "partial damage")
            .await
            .unwrap();

        let result = f
            .desk
            .resolve(
                &f.payment_id,
                DisputeDecision::Split {
                    customer_amount: Money::from_minor(4_000),
                    company_amount: Money::from_minor(5_000),
                },
                Actor::System,
            )
            .await;
        assert!(matches!(
            result,
            Err(CourierPayError::ValidationFailure { .. })
        ));
        // Rejected before any mutation
        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Disputed);
        assert!(!payment.dispute.as_ref().unwrap().is_resolved());
    }

    #[tokio::test]
    async fn re_resolution_returns_prior_outcome() {
        let f = held_fixture().await;
        f.desk
            .open(&f.payment_id, Actor::System, "never delivered")
            .await
            .unwrap();

        let first = f
            .desk
            .resolve(&f.payment_id, DisputeDecision::FullRefund, Actor::System)
            .await
            .unwrap();
        let calls = f.processor.refund_calls().await;

        // A second resolve, even with a different decision, sticks with the
        // recorded one and performs no new processor work.
        let second = f
            .desk
            .resolve(&f.payment_id, DisputeDecision::FullRelease, Actor::System)
            .await
            .unwrap();
        assert!(second.already_resolved);
        assert_eq!(second.decision, DisputeDecision::FullRefund);
        assert_eq!(first.refund_id, second.refund_id);
        assert_eq!(f.processor.refund_calls().await, calls);
    }

    #[tokio::test]
    async fn transfer_failure_leaves_terminal_state_re_drivable() {
        let f = held_fixture().await;
        f.desk
            .open(&f.payment_id, Actor::System, "partial damage")
            .await
            .unwrap();
        f.processor.set_fail_transfers(true).await;

        let decision = DisputeDecision::Split {
            customer_amount: Money::from_minor(4_000),
            company_amount: Money::from_minor(6_000),
        };
        let result = f
            .desk
            .resolve(&f.payment_id, decision, Actor::System)
            .await;
        assert!(matches!(
            result,
            Err(CourierPayError::ExternalCallFailure { .. })
        ));

        // Local outcome is committed; the refund leg succeeded, the transfer
        // leg is pending.
        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Released);
        assert!(payment.refund_id.is_some());
        assert!(payment.transfer_id.is_none());

        // Re-resolving after recovery drives only the missing transfer leg.
        f.processor.set_fail_transfers(false).await;
        let refund_calls = f.processor.refund_calls().await;
        let outcome = f
            .desk
            .resolve(&f.payment_id, decision, Actor::System)
            .await
            .unwrap();
        assert!(outcome.already_resolved);
        assert!(outcome.transfer_id.is_some());
        assert_eq!(f.processor.refund_calls().await, refund_calls);
        assert_eq!(f.processor.distinct_keys().await.len(), 2);
    }
}
