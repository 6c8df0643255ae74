//! CourierPay Settlement - atomic release of escrowed funds
//!
//! The orchestrator is the only component that moves a held payment to
//! released through the default flow. The ledger commit (split + release +
//! company balance + driver counters) is atomic; the external transfer runs
//! afterwards under a stable idempotency key, so a crash or timeout between
//! the two leaves the payment released-pending-transfer and a retry
//! completes it without a second payout.

pub mod notify;
pub mod retry;

use std::sync::Arc;

use tracing::{info, warn};

use courierpay_fees::{compute_split, FeePolicy};
use courierpay_gateway::{ProcessorClient, TransferRequest};
use courierpay_ledger::EscrowLedger;
use courierpay_types::{
    Actor, AuditEvent, CourierPayError, FundSplit, Payment, PaymentId, Result, TransferId,
};

pub use notify::{Notifier, NullNotifier, RecordingNotifier};
pub use retry::{with_retry, RetryPolicy};

/// Result of a settlement run
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub payment_id: PaymentId,
    pub transfer_id: TransferId,
    pub split: FundSplit,
    /// True when this run found the work already done and changed nothing
    pub already_settled: bool,
}

pub struct SettlementOrchestrator {
    ledger: EscrowLedger,
    processor: Arc<dyn ProcessorClient>,
    notifier: Arc<dyn Notifier>,
    fee_policy: FeePolicy,
    retry_policy: RetryPolicy,
}

impl SettlementOrchestrator {
    pub fn new(
        ledger: EscrowLedger,
        processor: Arc<dyn ProcessorClient>,
        notifier: Arc<dyn Notifier>,
        fee_policy: FeePolicy,
    ) -> Self {
        Self {
            ledger,
            processor,
            notifier,
            fee_policy,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Stable idempotency key for a payment's settlement transfer; reused
    /// verbatim across retries.
    fn transfer_key(payment_id: &PaymentId) -> String {
        format!("settle-{}", payment_id)
    }

    /// Settle a held payment whose delivery has completed.
    ///
    /// Safe to call repeatedly: a payment that is already fully settled
    /// returns the original transfer id without touching the processor, and
    /// one that is released-pending-transfer re-drives only the transfer.
    pub async fn settle(&self, payment_id: &PaymentId, actor: Actor) -> Result<SettlementOutcome> {
        let payment = self.ledger.payment(payment_id).await?;

        // Already fully settled: return the prior result unchanged.
        if let (Some(transfer_id), Some(split)) = (&payment.transfer_id, &payment.split) {
            if payment.settled_at.is_some() {
                info!(payment_id = %payment_id, transfer_id = %transfer_id,
                      "Settlement re-entry, returning prior result");
                return Ok(SettlementOutcome {
                    payment_id: payment_id.clone(),
                    transfer_id: transfer_id.clone(),
                    split: *split,
                    already_settled: true,
                });
            }
        }

        // Delivery completion gates settlement, except when re-driving a
        // payment the ledger already released.
        if !payment.is_pending_transfer() {
            let delivery = self.ledger.delivery(&payment.delivery_id).await?;
            if !delivery.status.is_completed() {
                return Err(CourierPayError::DeliveryNotCompleted {
                    delivery_id: payment.delivery_id.to_string(),
                    status: delivery.status.to_string(),
                });
            }
        }

        let split = match payment.split {
            Some(split) => split,
            None => compute_split(payment.total_amount, &self.fee_policy)?,
        };

        // Atomic unit: split + held->released + aggregates; a re-run or a
        // lost CAS surfaces here instead of double-applying.
        let (settled, already) = self
            .ledger
            .apply_settlement(payment_id, split, actor.clone())
            .await?;

        // Released with a transfer already on record (a resolved dispute's
        // release leg, or a racing settle that won): return the prior
        // outcome rather than initiating a second payout. Released without
        // a transfer id is the stuck case that must re-drive the transfer.
        if already {
            if let Some(transfer_id) = settled.transfer_id.clone() {
                info!(payment_id = %payment_id, transfer_id = %transfer_id,
                      "Settlement already applied, returning prior result");
                return Ok(SettlementOutcome {
                    payment_id: payment_id.clone(),
                    transfer_id,
                    split: settled.split.unwrap_or(split),
                    already_settled: true,
                });
            }
        }

        let transfer_id = self.run_transfer(&settled, split).await?;
        let updated = self.ledger.record_transfer(payment_id, transfer_id.clone()).await?;

        self.send_notifications(&updated, &split).await;

        Ok(SettlementOutcome {
            payment_id: payment_id.clone(),
            transfer_id,
            split,
            already_settled: false,
        })
    }

    async fn run_transfer(&self, payment: &Payment, split: FundSplit) -> Result<TransferId> {
        let company_id = payment.company_id.clone().ok_or_else(|| {
            CourierPayError::validation("company_id", "payment has no company to pay out to")
        })?;
        let key = Self::transfer_key(&payment.id);
        let request = TransferRequest {
            recipient: company_id,
            amount: split.company_amount,
            currency: payment.currency.clone(),
            idempotency_key: key.clone(),
        };

        let result = with_retry(&self.retry_policy, "settlement_transfer", || {
            let request = request.clone();
            let processor = Arc::clone(&self.processor);
            async move { processor.transfer(request).await }
        })
        .await;

        match result {
            Ok(receipt) => Ok(receipt.transfer_id),
            Err(err) => {
                // The payment stays released-pending-transfer; the forensic
                // entry records why, and a later retry reuses the same key.
                warn!(payment_id = %payment.id, error = %err,
                      "Transfer failed after retries, settlement stuck pending transfer");
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

    async fn send_notifications(&self, payment: &Payment, split: &FundSplit) {
        if let Some(company_id) = &payment.company_id {
            self.notifier
                .notify(
                    &company_id.to_string(),
                    "Settlement completed",
                    &format!("{} credited for delivery {}", split.company_amount, payment.delivery_id),
                    serde_json::json!({
                        "payment_id": payment.id.to_string(),
                        "amount_minor": split.company_amount.minor(),
                    }),
                )
                .await;
        }
        if let Some(driver_id) = &payment.driver_id {
            self.notifier
                .notify(
                    &driver_id.to_string(),
                    "Delivery settled",
                    &format!("Delivery {} has been settled", payment.delivery_id),
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
    use chrono::Utc;
    use courierpay_types::{
        CompanyId, Currency, CustomerId, Delivery, DeliveryId, DeliveryStatus, DisputeDecision,
        DisputeRecord, DisputeResolution, DriverId, Money, PaymentState,
    };
    use std::time::Duration;

    struct Fixture {
        ledger: EscrowLedger,
        processor: MockProcessor,
        notifier: Arc<RecordingNotifier>,
        orchestrator: SettlementOrchestrator,
        payment_id: PaymentId,
    }

    async fn fixture() -> Fixture {
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
                    delivery_id: delivery_id.clone(),
                    customer_id,
                    currency: Currency::usd(),
                    total_amount: Money::from_minor(10_000),
                },
                Actor::System,
            )
            .await
            .unwrap();
        ledger
            .record_charge_held(&payment.id, Money::from_minor(10_000))
            .await
            .unwrap();
        ledger
            .set_delivery_status(&delivery_id, DeliveryStatus::Completed)
            .await
            .unwrap();

        let processor = MockProcessor::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = SettlementOrchestrator::new(
            ledger.clone(),
            Arc::new(processor.clone()),
            notifier.clone(),
            FeePolicy::default(),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        });

        Fixture {
            ledger,
            processor,
            notifier,
            orchestrator,
            payment_id: payment.id,
        }
    }

    #[tokio::test]
    async fn settles_and_splits() {
        let f = fixture().await;
        let outcome = f
            .orchestrator
            .settle(&f.payment_id, Actor::System)
            .await
            .unwrap();

        assert!(!outcome.already_settled);
        assert_eq!(outcome.split.platform_fee, Money::from_minor(1_000));
        assert_eq!(outcome.split.company_amount, Money::from_minor(9_000));

        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Released);
        assert!(payment.is_settled());
    }

    #[tokio::test]
    async fn rerun_returns_same_transfer_without_new_call() {
        // Scenario C
        let f = fixture().await;
        let first = f
            .orchestrator
            .settle(&f.payment_id, Actor::System)
            .await
            .unwrap();
        let calls_after_first = f.processor.transfer_calls().await;

        let second = f
            .orchestrator
            .settle(&f.payment_id, Actor::System)
            .await
            .unwrap();
        assert!(second.already_settled);
        assert_eq!(first.transfer_id, second.transfer_id);
        assert_eq!(f.processor.transfer_calls().await, calls_after_first);
    }

    #[tokio::test]
    async fn requires_completed_delivery() {
        let f = fixture().await;
        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        f.ledger
            .set_delivery_status(&payment.delivery_id, DeliveryStatus::InTransit)
            .await
            .unwrap();

        let result = f.orchestrator.settle(&f.payment_id, Actor::System).await;
        assert!(matches!(
            result,
            Err(CourierPayError::DeliveryNotCompleted { .. })
        ));
        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Held);
    }

    #[tokio::test]
    async fn transfer_failure_leaves_pending_then_retry_completes() {
        let f = fixture().await;
        f.processor.set_fail_transfers(true).await;

        let result = f.orchestrator.settle(&f.payment_id, Actor::System).await;
        assert!(matches!(
            result,
            Err(CourierPayError::ExternalCallFailure { .. })
        ));

        // Local financial state is released-pending-transfer, not rolled back
        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Released);
        assert!(payment.is_pending_transfer());
        assert!(payment
            .audit_log
            .iter()
            .any(|e| matches!(e.event, AuditEvent::ExternalCallFailed { .. })));

        // Company was credited exactly once in the atomic unit
        let company = f
            .ledger
            .company_account(payment.company_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(company.balance, Money::from_minor(9_000));

        // Retry after the processor recovers completes with the same key
        f.processor.set_fail_transfers(false).await;
        let outcome = f
            .orchestrator
            .settle(&f.payment_id, Actor::System)
            .await
            .unwrap();
        assert!(!outcome.already_settled);

        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert!(payment.is_settled());
        // Only one idempotency key ever reached the processor
        assert_eq!(f.processor.distinct_keys().await.len(), 1);
        // And the company balance did not double
        let company = f
            .ledger
            .company_account(payment.company_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(company.balance, Money::from_minor(9_000));
    }

    #[tokio::test]
    async fn notifications_are_fire_and_forget() {
        let f = fixture().await;
        f.orchestrator
            .settle(&f.payment_id, Actor::System)
            .await
            .unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 2); // company + driver
        assert_eq!(sent[0].1, "Settlement completed");
    }

    #[tokio::test]
    async fn concurrent_settles_produce_one_transfer() {
        let f = fixture().await;
        let o1 = {
            let orchestrator = SettlementOrchestrator::new(
                f.ledger.clone(),
                Arc::new(f.processor.clone()),
                Arc::new(NullNotifier),
                FeePolicy::default(),
            );
            let id = f.payment_id.clone();
            tokio::spawn(async move { orchestrator.settle(&id, Actor::System).await })
        };
        let o2 = {
            let orchestrator = SettlementOrchestrator::new(
                f.ledger.clone(),
                Arc::new(f.processor.clone()),
                Arc::new(NullNotifier),
                FeePolicy::default(),
            );
            let id = f.payment_id.clone();
            tokio::spawn(async move { orchestrator.settle(&id, Actor::System).await })
        };

        let r1 = o1.await.unwrap();
        let r2 = o2.await.unwrap();
        // Both observe success (one fresh, one idempotent or conflict-retried),
        // and the processor saw exactly one idempotency key.
        let ids: Vec<TransferId> = [r1, r2]
            .into_iter()
            .filter_map(|r| r.ok().map(|o| o.transfer_id))
            .collect();
        assert!(!ids.is_empty());
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(f.processor.distinct_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn settle_after_refund_resolution_pays_nothing() {
        let f = fixture().await;
        let customer = f.ledger.payment(&f.payment_id).await.unwrap().customer_id;
        f.ledger
            .open_dispute(
                &f.payment_id,
                DisputeRecord::new(Actor::Customer(customer), "damaged goods"),
            )
            .await
            .unwrap();
        f.ledger
            .apply_resolution(
                &f.payment_id,
                PaymentState::Refunded,
                DisputeResolution {
                    decision: DisputeDecision::FullRefund,
                    resolved_by: Actor::Admin("ops".to_string()),
                    resolved_at: Utc::now(),
                },
                None,
            )
            .await
            .unwrap();

        let result = f.orchestrator.settle(&f.payment_id, Actor::System).await;
        assert!(matches!(result, Err(CourierPayError::StateConflict { .. })));
        assert_eq!(f.processor.transfer_calls().await, 0);

        let payment = f.ledger.payment(&f.payment_id).await.unwrap();
        assert_eq!(payment.state, PaymentState::Refunded);
        assert!(payment.transfer_id.is_none());
        // The refunded customer's money never reached the company
        assert!(f
            .ledger
            .company_account(payment.company_id.as_ref().unwrap())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn settle_after_release_resolution_reuses_dispute_transfer() {
        let f = fixture().await;
        let customer = f.ledger.payment(&f.payment_id).await.unwrap().customer_id;
        f.ledger
            .open_dispute(
                &f.payment_id,
                DisputeRecord::new(Actor::Customer(customer), "late delivery"),
            )
            .await
            .unwrap();
        f.ledger
            .apply_resolution(
                &f.payment_id,
                PaymentState::Released,
                DisputeResolution {
                    decision: DisputeDecision::FullRelease,
                    resolved_by: Actor::Admin("ops".to_string()),
                    resolved_at: Utc::now(),
                },
                Some(Money::from_minor(10_000)),
            )
            .await
            .unwrap();
        let dispute_transfer = TransferId::new("tr_dispute_1");
        f.ledger
            .record_transfer(&f.payment_id, dispute_transfer.clone())
            .await
            .unwrap();

        let outcome = f
            .orchestrator
            .settle(&f.payment_id, Actor::System)
            .await
            .unwrap();
        assert!(outcome.already_settled);
        assert_eq!(outcome.transfer_id, dispute_transfer);
        assert_eq!(f.processor.transfer_calls().await, 0);
    }
}
