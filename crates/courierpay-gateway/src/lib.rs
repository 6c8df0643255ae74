//! CourierPay Gateway - the external payment processor seam
//!
//! The processor is an opaque external service reached over HTTP. This crate
//! defines the trait the engine programs against, a reqwest-backed client,
//! and an in-memory mock that honours idempotency keys the way a real
//! processor does.

pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use courierpay_types::{
    CompanyId, CourierPayError, Currency, CustomerId, DeliveryId, Money, ProcessorRef, Result,
    TransferId,
};

/// Request to start a hosted checkout for an escrow charge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub amount: Money,
    pub currency: Currency,
    pub customer_id: CustomerId,
    /// Metadata the processor echoes back on webhooks
    pub delivery_id: DeliveryId,
    pub platform_fee: Option<Money>,
}

/// Hosted checkout session returned by the processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// The processor-assigned charge reference; persisted before redirect
    pub reference: ProcessorRef,
    /// URL the customer is redirected to
    pub checkout_url: String,
}

/// Outcome of a charge as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Succeeded { amount: Money, currency: Currency },
    Failed { reason: String },
    /// Charge exists but has not resolved yet (polling fallback)
    Pending,
}

/// Payout request. The idempotency key is caller-supplied and MUST be
/// reused verbatim on retry so the processor deduplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub recipient: CompanyId,
    pub amount: Money,
    pub currency: Currency,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: TransferId,
}

/// Refund request against an original charge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub reference: ProcessorRef,
    pub amount: Money,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: TransferId,
}

/// The processor client trait the engine programs against
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Create a hosted checkout; the caller persists the reference before
    /// redirecting the customer
    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession>;

    /// Polling fallback for when the webhook has not arrived yet
    async fn verify_charge(&self, reference: &ProcessorRef) -> Result<ChargeOutcome>;

    /// Initiate a payout to a company account
    async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt>;

    /// Refund a held or captured charge back to the customer
    async fn refund(&self, request: RefundRequest) -> Result<RefundReceipt>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// reqwest-backed processor client
pub struct HttpProcessorClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpProcessorClient {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| CourierPayError::external("client_init", e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        })
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<R> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.secret_key)
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CourierPayError::external(operation, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CourierPayError::external(
                operation,
                format!("processor returned {}: {}", status, detail),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| CourierPayError::external(operation, e.to_string()))
    }
}

#[async_trait]
impl ProcessorClient for HttpProcessorClient {
    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        self.post_json("create_checkout", "/v1/checkout/sessions", &request, None)
            .await
    }

    async fn verify_charge(&self, reference: &ProcessorRef) -> Result<ChargeOutcome> {
        let response = self
            .http
            .get(format!("{}/v1/charges/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| CourierPayError::external("verify_charge", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CourierPayError::external(
                "verify_charge",
                format!("processor returned {}", status),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| CourierPayError::external("verify_charge", e.to_string()))
    }

    async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt> {
        let key = request.idempotency_key.clone();
        self.post_json("transfer", "/v1/transfers", &request, Some(&key))
            .await
    }

    async fn refund(&self, request: RefundRequest) -> Result<RefundReceipt> {
        let key = request.idempotency_key.clone();
        self.post_json("refund", "/v1/refunds", &request, Some(&key))
            .await
    }
}

// ============================================================================
// Mock implementation
// ============================================================================

#[derive(Default)]
struct MockState {
    charges: HashMap<ProcessorRef, ChargeOutcome>,
    /// idempotency key -> receipt id, so a retried request gets the same id
    transfers: HashMap<String, TransferId>,
    refunds: HashMap<String, TransferId>,
    transfer_calls: u64,
    refund_calls: u64,
    checkout_count: u64,
    fail_transfers: bool,
}

/// In-memory processor double for tests. Repeated transfer/refund requests
/// with the same idempotency key return the original receipt without a
/// second side effect, mirroring real processor semantics.
#[derive(Clone, Default)]
pub struct MockProcessor {
    state: Arc<Mutex<MockState>>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-program the outcome a later `verify_charge` will report
    pub async fn set_charge_outcome(&self, reference: ProcessorRef, outcome: ChargeOutcome) {
        self.state.lock().await.charges.insert(reference, outcome);
    }

    /// Make subsequent transfer calls fail (network fault injection)
    pub async fn set_fail_transfers(&self, fail: bool) {
        self.state.lock().await.fail_transfers = fail;
    }

    /// Number of transfer calls that reached the processor (dedup included)
    pub async fn transfer_calls(&self) -> u64 {
        self.state.lock().await.transfer_calls
    }

    pub async fn refund_calls(&self) -> u64 {
        self.state.lock().await.refund_calls
    }

    /// Distinct idempotency keys seen across transfers and refunds
    pub async fn distinct_keys(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .transfers
            .keys()
            .chain(state.refunds.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ProcessorClient for MockProcessor {
    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let mut state = self.state.lock().await;
        state.checkout_count += 1;
        let reference = ProcessorRef::new(format!("ch_mock_{}", state.checkout_count));
        state
            .charges
            .insert(reference.clone(), ChargeOutcome::Pending);
        info!(reference = %reference, amount = %request.amount, "Mock checkout created");
        Ok(CheckoutSession {
            checkout_url: format!("https://checkout.test/{}", reference),
            reference,
        })
    }

    async fn verify_charge(&self, reference: &ProcessorRef) -> Result<ChargeOutcome> {
        let state = self.state.lock().await;
        state
            .charges
            .get(reference)
            .cloned()
            .ok_or_else(|| CourierPayError::external("verify_charge", "unknown reference"))
    }

    async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt> {
        let mut state = self.state.lock().await;
        if state.fail_transfers {
            return Err(CourierPayError::external("transfer", "connection reset"));
        }
        state.transfer_calls += 1;
        if let Some(existing) = state.transfers.get(&request.idempotency_key) {
            return Ok(TransferReceipt {
                transfer_id: existing.clone(),
            });
        }
        let transfer_id = TransferId::new(format!("tr_mock_{}", state.transfers.len() + 1));
        state
            .transfers
            .insert(request.idempotency_key.clone(), transfer_id.clone());
        Ok(TransferReceipt { transfer_id })
    }

    async fn refund(&self, request: RefundRequest) -> Result<RefundReceipt> {
        let mut state = self.state.lock().await;
        state.refund_calls += 1;
        if let Some(existing) = state.refunds.get(&request.idempotency_key) {
            return Ok(RefundReceipt {
                refund_id: existing.clone(),
            });
        }
        let refund_id = TransferId::new(format!("re_mock_{}", state.refunds.len() + 1));
        state
            .refunds
            .insert(request.idempotency_key.clone(), refund_id.clone());
        Ok(RefundReceipt { refund_id })
    }
}
