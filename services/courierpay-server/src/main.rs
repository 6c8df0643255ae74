//! CourierPay Server
//!
//! HTTP surface over the escrow engine: the processor webhook endpoint plus
//! the payment lifecycle (initiate, verify, settle, dispute).
//!
//! # Usage
//!
//! ```bash
//! # Development mode with the in-memory mock processor
//! courierpay-server
//!
//! # Against a real processor
//! COURIERPAY_PROCESSOR_URL=https://api.processor.example \
//! COURIERPAY_PROCESSOR_SECRET=sk_live_... \
//! COURIERPAY_WEBHOOK_SECRET=whsec_... \
//! courierpay-server --port 8080
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use tokio::signal;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use courierpay_disputes::DisputeDesk;
use courierpay_fees::{compute_split, FeePolicy};
use courierpay_gateway::{
    CheckoutRequest, HttpProcessorClient, MockProcessor, ProcessorClient,
};
use courierpay_ledger::{EscrowLedger, NewPayment};
use courierpay_settlement::{NullNotifier, SettlementOrchestrator};
use courierpay_types::{
    Actor, CompanyId, CourierPayError, Currency, CustomerId, Delivery, DeliveryId, DeliveryStatus,
    DisputeDecision, DriverId, Money, PaymentId,
};
use courierpay_webhook::WebhookIngestor;

// ============================================================================
// CLI
// ============================================================================

/// CourierPay escrow settlement engine
#[derive(Parser, Debug)]
#[command(name = "courierpay-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host to bind to
    #[arg(long, env = "COURIERPAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "COURIERPAY_PORT", default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COURIERPAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (json, pretty)
    #[arg(long, env = "COURIERPAY_LOG_FORMAT", default_value = "pretty")]
    log_format: String,

    /// Processor API base URL; when unset the in-memory mock is used
    #[arg(long, env = "COURIERPAY_PROCESSOR_URL")]
    processor_url: Option<String>,

    /// Processor API secret key
    #[arg(long, env = "COURIERPAY_PROCESSOR_SECRET")]
    processor_secret: Option<String>,

    /// Shared secret for verifying inbound webhook signatures
    #[arg(long, env = "COURIERPAY_WEBHOOK_SECRET", default_value = "whsec_dev")]
    webhook_secret: String,

    /// Platform fee percentage of the payment total
    #[arg(long, env = "COURIERPAY_PLATFORM_FEE_PERCENT", default_value = "10")]
    platform_fee_percent: u8,
}

// ============================================================================
// Application State
// ============================================================================

struct AppState {
    ledger: EscrowLedger,
    processor: Arc<dyn ProcessorClient>,
    ingestor: WebhookIngestor,
    orchestrator: SettlementOrchestrator,
    desk: DisputeDesk,
    fee_policy: FeePolicy,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, &args.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting CourierPay server"
    );

    let processor: Arc<dyn ProcessorClient> = match (&args.processor_url, &args.processor_secret) {
        (Some(url), Some(secret)) => {
            info!(url = %url, "Using HTTP processor client");
            Arc::new(HttpProcessorClient::new(url.clone(), secret.clone())?)
        }
        (Some(_), None) => {
            anyhow::bail!("COURIERPAY_PROCESSOR_SECRET is required when a processor URL is set")
        }
        _ => {
            info!("No processor URL configured, using the in-memory mock");
            Arc::new(MockProcessor::new())
        }
    };

    let fee_policy = FeePolicy {
        platform_fee_percent: args.platform_fee_percent,
        ..FeePolicy::default()
    };

    let ledger = EscrowLedger::new();
    let notifier = Arc::new(NullNotifier);
    let state = Arc::new(AppState {
        ledger: ledger.clone(),
        processor: processor.clone(),
        ingestor: WebhookIngestor::new(ledger.clone(), args.webhook_secret.clone()),
        orchestrator: SettlementOrchestrator::new(
            ledger.clone(),
            processor.clone(),
            notifier.clone(),
            fee_policy.clone(),
        ),
        desk: DisputeDesk::new(ledger, processor, notifier),
        fee_policy,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/processor", post(processor_webhook))
        .route("/deliveries", post(register_delivery))
        .route("/deliveries/:id/status", post(set_delivery_status))
        .route("/payments", post(initiate_payment))
        .route("/payments/:id", get(get_payment))
        .route("/payments/:id/verify", post(verify_payment))
        .route("/payments/:id/settle", post(settle_payment))
        .route("/payments/:id/dispute", post(open_dispute))
        .route("/payments/:id/dispute/evidence", post(attach_evidence))
        .route("/payments/:id/dispute/resolve", post(resolve_dispute))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    info!(addr = %addr, "Server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(env_filter);
    match format {
        "json" => subscriber.with(fmt::layer().json().with_target(true)).init(),
        _ => subscriber.with(fmt::layer().pretty().with_target(true)).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

// ============================================================================
// Error Mapping
// ============================================================================

#[derive(Debug)]
struct ApiError(CourierPayError);

impl From<CourierPayError> for ApiError {
    fn from(err: CourierPayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CourierPayError::AuthenticationFailure => StatusCode::UNAUTHORIZED,
            CourierPayError::PaymentNotFound { .. }
            | CourierPayError::DeliveryNotFound { .. }
            | CourierPayError::DisputeNotFound { .. } => StatusCode::NOT_FOUND,
            CourierPayError::ValidationFailure { .. }
            | CourierPayError::IllegalTransition { .. }
            | CourierPayError::DeliveryNotCompleted { .. }
            | CourierPayError::AmountMismatch { .. }
            | CourierPayError::AmountOverflow => StatusCode::UNPROCESSABLE_ENTITY,
            CourierPayError::StateConflict { .. }
            | CourierPayError::DuplicateDeliveryPayment { .. }
            | CourierPayError::DuplicateReference { .. } => StatusCode::CONFLICT,
            CourierPayError::ExternalCallFailure { .. } => StatusCode::BAD_GATEWAY,
            CourierPayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.error_code(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_payment_id(raw: &str) -> ApiResult<PaymentId> {
    PaymentId::parse(raw).map_err(|_| {
        ApiError(CourierPayError::validation(
            "payment_id",
            "not a valid payment id",
        ))
    })
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "courierpay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Raw-body webhook endpoint; signature verification needs the exact bytes.
async fn processor_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get("x-processor-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError(CourierPayError::AuthenticationFailure))?;

    let outcome = state.ingestor.ingest(&body, signature).await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

#[derive(Deserialize)]
struct RegisterDeliveryRequest {
    customer_id: String,
    driver_id: Option<String>,
    company_id: Option<String>,
}

/// Mirror endpoint for the external delivery service.
async fn register_delivery(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterDeliveryRequest>,
) -> ApiResult<impl IntoResponse> {
    let customer_id = CustomerId::parse(&req.customer_id)
        .map_err(|_| CourierPayError::validation("customer_id", "not a valid customer id"))?;
    let mut delivery = Delivery::new(DeliveryId::new(), customer_id);
    if let Some(raw) = &req.driver_id {
        delivery.driver_id = Some(
            DriverId::parse(raw)
                .map_err(|_| CourierPayError::validation("driver_id", "not a valid driver id"))?,
        );
    }
    if let Some(raw) = &req.company_id {
        delivery.company_id = Some(
            CompanyId::parse(raw)
                .map_err(|_| CourierPayError::validation("company_id", "not a valid company id"))?,
        );
    }
    let response = serde_json::json!({ "delivery": delivery });
    state.ledger.upsert_delivery(delivery).await;
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Deserialize)]
struct SetDeliveryStatusRequest {
    status: DeliveryStatus,
}

async fn set_delivery_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SetDeliveryStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let delivery_id = DeliveryId::parse(&id)
        .map_err(|_| CourierPayError::validation("delivery_id", "not a valid delivery id"))?;
    state
        .ledger
        .set_delivery_status(&delivery_id, req.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct InitiatePaymentRequest {
    delivery_id: String,
    amount_minor: i64,
    currency: Option<String>,
}

/// Create the pending payment and hand the customer a hosted checkout URL.
/// The processor reference is persisted before the URL is returned, so the
/// webhook for this charge can never race an unknown reference.
async fn initiate_payment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitiatePaymentRequest>,
) -> ApiResult<impl IntoResponse> {
    let delivery_id = DeliveryId::parse(&req.delivery_id)
        .map_err(|_| CourierPayError::validation("delivery_id", "not a valid delivery id"))?;
    let delivery = state.ledger.delivery(&delivery_id).await?;
    let currency = req
        .currency
        .map(Currency::new)
        .unwrap_or_else(Currency::usd);
    let amount = Money::from_minor(req.amount_minor);

    let payment = state
        .ledger
        .create_payment(
            NewPayment {
                delivery_id,
                customer_id: delivery.customer_id.clone(),
                currency: currency.clone(),
                total_amount: amount,
            },
            Actor::Customer(delivery.customer_id.clone()),
        )
        .await?;

    let platform_fee = compute_split(amount, &state.fee_policy)
        .ok()
        .map(|split| split.platform_fee);
    let session = state
        .processor
        .create_checkout(CheckoutRequest {
            amount,
            currency,
            customer_id: delivery.customer_id,
            delivery_id: payment.delivery_id.clone(),
            platform_fee,
        })
        .await?;

    let payment = state
        .ledger
        .attach_processor_ref(&payment.id, session.reference.clone())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "payment_id": payment.id.to_string(),
            "reference": session.reference,
            "checkout_url": session.checkout_url,
            "state": payment.state,
        })),
    ))
}

async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let payment_id = parse_payment_id(&id)?;
    let payment = state.ledger.payment(&payment_id).await?;
    Ok(Json(serde_json::json!({ "payment": payment })))
}

/// Polling fallback for a missed webhook: ask the processor directly and
/// funnel the answer through the same outcome application path.
async fn verify_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let payment_id = parse_payment_id(&id)?;
    let payment = state.ledger.payment(&payment_id).await?;
    let reference = payment.processor_ref.clone().ok_or_else(|| {
        CourierPayError::validation("payment", "payment has no processor reference yet")
    })?;

    let outcome = state.processor.verify_charge(&reference).await?;
    let applied = state.ingestor.apply_charge_outcome(&reference, outcome).await?;
    Ok(Json(serde_json::json!({ "outcome": applied })))
}

async fn settle_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let payment_id = parse_payment_id(&id)?;
    let outcome = state
        .orchestrator
        .settle(&payment_id, Actor::System)
        .await?;
    Ok(Json(serde_json::json!({
        "payment_id": outcome.payment_id.to_string(),
        "transfer_id": outcome.transfer_id,
        "split": outcome.split,
        "already_settled": outcome.already_settled,
    })))
}

#[derive(Deserialize)]
struct OpenDisputeRequest {
    reason: String,
}

async fn open_dispute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<OpenDisputeRequest>,
) -> ApiResult<impl IntoResponse> {
    let payment_id = parse_payment_id(&id)?;
    let payment = state.ledger.payment(&payment_id).await?;
    let raised_by = Actor::Customer(payment.customer_id.clone());
    let payment = state.desk.open(&payment_id, raised_by, req.reason).await?;
    Ok(Json(serde_json::json!({ "payment": payment })))
}

#[derive(Deserialize)]
struct AttachEvidenceRequest {
    kind: String,
    content: String,
}

async fn attach_evidence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AttachEvidenceRequest>,
) -> ApiResult<impl IntoResponse> {
    let payment_id = parse_payment_id(&id)?;
    let payment = state.ledger.payment(&payment_id).await?;
    let submitted_by = Actor::Customer(payment.customer_id.clone());
    let payment = state
        .desk
        .attach_evidence(&payment_id, submitted_by, req.kind, req.content)
        .await?;
    Ok(Json(serde_json::json!({ "payment": payment })))
}

#[derive(Deserialize)]
struct ResolveDisputeRequest {
    #[serde(flatten)]
    decision: DisputeDecision,
    resolved_by: Option<String>,
}

async fn resolve_dispute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResolveDisputeRequest>,
) -> ApiResult<impl IntoResponse> {
    let payment_id = parse_payment_id(&id)?;
    let resolved_by = match req.resolved_by {
        Some(name) => Actor::Admin(name),
        None => Actor::System,
    };
    let outcome = state
        .desk
        .resolve(&payment_id, req.decision, resolved_by)
        .await?;
    Ok(Json(serde_json::json!({
        "payment_id": outcome.payment_id.to_string(),
        "final_state": outcome.final_state,
        "decision": outcome.decision,
        "refund_id": outcome.refund_id,
        "transfer_id": outcome.transfer_id,
        "already_resolved": outcome.already_resolved,
    })))
}
