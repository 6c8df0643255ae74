//! Error types for CourierPay
//!
//! Nothing in this engine silently swallows a financial-state error; every
//! rejected operation returns a typed reason to its caller.

use crate::PaymentState;
use thiserror::Error;

/// Result type for CourierPay operations
pub type Result<T> = std::result::Result<T, CourierPayError>;

/// CourierPay error types
#[derive(Debug, Clone, Error)]
pub enum CourierPayError {
    // ========================================================================
    // Boundary Errors
    // ========================================================================

    /// Bad or missing webhook signature. Deliberately carries no detail so
    /// the response cannot leak whether a reference existed.
    #[error("Webhook authentication failed")]
    AuthenticationFailure,

    /// Malformed input rejected before any mutation
    #[error("Validation failed: {field} - {reason}")]
    ValidationFailure { field: String, reason: String },

    // ========================================================================
    // State Machine Errors
    // ========================================================================

    /// Transition not listed in the state machine
    #[error("Illegal transition for payment {payment_id}: {from:?} -> {attempted:?}")]
    IllegalTransition {
        payment_id: String,
        from: PaymentState,
        attempted: PaymentState,
    },

    /// A concurrent writer won the compare-and-swap; safe to retry or no-op
    #[error("Payment {payment_id} state changed concurrently: expected {expected:?}, found {found:?}")]
    StateConflict {
        payment_id: String,
        expected: PaymentState,
        found: PaymentState,
    },

    // ========================================================================
    // Reconciliation Errors
    // ========================================================================

    /// Processor-confirmed amount differs from the requested amount
    #[error("Amount mismatch for {reference}: expected {expected}, processor confirmed {confirmed}")]
    AmountMismatch {
        reference: String,
        expected: i64,
        confirmed: i64,
    },

    // ========================================================================
    // Lookup Errors
    // ========================================================================

    /// Payment not found
    #[error("Payment {payment_id} not found")]
    PaymentNotFound { payment_id: String },

    /// Delivery not found
    #[error("Delivery {delivery_id} not found")]
    DeliveryNotFound { delivery_id: String },

    /// Delivery has not reached its completed status
    #[error("Delivery {delivery_id} is not completed (status: {status})")]
    DeliveryNotCompleted { delivery_id: String, status: String },

    /// A payment already exists for this delivery (1:1 invariant)
    #[error("Delivery {delivery_id} already has a payment")]
    DuplicateDeliveryPayment { delivery_id: String },

    /// Processor reference already attached to another payment
    #[error("Processor reference {reference} is already in use")]
    DuplicateReference { reference: String },

    /// No dispute open on the payment
    #[error("Payment {payment_id} has no open dispute")]
    DisputeNotFound { payment_id: String },

    // ========================================================================
    // External Errors
    // ========================================================================

    /// Network/processor error on an outbound call; retriable with the same
    /// idempotency key
    #[error("External call failed during {operation}: {reason}")]
    ExternalCallFailure { operation: String, reason: String },

    // ========================================================================
    // General Errors
    // ========================================================================

    /// Amount arithmetic overflow
    #[error("Amount overflow during arithmetic operation")]
    AmountOverflow,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CourierPayError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an external-call error
    pub fn external(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExternalCallFailure {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is safe to retry (same idempotency key)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ExternalCallFailure { .. } | Self::StateConflict { .. } | Self::Internal { .. }
        )
    }

    /// Get an error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            Self::ValidationFailure { .. } => "VALIDATION_FAILURE",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::StateConflict { .. } => "STATE_CONFLICT",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::PaymentNotFound { .. } => "PAYMENT_NOT_FOUND",
            Self::DeliveryNotFound { .. } => "DELIVERY_NOT_FOUND",
            Self::DeliveryNotCompleted { .. } => "DELIVERY_NOT_COMPLETED",
            Self::DuplicateDeliveryPayment { .. } => "DUPLICATE_DELIVERY_PAYMENT",
            Self::DuplicateReference { .. } => "DUPLICATE_REFERENCE",
            Self::DisputeNotFound { .. } => "DISPUTE_NOT_FOUND",
            Self::ExternalCallFailure { .. } => "EXTERNAL_CALL_FAILURE",
            Self::AmountOverflow => "AMOUNT_OVERFLOW",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
