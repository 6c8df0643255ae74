//! CourierPay Types - Canonical domain types for escrow payment settlement
//!
//! This crate contains all foundational types for CourierPay with zero
//! dependencies on other courierpay crates. It defines the type system for:
//!
//! - Identity types (PaymentId, DeliveryId, CompanyId, etc.)
//! - Money in integer minor currency units
//! - The Payment ledger entity, its state machine and audit log
//! - Delivery, company and driver collaborator aggregates
//! - Dispute records and resolutions
//!
//! # Architectural Invariants
//!
//! 1. `platform_fee + company_amount == total_amount` once a split exists
//! 2. A payment is released or refunded at most once; re-entry is a no-op
//! 3. Every state transition appends exactly one audit entry
//! 4. No component writes the `state` field outside the ledger choke point

pub mod audit;
pub mod delivery;
pub mod dispute;
pub mod error;
pub mod identity;
pub mod money;
pub mod payment;
pub mod party;

pub use audit::*;
pub use delivery::*;
pub use dispute::*;
pub use error::*;
pub use identity::*;
pub use money::*;
pub use payment::*;
pub use party::*;
