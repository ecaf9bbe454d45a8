//! Ledger port: the single owner of persisted payment state
//!
//! Intents, refunds, transfers and processed webhook event ids all go through
//! [`Ledger`]. Refund reservation and event recording are atomic in every
//! implementation so concurrent requests and redelivered webhooks cannot
//! double-count money.

pub mod in_memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use in_memory::InMemoryLedger;
#[cfg(feature = "database")]
pub use postgres::PgLedger;

use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use crate::payments::types::{
    PaymentIntent, PaymentStatus, Rail, Refund, RefundSplit, RefundStatus, Transfer,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("payment intent {0} not found")]
    IntentNotFound(Uuid),

    #[error("refund {0} not found")]
    RefundNotFound(Uuid),

    #[error("transfer {0} not found")]
    TransferNotFound(Uuid),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("intent in status {0} cannot be refunded")]
    NotRefundable(PaymentStatus),

    #[error("refund of {requested} exceeds refundable balance {refundable}")]
    RefundExceedsCaptured { requested: i64, refundable: i64 },

    #[error("refund of {requested} for vendor {vendor_id} exceeds its refundable share {refundable}")]
    VendorRefundExceeded {
        vendor_id: String,
        requested: i64,
        refundable: i64,
    },

    #[error("vendor {0} is not part of this payment")]
    UnknownVendor(String),

    #[error("vendor {0} appears more than once in the refund")]
    DuplicateVendor(String),

    #[error("amounts overflow")]
    AmountOverflow,

    #[error("idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result of trying to take a vendor's transfer row for sending.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferClaim {
    /// The caller owns the row and must settle it
    Claimed(Transfer),
    /// Another run owns or already settled it; the current row
    Held(Transfer),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let kind = match err {
            LedgerError::IntentNotFound(id) => AppErrorKind::Domain(DomainError::PaymentNotFound {
                payment_intent_id: id.to_string(),
            }),
            LedgerError::RefundNotFound(id) => AppErrorKind::Domain(DomainError::PaymentNotFound {
                payment_intent_id: format!("refund:{}", id),
            }),
            LedgerError::TransferNotFound(id) => AppErrorKind::Domain(DomainError::TransferNotFound {
                transfer_id: id.to_string(),
            }),
            LedgerError::InvalidTransition { from, to } => {
                AppErrorKind::Domain(DomainError::InvalidPaymentState {
                    payment_intent_id: String::new(),
                    status: from.to_string(),
                    operation: format!("move to {}", to),
                })
            }
            LedgerError::NotRefundable(status) => {
                AppErrorKind::Domain(DomainError::InvalidPaymentState {
                    payment_intent_id: String::new(),
                    status: status.to_string(),
                    operation: "refund".to_string(),
                })
            }
            LedgerError::RefundExceedsCaptured {
                requested,
                refundable,
            }
            | LedgerError::VendorRefundExceeded {
                requested,
                refundable,
                ..
            } => AppErrorKind::Domain(DomainError::RefundExceedsCaptured {
                requested,
                refundable,
            }),
            LedgerError::UnknownVendor(vendor_id) => {
                return AppError::validation("splits.vendorId", format!("unknown vendor {}", vendor_id))
            }
            LedgerError::DuplicateVendor(vendor_id) => {
                return AppError::validation(
                    "splits.vendorId",
                    format!("vendor {} appears more than once", vendor_id),
                )
            }
            LedgerError::AmountOverflow => {
                return AppError::validation("amount", "amounts overflow")
            }
            LedgerError::DuplicateIdempotencyKey(key) => {
                return AppError::validation("idempotencyKey", format!("already used: {}", key))
            }
            LedgerError::Storage(message) => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: true,
                })
            }
        };
        AppError::new(kind)
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    // ---- intents -----------------------------------------------------------

    /// Fails with `DuplicateIdempotencyKey` when the key is already bound.
    async fn insert_intent(&self, intent: PaymentIntent) -> LedgerResult<PaymentIntent>;

    async fn get_intent(&self, id: Uuid) -> LedgerResult<Option<PaymentIntent>>;

    async fn find_intent_by_idempotency_key(
        &self,
        key: &str,
    ) -> LedgerResult<Option<PaymentIntent>>;

    async fn find_intent_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Option<PaymentIntent>>;

    /// Move an intent along the status machine. `captured_amount` is written
    /// only on the first move into `Captured`.
    async fn transition_intent(
        &self,
        id: Uuid,
        to: PaymentStatus,
        captured_amount: Option<i64>,
    ) -> LedgerResult<PaymentIntent>;

    // ---- refunds -----------------------------------------------------------

    /// Check the refund against the remaining balance and append it, atomically.
    async fn reserve_refund(&self, refund: Refund) -> LedgerResult<Refund>;

    async fn update_refund(
        &self,
        id: Uuid,
        status: RefundStatus,
        provider_reference: Option<String>,
    ) -> LedgerResult<Refund>;

    async fn find_refund_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Option<Refund>>;

    async fn refunds_for(&self, payment_intent_id: Uuid) -> LedgerResult<Vec<Refund>>;

    /// Pending refunds the rail never acknowledged, last touched before
    /// `before`, oldest first.
    async fn unacknowledged_refunds(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Refund>>;

    // ---- transfers ---------------------------------------------------------

    /// Insert each transfer unless its intent already has one for the same
    /// vendor, atomically across the whole set. Claims come back in input
    /// order.
    async fn reserve_transfers(&self, transfers: Vec<Transfer>) -> LedgerResult<Vec<TransferClaim>>;

    /// Move a failed transfer to `Pending` if it still has `attempts`
    /// attempts, so only one caller retries it.
    async fn claim_transfer(&self, id: Uuid, attempts: u32) -> LedgerResult<TransferClaim>;

    async fn upsert_transfer(&self, transfer: Transfer) -> LedgerResult<Transfer>;

    async fn get_transfer(&self, id: Uuid) -> LedgerResult<Option<Transfer>>;

    async fn find_transfers_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Vec<Transfer>>;

    async fn transfers_for(&self, payment_intent_id: Uuid) -> LedgerResult<Vec<Transfer>>;

    /// Failed transfers of still-captured intents with fewer than
    /// `max_attempts` attempts, oldest first.
    async fn failed_transfers(&self, max_attempts: u32, limit: usize)
        -> LedgerResult<Vec<Transfer>>;

    // ---- webhook idempotency ----------------------------------------------

    /// Returns `false` when the event was already recorded.
    async fn record_event(&self, rail: Rail, event_id: &str) -> LedgerResult<bool>;

    /// Forget an event so a redelivery is processed again.
    async fn release_event(&self, rail: Rail, event_id: &str) -> LedgerResult<()>;
}

// ============================================================================
// Balance rules shared by every implementation
// ============================================================================

/// Refunds that still hold money back from the captured balance.
fn counts_against_balance(refund: &Refund) -> bool {
    refund.status != RefundStatus::Failed
}

/// Sum minor-unit amounts, `None` on overflow.
pub fn checked_total<I: IntoIterator<Item = i64>>(amounts: I) -> Option<i64> {
    amounts
        .into_iter()
        .try_fold(0i64, |acc, amount| acc.checked_add(amount))
}

/// Captured amount not yet consumed by pending or succeeded refunds.
pub fn refundable_balance(intent: &PaymentIntent, refunds: &[Refund]) -> i64 {
    let captured = intent.captured_amount.unwrap_or(0);
    let refunded = checked_total(
        refunds
            .iter()
            .filter(|r| counts_against_balance(r))
            .map(|r| r.amount_minor),
    )
    .unwrap_or(i64::MAX);
    captured.saturating_sub(refunded).max(0)
}

/// A vendor's allocation not yet consumed by itemized refunds.
pub fn vendor_refundable(
    intent: &PaymentIntent,
    refunds: &[Refund],
    vendor_id: &str,
) -> Option<i64> {
    if !intent.splits.iter().any(|s| s.vendor_id == vendor_id) {
        return None;
    }
    let allocated = checked_total(
        intent
            .splits
            .iter()
            .filter(|s| s.vendor_id == vendor_id)
            .map(|s| s.allocated_amount),
    )
    .unwrap_or(i64::MAX);
    let refunded = checked_total(
        refunds
            .iter()
            .filter(|r| counts_against_balance(r))
            .flat_map(|r| r.splits.iter())
            .filter(|s| s.vendor_id == vendor_id)
            .map(RefundSplit::net_amount),
    )
    .unwrap_or(i64::MAX);
    Some(allocated.saturating_sub(refunded).max(0))
}

/// Net refund per vendor. Each vendor may appear once.
pub fn refund_by_vendor(splits: &[RefundSplit]) -> LedgerResult<BTreeMap<&str, i64>> {
    let mut by_vendor = BTreeMap::new();
    for split in splits {
        if by_vendor
            .insert(split.vendor_id.as_str(), split.net_amount())
            .is_some()
        {
            return Err(LedgerError::DuplicateVendor(split.vendor_id.clone()));
        }
    }
    Ok(by_vendor)
}

/// Validate a refund against prior refunds. Used inside each ledger's
/// critical section.
pub fn check_refund(
    intent: &PaymentIntent,
    prior: &[Refund],
    refund: &Refund,
) -> LedgerResult<()> {
    if !matches!(
        intent.status,
        PaymentStatus::Captured | PaymentStatus::PartiallyRefunded
    ) {
        return Err(LedgerError::NotRefundable(intent.status));
    }

    let refundable = refundable_balance(intent, prior);
    if refund.amount_minor > refundable {
        return Err(LedgerError::RefundExceedsCaptured {
            requested: refund.amount_minor,
            refundable,
        });
    }

    let by_vendor = refund_by_vendor(&refund.splits)?;
    checked_total(by_vendor.values().copied()).ok_or(LedgerError::AmountOverflow)?;
    for (vendor_id, requested) in by_vendor {
        let vendor_left = vendor_refundable(intent, prior, vendor_id)
            .ok_or_else(|| LedgerError::UnknownVendor(vendor_id.to_string()))?;
        if requested > vendor_left {
            return Err(LedgerError::VendorRefundExceeded {
                vendor_id: vendor_id.to_string(),
                requested,
                refundable: vendor_left,
            });
        }
    }
    Ok(())
}

/// Status an intent should carry once `refunds` are accounted for.
pub fn status_after_refunds(intent: &PaymentIntent, refunds: &[Refund]) -> PaymentStatus {
    if refundable_balance(intent, refunds) == 0 {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::PartiallyRefunded
    }
}
