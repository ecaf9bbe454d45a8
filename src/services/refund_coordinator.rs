//! Multi-vendor refunds
//!
//! A refund is reserved against the intent's remaining balance in the ledger
//! before the rail is called, so two concurrent refunds can never together
//! exceed what was captured. Refunds always go back through the rail that
//! captured the payment.
//!
//! The reservation is released only when the rail definitively refuses the
//! refund. A timeout or retryable error leaves it pending and reserved until
//! it is resubmitted under the same idempotency key.

use crate::error::{AppError, AppErrorKind, DomainError};
use crate::ledger::{checked_total, refundable_balance, status_after_refunds, Ledger, LedgerError};
use crate::payments::error::PaymentError;
use crate::payments::types::{
    Money, PaymentIntent, PaymentStatus, Rail, Refund, RefundReason, RefundRequest, RefundSplit,
    RefundStatus,
};
use crate::payments::GatewayRegistry;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("payment intent {0} not found")]
    IntentNotFound(Uuid),

    #[error("payment intent {id} is {status} and cannot be refunded")]
    NotRefundable { id: Uuid, status: PaymentStatus },

    #[error("rail {0} is not configured")]
    RailNotConfigured(Rail),

    #[error("rail rejected refund: {0}")]
    Rail(#[from] PaymentError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<RefundError> for AppError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::Validation { field, message } => AppError::validation(field, message),
            RefundError::IntentNotFound(id) => AppError::payment_not_found(id.to_string()),
            RefundError::NotRefundable { id, status } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidPaymentState {
                    payment_intent_id: id.to_string(),
                    status: status.to_string(),
                    operation: "refund".to_string(),
                }))
            }
            RefundError::RailNotConfigured(rail) => {
                AppError::new(AppErrorKind::Infrastructure(
                    crate::error::InfrastructureError::Configuration {
                        message: format!("rail {} is not configured", rail),
                    },
                ))
            }
            RefundError::Rail(e) => e.into(),
            RefundError::Ledger(e) => e.into(),
        }
    }
}

pub type RefundResult<T> = Result<T, RefundError>;

/// Refund input as accepted from booking services.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiVendorRefund {
    pub payment_intent_id: Uuid,
    /// Omitted means the full remaining balance
    #[serde(default)]
    pub amount: Option<i64>,
    pub reason: RefundReason,
    #[serde(default)]
    pub splits: Option<Vec<RefundSplit>>,
}

pub struct RefundCoordinator {
    registry: GatewayRegistry,
    ledger: Arc<dyn Ledger>,
    rail_timeout: Duration,
}

impl RefundCoordinator {
    pub fn new(registry: GatewayRegistry, ledger: Arc<dyn Ledger>, rail_timeout: Duration) -> Self {
        Self {
            registry,
            ledger,
            rail_timeout,
        }
    }

    pub async fn handle_multi_vendor_refund(&self, request: MultiVendorRefund) -> RefundResult<Refund> {
        let intent = self
            .ledger
            .get_intent(request.payment_intent_id)
            .await?
            .ok_or(RefundError::IntentNotFound(request.payment_intent_id))?;
        if !matches!(
            intent.status,
            PaymentStatus::Captured | PaymentStatus::PartiallyRefunded
        ) {
            return Err(RefundError::NotRefundable {
                id: intent.id,
                status: intent.status,
            });
        }

        let splits = request.splits.unwrap_or_default();
        let amount = self
            .resolve_amount(&intent, request.amount, &splits)
            .await?;
        if self.registry.get(intent.rail).is_none() {
            error!(intent_id = %intent.id, rail = %intent.rail, "capturing rail is no longer configured");
            return Err(RefundError::RailNotConfigured(intent.rail));
        }

        let now = Utc::now();
        let refund = Refund {
            id: Uuid::new_v4(),
            payment_intent_id: intent.id,
            rail: intent.rail,
            amount_minor: amount,
            currency: intent.currency.clone(),
            status: RefundStatus::Pending,
            reason: request.reason,
            splits,
            provider_reference: None,
            created_at: now,
            updated_at: now,
        };
        // balance check and append happen atomically in the ledger
        let refund = self.ledger.reserve_refund(refund).await?;
        self.submit(&intent, refund).await
    }

    /// Send a pending refund the rail never acknowledged again, under its
    /// original idempotency key. Anything else is returned untouched.
    pub async fn resubmit_refund(&self, refund: Refund) -> RefundResult<Refund> {
        if refund.status != RefundStatus::Pending || refund.provider_reference.is_some() {
            return Ok(refund);
        }
        let intent = self
            .ledger
            .get_intent(refund.payment_intent_id)
            .await?
            .ok_or(RefundError::IntentNotFound(refund.payment_intent_id))?;
        info!(
            intent_id = %intent.id,
            refund_id = %refund.id,
            rail = %intent.rail,
            "resubmitting unacknowledged refund"
        );
        self.submit(&intent, refund).await
    }

    async fn submit(&self, intent: &PaymentIntent, refund: Refund) -> RefundResult<Refund> {
        let adapter = self
            .registry
            .get(intent.rail)
            .ok_or(RefundError::RailNotConfigured(intent.rail))?;

        let rail_request = RefundRequest {
            provider_reference: intent.provider_reference.clone(),
            amount: Money::new(refund.amount_minor, refund.currency.clone()),
            reason: refund.reason,
            idempotency_key: refund.id.to_string(),
        };
        let response = match tokio::time::timeout(self.rail_timeout, adapter.create_refund(rail_request)).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::TimeoutError {
                timeout_secs: self.rail_timeout.as_secs(),
            }),
        };

        match response {
            Ok(response) => {
                let refund = self
                    .ledger
                    .update_refund(refund.id, response.status, Some(response.provider_reference))
                    .await?;
                if refund.status != RefundStatus::Failed {
                    self.sync_intent_status(intent.id).await?;
                }
                info!(
                    intent_id = %intent.id,
                    refund_id = %refund.id,
                    rail = %intent.rail,
                    amount = refund.amount_minor,
                    status = refund.status.as_str(),
                    "refund submitted"
                );
                Ok(refund)
            }
            Err(e) if e.is_retryable() => {
                // the rail may have taken it; keep the balance reserved
                let refund = self
                    .ledger
                    .update_refund(refund.id, RefundStatus::Pending, None)
                    .await?;
                self.sync_intent_status(intent.id).await?;
                warn!(
                    intent_id = %intent.id,
                    refund_id = %refund.id,
                    rail = %intent.rail,
                    error = %e,
                    "refund outcome unknown, held pending for resubmission"
                );
                Ok(refund)
            }
            Err(e) => {
                self.ledger
                    .update_refund(refund.id, RefundStatus::Failed, None)
                    .await?;
                warn!(
                    intent_id = %intent.id,
                    refund_id = %refund.id,
                    rail = %intent.rail,
                    error = %e,
                    "rail refused refund, balance released"
                );
                Err(RefundError::Rail(e))
            }
        }
    }

    /// Apply a rail-reported refund status. Returns `None` when the reference
    /// belongs to no refund we issued.
    pub async fn apply_refund_status(
        &self,
        rail: Rail,
        reference: &str,
        status: RefundStatus,
    ) -> RefundResult<Option<Refund>> {
        let Some(refund) = self.ledger.find_refund_by_reference(rail, reference).await? else {
            return Ok(None);
        };
        if refund.status == status {
            return Ok(Some(refund));
        }
        if refund.status != RefundStatus::Pending {
            warn!(
                refund_id = %refund.id,
                current = refund.status.as_str(),
                reported = status.as_str(),
                "ignoring refund status change out of a settled state"
            );
            return Ok(Some(refund));
        }

        let refund = self
            .ledger
            .update_refund(refund.id, status, None)
            .await?;
        self.sync_intent_status(refund.payment_intent_id).await?;
        info!(
            refund_id = %refund.id,
            intent_id = %refund.payment_intent_id,
            status = status.as_str(),
            "refund status updated"
        );
        Ok(Some(refund))
    }

    async fn resolve_amount(
        &self,
        intent: &PaymentIntent,
        amount: Option<i64>,
        splits: &[RefundSplit],
    ) -> RefundResult<i64> {
        let mut seen = HashSet::new();
        for split in splits {
            if !seen.insert(split.vendor_id.as_str()) {
                return Err(validation(
                    "splits.vendorId",
                    format!("vendor {} appears more than once", split.vendor_id),
                ));
            }
            if split.refund_amount <= 0 {
                return Err(validation("splits.refundAmount", "must be greater than zero"));
            }
            if split.fee_deduction < 0 || split.fee_deduction > split.refund_amount {
                return Err(validation(
                    "splits.feeDeduction",
                    "must be between zero and the refund amount",
                ));
            }
        }

        if !splits.is_empty() {
            let net = checked_total(splits.iter().map(RefundSplit::net_amount))
                .ok_or_else(|| validation("splits.refundAmount", "amounts overflow"))?;
            if net <= 0 {
                return Err(validation("splits", "refund nets to zero after fee deductions"));
            }
            if let Some(amount) = amount {
                if amount != net {
                    return Err(validation(
                        "amount",
                        format!("must equal the net of the itemized splits ({})", net),
                    ));
                }
            }
            return Ok(net);
        }

        match amount {
            Some(amount) if amount <= 0 => Err(validation("amount", "must be greater than zero")),
            Some(amount) => Ok(amount),
            None => {
                let refunds = self.ledger.refunds_for(intent.id).await?;
                let remaining = refundable_balance(intent, &refunds);
                if remaining == 0 {
                    return Err(validation("amount", "nothing left to refund"));
                }
                Ok(remaining)
            }
        }
    }

    async fn sync_intent_status(&self, intent_id: Uuid) -> RefundResult<()> {
        let intent = self
            .ledger
            .get_intent(intent_id)
            .await?
            .ok_or(RefundError::IntentNotFound(intent_id))?;
        let refunds = self.ledger.refunds_for(intent_id).await?;
        let target = status_after_refunds(&intent, &refunds);
        if target == intent.status {
            return Ok(());
        }
        if !intent.status.can_transition_to(target) {
            warn!(
                intent_id = %intent_id,
                from = %intent.status,
                to = %target,
                "refund would move intent backwards, leaving status"
            );
            return Ok(());
        }
        self.ledger.transition_intent(intent_id, target, None).await?;
        Ok(())
    }
}

fn validation(field: &str, message: impl Into<String>) -> RefundError {
    RefundError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}
