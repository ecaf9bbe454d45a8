//! Rail webhook reconciliation
//!
//! Every delivery is verified, normalized, and recorded by event id before it
//! touches the ledger. A redelivered event id is acknowledged without effect.
//! Status changes only move forward along the intent state machine; an event
//! that would move an intent backwards is logged and dropped.

use crate::error::{AppError, AppErrorKind, ExternalError};
use crate::ledger::{Ledger, LedgerError};
use crate::payments::types::{
    EventKind, NormalizedEvent, PaymentIntent, PaymentStatus, Rail, TransferStatus,
};
use crate::payments::GatewayRegistry;
use crate::services::refund_coordinator::{RefundCoordinator, RefundError};
use crate::services::split_distributor::SplitDistributor;
use chrono::Utc;
use http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Unknown rail: {0}")]
    UnknownRail(String),
    #[error("Rail {0} is not configured")]
    RailNotConfigured(Rail),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Refund(#[from] RefundError),
}

impl From<WebhookProcessorError> for AppError {
    fn from(err: WebhookProcessorError) -> Self {
        match err {
            WebhookProcessorError::UnknownRail(rail) => {
                AppError::validation("rail", format!("unknown rail {}", rail))
            }
            WebhookProcessorError::RailNotConfigured(rail) => {
                AppError::validation("rail", format!("rail {} is not configured", rail))
            }
            WebhookProcessorError::InvalidSignature(message) => {
                AppError::new(AppErrorKind::External(ExternalError::WebhookSignature { message }))
            }
            WebhookProcessorError::Malformed(message) => AppError::validation("payload", message),
            WebhookProcessorError::Ledger(e) => e.into(),
            WebhookProcessorError::Refund(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Ledger state changed
    Applied { event_id: String },
    /// Event id already seen
    Duplicate { event_id: String },
    /// Recorded, but nothing to change
    Ignored { event_id: String, reason: String },
}

impl WebhookOutcome {
    fn ignored(event: &NormalizedEvent, reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            event_id: event.event_id.clone(),
            reason: reason.into(),
        }
    }

    fn applied(event: &NormalizedEvent) -> Self {
        WebhookOutcome::Applied {
            event_id: event.event_id.clone(),
        }
    }
}

pub struct WebhookProcessor {
    registry: GatewayRegistry,
    ledger: Arc<dyn Ledger>,
    refunds: Arc<RefundCoordinator>,
    distributor: Arc<SplitDistributor>,
}

impl WebhookProcessor {
    pub fn new(
        registry: GatewayRegistry,
        ledger: Arc<dyn Ledger>,
        refunds: Arc<RefundCoordinator>,
        distributor: Arc<SplitDistributor>,
    ) -> Self {
        Self {
            registry,
            ledger,
            refunds,
            distributor,
        }
    }

    pub async fn process_webhook(
        &self,
        rail_name: &str,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let rail: Rail = rail_name
            .parse()
            .map_err(|_| WebhookProcessorError::UnknownRail(rail_name.to_string()))?;
        let adapter = self
            .registry
            .get(rail)
            .ok_or(WebhookProcessorError::RailNotConfigured(rail))?;

        let verification = adapter
            .verify_webhook(payload, headers)
            .await
            .map_err(|e| WebhookProcessorError::InvalidSignature(e.to_string()))?;
        if !verification.valid {
            let reason = verification
                .reason
                .unwrap_or_else(|| "signature mismatch".to_string());
            error!(rail = %rail, reason = %reason, "Invalid webhook signature");
            return Err(WebhookProcessorError::InvalidSignature(reason));
        }

        let event = adapter
            .parse_webhook_event(payload)
            .map_err(|e| WebhookProcessorError::Malformed(e.to_string()))?;

        if !self.ledger.record_event(rail, &event.event_id).await? {
            info!(rail = %rail, event_id = %event.event_id, "Duplicate webhook event ignored");
            return Ok(WebhookOutcome::Duplicate {
                event_id: event.event_id,
            });
        }

        match self.apply_event(&event).await {
            Ok(outcome) => {
                info!(
                    rail = %rail,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    outcome = ?outcome,
                    "Webhook processed"
                );
                Ok(outcome)
            }
            Err(e) => {
                // forget the event so the rail's redelivery is processed
                if let Err(release_err) = self.ledger.release_event(rail, &event.event_id).await {
                    error!(event_id = %event.event_id, error = %release_err, "Failed to release webhook event");
                }
                error!(rail = %rail, event_id = %event.event_id, error = %e, "Webhook processing failed");
                Err(e)
            }
        }
    }

    async fn apply_event(
        &self,
        event: &NormalizedEvent,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        match &event.kind {
            EventKind::Payment(status) => self.apply_payment(event, *status).await,
            EventKind::Refund(status) => {
                let Some(reference) = event.reference.as_deref() else {
                    return Ok(WebhookOutcome::ignored(event, "refund event without reference"));
                };
                match self
                    .refunds
                    .apply_refund_status(event.rail, reference, *status)
                    .await?
                {
                    Some(_) => Ok(WebhookOutcome::applied(event)),
                    None => Ok(WebhookOutcome::ignored(event, "unknown refund")),
                }
            }
            EventKind::Transfer(status) => self.apply_transfer(event, *status).await,
            EventKind::Unhandled => {
                debug!(event_type = %event.event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::ignored(event, "unhandled event type"))
            }
        }
    }

    async fn find_intent(
        &self,
        event: &NormalizedEvent,
    ) -> Result<Option<PaymentIntent>, WebhookProcessorError> {
        if let Some(id) = event.payment_intent_id {
            if let Some(intent) = self.ledger.get_intent(id).await? {
                if intent.rail == event.rail {
                    return Ok(Some(intent));
                }
                warn!(
                    intent_id = %id,
                    intent_rail = %intent.rail,
                    event_rail = %event.rail,
                    "Webhook names an intent held on another rail"
                );
                return Ok(None);
            }
        }
        match event.reference.as_deref() {
            Some(reference) => Ok(self
                .ledger
                .find_intent_by_reference(event.rail, reference)
                .await?),
            None => Ok(None),
        }
    }

    async fn apply_payment(
        &self,
        event: &NormalizedEvent,
        status: PaymentStatus,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let Some(intent) = self.find_intent(event).await? else {
            warn!(event_id = %event.event_id, reference = ?event.reference, "Webhook for unknown payment intent");
            return Ok(WebhookOutcome::ignored(event, "unknown payment intent"));
        };

        if intent.status == status && status != PaymentStatus::PartiallyRefunded {
            return Ok(WebhookOutcome::ignored(event, "status unchanged"));
        }
        if !intent.status.can_transition_to(status) {
            warn!(
                intent_id = %intent.id,
                current = %intent.status,
                reported = %status,
                event_id = %event.event_id,
                "Suspicious out-of-order webhook, status not regressed"
            );
            return Ok(WebhookOutcome::ignored(
                event,
                format!("cannot move {} to {}", intent.status, status),
            ));
        }

        let captured_amount = if status == PaymentStatus::Captured {
            event.amount_minor
        } else {
            None
        };
        let updated = self
            .ledger
            .transition_intent(intent.id, status, captured_amount)
            .await?;
        info!(intent_id = %updated.id, from = %intent.status, to = %updated.status, "Payment intent updated");

        if updated.status == PaymentStatus::Captured && updated.has_splits() {
            let dedupe_key = format!("settle:{}", updated.id);
            // vendor payouts never fail the webhook; the retry worker picks up failures
            match self.distributor.distribute(updated.id, &dedupe_key).await {
                Ok(charge) => {
                    let failed = charge.failed_vendors();
                    if !failed.is_empty() {
                        warn!(intent_id = %updated.id, failed_vendors = ?failed, "Post-capture distribution incomplete");
                    }
                }
                Err(e) => {
                    warn!(intent_id = %updated.id, error = %e, "Post-capture distribution failed");
                }
            }
        }

        Ok(WebhookOutcome::applied(event))
    }

    async fn apply_transfer(
        &self,
        event: &NormalizedEvent,
        status: TransferStatus,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let Some(reference) = event.reference.as_deref() else {
            return Ok(WebhookOutcome::ignored(event, "transfer event without reference"));
        };
        let transfers = self
            .ledger
            .find_transfers_by_reference(event.rail, reference)
            .await?;
        if transfers.is_empty() {
            return Ok(WebhookOutcome::ignored(event, "unknown transfer"));
        }

        let mut changed = false;
        for mut transfer in transfers {
            if transfer.status == status {
                continue;
            }
            if transfer.status == TransferStatus::Paid && status == TransferStatus::InTransit {
                warn!(transfer_id = %transfer.id, "Ignoring in-transit event for a paid transfer");
                continue;
            }
            transfer.status = status;
            transfer.outcome_unknown = false;
            transfer.failure_reason = match status {
                TransferStatus::Failed => Some(format!("rail reported {}", event.event_type)),
                _ => None,
            };
            transfer.updated_at = Utc::now();
            let transfer = self.ledger.upsert_transfer(transfer).await?;
            if transfer.status == TransferStatus::Failed {
                warn!(
                    transfer_id = %transfer.id,
                    vendor_id = %transfer.vendor_id,
                    "Vendor transfer failed at the rail"
                );
            }
            changed = true;
        }

        if changed {
            Ok(WebhookOutcome::applied(event))
        } else {
            Ok(WebhookOutcome::ignored(event, "transfer status unchanged"))
        }
    }
}
