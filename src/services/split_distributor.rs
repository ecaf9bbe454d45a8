//! Marketplace fund distribution
//!
//! Moves each vendor's net share once a payment is captured, through whatever
//! the capturing rail supports:
//!
//! - sub-account routing: the rail already split the charge, so transfers are
//!   only recorded
//! - post-capture transfer: one transfer per vendor
//! - multi-receiver payment: one batch naming every vendor plus the platform
//!
//! Each vendor gets exactly one transfer row per intent, reserved in the
//! ledger before any rail call, so concurrent runs never pay a vendor twice.
//! Every outbound call carries a dedupe key. A failure that may have reached
//! the rail (timeout, retryable error) is retried under the same key so the
//! rail can dedupe it; only a definitive rejection earns a fresh key. A vendor
//! whose transfer fails is retried on its own later; sibling transfers are
//! left alone.

use crate::config::env_or;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::ledger::{Ledger, LedgerError, TransferClaim};
use crate::payments::error::PaymentError;
use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{
    Money, MultiReceiverRequest, PaymentIntent, PaymentStatus, Rail, Receiver, SplitCalculation,
    SplitCapability, Transfer, TransferRequest, TransferStatus,
};
use crate::payments::GatewayRegistry;
use crate::services::split_calculator::{calculate_splits, total_platform_fee, validate_splits, SplitError};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Platform's own receiving account per rail, for the fee leg of
    /// multi-receiver payments
    pub platform_accounts: BTreeMap<Rail, String>,
    /// Attempts after which a failed transfer is left for manual settlement
    pub max_transfer_attempts: u32,
    /// Upper bound on one transfer call
    pub transfer_timeout_secs: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            platform_accounts: BTreeMap::new(),
            max_transfer_attempts: 5,
            transfer_timeout_secs: 15,
        }
    }
}

impl DistributorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let platform_accounts = Rail::ALL
            .iter()
            .filter_map(|rail| {
                let key = format!("PLATFORM_{}_ACCOUNT", rail.as_str().to_uppercase());
                std::env::var(key)
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|account| (*rail, account))
            })
            .collect();

        Self {
            platform_accounts,
            max_transfer_attempts: env_or("TRANSFER_MAX_ATTEMPTS", defaults.max_transfer_attempts),
            transfer_timeout_secs: env_or("TRANSFER_TIMEOUT_SECS", defaults.transfer_timeout_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("payment intent {0} not found")]
    IntentNotFound(Uuid),

    #[error("payment intent {id} is {status}, distribution needs a captured payment")]
    NotCaptured { id: Uuid, status: PaymentStatus },

    #[error("payment intent {0} has no vendor splits")]
    NoSplits(Uuid),

    #[error("rail {0} is not configured")]
    RailNotConfigured(Rail),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("dedupe key must not be empty")]
    EmptyDedupeKey,

    #[error("transfer {0} not found")]
    TransferNotFound(Uuid),

    #[error("transfer {id} is {status}, only failed transfers are retried")]
    NotRetryable { id: Uuid, status: &'static str },

    #[error("transfer {id} already attempted {attempts} times")]
    RetriesExhausted { id: Uuid, attempts: u32 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<DistributionError> for AppError {
    fn from(err: DistributionError) -> Self {
        match err {
            DistributionError::IntentNotFound(id) => AppError::payment_not_found(id.to_string()),
            DistributionError::NotCaptured { id, status } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidPaymentState {
                    payment_intent_id: id.to_string(),
                    status: status.to_string(),
                    operation: "distribute".to_string(),
                }))
            }
            DistributionError::TransferNotFound(id) => {
                AppError::new(AppErrorKind::Domain(DomainError::TransferNotFound {
                    transfer_id: id.to_string(),
                }))
            }
            DistributionError::NotRetryable { id, status } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidPaymentState {
                    payment_intent_id: id.to_string(),
                    status: status.to_string(),
                    operation: "retry transfer".to_string(),
                }))
            }
            DistributionError::Split(e) => e.into(),
            DistributionError::Ledger(e) => e.into(),
            other => AppError::validation("distribution", other.to_string()),
        }
    }
}

pub type DistributionResult<T> = Result<T, DistributionError>;

/// Per-vendor result of one distribution run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorTransferOutcome {
    pub vendor_id: String,
    pub transfer_id: Uuid,
    pub status: TransferStatus,
    pub amount_minor: i64,
    #[serde(skip_serializing)]
    pub transfer_reference: Option<String>,
    pub error: Option<String>,
    /// An earlier or concurrent run already handled this vendor
    pub reused: bool,
}

impl VendorTransferOutcome {
    fn from_transfer(transfer: &Transfer, reused: bool) -> Self {
        Self {
            vendor_id: transfer.vendor_id.clone(),
            transfer_id: transfer.id,
            status: transfer.status,
            amount_minor: transfer.amount_minor,
            transfer_reference: transfer.transfer_reference.clone(),
            error: transfer.failure_reason.clone(),
            reused,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceCharge {
    pub payment_intent_id: Uuid,
    pub rail: Rail,
    pub capability: SplitCapability,
    pub currency: String,
    pub total_amount: i64,
    pub platform_fee: i64,
    pub splits: Vec<SplitCalculation>,
    pub transfers: Vec<VendorTransferOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_reference: Option<String>,
}

impl MarketplaceCharge {
    pub fn failed_vendors(&self) -> Vec<&str> {
        self.transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Failed)
            .map(|t| t.vendor_id.as_str())
            .collect()
    }
}

/// Why a rail call did not go through.
#[derive(Debug, Clone)]
struct RailFailure {
    reason: String,
    /// The rail may have acted on the request anyway
    outcome_unknown: bool,
}

impl RailFailure {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            outcome_unknown: false,
        }
    }

    fn timed_out(secs: u64) -> Self {
        Self {
            reason: format!("timed out after {}s", secs),
            outcome_unknown: true,
        }
    }

    fn from_error(err: &PaymentError) -> Self {
        Self {
            reason: err.to_string(),
            outcome_unknown: err.is_retryable(),
        }
    }
}

type RailOutcome = Result<(String, TransferStatus), RailFailure>;

pub struct SplitDistributor {
    registry: GatewayRegistry,
    ledger: Arc<dyn Ledger>,
    config: DistributorConfig,
}

impl SplitDistributor {
    pub fn new(registry: GatewayRegistry, ledger: Arc<dyn Ledger>, config: DistributorConfig) -> Self {
        Self {
            registry,
            ledger,
            config,
        }
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Distribute a captured intent's splits. Once any refund has been taken
    /// against the intent, vendor money no longer moves automatically.
    pub async fn distribute(
        &self,
        payment_intent_id: Uuid,
        dedupe_key: &str,
    ) -> DistributionResult<MarketplaceCharge> {
        if dedupe_key.trim().is_empty() {
            return Err(DistributionError::EmptyDedupeKey);
        }

        let intent = self
            .ledger
            .get_intent(payment_intent_id)
            .await?
            .ok_or(DistributionError::IntentNotFound(payment_intent_id))?;
        ensure_captured(&intent)?;
        if !intent.has_splits() {
            return Err(DistributionError::NoSplits(intent.id));
        }
        let captured = intent.captured_amount.unwrap_or(intent.amount_minor);
        validate_splits(&intent.splits, captured)?;

        let adapter = self
            .registry
            .get(intent.rail)
            .ok_or(DistributionError::RailNotConfigured(intent.rail))?;
        let calculations = calculate_splits(&intent.splits);
        let capability = adapter.capability();
        let claims = self
            .claim_vendors(&intent, &calculations, capability, dedupe_key)
            .await?;

        let (transfers, batch_reference) = match capability {
            SplitCapability::SubAccountRouting => (record_routed(&intent, claims), None),
            SplitCapability::PostCaptureTransfer => (
                self.transfer_each(adapter.as_ref(), &intent, claims).await?,
                None,
            ),
            SplitCapability::MultiReceiverPayment => {
                self.submit_batches(adapter.as_ref(), &intent, claims, dedupe_key)
                    .await?
            }
        };

        let charge = MarketplaceCharge {
            payment_intent_id: intent.id,
            rail: intent.rail,
            capability,
            currency: intent.currency.to_string(),
            total_amount: captured,
            platform_fee: total_platform_fee(&calculations),
            splits: calculations,
            transfers,
            batch_reference,
        };

        let failed = charge.failed_vendors();
        if failed.is_empty() {
            info!(
                intent_id = %charge.payment_intent_id,
                rail = %charge.rail,
                vendors = charge.transfers.len(),
                "marketplace split distributed"
            );
        } else {
            warn!(
                intent_id = %charge.payment_intent_id,
                rail = %charge.rail,
                failed_vendors = ?failed,
                "marketplace split distributed with vendor failures"
            );
        }
        Ok(charge)
    }

    /// Retry one failed transfer. The updated transfer is returned whether or
    /// not this attempt succeeded.
    pub async fn retry_transfer(&self, transfer_id: Uuid) -> DistributionResult<Transfer> {
        let transfer = self
            .ledger
            .get_transfer(transfer_id)
            .await?
            .ok_or(DistributionError::TransferNotFound(transfer_id))?;
        if transfer.status != TransferStatus::Failed {
            return Err(DistributionError::NotRetryable {
                id: transfer.id,
                status: transfer.status.as_str(),
            });
        }
        if transfer.attempts >= self.config.max_transfer_attempts {
            return Err(DistributionError::RetriesExhausted {
                id: transfer.id,
                attempts: transfer.attempts,
            });
        }

        let intent = self
            .ledger
            .get_intent(transfer.payment_intent_id)
            .await?
            .ok_or(DistributionError::IntentNotFound(transfer.payment_intent_id))?;
        ensure_captured(&intent)?;
        let adapter = self
            .registry
            .get(transfer.rail)
            .ok_or(DistributionError::RailNotConfigured(transfer.rail))?;

        let transfer = match self.ledger.claim_transfer(transfer.id, transfer.attempts).await? {
            TransferClaim::Claimed(transfer) => transfer,
            TransferClaim::Held(current) => {
                return Err(DistributionError::NotRetryable {
                    id: current.id,
                    status: current.status.as_str(),
                })
            }
        };

        let batched = adapter.capability() == SplitCapability::MultiReceiverPayment;
        let updated = match (batched, transfer.outcome_unknown, transfer.batch_key.clone()) {
            (true, true, Some(batch_key)) => {
                let (mut updated, _) = self
                    .resend_batch(adapter.as_ref(), &intent, batch_key, vec![transfer])
                    .await?;
                updated.pop()
            }
            (true, _, _) => {
                let key = attempt_key(&transfer);
                let platform_fee = self.platform_fee_owed(&intent).await?;
                let (mut updated, _) = self
                    .send_batch(adapter.as_ref(), &intent, key, vec![transfer], &[], platform_fee)
                    .await?;
                updated.pop()
            }
            (false, _, _) => {
                let key = attempt_key(&transfer);
                let result = self.send_single(adapter.as_ref(), &intent, &transfer, &key).await;
                Some(self.finish_transfer(transfer, key, result).await?)
            }
        };
        let updated = updated.ok_or(DistributionError::TransferNotFound(transfer_id))?;

        if updated.status == TransferStatus::Failed {
            warn!(
                transfer_id = %updated.id,
                vendor_id = %updated.vendor_id,
                attempts = updated.attempts,
                outcome_unknown = updated.outcome_unknown,
                error = ?updated.failure_reason,
                "transfer retry failed"
            );
        } else {
            info!(
                transfer_id = %updated.id,
                vendor_id = %updated.vendor_id,
                attempts = updated.attempts,
                "transfer retry succeeded"
            );
        }
        Ok(updated)
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Take ownership of every vendor row this run should send. Vendors with
    /// no row yet are reserved together; failed rows under the attempt
    /// ceiling are claimed one by one. Everything else comes back `Held`.
    async fn claim_vendors(
        &self,
        intent: &PaymentIntent,
        calculations: &[SplitCalculation],
        capability: SplitCapability,
        dedupe_key: &str,
    ) -> DistributionResult<Vec<TransferClaim>> {
        let routed = capability == SplitCapability::SubAccountRouting;
        let existing: HashMap<String, Transfer> = self
            .ledger
            .transfers_for(intent.id)
            .await?
            .into_iter()
            .map(|t| (t.vendor_id.clone(), t))
            .collect();

        let mut claims = Vec::with_capacity(calculations.len());
        let mut fresh = Vec::new();
        for calc in calculations {
            match existing.get(&calc.vendor_id) {
                Some(transfer)
                    if !routed
                        && transfer.status == TransferStatus::Failed
                        && transfer.attempts < self.config.max_transfer_attempts =>
                {
                    claims.push(self.ledger.claim_transfer(transfer.id, transfer.attempts).await?);
                }
                Some(transfer) => claims.push(TransferClaim::Held(transfer.clone())),
                None if calc.vendor_net_amount <= 0 && !routed => {}
                None if routed => fresh.push(routed_transfer(intent, calc, dedupe_key)),
                None => fresh.push(new_transfer(
                    intent,
                    calc,
                    vendor_key(dedupe_key, &calc.vendor_id),
                )),
            }
        }
        if !fresh.is_empty() {
            claims.extend(self.ledger.reserve_transfers(fresh).await?);
        }
        Ok(claims)
    }

    // =========================================================================
    // Capability paths
    // =========================================================================

    async fn transfer_each(
        &self,
        adapter: &dyn GatewayAdapter,
        intent: &PaymentIntent,
        claims: Vec<TransferClaim>,
    ) -> DistributionResult<Vec<VendorTransferOutcome>> {
        let mut outcomes = Vec::with_capacity(claims.len());
        for claim in claims {
            let transfer = match claim {
                TransferClaim::Held(transfer) => {
                    outcomes.push(VendorTransferOutcome::from_transfer(&transfer, true));
                    continue;
                }
                TransferClaim::Claimed(transfer) => transfer,
            };

            let key = attempt_key(&transfer);
            let result = self.send_single(adapter, intent, &transfer, &key).await;
            let transfer = self.finish_transfer(transfer, key, result).await?;
            if transfer.status == TransferStatus::Failed {
                warn!(
                    intent_id = %intent.id,
                    vendor_id = %transfer.vendor_id,
                    outcome_unknown = transfer.outcome_unknown,
                    error = ?transfer.failure_reason,
                    "vendor transfer failed"
                );
            }
            outcomes.push(VendorTransferOutcome::from_transfer(&transfer, false));
        }
        Ok(outcomes)
    }

    async fn submit_batches(
        &self,
        adapter: &dyn GatewayAdapter,
        intent: &PaymentIntent,
        claims: Vec<TransferClaim>,
        dedupe_key: &str,
    ) -> DistributionResult<(Vec<VendorTransferOutcome>, Option<String>)> {
        let mut outcomes = Vec::with_capacity(claims.len());
        let mut fresh = Vec::new();
        let mut rebatch = Vec::new();
        let mut resend: BTreeMap<String, Vec<Transfer>> = BTreeMap::new();
        for claim in claims {
            match claim {
                TransferClaim::Held(transfer) => {
                    outcomes.push(VendorTransferOutcome::from_transfer(&transfer, true));
                }
                TransferClaim::Claimed(transfer) if transfer.attempts == 0 => fresh.push(transfer),
                TransferClaim::Claimed(transfer) => match transfer.batch_key.clone() {
                    Some(batch_key) if transfer.outcome_unknown => {
                        resend.entry(batch_key).or_default().push(transfer)
                    }
                    _ => rebatch.push(transfer),
                },
            }
        }

        let mut updated = Vec::new();
        let mut batch_reference = None;
        for (batch_key, members) in resend {
            let (sent, reference) = self.resend_batch(adapter, intent, batch_key, members).await?;
            updated.extend(sent);
            batch_reference = batch_reference.or(reference);
        }

        // the platform's fee leg rides on at most one live batch per intent
        let mut platform_fee = if fresh.is_empty() && rebatch.is_empty() {
            0
        } else {
            self.platform_fee_owed(intent).await?
        };
        if !fresh.is_empty() {
            let (sent, reference) = self
                .send_batch(adapter, intent, dedupe_key.to_string(), fresh, &[], platform_fee)
                .await?;
            if sent.iter().any(Transfer::holds_platform_fee) {
                platform_fee = 0;
            }
            updated.extend(sent);
            batch_reference = batch_reference.or(reference);
        }
        if !rebatch.is_empty() {
            let attempt = rebatch.iter().map(|t| t.attempts).max().unwrap_or(0) + 1;
            let batch_key = format!("{}:{}", dedupe_key, attempt);
            let (sent, reference) = self
                .send_batch(adapter, intent, batch_key, rebatch, &[], platform_fee)
                .await?;
            updated.extend(sent);
            batch_reference = batch_reference.or(reference);
        }

        outcomes.extend(
            updated
                .iter()
                .map(|t| VendorTransferOutcome::from_transfer(t, false)),
        );
        Ok((outcomes, batch_reference))
    }

    /// Send the batch `batch_key` again exactly as first submitted, so the
    /// rail answers from its dedupe record rather than paying twice.
    async fn resend_batch(
        &self,
        adapter: &dyn GatewayAdapter,
        intent: &PaymentIntent,
        batch_key: String,
        members: Vec<Transfer>,
    ) -> DistributionResult<(Vec<Transfer>, Option<String>)> {
        let riders: Vec<Transfer> = self
            .ledger
            .transfers_for(intent.id)
            .await?
            .into_iter()
            .filter(|t| {
                t.batch_key.as_deref() == Some(batch_key.as_str())
                    && !members.iter().any(|m| m.id == t.id)
            })
            .collect();
        let platform_fee = members.first().map(|t| t.batch_platform_fee).unwrap_or(0);
        debug!(
            intent_id = %intent.id,
            batch_key = %batch_key,
            members = members.len(),
            "resending batch with unknown outcome"
        );
        self.send_batch(adapter, intent, batch_key, members, &riders, platform_fee)
            .await
    }

    /// Submit one multi-receiver payment for `members` (settled from the
    /// result) plus `riders` (sent for an identical resend, not updated).
    async fn send_batch(
        &self,
        adapter: &dyn GatewayAdapter,
        intent: &PaymentIntent,
        batch_key: String,
        members: Vec<Transfer>,
        riders: &[Transfer],
        platform_fee: i64,
    ) -> DistributionResult<(Vec<Transfer>, Option<String>)> {
        let mut updated = Vec::with_capacity(members.len());
        let mut payable = Vec::with_capacity(members.len());
        for transfer in members {
            if destination_of(intent, &transfer).is_some() {
                payable.push(transfer);
                continue;
            }
            let key = transfer.dedupe_key.clone();
            let reason = format!("vendor has no destination on {}", intent.rail);
            updated.push(
                self.finish_transfer(transfer, key, Err(RailFailure::rejected(reason)))
                    .await?,
            );
        }
        if payable.is_empty() {
            return Ok((updated, None));
        }

        let mut receivers: Vec<Receiver> = payable
            .iter()
            .chain(riders)
            .filter_map(|t| {
                destination_of(intent, t).map(|destination| Receiver {
                    account: destination.to_string(),
                    amount_minor: t.amount_minor,
                    vendor_id: Some(t.vendor_id.clone()),
                })
            })
            .collect();
        receivers.sort_by(|a, b| a.vendor_id.cmp(&b.vendor_id));
        let platform_account = self.config.platform_accounts.get(&intent.rail);
        let platform_fee = match platform_account {
            Some(account) if platform_fee > 0 => {
                receivers.push(Receiver {
                    account: account.clone(),
                    amount_minor: platform_fee,
                    vendor_id: None,
                });
                platform_fee
            }
            _ => 0,
        };

        let request = MultiReceiverRequest {
            dedupe_key: batch_key.clone(),
            currency: intent.currency.clone(),
            receivers,
            source_reference: intent.provider_reference.clone(),
            payment_intent_id: intent.id,
        };
        let timeout = Duration::from_secs(self.config.transfer_timeout_secs);
        let result: RailOutcome =
            match tokio::time::timeout(timeout, adapter.submit_multi_receiver(request)).await {
                Ok(Ok(response)) => Ok((response.batch_reference, response.status)),
                Ok(Err(e)) => Err(RailFailure::from_error(&e)),
                Err(_) => Err(RailFailure::timed_out(self.config.transfer_timeout_secs)),
            };
        let batch_reference = result.as_ref().ok().map(|(r, _)| r.clone());
        if let Err(failure) = &result {
            warn!(
                intent_id = %intent.id,
                batch_key = %batch_key,
                outcome_unknown = failure.outcome_unknown,
                error = %failure.reason,
                "multi-receiver payment failed"
            );
        }

        for mut transfer in payable {
            let key = vendor_key(&batch_key, &transfer.vendor_id);
            transfer.batch_key = Some(batch_key.clone());
            transfer.batch_platform_fee = platform_fee;
            updated.push(self.finish_transfer(transfer, key, result.clone()).await?);
        }
        Ok((updated, batch_reference))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Platform fee not yet carried by any live batch of this intent, or zero
    /// when the rail has no platform account.
    async fn platform_fee_owed(&self, intent: &PaymentIntent) -> DistributionResult<i64> {
        if !self.config.platform_accounts.contains_key(&intent.rail) {
            debug!(
                rail = %intent.rail,
                "no platform account configured, fee stays with the merchant balance"
            );
            return Ok(0);
        }
        let transfers = self.ledger.transfers_for(intent.id).await?;
        if transfers.iter().any(Transfer::holds_platform_fee) {
            return Ok(0);
        }
        Ok(total_platform_fee(&calculate_splits(&intent.splits)))
    }

    async fn send_single(
        &self,
        adapter: &dyn GatewayAdapter,
        intent: &PaymentIntent,
        transfer: &Transfer,
        dedupe_key: &str,
    ) -> RailOutcome {
        let Some(destination) = destination_of(intent, transfer) else {
            return Err(RailFailure::rejected(format!(
                "vendor has no destination on {}",
                transfer.rail
            )));
        };
        let request = TransferRequest {
            dedupe_key: dedupe_key.to_string(),
            destination: destination.to_string(),
            amount: Money::new(transfer.amount_minor, transfer.currency.clone()),
            source_reference: intent.provider_reference.clone(),
            payment_intent_id: intent.id,
            vendor_id: transfer.vendor_id.clone(),
            service_type: transfer.service_type,
        };
        let timeout = Duration::from_secs(self.config.transfer_timeout_secs);
        match tokio::time::timeout(timeout, adapter.create_transfer(request)).await {
            Ok(Ok(response)) => Ok((response.transfer_reference, response.status)),
            Ok(Err(e)) => Err(RailFailure::from_error(&e)),
            Err(_) => Err(RailFailure::timed_out(self.config.transfer_timeout_secs)),
        }
    }

    async fn finish_transfer(
        &self,
        mut transfer: Transfer,
        dedupe_key: String,
        result: RailOutcome,
    ) -> DistributionResult<Transfer> {
        transfer.dedupe_key = dedupe_key;
        transfer.attempts += 1;
        transfer.updated_at = Utc::now();
        match result {
            Ok((reference, status)) => {
                transfer.status = status;
                transfer.transfer_reference = Some(reference);
                transfer.failure_reason = None;
                transfer.outcome_unknown = false;
            }
            Err(failure) => {
                transfer.status = TransferStatus::Failed;
                transfer.failure_reason = Some(failure.reason);
                transfer.outcome_unknown = failure.outcome_unknown;
            }
        }
        Ok(self.ledger.upsert_transfer(transfer).await?)
    }
}

fn ensure_captured(intent: &PaymentIntent) -> DistributionResult<()> {
    if intent.status != PaymentStatus::Captured {
        return Err(DistributionError::NotCaptured {
            id: intent.id,
            status: intent.status,
        });
    }
    Ok(())
}

fn record_routed(intent: &PaymentIntent, claims: Vec<TransferClaim>) -> Vec<VendorTransferOutcome> {
    claims
        .into_iter()
        .map(|claim| match claim {
            TransferClaim::Claimed(transfer) => {
                debug!(
                    intent_id = %intent.id,
                    vendor_id = %transfer.vendor_id,
                    "split routed by rail at settlement"
                );
                VendorTransferOutcome::from_transfer(&transfer, false)
            }
            TransferClaim::Held(transfer) => VendorTransferOutcome::from_transfer(&transfer, true),
        })
        .collect()
}

/// Key for the next attempt: the recorded key on a first attempt or after a
/// failure with unknown outcome, otherwise a fresh per-attempt key.
fn attempt_key(transfer: &Transfer) -> String {
    if transfer.attempts == 0 || transfer.outcome_unknown {
        transfer.dedupe_key.clone()
    } else {
        format!("{}:{}", transfer.id, transfer.attempts + 1)
    }
}

fn vendor_key(dedupe_key: &str, vendor_id: &str) -> String {
    format!("{}:{}", dedupe_key, vendor_id)
}

fn destination_of<'a>(intent: &'a PaymentIntent, transfer: &Transfer) -> Option<&'a str> {
    intent
        .splits
        .iter()
        .find(|s| s.vendor_id == transfer.vendor_id)
        .and_then(|s| s.destination_for(intent.rail))
}

fn new_transfer(intent: &PaymentIntent, calc: &SplitCalculation, dedupe_key: String) -> Transfer {
    let now = Utc::now();
    Transfer {
        id: Uuid::new_v4(),
        payment_intent_id: intent.id,
        vendor_id: calc.vendor_id.clone(),
        rail: intent.rail,
        amount_minor: calc.vendor_net_amount,
        currency: intent.currency.clone(),
        status: TransferStatus::Pending,
        transfer_reference: None,
        dedupe_key,
        service_type: calc.service_type,
        attempts: 0,
        failure_reason: None,
        outcome_unknown: false,
        batch_key: None,
        batch_platform_fee: 0,
        created_at: now,
        updated_at: now,
    }
}

fn routed_transfer(intent: &PaymentIntent, calc: &SplitCalculation, dedupe_key: &str) -> Transfer {
    let mut transfer = new_transfer(intent, calc, vendor_key(dedupe_key, &calc.vendor_id));
    transfer.status = TransferStatus::Paid;
    transfer.transfer_reference = Some(intent.provider_reference.clone());
    transfer.attempts = 1;
    transfer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_keys_are_scoped_by_caller_key() {
        assert_eq!(vendor_key("settle:abc", "hotel-1"), "settle:abc:hotel-1");
    }

    fn sent_transfer(attempts: u32, outcome_unknown: bool) -> Transfer {
        let now = Utc::now();
        Transfer {
            id: Uuid::new_v4(),
            payment_intent_id: Uuid::new_v4(),
            vendor_id: "hotel-1".to_string(),
            rail: Rail::Stripe,
            amount_minor: 9_000,
            currency: crate::payments::types::CurrencyCode::usd(),
            status: TransferStatus::Failed,
            transfer_reference: None,
            dedupe_key: "settle:abc:hotel-1".to_string(),
            service_type: crate::payments::types::ServiceType::Hotel,
            attempts,
            failure_reason: Some("boom".to_string()),
            outcome_unknown,
            batch_key: None,
            batch_platform_fee: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn attempt_keys_change_only_after_a_definitive_rejection() {
        let fresh = sent_transfer(0, false);
        assert_eq!(attempt_key(&fresh), "settle:abc:hotel-1");

        let timed_out = sent_transfer(1, true);
        assert_eq!(attempt_key(&timed_out), "settle:abc:hotel-1");

        let rejected = sent_transfer(1, false);
        assert_eq!(attempt_key(&rejected), format!("{}:2", rejected.id));
    }

    #[test]
    fn retryable_errors_leave_the_outcome_unknown() {
        let unavailable = PaymentError::provider("stripe", "service unavailable", true);
        assert!(RailFailure::from_error(&unavailable).outcome_unknown);
        assert!(RailFailure::timed_out(15).outcome_unknown);

        let declined = PaymentError::PaymentDeclinedError {
            message: "account closed".to_string(),
            provider_code: None,
        };
        assert!(!RailFailure::from_error(&declined).outcome_unknown);
    }

    #[test]
    fn failed_vendors_are_listed() {
        let outcome = |vendor: &str, status| VendorTransferOutcome {
            vendor_id: vendor.to_string(),
            transfer_id: Uuid::new_v4(),
            status,
            amount_minor: 100,
            transfer_reference: None,
            error: None,
            reused: false,
        };
        let charge = MarketplaceCharge {
            payment_intent_id: Uuid::new_v4(),
            rail: Rail::Stripe,
            capability: SplitCapability::PostCaptureTransfer,
            currency: "USD".to_string(),
            total_amount: 300,
            platform_fee: 0,
            splits: vec![],
            transfers: vec![
                outcome("a", TransferStatus::Paid),
                outcome("b", TransferStatus::Failed),
                outcome("c", TransferStatus::InTransit),
            ],
            batch_reference: None,
        };
        assert_eq!(charge.failed_vendors(), vec!["b"]);
    }
}
