use super::{check_refund, Ledger, LedgerError, LedgerResult, TransferClaim};
use crate::payments::types::{
    PaymentIntent, PaymentStatus, Rail, Refund, RefundStatus, Transfer, TransferStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    intents: HashMap<Uuid, PaymentIntent>,
    idempotency_keys: HashMap<String, Uuid>,
    refunds: HashMap<Uuid, Refund>,
    transfers: HashMap<Uuid, Transfer>,
    events: HashSet<(Rail, String)>,
}

impl LedgerState {
    fn refunds_for(&self, payment_intent_id: Uuid) -> Vec<Refund> {
        let mut refunds: Vec<Refund> = self
            .refunds
            .values()
            .filter(|r| r.payment_intent_id == payment_intent_id)
            .cloned()
            .collect();
        refunds.sort_by_key(|r| r.created_at);
        refunds
    }
}

/// A thread-safe in-memory ledger.
///
/// One lock guards every table, which makes refund reservation and event
/// recording trivially atomic. Used by tests and single-node deployments.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn insert_intent(&self, intent: PaymentIntent) -> LedgerResult<PaymentIntent> {
        let mut state = self.state.write().await;
        if let Some(key) = &intent.idempotency_key {
            if state.idempotency_keys.contains_key(key) {
                return Err(LedgerError::DuplicateIdempotencyKey(key.clone()));
            }
            state.idempotency_keys.insert(key.clone(), intent.id);
        }
        state.intents.insert(intent.id, intent.clone());
        Ok(intent)
    }

    async fn get_intent(&self, id: Uuid) -> LedgerResult<Option<PaymentIntent>> {
        Ok(self.state.read().await.intents.get(&id).cloned())
    }

    async fn find_intent_by_idempotency_key(
        &self,
        key: &str,
    ) -> LedgerResult<Option<PaymentIntent>> {
        let state = self.state.read().await;
        Ok(state
            .idempotency_keys
            .get(key)
            .and_then(|id| state.intents.get(id))
            .cloned())
    }

    async fn find_intent_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Option<PaymentIntent>> {
        let state = self.state.read().await;
        Ok(state
            .intents
            .values()
            .find(|i| i.rail == rail && i.provider_reference == reference)
            .cloned())
    }

    async fn transition_intent(
        &self,
        id: Uuid,
        to: PaymentStatus,
        captured_amount: Option<i64>,
    ) -> LedgerResult<PaymentIntent> {
        let mut state = self.state.write().await;
        let intent = state
            .intents
            .get_mut(&id)
            .ok_or(LedgerError::IntentNotFound(id))?;

        if !intent.status.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                from: intent.status,
                to,
            });
        }
        if to == PaymentStatus::Captured && intent.captured_amount.is_none() {
            intent.captured_amount = Some(captured_amount.unwrap_or(intent.amount_minor));
        }
        intent.status = to;
        intent.updated_at = Utc::now();
        Ok(intent.clone())
    }

    async fn reserve_refund(&self, refund: Refund) -> LedgerResult<Refund> {
        let mut state = self.state.write().await;
        let intent = state
            .intents
            .get(&refund.payment_intent_id)
            .ok_or(LedgerError::IntentNotFound(refund.payment_intent_id))?;
        let prior = state.refunds_for(refund.payment_intent_id);
        check_refund(intent, &prior, &refund)?;

        state.refunds.insert(refund.id, refund.clone());
        Ok(refund)
    }

    async fn update_refund(
        &self,
        id: Uuid,
        status: RefundStatus,
        provider_reference: Option<String>,
    ) -> LedgerResult<Refund> {
        let mut state = self.state.write().await;
        let refund = state
            .refunds
            .get_mut(&id)
            .ok_or(LedgerError::RefundNotFound(id))?;
        refund.status = status;
        if provider_reference.is_some() {
            refund.provider_reference = provider_reference;
        }
        refund.updated_at = Utc::now();
        Ok(refund.clone())
    }

    async fn find_refund_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Option<Refund>> {
        let state = self.state.read().await;
        Ok(state
            .refunds
            .values()
            .find(|r| r.rail == rail && r.provider_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn refunds_for(&self, payment_intent_id: Uuid) -> LedgerResult<Vec<Refund>> {
        Ok(self.state.read().await.refunds_for(payment_intent_id))
    }

    async fn unacknowledged_refunds(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Refund>> {
        let state = self.state.read().await;
        let mut stalled: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| {
                r.status == RefundStatus::Pending
                    && r.provider_reference.is_none()
                    && r.updated_at < before
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|r| r.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }

    async fn reserve_transfers(&self, transfers: Vec<Transfer>) -> LedgerResult<Vec<TransferClaim>> {
        let mut state = self.state.write().await;
        let mut claims = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            let held = state
                .transfers
                .values()
                .find(|t| {
                    t.payment_intent_id == transfer.payment_intent_id
                        && t.vendor_id == transfer.vendor_id
                })
                .cloned();
            match held {
                Some(current) => claims.push(TransferClaim::Held(current)),
                None => {
                    state.transfers.insert(transfer.id, transfer.clone());
                    claims.push(TransferClaim::Claimed(transfer));
                }
            }
        }
        Ok(claims)
    }

    async fn claim_transfer(&self, id: Uuid, attempts: u32) -> LedgerResult<TransferClaim> {
        let mut state = self.state.write().await;
        let transfer = state
            .transfers
            .get_mut(&id)
            .ok_or(LedgerError::TransferNotFound(id))?;
        if transfer.status != TransferStatus::Failed || transfer.attempts != attempts {
            return Ok(TransferClaim::Held(transfer.clone()));
        }
        transfer.status = TransferStatus::Pending;
        transfer.updated_at = Utc::now();
        Ok(TransferClaim::Claimed(transfer.clone()))
    }

    async fn upsert_transfer(&self, transfer: Transfer) -> LedgerResult<Transfer> {
        let mut state = self.state.write().await;
        state.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&self, id: Uuid) -> LedgerResult<Option<Transfer>> {
        Ok(self.state.read().await.transfers.get(&id).cloned())
    }

    async fn find_transfers_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Vec<Transfer>> {
        let state = self.state.read().await;
        Ok(state
            .transfers
            .values()
            .filter(|t| t.rail == rail && t.transfer_reference.as_deref() == Some(reference))
            .cloned()
            .collect())
    }

    async fn transfers_for(&self, payment_intent_id: Uuid) -> LedgerResult<Vec<Transfer>> {
        let state = self.state.read().await;
        let mut transfers: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|t| t.payment_intent_id == payment_intent_id)
            .cloned()
            .collect();
        transfers.sort_by(|a, b| a.vendor_id.cmp(&b.vendor_id));
        Ok(transfers)
    }

    async fn failed_transfers(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> LedgerResult<Vec<Transfer>> {
        let state = self.state.read().await;
        let mut failed: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|t| t.status == TransferStatus::Failed && t.attempts < max_attempts)
            .filter(|t| {
                state
                    .intents
                    .get(&t.payment_intent_id)
                    .is_some_and(|i| i.status == PaymentStatus::Captured)
            })
            .cloned()
            .collect();
        failed.sort_by_key(|t| t.updated_at);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn record_event(&self, rail: Rail, event_id: &str) -> LedgerResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.events.insert((rail, event_id.to_string())))
    }

    async fn release_event(&self, rail: Rail, event_id: &str) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        state.events.remove(&(rail, event_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{
        CurrencyCode, RefundReason, RefundSplit, ServiceType, VendorSplit,
    };
    use futures::future::join_all;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn intent(amount: i64, splits: Vec<VendorSplit>) -> PaymentIntent {
        let now = Utc::now();
        PaymentIntent {
            id: Uuid::new_v4(),
            amount_minor: amount,
            currency: CurrencyCode::parse("USD").unwrap(),
            rail: Rail::Stripe,
            status: PaymentStatus::Pending,
            provider_reference: "pi_123".to_string(),
            client_action_token: None,
            redirect_url: None,
            captured_amount: None,
            splits,
            deferred_payment: None,
            idempotency_key: Some("checkout-1".to_string()),
            metadata: serde_json::json!({}),
            created_at: now,
            expires_at: now,
            updated_at: now,
        }
    }

    fn split(vendor: &str, amount: i64) -> VendorSplit {
        VendorSplit {
            vendor_id: vendor.to_string(),
            destination_accounts: BTreeMap::new(),
            allocated_amount: amount,
            fee_percentage: dec!(10),
            service_type: ServiceType::Hotel,
            description: None,
        }
    }

    fn refund(intent: &PaymentIntent, amount: i64, splits: Vec<RefundSplit>) -> Refund {
        let now = Utc::now();
        Refund {
            id: Uuid::new_v4(),
            payment_intent_id: intent.id,
            rail: intent.rail,
            amount_minor: amount,
            currency: intent.currency.clone(),
            status: RefundStatus::Pending,
            reason: RefundReason::RequestedByCustomer,
            splits,
            provider_reference: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn idempotency_key_is_bound_once() {
        let ledger = InMemoryLedger::new();
        let first = intent(1_000, vec![]);
        ledger.insert_intent(first.clone()).await.unwrap();

        let found = ledger
            .find_intent_by_idempotency_key("checkout-1")
            .await
            .unwrap();
        assert_eq!(found.map(|i| i.id), Some(first.id));

        let err = ledger.insert_intent(intent(1_000, vec![])).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateIdempotencyKey(_)));
    }

    #[tokio::test]
    async fn capture_sets_captured_amount_once() {
        let ledger = InMemoryLedger::new();
        let pi = ledger.insert_intent(intent(5_000, vec![])).await.unwrap();

        let captured = ledger
            .transition_intent(pi.id, PaymentStatus::Captured, Some(4_800))
            .await
            .unwrap();
        assert_eq!(captured.captured_amount, Some(4_800));

        let err = ledger
            .transition_intent(pi.id, PaymentStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn refunds_cannot_exceed_captured_balance() {
        let ledger = InMemoryLedger::new();
        let pi = ledger.insert_intent(intent(10_000, vec![])).await.unwrap();
        let pi = ledger
            .transition_intent(pi.id, PaymentStatus::Captured, None)
            .await
            .unwrap();

        ledger.reserve_refund(refund(&pi, 6_000, vec![])).await.unwrap();
        let err = ledger
            .reserve_refund(refund(&pi, 4_001, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::RefundExceedsCaptured {
                requested: 4_001,
                refundable: 4_000
            }
        ));
    }

    #[tokio::test]
    async fn failed_refunds_release_their_balance() {
        let ledger = InMemoryLedger::new();
        let pi = ledger.insert_intent(intent(10_000, vec![])).await.unwrap();
        let pi = ledger
            .transition_intent(pi.id, PaymentStatus::Captured, None)
            .await
            .unwrap();

        let r = ledger.reserve_refund(refund(&pi, 10_000, vec![])).await.unwrap();
        ledger
            .update_refund(r.id, RefundStatus::Failed, None)
            .await
            .unwrap();
        assert!(ledger.reserve_refund(refund(&pi, 10_000, vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn vendor_refunds_are_capped_by_allocation() {
        let ledger = InMemoryLedger::new();
        let pi = ledger
            .insert_intent(intent(10_000, vec![split("a", 6_000), split("b", 4_000)]))
            .await
            .unwrap();
        let pi = ledger
            .transition_intent(pi.id, PaymentStatus::Captured, None)
            .await
            .unwrap();

        let too_much = RefundSplit {
            vendor_id: "b".to_string(),
            refund_amount: 4_500,
            deduct_fees: false,
            fee_deduction: 0,
        };
        let err = ledger
            .reserve_refund(refund(&pi, 4_500, vec![too_much]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::VendorRefundExceeded { .. }));

        let stranger = RefundSplit {
            vendor_id: "c".to_string(),
            refund_amount: 100,
            deduct_fees: false,
            fee_deduction: 0,
        };
        let err = ledger
            .reserve_refund(refund(&pi, 100, vec![stranger]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownVendor(_)));
    }

    fn line(vendor: &str, amount: i64) -> RefundSplit {
        RefundSplit {
            vendor_id: vendor.to_string(),
            refund_amount: amount,
            deduct_fees: false,
            fee_deduction: 0,
        }
    }

    #[tokio::test]
    async fn a_vendor_cannot_be_refunded_twice_in_one_request() {
        let ledger = InMemoryLedger::new();
        let pi = ledger
            .insert_intent(intent(10_000, vec![split("a", 6_000), split("b", 4_000)]))
            .await
            .unwrap();
        let pi = ledger
            .transition_intent(pi.id, PaymentStatus::Captured, None)
            .await
            .unwrap();

        let err = ledger
            .reserve_refund(refund(&pi, 8_000, vec![line("b", 4_000), line("b", 4_000)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVendor(ref v) if v == "b"));
        assert!(ledger.refunds_for(pi.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_refund_lines_are_rejected_without_panicking() {
        let ledger = InMemoryLedger::new();
        let pi = ledger
            .insert_intent(intent(10_000, vec![split("a", 6_000), split("b", 4_000)]))
            .await
            .unwrap();
        let pi = ledger
            .transition_intent(pi.id, PaymentStatus::Captured, None)
            .await
            .unwrap();

        let err = ledger
            .reserve_refund(refund(&pi, 100, vec![line("a", i64::MAX), line("b", i64::MAX)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AmountOverflow));
    }

    fn pending_transfer(intent_id: Uuid, vendor: &str) -> Transfer {
        let now = Utc::now();
        Transfer {
            id: Uuid::new_v4(),
            payment_intent_id: intent_id,
            vendor_id: vendor.to_string(),
            rail: Rail::Stripe,
            amount_minor: 1_000,
            currency: CurrencyCode::usd(),
            status: TransferStatus::Pending,
            transfer_reference: None,
            dedupe_key: format!("settle:{}:{}", intent_id, vendor),
            service_type: ServiceType::Hotel,
            attempts: 0,
            failure_reason: None,
            outcome_unknown: false,
            batch_key: None,
            batch_platform_fee: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn each_vendor_row_is_reserved_once() {
        let ledger = InMemoryLedger::new();
        let intent_id = Uuid::new_v4();

        let runs = (0..8).map(|_| {
            let ledger = ledger.clone();
            async move {
                ledger
                    .reserve_transfers(vec![
                        pending_transfer(intent_id, "a"),
                        pending_transfer(intent_id, "b"),
                    ])
                    .await
                    .unwrap()
            }
        });
        let claimed = join_all(runs)
            .await
            .into_iter()
            .flatten()
            .filter(|c| matches!(c, TransferClaim::Claimed(_)))
            .count();

        assert_eq!(claimed, 2);
        assert_eq!(ledger.transfers_for(intent_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_transfers_are_claimed_by_one_caller() {
        let ledger = InMemoryLedger::new();
        let mut transfer = pending_transfer(Uuid::new_v4(), "a");
        transfer.status = TransferStatus::Failed;
        transfer.attempts = 1;
        ledger.upsert_transfer(transfer.clone()).await.unwrap();

        let first = ledger.claim_transfer(transfer.id, 1).await.unwrap();
        assert!(matches!(first, TransferClaim::Claimed(ref t) if t.status == TransferStatus::Pending));
        let second = ledger.claim_transfer(transfer.id, 1).await.unwrap();
        assert!(matches!(second, TransferClaim::Held(_)));

        let missing = ledger.claim_transfer(Uuid::new_v4(), 0).await.unwrap_err();
        assert!(matches!(missing, LedgerError::TransferNotFound(_)));
    }

    #[tokio::test]
    async fn events_are_recorded_once_per_rail() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.record_event(Rail::Stripe, "evt_1").await.unwrap());
        assert!(!ledger.record_event(Rail::Stripe, "evt_1").await.unwrap());
        assert!(ledger.record_event(Rail::Paystack, "evt_1").await.unwrap());

        ledger.release_event(Rail::Stripe, "evt_1").await.unwrap();
        assert!(ledger.record_event(Rail::Stripe, "evt_1").await.unwrap());
    }
}
