//! Shared fixtures: scripted rail adapters and a fully wired service stack
//! over the in-memory ledger. Nothing here touches the network.

#![allow(dead_code)]

use async_trait::async_trait;
use http::HeaderMap;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use traveease_payments::api::{self, AppState};
use traveease_payments::health::HealthChecker;
use traveease_payments::ledger::{InMemoryLedger, Ledger};
use traveease_payments::payments::error::{PaymentError, PaymentResult};
use traveease_payments::payments::provider::GatewayAdapter;
use traveease_payments::payments::types::{
    CreateIntentRequest, CreateIntentResponse, DeferredPaymentProvider, EventKind,
    MultiReceiverRequest, MultiReceiverResponse, NormalizedEvent, PaymentStatus, Rail, RailKind,
    RefundRequest, RefundResponse, RefundStatus, ServiceType, SettlementLatency, SplitCapability,
    TransferRequest, TransferResponse, TransferStatus, VendorSplit, WebhookVerificationResult,
};
use traveease_payments::payments::GatewayRegistry;
use traveease_payments::services::exchange_rate::{StaticRateSource, DEFAULT_EXCHANGE_RATES};
use traveease_payments::services::{
    CheckoutService, DistributorConfig, ExchangeRateService, GeolocationResolver,
    OrchestratorConfig, PaymentOrchestrator, RefundCoordinator, SplitDistributor,
    WebhookProcessor,
};

pub const SIGNATURE_HEADER: &str = "x-test-signature";
pub const VALID_SIGNATURE: &str = "valid";

/// How a scripted rail answers create-intent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentBehavior {
    Accept,
    /// Retryable provider error
    Unavailable,
    /// Non-retryable decline
    Decline,
    /// Never answers; the orchestrator's timeout fires
    Hang,
}

pub struct ScriptedAdapter {
    rail: Rail,
    intent_behavior: Mutex<IntentBehavior>,
    refund_fails: AtomicBool,
    refund_hangs: AtomicBool,
    batch_fails: AtomicBool,
    failing_destinations: Mutex<HashSet<String>>,
    rejected_destinations: Mutex<HashSet<String>>,
    transfer_delay: Mutex<Duration>,
    pub intent_calls: AtomicUsize,
    pub intent_requests: Mutex<Vec<CreateIntentRequest>>,
    pub discarded: Mutex<Vec<String>>,
    pub refunds: Mutex<Vec<RefundRequest>>,
    pub transfers: Mutex<Vec<TransferRequest>>,
    pub batches: Mutex<Vec<MultiReceiverRequest>>,
}

impl ScriptedAdapter {
    pub fn new(rail: Rail) -> Arc<Self> {
        Arc::new(Self {
            rail,
            intent_behavior: Mutex::new(IntentBehavior::Accept),
            refund_fails: AtomicBool::new(false),
            refund_hangs: AtomicBool::new(false),
            batch_fails: AtomicBool::new(false),
            failing_destinations: Mutex::new(HashSet::new()),
            rejected_destinations: Mutex::new(HashSet::new()),
            transfer_delay: Mutex::new(Duration::ZERO),
            intent_calls: AtomicUsize::new(0),
            intent_requests: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn behave(&self, behavior: IntentBehavior) {
        *self.intent_behavior.lock().unwrap() = behavior;
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.refund_fails.store(fail, Ordering::SeqCst);
    }

    /// Refund calls never answer; the coordinator's timeout fires.
    pub fn hang_refunds(&self, hang: bool) {
        self.refund_hangs.store(hang, Ordering::SeqCst);
    }

    pub fn fail_batches(&self, fail: bool) {
        self.batch_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_transfers_to(&self, destination: &str) {
        self.failing_destinations
            .lock()
            .unwrap()
            .insert(destination.to_string());
    }

    /// Non-retryable refusal, as for a closed account.
    pub fn reject_transfers_to(&self, destination: &str) {
        self.rejected_destinations
            .lock()
            .unwrap()
            .insert(destination.to_string());
    }

    pub fn delay_transfers(&self, delay: Duration) {
        *self.transfer_delay.lock().unwrap() = delay;
    }

    pub fn heal_transfers(&self) {
        self.failing_destinations.lock().unwrap().clear();
        self.rejected_destinations.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.intent_calls.load(Ordering::SeqCst)
    }

    pub fn transfer_requests(&self) -> Vec<TransferRequest> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn refund_requests(&self) -> Vec<RefundRequest> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn batch_requests(&self) -> Vec<MultiReceiverRequest> {
        self.batches.lock().unwrap().clone()
    }

    pub fn discarded_references(&self) -> Vec<String> {
        self.discarded.lock().unwrap().clone()
    }
}

fn status_for(kind: &str, status: &str) -> EventKind {
    match (kind, status) {
        ("payment", "authorized") => EventKind::Payment(PaymentStatus::Authorized),
        ("payment", "captured") => EventKind::Payment(PaymentStatus::Captured),
        ("payment", "failed") => EventKind::Payment(PaymentStatus::Failed),
        ("payment", "cancelled") => EventKind::Payment(PaymentStatus::Cancelled),
        ("refund", "succeeded") => EventKind::Refund(RefundStatus::Succeeded),
        ("refund", "failed") => EventKind::Refund(RefundStatus::Failed),
        ("refund", "pending") => EventKind::Refund(RefundStatus::Pending),
        ("transfer", "paid") => EventKind::Transfer(TransferStatus::Paid),
        ("transfer", "failed") => EventKind::Transfer(TransferStatus::Failed),
        ("transfer", "in_transit") => EventKind::Transfer(TransferStatus::InTransit),
        _ => EventKind::Unhandled,
    }
}

#[async_trait]
impl GatewayAdapter for ScriptedAdapter {
    fn rail(&self) -> Rail {
        self.rail
    }

    fn kind(&self) -> RailKind {
        match self.rail {
            Rail::Stripe => RailKind::CardNetwork,
            Rail::PayPal => RailKind::Wallet,
            Rail::Flutterwave | Rail::Paystack => RailKind::MobileMoney,
        }
    }

    fn capability(&self) -> SplitCapability {
        match self.rail {
            Rail::Stripe => SplitCapability::PostCaptureTransfer,
            Rail::PayPal => SplitCapability::MultiReceiverPayment,
            Rail::Flutterwave | Rail::Paystack => SplitCapability::SubAccountRouting,
        }
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        match self.rail {
            Rail::Stripe => &["USD", "EUR", "GBP", "CAD", "AUD", "KES", "ZAR"],
            Rail::PayPal => &["USD", "EUR", "GBP", "AUD", "CAD"],
            Rail::Flutterwave => &["NGN", "GHS", "KES", "TZS", "UGX", "ZAR", "XOF", "USD", "EUR"],
            Rail::Paystack => &["NGN", "GHS", "ZAR", "USD"],
        }
    }

    fn processing_fee_rate(&self) -> Decimal {
        Decimal::new(29, 3)
    }

    fn settlement(&self) -> SettlementLatency {
        SettlementLatency::NextDay
    }

    fn intent_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(30)
    }

    fn deferred_providers(&self) -> &'static [DeferredPaymentProvider] {
        match self.rail {
            Rail::Stripe => &[DeferredPaymentProvider::Klarna, DeferredPaymentProvider::Afterpay],
            _ => &[],
        }
    }

    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> PaymentResult<CreateIntentResponse> {
        self.intent_calls.fetch_add(1, Ordering::SeqCst);
        self.intent_requests.lock().unwrap().push(request.clone());
        let behavior = *self.intent_behavior.lock().unwrap();
        match behavior {
            IntentBehavior::Accept => Ok(CreateIntentResponse {
                provider_reference: format!("{}_{}", self.rail, request.reference),
                status: PaymentStatus::Pending,
                client_action_token: Some(format!("secret_{}", request.reference)),
                redirect_url: None,
            }),
            IntentBehavior::Unavailable => Err(PaymentError::provider(
                self.rail.as_str(),
                "service unavailable",
                true,
            )),
            IntentBehavior::Decline => Err(PaymentError::PaymentDeclinedError {
                message: "currency not enabled on account".to_string(),
                provider_code: None,
            }),
            IntentBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(PaymentError::TimeoutError { timeout_secs: 3600 })
            }
        }
    }

    async fn discard_attempt(&self, reference: &str) -> PaymentResult<()> {
        self.discarded.lock().unwrap().push(reference.to_string());
        Ok(())
    }

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<RefundResponse> {
        self.refunds.lock().unwrap().push(request.clone());
        if self.refund_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.refund_fails.load(Ordering::SeqCst) {
            return Err(PaymentError::provider(self.rail.as_str(), "refund refused", false));
        }
        Ok(RefundResponse {
            provider_reference: format!("re_{}", request.idempotency_key),
            status: RefundStatus::Pending,
        })
    }

    async fn create_transfer(&self, request: TransferRequest) -> PaymentResult<TransferResponse> {
        if self.capability() != SplitCapability::PostCaptureTransfer {
            return Err(PaymentError::UnsupportedOperation {
                rail: self.rail.to_string(),
                operation: "post-capture transfers".to_string(),
            });
        }
        self.transfers.lock().unwrap().push(request.clone());
        let delay = *self.transfer_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .rejected_destinations
            .lock()
            .unwrap()
            .contains(&request.destination)
        {
            return Err(PaymentError::PaymentDeclinedError {
                message: "destination account closed".to_string(),
                provider_code: None,
            });
        }
        if self
            .failing_destinations
            .lock()
            .unwrap()
            .contains(&request.destination)
        {
            return Err(PaymentError::provider(
                self.rail.as_str(),
                "destination account restricted",
                true,
            ));
        }
        Ok(TransferResponse {
            transfer_reference: format!("tr_{}", request.dedupe_key),
            status: TransferStatus::InTransit,
        })
    }

    async fn submit_multi_receiver(
        &self,
        request: MultiReceiverRequest,
    ) -> PaymentResult<MultiReceiverResponse> {
        if self.capability() != SplitCapability::MultiReceiverPayment {
            return Err(PaymentError::UnsupportedOperation {
                rail: self.rail.to_string(),
                operation: "multi-receiver payments".to_string(),
            });
        }
        self.batches.lock().unwrap().push(request.clone());
        if self.batch_fails.load(Ordering::SeqCst) {
            return Err(PaymentError::provider(self.rail.as_str(), "payout batch refused", true));
        }
        Ok(MultiReceiverResponse {
            batch_reference: format!("batch_{}", request.dedupe_key),
            status: TransferStatus::InTransit,
        })
    }

    async fn verify_webhook(
        &self,
        _payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookVerificationResult> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        Ok(match signature {
            Some(VALID_SIGNATURE) => WebhookVerificationResult {
                valid: true,
                reason: None,
            },
            Some(_) => WebhookVerificationResult {
                valid: false,
                reason: Some("signature mismatch".to_string()),
            },
            None => WebhookVerificationResult {
                valid: false,
                reason: Some("missing signature header".to_string()),
            },
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<NormalizedEvent> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| PaymentError::ValidationError {
                message: e.to_string(),
                field: Some("payload".to_string()),
            })?;
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let kind = text("kind").unwrap_or_default();
        let status = text("status").unwrap_or_default();
        Ok(NormalizedEvent {
            event_id: text("id").ok_or_else(|| PaymentError::ValidationError {
                message: "missing id".to_string(),
                field: Some("id".to_string()),
            })?,
            rail: self.rail,
            event_type: format!("{}.{}", kind, status),
            kind: status_for(&kind, &status),
            reference: text("reference"),
            payment_intent_id: text("intentId").and_then(|v| v.parse().ok()),
            amount_minor: value.get("amount").and_then(Value::as_i64),
        })
    }

    fn normalize_status(&self, raw: &str) -> Option<PaymentStatus> {
        match status_for("payment", raw) {
            EventKind::Payment(status) => Some(status),
            _ => None,
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn vendor_split(vendor: &str, allocated: i64, fee_pct: i64, rails: &[Rail]) -> VendorSplit {
    VendorSplit {
        vendor_id: vendor.to_string(),
        destination_accounts: rails
            .iter()
            .map(|rail| (*rail, format!("{}-{}", rail, vendor)))
            .collect::<BTreeMap<_, _>>(),
        allocated_amount: allocated,
        fee_percentage: Decimal::from(fee_pct),
        service_type: ServiceType::Hotel,
        description: None,
    }
}

pub fn webhook_body(id: &str, kind: &str, status: &str, extra: Value) -> Vec<u8> {
    let mut body = json!({ "id": id, "kind": kind, "status": status });
    if let (Some(target), Value::Object(extra)) = (body.as_object_mut(), extra) {
        target.extend(extra);
    }
    serde_json::to_vec(&body).unwrap()
}

pub fn signed_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(SIGNATURE_HEADER, VALID_SIGNATURE.parse().unwrap());
    headers
}

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub adapters: HashMap<Rail, Arc<ScriptedAdapter>>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub distributor: Arc<SplitDistributor>,
    pub refunds: Arc<RefundCoordinator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub checkout: Arc<CheckoutService>,
    pub rates: Arc<ExchangeRateService>,
}

impl Harness {
    pub fn adapter(&self, rail: Rail) -> Arc<ScriptedAdapter> {
        Arc::clone(&self.adapters[&rail])
    }

    pub fn router(&self) -> axum::Router {
        api::router(AppState {
            orchestrator: Arc::clone(&self.orchestrator),
            distributor: Arc::clone(&self.distributor),
            refunds: Arc::clone(&self.refunds),
            webhooks: Arc::clone(&self.webhooks),
            checkout: Arc::clone(&self.checkout),
            health: HealthChecker::new(Arc::clone(&self.orchestrator), Duration::from_secs(1)),
        })
    }

    pub fn ledger_port(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }
}

pub fn test_orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        rail_timeout_secs: 1,
        discard_timeout_secs: 1,
        failure_threshold: 3,
        failure_cooldown_secs: 60,
        ..OrchestratorConfig::default()
    }
}

pub fn harness(rails: &[Rail]) -> Harness {
    harness_with(rails, test_orchestrator_config(), DistributorConfig::default())
}

pub fn harness_with(
    rails: &[Rail],
    orchestrator_config: OrchestratorConfig,
    distributor_config: DistributorConfig,
) -> Harness {
    let adapters: HashMap<Rail, Arc<ScriptedAdapter>> = rails
        .iter()
        .map(|rail| (*rail, ScriptedAdapter::new(*rail)))
        .collect();
    let registry = rails.iter().fold(GatewayRegistry::new(), |registry, rail| {
        registry.with_adapter(adapters[rail].clone() as Arc<dyn GatewayAdapter>)
    });

    let ledger = Arc::new(InMemoryLedger::new());
    let port: Arc<dyn Ledger> = ledger.clone();
    let geolocation = Arc::new(GeolocationResolver::new(
        None,
        Duration::from_millis(100),
        Duration::from_secs(60),
    ));
    let source = StaticRateSource::parse(DEFAULT_EXCHANGE_RATES).unwrap();
    let rates = Arc::new(ExchangeRateService::new(
        Arc::new(source),
        Duration::from_secs(60),
    ));

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        registry.clone(),
        Arc::clone(&port),
        geolocation,
        orchestrator_config,
    ));
    let distributor = Arc::new(SplitDistributor::new(
        registry.clone(),
        Arc::clone(&port),
        distributor_config,
    ));
    let refunds = Arc::new(RefundCoordinator::new(
        registry.clone(),
        Arc::clone(&port),
        Duration::from_secs(1),
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        registry,
        Arc::clone(&port),
        Arc::clone(&refunds),
        Arc::clone(&distributor),
    ));
    let checkout = Arc::new(CheckoutService::new(
        Arc::clone(&orchestrator),
        Arc::clone(&rates),
    ));

    Harness {
        ledger,
        adapters,
        orchestrator,
        distributor,
        refunds,
        webhooks,
        checkout,
        rates,
    }
}

/// Drive an intent to captured through the ledger, as a capture webhook would.
pub async fn capture(harness: &Harness, intent_id: uuid::Uuid, amount: Option<i64>) {
    harness
        .ledger
        .transition_intent(intent_id, PaymentStatus::Captured, amount)
        .await
        .unwrap();
}
