//! Payment Orchestrator Service
//!
//! Creates payment intents. The client is located, rails are ranked, and
//! then tried strictly one at a time: an attempt that fails or times out is
//! discarded before the next rail is asked, so a checkout never has two live
//! intents upstream. Validation failures are returned before any rail is
//! called and never trigger fallback.

use crate::config::env_or;
use crate::error::{AppError, AppErrorKind, ExternalError};
use crate::ledger::{Ledger, LedgerError};
use crate::payments::factory::RegistryConfig;
use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{
    CreateIntentRequest, CurrencyCode, DeferredPaymentOffer, DeferredPaymentProvider,
    GatewayAvailability, Geolocation, InstallmentPlan, Money, PaymentIntent, Rail, VendorSplit,
};
use crate::payments::{GatewayRegistry, PaymentError};
use crate::services::gateway_selector::{rank_candidates, VendorRailHints};
use crate::services::geolocation::GeolocationResolver;
use crate::services::split_calculator::{validate_splits, SplitError};
use chrono::Utc;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Installment counts offered whenever a deferred plan is eligible.
const INSTALLMENT_OPTIONS: [u32; 4] = [3, 4, 6, 12];
const REPRESENTATIVE_INSTALLMENTS: u32 = 3;

// ============================================================================
// Configuration Types
// ============================================================================

/// Configuration for the payment orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on one rail's create-intent call
    pub rail_timeout_secs: u64,
    /// Upper bound on cancelling an abandoned attempt
    pub discard_timeout_secs: u64,
    /// Smallest amount (minor units) offered deferred payment
    pub deferred_min_minor: i64,
    /// Largest amount (minor units) offered deferred payment
    pub deferred_max_minor: i64,
    /// Consecutive failures before a rail is benched
    pub failure_threshold: u32,
    /// How long a benched rail is skipped
    pub failure_cooldown_secs: u64,
    /// Rails the orchestrator may route to
    pub enabled_rails: Vec<Rail>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rail_timeout_secs: 15,
            discard_timeout_secs: 5,
            deferred_min_minor: 5_000,
            deferred_max_minor: 200_000,
            failure_threshold: 3,
            failure_cooldown_secs: 60,
            enabled_rails: Rail::ALL.to_vec(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rail_timeout_secs: env_or("RAIL_TIMEOUT_SECS", defaults.rail_timeout_secs),
            discard_timeout_secs: env_or(
                "RAIL_DISCARD_TIMEOUT_SECS",
                defaults.discard_timeout_secs,
            ),
            deferred_min_minor: env_or("DEFERRED_PAYMENT_MIN_MINOR", defaults.deferred_min_minor),
            deferred_max_minor: env_or("DEFERRED_PAYMENT_MAX_MINOR", defaults.deferred_max_minor),
            failure_threshold: env_or("RAIL_FAILURE_THRESHOLD", defaults.failure_threshold),
            failure_cooldown_secs: env_or(
                "RAIL_FAILURE_COOLDOWN_SECS",
                defaults.failure_cooldown_secs,
            ),
            enabled_rails: RegistryConfig::from_env()
                .map(|c| c.enabled_rails)
                .unwrap_or(defaults.enabled_rails),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rail_timeout_secs == 0 {
            return Err("RAIL_TIMEOUT_SECS must be positive".to_string());
        }
        if self.deferred_min_minor > self.deferred_max_minor {
            return Err("DEFERRED_PAYMENT_MIN_MINOR exceeds DEFERRED_PAYMENT_MAX_MINOR".to_string());
        }
        if self.failure_threshold == 0 {
            return Err("RAIL_FAILURE_THRESHOLD must be positive".to_string());
        }
        if self.enabled_rails.is_empty() {
            return Err("at least one rail must be enabled".to_string());
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            enabled_rails: self.enabled_rails.clone(),
        }
    }
}

// ============================================================================
// Rail Health & Metrics Types
// ============================================================================

/// Per-rail counters. Consecutive failures bench a rail for a cooldown.
#[derive(Debug, Clone)]
pub struct RailMetrics {
    pub rail: Rail,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<SystemTime>,
    pub last_failure_at: Option<SystemTime>,
    unavailable_until: Option<Instant>,
}

impl RailMetrics {
    pub fn new(rail: Rail) -> Self {
        Self {
            rail,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            unavailable_until: None,
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.unavailable_until = None;
        self.last_success_at = Some(SystemTime::now());
    }

    pub fn record_failure(&mut self, threshold: u32, cooldown: Duration) {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_failure_at = Some(SystemTime::now());
        if self.consecutive_failures >= threshold {
            self.unavailable_until = Some(Instant::now() + cooldown);
        }
    }

    pub fn is_benched(&self) -> bool {
        self.unavailable_until
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }
}

// ============================================================================
// Requests and results
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CreatePaymentIntent {
    pub amount_minor: i64,
    pub currency: String,
    pub metadata: JsonValue,
    pub splits: Vec<VendorSplit>,
    pub client_ip: Option<IpAddr>,
    /// ISO country supplied by the caller; used when no address is known
    pub country_hint: Option<String>,
    pub customer_email: Option<String>,
    pub description: Option<String>,
    pub callback_url: Option<String>,
    pub idempotency_key: Option<String>,
    /// Evaluate buy-now-pay-later eligibility for the chosen rail
    pub deferred_payment: bool,
}

#[derive(Debug, Clone)]
pub struct PaymentIntentResult {
    pub intent: PaymentIntent,
    pub geolocation: Geolocation,
    /// Rails actually called, in order
    pub attempted: Vec<Rail>,
    /// The idempotency key matched an existing intent
    pub replayed: bool,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("no enabled rail can pay out to every vendor")]
    NoReceivableRail,

    #[error("all gateways exhausted after trying {attempted:?}")]
    AllGatewaysExhausted {
        attempted: Vec<Rail>,
        last_error: Option<String>,
    },

    #[error("payment intent {0} not found")]
    IntentNotFound(Uuid),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl OrchestratorError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<PaymentError> for OrchestratorError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::ValidationError { message, field } => OrchestratorError::Validation {
                field: field.unwrap_or_else(|| "request".to_string()),
                message,
            },
            other => OrchestratorError::validation("request", other.to_string()),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation { field, message } => AppError::validation(field, message),
            OrchestratorError::Split(e) => e.into(),
            OrchestratorError::NoReceivableRail => AppError::validation(
                "splits.destinationAccounts",
                "no enabled rail can pay out to every vendor",
            ),
            OrchestratorError::AllGatewaysExhausted { attempted, .. } => {
                AppError::new(AppErrorKind::External(ExternalError::AllGatewaysExhausted {
                    attempted: attempted.iter().map(|r| r.to_string()).collect(),
                }))
            }
            OrchestratorError::IntentNotFound(id) => AppError::payment_not_found(id.to_string()),
            OrchestratorError::Ledger(e) => e.into(),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

fn idempotency_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-:.]{0,127}$").expect("valid idempotency key pattern")
    })
}

pub fn validate_idempotency_key(key: &str) -> OrchestratorResult<()> {
    if idempotency_key_pattern().is_match(key) {
        Ok(())
    } else {
        Err(OrchestratorError::validation(
            "idempotencyKey",
            "must be 1-128 characters of letters, digits, '_', '-', ':' or '.'",
        ))
    }
}

/// Deferred-payment offer for a rail. `None` when the rail has no
/// installment providers; ineligible outside the `[min, max]` band.
pub fn evaluate_deferred_payment(
    providers: &[DeferredPaymentProvider],
    amount_minor: i64,
    min_minor: i64,
    max_minor: i64,
) -> Option<DeferredPaymentOffer> {
    if providers.is_empty() {
        return None;
    }
    if amount_minor < min_minor || amount_minor > max_minor {
        return Some(DeferredPaymentOffer {
            eligible: false,
            providers: Vec::new(),
            installment_options: Vec::new(),
            representative_plan: None,
        });
    }
    Some(DeferredPaymentOffer {
        eligible: true,
        providers: providers.to_vec(),
        installment_options: INSTALLMENT_OPTIONS.to_vec(),
        representative_plan: Some(InstallmentPlan {
            installments: REPRESENTATIVE_INSTALLMENTS,
            installment_amount: amount_minor / i64::from(REPRESENTATIVE_INSTALLMENTS),
            apr: Decimal::ZERO,
        }),
    })
}

/// Rails every vendor has a destination on. `None` when there are no splits.
pub fn receivable_rails(splits: &[VendorSplit]) -> VendorRailHints {
    if splits.is_empty() {
        return VendorRailHints::any();
    }
    VendorRailHints::only(
        Rail::ALL
            .iter()
            .copied()
            .filter(|rail| splits.iter().all(|s| s.destination_for(*rail).is_some()))
            .collect(),
    )
}

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    registry: GatewayRegistry,
    ledger: Arc<dyn Ledger>,
    geolocation: Arc<GeolocationResolver>,
    config: OrchestratorConfig,
    rail_metrics: Arc<RwLock<HashMap<Rail, RailMetrics>>>,
}

impl PaymentOrchestrator {
    pub fn new(
        registry: GatewayRegistry,
        ledger: Arc<dyn Ledger>,
        geolocation: Arc<GeolocationResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        let metrics = registry
            .rails()
            .into_iter()
            .map(|rail| (rail, RailMetrics::new(rail)))
            .collect();

        Self {
            registry,
            ledger,
            geolocation,
            config,
            rail_metrics: Arc::new(RwLock::new(metrics)),
        }
    }

    pub fn registry(&self) -> &GatewayRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.ledger)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Availability
    // =========================================================================

    /// Static capability for `currency` with health tracking layered on top.
    pub async fn availability(
        &self,
        adapter: &dyn GatewayAdapter,
        currency: &str,
    ) -> GatewayAvailability {
        let mut availability = adapter.availability(currency);
        if availability.available && self.is_benched(adapter.rail()).await {
            availability.available = false;
        }
        availability
    }

    pub async fn is_benched(&self, rail: Rail) -> bool {
        self.rail_metrics
            .read()
            .await
            .get(&rail)
            .map(RailMetrics::is_benched)
            .unwrap_or(false)
    }

    pub async fn get_rail_metrics(&self) -> HashMap<Rail, RailMetrics> {
        self.rail_metrics.read().await.clone()
    }

    async fn record_success(&self, rail: Rail) {
        let mut metrics = self.rail_metrics.write().await;
        metrics
            .entry(rail)
            .or_insert_with(|| RailMetrics::new(rail))
            .record_success();
    }

    async fn record_failure(&self, rail: Rail) {
        let mut metrics = self.rail_metrics.write().await;
        let entry = metrics.entry(rail).or_insert_with(|| RailMetrics::new(rail));
        entry.record_failure(
            self.config.failure_threshold,
            Duration::from_secs(self.config.failure_cooldown_secs),
        );
        if entry.is_benched() {
            warn!(
                rail = %rail,
                consecutive_failures = entry.consecutive_failures,
                cooldown_secs = self.config.failure_cooldown_secs,
                "rail benched after repeated failures"
            );
        }
    }

    // =========================================================================
    // Intent creation
    // =========================================================================

    pub async fn create_payment_intent(
        &self,
        request: CreatePaymentIntent,
    ) -> OrchestratorResult<PaymentIntentResult> {
        let currency = CurrencyCode::parse(&request.currency)?;
        let amount = Money::new(request.amount_minor, currency.clone());
        amount.validate_positive("amount")?;
        validate_splits(&request.splits, amount.amount_minor)?;

        let metadata = match request.metadata {
            JsonValue::Null => JsonValue::Object(Default::default()),
            value @ JsonValue::Object(_) => value,
            _ => return Err(OrchestratorError::validation("metadata", "must be an object")),
        };

        if let Some(key) = &request.idempotency_key {
            validate_idempotency_key(key)?;
        }

        let geolocation = match request.client_ip {
            Some(ip) => self.geolocation.resolve(Some(ip)).await,
            None => self.geolocation.resolve_country(request.country_hint.as_deref()),
        };

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.ledger.find_intent_by_idempotency_key(key).await? {
                info!(intent_id = %existing.id, idempotency_key = %key, "returning existing intent for idempotency key");
                return Ok(PaymentIntentResult {
                    intent: existing,
                    geolocation,
                    attempted: Vec::new(),
                    replayed: true,
                });
            }
        }

        let hints = receivable_rails(&request.splits);
        let registered: Vec<Rail> = self
            .registry
            .rails()
            .into_iter()
            .filter(|rail| self.config.enabled_rails.contains(rail))
            .collect();
        let candidates = rank_candidates(geolocation.region, &currency, &hints, &registered);
        if candidates.is_empty() && !request.splits.is_empty() {
            return Err(OrchestratorError::NoReceivableRail);
        }

        let intent_id = Uuid::new_v4();
        let reference = intent_id.to_string();
        debug!(
            intent_id = %intent_id,
            region = ?geolocation.region,
            currency = %currency,
            candidates = ?candidates,
            "ranked rails for intent"
        );

        let mut attempted = Vec::new();
        let mut last_error: Option<String> = None;
        let mut accepted = None;

        for rail in candidates {
            let Some(adapter) = self.registry.get(rail) else {
                continue;
            };
            let availability = self.availability(adapter.as_ref(), currency.as_str()).await;
            if !availability.available {
                debug!(intent_id = %intent_id, rail = %rail, "rail unavailable for currency, skipping");
                continue;
            }

            attempted.push(rail);
            let attempt = CreateIntentRequest {
                reference: reference.clone(),
                amount: amount.clone(),
                customer_email: request.customer_email.clone(),
                description: request.description.clone(),
                callback_url: request.callback_url.clone(),
                metadata: metadata.clone(),
                splits: request.splits.clone(),
            };

            let outcome =
                tokio::time::timeout(self.rail_timeout(), adapter.create_intent(attempt)).await;
            match outcome {
                Ok(Ok(response)) => {
                    self.record_success(rail).await;
                    accepted = Some((adapter, response));
                    break;
                }
                Ok(Err(e)) => {
                    warn!(
                        intent_id = %intent_id,
                        rail = %rail,
                        error = %e,
                        "rail rejected intent, falling back"
                    );
                    self.record_failure(rail).await;
                    if e.is_retryable() {
                        self.discard_attempt(adapter.as_ref(), &reference).await;
                    }
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        intent_id = %intent_id,
                        rail = %rail,
                        timeout_secs = self.config.rail_timeout_secs,
                        "rail timed out, falling back"
                    );
                    self.record_failure(rail).await;
                    self.discard_attempt(adapter.as_ref(), &reference).await;
                    last_error = Some(format!(
                        "timed out after {}s",
                        self.config.rail_timeout_secs
                    ));
                }
            }
        }

        let Some((adapter, response)) = accepted else {
            error!(
                intent_id = %intent_id,
                attempted = ?attempted,
                last_error = ?last_error,
                "all gateways exhausted"
            );
            return Err(OrchestratorError::AllGatewaysExhausted {
                attempted,
                last_error,
            });
        };

        let deferred_payment = if request.deferred_payment {
            evaluate_deferred_payment(
                adapter.deferred_providers(),
                amount.amount_minor,
                self.config.deferred_min_minor,
                self.config.deferred_max_minor,
            )
        } else {
            None
        };

        let now = Utc::now();
        let intent = PaymentIntent {
            id: intent_id,
            amount_minor: amount.amount_minor,
            currency,
            rail: adapter.rail(),
            status: response.status,
            provider_reference: response.provider_reference,
            client_action_token: response.client_action_token,
            redirect_url: response.redirect_url,
            captured_amount: None,
            splits: request.splits,
            deferred_payment,
            idempotency_key: request.idempotency_key,
            metadata,
            created_at: now,
            expires_at: now + adapter.intent_ttl(),
            updated_at: now,
        };

        let intent = match self.ledger.insert_intent(intent).await {
            Ok(intent) => intent,
            Err(LedgerError::DuplicateIdempotencyKey(key)) => {
                // a concurrent request with the same key won the insert
                self.discard_attempt(adapter.as_ref(), &reference).await;
                let existing = self
                    .ledger
                    .find_intent_by_idempotency_key(&key)
                    .await?
                    .ok_or(LedgerError::DuplicateIdempotencyKey(key))?;
                return Ok(PaymentIntentResult {
                    intent: existing,
                    geolocation,
                    attempted,
                    replayed: true,
                });
            }
            Err(e) => {
                error!(intent_id = %intent_id, error = %e, "failed to record intent, discarding upstream attempt");
                self.discard_attempt(adapter.as_ref(), &reference).await;
                return Err(e.into());
            }
        };

        info!(
            intent_id = %intent.id,
            rail = %intent.rail,
            amount = intent.amount_minor,
            currency = %intent.currency,
            attempts = attempted.len(),
            "payment intent created"
        );

        Ok(PaymentIntentResult {
            intent,
            geolocation,
            attempted,
            replayed: false,
        })
    }

    pub async fn get_intent(&self, id: Uuid) -> OrchestratorResult<PaymentIntent> {
        self.ledger
            .get_intent(id)
            .await?
            .ok_or(OrchestratorError::IntentNotFound(id))
    }

    fn rail_timeout(&self) -> Duration {
        Duration::from_secs(self.config.rail_timeout_secs)
    }

    async fn discard_attempt(&self, adapter: &dyn GatewayAdapter, reference: &str) {
        let timeout = Duration::from_secs(self.config.discard_timeout_secs);
        match tokio::time::timeout(timeout, adapter.discard_attempt(reference)).await {
            Ok(Ok(())) => debug!(rail = %adapter.rail(), reference, "discarded abandoned attempt"),
            Ok(Err(e)) => warn!(
                rail = %adapter.rail(),
                reference,
                error = %e,
                "failed to discard abandoned attempt"
            ),
            Err(_) => warn!(rail = %adapter.rail(), reference, "timed out discarding abandoned attempt"),
        }
    }
}
