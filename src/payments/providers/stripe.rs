use crate::config::env_or;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{
    CreateIntentRequest, CreateIntentResponse, DeferredPaymentProvider, EventKind,
    NormalizedEvent, PaymentStatus, Rail, RailKind, RefundReason, RefundRequest, RefundResponse,
    RefundStatus, SettlementLatency, SplitCapability, TransferRequest, TransferResponse,
    TransferStatus, WebhookVerificationResult,
};
use crate::payments::utils::{
    hmac_sha256_hex, header_str, secure_eq, form_encode, HttpAuth, HttpBody, PaymentHttpClient,
};
use async_trait::async_trait;
use chrono::Duration;
use http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub signature_tolerance_secs: i64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: None,
            base_url: "https://api.stripe.com".to_string(),
            timeout_secs: 30,
            max_retries: 2,
            signature_tolerance_secs: 300,
        }
    }
}

impl StripeConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let secret_key =
            std::env::var("STRIPE_SECRET_KEY").map_err(|_| PaymentError::ValidationError {
                message: "STRIPE_SECRET_KEY environment variable is required".to_string(),
                field: Some("STRIPE_SECRET_KEY".to_string()),
            })?;
        let defaults = Self::default();

        Ok(Self {
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("STRIPE_BASE_URL").unwrap_or(defaults.base_url),
            timeout_secs: env_or("STRIPE_TIMEOUT_SECS", defaults.timeout_secs),
            max_retries: env_or("STRIPE_MAX_RETRIES", defaults.max_retries),
            signature_tolerance_secs: env_or(
                "STRIPE_SIGNATURE_TOLERANCE_SECS",
                defaults.signature_tolerance_secs,
            ),
            secret_key,
        })
    }
}

/// Card-network rail. Vendors are paid with Connect transfers after capture;
/// every intent carries `transfer_group = <intent id>` so transfers can be
/// traced back to the charge.
pub struct StripeAdapter {
    config: StripeConfig,
    http: PaymentHttpClient,
}

impl StripeAdapter {
    pub fn new(config: StripeConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            "stripe",
            std::time::Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> PaymentResult<T> {
        let headers: Vec<(&str, &str)> = idempotency_key
            .map(|key| vec![("Idempotency-Key", key)])
            .unwrap_or_default();
        self.http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(path),
                HttpAuth::Bearer(&self.config.secret_key),
                HttpBody::Form(form),
                &headers,
            )
            .await
    }

    /// Split a `Stripe-Signature` header into its timestamp and v1 signatures.
    fn parse_signature_header(header: &str) -> Option<(i64, Vec<&str>)> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            let (key, value) = part.trim().split_once('=')?;
            match key {
                "t" => timestamp = value.parse::<i64>().ok(),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
        Some((timestamp?, signatures))
    }

    fn verify_signature_at(
        &self,
        payload: &[u8],
        header: &str,
        now: i64,
    ) -> WebhookVerificationResult {
        let invalid = |reason: &str| WebhookVerificationResult {
            valid: false,
            reason: Some(reason.to_string()),
        };

        let Some(secret) = self.config.webhook_secret.as_deref() else {
            return invalid("stripe webhook secret not configured");
        };
        let Some((timestamp, signatures)) = Self::parse_signature_header(header) else {
            return invalid("malformed stripe-signature header");
        };
        if (now - timestamp).abs() > self.config.signature_tolerance_secs {
            return invalid("stripe signature timestamp outside tolerance");
        }

        let mut signed = timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let Some(expected) = hmac_sha256_hex(&signed, secret) else {
            return invalid("unable to compute stripe signature");
        };

        if signatures
            .iter()
            .any(|sig| secure_eq(expected.as_bytes(), sig.as_bytes()))
        {
            WebhookVerificationResult {
                valid: true,
                reason: None,
            }
        } else {
            invalid("invalid stripe signature")
        }
    }

    fn refund_status(raw: &str) -> RefundStatus {
        match raw {
            "succeeded" => RefundStatus::Succeeded,
            "failed" | "canceled" => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        }
    }

    fn transfer_status(event_type: &str, object: &StripeObject) -> TransferStatus {
        match object.status.as_deref() {
            Some("paid") => return TransferStatus::Paid,
            Some("failed") => return TransferStatus::Failed,
            Some("in_transit") => return TransferStatus::InTransit,
            _ => {}
        }
        if object.reversed.unwrap_or(false) {
            return TransferStatus::Failed;
        }
        match event_type {
            "transfer.paid" => TransferStatus::Paid,
            "transfer.failed" | "transfer.reversed" => TransferStatus::Failed,
            _ => TransferStatus::InTransit,
        }
    }
}

/// Flatten a JSON object into `metadata[key]=value` form pairs.
fn metadata_pairs(metadata: &JsonValue, out: &mut Vec<(String, String)>) {
    if let JsonValue::Object(map) = metadata {
        for (key, value) in map {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                _ => continue,
            };
            out.push((format!("metadata[{}]", key), value));
        }
    }
}

fn stripe_refund_reason(reason: RefundReason) -> Option<&'static str> {
    match reason {
        RefundReason::Duplicate => Some("duplicate"),
        RefundReason::Fraudulent => Some("fraudulent"),
        RefundReason::RequestedByCustomer => Some("requested_by_customer"),
        _ => None,
    }
}

#[async_trait]
impl GatewayAdapter for StripeAdapter {
    fn rail(&self) -> Rail {
        Rail::Stripe
    }

    fn kind(&self) -> RailKind {
        RailKind::CardNetwork
    }

    fn capability(&self) -> SplitCapability {
        SplitCapability::PostCaptureTransfer
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["USD", "EUR", "GBP", "CAD", "AUD", "KES", "ZAR"]
    }

    fn processing_fee_rate(&self) -> Decimal {
        Decimal::new(29, 3)
    }

    fn settlement(&self) -> SettlementLatency {
        SettlementLatency::TwoDays
    }

    fn intent_ttl(&self) -> Duration {
        Duration::minutes(15)
    }

    fn deferred_providers(&self) -> &'static [DeferredPaymentProvider] {
        &[
            DeferredPaymentProvider::Klarna,
            DeferredPaymentProvider::Afterpay,
        ]
    }

    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> PaymentResult<CreateIntentResponse> {
        request.amount.validate_positive("amount")?;

        let mut form = vec![
            ("amount".to_string(), request.amount.amount_minor.to_string()),
            (
                "currency".to_string(),
                request.amount.currency.as_str().to_lowercase(),
            ),
            (
                "description".to_string(),
                request
                    .description
                    .clone()
                    .unwrap_or_else(|| "Traveease booking".to_string()),
            ),
            (
                "statement_descriptor_suffix".to_string(),
                "TRAVEEASE".to_string(),
            ),
            ("transfer_group".to_string(), request.reference.clone()),
            ("metadata[intent_id]".to_string(), request.reference.clone()),
        ];
        if let Some(email) = request.customer_email.as_deref() {
            form.push(("receipt_email".to_string(), email.to_string()));
        }
        metadata_pairs(&request.metadata, &mut form);

        let intent: StripePaymentIntent = self
            .post_form("/v1/payment_intents", &form, Some(&request.reference))
            .await?;

        info!(
            intent_id = %request.reference,
            provider_reference = %intent.id,
            "stripe payment intent created"
        );

        Ok(CreateIntentResponse {
            status: self
                .normalize_status(&intent.status)
                .unwrap_or(PaymentStatus::Pending),
            provider_reference: intent.id,
            client_action_token: intent.client_secret,
            redirect_url: None,
        })
    }

    async fn discard_attempt(&self, reference: &str) -> PaymentResult<()> {
        let query = format!("metadata['intent_id']:'{}'", reference);
        let url = format!(
            "{}?{}",
            self.endpoint("/v1/payment_intents/search"),
            form_encode(&[("query".to_string(), query)])
        );
        let found: StripeList<StripePaymentIntent> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &url,
                HttpAuth::Bearer(&self.config.secret_key),
                HttpBody::Empty,
                &[],
            )
            .await?;

        for intent in found.data {
            if matches!(intent.status.as_str(), "succeeded" | "canceled") {
                continue;
            }
            let _: StripePaymentIntent = self
                .post_form(
                    &format!("/v1/payment_intents/{}/cancel", intent.id),
                    &[(
                        "cancellation_reason".to_string(),
                        "abandoned".to_string(),
                    )],
                    None,
                )
                .await?;
            info!(intent_id = %reference, provider_reference = %intent.id, "stripe attempt discarded");
        }
        Ok(())
    }

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<RefundResponse> {
        request.amount.validate_positive("amount")?;
        let mut form = vec![
            (
                "payment_intent".to_string(),
                request.provider_reference.clone(),
            ),
            ("amount".to_string(), request.amount.amount_minor.to_string()),
            (
                "metadata[refund_key]".to_string(),
                request.idempotency_key.clone(),
            ),
        ];
        if let Some(reason) = stripe_refund_reason(request.reason) {
            form.push(("reason".to_string(), reason.to_string()));
        }

        let refund: StripeRefund = self
            .post_form("/v1/refunds", &form, Some(&request.idempotency_key))
            .await?;

        Ok(RefundResponse {
            status: Self::refund_status(&refund.status),
            provider_reference: refund.id,
        })
    }

    async fn create_transfer(&self, request: TransferRequest) -> PaymentResult<TransferResponse> {
        request.amount.validate_positive("amount")?;
        let form = vec![
            ("amount".to_string(), request.amount.amount_minor.to_string()),
            (
                "currency".to_string(),
                request.amount.currency.as_str().to_lowercase(),
            ),
            ("destination".to_string(), request.destination.clone()),
            (
                "transfer_group".to_string(),
                request.payment_intent_id.to_string(),
            ),
            (
                "description".to_string(),
                format!("Payment for {}", request.service_type.as_str()),
            ),
            ("metadata[vendor_id]".to_string(), request.vendor_id.clone()),
            (
                "metadata[service_type]".to_string(),
                request.service_type.as_str().to_string(),
            ),
            (
                "metadata[intent_id]".to_string(),
                request.payment_intent_id.to_string(),
            ),
        ];

        let transfer: StripeObject = self
            .post_form("/v1/transfers", &form, Some(&request.dedupe_key))
            .await?;
        let id = transfer
            .id
            .clone()
            .ok_or_else(|| PaymentError::provider("stripe", "transfer response missing id", false))?;

        Ok(TransferResponse {
            status: Self::transfer_status("transfer.created", &transfer),
            transfer_reference: id,
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookVerificationResult> {
        let Some(header) = header_str(headers, SIGNATURE_HEADER) else {
            return Ok(WebhookVerificationResult {
                valid: false,
                reason: Some("missing stripe-signature header".to_string()),
            });
        };
        Ok(self.verify_signature_at(payload, header, chrono::Utc::now().timestamp()))
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<NormalizedEvent> {
        let event: StripeEvent = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid stripe event payload: {}", e),
            }
        })?;
        let object = event.data.object;
        let intent_id = object
            .metadata
            .get("intent_id")
            .and_then(|v| v.as_str())
            .and_then(|v| Uuid::parse_str(v).ok());

        let (kind, amount) = match event.event_type.as_str() {
            "payment_intent.succeeded" => (
                EventKind::Payment(PaymentStatus::Captured),
                object.amount_received.or(object.amount),
            ),
            "payment_intent.amount_capturable_updated" | "payment_intent.processing" => {
                (EventKind::Payment(PaymentStatus::Authorized), object.amount)
            }
            "payment_intent.canceled" => (EventKind::Payment(PaymentStatus::Cancelled), None),
            "payment_intent.payment_failed" => (EventKind::Payment(PaymentStatus::Failed), None),
            "refund.created" | "refund.updated" | "charge.refund.updated" => (
                EventKind::Refund(Self::refund_status(
                    object.status.as_deref().unwrap_or("pending"),
                )),
                object.amount,
            ),
            t if t.starts_with("transfer.") => (
                EventKind::Transfer(Self::transfer_status(t, &object)),
                object.amount,
            ),
            other => {
                warn!(event_type = other, "unhandled stripe event type");
                (EventKind::Unhandled, None)
            }
        };

        Ok(NormalizedEvent {
            event_id: event.id,
            rail: Rail::Stripe,
            event_type: event.event_type,
            kind,
            reference: object.id,
            payment_intent_id: intent_id,
            amount_minor: amount,
        })
    }

    fn normalize_status(&self, raw: &str) -> Option<PaymentStatus> {
        let status = match raw {
            "requires_payment_method" | "requires_confirmation" | "requires_action" => {
                PaymentStatus::Pending
            }
            "processing" | "requires_capture" => PaymentStatus::Authorized,
            "canceled" => PaymentStatus::Cancelled,
            "succeeded" => PaymentStatus::Captured,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeObject,
}

/// Loose view over the objects Stripe embeds in events: payment intents,
/// refunds and transfers share these fields.
#[derive(Debug, Default, Deserialize)]
struct StripeObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    reversed: Option<bool>,
    #[serde(default)]
    metadata: serde_json::Map<String, JsonValue>,
}
