use crate::config::env_or;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{
    CreateIntentRequest, CreateIntentResponse, EventKind, NormalizedEvent, PaymentStatus, Rail,
    RailKind, RefundRequest, RefundResponse, RefundStatus, SettlementLatency, SplitCapability,
    TransferStatus, WebhookVerificationResult,
};
use crate::payments::utils::{header_str, verify_hmac_sha512_hex, HttpAuth, HttpBody, PaymentHttpClient};
use async_trait::async_trait;
use chrono::Duration;
use http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

const SIGNATURE_HEADER: &str = "x-paystack-signature";

#[derive(Debug, Clone)]
pub struct PaystackConfig {
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for PaystackConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: None,
            base_url: "https://api.paystack.co".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl PaystackConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let secret_key =
            std::env::var("PAYSTACK_SECRET_KEY").map_err(|_| PaymentError::ValidationError {
                message: "PAYSTACK_SECRET_KEY environment variable is required".to_string(),
                field: Some("PAYSTACK_SECRET_KEY".to_string()),
            })?;

        Ok(Self {
            webhook_secret: std::env::var("PAYSTACK_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("PAYSTACK_BASE_URL")
                .unwrap_or_else(|_| "https://api.paystack.co".to_string()),
            timeout_secs: env_or("PAYSTACK_TIMEOUT_SECS", 30),
            max_retries: env_or("PAYSTACK_MAX_RETRIES", 3),
            secret_key,
        })
    }
}

/// Regional mobile-money rail. Vendor shares ride along as a dynamic flat
/// split on the transaction, keyed by each vendor's `ACCT_` subaccount code.
pub struct PaystackAdapter {
    config: PaystackConfig,
    http: PaymentHttpClient,
}

impl PaystackAdapter {
    pub fn new(config: PaystackConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            "paystack",
            std::time::Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(PaystackConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn ensure_ok<T>(envelope: PaystackEnvelope<T>) -> PaymentResult<T> {
        if !envelope.status {
            return Err(PaymentError::ProviderError {
                provider: "paystack".to_string(),
                message: envelope.message,
                provider_code: None,
                retryable: false,
            });
        }
        Ok(envelope.data)
    }

    fn refund_status(raw: &str) -> RefundStatus {
        match raw {
            "processed" | "success" => RefundStatus::Succeeded,
            "failed" => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        }
    }
}

#[async_trait]
impl GatewayAdapter for PaystackAdapter {
    fn rail(&self) -> Rail {
        Rail::Paystack
    }

    fn kind(&self) -> RailKind {
        RailKind::MobileMoney
    }

    fn capability(&self) -> SplitCapability {
        SplitCapability::SubAccountRouting
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["NGN", "GHS", "ZAR", "USD"]
    }

    fn processing_fee_rate(&self) -> Decimal {
        Decimal::new(15, 3)
    }

    fn settlement(&self) -> SettlementLatency {
        SettlementLatency::NextDay
    }

    fn intent_ttl(&self) -> Duration {
        Duration::minutes(30)
    }

    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> PaymentResult<CreateIntentResponse> {
        request.amount.validate_positive("amount")?;
        let email = request
            .customer_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                PaymentError::provider("paystack", "customer email is required by paystack", false)
            })?;

        let mut payload = serde_json::json!({
            "email": email,
            "amount": request.amount.amount_minor,
            "currency": request.amount.currency.as_str(),
            "reference": request.reference,
            "callback_url": request.callback_url,
            "metadata": request.metadata,
        });

        if !request.splits.is_empty() {
            let mut subaccounts = Vec::with_capacity(request.splits.len());
            for split in &request.splits {
                let code = split.destination_for(Rail::Paystack).ok_or_else(|| {
                    PaymentError::provider(
                        "paystack",
                        format!("vendor {} has no paystack subaccount", split.vendor_id),
                        false,
                    )
                })?;
                let fee = crate::services::split_calculator::platform_fee(
                    split.allocated_amount,
                    split.fee_percentage,
                );
                subaccounts.push(serde_json::json!({
                    "subaccount": code,
                    "share": split.allocated_amount - fee,
                }));
            }
            payload["split"] = serde_json::json!({
                "type": "flat",
                "bearer_type": "account",
                "subaccounts": subaccounts,
            });
        }

        let raw: PaystackEnvelope<PaystackInitializeData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/transaction/initialize"),
                HttpAuth::Bearer(&self.config.secret_key),
                HttpBody::Json(&payload),
                &[],
            )
            .await?;
        let data = Self::ensure_ok(raw)?;
        info!(intent_id = %request.reference, "paystack transaction initialized");

        Ok(CreateIntentResponse {
            provider_reference: data.reference,
            status: PaymentStatus::Pending,
            client_action_token: Some(data.access_code),
            redirect_url: Some(data.authorization_url),
        })
    }

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<RefundResponse> {
        request.amount.validate_positive("amount")?;
        let payload = serde_json::json!({
            "transaction": request.provider_reference,
            "amount": request.amount.amount_minor,
            "currency": request.amount.currency.as_str(),
            "merchant_note": format!("{} ({})", request.reason.as_str(), request.idempotency_key),
        });

        let raw: PaystackEnvelope<PaystackRefundData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/refund"),
                HttpAuth::Bearer(&self.config.secret_key),
                HttpBody::Json(&payload),
                &[],
            )
            .await?;
        let data = Self::ensure_ok(raw)?;

        Ok(RefundResponse {
            provider_reference: data.id.to_string(),
            status: Self::refund_status(&data.status),
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookVerificationResult> {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .unwrap_or(&self.config.secret_key);
        let valid = header_str(headers, SIGNATURE_HEADER)
            .map(|signature| verify_hmac_sha512_hex(payload, secret, signature))
            .unwrap_or(false);
        Ok(WebhookVerificationResult {
            valid,
            reason: if valid {
                None
            } else {
                Some("invalid paystack signature".to_string())
            },
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<NormalizedEvent> {
        let parsed: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid webhook JSON payload: {}", e),
            }
        })?;

        let event_type = parsed
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let data = parsed.get("data").cloned().unwrap_or(JsonValue::Null);
        let str_at = |key: &str| data.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let id = data
            .get("id")
            .map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let amount = data.get("amount").and_then(|v| v.as_i64());

        let (kind, reference) = match event_type.as_str() {
            "charge.success" => (
                EventKind::Payment(PaymentStatus::Captured),
                str_at("reference"),
            ),
            "charge.failed" => (
                EventKind::Payment(PaymentStatus::Failed),
                str_at("reference"),
            ),
            "refund.processed" | "refund.failed" | "refund.pending" | "refund.processing" => {
                let status = match event_type.as_str() {
                    "refund.processed" => RefundStatus::Succeeded,
                    "refund.failed" => RefundStatus::Failed,
                    _ => RefundStatus::Pending,
                };
                let reference = (!id.is_empty())
                    .then(|| id.clone())
                    .or_else(|| str_at("refund_reference"));
                (EventKind::Refund(status), reference)
            }
            "transfer.success" => (
                EventKind::Transfer(TransferStatus::Paid),
                str_at("reference"),
            ),
            "transfer.failed" | "transfer.reversed" => (
                EventKind::Transfer(TransferStatus::Failed),
                str_at("reference"),
            ),
            other => {
                warn!(event_type = other, "unhandled paystack event type");
                (EventKind::Unhandled, None)
            }
        };
        let payment_intent_id = match &kind {
            EventKind::Payment(_) => reference.as_deref().and_then(|r| Uuid::parse_str(r).ok()),
            _ => None,
        };

        Ok(NormalizedEvent {
            event_id: format!("{}:{}", event_type, id),
            rail: Rail::Paystack,
            event_type,
            kind,
            reference,
            payment_intent_id,
            amount_minor: amount,
        })
    }

    fn normalize_status(&self, raw: &str) -> Option<PaymentStatus> {
        let status = match raw {
            "success" => PaymentStatus::Captured,
            "pending" | "ongoing" | "processing" | "queued" => PaymentStatus::Pending,
            "failed" => PaymentStatus::Failed,
            "abandoned" => PaymentStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Deserialize)]
struct PaystackEnvelope<T> {
    status: bool,
    message: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct PaystackInitializeData {
    authorization_url: String,
    access_code: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct PaystackRefundData {
    id: i64,
    status: String,
}
