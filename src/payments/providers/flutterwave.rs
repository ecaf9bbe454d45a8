use crate::config::env_or;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{
    CreateIntentRequest, CreateIntentResponse, CurrencyCode, EventKind, NormalizedEvent,
    PaymentStatus, Rail, RailKind, RefundRequest, RefundResponse, RefundStatus,
    SettlementLatency, SplitCapability, TransferStatus, WebhookVerificationResult,
};
use crate::payments::utils::{
    header_str, json_major_amount, major_to_minor, minor_to_major, secure_eq, HttpAuth, HttpBody,
    PaymentHttpClient,
};
use async_trait::async_trait;
use chrono::Duration;
use http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

const SIGNATURE_HEADER: &str = "verif-hash";

#[derive(Debug, Clone)]
pub struct FlutterwaveConfig {
    pub secret_key: String,
    pub webhook_secret_hash: Option<String>,
    pub base_url: String,
    pub redirect_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for FlutterwaveConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret_hash: None,
            base_url: "https://api.flutterwave.com/v3".to_string(),
            redirect_url: "https://traveease.com/payment/complete".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl FlutterwaveConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let secret_key =
            std::env::var("FLUTTERWAVE_SECRET_KEY").map_err(|_| PaymentError::ValidationError {
                message: "FLUTTERWAVE_SECRET_KEY environment variable is required".to_string(),
                field: Some("FLUTTERWAVE_SECRET_KEY".to_string()),
            })?;
        let defaults = Self::default();

        Ok(Self {
            webhook_secret_hash: std::env::var("FLUTTERWAVE_WEBHOOK_HASH").ok(),
            base_url: std::env::var("FLUTTERWAVE_BASE_URL").unwrap_or(defaults.base_url),
            redirect_url: std::env::var("FLUTTERWAVE_REDIRECT_URL")
                .unwrap_or(defaults.redirect_url),
            timeout_secs: env_or("FLUTTERWAVE_TIMEOUT_SECS", defaults.timeout_secs),
            max_retries: env_or("FLUTTERWAVE_MAX_RETRIES", defaults.max_retries),
            secret_key,
        })
    }
}

/// Regional mobile-money rail. Vendor shares are registered as subaccounts on
/// the hosted payment, so Flutterwave routes them at settlement.
pub struct FlutterwaveAdapter {
    config: FlutterwaveConfig,
    http: PaymentHttpClient,
}

impl FlutterwaveAdapter {
    pub fn new(config: FlutterwaveConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            "flutterwave",
            std::time::Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(FlutterwaveConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn ensure_success<T>(envelope: FlutterwaveEnvelope<T>) -> PaymentResult<T> {
        if envelope.status != "success" {
            return Err(PaymentError::provider(
                "flutterwave",
                envelope.message,
                false,
            ));
        }
        envelope
            .data
            .ok_or_else(|| PaymentError::provider("flutterwave", "response missing data", false))
    }

    /// Flutterwave refunds address the numeric transaction id, which only
    /// exists once the customer has paid; resolve it from our `tx_ref`.
    async fn transaction_id(&self, tx_ref: &str) -> PaymentResult<i64> {
        let url = format!(
            "{}?{}",
            self.endpoint("/transactions/verify_by_reference"),
            crate::payments::utils::form_encode(&[("tx_ref".to_string(), tx_ref.to_string())])
        );
        let raw: FlutterwaveEnvelope<FlutterwaveTransaction> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &url,
                HttpAuth::Bearer(&self.config.secret_key),
                HttpBody::Empty,
                &[],
            )
            .await?;
        Ok(Self::ensure_success(raw)?.id)
    }

    fn refund_status(raw: &str) -> RefundStatus {
        match raw.to_ascii_lowercase().as_str() {
            "completed" | "successful" => RefundStatus::Succeeded,
            "failed" => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        }
    }
}

#[async_trait]
impl GatewayAdapter for FlutterwaveAdapter {
    fn rail(&self) -> Rail {
        Rail::Flutterwave
    }

    fn kind(&self) -> RailKind {
        RailKind::MobileMoney
    }

    fn capability(&self) -> SplitCapability {
        SplitCapability::SubAccountRouting
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["NGN", "GHS", "KES", "TZS", "UGX", "ZAR", "XOF", "USD", "EUR"]
    }

    fn processing_fee_rate(&self) -> Decimal {
        Decimal::new(14, 3)
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
        let exponent = request.amount.currency.minor_unit_exponent();

        let mut subaccounts = Vec::with_capacity(request.splits.len());
        for split in &request.splits {
            let account = split.destination_for(Rail::Flutterwave).ok_or_else(|| {
                PaymentError::provider(
                    "flutterwave",
                    format!("vendor {} has no flutterwave subaccount", split.vendor_id),
                    false,
                )
            })?;
            let fee = crate::services::split_calculator::platform_fee(
                split.allocated_amount,
                split.fee_percentage,
            );
            subaccounts.push(serde_json::json!({
                "id": account,
                "transaction_charge_type": "flat_subaccount",
                "transaction_charge": minor_to_major(split.allocated_amount - fee, exponent).to_string(),
            }));
        }

        let payload = serde_json::json!({
            "tx_ref": request.reference,
            "amount": minor_to_major(request.amount.amount_minor, exponent).to_string(),
            "currency": request.amount.currency.as_str(),
            "redirect_url": request.callback_url.clone().unwrap_or_else(|| self.config.redirect_url.clone()),
            "payment_options": "card,mobilemoney,ussd",
            "customer": { "email": request.customer_email },
            "customizations": {
                "title": "Traveease Booking",
                "description": request.description,
            },
            "meta": request.metadata,
            "subaccounts": subaccounts,
        });

        let raw: FlutterwaveEnvelope<FlutterwaveLink> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/payments"),
                HttpAuth::Bearer(&self.config.secret_key),
                HttpBody::Json(&payload),
                &[],
            )
            .await?;
        let data = Self::ensure_success(raw)?;
        info!(intent_id = %request.reference, "flutterwave hosted payment created");

        Ok(CreateIntentResponse {
            provider_reference: request.reference,
            status: PaymentStatus::Pending,
            client_action_token: None,
            redirect_url: Some(data.link),
        })
    }

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<RefundResponse> {
        request.amount.validate_positive("amount")?;
        let transaction_id = self.transaction_id(&request.provider_reference).await?;
        let payload = serde_json::json!({
            "amount": minor_to_major(
                request.amount.amount_minor,
                request.amount.currency.minor_unit_exponent()
            ).to_string(),
            "comments": request.reason.as_str(),
        });

        let raw: FlutterwaveEnvelope<FlutterwaveRefund> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("/transactions/{}/refund", transaction_id)),
                HttpAuth::Bearer(&self.config.secret_key),
                HttpBody::Json(&payload),
                &[],
            )
            .await?;
        let refund = Self::ensure_success(raw)?;

        Ok(RefundResponse {
            provider_reference: refund.id.to_string(),
            status: Self::refund_status(&refund.status),
        })
    }

    async fn verify_webhook(
        &self,
        _payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookVerificationResult> {
        let Some(expected) = self.config.webhook_secret_hash.as_deref() else {
            return Ok(WebhookVerificationResult {
                valid: false,
                reason: Some("flutterwave webhook hash not configured".to_string()),
            });
        };
        let valid = header_str(headers, SIGNATURE_HEADER)
            .map(|given| secure_eq(given.trim().as_bytes(), expected.as_bytes()))
            .unwrap_or(false);
        Ok(WebhookVerificationResult {
            valid,
            reason: if valid {
                None
            } else {
                Some("invalid flutterwave verif-hash".to_string())
            },
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<NormalizedEvent> {
        let event: FlutterwaveEvent = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid flutterwave event payload: {}", e),
            }
        })?;
        let data = &event.data;
        let str_at = |key: &str| data.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let id = data
            .get("id")
            .map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let status = str_at("status").unwrap_or_default();
        let amount = str_at("currency")
            .and_then(|c| CurrencyCode::parse(&c).ok())
            .and_then(|currency| {
                let value = json_major_amount(data.get("amount")?)?;
                major_to_minor(value, currency.minor_unit_exponent())
            });

        let (kind, reference) = match event.event.as_str() {
            "charge.completed" => (
                self.normalize_status(&status)
                    .map(EventKind::Payment)
                    .unwrap_or(EventKind::Unhandled),
                str_at("tx_ref"),
            ),
            "transfer.completed" => {
                let transfer = match status.to_ascii_uppercase().as_str() {
                    "SUCCESSFUL" => TransferStatus::Paid,
                    "FAILED" => TransferStatus::Failed,
                    _ => TransferStatus::InTransit,
                };
                (EventKind::Transfer(transfer), str_at("reference"))
            }
            "refund.completed" => (
                EventKind::Refund(Self::refund_status(&status)),
                Some(id.clone()),
            ),
            other => {
                warn!(event_type = other, "unhandled flutterwave event type");
                (EventKind::Unhandled, None)
            }
        };
        let payment_intent_id = match &kind {
            EventKind::Payment(_) => reference.as_deref().and_then(|r| Uuid::parse_str(r).ok()),
            _ => None,
        };

        Ok(NormalizedEvent {
            // Flutterwave sends no event id; the object id plus status is
            // unique per delivery of a given state change.
            event_id: format!("{}:{}:{}", event.event, id, status),
            rail: Rail::Flutterwave,
            event_type: event.event,
            kind,
            reference,
            payment_intent_id,
            amount_minor: amount,
        })
    }

    fn normalize_status(&self, raw: &str) -> Option<PaymentStatus> {
        let status = match raw {
            "pending" => PaymentStatus::Pending,
            "failed" => PaymentStatus::Failed,
            "successful" => PaymentStatus::Captured,
            "cancelled" => PaymentStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Deserialize)]
struct FlutterwaveEnvelope<T> {
    status: String,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FlutterwaveLink {
    link: String,
}

#[derive(Debug, Deserialize)]
struct FlutterwaveTransaction {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct FlutterwaveRefund {
    id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct FlutterwaveEvent {
    event: String,
    #[serde(default)]
    data: serde_json::Map<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> FlutterwaveAdapter {
        FlutterwaveAdapter::new(FlutterwaveConfig {
            secret_key: "FLWSECK_TEST".to_string(),
            webhook_secret_hash: Some("hash-123".to_string()),
            ..FlutterwaveConfig::default()
        })
        .expect("adapter init should succeed")
    }

    #[tokio::test]
    async fn verif_hash_must_match_configured_secret() {
        let adapter = adapter();
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, "hash-123".parse().unwrap());
        assert!(adapter.verify_webhook(b"{}", &headers).await.unwrap().valid);

        headers.insert(SIGNATURE_HEADER, "wrong".parse().unwrap());
        assert!(!adapter.verify_webhook(b"{}", &headers).await.unwrap().valid);
        assert!(!adapter
            .verify_webhook(b"{}", &HeaderMap::new())
            .await
            .unwrap()
            .valid);
    }

    #[test]
    fn charge_completed_uses_tx_ref_as_intent_id() {
        let adapter = adapter();
        let intent_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "event": "charge.completed",
            "data": {
                "id": 285959875,
                "tx_ref": intent_id.to_string(),
                "status": "successful",
                "amount": 15000,
                "currency": "NGN"
            }
        });
        let event = adapter
            .parse_webhook_event(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(event.kind, EventKind::Payment(PaymentStatus::Captured));
        assert_eq!(event.payment_intent_id, Some(intent_id));
        assert_eq!(event.amount_minor, Some(1_500_000));
        assert_eq!(event.event_id, "charge.completed:285959875:successful");
    }

    #[test]
    fn unknown_charge_status_is_unhandled() {
        let adapter = adapter();
        let payload = serde_json::json!({
            "event": "charge.completed",
            "data": {"id": 1, "tx_ref": "x", "status": "weird"}
        });
        let event = adapter
            .parse_webhook_event(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(event.kind, EventKind::Unhandled);
    }
}
