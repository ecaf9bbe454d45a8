use crate::cache::TtlCache;
use crate::config::env_or;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{
    CreateIntentRequest, CreateIntentResponse, CurrencyCode, DeferredPaymentProvider, EventKind,
    Money, MultiReceiverRequest, MultiReceiverResponse, NormalizedEvent, PaymentStatus, Rail,
    RailKind, Receiver, RefundRequest, RefundResponse, RefundStatus, SettlementLatency,
    SplitCapability, TransferRequest, TransferResponse, TransferStatus,
    WebhookVerificationResult,
};
use crate::payments::utils::{
    header_str, json_major_amount, major_to_minor, minor_to_major, HttpAuth, HttpBody,
    PaymentHttpClient,
};
use async_trait::async_trait;
use chrono::Duration;
use http::HeaderMap;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

const TOKEN_KEY: &str = "access_token";

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: Option<String>,
    pub base_url: String,
    pub return_url: String,
    pub cancel_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub token_ttl_secs: u64,
}

impl Default for PayPalConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            webhook_id: None,
            base_url: "https://api-m.paypal.com".to_string(),
            return_url: "https://traveease.com/payment/success".to_string(),
            cancel_url: "https://traveease.com/payment/cancel".to_string(),
            timeout_secs: 30,
            max_retries: 2,
            token_ttl_secs: 1800,
        }
    }
}

impl PayPalConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let required = |key: &str| {
            std::env::var(key).map_err(|_| PaymentError::ValidationError {
                message: format!("{} environment variable is required", key),
                field: Some(key.to_string()),
            })
        };
        let client_id = required("PAYPAL_CLIENT_ID")?;
        let client_secret = required("PAYPAL_CLIENT_SECRET")?;
        let defaults = Self::default();

        Ok(Self {
            webhook_id: std::env::var("PAYPAL_WEBHOOK_ID").ok(),
            base_url: std::env::var("PAYPAL_BASE_URL").unwrap_or(defaults.base_url),
            return_url: std::env::var("PAYPAL_RETURN_URL").unwrap_or(defaults.return_url),
            cancel_url: std::env::var("PAYPAL_CANCEL_URL").unwrap_or(defaults.cancel_url),
            timeout_secs: env_or("PAYPAL_TIMEOUT_SECS", defaults.timeout_secs),
            max_retries: env_or("PAYPAL_MAX_RETRIES", defaults.max_retries),
            token_ttl_secs: env_or("PAYPAL_TOKEN_TTL_SECS", defaults.token_ttl_secs),
            client_id,
            client_secret,
        })
    }
}

/// Wallet rail. Orders are approved by the payer on PayPal; vendor shares go
/// out in one Payouts batch per distribution.
pub struct PayPalAdapter {
    config: PayPalConfig,
    http: PaymentHttpClient,
    tokens: TtlCache<&'static str, String>,
}

impl PayPalAdapter {
    pub fn new(config: PayPalConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            "paypal",
            std::time::Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        let tokens = TtlCache::new(std::time::Duration::from_secs(config.token_ttl_secs));
        Ok(Self {
            config,
            http,
            tokens,
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(PayPalConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn access_token(&self) -> PaymentResult<std::sync::Arc<String>> {
        self.tokens
            .get_or_refresh(TOKEN_KEY, || async {
                let form = [("grant_type".to_string(), "client_credentials".to_string())];
                let token: PayPalToken = self
                    .http
                    .request_json(
                        reqwest::Method::POST,
                        &self.endpoint("/v1/oauth2/token"),
                        HttpAuth::Basic(&self.config.client_id, &self.config.client_secret),
                        HttpBody::Form(&form),
                        &[],
                    )
                    .await?;
                Ok::<_, PaymentError>(token.access_token)
            })
            .await
    }

    /// Authenticated call; an expired token is dropped and the call retried once.
    async fn authed<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: HttpBody<'_>,
        headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let url = self.endpoint(path);
        let token = self.access_token().await?;
        let first = self
            .http
            .request_json(method.clone(), &url, HttpAuth::Bearer(&token), body, headers)
            .await;

        match first {
            Err(PaymentError::ProviderError {
                provider_code: Some(ref code),
                ..
            }) if code == "401" => {
                self.tokens.invalidate(&TOKEN_KEY).await;
                let token = self.access_token().await?;
                self.http
                    .request_json(method, &url, HttpAuth::Bearer(&token), body, headers)
                    .await
            }
            other => other,
        }
    }

    fn amount_json(amount: &Money) -> JsonValue {
        serde_json::json!({
            "currency_code": amount.currency.as_str(),
            "value": minor_to_major(amount.amount_minor, amount.currency.minor_unit_exponent()).to_string(),
        })
    }

    fn payout_item(receiver: &Receiver, currency: &CurrencyCode, sender_item_id: String) -> JsonValue {
        let recipient_type = if receiver.account.contains('@') {
            "EMAIL"
        } else {
            "PAYPAL_ID"
        };
        serde_json::json!({
            "recipient_type": recipient_type,
            "receiver": receiver.account,
            "amount": {
                "currency": currency.as_str(),
                "value": minor_to_major(receiver.amount_minor, currency.minor_unit_exponent()).to_string(),
            },
            "sender_item_id": sender_item_id,
            "note": "Traveease marketplace settlement",
        })
    }

    fn batch_status(raw: &str) -> TransferStatus {
        match raw {
            "SUCCESS" => TransferStatus::Paid,
            "DENIED" | "CANCELED" | "FAILED" => TransferStatus::Failed,
            _ => TransferStatus::InTransit,
        }
    }

    fn refund_status(raw: &str) -> RefundStatus {
        match raw {
            "COMPLETED" => RefundStatus::Succeeded,
            "FAILED" | "CANCELLED" => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        }
    }

    async fn submit_payout(
        &self,
        sender_batch_id: &str,
        items: Vec<JsonValue>,
    ) -> PaymentResult<PayPalBatchHeader> {
        let payload = serde_json::json!({
            "sender_batch_header": {
                "sender_batch_id": sender_batch_id,
                "email_subject": "You have a payout from Traveease",
            },
            "items": items,
        });
        let response: PayPalPayoutResponse = self
            .authed(
                reqwest::Method::POST,
                "/v1/payments/payouts",
                HttpBody::Json(&payload),
                &[("PayPal-Request-Id", sender_batch_id)],
            )
            .await?;
        Ok(response.batch_header)
    }
}

#[async_trait]
impl GatewayAdapter for PayPalAdapter {
    fn rail(&self) -> Rail {
        Rail::PayPal
    }

    fn kind(&self) -> RailKind {
        RailKind::Wallet
    }

    fn capability(&self) -> SplitCapability {
        SplitCapability::MultiReceiverPayment
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["USD", "EUR", "GBP", "AUD", "CAD"]
    }

    fn processing_fee_rate(&self) -> Decimal {
        Decimal::new(349, 4)
    }

    fn settlement(&self) -> SettlementLatency {
        SettlementLatency::NextDay
    }

    fn intent_ttl(&self) -> Duration {
        Duration::hours(3)
    }

    fn deferred_providers(&self) -> &'static [DeferredPaymentProvider] {
        &[DeferredPaymentProvider::PaypalPayLater]
    }

    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> PaymentResult<CreateIntentResponse> {
        request.amount.validate_positive("amount")?;

        let mut payload = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.reference,
                "custom_id": request.reference,
                "amount": Self::amount_json(&request.amount),
                "description": request.description.clone().unwrap_or_else(|| "Traveease booking".to_string()),
            }],
            "application_context": {
                "brand_name": "Traveease",
                "return_url": request.callback_url.clone().unwrap_or_else(|| self.config.return_url.clone()),
                "cancel_url": self.config.cancel_url,
                "user_action": "PAY_NOW",
            },
        });
        if let Some(email) = request.customer_email.as_deref() {
            payload["payer"] = serde_json::json!({ "email_address": email });
        }

        let order: PayPalOrder = self
            .authed(
                reqwest::Method::POST,
                "/v2/checkout/orders",
                HttpBody::Json(&payload),
                &[("PayPal-Request-Id", request.reference.as_str())],
            )
            .await?;

        let redirect_url = order
            .links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone());
        info!(intent_id = %request.reference, order_id = %order.id, "paypal order created");

        Ok(CreateIntentResponse {
            status: self
                .normalize_status(&order.status)
                .unwrap_or(PaymentStatus::Pending),
            provider_reference: order.id,
            client_action_token: None,
            redirect_url,
        })
    }

    // Unapproved orders cannot be charged and lapse on their own, so an
    // abandoned attempt needs no cleanup call.

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<RefundResponse> {
        request.amount.validate_positive("amount")?;

        let order: PayPalOrder = self
            .authed(
                reqwest::Method::GET,
                &format!("/v2/checkout/orders/{}", request.provider_reference),
                HttpBody::Empty,
                &[],
            )
            .await?;
        let capture_id = order
            .purchase_units
            .iter()
            .filter_map(|u| u.payments.as_ref())
            .flat_map(|p| p.captures.iter())
            .map(|c| c.id.clone())
            .next()
            .ok_or_else(|| {
                PaymentError::provider(
                    "paypal",
                    format!("order {} has no capture to refund", request.provider_reference),
                    false,
                )
            })?;

        let payload = serde_json::json!({
            "amount": Self::amount_json(&request.amount),
            "note_to_payer": request.reason.as_str(),
        });
        let refund: PayPalRefund = self
            .authed(
                reqwest::Method::POST,
                &format!("/v2/payments/captures/{}/refund", capture_id),
                HttpBody::Json(&payload),
                &[("PayPal-Request-Id", request.idempotency_key.as_str())],
            )
            .await?;

        Ok(RefundResponse {
            status: Self::refund_status(&refund.status),
            provider_reference: refund.id,
        })
    }

    async fn create_transfer(&self, request: TransferRequest) -> PaymentResult<TransferResponse> {
        request.amount.validate_positive("amount")?;
        let receiver = Receiver {
            account: request.destination.clone(),
            amount_minor: request.amount.amount_minor,
            vendor_id: Some(request.vendor_id.clone()),
        };
        let item = Self::payout_item(&receiver, &request.amount.currency, request.dedupe_key.clone());
        let header = self.submit_payout(&request.dedupe_key, vec![item]).await?;

        Ok(TransferResponse {
            status: Self::batch_status(&header.batch_status),
            transfer_reference: header.payout_batch_id,
        })
    }

    async fn submit_multi_receiver(
        &self,
        request: MultiReceiverRequest,
    ) -> PaymentResult<MultiReceiverResponse> {
        if request.receivers.is_empty() {
            return Err(PaymentError::ValidationError {
                message: "multi-receiver payment needs at least one receiver".to_string(),
                field: Some("receivers".to_string()),
            });
        }
        let items = request
            .receivers
            .iter()
            .map(|r| {
                let item_id = format!(
                    "{}:{}",
                    request.dedupe_key,
                    r.vendor_id.as_deref().unwrap_or("platform")
                );
                Self::payout_item(r, &request.currency, item_id)
            })
            .collect();

        let header = self.submit_payout(&request.dedupe_key, items).await?;
        info!(
            intent_id = %request.payment_intent_id,
            batch_id = %header.payout_batch_id,
            receivers = request.receivers.len(),
            "paypal payout batch submitted"
        );

        Ok(MultiReceiverResponse {
            status: Self::batch_status(&header.batch_status),
            batch_reference: header.payout_batch_id,
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookVerificationResult> {
        let invalid = |reason: &str| -> PaymentResult<WebhookVerificationResult> {
            Ok(WebhookVerificationResult {
                valid: false,
                reason: Some(reason.to_string()),
            })
        };

        let Some(webhook_id) = self.config.webhook_id.as_deref() else {
            return invalid("paypal webhook id not configured");
        };
        let names = [
            "paypal-auth-algo",
            "paypal-cert-url",
            "paypal-transmission-id",
            "paypal-transmission-sig",
            "paypal-transmission-time",
        ];
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            match header_str(headers, name) {
                Some(v) => values.push(v),
                None => return invalid("missing paypal transmission headers"),
            }
        }
        let event: JsonValue = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return invalid("webhook body is not JSON"),
        };

        let request = serde_json::json!({
            "auth_algo": values[0],
            "cert_url": values[1],
            "transmission_id": values[2],
            "transmission_sig": values[3],
            "transmission_time": values[4],
            "webhook_id": webhook_id,
            "webhook_event": event,
        });
        let verdict: PayPalVerification = self
            .authed(
                reqwest::Method::POST,
                "/v1/notifications/verify-webhook-signature",
                HttpBody::Json(&request),
                &[],
            )
            .await?;

        if verdict.verification_status == "SUCCESS" {
            Ok(WebhookVerificationResult {
                valid: true,
                reason: None,
            })
        } else {
            invalid("paypal rejected webhook signature")
        }
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<NormalizedEvent> {
        let event: PayPalEvent = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid paypal event payload: {}", e),
            }
        })?;
        let resource = &event.resource;
        let str_at = |pointer: &str| {
            resource
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        };
        let amount = || {
            let currency = str_at("/amount/currency_code")
                .and_then(|c| CurrencyCode::parse(&c).ok())?;
            let value = json_major_amount(resource.pointer("/amount/value")?)?;
            major_to_minor(value, currency.minor_unit_exponent())
        };
        let intent_id = str_at("/custom_id")
            .or_else(|| str_at("/purchase_units/0/custom_id"))
            .and_then(|v| Uuid::parse_str(&v).ok());

        let (kind, reference, amount_minor) = match event.event_type.as_str() {
            "CHECKOUT.ORDER.APPROVED" => (
                EventKind::Payment(PaymentStatus::Authorized),
                str_at("/id"),
                None,
            ),
            "CHECKOUT.ORDER.VOIDED" => (
                EventKind::Payment(PaymentStatus::Cancelled),
                str_at("/id"),
                None,
            ),
            "PAYMENT.CAPTURE.COMPLETED" => (
                EventKind::Payment(PaymentStatus::Captured),
                str_at("/supplementary_data/related_ids/order_id"),
                amount(),
            ),
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => (
                EventKind::Payment(PaymentStatus::Failed),
                str_at("/supplementary_data/related_ids/order_id"),
                None,
            ),
            "PAYMENT.CAPTURE.REFUNDED" => (
                EventKind::Refund(Self::refund_status(
                    str_at("/status").as_deref().unwrap_or("COMPLETED"),
                )),
                str_at("/id"),
                amount(),
            ),
            "PAYMENT.PAYOUTSBATCH.SUCCESS"
            | "PAYMENT.PAYOUTSBATCH.DENIED"
            | "PAYMENT.PAYOUTSBATCH.PROCESSING" => (
                EventKind::Transfer(Self::batch_status(
                    str_at("/batch_header/batch_status")
                        .as_deref()
                        .unwrap_or("PROCESSING"),
                )),
                str_at("/batch_header/payout_batch_id"),
                None,
            ),
            other => {
                warn!(event_type = other, "unhandled paypal event type");
                (EventKind::Unhandled, str_at("/id"), None)
            }
        };

        Ok(NormalizedEvent {
            event_id: event.id,
            rail: Rail::PayPal,
            event_type: event.event_type,
            kind,
            reference,
            payment_intent_id: intent_id,
            amount_minor,
        })
    }

    fn normalize_status(&self, raw: &str) -> Option<PaymentStatus> {
        let status = match raw {
            "CREATED" | "PAYER_ACTION_REQUIRED" => PaymentStatus::Pending,
            "SAVED" | "APPROVED" => PaymentStatus::Authorized,
            "VOIDED" => PaymentStatus::Cancelled,
            "COMPLETED" => PaymentStatus::Captured,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Debug, Deserialize)]
struct PayPalToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PayPalOrder {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<PayPalLink>,
    #[serde(default)]
    purchase_units: Vec<PayPalPurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct PayPalLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PayPalPurchaseUnit {
    #[serde(default)]
    payments: Option<PayPalPayments>,
}

#[derive(Debug, Deserialize)]
struct PayPalPayments {
    #[serde(default)]
    captures: Vec<PayPalCapture>,
}

#[derive(Debug, Deserialize)]
struct PayPalCapture {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PayPalRefund {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PayPalPayoutResponse {
    batch_header: PayPalBatchHeader,
}

#[derive(Debug, Deserialize)]
struct PayPalBatchHeader {
    payout_batch_id: String,
    batch_status: String,
}

#[derive(Debug, Deserialize)]
struct PayPalVerification {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct PayPalEvent {
    id: String,
    event_type: String,
    #[serde(default)]
    resource: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> PayPalAdapter {
        PayPalAdapter::new(PayPalConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            ..PayPalConfig::default()
        })
        .expect("adapter init should succeed")
    }

    #[test]
    fn capture_completed_maps_to_order_reference_and_minor_amount() {
        let adapter = adapter();
        let intent_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": "WH-1",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAP-9",
                "status": "COMPLETED",
                "custom_id": intent_id.to_string(),
                "amount": {"currency_code": "USD", "value": "1200.50"},
                "supplementary_data": {"related_ids": {"order_id": "ORDER-7"}}
            }
        });
        let event = adapter
            .parse_webhook_event(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(event.kind, EventKind::Payment(PaymentStatus::Captured));
        assert_eq!(event.reference.as_deref(), Some("ORDER-7"));
        assert_eq!(event.payment_intent_id, Some(intent_id));
        assert_eq!(event.amount_minor, Some(120050));
    }

    #[test]
    fn payout_batch_events_become_transfer_updates() {
        let adapter = adapter();
        let payload = serde_json::json!({
            "id": "WH-2",
            "event_type": "PAYMENT.PAYOUTSBATCH.DENIED",
            "resource": {"batch_header": {"payout_batch_id": "B-1", "batch_status": "DENIED"}}
        });
        let event = adapter
            .parse_webhook_event(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(event.kind, EventKind::Transfer(TransferStatus::Failed));
        assert_eq!(event.reference.as_deref(), Some("B-1"));
    }

    #[tokio::test]
    async fn webhook_without_transmission_headers_is_rejected() {
        let adapter = PayPalAdapter::new(PayPalConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            webhook_id: Some("WH-ID".to_string()),
            ..PayPalConfig::default()
        })
        .unwrap();
        let result = adapter
            .verify_webhook(b"{}", &HeaderMap::new())
            .await
            .unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn order_status_map() {
        let adapter = adapter();
        assert_eq!(
            adapter.normalize_status("APPROVED"),
            Some(PaymentStatus::Authorized)
        );
        assert_eq!(
            adapter.normalize_status("COMPLETED"),
            Some(PaymentStatus::Captured)
        );
        assert_eq!(
            adapter.normalize_status("PAYER_ACTION_REQUIRED"),
            Some(PaymentStatus::Pending)
        );
    }

    #[test]
    fn payout_items_pick_recipient_type() {
        let usd = CurrencyCode::parse("USD").unwrap();
        let email = PayPalAdapter::payout_item(
            &Receiver {
                account: "vendor@example.com".to_string(),
                amount_minor: 1050,
                vendor_id: Some("v1".to_string()),
            },
            &usd,
            "k:v1".to_string(),
        );
        assert_eq!(email["recipient_type"], "EMAIL");
        assert_eq!(email["amount"]["value"], "10.50");

        let id = PayPalAdapter::payout_item(
            &Receiver {
                account: "MERCHANT123".to_string(),
                amount_minor: 5,
                vendor_id: None,
            },
            &usd,
            "k:platform".to_string(),
        );
        assert_eq!(id["recipient_type"], "PAYPAL_ID");
    }
}
