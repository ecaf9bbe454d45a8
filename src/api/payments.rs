use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::health::HealthStatus;
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::types::{
    DeferredPaymentOffer, PaymentIntent, PaymentStatus, Rail, Refund, RefundSplit, RefundStatus,
    Transfer, VendorSplit,
};
use crate::services::checkout::{CheckoutBreakdown, CheckoutRequest};
use crate::services::payment_orchestrator::{CreatePaymentIntent, PaymentIntentResult};
use crate::services::refund_coordinator::MultiVendorRefund;
use crate::services::split_distributor::MarketplaceCharge;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::net::IpAddr;
use tracing::info;
use uuid::Uuid;

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentBody {
    pub amount_minor_units: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: JsonValue,
    #[serde(default)]
    pub splits: Vec<VendorSplit>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub deferred_payment: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub id: Uuid,
    pub status: PaymentStatus,
    pub rail: Rail,
    pub amount_minor_units: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_action_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred_payment: Option<DeferredPaymentOffer>,
}

impl From<&PaymentIntent> for IntentResponse {
    fn from(intent: &PaymentIntent) -> Self {
        Self {
            id: intent.id,
            status: intent.status,
            rail: intent.rail,
            amount_minor_units: intent.amount_minor,
            currency: intent.currency.to_string(),
            client_action_token: intent.client_action_token.clone(),
            redirect_url: intent.redirect_url.clone(),
            expires_at: intent.expires_at,
            deferred_payment: intent.deferred_payment.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentDetailResponse {
    pub intent: PaymentIntent,
    pub refunds: Vec<RefundResponse>,
    pub transfers: Vec<Transfer>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResponse {
    pub id: Uuid,
    pub payment_intent_id: Uuid,
    pub status: RefundStatus,
    pub amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub splits: Vec<RefundSplit>,
}

impl From<Refund> for RefundResponse {
    fn from(refund: Refund) -> Self {
        Self {
            id: refund.id,
            payment_intent_id: refund.payment_intent_id,
            status: refund.status,
            amount: refund.amount_minor,
            currency: refund.currency.to_string(),
            splits: refund.splits,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub payment: IntentResponse,
    pub breakdown: CheckoutBreakdown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeBody {
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
}

fn idempotency_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn with_request_id(headers: &HeaderMap) -> impl Fn(AppError) -> AppError + '_ {
    move |err| match get_request_id_from_headers(headers) {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}

fn intent_status_code(result: &PaymentIntentResult) -> StatusCode {
    if result.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /payments/intents
pub async fn create_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateIntentBody>,
) -> AppResult<impl IntoResponse> {
    let request = CreatePaymentIntent {
        amount_minor: body.amount_minor_units,
        currency: body.currency,
        metadata: body.metadata,
        splits: body.splits,
        client_ip: client_ip(&headers),
        country_hint: body.country,
        customer_email: body.customer_email,
        description: body.description,
        callback_url: body.callback_url,
        idempotency_key: body.idempotency_key.or_else(|| idempotency_header(&headers)),
        deferred_payment: body.deferred_payment,
    };

    let result = state
        .orchestrator
        .create_payment_intent(request)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;

    info!(
        intent_id = %result.intent.id,
        rail = %result.intent.rail,
        attempted = ?result.attempted,
        replayed = result.replayed,
        "payment intent created"
    );
    Ok((
        intent_status_code(&result),
        Json(IntentResponse::from(&result.intent)),
    ))
}

/// GET /payments/intents/{id}
pub async fn get_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Json<IntentDetailResponse>> {
    let intent = state
        .orchestrator
        .get_intent(id)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    let ledger = state.orchestrator.ledger();
    let refunds = ledger
        .refunds_for(id)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    let transfers = ledger
        .transfers_for(id)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;

    Ok(Json(IntentDetailResponse {
        intent,
        refunds: refunds.into_iter().map(RefundResponse::from).collect(),
        transfers,
    }))
}

/// GET /payments/intents/{id}/transfers
pub async fn list_transfers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<Transfer>>> {
    // 404 for unknown intents rather than an empty list
    state
        .orchestrator
        .get_intent(id)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    let transfers = state
        .orchestrator
        .ledger()
        .transfers_for(id)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    Ok(Json(transfers))
}

/// POST /payments/intents/{id}/distribute
pub async fn distribute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<DistributeBody>>,
) -> AppResult<Json<MarketplaceCharge>> {
    let dedupe_key = body
        .and_then(|Json(b)| b.dedupe_key)
        .or_else(|| idempotency_header(&headers))
        .unwrap_or_else(|| format!("settle:{}", id));
    let charge = state
        .distributor
        .distribute(id, &dedupe_key)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    Ok(Json(charge))
}

/// POST /payments/transfers/{id}/retry
pub async fn retry_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Transfer>> {
    let transfer = state
        .distributor
        .retry_transfer(id)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    Ok(Json(transfer))
}

/// POST /payments/refunds
pub async fn create_refund(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<MultiVendorRefund>,
) -> AppResult<impl IntoResponse> {
    let refund = state
        .refunds
        .handle_multi_vendor_refund(body)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    Ok((StatusCode::CREATED, Json(RefundResponse::from(refund))))
}

/// POST /payments/checkout
pub async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<CheckoutRequest>,
) -> AppResult<impl IntoResponse> {
    if body.idempotency_key.is_none() {
        body.idempotency_key = idempotency_header(&headers);
    }
    let result = state
        .checkout
        .checkout(body, client_ip(&headers))
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;

    Ok((
        intent_status_code(&result.payment),
        Json(CheckoutResponse {
            payment: IntentResponse::from(&result.payment.intent),
            breakdown: result.breakdown,
        }),
    ))
}

/// POST /payments/checkout/quote
pub async fn quote_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutBreakdown>> {
    let (_, breakdown) = state
        .checkout
        .quote(&body)
        .await
        .map_err(AppError::from)
        .map_err(with_request_id(&headers))?;
    Ok(Json(breakdown))
}

/// GET /payments/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status: HealthStatus = state.health.check_health().await;
    let code = if status.rails.values().any(|r| r.available) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// GET /health/live
pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}
