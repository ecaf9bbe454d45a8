//! HTTP surface tests
//!
//! Drive the router with `oneshot` against scripted rails and the
//! in-memory ledger.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::{harness, IntentBehavior, SIGNATURE_HEADER, VALID_SIGNATURE};
use serde_json::{json, Value};
use tower::ServiceExt;
use traveease_payments::payments::types::Rail;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, http::HeaderMap) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json, headers)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn create_intent_returns_created_with_a_request_id() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    let app = h.router();

    let (status, body, headers) = send(
        &app,
        post_json(
            "/payments/intents",
            json!({ "amountMinorUnits": 25_000, "currency": "usd" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["rail"], "stripe");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["amountMinorUnits"], 25_000);
    assert_eq!(body["currency"], "USD");
    assert!(body["clientActionToken"].is_string());
    assert!(headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn idempotency_header_replays_with_ok() {
    let h = harness(&[Rail::Stripe]);
    let app = h.router();
    let request = || {
        Request::builder()
            .method("POST")
            .uri("/payments/intents")
            .header("content-type", "application/json")
            .header("idempotency-key", "booking-991")
            .body(Body::from(
                json!({ "amountMinorUnits": 9_900, "currency": "USD" }).to_string(),
            ))
            .unwrap()
    };

    let (first_status, first, _) = send(&app, request()).await;
    let (second_status, second, _) = send(&app, request()).await;

    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);
}

#[tokio::test]
async fn invalid_intents_answer_bad_request() {
    let h = harness(&[Rail::Stripe]);
    let app = h.router();

    let (status, body, _) = send(
        &app,
        post_json(
            "/payments/intents",
            json!({ "amountMinorUnits": -5, "currency": "USD" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn exhausted_rails_answer_service_unavailable() {
    let h = harness(&[Rail::Stripe]);
    h.adapter(Rail::Stripe).behave(IntentBehavior::Unavailable);
    let app = h.router();

    let (status, body, _) = send(
        &app,
        post_json(
            "/payments/intents",
            json!({ "amountMinorUnits": 1_000, "currency": "USD" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "ALL_GATEWAYS_EXHAUSTED");
}

#[tokio::test]
async fn unknown_intent_is_not_found() {
    let h = harness(&[Rail::Stripe]);
    let app = h.router();

    let (status, _, _) = send(
        &app,
        get(&format!("/payments/intents/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_capture_then_refund_round_trip() {
    let h = harness(&[Rail::Stripe]);
    let app = h.router();

    let (_, created, _) = send(
        &app,
        post_json(
            "/payments/intents",
            json!({
                "amountMinorUnits": 40_000,
                "currency": "USD",
                "splits": [{
                    "vendorId": "hotel_lagos",
                    "destinationAccounts": { "stripe": "acct_hotel" },
                    "allocatedAmount": 40_000,
                    "feePercentage": "12.5",
                    "serviceType": "hotel"
                }]
            }),
        ),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    let event = json!({ "id": "evt_http_cap", "kind": "payment", "status": "captured", "intentId": id });
    let webhook = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header(SIGNATURE_HEADER, VALID_SIGNATURE)
        .body(Body::from(event.to_string()))
        .unwrap();
    let (status, outcome, _) = send(&app, webhook).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "applied");

    let (status, transfers, _) =
        send(&app, get(&format!("/payments/intents/{}/transfers", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(transfers.as_array().unwrap().len(), 1);
    assert_eq!(transfers[0]["amountMinor"], 35_000);
    assert!(transfers[0].get("transferReference").is_none());
    assert!(transfers[0].get("dedupeKey").is_none());

    let (status, refund, _) = send(
        &app,
        post_json(
            "/payments/refunds",
            json!({
                "paymentIntentId": id,
                "amount": 10_000,
                "reason": "requested_by_customer"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(refund["amount"], 10_000);

    let (status, too_much, _) = send(
        &app,
        post_json(
            "/payments/refunds",
            json!({
                "paymentIntentId": id,
                "amount": 30_001,
                "reason": "requested_by_customer"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(too_much["error"], "REFUND_EXCEEDS_CAPTURED");

    let (status, detail, _) = send(&app, get(&format!("/payments/intents/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["intent"]["status"], "partially_refunded");
    assert_eq!(detail["refunds"].as_array().unwrap().len(), 1);
    let listed = &detail["transfers"][0];
    assert_eq!(listed["vendorId"], "hotel_lagos");
    assert!(listed.get("transferReference").is_none());
    assert!(listed.get("dedupeKey").is_none());
}

#[tokio::test]
async fn forged_webhooks_are_unauthorized() {
    let h = harness(&[Rail::Stripe]);
    let app = h.router();

    let webhook = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header(SIGNATURE_HEADER, "forged")
        .body(Body::from(
            json!({ "id": "evt_x", "kind": "payment", "status": "captured" }).to_string(),
        ))
        .unwrap();
    let (status, body, _) = send(&app, webhook).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "WEBHOOK_SIGNATURE_INVALID");
}

#[tokio::test]
async fn checkout_quote_prices_without_creating_an_intent() {
    let h = harness(&[Rail::Paystack]);
    let app = h.router();

    let (status, breakdown, _) = send(
        &app,
        post_json(
            "/payments/checkout/quote",
            json!({
                "currency": "NGN",
                "items": [{
                    "vendorId": "hotel_lagos",
                    "serviceType": "hotel",
                    "amountMinor": 2_000_000,
                    "currency": "NGN",
                    "feePercentage": "10",
                    "destinationAccounts": { "paystack": "ACCT_hotel" }
                }]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(breakdown["stampDuty"], 5_000);
    assert_eq!(breakdown["total"], 2_005_000);
    assert_eq!(h.adapter(Rail::Paystack).calls(), 0);
}

#[tokio::test]
async fn health_reports_each_rail() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    let app = h.router();

    let (status, body, _) = send(&app, get("/payments/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["rails"]["stripe"]["available"], true);
    assert_eq!(body["ledger"]["status"], "up");

    let (status, live, _) = send(&app, get("/health/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(live["status"], "alive");
}
