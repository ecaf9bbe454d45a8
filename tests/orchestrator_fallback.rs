//! Rail selection and sequential fallback through the orchestrator
//!
//! Scripted rails stand in for the real gateways; the in-memory ledger
//! records what was accepted.

mod common;

use common::{harness, vendor_split, IntentBehavior};
use serde_json::json;
use traveease_payments::ledger::Ledger;
use traveease_payments::payments::types::{PaymentStatus, Rail};
use traveease_payments::services::{CreatePaymentIntent, OrchestratorError};

fn usd_request(amount: i64) -> CreatePaymentIntent {
    CreatePaymentIntent {
        amount_minor: amount,
        currency: "USD".to_string(),
        metadata: json!({ "bookingId": "bk_1001" }),
        ..Default::default()
    }
}

#[tokio::test]
async fn primary_rail_accepts_without_fallback() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);

    let result = h
        .orchestrator
        .create_payment_intent(usd_request(25_000))
        .await
        .unwrap();

    assert_eq!(result.intent.rail, Rail::Stripe);
    assert_eq!(result.attempted, vec![Rail::Stripe]);
    assert_eq!(result.intent.status, PaymentStatus::Pending);
    assert!(result.intent.client_action_token.is_some());
    assert_eq!(h.adapter(Rail::PayPal).calls(), 0);

    let stored = h.ledger.get_intent(result.intent.id).await.unwrap().unwrap();
    assert_eq!(stored.amount_minor, 25_000);
    assert_eq!(stored.metadata["bookingId"], "bk_1001");
}

#[tokio::test]
async fn retryable_failure_falls_back_and_discards_the_attempt() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    h.adapter(Rail::Stripe).behave(IntentBehavior::Unavailable);

    let result = h
        .orchestrator
        .create_payment_intent(usd_request(10_000))
        .await
        .unwrap();

    assert_eq!(result.intent.rail, Rail::PayPal);
    assert_eq!(result.attempted, vec![Rail::Stripe, Rail::PayPal]);
    assert_eq!(
        h.adapter(Rail::Stripe).discarded_references(),
        vec![result.intent.id.to_string()]
    );
}

#[tokio::test]
async fn declined_rail_falls_back_without_discard() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    h.adapter(Rail::Stripe).behave(IntentBehavior::Decline);

    let result = h
        .orchestrator
        .create_payment_intent(usd_request(10_000))
        .await
        .unwrap();

    assert_eq!(result.intent.rail, Rail::PayPal);
    assert!(h.adapter(Rail::Stripe).discarded_references().is_empty());
}

#[tokio::test]
async fn hung_rail_is_cut_off_by_the_timeout() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    h.adapter(Rail::Stripe).behave(IntentBehavior::Hang);

    let started = std::time::Instant::now();
    let result = h
        .orchestrator
        .create_payment_intent(usd_request(10_000))
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(result.intent.rail, Rail::PayPal);
    assert_eq!(h.adapter(Rail::Stripe).discarded_references().len(), 1);
}

#[tokio::test]
async fn every_rail_failing_exhausts_the_chain() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    h.adapter(Rail::Stripe).behave(IntentBehavior::Unavailable);
    h.adapter(Rail::PayPal).behave(IntentBehavior::Decline);

    let err = h
        .orchestrator
        .create_payment_intent(usd_request(10_000))
        .await
        .unwrap_err();

    match err {
        OrchestratorError::AllGatewaysExhausted {
            attempted,
            last_error,
        } => {
            assert_eq!(attempted, vec![Rail::Stripe, Rail::PayPal]);
            assert!(last_error.unwrap().contains("declined"));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
}

#[tokio::test]
async fn african_currency_goes_to_mobile_money_first() {
    let h = harness(&[Rail::Stripe, Rail::Flutterwave, Rail::Paystack]);

    let result = h
        .orchestrator
        .create_payment_intent(CreatePaymentIntent {
            amount_minor: 1_500_000,
            currency: "NGN".to_string(),
            country_hint: Some("NG".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(result.intent.rail, Rail::Paystack);
    assert_eq!(h.adapter(Rail::Stripe).calls(), 0);
}

#[tokio::test]
async fn unsupported_currency_rails_are_skipped_not_attempted() {
    let h = harness(&[Rail::PayPal, Rail::Flutterwave]);

    let result = h
        .orchestrator
        .create_payment_intent(CreatePaymentIntent {
            amount_minor: 300_000,
            currency: "KES".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(result.intent.rail, Rail::Flutterwave);
    assert_eq!(result.attempted, vec![Rail::Flutterwave]);
    assert_eq!(h.adapter(Rail::PayPal).calls(), 0);
}

#[tokio::test]
async fn vendor_destinations_narrow_the_candidates() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);

    let result = h
        .orchestrator
        .create_payment_intent(CreatePaymentIntent {
            splits: vec![
                vendor_split("hotel_lagos", 6_000, 10, &[Rail::PayPal]),
                vendor_split("tour_abuja", 4_000, 15, &[Rail::Stripe, Rail::PayPal]),
            ],
            ..usd_request(10_000)
        })
        .await
        .unwrap();

    assert_eq!(result.intent.rail, Rail::PayPal);
    assert_eq!(h.adapter(Rail::Stripe).calls(), 0);
    assert!(result.intent.has_splits());
}

#[tokio::test]
async fn vendors_without_a_shared_rail_are_rejected() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);

    let err = h
        .orchestrator
        .create_payment_intent(CreatePaymentIntent {
            splits: vec![
                vendor_split("hotel_lagos", 6_000, 10, &[Rail::PayPal]),
                vendor_split("car_nairobi", 4_000, 10, &[Rail::Stripe]),
            ],
            ..usd_request(10_000)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::NoReceivableRail));
    assert_eq!(h.adapter(Rail::Stripe).calls(), 0);
    assert_eq!(h.adapter(Rail::PayPal).calls(), 0);
}

#[tokio::test]
async fn idempotency_key_replays_the_first_intent() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    let request = CreatePaymentIntent {
        idempotency_key: Some("checkout-7f3a".to_string()),
        ..usd_request(12_000)
    };

    let first = h
        .orchestrator
        .create_payment_intent(request.clone())
        .await
        .unwrap();
    let second = h.orchestrator.create_payment_intent(request).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.intent.id, second.intent.id);
    assert_eq!(h.adapter(Rail::Stripe).calls(), 1);
}

#[tokio::test]
async fn invalid_requests_never_reach_a_rail() {
    let h = harness(&[Rail::Stripe]);

    let zero = h.orchestrator.create_payment_intent(usd_request(0)).await;
    assert!(matches!(zero, Err(OrchestratorError::Validation { .. })));

    let bad_currency = h
        .orchestrator
        .create_payment_intent(CreatePaymentIntent {
            currency: "usd1".to_string(),
            ..usd_request(100)
        })
        .await;
    assert!(matches!(bad_currency, Err(OrchestratorError::Validation { .. })));

    let over_allocated = h
        .orchestrator
        .create_payment_intent(CreatePaymentIntent {
            splits: vec![vendor_split("hotel_lagos", 20_000, 10, &[Rail::Stripe])],
            ..usd_request(10_000)
        })
        .await;
    assert!(matches!(over_allocated, Err(OrchestratorError::Split(_))));

    assert_eq!(h.adapter(Rail::Stripe).calls(), 0);
}

#[tokio::test]
async fn repeated_failures_bench_a_rail() {
    let h = harness(&[Rail::Stripe, Rail::PayPal]);
    h.adapter(Rail::Stripe).behave(IntentBehavior::Unavailable);

    for _ in 0..3 {
        h.orchestrator
            .create_payment_intent(usd_request(5_000))
            .await
            .unwrap();
    }
    assert!(h.orchestrator.is_benched(Rail::Stripe).await);

    let result = h
        .orchestrator
        .create_payment_intent(usd_request(5_000))
        .await
        .unwrap();
    assert_eq!(result.attempted, vec![Rail::PayPal]);
    assert_eq!(h.adapter(Rail::Stripe).calls(), 3);
}

#[tokio::test]
async fn deferred_payment_is_offered_only_when_requested() {
    let h = harness(&[Rail::Stripe]);

    let plain = h
        .orchestrator
        .create_payment_intent(usd_request(60_000))
        .await
        .unwrap();
    assert!(plain.intent.deferred_payment.is_none());

    let offered = h
        .orchestrator
        .create_payment_intent(CreatePaymentIntent {
            deferred_payment: true,
            ..usd_request(60_000)
        })
        .await
        .unwrap();
    let offer = offered.intent.deferred_payment.unwrap();
    assert!(offer.eligible);
    assert!(!offer.providers.is_empty());
    assert_eq!(offer.representative_plan.unwrap().installment_amount, 20_000);
}
