//! Multi-vendor checkout pricing: currency conversion, per-vendor grouping
//! and Nigerian compliance charges.

mod common;

use common::harness;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::BTreeMap;
use traveease_payments::payments::types::{Rail, ServiceType};
use traveease_payments::services::checkout::CheckoutItem;
use traveease_payments::services::{CheckoutError, CheckoutRequest};

fn item(vendor: &str, amount: i64, currency: &str, service: ServiceType) -> CheckoutItem {
    let mut destination_accounts = BTreeMap::new();
    destination_accounts.insert(Rail::Paystack, format!("ACCT_{}", vendor));
    CheckoutItem {
        vendor_id: vendor.to_string(),
        service_type: service,
        amount_minor: amount,
        currency: currency.to_string(),
        fee_percentage: dec!(10),
        destination_accounts,
        description: None,
    }
}

fn naira_basket() -> CheckoutRequest {
    CheckoutRequest {
        currency: "NGN".to_string(),
        items: vec![
            item("airline_1", 10_000, "USD", ServiceType::Flight),
            item("hotel_lagos", 300_000, "NGN", ServiceType::Hotel),
            item("hotel_lagos", 200_000, "NGN", ServiceType::Hotel),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn quote_converts_groups_and_adds_stamp_duty() {
    let h = harness(&[Rail::Paystack]);

    let (splits, breakdown) = h.checkout.quote(&naira_basket()).await.unwrap();

    assert_eq!(splits.len(), 2);
    let airline = splits.iter().find(|s| s.vendor_id == "airline_1").unwrap();
    assert_eq!(airline.allocated_amount, 15_502_500);
    let hotel = splits.iter().find(|s| s.vendor_id == "hotel_lagos").unwrap();
    assert_eq!(hotel.allocated_amount, 500_000);

    assert_eq!(breakdown.subtotal, 16_002_500);
    assert_eq!(breakdown.stamp_duty, 5_000);
    assert_eq!(breakdown.total, 16_007_500);
    assert_eq!(breakdown.platform_commission, 1_550_250 + 50_000);
    assert_eq!(breakdown.platform_vat, 120_018);
    assert_eq!(breakdown.rates.len(), 1);
    assert_eq!(breakdown.rates[0].from, "USD");
}

#[tokio::test]
async fn small_naira_baskets_carry_no_duty() {
    let h = harness(&[Rail::Paystack]);
    let request = CheckoutRequest {
        currency: "NGN".to_string(),
        items: vec![item("tour_abuja", 1_000_000, "NGN", ServiceType::Tour)],
        ..Default::default()
    };

    let (_, breakdown) = h.checkout.quote(&request).await.unwrap();
    assert_eq!(breakdown.stamp_duty, 0);
    assert_eq!(breakdown.total, 1_000_000);
    assert!(breakdown.rates.is_empty());
}

#[tokio::test]
async fn checkout_creates_one_intent_for_the_whole_basket() {
    let h = harness(&[Rail::Paystack]);
    let request = CheckoutRequest {
        metadata: json!({ "tripId": "trip_42" }),
        ..naira_basket()
    };

    let result = h.checkout.checkout(request, None).await.unwrap();
    let intent = &result.payment.intent;

    assert_eq!(intent.rail, Rail::Paystack);
    assert_eq!(intent.amount_minor, 16_007_500);
    assert_eq!(intent.splits.len(), 2);
    assert_eq!(intent.metadata["tripId"], "trip_42");
    assert_eq!(intent.metadata["checkout"]["stampDuty"], 5_000);
}

#[tokio::test]
async fn inconsistent_baskets_are_rejected() {
    let h = harness(&[Rail::Paystack]);

    let empty = CheckoutRequest {
        currency: "NGN".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        h.checkout.quote(&empty).await,
        Err(CheckoutError::Validation { .. })
    ));

    let mut conflicting = naira_basket();
    conflicting.items[2].fee_percentage = dec!(12);
    assert!(matches!(
        h.checkout.quote(&conflicting).await,
        Err(CheckoutError::Validation { .. })
    ));

    let unpriced = CheckoutRequest {
        currency: "NGN".to_string(),
        items: vec![item("tour_accra", 50_000, "XOF", ServiceType::Tour)],
        ..Default::default()
    };
    assert!(matches!(
        h.checkout.quote(&unpriced).await,
        Err(CheckoutError::ExchangeRate(_))
    ));
}
