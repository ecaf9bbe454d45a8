//! Marketplace checkout
//!
//! Turns a basket of vendor line items into one payment intent: items are
//! converted into the transaction currency, grouped into one split per
//! vendor, and Nigerian stamp duty is added on top of the vendor total.

use crate::error::AppError;
use crate::payments::types::{
    CurrencyCode, Money, Rail, ServiceType, SplitCalculation, VendorSplit,
};
use crate::services::compliance::{stamp_duty, vat_on_commission};
use crate::services::exchange_rate::{ExchangeRateError, ExchangeRateService};
use crate::services::payment_orchestrator::{
    CreatePaymentIntent, OrchestratorError, PaymentIntentResult, PaymentOrchestrator,
};
use crate::services::split_calculator::{calculate_splits, total_platform_fee};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error(transparent)]
    ExchangeRate(#[from] ExchangeRateError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Validation { field, message } => AppError::validation(field, message),
            CheckoutError::ExchangeRate(e) => e.into(),
            CheckoutError::Orchestrator(e) => e.into(),
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> CheckoutError {
    CheckoutError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutItem {
    pub vendor_id: String,
    pub service_type: ServiceType,
    pub amount_minor: i64,
    pub currency: String,
    pub fee_percentage: Decimal,
    #[serde(default)]
    pub destination_accounts: BTreeMap<Rail, String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    /// Currency the customer is charged in
    pub currency: String,
    pub items: Vec<CheckoutItem>,
    #[serde(default)]
    pub metadata: JsonValue,
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

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRate {
    pub from: String,
    pub to: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBreakdown {
    pub currency: String,
    /// Sum of vendor allocations
    pub subtotal: i64,
    pub stamp_duty: i64,
    pub total: i64,
    pub platform_commission: i64,
    pub platform_vat: i64,
    pub vendors: Vec<SplitCalculation>,
    pub rates: Vec<AppliedRate>,
}

#[derive(Debug, Clone)]
pub struct CheckoutResult {
    pub payment: PaymentIntentResult,
    pub breakdown: CheckoutBreakdown,
}

pub struct CheckoutService {
    orchestrator: Arc<PaymentOrchestrator>,
    rates: Arc<ExchangeRateService>,
}

impl CheckoutService {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, rates: Arc<ExchangeRateService>) -> Self {
        Self {
            orchestrator,
            rates,
        }
    }

    /// Price the basket without creating an intent.
    pub async fn quote(&self, request: &CheckoutRequest) -> Result<(Vec<VendorSplit>, CheckoutBreakdown), CheckoutError> {
        let currency = CurrencyCode::parse(&request.currency)
            .map_err(|_| invalid("currency", format!("unsupported currency {}", request.currency)))?;
        if request.items.is_empty() {
            return Err(invalid("items", "at least one item is required"));
        }

        let mut splits: Vec<VendorSplit> = Vec::new();
        let mut rates: Vec<AppliedRate> = Vec::new();

        for (index, item) in request.items.iter().enumerate() {
            if item.vendor_id.trim().is_empty() {
                return Err(invalid(&format!("items[{}].vendorId", index), "must not be empty"));
            }
            if item.amount_minor <= 0 {
                return Err(invalid(&format!("items[{}].amountMinor", index), "must be greater than zero"));
            }
            let item_currency = CurrencyCode::parse(&item.currency).map_err(|_| {
                invalid(&format!("items[{}].currency", index), format!("unsupported currency {}", item.currency))
            })?;

            let amount = Money::new(item.amount_minor, item_currency.clone());
            let converted = self.rates.convert(&amount, &currency).await?;
            if item_currency != currency
                && !rates.iter().any(|r| r.from == item_currency.as_str())
            {
                let quote = self.rates.quote(&item_currency, &currency).await?;
                rates.push(AppliedRate {
                    from: item_currency.to_string(),
                    to: currency.to_string(),
                    rate: quote.rate(),
                });
            }

            match splits.iter_mut().find(|s| s.vendor_id == item.vendor_id) {
                Some(split) => {
                    if split.fee_percentage != item.fee_percentage {
                        return Err(invalid(
                            &format!("items[{}].feePercentage", index),
                            format!("differs from earlier items for vendor {}", item.vendor_id),
                        ));
                    }
                    split.allocated_amount = split
                        .allocated_amount
                        .checked_add(converted.amount_minor)
                        .ok_or_else(|| invalid("items", "basket total overflows"))?;
                    for (rail, account) in &item.destination_accounts {
                        split
                            .destination_accounts
                            .entry(*rail)
                            .or_insert_with(|| account.clone());
                    }
                }
                None => splits.push(VendorSplit {
                    vendor_id: item.vendor_id.clone(),
                    destination_accounts: item.destination_accounts.clone(),
                    allocated_amount: converted.amount_minor,
                    fee_percentage: item.fee_percentage,
                    service_type: item.service_type,
                    description: item.description.clone(),
                }),
            }
        }

        if let Some(split) = splits.iter().find(|s| s.allocated_amount <= 0) {
            return Err(invalid(
                "items",
                format!("vendor {} converts to nothing in {}", split.vendor_id, currency),
            ));
        }

        let subtotal: i64 = splits.iter().map(|s| s.allocated_amount).sum();
        let duty = stamp_duty(&Money::new(subtotal, currency.clone()));
        let vendors = calculate_splits(&splits);
        let commission = total_platform_fee(&vendors);

        let breakdown = CheckoutBreakdown {
            currency: currency.to_string(),
            subtotal,
            stamp_duty: duty,
            total: subtotal + duty,
            platform_commission: commission,
            platform_vat: vat_on_commission(commission),
            vendors,
            rates,
        };
        Ok((splits, breakdown))
    }

    pub async fn checkout(
        &self,
        request: CheckoutRequest,
        client_ip: Option<IpAddr>,
    ) -> Result<CheckoutResult, CheckoutError> {
        let (splits, breakdown) = self.quote(&request).await?;

        let mut metadata = match request.metadata {
            JsonValue::Null => serde_json::Map::new(),
            JsonValue::Object(map) => map,
            _ => return Err(invalid("metadata", "must be an object")),
        };
        metadata.insert(
            "checkout".to_string(),
            json!({
                "subtotal": breakdown.subtotal,
                "stampDuty": breakdown.stamp_duty,
                "platformCommission": breakdown.platform_commission,
                "platformVat": breakdown.platform_vat,
            }),
        );

        let payment = self
            .orchestrator
            .create_payment_intent(CreatePaymentIntent {
                amount_minor: breakdown.total,
                currency: breakdown.currency.clone(),
                metadata: JsonValue::Object(metadata),
                splits,
                client_ip,
                country_hint: request.country,
                customer_email: request.customer_email,
                description: request.description,
                callback_url: request.callback_url,
                idempotency_key: request.idempotency_key,
                deferred_payment: request.deferred_payment,
            })
            .await?;

        info!(
            intent_id = %payment.intent.id,
            vendors = breakdown.vendors.len(),
            total = breakdown.total,
            stamp_duty = breakdown.stamp_duty,
            "checkout created"
        );
        Ok(CheckoutResult { payment, breakdown })
    }
}
