use crate::payments::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Rails
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Rail {
    Stripe,
    PayPal,
    Flutterwave,
    Paystack,
}

impl Rail {
    pub const ALL: [Rail; 4] = [Rail::Stripe, Rail::PayPal, Rail::Flutterwave, Rail::Paystack];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rail::Stripe => "stripe",
            Rail::PayPal => "paypal",
            Rail::Flutterwave => "flutterwave",
            Rail::Paystack => "paystack",
        }
    }
}

impl std::fmt::Display for Rail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Rail {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "stripe" => Ok(Rail::Stripe),
            "paypal" => Ok(Rail::PayPal),
            "flutterwave" => Ok(Rail::Flutterwave),
            "paystack" => Ok(Rail::Paystack),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported rail: {}", value),
                field: Some("rail".to_string()),
            }),
        }
    }
}

/// Broad class of processor behind a rail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RailKind {
    CardNetwork,
    Wallet,
    MobileMoney,
}

/// How a rail moves marketplace funds to vendors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitCapability {
    /// Splits are registered with the charge and routed by the rail at settlement.
    SubAccountRouting,
    /// One transfer per vendor is issued after capture.
    PostCaptureTransfer,
    /// One payment request naming every receiver.
    MultiReceiverPayment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementLatency {
    SameDay,
    NextDay,
    TwoDays,
}

// ============================================================================
// Regions and currencies
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Us,
    Eu,
    Africa,
    Apac,
    Latam,
    Global,
}

impl Region {
    /// Rails in the order customers in this region habitually pay with.
    pub fn preferred_rails(&self) -> &'static [Rail] {
        match self {
            Region::Us => &[Rail::Stripe, Rail::PayPal],
            Region::Eu => &[Rail::Stripe, Rail::PayPal],
            Region::Africa => &[Rail::Flutterwave, Rail::Paystack, Rail::Stripe],
            Region::Apac => &[Rail::Stripe, Rail::PayPal],
            Region::Latam => &[Rail::PayPal, Rail::Stripe],
            Region::Global => &[Rail::Stripe, Rail::PayPal],
        }
    }

    pub fn for_country(country: &str) -> Region {
        match country.to_uppercase().as_str() {
            "US" | "CA" => Region::Us,
            "MX" | "BR" | "AR" | "CO" | "CL" | "PE" => Region::Latam,
            "DE" | "FR" | "GB" | "IE" | "NL" | "ES" | "IT" | "PT" | "BE" | "AT" | "SE" => {
                Region::Eu
            }
            "NG" | "GH" | "KE" | "ZA" | "UG" | "TZ" | "RW" | "CI" | "SN" | "EG" => Region::Africa,
            "SG" | "JP" | "AU" | "NZ" | "IN" | "HK" | "MY" | "PH" => Region::Apac,
            _ => Region::Global,
        }
    }
}

/// ISO 4217 codes accepted by the engine, with their minor-unit exponent.
const CURRENCIES: &[(&str, u32)] = &[
    ("AED", 2),
    ("ARS", 2),
    ("AUD", 2),
    ("BHD", 3),
    ("BRL", 2),
    ("CAD", 2),
    ("CHF", 2),
    ("CLP", 0),
    ("CNY", 2),
    ("COP", 2),
    ("CZK", 2),
    ("DKK", 2),
    ("EGP", 2),
    ("EUR", 2),
    ("GBP", 2),
    ("GHS", 2),
    ("HKD", 2),
    ("INR", 2),
    ("JOD", 3),
    ("JPY", 0),
    ("KES", 2),
    ("KRW", 0),
    ("KWD", 3),
    ("MAD", 2),
    ("MXN", 2),
    ("MYR", 2),
    ("NGN", 2),
    ("NOK", 2),
    ("NZD", 2),
    ("OMR", 3),
    ("PEN", 2),
    ("PHP", 2),
    ("PLN", 2),
    ("RWF", 0),
    ("SAR", 2),
    ("SEK", 2),
    ("SGD", 2),
    ("THB", 2),
    ("TND", 3),
    ("TZS", 2),
    ("UGX", 0),
    ("USD", 2),
    ("XAF", 0),
    ("XOF", 0),
    ("ZAR", 2),
    ("ZMW", 2),
];

pub fn currency_for_country(country: &str) -> Option<&'static str> {
    let currency = match country.to_uppercase().as_str() {
        "US" => "USD",
        "CA" => "CAD",
        "GB" => "GBP",
        "DE" | "FR" | "IE" | "NL" | "ES" | "IT" | "PT" | "BE" | "AT" => "EUR",
        "SE" => "SEK",
        "NG" => "NGN",
        "GH" => "GHS",
        "KE" => "KES",
        "ZA" => "ZAR",
        "UG" => "UGX",
        "TZ" => "TZS",
        "RW" => "RWF",
        "CI" | "SN" => "XOF",
        "EG" => "EGP",
        "JP" => "JPY",
        "SG" => "SGD",
        "AU" => "AUD",
        "NZ" => "NZD",
        "IN" => "INR",
        "HK" => "HKD",
        "MY" => "MYR",
        "PH" => "PHP",
        "MX" => "MXN",
        "BR" => "BRL",
        "AR" => "ARS",
        "CO" => "COP",
        "CL" => "CLP",
        "PE" => "PEN",
        _ => return None,
    };
    Some(currency)
}

/// A validated, upper-cased ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn parse(value: &str) -> Result<Self, PaymentError> {
        let code = value.trim().to_uppercase();
        if CURRENCIES.iter().any(|(c, _)| *c == code) {
            Ok(Self(code))
        } else {
            Err(PaymentError::ValidationError {
                message: format!("unrecognized ISO 4217 currency: {}", value),
                field: Some("currency".to_string()),
            })
        }
    }

    /// Fallback settlement currency.
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of decimal places between the major and minor unit.
    pub fn minor_unit_exponent(&self) -> u32 {
        CURRENCIES
            .iter()
            .find(|(c, _)| *c == self.0)
            .map(|(_, exp)| *exp)
            .unwrap_or(2)
    }
}

impl std::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(value: CurrencyCode) -> Self {
        value.0
    }
}

/// Integer minor units paired with the currency they are denominated in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    pub amount_minor: i64,
    pub currency: CurrencyCode,
}

impl Money {
    pub fn new(amount_minor: i64, currency: CurrencyCode) -> Self {
        Self {
            amount_minor,
            currency,
        }
    }

    pub fn validate_positive(&self, field: &str) -> Result<(), PaymentError> {
        if self.amount_minor <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Payment intent lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Captured,
    PartiallyRefunded,
    Refunded,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    pub fn valid_transitions(&self) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match self {
            Pending => &[Authorized, Captured, Cancelled, Failed],
            Authorized => &[Captured, Cancelled, Failed],
            Captured => &[PartiallyRefunded, Refunded],
            PartiallyRefunded => &[PartiallyRefunded, Refunded],
            Refunded | Cancelled | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// No further status change is accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Refunded | PaymentStatus::Cancelled | PaymentStatus::Failed
        )
    }

    /// Money has been taken from the customer at some point.
    pub fn is_captured(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Captured | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(PaymentStatus::Pending),
            "authorized" => Some(PaymentStatus::Authorized),
            "captured" => Some(PaymentStatus::Captured),
            "partially_refunded" => Some(PaymentStatus::PartiallyRefunded),
            "refunded" => Some(PaymentStatus::Refunded),
            "cancelled" => Some(PaymentStatus::Cancelled),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Flight,
    Hotel,
    Car,
    Tour,
    Shortlet,
    Mobility,
    Visa,
    Insurance,
    Other,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Flight => "flight",
            ServiceType::Hotel => "hotel",
            ServiceType::Car => "car",
            ServiceType::Tour => "tour",
            ServiceType::Shortlet => "shortlet",
            ServiceType::Mobility => "mobility",
            ServiceType::Visa => "visa",
            ServiceType::Insurance => "insurance",
            ServiceType::Other => "other",
        }
    }
}

/// A vendor's share of one checkout, as supplied by the booking service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorSplit {
    pub vendor_id: String,
    /// Destination account per rail (Stripe connected account, PayPal email,
    /// Flutterwave or Paystack subaccount code).
    #[serde(default)]
    pub destination_accounts: BTreeMap<Rail, String>,
    pub allocated_amount: i64,
    pub fee_percentage: Decimal,
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl VendorSplit {
    pub fn destination_for(&self, rail: Rail) -> Option<&str> {
        self.destination_accounts
            .get(&rail)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Derived per-vendor breakdown. `vendor_net_amount + platform_fee == total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitCalculation {
    pub vendor_id: String,
    pub total: i64,
    pub vendor_net_amount: i64,
    pub platform_fee: i64,
    pub fee_percentage: Decimal,
    pub service_type: ServiceType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeferredPaymentProvider {
    Klarna,
    Afterpay,
    PaypalPayLater,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallmentPlan {
    pub installments: u32,
    pub installment_amount: i64,
    pub apr: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredPaymentOffer {
    pub eligible: bool,
    pub providers: Vec<DeferredPaymentProvider>,
    pub installment_options: Vec<u32>,
    pub representative_plan: Option<InstallmentPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub id: Uuid,
    pub amount_minor: i64,
    pub currency: CurrencyCode,
    pub rail: Rail,
    pub status: PaymentStatus,
    /// Rail-internal identifier; never returned to booking services.
    #[serde(skip_serializing)]
    pub provider_reference: String,
    pub client_action_token: Option<String>,
    pub redirect_url: Option<String>,
    /// Set once when the rail reports capture.
    pub captured_amount: Option<i64>,
    pub splits: Vec<VendorSplit>,
    pub deferred_payment: Option<DeferredPaymentOffer>,
    #[serde(skip_serializing)]
    pub idempotency_key: Option<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn has_splits(&self) -> bool {
        !self.splits.is_empty()
    }
}

// ============================================================================
// Transfers and refunds
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Claimed by a distribution run, rail call not yet settled
    Pending,
    InTransit,
    Paid,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InTransit => "in_transit",
            TransferStatus::Paid => "paid",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(TransferStatus::Pending),
            "in_transit" => Some(TransferStatus::InTransit),
            "paid" => Some(TransferStatus::Paid),
            "failed" => Some(TransferStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Uuid,
    pub payment_intent_id: Uuid,
    pub vendor_id: String,
    pub rail: Rail,
    pub amount_minor: i64,
    pub currency: CurrencyCode,
    pub status: TransferStatus,
    #[serde(skip_serializing)]
    pub transfer_reference: Option<String>,
    /// Key the rail saw on the last attempt
    #[serde(default, skip_serializing)]
    pub dedupe_key: String,
    pub service_type: ServiceType,
    pub attempts: u32,
    pub failure_reason: Option<String>,
    /// The last failure may have reached the rail; the next attempt must
    /// reuse `dedupe_key`
    #[serde(default, skip_serializing)]
    pub outcome_unknown: bool,
    /// Multi-receiver batch this transfer was last submitted in
    #[serde(default, skip_serializing)]
    pub batch_key: Option<String>,
    /// Platform fee leg that rode on that batch, zero when none did
    #[serde(default, skip_serializing)]
    pub batch_platform_fee: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// Whether this transfer's batch may have paid the platform fee leg.
    pub fn holds_platform_fee(&self) -> bool {
        self.batch_platform_fee > 0 && (self.status != TransferStatus::Failed || self.outcome_unknown)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Succeeded => "succeeded",
            RefundStatus::Failed => "failed",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(RefundStatus::Pending),
            "succeeded" => Some(RefundStatus::Succeeded),
            "failed" => Some(RefundStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    RequestedByCustomer,
    Duplicate,
    Fraudulent,
    ServiceCancelled,
    BookingCancelled,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::RequestedByCustomer => "requested_by_customer",
            RefundReason::Duplicate => "duplicate",
            RefundReason::Fraudulent => "fraudulent",
            RefundReason::ServiceCancelled => "service_cancelled",
            RefundReason::BookingCancelled => "booking_cancelled",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "requested_by_customer" => Some(RefundReason::RequestedByCustomer),
            "duplicate" => Some(RefundReason::Duplicate),
            "fraudulent" => Some(RefundReason::Fraudulent),
            "service_cancelled" => Some(RefundReason::ServiceCancelled),
            "booking_cancelled" => Some(RefundReason::BookingCancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundSplit {
    pub vendor_id: String,
    pub refund_amount: i64,
    #[serde(default)]
    pub deduct_fees: bool,
    #[serde(default)]
    pub fee_deduction: i64,
}

impl RefundSplit {
    /// Amount returned to the customer for this vendor line.
    pub fn net_amount(&self) -> i64 {
        if self.deduct_fees {
            self.refund_amount.saturating_sub(self.fee_deduction)
        } else {
            self.refund_amount
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub id: Uuid,
    pub payment_intent_id: Uuid,
    pub rail: Rail,
    pub amount_minor: i64,
    pub currency: CurrencyCode,
    pub status: RefundStatus,
    pub reason: RefundReason,
    pub splits: Vec<RefundSplit>,
    #[serde(skip_serializing)]
    pub provider_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Availability and geolocation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAvailability {
    pub rail: Rail,
    pub available: bool,
    pub supported_currencies: Vec<String>,
    pub processing_fee_rate: Decimal,
    pub settlement: SettlementLatency,
    pub capability: SplitCapability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geolocation {
    pub country: Option<String>,
    pub region: Region,
    pub currency: CurrencyCode,
    pub recommended_rails: Vec<Rail>,
    pub supported_currencies: Vec<String>,
}

// ============================================================================
// Adapter requests and responses
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    /// Our intent id; echoed back by the rail in webhooks.
    pub reference: String,
    pub amount: Money,
    pub customer_email: Option<String>,
    pub description: Option<String>,
    pub callback_url: Option<String>,
    pub metadata: JsonValue,
    /// Only consulted by sub-account routing rails.
    pub splits: Vec<VendorSplit>,
}

#[derive(Debug, Clone)]
pub struct CreateIntentResponse {
    pub provider_reference: String,
    pub status: PaymentStatus,
    pub client_action_token: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub provider_reference: String,
    pub amount: Money,
    pub reason: RefundReason,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct RefundResponse {
    pub provider_reference: String,
    pub status: RefundStatus,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub dedupe_key: String,
    pub destination: String,
    pub amount: Money,
    /// Rail reference of the captured charge funding the transfer.
    pub source_reference: String,
    pub payment_intent_id: Uuid,
    pub vendor_id: String,
    pub service_type: ServiceType,
}

#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub transfer_reference: String,
    pub status: TransferStatus,
}

#[derive(Debug, Clone)]
pub struct Receiver {
    pub account: String,
    pub amount_minor: i64,
    /// `None` for the platform-fee receiver.
    pub vendor_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MultiReceiverRequest {
    pub dedupe_key: String,
    pub currency: CurrencyCode,
    pub receivers: Vec<Receiver>,
    pub source_reference: String,
    pub payment_intent_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct MultiReceiverResponse {
    pub batch_reference: String,
    pub status: TransferStatus,
}

// ============================================================================
// Webhooks
// ============================================================================

#[derive(Debug, Clone)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Payment(PaymentStatus),
    Refund(RefundStatus),
    Transfer(TransferStatus),
    /// Delivered and signed, but nothing the ledger tracks.
    Unhandled,
}

/// Rail event after normalization; no rail-specific strings past this point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub rail: Rail,
    pub event_type: String,
    pub kind: EventKind,
    /// Rail reference of the payment, refund or transfer the event is about.
    pub reference: Option<String>,
    pub payment_intent_id: Option<Uuid>,
    pub amount_minor: Option<i64>,
}
