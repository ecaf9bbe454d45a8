//! Unified error handling for the payments service
//!
//! Every component error converts into [`AppError`], which carries the HTTP
//! status, a machine-readable code and a customer-safe message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable codes returned in every error body
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PaymentNotFound,
    TransferNotFound,
    SplitMismatch,
    RefundExceedsCaptured,
    InvalidPaymentState,
    InvalidCurrency,
    InvalidAmount,
    ValidationError,

    DatabaseError,
    ConfigurationError,

    PaymentProviderError,
    AllGatewaysExhausted,
    WebhookSignatureInvalid,
    RateLimitError,
    ExternalServiceTimeout,

    InternalError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// No intent with the given id exists
    PaymentNotFound { payment_intent_id: String },
    /// No transfer with the given id exists
    TransferNotFound { transfer_id: String },
    /// Vendor allocations do not reconcile with the intent total
    SplitMismatch { allocated: i64, total: i64 },
    /// Refund would exceed what remains of the captured amount
    RefundExceedsCaptured { requested: i64, refundable: i64 },
    /// Operation is not allowed in the intent's current status
    InvalidPaymentState {
        payment_intent_id: String,
        status: String,
        operation: String,
    },
}

/// Infrastructure-level errors (ledger storage, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Ledger storage failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// Payment rail errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// A single rail returned an error
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// Every ranked rail failed for this checkout
    AllGatewaysExhausted { attempted: Vec<String> },
    /// Webhook signature did not verify
    WebhookSignature { message: String },
    /// Rate limit exceeded
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Unsupported or unrecognized currency
    InvalidCurrency { currency: String, reason: String },
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Any other malformed field
    InvalidInput { field: String, reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }))
    }

    pub fn payment_not_found(payment_intent_id: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
            payment_intent_id: payment_intent_id.into(),
        }))
    }

    /// HTTP status, client code and retry hint, in one place.
    fn classify(&self) -> (u16, ErrorCode, bool) {
        use ErrorCode as C;
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => (404, C::PaymentNotFound, false),
                DomainError::TransferNotFound { .. } => (404, C::TransferNotFound, false),
                DomainError::SplitMismatch { .. } => (422, C::SplitMismatch, false),
                DomainError::RefundExceedsCaptured { .. } => (422, C::RefundExceedsCaptured, false),
                DomainError::InvalidPaymentState { .. } => (409, C::InvalidPaymentState, false),
            },
            AppErrorKind::Infrastructure(InfrastructureError::Database { is_retryable, .. }) => {
                (500, C::DatabaseError, *is_retryable)
            }
            AppErrorKind::Infrastructure(InfrastructureError::Configuration { .. }) => {
                (500, C::ConfigurationError, false)
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => {
                    (502, C::PaymentProviderError, *is_retryable)
                }
                ExternalError::AllGatewaysExhausted { .. } => (503, C::AllGatewaysExhausted, true),
                ExternalError::WebhookSignature { .. } => (401, C::WebhookSignatureInvalid, false),
                ExternalError::RateLimit { .. } => (429, C::RateLimitError, true),
                ExternalError::Timeout { .. } => (504, C::ExternalServiceTimeout, true),
            },
            AppErrorKind::Validation(ValidationError::InvalidCurrency { .. }) => {
                (400, C::InvalidCurrency, false)
            }
            AppErrorKind::Validation(ValidationError::InvalidAmount { .. }) => {
                (400, C::InvalidAmount, false)
            }
            AppErrorKind::Validation(ValidationError::InvalidInput { .. }) => {
                (400, C::ValidationError, false)
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        self.classify().0
    }

    pub fn error_code(&self) -> ErrorCode {
        self.classify().1
    }

    pub fn is_retryable(&self) -> bool {
        self.classify().2
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { payment_intent_id } => {
                    format!("Payment intent '{}' not found", payment_intent_id)
                }
                DomainError::TransferNotFound { transfer_id } => {
                    format!("Transfer '{}' not found", transfer_id)
                }
                DomainError::SplitMismatch { allocated, total } => format!(
                    "Vendor allocations ({}) exceed the payment total ({})",
                    allocated, total
                ),
                DomainError::RefundExceedsCaptured {
                    requested,
                    refundable,
                } => format!(
                    "Refund of {} exceeds the refundable balance of {}",
                    requested, refundable
                ),
                DomainError::InvalidPaymentState {
                    status, operation, ..
                } => format!("Cannot {} a payment that is {}", operation, status),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::AllGatewaysExhausted { .. } => {
                    "No payment provider could accept this payment right now. Please try again later"
                        .to_string()
                }
                ExternalError::WebhookSignature { .. } => "Invalid webhook signature".to_string(),
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidCurrency { currency, reason } => {
                    format!("Invalid currency '{}': {}", currency, reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidInput { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
            },
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_mismatch_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::SplitMismatch {
            allocated: 130_000,
            total: 120_000,
        }));

        assert_eq!(error.status_code(), 422);
        assert_eq!(error.error_code(), ErrorCode::SplitMismatch);
        assert!(error.user_message().contains("130000"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_all_gateways_exhausted_is_service_unavailable() {
        let error = AppError::new(AppErrorKind::External(
            ExternalError::AllGatewaysExhausted {
                attempted: vec!["stripe".to_string(), "paypal".to_string()],
            },
        ));

        assert_eq!(error.status_code(), 503);
        assert_eq!(error.error_code(), ErrorCode::AllGatewaysExhausted);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: "-100".to_string(),
            reason: "Amount cannot be negative".to_string(),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::InvalidAmount);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_request_id_and_context_are_attached() {
        let error = AppError::payment_not_found("pi_1")
            .with_request_id("req-1")
            .with_context("refund");
        assert_eq!(error.status_code(), 404);
        assert_eq!(error.request_id.as_deref(), Some("req-1"));
        assert_eq!(error.context.as_deref(), Some("refund"));
    }
}
