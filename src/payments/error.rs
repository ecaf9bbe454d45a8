use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};
use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// What a single rail adapter can report. The orchestrator only needs
/// [`PaymentError::is_retryable`] to decide whether an abandoned attempt
/// must be discarded before falling back.
#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Payment declined: {message}")]
    PaymentDeclinedError {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rail call timed out after {timeout_secs}s")]
    TimeoutError { timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("{rail} does not support {operation}")]
    UnsupportedOperation { rail: String, operation: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn provider(provider: &str, message: impl Into<String>, retryable: bool) -> Self {
        PaymentError::ProviderError {
            provider: provider.to_string(),
            message: message.into(),
            provider_code: None,
            retryable,
        }
    }

    /// The same request might succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::NetworkError { .. }
            | PaymentError::TimeoutError { .. }
            | PaymentError::RateLimitError { .. } => true,
            PaymentError::ProviderError { retryable, .. } => *retryable,
            PaymentError::ValidationError { .. }
            | PaymentError::PaymentDeclinedError { .. }
            | PaymentError::WebhookVerificationError { .. }
            | PaymentError::UnsupportedOperation { .. } => false,
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        let retryable = err.is_retryable();
        let kind = match err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidInput {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            PaymentError::UnsupportedOperation { rail, operation } => {
                AppErrorKind::Validation(ValidationError::InvalidInput {
                    field: "rail".to_string(),
                    reason: format!("{} does not support {}", rail, operation),
                })
            }
            PaymentError::WebhookVerificationError { message } => {
                AppErrorKind::External(ExternalError::WebhookSignature { message })
            }
            PaymentError::TimeoutError { timeout_secs } => {
                AppErrorKind::External(ExternalError::Timeout {
                    service: "payment rail".to_string(),
                    timeout_secs,
                })
            }
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment rail".to_string(),
                retry_after: retry_after_seconds,
            }),
            PaymentError::ProviderError {
                provider, message, ..
            } => AppErrorKind::External(ExternalError::PaymentProvider {
                provider,
                message,
                is_retryable: retryable,
            }),
            other @ (PaymentError::PaymentDeclinedError { .. } | PaymentError::NetworkError { .. }) => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: "payment rail".to_string(),
                    message: other.to_string(),
                    is_retryable: retryable,
                })
            }
        };
        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(PaymentError::NetworkError {
            message: "connection reset".to_string()
        }
        .is_retryable());
        assert!(PaymentError::TimeoutError { timeout_secs: 15 }.is_retryable());
        assert!(PaymentError::provider("stripe", "503", true).is_retryable());
        assert!(!PaymentError::provider("paystack", "invalid key", false).is_retryable());
        assert!(!PaymentError::PaymentDeclinedError {
            message: "insufficient funds".to_string(),
            provider_code: Some("card_declined".to_string()),
        }
        .is_retryable());
    }

    #[test]
    fn app_error_status_follows_the_failure() {
        let validation: AppError = PaymentError::ValidationError {
            message: "bad amount".to_string(),
            field: Some("amount".to_string()),
        }
        .into();
        assert_eq!(validation.status_code(), 400);

        let timeout: AppError = PaymentError::TimeoutError { timeout_secs: 10 }.into();
        assert_eq!(timeout.status_code(), 504);

        let unsupported: AppError = PaymentError::UnsupportedOperation {
            rail: "paystack".to_string(),
            operation: "post-capture transfers".to_string(),
        }
        .into();
        assert_eq!(unsupported.status_code(), 400);

        let declined: AppError = PaymentError::PaymentDeclinedError {
            message: "declined".to_string(),
            provider_code: None,
        }
        .into();
        assert_eq!(declined.status_code(), 502);
        assert!(!declined.is_retryable());
    }
}
