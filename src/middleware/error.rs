//! Error response formatting
//!
//! Every handler error leaves the service as the same JSON envelope.

use crate::error::{AppError, AppErrorKind, ErrorCode, ExternalError, ValidationError};
use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    /// Customer-safe description
    pub message: String,
    pub request_id: Option<String>,
    /// RFC 3339
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            details: details_for(error),
            retryable: error.is_retryable(),
        }
    }
}

/// Structured hints a client can act on without parsing the message.
fn details_for(error: &AppError) -> Option<Value> {
    let mut details = serde_json::Map::new();
    match &error.kind {
        AppErrorKind::Validation(ValidationError::InvalidInput { field, .. }) => {
            details.insert("field".to_string(), json!(field));
        }
        AppErrorKind::External(ExternalError::AllGatewaysExhausted { attempted }) => {
            details.insert("attemptedRails".to_string(), json!(attempted));
        }
        _ => {}
    }
    if let Some(context) = &error.context {
        details.insert("context".to_string(), json!(context));
    }
    (!details.is_empty()).then_some(Value::Object(details))
}

fn retry_after(error: &AppError) -> Option<u64> {
    match &error.kind {
        AppErrorKind::External(ExternalError::RateLimit { retry_after, .. }) => *retry_after,
        _ => None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                error = ?self.kind,
                request_id = ?self.request_id,
                status = status.as_u16(),
                "request failed"
            );
        } else {
            tracing::warn!(
                error = %self,
                request_id = ?self.request_id,
                status = status.as_u16(),
                "request rejected"
            );
        }

        let retry_after = retry_after(&self);
        let mut response = (status, Json(ErrorResponse::from_app_error(&self))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
