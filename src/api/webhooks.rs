use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::info;

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::error::get_request_id_from_headers;

/// POST /webhooks/{rail}
///
/// Verification failures answer 401. Ledger failures answer 5xx so the rail
/// redelivers. Everything else, duplicates included, answers 200.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(rail): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    info!(rail = %rail, bytes = body.len(), "Received webhook");

    let outcome = state
        .webhooks
        .process_webhook(&rail, &headers, &body)
        .await
        .map_err(|e| {
            let err = AppError::from(e);
            match get_request_id_from_headers(&headers) {
                Some(id) => err.with_request_id(id),
                None => err,
            }
        })?;

    Ok((StatusCode::OK, Json(outcome)))
}
