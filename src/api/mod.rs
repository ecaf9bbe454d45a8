//! HTTP surface

pub mod payments;
pub mod webhooks;

use crate::health::HealthChecker;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::{
    CheckoutService, PaymentOrchestrator, RefundCoordinator, SplitDistributor, WebhookProcessor,
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub distributor: Arc<SplitDistributor>,
    pub refunds: Arc<RefundCoordinator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub checkout: Arc<CheckoutService>,
    pub health: HealthChecker,
}

pub fn router(state: AppState) -> Router {
    let payment_routes = Router::new()
        .route("/payments/intents", post(payments::create_intent))
        .route("/payments/intents/{id}", get(payments::get_intent))
        .route(
            "/payments/intents/{id}/transfers",
            get(payments::list_transfers),
        )
        .route(
            "/payments/intents/{id}/distribute",
            post(payments::distribute),
        )
        .route(
            "/payments/transfers/{id}/retry",
            post(payments::retry_transfer),
        )
        .route("/payments/refunds", post(payments::create_refund))
        .route("/payments/checkout", post(payments::checkout))
        .route("/payments/checkout/quote", post(payments::quote_checkout))
        .route("/payments/health", get(payments::health))
        .route("/webhooks/{rail}", post(webhooks::handle_webhook));

    Router::new()
        .route("/health/live", get(payments::liveness))
        .merge(payment_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware)),
        )
        .with_state(state)
}
