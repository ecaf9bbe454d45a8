//! Services module for payment orchestration and marketplace settlement

pub mod checkout;
pub mod compliance;
pub mod exchange_rate;
pub mod gateway_selector;
pub mod geolocation;
pub mod payment_orchestrator;
pub mod refund_coordinator;
pub mod split_calculator;
pub mod split_distributor;
pub mod webhook_processor;

// Re-export the service entry points
pub use checkout::{CheckoutError, CheckoutRequest, CheckoutService};
pub use exchange_rate::{ExchangeRateConfig, ExchangeRateService};
pub use geolocation::{GeolocationConfig, GeolocationResolver};
pub use payment_orchestrator::{
    CreatePaymentIntent, OrchestratorConfig, OrchestratorError, PaymentIntentResult,
    PaymentOrchestrator,
};
pub use refund_coordinator::{MultiVendorRefund, RefundCoordinator, RefundError};
pub use split_distributor::{DistributionError, DistributorConfig, MarketplaceCharge, SplitDistributor};
pub use webhook_processor::{WebhookOutcome, WebhookProcessor, WebhookProcessorError};
