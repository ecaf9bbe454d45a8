use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::{
    CreateIntentRequest, CreateIntentResponse, DeferredPaymentProvider, GatewayAvailability,
    MultiReceiverRequest, MultiReceiverResponse, NormalizedEvent, PaymentStatus, Rail, RailKind,
    RefundRequest, RefundResponse, SettlementLatency, SplitCapability, TransferRequest,
    TransferResponse, WebhookVerificationResult,
};
use async_trait::async_trait;
use chrono::Duration;
use http::HeaderMap;
use rust_decimal::Decimal;

/// Uniform contract over one payment rail.
///
/// Everything rail-specific (payload shapes, status strings, signature
/// schemes) stays behind this trait. Callers only see [`PaymentStatus`],
/// [`NormalizedEvent`] and the request/response types in `types`.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn rail(&self) -> Rail;

    fn kind(&self) -> RailKind;

    fn capability(&self) -> SplitCapability;

    fn supported_currencies(&self) -> &'static [&'static str];

    /// Fraction of the charge the rail keeps, e.g. `0.029`.
    fn processing_fee_rate(&self) -> Decimal;

    fn settlement(&self) -> SettlementLatency;

    /// How long a created intent stays payable.
    fn intent_ttl(&self) -> Duration;

    /// Installment providers offered through this rail.
    fn deferred_providers(&self) -> &'static [DeferredPaymentProvider] {
        &[]
    }

    fn supports_currency(&self, currency: &str) -> bool {
        self.supported_currencies()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }

    /// Static availability for a currency. The orchestrator layers health
    /// tracking on top of this.
    fn availability(&self, currency: &str) -> GatewayAvailability {
        GatewayAvailability {
            rail: self.rail(),
            available: self.supports_currency(currency),
            supported_currencies: self
                .supported_currencies()
                .iter()
                .map(|c| c.to_string())
                .collect(),
            processing_fee_rate: self.processing_fee_rate(),
            settlement: self.settlement(),
            capability: self.capability(),
        }
    }

    async fn create_intent(&self, request: CreateIntentRequest)
        -> PaymentResult<CreateIntentResponse>;

    /// Cancel whatever the rail may have created under `reference` during an
    /// attempt the orchestrator has abandoned.
    async fn discard_attempt(&self, _reference: &str) -> PaymentResult<()> {
        Ok(())
    }

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<RefundResponse>;

    async fn create_transfer(&self, _request: TransferRequest) -> PaymentResult<TransferResponse> {
        Err(PaymentError::UnsupportedOperation {
            rail: self.rail().to_string(),
            operation: "post-capture transfers".to_string(),
        })
    }

    async fn submit_multi_receiver(
        &self,
        _request: MultiReceiverRequest,
    ) -> PaymentResult<MultiReceiverResponse> {
        Err(PaymentError::UnsupportedOperation {
            rail: self.rail().to_string(),
            operation: "multi-receiver payments".to_string(),
        })
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookVerificationResult>;

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<NormalizedEvent>;

    /// Map a rail status string onto the internal enumeration.
    fn normalize_status(&self, raw: &str) -> Option<PaymentStatus>;
}
