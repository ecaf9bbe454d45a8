//! Health check module
//! Reports per-rail availability and ledger reachability without side effects

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, warn};
use uuid::Uuid;

use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{Rail, SettlementLatency, SplitCapability};
use crate::services::payment_orchestrator::PaymentOrchestrator;

/// Health status response
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    pub rails: BTreeMap<Rail, RailHealth>,
    pub ledger: ComponentHealth,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One rail's availability snapshot
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RailHealth {
    pub available: bool,
    pub supported_currencies: Vec<String>,
    pub processing_fee_rate: Decimal,
    pub settlement: SettlementLatency,
    pub capability: SplitCapability,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Up,
    Down,
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }
}

/// Overall state from how many rails can take payments.
pub fn overall_state(rails: &BTreeMap<Rail, RailHealth>, ledger_up: bool) -> HealthState {
    let available = rails.values().filter(|r| r.available).count();
    if !ledger_up || available == 0 {
        HealthState::Unhealthy
    } else if available < rails.len() {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    orchestrator: Arc<PaymentOrchestrator>,
    check_timeout: Duration,
}

impl HealthChecker {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, check_timeout: Duration) -> Self {
        Self {
            orchestrator,
            check_timeout,
        }
    }

    /// Check every registered rail concurrently, plus the ledger
    pub async fn check_health(&self) -> HealthStatus {
        let metrics = self.orchestrator.get_rail_metrics().await;
        let adapters: Vec<Arc<dyn GatewayAdapter>> =
            self.orchestrator.registry().adapters().cloned().collect();

        let checks = adapters.iter().map(|adapter| async move {
            let rail = adapter.rail();
            let result = timeout(self.check_timeout, self.check_rail(adapter.as_ref())).await;
            (rail, result)
        });

        let mut rails = BTreeMap::new();
        for (rail, result) in join_all(checks).await {
            let consecutive_failures = metrics
                .get(&rail)
                .map(|m| m.consecutive_failures)
                .unwrap_or(0);
            let health = match result {
                Ok(mut health) => {
                    health.consecutive_failures = consecutive_failures;
                    health
                }
                Err(_) => {
                    warn!(rail = %rail, "Rail health check timed out");
                    let Some(adapter) = self.orchestrator.registry().get(rail) else {
                        continue;
                    };
                    let mut health = snapshot(adapter.as_ref(), false);
                    health.consecutive_failures = consecutive_failures;
                    health.details = Some("Timeout".to_string());
                    health
                }
            };
            rails.insert(rail, health);
        }

        let ledger = self.check_ledger().await;
        let status = overall_state(&rails, ledger.status == ComponentState::Up);
        if status == HealthState::Unhealthy {
            error!("Health check: unhealthy");
        }

        HealthStatus {
            status,
            rails,
            ledger,
            timestamp: chrono::Utc::now(),
        }
    }

    async fn check_rail(&self, adapter: &dyn GatewayAdapter) -> RailHealth {
        let benched = self.orchestrator.is_benched(adapter.rail()).await;
        let mut health = snapshot(adapter, !benched);
        if benched {
            health.details = Some("Cooling down after repeated failures".to_string());
        }
        health
    }

    async fn check_ledger(&self) -> ComponentHealth {
        let start = Instant::now();
        // a read of an id that never exists; touches storage without writing
        match timeout(
            self.check_timeout,
            self.orchestrator.ledger().get_intent(Uuid::nil()),
        )
        .await
        {
            Ok(Ok(_)) => ComponentHealth::up(Some(start.elapsed().as_millis())),
            Ok(Err(e)) => {
                error!("Ledger health check failed: {}", e);
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("Ledger health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        }
    }
}

fn snapshot(adapter: &dyn GatewayAdapter, available: bool) -> RailHealth {
    RailHealth {
        available,
        supported_currencies: adapter
            .supported_currencies()
            .iter()
            .map(|c| c.to_string())
            .collect(),
        processing_fee_rate: adapter.processing_fee_rate(),
        settlement: adapter.settlement(),
        capability: adapter.capability(),
        consecutive_failures: 0,
        details: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rail(available: bool) -> RailHealth {
        RailHealth {
            available,
            supported_currencies: vec!["USD".to_string()],
            processing_fee_rate: Decimal::new(29, 3),
            settlement: SettlementLatency::TwoDays,
            capability: SplitCapability::PostCaptureTransfer,
            consecutive_failures: 0,
            details: None,
        }
    }

    #[test]
    fn test_overall_state() {
        let mut rails = BTreeMap::new();
        rails.insert(Rail::Stripe, rail(true));
        rails.insert(Rail::PayPal, rail(true));
        assert_eq!(overall_state(&rails, true), HealthState::Healthy);

        rails.insert(Rail::Paystack, rail(false));
        assert_eq!(overall_state(&rails, true), HealthState::Degraded);
        assert_eq!(overall_state(&rails, false), HealthState::Unhealthy);

        let down: BTreeMap<_, _> = [(Rail::Stripe, rail(false))].into_iter().collect();
        assert_eq!(overall_state(&down, true), HealthState::Unhealthy);
        assert_eq!(overall_state(&BTreeMap::new(), true), HealthState::Unhealthy);
    }

    #[test]
    fn test_component_health_creation() {
        let up = ComponentHealth::up(Some(100));
        assert_eq!(up.status, ComponentState::Up);
        assert_eq!(up.response_time_ms, Some(100));

        let down = ComponentHealth::down(Some("Test error".to_string()));
        assert_eq!(down.status, ComponentState::Down);
        assert_eq!(down.details, Some("Test error".to_string()));
    }
}
