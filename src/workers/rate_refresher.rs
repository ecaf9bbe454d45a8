use crate::services::exchange_rate::ExchangeRateService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Re-reads exchange rates on a timer so request paths always hit a warm
/// snapshot. A failed refresh keeps serving the previous snapshot.
pub struct RateRefreshWorker {
    rates: Arc<ExchangeRateService>,
    interval: Duration,
}

impl RateRefreshWorker {
    pub fn new(rates: Arc<ExchangeRateService>, interval: Duration) -> Self {
        Self { rates, interval }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "exchange rate refresh worker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("exchange rate refresh worker stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.rates.refresh().await {
                        warn!(error = %e, "exchange rate refresh failed, keeping previous snapshot");
                    }
                }
            }
        }

        info!("exchange rate refresh worker stopped");
    }
}
