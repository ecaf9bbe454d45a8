use crate::config::env_or;
use crate::ledger::Ledger;
use crate::payments::types::{RefundStatus, Transfer, TransferStatus};
use crate::services::refund_coordinator::RefundCoordinator;
use crate::services::split_distributor::{DistributionError, SplitDistributor};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransferRetryConfig {
    /// How often the worker wakes up to look for failed transfers.
    pub poll_interval: Duration,
    /// Failed transfers fetched per cycle.
    pub batch_size: usize,
    /// Wait before the first retry; doubles with every attempt.
    pub base_backoff: Duration,
    /// Ceiling on the backoff between attempts.
    pub max_backoff: Duration,
    /// Age after which a refund the rail never acknowledged is resubmitted.
    pub refund_resubmit_after: Duration,
}

impl Default for TransferRetryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 50,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
            refund_resubmit_after: Duration::from_secs(120),
        }
    }
}

impl TransferRetryConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval = Duration::from_secs(
            env_or("TRANSFER_RETRY_INTERVAL_SECS", cfg.poll_interval.as_secs()),
        );
        cfg.batch_size = env_or("TRANSFER_RETRY_BATCH_SIZE", cfg.batch_size);
        cfg.base_backoff = Duration::from_secs(
            env_or("TRANSFER_RETRY_BACKOFF_SECS", cfg.base_backoff.as_secs()),
        );
        cfg.refund_resubmit_after = Duration::from_secs(
            env_or("REFUND_RESUBMIT_AFTER_SECS", cfg.refund_resubmit_after.as_secs()),
        );
        cfg
    }
}

/// Summary of one retry cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryCycle {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
    pub deferred: usize,
    /// Unacknowledged refunds sent again
    pub refunds_resubmitted: usize,
    /// Of those, refunds the rail answered this time
    pub refunds_acknowledged: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct TransferRetryWorker {
    ledger: Arc<dyn Ledger>,
    distributor: Arc<SplitDistributor>,
    refunds: Option<Arc<RefundCoordinator>>,
    config: TransferRetryConfig,
}

impl TransferRetryWorker {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        distributor: Arc<SplitDistributor>,
        config: TransferRetryConfig,
    ) -> Self {
        Self {
            ledger,
            distributor,
            refunds: None,
            config,
        }
    }

    /// Also resubmit refunds whose rail outcome is unknown.
    pub fn with_refunds(mut self, refunds: Arc<RefundCoordinator>) -> Self {
        self.refunds = Some(refunds);
        self
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_attempts = self.distributor.config().max_transfer_attempts,
            "transfer retry worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("transfer retry worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle().await {
                        Ok(cycle) if cycle.attempted > 0 || cycle.refunds_resubmitted > 0 => {
                            info!(
                                attempted = cycle.attempted,
                                recovered = cycle.recovered,
                                still_failing = cycle.still_failing,
                                deferred = cycle.deferred,
                                refunds_resubmitted = cycle.refunds_resubmitted,
                                refunds_acknowledged = cycle.refunds_acknowledged,
                                "transfer retry cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "transfer retry cycle failed"),
                    }
                }
            }
        }

        info!("transfer retry worker stopped");
    }

    /// Retry every failed transfer whose backoff has elapsed.
    pub async fn run_cycle(&self) -> Result<RetryCycle, DistributionError> {
        let max_attempts = self.distributor.config().max_transfer_attempts;
        let failed = self
            .ledger
            .failed_transfers(max_attempts, self.config.batch_size)
            .await?;

        let now = Utc::now();
        let mut cycle = RetryCycle::default();
        for transfer in failed {
            if !is_ready_for_retry(&transfer, &self.config, now) {
                cycle.deferred += 1;
                continue;
            }
            cycle.attempted += 1;
            match self.distributor.retry_transfer(transfer.id).await {
                Ok(updated) if updated.status == TransferStatus::Failed => {
                    cycle.still_failing += 1;
                    if updated.attempts >= max_attempts {
                        error!(
                            transfer_id = %updated.id,
                            intent_id = %updated.payment_intent_id,
                            vendor_id = %updated.vendor_id,
                            attempts = updated.attempts,
                            "transfer out of retries, needs manual settlement"
                        );
                    }
                }
                Ok(_) => cycle.recovered += 1,
                Err(e) => {
                    cycle.still_failing += 1;
                    warn!(transfer_id = %transfer.id, error = %e, "transfer retry rejected");
                }
            }
        }

        if let Some(refunds) = &self.refunds {
            let age = chrono::Duration::from_std(self.config.refund_resubmit_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
            let stalled = self
                .ledger
                .unacknowledged_refunds(now - age, self.config.batch_size)
                .await?;
            for refund in stalled {
                cycle.refunds_resubmitted += 1;
                let refund_id = refund.id;
                match refunds.resubmit_refund(refund).await {
                    Ok(updated)
                        if updated.provider_reference.is_some()
                            || updated.status != RefundStatus::Pending =>
                    {
                        cycle.refunds_acknowledged += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(refund_id = %refund_id, error = %e, "refund resubmission failed"),
                }
            }
        }
        Ok(cycle)
    }
}

/// Exponential backoff measured from the last attempt.
pub fn is_ready_for_retry(
    transfer: &Transfer,
    config: &TransferRetryConfig,
    now: DateTime<Utc>,
) -> bool {
    let exponent = transfer.attempts.saturating_sub(1).min(16);
    let wait = config
        .base_backoff
        .saturating_mul(1u32 << exponent)
        .min(config.max_backoff);
    let wait = chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
    transfer.updated_at + wait <= now
}
