//! Background workers. Each one runs until the shared shutdown channel flips.

pub mod rate_refresher;
pub mod transfer_retry;

use crate::config::env_or;

pub use rate_refresher::RateRefreshWorker;
pub use transfer_retry::{TransferRetryConfig, TransferRetryWorker};

/// Which workers run and how.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub transfer_retry_enabled: bool,
    pub transfer_retry: TransferRetryConfig,
    pub rate_refresh_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            transfer_retry_enabled: true,
            transfer_retry: TransferRetryConfig::default(),
            rate_refresh_enabled: true,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            transfer_retry_enabled: env_or(
                "TRANSFER_RETRY_ENABLED",
                defaults.transfer_retry_enabled,
            ),
            transfer_retry: TransferRetryConfig::from_env(),
            rate_refresh_enabled: env_or("RATE_REFRESH_ENABLED", defaults.rate_refresh_enabled),
        }
    }
}
