//! Exchange Rate Service
//!
//! Converts checkout line items into the transaction currency. Rates come
//! from a [`RateSource`] and are held as one immutable snapshot in a
//! [`TtlCache`]; a refresh swaps the whole snapshot. Conversions floor to the
//! target currency's minor unit, the same rule used for platform fees.

use crate::cache::TtlCache;
use crate::config::env_or;
use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};
use crate::payments::types::{CurrencyCode, Money};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SNAPSHOT_KEY: &str = "rates";

/// Used when `EXCHANGE_RATES` is unset. Units of quote per one unit of base.
pub const DEFAULT_EXCHANGE_RATES: &str = "USD:NGN=1550.25,USD:GHS=15.20,USD:KES=129.50,\
USD:ZAR=18.40,USD:UGX=3780,USD:EUR=0.92,USD:GBP=0.79,USD:CAD=1.36,USD:AUD=1.52";

#[derive(Debug, thiserror::Error)]
pub enum ExchangeRateError {
    #[error("Rate not found for {from} -> {to}")]
    RateNotFound { from: String, to: String },

    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Rate source error: {0}")]
    SourceError(String),

    #[error("Converted amount overflows: {0}")]
    Overflow(String),
}

pub type ExchangeRateResult<T> = Result<T, ExchangeRateError>;

impl From<ExchangeRateError> for AppError {
    fn from(err: ExchangeRateError) -> Self {
        let kind = match &err {
            ExchangeRateError::RateNotFound { from, .. } => {
                AppErrorKind::Validation(ValidationError::InvalidCurrency {
                    currency: from.clone(),
                    reason: err.to_string(),
                })
            }
            ExchangeRateError::Overflow(amount) => {
                AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: amount.clone(),
                    reason: "amount too large to convert".to_string(),
                })
            }
            ExchangeRateError::InvalidRate(_) | ExchangeRateError::SourceError(_) => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: "exchange_rates".to_string(),
                    message: err.to_string(),
                    is_retryable: true,
                })
            }
        };
        AppError::new(kind)
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Immutable set of rates keyed by `(base, quote)`.
#[derive(Debug, Clone)]
pub struct RateSnapshot {
    pub rates: HashMap<(String, String), Decimal>,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// How to apply a stored rate for a requested direction. Inverse pairs
/// divide by the stored rate instead of multiplying by a rounded reciprocal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quote {
    Multiply(Decimal),
    Divide(Decimal),
}

impl Quote {
    /// Units of quote currency per unit of base, for display.
    pub fn rate(&self) -> Decimal {
        match self {
            Quote::Multiply(rate) => *rate,
            Quote::Divide(rate) => Decimal::ONE / *rate,
        }
    }
}

impl RateSnapshot {
    /// Direct pair, else the reverse pair applied as a division.
    pub fn quote(&self, from: &str, to: &str) -> Option<Quote> {
        if from == to {
            return Some(Quote::Multiply(Decimal::ONE));
        }
        if let Some(rate) = self.rates.get(&(from.to_string(), to.to_string())) {
            return Some(Quote::Multiply(*rate));
        }
        self.rates
            .get(&(to.to_string(), from.to_string()))
            .filter(|r| !r.is_zero())
            .map(|r| Quote::Divide(*r))
    }
}

#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_snapshot(&self) -> ExchangeRateResult<RateSnapshot>;

    fn name(&self) -> &str;
}

/// Rates from configuration, e.g. `USD:NGN=1550.25,EUR:NGN=1680`.
#[derive(Debug, Clone)]
pub struct StaticRateSource {
    rates: HashMap<(String, String), Decimal>,
}

impl StaticRateSource {
    pub fn parse(table: &str) -> ExchangeRateResult<Self> {
        let mut rates = HashMap::new();
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (pair, value) = entry
                .split_once('=')
                .ok_or_else(|| ExchangeRateError::InvalidRate(entry.to_string()))?;
            let (base, quote) = pair
                .split_once(':')
                .ok_or_else(|| ExchangeRateError::InvalidRate(entry.to_string()))?;
            let base = CurrencyCode::parse(base)
                .map_err(|_| ExchangeRateError::InvalidRate(entry.to_string()))?;
            let quote = CurrencyCode::parse(quote)
                .map_err(|_| ExchangeRateError::InvalidRate(entry.to_string()))?;
            let rate = Decimal::from_str(value.trim())
                .map_err(|_| ExchangeRateError::InvalidRate(entry.to_string()))?;
            if rate <= Decimal::ZERO {
                return Err(ExchangeRateError::InvalidRate(entry.to_string()));
            }
            rates.insert((base.to_string(), quote.to_string()), rate);
        }
        Ok(Self { rates })
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch_snapshot(&self) -> ExchangeRateResult<RateSnapshot> {
        Ok(RateSnapshot {
            rates: self.rates.clone(),
            source: self.name().to_string(),
            fetched_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExchangeRateConfig {
    /// `BASE:QUOTE=rate` pairs, comma separated
    pub rates: String,
    /// How long a snapshot is served before it is re-read
    pub cache_ttl_secs: u64,
    /// Background refresh period
    pub refresh_interval_secs: u64,
}

impl Default for ExchangeRateConfig {
    fn default() -> Self {
        Self {
            rates: DEFAULT_EXCHANGE_RATES.to_string(),
            cache_ttl_secs: 900,
            refresh_interval_secs: 300,
        }
    }
}

impl ExchangeRateConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rates: std::env::var("EXCHANGE_RATES").unwrap_or(defaults.rates),
            cache_ttl_secs: env_or("EXCHANGE_RATE_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            refresh_interval_secs: env_or(
                "EXCHANGE_RATE_REFRESH_SECS",
                defaults.refresh_interval_secs,
            ),
        }
    }

    pub fn validate(&self) -> ExchangeRateResult<()> {
        if self.refresh_interval_secs == 0 {
            return Err(ExchangeRateError::InvalidRate(
                "EXCHANGE_RATE_REFRESH_SECS must be positive".to_string(),
            ));
        }
        StaticRateSource::parse(&self.rates).map(|_| ())
    }
}

pub struct ExchangeRateService {
    source: Arc<dyn RateSource>,
    cache: TtlCache<&'static str, RateSnapshot>,
}

impl ExchangeRateService {
    pub fn new(source: Arc<dyn RateSource>, cache_ttl: Duration) -> Self {
        Self {
            source,
            cache: TtlCache::new(cache_ttl),
        }
    }

    pub fn from_config(config: &ExchangeRateConfig) -> ExchangeRateResult<Self> {
        let source = StaticRateSource::parse(&config.rates)?;
        Ok(Self::new(
            Arc::new(source),
            Duration::from_secs(config.cache_ttl_secs),
        ))
    }

    pub async fn snapshot(&self) -> ExchangeRateResult<Arc<RateSnapshot>> {
        let source = Arc::clone(&self.source);
        self.cache
            .get_or_refresh(SNAPSHOT_KEY, || async move { source.fetch_snapshot().await })
            .await
    }

    /// Re-read the source and replace the cached snapshot.
    pub async fn refresh(&self) -> ExchangeRateResult<usize> {
        let snapshot = self.source.fetch_snapshot().await?;
        let count = snapshot.rates.len();
        self.cache.insert(SNAPSHOT_KEY, snapshot).await;
        info!(source = self.source.name(), pairs = count, "exchange rates refreshed");
        Ok(count)
    }

    pub async fn quote(&self, from: &CurrencyCode, to: &CurrencyCode) -> ExchangeRateResult<Quote> {
        let snapshot = self.snapshot().await?;
        snapshot
            .quote(from.as_str(), to.as_str())
            .ok_or_else(|| ExchangeRateError::RateNotFound {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    pub async fn convert(&self, amount: &Money, to: &CurrencyCode) -> ExchangeRateResult<Money> {
        if amount.currency == *to {
            return Ok(amount.clone());
        }
        let quote = self.quote(&amount.currency, to).await?;
        let converted = convert_minor(
            amount.amount_minor,
            quote,
            amount.currency.minor_unit_exponent(),
            to.minor_unit_exponent(),
        )?;
        debug!(
            from = %amount.currency,
            to = %to,
            rate = %quote.rate(),
            amount = amount.amount_minor,
            converted,
            "converted amount"
        );
        Ok(Money::new(converted, to.clone()))
    }
}

/// `floor(amount_minor * rate * 10^(to_exp - from_exp))`
pub fn convert_minor(
    amount_minor: i64,
    quote: Quote,
    from_exp: u32,
    to_exp: u32,
) -> ExchangeRateResult<i64> {
    let overflow = || ExchangeRateError::Overflow(amount_minor.to_string());
    let mut value = Decimal::from(amount_minor);
    if to_exp > from_exp {
        value = value
            .checked_mul(Decimal::from(10i64.pow(to_exp - from_exp)))
            .ok_or_else(overflow)?;
    }
    value = match quote {
        Quote::Multiply(rate) => value.checked_mul(rate),
        Quote::Divide(rate) => value.checked_div(rate),
    }
    .ok_or_else(overflow)?;
    if from_exp > to_exp {
        value /= Decimal::from(10i64.pow(from_exp - to_exp));
    }
    value.floor().to_i64().ok_or_else(overflow)
}
