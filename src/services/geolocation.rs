//! Client geolocation
//!
//! Best effort only. Any lookup failure, timeout or private address resolves
//! to the global default so checkout is never blocked on it. Successful
//! lookups are cached per address.

use crate::cache::TtlCache;
use crate::config::env_or;
use crate::payments::types::{currency_for_country, CurrencyCode, Geolocation, Region};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GeolocationError {
    #[error("geolocation request failed: {0}")]
    Request(String),

    #[error("geolocation lookup returned status {0}")]
    Status(u16),

    #[error("geolocation lookup timed out after {0}ms")]
    Timeout(u64),

    #[error("no country for address")]
    UnknownAddress,
}

/// Country lookup by IP address.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// ISO 3166-1 alpha-2 country code.
    async fn country_for(&self, ip: IpAddr) -> Result<String, GeolocationError>;
}

pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 50_000;

#[derive(Debug, Clone)]
pub struct GeolocationConfig {
    /// MaxMind account id; lookups are disabled without it
    pub account_id: Option<String>,
    pub license_key: Option<String>,
    pub base_url: String,
    /// Upper bound on a lookup, including the HTTP round trip
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
    /// Addresses remembered at once
    pub cache_max_entries: usize,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            license_key: None,
            base_url: "https://geoip.maxmind.com/geoip/v2.1/insights".to_string(),
            timeout_ms: 800,
            cache_ttl_secs: 3_600,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl GeolocationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            account_id: std::env::var("MAXMIND_ACCOUNT_ID").ok().filter(|v| !v.is_empty()),
            license_key: std::env::var("MAXMIND_LICENSE_KEY").ok().filter(|v| !v.is_empty()),
            base_url: std::env::var("MAXMIND_BASE_URL").unwrap_or(defaults.base_url),
            timeout_ms: env_or("GEOLOCATION_TIMEOUT_MS", defaults.timeout_ms),
            cache_ttl_secs: env_or("GEOLOCATION_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            cache_max_entries: env_or("GEOLOCATION_CACHE_MAX_ENTRIES", defaults.cache_max_entries),
        }
    }

    pub fn lookup_enabled(&self) -> bool {
        self.account_id.is_some() && self.license_key.is_some()
    }
}

// ============================================================================
// MaxMind
// ============================================================================

#[derive(Debug, Deserialize)]
struct InsightsResponse {
    country: Option<InsightsCountry>,
}

#[derive(Debug, Deserialize)]
struct InsightsCountry {
    iso_code: Option<String>,
}

pub struct MaxMindLookup {
    client: reqwest::Client,
    account_id: String,
    license_key: String,
    base_url: String,
}

impl MaxMindLookup {
    pub fn from_config(config: &GeolocationConfig) -> Option<Self> {
        let account_id = config.account_id.clone()?;
        let license_key = config.license_key.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .ok()?;
        Some(Self {
            client,
            account_id,
            license_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for MaxMindLookup {
    async fn country_for(&self, ip: IpAddr) -> Result<String, GeolocationError> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, ip))
            .basic_auth(&self.account_id, Some(&self.license_key))
            .send()
            .await
            .map_err(|e| GeolocationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeolocationError::Status(status.as_u16()));
        }

        let body: InsightsResponse = response
            .json()
            .await
            .map_err(|e| GeolocationError::Request(e.to_string()))?;
        body.country
            .and_then(|c| c.iso_code)
            .filter(|code| code.len() == 2)
            .ok_or(GeolocationError::UnknownAddress)
    }
}

// ============================================================================
// Resolver
// ============================================================================

const DEFAULT_SUPPORTED_CURRENCIES: [&str; 3] = ["USD", "EUR", "GBP"];

/// Generic region, USD and the two globally-broadest rails.
pub fn default_geolocation() -> Geolocation {
    Geolocation {
        country: None,
        region: Region::Global,
        currency: CurrencyCode::usd(),
        recommended_rails: Region::Global.preferred_rails().to_vec(),
        supported_currencies: DEFAULT_SUPPORTED_CURRENCIES
            .iter()
            .map(|c| c.to_string())
            .collect(),
    }
}

pub fn geolocation_for_country(country: &str) -> Geolocation {
    let country = country.to_uppercase();
    let region = Region::for_country(&country);
    let currency = currency_for_country(&country)
        .and_then(|c| CurrencyCode::parse(c).ok())
        .unwrap_or_else(CurrencyCode::usd);

    let mut supported_currencies = vec![currency.to_string()];
    for code in DEFAULT_SUPPORTED_CURRENCIES {
        if !supported_currencies.iter().any(|c| c == code) {
            supported_currencies.push(code.to_string());
        }
    }

    Geolocation {
        country: Some(country),
        region,
        currency,
        recommended_rails: region.preferred_rails().to_vec(),
        supported_currencies,
    }
}

/// Loopback, private and link-local addresses never reach the lookup.
fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

pub struct GeolocationResolver {
    lookup: Option<Arc<dyn GeoLookup>>,
    cache: TtlCache<IpAddr, Geolocation>,
    timeout: Duration,
}

impl GeolocationResolver {
    pub fn new(lookup: Option<Arc<dyn GeoLookup>>, timeout: Duration, cache_ttl: Duration) -> Self {
        Self::with_cache_limit(lookup, timeout, cache_ttl, DEFAULT_CACHE_MAX_ENTRIES)
    }

    pub fn with_cache_limit(
        lookup: Option<Arc<dyn GeoLookup>>,
        timeout: Duration,
        cache_ttl: Duration,
        cache_max_entries: usize,
    ) -> Self {
        Self {
            lookup,
            cache: TtlCache::bounded(cache_ttl, cache_max_entries),
            timeout,
        }
    }

    pub fn from_config(config: &GeolocationConfig) -> Self {
        let lookup = MaxMindLookup::from_config(config).map(|l| Arc::new(l) as Arc<dyn GeoLookup>);
        if lookup.is_none() {
            warn!("MaxMind credentials not set, geolocation will use the global default");
        }
        Self::with_cache_limit(
            lookup,
            Duration::from_millis(config.timeout_ms),
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
        )
    }

    /// Never fails; the default stands in for anything that goes wrong.
    pub async fn resolve(&self, ip: Option<IpAddr>) -> Geolocation {
        let (Some(ip), Some(lookup)) = (ip, self.lookup.as_ref()) else {
            return default_geolocation();
        };
        if !is_routable(&ip) {
            return default_geolocation();
        }

        let timeout = self.timeout;
        let lookup = Arc::clone(lookup);
        let result = self
            .cache
            .get_or_refresh(ip, || async move {
                let country = tokio::time::timeout(timeout, lookup.country_for(ip))
                    .await
                    .map_err(|_| GeolocationError::Timeout(timeout.as_millis() as u64))??;
                Ok::<_, GeolocationError>(geolocation_for_country(&country))
            })
            .await;

        match result {
            Ok(geo) => {
                debug!(%ip, country = ?geo.country, region = ?geo.region, "resolved client location");
                (*geo).clone()
            }
            Err(e) => {
                warn!(%ip, error = %e, "geolocation failed, using default");
                default_geolocation()
            }
        }
    }

    /// Resolve from a caller-supplied country code, skipping the lookup.
    pub fn resolve_country(&self, country: Option<&str>) -> Geolocation {
        match country.map(str::trim).filter(|c| c.len() == 2) {
            Some(country) => geolocation_for_country(country),
            None => default_geolocation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::Rail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLookup {
        country: Option<&'static str>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeoLookup for FixedLookup {
        async fn country_for(&self, _ip: IpAddr) -> Result<String, GeolocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.country
                .map(str::to_string)
                .ok_or(GeolocationError::UnknownAddress)
        }
    }

    fn resolver(country: Option<&'static str>, delay: Duration) -> (GeolocationResolver, Arc<FixedLookup>) {
        let lookup = Arc::new(FixedLookup {
            country,
            delay,
            calls: AtomicUsize::new(0),
        });
        let resolver = GeolocationResolver::new(
            Some(lookup.clone() as Arc<dyn GeoLookup>),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        (resolver, lookup)
    }

    fn public_ip() -> IpAddr {
        "102.89.1.1".parse().unwrap()
    }

    #[tokio::test]
    async fn nigerian_address_resolves_to_africa_and_naira() {
        let (resolver, _) = resolver(Some("NG"), Duration::ZERO);
        let geo = resolver.resolve(Some(public_ip())).await;
        assert_eq!(geo.country.as_deref(), Some("NG"));
        assert_eq!(geo.region, Region::Africa);
        assert_eq!(geo.currency.as_str(), "NGN");
        assert_eq!(geo.recommended_rails[0], Rail::Flutterwave);
        assert_eq!(geo.supported_currencies, vec!["NGN", "USD", "EUR", "GBP"]);
    }

    #[tokio::test]
    async fn lookup_failure_falls_back_to_default() {
        let (resolver, _) = resolver(None, Duration::ZERO);
        assert_eq!(resolver.resolve(Some(public_ip())).await, default_geolocation());
    }

    #[tokio::test]
    async fn slow_lookup_is_cut_off() {
        let (resolver, _) = resolver(Some("NG"), Duration::from_secs(5));
        let geo = resolver.resolve(Some(public_ip())).await;
        assert_eq!(geo.region, Region::Global);
        assert_eq!(geo.currency.as_str(), "USD");
    }

    #[tokio::test]
    async fn private_addresses_skip_the_lookup() {
        let (resolver, lookup) = resolver(Some("NG"), Duration::ZERO);
        let geo = resolver.resolve(Some("10.0.0.7".parse().unwrap())).await;
        assert_eq!(geo, default_geolocation());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn results_are_cached_per_address() {
        let (resolver, lookup) = resolver(Some("KE"), Duration::ZERO);
        resolver.resolve(Some(public_ip())).await;
        let geo = resolver.resolve(Some(public_ip())).await;
        assert_eq!(geo.currency.as_str(), "KES");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn address_cache_stays_bounded() {
        let lookup = Arc::new(FixedLookup {
            country: Some("GH"),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let resolver = GeolocationResolver::with_cache_limit(
            Some(lookup.clone() as Arc<dyn GeoLookup>),
            Duration::from_millis(50),
            Duration::from_secs(60),
            16,
        );

        for host in 1..=200u8 {
            let ip: IpAddr = format!("102.89.7.{}", host).parse().unwrap();
            resolver.resolve(Some(ip)).await;
        }

        assert_eq!(resolver.cache.len().await, 16);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn default_uses_the_two_global_rails() {
        let geo = default_geolocation();
        assert_eq!(geo.recommended_rails, vec![Rail::Stripe, Rail::PayPal]);
        assert_eq!(geo.country, None);
    }

    #[test]
    fn unknown_country_keeps_region_global() {
        let geo = geolocation_for_country("zz");
        assert_eq!(geo.region, Region::Global);
        assert_eq!(geo.currency.as_str(), "USD");
        assert_eq!(geo.country.as_deref(), Some("ZZ"));
    }
}
