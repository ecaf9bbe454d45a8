use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::GatewayAdapter;
use crate::payments::providers::{FlutterwaveAdapter, PayPalAdapter, PaystackAdapter, StripeAdapter};
use crate::payments::types::Rail;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub enabled_rails: Vec<Rail>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled_rails: Rail::ALL.to_vec(),
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let raw = match std::env::var("ENABLED_RAILS") {
            Ok(v) => v,
            Err(_) => return Ok(Self::default()),
        };

        let mut enabled_rails = Vec::new();
        for part in raw.split(',') {
            let value = part.trim();
            if value.is_empty() {
                continue;
            }
            let rail = Rail::from_str(value)?;
            if !enabled_rails.contains(&rail) {
                enabled_rails.push(rail);
            }
        }

        if enabled_rails.is_empty() {
            return Err(PaymentError::ValidationError {
                message: "ENABLED_RAILS must name at least one rail".to_string(),
                field: Some("ENABLED_RAILS".to_string()),
            });
        }
        Ok(Self { enabled_rails })
    }
}

/// The configured set of rail adapters, keyed by rail.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    adapters: BTreeMap<Rail, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled rail from its own environment. A rail whose
    /// credentials are missing is skipped; having none at all is an error.
    pub fn from_env(config: &RegistryConfig) -> PaymentResult<Self> {
        let mut registry = Self::new();
        for rail in &config.enabled_rails {
            let built: PaymentResult<Arc<dyn GatewayAdapter>> = match rail {
                Rail::Stripe => StripeAdapter::from_env().map(|a| Arc::new(a) as _),
                Rail::PayPal => PayPalAdapter::from_env().map(|a| Arc::new(a) as _),
                Rail::Flutterwave => FlutterwaveAdapter::from_env().map(|a| Arc::new(a) as _),
                Rail::Paystack => PaystackAdapter::from_env().map(|a| Arc::new(a) as _),
            };
            match built {
                Ok(adapter) => {
                    info!(rail = %rail, "payment rail registered");
                    registry = registry.with_adapter(adapter);
                }
                Err(e) => warn!(rail = %rail, error = %e, "payment rail not configured, skipping"),
            }
        }

        if registry.is_empty() {
            return Err(PaymentError::ValidationError {
                message: "no payment rail is configured".to_string(),
                field: Some("ENABLED_RAILS".to_string()),
            });
        }
        Ok(registry)
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.insert(adapter.rail(), adapter);
        self
    }

    pub fn get(&self, rail: Rail) -> Option<Arc<dyn GatewayAdapter>> {
        self.adapters.get(&rail).cloned()
    }

    pub fn contains(&self, rail: Rail) -> bool {
        self.adapters.contains_key(&rail)
    }

    pub fn rails(&self) -> Vec<Rail> {
        self.adapters.keys().copied().collect()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn GatewayAdapter>> {
        self.adapters.values()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::providers::{PaystackConfig, StripeConfig};

    #[test]
    fn registry_keys_adapters_by_rail() {
        let registry = GatewayRegistry::new()
            .with_adapter(Arc::new(
                StripeAdapter::new(StripeConfig {
                    secret_key: "sk".to_string(),
                    ..StripeConfig::default()
                })
                .unwrap(),
            ))
            .with_adapter(Arc::new(
                PaystackAdapter::new(PaystackConfig {
                    secret_key: "sk".to_string(),
                    ..PaystackConfig::default()
                })
                .unwrap(),
            ));

        assert_eq!(registry.rails(), vec![Rail::Stripe, Rail::Paystack]);
        assert!(registry.contains(Rail::Paystack));
        assert!(registry.get(Rail::PayPal).is_none());
    }

    #[test]
    fn enabled_rails_default_to_all() {
        assert_eq!(RegistryConfig::default().enabled_rails.len(), 4);
    }
}
