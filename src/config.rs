//! Process configuration
//!
//! Everything is read from the environment (a `.env` file is honoured in
//! development). Component settings live next to their component and share
//! the same `from_env` / `validate` shape; this module only gathers them.

use crate::services::exchange_rate::ExchangeRateConfig;
use crate::services::geolocation::GeolocationConfig;
use crate::services::payment_orchestrator::OrchestratorConfig;
use crate::services::split_distributor::DistributorConfig;
use crate::workers::WorkerConfig;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` runs the service on the in-memory ledger.
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub geolocation: GeolocationConfig,
    pub exchange_rates: ExchangeRateConfig,
    pub distributor: DistributorConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-probe bound for `GET /payments/health`
    pub health_check_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Seconds to wait for a pooled connection
    pub connection_timeout: u64,
    /// Apply `migrations/` on startup
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Read an env var and parse it, falling back to `default` when unset or malformed.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Like [`env_or`], but a present-and-malformed value is an error.
fn env_strict<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, raw))),
        _ => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env_optional()?,
            logging: LoggingConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
            geolocation: GeolocationConfig::from_env(),
            exchange_rates: ExchangeRateConfig::from_env(),
            distributor: DistributorConfig::from_env(),
            workers: WorkerConfig::from_env(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.orchestrator
            .validate()
            .map_err(ConfigError::ValidationFailed)?;
        self.exchange_rates
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
        if self.distributor.max_transfer_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "TRANSFER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_strict("SERVER_PORT", 8000)?,
            health_check_timeout_secs: env_or("HEALTH_CHECK_TIMEOUT_SECS", 5),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("SERVER_PORT=0".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("SERVER_HOST is empty".to_string()));
        }
        if self.health_check_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "HEALTH_CHECK_TIMEOUT_SECS=0".to_string(),
            ));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// `None` when `DATABASE_URL` is unset.
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        let url = match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => return Ok(None),
        };

        Ok(Some(DatabaseConfig {
            url,
            max_connections: env_strict("DB_MAX_CONNECTIONS", 20)?,
            min_connections: env_strict("DB_MIN_CONNECTIONS", 2)?,
            connection_timeout: env_strict("DB_CONNECTION_TIMEOUT", 30)?,
            run_migrations: env_or("RUN_MIGRATIONS", false),
        }))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.url.starts_with("postgres://") && !self.url.starts_with("postgresql://") {
            return Err(ConfigError::InvalidValue(
                "DATABASE_URL must be a postgres URL".to_string(),
            ));
        }
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(format!(
                "pool bounds {}..{}",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let format = match env::var("LOG_FORMAT").map(|v| v.to_lowercase()) {
            Ok(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        };
        LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue(format!("LOG_LEVEL={}", self.level)));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(port: u16) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            health_check_timeout_secs: 5,
        }
    }

    #[test]
    fn test_server_port_must_be_set() {
        assert!(server(8000).validate().is_ok());
        assert!(server(0).validate().is_err());
    }

    #[test]
    fn test_database_url_must_be_postgres() {
        let config = DatabaseConfig {
            url: "mysql://localhost/db".to_string(),
            max_connections: 5,
            min_connections: 1,
            connection_timeout: 5,
            run_migrations: false,
        };
        assert!(config.validate().is_err());

        let config = DatabaseConfig {
            url: "postgres://localhost/payments".to_string(),
            ..config
        };
        assert!(config.validate().is_ok());

        let inverted = DatabaseConfig {
            min_connections: 10,
            ..config
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = LoggingConfig {
            level: "verbose".to_string(),
            format: LogFormat::Plain,
        };
        assert!(config.validate().is_err());
        config.level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_parsing() {
        std::env::set_var("TRAVEEASE_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("TRAVEEASE_TEST_ENV_OR", 7u64), 7);
        assert!(env_strict("TRAVEEASE_TEST_ENV_OR", 7u64).is_err());
        std::env::set_var("TRAVEEASE_TEST_ENV_OR", "12");
        assert_eq!(env_or("TRAVEEASE_TEST_ENV_OR", 7u64), 12);
        std::env::remove_var("TRAVEEASE_TEST_ENV_OR");
        assert_eq!(env_strict("TRAVEEASE_TEST_ENV_OR", 7u64).unwrap(), 7);
    }
}
