use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use traveease_payments::api::{self, AppState};
use traveease_payments::config::AppConfig;
use traveease_payments::health::HealthChecker;
use traveease_payments::ledger::{InMemoryLedger, Ledger};
use traveease_payments::logging::init_tracing;
use traveease_payments::payments::GatewayRegistry;
use traveease_payments::services::{
    CheckoutService, ExchangeRateService, GeolocationResolver, PaymentOrchestrator,
    RefundCoordinator, SplitDistributor, WebhookProcessor,
};
use traveease_payments::workers::{RateRefreshWorker, TransferRetryWorker};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[cfg(feature = "database")]
async fn build_ledger(config: &AppConfig) -> anyhow::Result<Arc<dyn Ledger>> {
    use traveease_payments::ledger::postgres::init_pool;
    use traveease_payments::ledger::PgLedger;

    let Some(database) = &config.database else {
        warn!("⚠️  DATABASE_URL not set, using the in-memory ledger (state is lost on restart)");
        return Ok(Arc::new(InMemoryLedger::new()));
    };

    info!("📊 Initializing ledger database pool...");
    let pool = init_pool(database)
        .await
        .context("failed to connect to the ledger database")?;
    if database.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run ledger migrations")?;
        info!("✅ Ledger migrations applied");
    }
    info!(
        max_connections = database.max_connections,
        "✅ Ledger database pool initialized"
    );
    Ok(Arc::new(PgLedger::new(pool)))
}

#[cfg(not(feature = "database"))]
async fn build_ledger(_config: &AppConfig) -> anyhow::Result<Arc<dyn Ledger>> {
    warn!("⚠️  Built without the database feature, using the in-memory ledger");
    Ok(Arc::new(InMemoryLedger::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config.logging);
    config.validate().context("invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "🚀 Starting Traveease payments service"
    );

    // Rails
    let registry = GatewayRegistry::from_env(&config.orchestrator.registry_config())
        .context("failed to configure payment rails")?;
    if registry.is_empty() {
        anyhow::bail!("no payment rail is configured; set at least one rail's secret key");
    }
    info!(rails = ?registry.rails(), "✅ Payment rails registered");

    let ledger = build_ledger(&config).await?;

    // Services
    if !config.geolocation.lookup_enabled() {
        warn!("⚠️  MaxMind credentials not set, geolocation falls back to client-supplied country");
    }
    let geolocation = Arc::new(GeolocationResolver::from_config(&config.geolocation));
    let rates = Arc::new(
        ExchangeRateService::from_config(&config.exchange_rates)
            .context("invalid exchange rate table")?,
    );
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        registry.clone(),
        Arc::clone(&ledger),
        geolocation,
        config.orchestrator.clone(),
    ));
    let distributor = Arc::new(SplitDistributor::new(
        registry.clone(),
        Arc::clone(&ledger),
        config.distributor.clone(),
    ));
    let refunds = Arc::new(RefundCoordinator::new(
        registry.clone(),
        Arc::clone(&ledger),
        Duration::from_secs(config.orchestrator.rail_timeout_secs),
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        registry,
        Arc::clone(&ledger),
        Arc::clone(&refunds),
        Arc::clone(&distributor),
    ));
    let checkout = Arc::new(CheckoutService::new(
        Arc::clone(&orchestrator),
        Arc::clone(&rates),
    ));
    let health = HealthChecker::new(
        Arc::clone(&orchestrator),
        Duration::from_secs(config.server.health_check_timeout_secs),
    );

    // Workers
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let mut worker_handles = Vec::new();

    if config.workers.transfer_retry_enabled {
        let worker = TransferRetryWorker::new(
            Arc::clone(&ledger),
            Arc::clone(&distributor),
            config.workers.transfer_retry.clone(),
        )
        .with_refunds(Arc::clone(&refunds));
        worker_handles.push(tokio::spawn(worker.run(worker_shutdown_rx.clone())));
        info!("✅ Transfer retry worker started");
    } else {
        info!("Transfer retry worker disabled (TRANSFER_RETRY_ENABLED=false)");
    }

    if config.workers.rate_refresh_enabled {
        let worker = RateRefreshWorker::new(
            Arc::clone(&rates),
            Duration::from_secs(config.exchange_rates.refresh_interval_secs),
        );
        worker_handles.push(tokio::spawn(worker.run(worker_shutdown_rx.clone())));
        info!("✅ Exchange rate refresh worker started");
    }

    let app = api::router(AppState {
        orchestrator,
        distributor,
        refunds,
        webhooks,
        checkout,
        health,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "🌐 Payments API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx))
        .await
        .map_err(|e| {
            error!(error = %e, "Server error");
            e
        })?;

    for handle in worker_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task panicked");
        }
    }

    info!("👋 Traveease payments service stopped");
    Ok(())
}
