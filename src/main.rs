use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use storefront_payments::api;
use storefront_payments::config::AppConfig;
use storefront_payments::database::{
    init_pool_from_config, InMemoryOrderStore, InMemoryPaymentStore, OrderStore, PayerDirectory,
    PaymentStore, PgOrderRepository, PgPaymentRepository,
};
use storefront_payments::health::HealthChecker;
use storefront_payments::logging::init_tracing;
use storefront_payments::payments::{CheckoutGateway, GatewayClient};
use storefront_payments::services::{
    LoggingNotificationSender, OrchestratorConfig, PaymentOrchestrator, WebhookProcessor,
};
use storefront_payments::workers::ExpirySweeper;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate().map_err(|e| {
        error!(error = %e, "❌ Invalid configuration");
        e
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        "🚀 Starting storefront payments service"
    );

    // Stores
    let mut db_pool = None;
    let payments: Arc<dyn PaymentStore>;
    let orders: Arc<dyn OrderStore>;
    let payers: Arc<dyn PayerDirectory>;
    if config.skip_externals {
        info!("⏭️  Skipping database initialization (SKIP_EXTERNALS=true), using in-memory store");
        let order_store = Arc::new(InMemoryOrderStore::new());
        payments = Arc::new(InMemoryPaymentStore::new());
        orders = order_store.clone();
        payers = order_store;
    } else {
        info!("📊 Initializing database connection pool...");
        let pool = init_pool_from_config(&config.database).await.map_err(|e| {
            error!("Failed to initialize database pool: {}", e);
            e
        })?;
        info!(
            max_connections = pool.options().get_max_connections(),
            "✅ Database connection pool initialized"
        );
        let order_repo = Arc::new(PgOrderRepository::new(pool.clone()));
        payments = Arc::new(PgPaymentRepository::new(pool.clone()));
        orders = order_repo.clone();
        payers = order_repo;
        db_pool = Some(pool);
    }

    // Gateway
    let gateway_client = GatewayClient::new(config.gateway.clone()).map_err(|e| {
        error!(error = %e, "❌ Failed to initialize gateway client");
        e
    })?;
    let envelope = gateway_client.envelope().clone();
    info!(
        base_url = %config.gateway.base_url,
        currency = %gateway_client.currency(),
        "✅ Gateway client initialized"
    );
    let gateway: Arc<dyn CheckoutGateway> = Arc::new(gateway_client);

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        payments,
        orders,
        payers,
        gateway,
        envelope,
        Arc::new(LoggingNotificationSender::new()),
        OrchestratorConfig {
            pending_ttl_secs: config.sweeper.pending_ttl_secs,
            ..OrchestratorConfig::default()
        },
    ));

    let webhook_processor = Arc::new(WebhookProcessor::new(
        orchestrator.clone(),
        config.gateway.access_code.clone(),
        config.gateway.webhook_secret.clone(),
    ));
    let health_checker = Arc::new(HealthChecker::new(db_pool, config.gateway.clone()));

    // Expiry sweeper
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = ExpirySweeper::from_config(orchestrator.clone(), &config.sweeper);
        Some(tokio::spawn(sweeper.run(worker_shutdown_rx)))
    } else {
        info!("Payment expiry sweeper disabled (PAYMENT_EXPIRY_SWEEP_ENABLED=false)");
        None
    };

    let app = api::router(orchestrator, webhook_processor, health_checker);
    info!("✅ Routes configured");

    let addr: SocketAddr = config.server.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("Timed out waiting for expiry sweeper shutdown");
        }
    }

    info!("👋 Server shutdown complete");

    Ok(())
}
