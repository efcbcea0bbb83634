//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::Config;
use domain::{
    InMemoryPaymentGateway, LogMailer, MailQueue, OrderCoordinator, PaymentGateway, SnapConfig,
    SnapGateway,
};
use metrics_exporter_prometheus::PrometheusHandle;
use store::{InMemoryStore, PostgresStore, Store};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Orders retried per payment session sweep.
const SWEEP_BATCH: usize = 50;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn payment_gateway(config: &Config) -> Arc<dyn PaymentGateway> {
    match &config.midtrans_server_key {
        Some(server_key) => {
            let gateway = SnapGateway::new(SnapConfig {
                server_key: server_key.clone(),
                production: config.midtrans_production,
            });
            tracing::info!(endpoint = gateway.endpoint(), "using Midtrans Snap gateway");
            Arc::new(gateway)
        }
        None => {
            tracing::warn!("MIDTRANS_SERVER_KEY not set, using in-memory payment gateway");
            Arc::new(InMemoryPaymentGateway::new())
        }
    }
}

/// Runs the server on `store` until a shutdown signal arrives, then drains
/// the mail queue.
async fn serve<S: Store + 'static>(
    store: Arc<S>,
    config: &Config,
    metrics_handle: PrometheusHandle,
) {
    let (mail, mail_workers) = MailQueue::start(
        Arc::new(LogMailer),
        config.mail_queue_capacity,
        config.mail_workers,
    );
    tracing::info!(
        workers = mail_workers.len(),
        capacity = config.mail_queue_capacity,
        "mail queue started"
    );

    let coordinator = OrderCoordinator::new(store, payment_gateway(config)).with_mail_queue(mail);
    let sweep = config.session_sweep_interval().map(|every| {
        tracing::info!(every_secs = every.as_secs(), "payment session sweep enabled");
        coordinator.spawn_session_sweep(every, SWEEP_BATCH)
    });

    let app = api::create_app(AppState::new(coordinator), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // The sweep task holds a mail queue handle; the workers only stop once
    // every handle is gone.
    if let Some(sweep) = sweep {
        sweep.abort();
        let _ = sweep.await;
    }
    mail_workers.join().await;

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store and serve
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url, config.database_max_connections)
                .await
                .expect("failed to connect to PostgreSQL");
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!(
                max_connections = config.database_max_connections,
                "using PostgreSQL store"
            );
            serve(Arc::new(store), &config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store with demo catalog");
            let store = InMemoryStore::new();
            api::seed::demo(&store).await;
            serve(Arc::new(store), &config, metrics_handle).await;
        }
    }
}
