//! `courierd`: the dispatch worker as a standalone process.
//!
//! Run with: `DATABASE_URL=postgres://... cargo run --bin courierd`
//!
//! Set `COURIER_METRICS_ADDR` (e.g. `0.0.0.0:9090`) to serve Prometheus
//! metrics at `/metrics`.

use courier_core::WorkerConfig;
use courier_daemon::{DaemonError, RestartPolicy, Supervisor, signals};
use courier_postgres::{PgDispatchStore, WakeListener};
use courier_runtime::WorkerHandle;
use courier_runtime::metrics::MetricsServer;
use std::net::SocketAddr;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = WorkerConfig::from_env()?;
    let policy = RestartPolicy::from_env()?;
    info!(
        batch_size = config.batch_size,
        ttl_secs = config.ttl.as_secs(),
        "Starting courierd"
    );

    if let Ok(addr) = std::env::var("COURIER_METRICS_ADDR") {
        let parsed = addr
            .parse()
            .map_err(|source| DaemonError::MetricsAddr { addr, source })?;
        start_metrics(parsed).await?;
    }

    let handle = WorkerHandle::new();

    let supervisor = Supervisor::spawn(handle.clone(), config.clone(), policy, |config| {
        let store = PgDispatchStore::connect(&config.database_url)?;
        store.migrate()?;
        Ok(store)
    })?;

    let listener_handle = handle.clone();
    let database_url = config.database_url.clone();
    tokio::spawn(async move {
        match WakeListener::connect(&database_url).await {
            Ok(listener) => {
                if let Err(e) = listener.forward(|| listener_handle.wake()).await {
                    warn!(error = %e, "Wake listener stopped");
                }
            }
            Err(e) => warn!(error = %e, "Wake listener unavailable; relying on idle wait"),
        }
    });

    if let Err(e) = signals::forward(handle.clone()).await {
        error!(error = %e, "Signal handling failed");
        handle.shutdown();
    }

    info!("Waiting for the worker to finish its batch...");
    tokio::task::spawn_blocking(move || supervisor.join()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Install the Prometheus recorder and serve it.
async fn start_metrics(addr: SocketAddr) -> Result<(), DaemonError> {
    let mut server = MetricsServer::new(addr);
    server.start()?;

    let Some(prometheus) = server.handle().cloned() else {
        return Ok(());
    };
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { prometheus.render() }),
    );

    let listener = tokio::net::TcpListener::bind(server.addr()).await?;
    info!("Prometheus metrics available at http://{}/metrics", server.addr());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server error");
        }
    });
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
