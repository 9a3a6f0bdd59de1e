use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use muster::api;
use muster::config::Config;
use muster::services::database::DriverCatalog;
use muster::services::{DriverBroker, FileConfigSource, RequestHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Reading database definitions from {}", config.muster.config_path);
    let broker = DriverBroker::new(DriverCatalog::with_builtin_drivers());
    let handler = RequestHandler::new(
        Arc::new(FileConfigSource::new(&config.muster.config_path)),
        broker,
        config.handler_options(),
    )
    .with_context(|| format!("Couldn't initialize from `{}`", config.muster.config_path))?;

    // Failed probes are logged, never fatal
    let reports = handler.self_test().await;
    let healthy = reports.iter().filter(|report| report.is_ok()).count();
    info!("Self-test: {}/{} database(s) reachable", healthy, reports.len());

    let app: Router = api::routes::create_router_with_state(Arc::new(handler));

    let addr: SocketAddr = config
        .server_address()
        .parse()
        .with_context(|| format!("Invalid listen address `{}`", config.server_address()))?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
