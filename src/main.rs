use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};

use auth_proxy::utils::{self, LogFormat};
use auth_proxy::{Config, build_gateway};

#[tokio::main]
async fn main() -> ExitCode {
    // LOG_FORMAT may come from .env, which must be read before logging starts
    let _ = dotenvy::dotenv();
    utils::init_tracing(LogFormat::from_env());

    info!("Starting auth proxy v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the gateway, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        listen = %config.listen_addr,
        upstream = %config.upstream,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        auth_proxy::metrics::try_init_metrics(metrics_addr);
    }

    let gateway = build_gateway(&config).await.map_err(|e| {
        error!("Failed to build gateway: {e}");
        e.exit_code()
    })?;

    let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
        error!("Failed to bind to {}: {e}", config.listen_addr);
        exitcode::UNAVAILABLE
    })?;
    info!("Gateway listening on http://{}", config.listen_addr);

    // Peer addresses feed X-Forwarded-For and the rate limiter key
    let app = gateway
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(utils::shutdown_signal())
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })?;

    info!("HTTP server stopped, shutting down background tasks...");
    gateway.shutdown().await;

    info!("Gateway shutdown complete");
    Ok(())
}
