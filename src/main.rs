use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::clock::SystemClock;
use gatekeeper::store::StoreFailurePolicy;
use gatekeeper::{AppError, AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!("Starting Gatekeeper v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// `RUST_LOG` filter (default `info`); `LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        store = %config.store_backend,
        failure_policy = %config.store_failure_policy,
        keyring = %config.encryption_keys_file.display(),
        "Configuration loaded"
    );

    if config.store_failure_policy == StoreFailurePolicy::FailOpen {
        warn!("STORE_FAILURE_POLICY=fail_open: revocations and rate limits are not enforced while the store is down");
    }

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    }

    let state = AppState::from_config(config.clone(), SystemClock::shared())
        .await
        .map_err(|e| {
            error!("Failed to initialise security components: {e}");
            match e {
                AppError::StoreUnavailable(_) => exitcode::UNAVAILABLE,
                AppError::KeyringError(_) => exitcode::IOERR,
                _ => exitcode::CONFIG,
            }
        })?;
    info!(
        current_key = %state.keys.current_key_id(),
        keys = state.keys.list_keys().len(),
        "Security components ready"
    );

    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health              - Health check");
    info!("  GET  /ready               - Readiness check");
    info!("  POST /auth/refresh        - Rotate a refresh token");
    info!("  POST /auth/revoke         - Revoke a token");
    info!("  GET  /auth/whoami         - Current principal");
    info!("  POST /vault/encrypt       - Encrypt a payload");
    info!("  POST /vault/decrypt       - Decrypt a payload");
    info!("  GET  /admin/keys          - List encryption keys");
    info!("  POST /admin/keys/rotate   - Rotate the current encryption key");

    // ConnectInfo gives the pipeline the peer address for trusted proxy checks
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    if let Err(e) = served {
        error!("Server error: {e}");
        return Err(exitcode::SOFTWARE);
    }

    info!("Server shutdown complete");
    Ok(())
}
