use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edge_gateway::store::{MemoryStore, RateStore, RedisStore};
use edge_gateway::{build_router, utils, AppState, Config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("starting edge-gateway v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        listen = %config.server_addr(),
        downstream = %config.downstream_url,
        redis = config.redis_addr.as_deref().unwrap_or("(in-memory)"),
        auth = config.auth_enabled(),
        "configuration loaded"
    );

    let clock = edge_gateway::clock::system_clock();

    let store: Arc<dyn RateStore> = match &config.redis_addr {
        Some(addr) => {
            let store = RedisStore::connect(addr, clock.clone()).await.map_err(|e| {
                error!("failed to connect to redis: {e}");
                exitcode::UNAVAILABLE
            })?;
            info!(addr = %addr, "using shared redis rate-limit store");
            Arc::new(store)
        }
        None => {
            info!("using in-memory rate-limit store");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let metrics_handle = edge_gateway::metrics::try_install();
    let state = AppState::new(config.clone(), store, clock, metrics_handle);
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("invalid listen address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("gateway listening on http://{addr}");
    info!("reserved endpoints:");
    info!("  GET  /health                        - liveness probe");
    info!("  GET  /ready                         - readiness probe");
    info!("  GET  /status                        - service status");
    info!("  GET  /metrics                       - Prometheus exposition");
    info!("  GET  /admin/policies                - list rate-limit policies");
    info!("  POST /admin/policies                - upsert a policy");
    info!("  GET  /admin/breakers                - circuit breaker snapshots");
    info!("  POST /admin/breakers/{{t}}/reset      - reset a breaker");
    info!("  *    (everything else)              - proxied to {}", config.downstream_url);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("http server stopped, draining background tasks");
    state.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
