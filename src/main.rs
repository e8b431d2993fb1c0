use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;

use synckit_server::config::Config;
use synckit_server::ServerContext;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env();
    config.validate_jwt_secret();

    let bind_addr = format!("{}:{}", config.host, config.port);
    let storage_enabled = config.storage_enabled();
    let pubsub_enabled = config.pubsub_enabled();

    let ctx = ServerContext::build(config)
        .await
        .expect("failed to build server context");

    if pubsub_enabled {
        ctx.pubsub
            .announce_presence(&ctx.server_id, None)
            .await
            .expect("failed to announce presence");
    }

    info!(storage = storage_enabled, pubsub = pubsub_enabled, "server context ready");

    let router = synckit_server::build_router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    if pubsub_enabled {
        let _ = ctx.pubsub.announce_shutdown(&ctx.server_id).await;
    }
    let _ = ctx.storage.disconnect().await;
    let _ = ctx.pubsub.disconnect().await;
    ctx.stop_background_tasks();

    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
