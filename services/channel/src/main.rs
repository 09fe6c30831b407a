use tangram_admission::Admission;
use tangram_bus::RedisBus;
use tangram_channel::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = tangram_config::load_config().expect("failed to load config");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.effective_log_level()))
        .init();

    info!("connecting to bus...");
    let bus = RedisBus::connect(&config.core.redis_url)
        .await
        .expect("failed to connect to redis");

    let admission = Admission::new(
        config.channel.jwt_secret.clone(),
        config.channel.jwt_expiration_secs,
    );
    let bind_addr = format!("{}:{}", config.channel.host, config.channel.port);

    let state = AppState::new(bus, admission, config.channel.clone());
    let router = tangram_channel::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "channel multiplexer listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("channel multiplexer shut down gracefully");
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
