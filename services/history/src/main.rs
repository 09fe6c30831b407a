use tangram_bus::RedisBus;
use tangram_history_engine::EngineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = tangram_config::load_config().expect("failed to load config");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.effective_log_level()))
        .init();

    let history_config = config
        .history_config("tangram_history")
        .expect("failed to load history plugin config");

    info!(base_path = %history_config.base_path, "connecting to bus...");
    let bus = RedisBus::connect(&config.core.redis_url)
        .await
        .expect("failed to connect to redis");

    let engine_config = EngineConfig::from(&history_config);

    info!("history engine starting");
    tokio::select! {
        _ = tangram_history_engine::run(bus, engine_config) => {
            info!("history engine tasks ended");
        }
        _ = shutdown_signal() => {
            info!("history engine shut down gracefully");
        }
    }
}

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
