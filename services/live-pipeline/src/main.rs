use std::time::Duration;

use tangram_bus::RedisBus;
use tangram_live_pipeline::{LivePipelineConfig, NoopAircraftInfoLookup};
use tangram_state::{StateStore, spawn_expiry_sweeper};
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

    let history = config
        .history_config("tangram_history")
        .expect("failed to load history plugin config");

    let store = StateStore::new(Duration::from_secs(history.state_vector_expire));
    let _sweeper = spawn_expiry_sweeper(store.clone(), Duration::from_secs(30));

    let pipeline_config = LivePipelineConfig {
        state_ttl: Duration::from_secs(history.state_vector_expire),
        ..LivePipelineConfig::default()
    };

    info!("live-state pipeline starting");
    tokio::select! {
        _ = tangram_live_pipeline::run(bus, store, std::sync::Arc::new(NoopAircraftInfoLookup), pipeline_config) => {
            info!("raw feed subscription ended");
        }
        _ = shutdown_signal() => {
            info!("live-state pipeline shut down gracefully");
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
