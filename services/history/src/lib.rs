//! The history engine: ingests rows enqueued by the live-state pipeline
//! into per-table Delta-style storage, runs its background maintenance,
//! and answers the admin control protocol.

pub mod control;
pub mod ingest;
pub mod maintenance;
pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tangram_bus::Bus;
use tangram_config::HistoryConfig;

pub use registry::TableRegistry;

pub struct EngineConfig {
    pub base_path: PathBuf,
    pub buffer_capacity: usize,
    pub flush_interval: Duration,
    pub optimize_interval: Duration,
    pub optimize_target_file_size: u64,
    pub vacuum_interval: Duration,
    pub vacuum_retention: Duration,
}

impl From<&HistoryConfig> for EngineConfig {
    fn from(config: &HistoryConfig) -> Self {
        EngineConfig {
            base_path: PathBuf::from(&config.base_path),
            buffer_capacity: config.history_buffer_size,
            flush_interval: Duration::from_secs(config.history_flush_interval_secs),
            optimize_interval: Duration::from_secs(config.history_optimize_interval_secs),
            optimize_target_file_size: config.history_optimize_target_file_size,
            vacuum_interval: Duration::from_secs(config.history_vacuum_interval_secs),
            vacuum_retention: Duration::from_secs(config.history_vacuum_retention_period_secs),
        }
    }
}

/// Spawns ingest, the three maintenance loops, and the control responder,
/// then blocks forever — intended to be raced against a shutdown signal by
/// the caller.
pub async fn run<B: Bus + Clone>(bus: B, config: EngineConfig) {
    let registry = TableRegistry::new(config.base_path, config.buffer_capacity);

    let ingest = tokio::spawn(ingest::run_ingest(bus.clone(), registry.clone()));
    let control = tokio::spawn(control::run_control(bus.clone(), registry.clone()));
    let flush = maintenance::spawn_flush_loop(bus.clone(), registry.clone(), config.flush_interval);
    let optimize = maintenance::spawn_optimize_loop(registry.clone(), config.optimize_interval, config.optimize_target_file_size);
    let vacuum = maintenance::spawn_vacuum_loop(registry.clone(), config.vacuum_interval, config.vacuum_retention);

    let _ = tokio::join!(ingest, control, flush, optimize, vacuum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_bus::InMemoryBus;
    use tangram_history::HistoryRow;

    #[tokio::test]
    async fn row_published_before_flush_interval_is_durable_after_it() {
        let dir = tempfile::tempdir().unwrap();
        let bus = InMemoryBus::new();
        let config = EngineConfig {
            base_path: dir.path().to_path_buf(),
            buffer_capacity: 100,
            flush_interval: Duration::from_millis(30),
            optimize_interval: Duration::from_secs(3600),
            optimize_target_file_size: 128 * 1024 * 1024,
            vacuum_interval: Duration::from_secs(3600),
            vacuum_retention: Duration::from_secs(7 * 24 * 3600),
        };

        let handle = tokio::spawn(run(bus.clone(), config));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let row = HistoryRow {
            identifier: "a0b1c2".to_owned(),
            timestamp_ms: 1_700_000_000_000,
            latitude: 43.5,
            longitude: 1.47,
            altitude: Some(32000.0),
            callsign: None,
            track: None,
        };
        bus.publish("history:rows:jet1090", &serde_json::to_string(&row).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let uri = bus.get_string("tangram:history:table_uri:jet1090").await.unwrap();
        assert!(uri.is_some());
        handle.abort();
    }
}
