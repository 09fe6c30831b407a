//! Background jobs run per table: periodic flush, compaction, and vacuum,
//! each its own recurring task rather than folded into the ingest loop.

use std::sync::Arc;
use std::time::Duration;

use tangram_bus::Bus;
use tangram_history::Table;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::registry::TableRegistry;

/// Flushes `table`'s buffer and, on a non-empty flush, publishes its
/// current location to `tangram:history:table_uri:<name>`.
pub async fn flush_and_publish<B: Bus>(bus: &B, table: &Table) {
    match table.flush().await {
        Ok(0) => {}
        Ok(row_count) => {
            info!(table = table.name(), row_count, "flushed history rows");
            let key = format!("tangram:history:table_uri:{}", table.name());
            let uri = table.table_dir().display().to_string();
            if let Err(error) = bus.set_string(&key, &uri, None).await {
                warn!(%error, table = table.name(), "failed to publish table uri");
            }
        }
        Err(error) => {
            if table.is_quarantined() {
                error!(table = table.name(), %error, "table quarantined after repeated flush failures");
            } else {
                warn!(table = table.name(), %error, "flush failed, will retry next tick");
            }
        }
    }
}

pub fn spawn_flush_loop<B: Bus + Clone>(bus: B, registry: Arc<TableRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for table in registry.open_tables().await {
                if table.is_quarantined() {
                    continue;
                }
                flush_and_publish(&bus, &table).await;
            }
        }
    })
}

pub fn spawn_optimize_loop(registry: Arc<TableRegistry>, interval: Duration, target_file_size: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for table in registry.open_tables().await {
                if let Err(error) = table.optimize(target_file_size).await {
                    warn!(table = table.name(), %error, "optimize failed, will retry next cycle");
                }
            }
        }
    })
}

pub fn spawn_vacuum_loop(registry: Arc<TableRegistry>, interval: Duration, retention: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for table in registry.open_tables().await {
                match table.vacuum(retention).await {
                    Ok(removed) if removed > 0 => {
                        info!(table = table.name(), removed, "vacuumed tombstoned files");
                    }
                    Ok(_) => {}
                    Err(error) => warn!(table = table.name(), %error, "vacuum failed, will retry next cycle"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_bus::InMemoryBus;
    use tangram_history::HistoryRow;

    fn sample_row() -> HistoryRow {
        HistoryRow {
            identifier: "a0b1c2".to_owned(),
            timestamp_ms: 1_700_000_000_000,
            latitude: 43.5,
            longitude: 1.47,
            altitude: Some(32000.0),
            callsign: None,
            track: None,
        }
    }

    #[tokio::test]
    async fn flush_and_publish_sets_table_uri_key_on_non_empty_flush() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        table.enqueue(sample_row()).await.unwrap();
        let bus = InMemoryBus::new();

        flush_and_publish(&bus, &table).await;

        let uri = bus.get_string("tangram:history:table_uri:jet1090").await.unwrap();
        assert!(uri.is_some());
    }

    #[tokio::test]
    async fn flush_and_publish_on_empty_buffer_does_not_touch_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        let bus = InMemoryBus::new();

        flush_and_publish(&bus, &table).await;

        let uri = bus.get_string("tangram:history:table_uri:jet1090").await.unwrap();
        assert!(uri.is_none());
    }
}
