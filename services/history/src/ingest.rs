//! Subscribes to rows enqueued by the live-state pipeline and pushes them
//! into the matching table's write buffer, triggering an out-of-band flush
//! when a push crosses the watermark.

use std::sync::Arc;

use tangram_bus::Bus;
use tangram_history::HistoryRow;
use tracing::{debug, warn};

use crate::maintenance::flush_and_publish;
use crate::registry::TableRegistry;

const ROWS_PATTERN: &str = "history:rows:*";
const ROWS_PREFIX: &str = "history:rows:";

pub async fn run_ingest<B: Bus + Clone>(bus: B, registry: Arc<TableRegistry>) {
    let mut subscription = match bus.subscribe(&[ROWS_PATTERN.to_owned()]).await {
        Ok(sub) => sub,
        Err(error) => {
            tracing::error!(%error, "failed to subscribe to history row intake");
            return;
        }
    };

    while let Some(message) = subscription.recv().await {
        let Some(table_name) = message.channel.strip_prefix(ROWS_PREFIX) else {
            continue;
        };
        let row: HistoryRow = match serde_json::from_str(&message.payload) {
            Ok(row) => row,
            Err(error) => {
                debug!(%error, table = table_name, "dropping malformed history row");
                continue;
            }
        };

        let table = match registry.get_or_create(table_name).await {
            Ok(table) => table,
            Err(error) => {
                warn!(%error, table = table_name, "failed to open table for ingest");
                continue;
            }
        };

        match table.enqueue(row).await {
            Ok(should_flush_now) => {
                if should_flush_now {
                    let bus = bus.clone();
                    let table = table.clone();
                    tokio::spawn(async move {
                        flush_and_publish(&bus, &table).await;
                    });
                }
            }
            Err(error) => warn!(%error, table = table_name, "row dropped: table is quarantined"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_bus::InMemoryBus;

    fn sample_row(ts_ms: i64) -> HistoryRow {
        HistoryRow {
            identifier: "a0b1c2".to_owned(),
            timestamp_ms: ts_ms,
            latitude: 43.5,
            longitude: 1.47,
            altitude: Some(32000.0),
            callsign: None,
            track: None,
        }
    }

    #[tokio::test]
    async fn row_on_table_topic_is_enqueued_into_the_right_table() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(dir.path().to_path_buf(), 100);
        let bus = InMemoryBus::new();

        let handle = tokio::spawn(run_ingest(bus.clone(), registry.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let payload = serde_json::to_string(&sample_row(1_700_000_000_000)).unwrap();
        bus.publish("history:rows:jet1090", &payload).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let table = registry.get_or_create("jet1090").await.unwrap();
        assert_eq!(table.buffered_len().await, 1);
        handle.abort();
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(dir.path().to_path_buf(), 100);
        let bus = InMemoryBus::new();

        let handle = tokio::spawn(run_ingest(bus.clone(), registry.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.publish("history:rows:jet1090", "not json").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let table = registry.get_or_create("jet1090").await.unwrap();
        assert_eq!(table.buffered_len().await, 0);
        handle.abort();
    }
}
