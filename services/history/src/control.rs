//! The `history:control` command channel: list tables, delete rows, each
//! answered on the caller's own `history:control:response:<sender_id>`.

use std::sync::Arc;

use tangram_bus::Bus;
use tangram_protocol::{ControlCommand, ControlResponse, TableSummary};
use tracing::{debug, warn};

use crate::registry::TableRegistry;

const CONTROL_TOPIC: &str = "history:control";

pub async fn run_control<B: Bus + Clone>(bus: B, registry: Arc<TableRegistry>) {
    let mut subscription = match bus.subscribe(&[CONTROL_TOPIC.to_owned()]).await {
        Ok(sub) => sub,
        Err(error) => {
            tracing::error!(%error, "failed to subscribe to control channel");
            return;
        }
    };

    while let Some(message) = subscription.recv().await {
        let command: ControlCommand = match serde_json::from_str(&message.payload) {
            Ok(command) => command,
            Err(error) => {
                debug!(%error, "dropping malformed control command");
                continue;
            }
        };
        let sender_id = command.sender_id().to_owned();
        let response = handle_command(&registry, command).await;
        let response_topic = format!("history:control:response:{sender_id}");
        match serde_json::to_string(&response) {
            Ok(payload) => {
                if let Err(error) = bus.publish(&response_topic, &payload).await {
                    warn!(%error, sender_id, "failed to publish control response");
                }
            }
            Err(error) => warn!(%error, sender_id, "failed to serialize control response"),
        }
    }
}

async fn handle_command(registry: &TableRegistry, command: ControlCommand) -> ControlResponse {
    match command {
        ControlCommand::ListTables { .. } => match tangram_history::query::list_tables(registry.base_path()) {
            Ok(summaries) => ControlResponse::TableList {
                tables: summaries
                    .into_iter()
                    .map(|s| TableSummary {
                        name: s.name,
                        uri: s.uri,
                        version: s.version,
                        schema_json: s.schema_json,
                    })
                    .collect(),
            },
            Err(error) => ControlResponse::CommandFailed { error: error.to_string() },
        },
        ControlCommand::DeleteRows { table, predicate, dry_run, .. } => {
            let table = match registry.get_or_create(&table).await {
                Ok(table) => table,
                Err(error) => return ControlResponse::CommandFailed { error: error.to_string() },
            };
            match table.delete_rows(&predicate, dry_run).await {
                Ok(outcome) => ControlResponse::DeleteOutput {
                    affected_rows: outcome.affected_rows,
                    preview_json: outcome.preview_json,
                },
                Err(error) => ControlResponse::CommandFailed { error: error.to_string() },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_bus::InMemoryBus;
    use tangram_history::HistoryRow;

    #[tokio::test]
    async fn list_tables_reports_opened_table() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(dir.path().to_path_buf(), 100);
        registry.get_or_create("jet1090").await.unwrap();

        let response = handle_command(&registry, ControlCommand::ListTables { sender_id: "cli-1".to_owned() }).await;
        match response {
            ControlResponse::TableList { tables } => {
                assert_eq!(tables.len(), 1);
                assert_eq!(tables[0].name, "jet1090");
            }
            other => panic!("expected TableList, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_rows_dry_run_reports_affected_count_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(dir.path().to_path_buf(), 100);
        let table = registry.get_or_create("jet1090").await.unwrap();
        table
            .enqueue(HistoryRow {
                identifier: "a0b1c2".to_owned(),
                timestamp_ms: 0,
                latitude: 43.5,
                longitude: 1.47,
                altitude: None,
                callsign: None,
                track: None,
            })
            .await
            .unwrap();
        table.flush().await.unwrap();
        let version_before = table.current_state().unwrap().version;

        let response = handle_command(
            &registry,
            ControlCommand::DeleteRows {
                sender_id: "cli-1".to_owned(),
                table: "jet1090".to_owned(),
                predicate: "identifier = 'a0b1c2'".to_owned(),
                dry_run: true,
            },
        )
        .await;

        match response {
            ControlResponse::DeleteOutput { affected_rows, .. } => assert_eq!(affected_rows, 1),
            other => panic!("expected DeleteOutput, got {other:?}"),
        }
        assert_eq!(table.current_state().unwrap().version, version_before);
    }

    #[tokio::test]
    async fn end_to_end_list_tables_over_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(dir.path().to_path_buf(), 100);
        registry.get_or_create("jet1090").await.unwrap();
        let bus = InMemoryBus::new();

        let mut responses = bus.subscribe(&["history:control:response:cli-1".to_owned()]).await.unwrap();
        let handle = tokio::spawn(run_control(bus.clone(), registry.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let command = serde_json::to_string(&ControlCommand::ListTables { sender_id: "cli-1".to_owned() }).unwrap();
        bus.publish("history:control", &command).await.unwrap();

        let response = responses.recv().await.unwrap();
        assert!(response.payload.contains("jet1090"));
        handle.abort();
    }
}
