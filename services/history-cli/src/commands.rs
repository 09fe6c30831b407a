use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tangram_bus::{Bus, RedisBus};
use tangram_config::HistoryConfig;
use tangram_protocol::{ControlCommand, ControlResponse, TableSummary};

const CONTROL_TOPIC: &str = "history:control";
const LIST_TIMEOUT: Duration = Duration::from_secs(2);
const DELETE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub enum CliError {
    /// Neither the service nor direct file access could complete the
    /// operation.
    Unreachable(String),
    /// The operation was attempted (online or offline) and failed.
    OperationFailed(String),
}

async fn is_online(redis_url: &str) -> Option<RedisBus> {
    let bus = RedisBus::connect(redis_url).await.ok()?;
    let count = bus.subscriber_count(CONTROL_TOPIC).await.ok()?;
    (count > 0).then_some(bus)
}

async fn send_command(bus: &RedisBus, command: &ControlCommand, timeout: Duration) -> Option<ControlResponse> {
    let sender_id = command.sender_id().to_owned();
    let response_topic = format!("{CONTROL_TOPIC}:response:{sender_id}");
    let mut subscription = bus.subscribe(&[response_topic]).await.ok()?;
    let payload = serde_json::to_string(command).ok()?;
    bus.publish(CONTROL_TOPIC, &payload).await.ok()?;
    let message = tokio::time::timeout(timeout, subscription.recv()).await.ok()??;
    serde_json::from_str(&message.payload).ok()
}

pub async fn ls(redis_url: &str, history_config: &HistoryConfig, show_schema: bool, force_offline: bool) -> Result<(), CliError> {
    let online_bus = if force_offline { None } else { is_online(redis_url).await };

    let tables = if let Some(bus) = &online_bus {
        let command = ControlCommand::ListTables {
            sender_id: uuid::Uuid::new_v4().to_string(),
        };
        match send_command(bus, &command, LIST_TIMEOUT).await {
            Some(ControlResponse::TableList { tables }) => tables,
            Some(ControlResponse::CommandFailed { error }) => {
                return Err(CliError::OperationFailed(format!("list tables failed: {error}")));
            }
            Some(_) => return Err(CliError::OperationFailed("unexpected response".to_owned())),
            None => {
                eprintln!("note: service appeared online but did not respond, trying offline");
                list_offline(&history_config.base_path)?
            }
        }
    } else {
        if !force_offline {
            println!("note: no subscribers on {CONTROL_TOPIC}, listing tables in {}", history_config.base_path);
        }
        list_offline(&history_config.base_path)?
    };

    for table in &tables {
        println!("{} @ {} (version {})", table.name, table.uri, table.version);
        if show_schema {
            println!("{}", format_schema(&table.schema_json));
        }
    }
    Ok(())
}

fn list_offline(base_path: &str) -> Result<Vec<TableSummary>, CliError> {
    tangram_history::query::list_tables(Path::new(base_path))
        .map(|summaries| {
            summaries
                .into_iter()
                .map(|s| TableSummary {
                    name: s.name,
                    uri: s.uri,
                    version: s.version,
                    schema_json: s.schema_json,
                })
                .collect()
        })
        .map_err(|error| CliError::Unreachable(format!("failed to read tables from {base_path}: {error}")))
}

fn format_schema(schema_json: &serde_json::Value) -> String {
    let Some(fields) = schema_json.get("fields").and_then(|f| f.as_array()) else {
        return schema_json.to_string();
    };
    let mut lines = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let name = field.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
        let data_type = field.get("data_type").and_then(|v| v.as_str()).unwrap_or("unknown");
        let nullable = field.get("nullable").and_then(|v| v.as_bool()).unwrap_or(true);
        let connector = if i == fields.len() - 1 { "└─" } else { "├─" };
        let nullable_str = if nullable { " (nullable)" } else { "" };
        lines.push(format!("{connector} {name}: {data_type}{nullable_str}"));
    }
    lines.join("\n")
}

#[allow(clippy::too_many_arguments)]
pub async fn rm(
    redis_url: &str,
    history_config: &HistoryConfig,
    table: &str,
    predicate: &str,
    dry_run: bool,
    force_offline: bool,
) -> Result<(), CliError> {
    let online_bus = if force_offline { None } else { is_online(redis_url).await };
    if online_bus.is_none() && !force_offline {
        println!("note: no subscribers on {CONTROL_TOPIC}, assuming exclusive access of table");
    }

    let preview = delete_rows(&online_bus, history_config, table, predicate, true, LIST_TIMEOUT).await?;
    if preview.affected_rows == 0 {
        println!("no rows matched the predicate.");
        return Ok(());
    }
    println!("predicate matched {} rows", preview.affected_rows);
    println!("preview: {}", preview.preview_json);

    if dry_run {
        return Ok(());
    }

    print!("are you sure? [y/N] ");
    std::io::stdout().flush().ok();
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer).ok();
    if !answer.trim().eq_ignore_ascii_case("y") {
        return Err(CliError::OperationFailed("aborted by operator".to_owned()));
    }

    let outcome = delete_rows(&online_bus, history_config, table, predicate, false, DELETE_TIMEOUT).await?;
    println!("success: deleted {} rows from '{table}'", outcome.affected_rows);
    Ok(())
}

struct DeleteOutput {
    affected_rows: u64,
    preview_json: serde_json::Value,
}

async fn delete_rows(
    online_bus: &Option<RedisBus>,
    history_config: &HistoryConfig,
    table: &str,
    predicate: &str,
    dry_run: bool,
    timeout: Duration,
) -> Result<DeleteOutput, CliError> {
    if let Some(bus) = online_bus {
        let command = ControlCommand::DeleteRows {
            sender_id: uuid::Uuid::new_v4().to_string(),
            table: table.to_owned(),
            predicate: predicate.to_owned(),
            dry_run,
        };
        return match send_command(bus, &command, timeout).await {
            Some(ControlResponse::DeleteOutput { affected_rows, preview_json }) => Ok(DeleteOutput { affected_rows, preview_json }),
            Some(ControlResponse::CommandFailed { error }) => Err(CliError::OperationFailed(error)),
            Some(_) => Err(CliError::OperationFailed("unexpected response".to_owned())),
            None => Err(CliError::Unreachable("timed out waiting for a response from the service".to_owned())),
        };
    }

    let base_path = Path::new(&history_config.base_path);
    let table = tangram_history::Table::open_or_create(base_path, table, history_config.history_buffer_size)
        .map_err(|error| CliError::Unreachable(format!("failed to open table: {error}")))?;
    table
        .delete_rows(predicate, dry_run)
        .await
        .map(|outcome| DeleteOutput { affected_rows: outcome.affected_rows, preview_json: outcome.preview_json })
        .map_err(|error| CliError::OperationFailed(error.to_string()))
}
