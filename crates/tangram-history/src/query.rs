//! Datafusion-backed reads over a table's active Parquet files: listing
//! tables for the admin CLI and evaluating delete predicates.
//!
//! Predicates arrive as raw SQL `WHERE`-clause text from the history admin
//! CLI, the same trust boundary the upstream Python tool uses (an operator
//! typing a predicate, not an end-user-facing query surface).

use std::path::Path;

use chrono::Utc;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use serde_json::Value;

use crate::{Action, DeltaLog, HistoryError, Table, history_schema};

#[derive(Debug, Clone)]
pub struct TableSummary {
    pub name: String,
    pub uri: String,
    pub version: i64,
    pub schema_json: Value,
}

/// Scans `base_path` for table directories (anything containing a
/// `_delta_log/`) and summarizes each, for `history ls`.
pub fn list_tables(base_path: &Path) -> Result<Vec<TableSummary>, HistoryError> {
    let mut summaries = Vec::new();
    if !base_path.exists() {
        return Ok(summaries);
    }
    for entry in std::fs::read_dir(base_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let table_dir = entry.path();
        if !table_dir.join("_delta_log").exists() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let log = DeltaLog::new(&table_dir);
        let state = log.reconstruct()?;
        summaries.push(TableSummary {
            name,
            uri: table_dir.display().to_string(),
            version: state.version,
            schema_json: state.schema_json,
        });
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

pub struct DeleteOutcome {
    pub affected_rows: u64,
    pub preview_json: Value,
}

const PREVIEW_ROW_LIMIT: usize = 20;

impl Table {
    /// Registers the table's current active files as a queryable dataset
    /// and evaluates `predicate` against it. With `dry_run`, the table is
    /// left untouched; otherwise surviving rows are rewritten into a fresh
    /// data file and the matched rows' files are tombstoned, as one new log
    /// version.
    pub async fn delete_rows(&self, predicate: &str, dry_run: bool) -> Result<DeleteOutcome, HistoryError> {
        // Held for the whole operation (not just the final commit) so a
        // concurrent flush can't add a file after we've listed active_files
        // but before we commit the replacement.
        let _guard = self.write_lock.lock().await;

        let state_before = self.log.reconstruct()?;
        if state_before.active_files.is_empty() {
            return Ok(DeleteOutcome {
                affected_rows: 0,
                preview_json: Value::Array(vec![]),
            });
        }

        let ctx = SessionContext::new();
        let glob = format!("{}/*.parquet", self.table_dir().display());
        ctx.register_parquet("t", &glob, ParquetReadOptions::default())
            .await?;

        let count_sql = format!("SELECT COUNT(*) AS affected FROM t WHERE {predicate}");
        let count_batches = ctx.sql(&count_sql).await?.collect().await?;
        let affected_rows = count_batches
            .first()
            .and_then(|b| b.column(0).as_any().downcast_ref::<arrow::array::Int64Array>().map(|a| a.value(0)))
            .unwrap_or(0) as u64;

        let preview_sql = format!("SELECT * FROM t WHERE {predicate} LIMIT {PREVIEW_ROW_LIMIT}");
        let preview_batches = ctx.sql(&preview_sql).await?.collect().await?;
        let preview_json = batches_to_json(&preview_batches)?;

        if dry_run || affected_rows == 0 {
            return Ok(DeleteOutcome { affected_rows, preview_json });
        }

        let survive_sql = format!("SELECT * FROM t WHERE NOT ({predicate})");
        let survivor_batches = ctx.sql(&survive_sql).await?.collect().await?;

        let mut actions: Vec<Action> = state_before
            .active_files
            .iter()
            .map(|path| Action::Remove {
                path: path.clone(),
                deletion_time_ms: Utc::now().timestamp_millis(),
            })
            .collect();

        let total_surviving: usize = survivor_batches.iter().map(|b| b.num_rows()).sum();
        if total_surviving > 0 {
            let combined = arrow::compute::concat_batches(&history_schema(), &survivor_batches)?;
            let file_name = format!("part-{}-delete.parquet", Utc::now().timestamp_micros());
            let path = self.table_dir().join(&file_name);
            crate::write_parquet(&path, &combined)?;
            let size_bytes = std::fs::metadata(&path)?.len();
            actions.push(Action::Add {
                path: file_name,
                size_bytes,
                modification_time_ms: Utc::now().timestamp_millis(),
            });
        }

        self.log.commit(&actions)?;
        for path in &state_before.active_files {
            let _ = std::fs::remove_file(self.table_dir().join(path));
        }

        Ok(DeleteOutcome { affected_rows, preview_json })
    }
}

fn batches_to_json(batches: &[arrow::record_batch::RecordBatch]) -> Result<Value, HistoryError> {
    let mut buf = Vec::new();
    {
        let mut writer = arrow::json::ArrayWriter::new(&mut buf);
        for batch in batches {
            writer.write(batch)?;
        }
        writer.finish()?;
    }
    Ok(serde_json::from_slice(&buf).unwrap_or(Value::Array(vec![])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::HistoryRow;

    fn sample_row(icao24: &str, ts_ms: i64) -> HistoryRow {
        HistoryRow {
            identifier: icao24.to_owned(),
            timestamp_ms: ts_ms,
            latitude: 43.5,
            longitude: 1.47,
            altitude: Some(32000.0),
            callsign: Some("AFR123".to_owned()),
            track: None,
        }
    }

    #[tokio::test]
    async fn dry_run_delete_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        table.enqueue(sample_row("a0b1c2", 0)).await.unwrap();
        table.enqueue(sample_row("b2c3d4", 1)).await.unwrap();
        table.flush().await.unwrap();
        let version_before = table.current_state().unwrap().version;

        let outcome = table.delete_rows("identifier = 'a0b1c2'", true).await.unwrap();
        assert_eq!(outcome.affected_rows, 1);
        assert_eq!(table.current_state().unwrap().version, version_before);
    }

    #[tokio::test]
    async fn real_delete_removes_matching_rows() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        table.enqueue(sample_row("a0b1c2", 0)).await.unwrap();
        table.enqueue(sample_row("b2c3d4", 1)).await.unwrap();
        table.flush().await.unwrap();

        let outcome = table.delete_rows("identifier = 'a0b1c2'", false).await.unwrap();
        assert_eq!(outcome.affected_rows, 1);

        let outcome2 = table.delete_rows("identifier = 'a0b1c2'", true).await.unwrap();
        assert_eq!(outcome2.affected_rows, 0);
    }

    #[tokio::test]
    async fn delete_with_no_matches_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        table.enqueue(sample_row("a0b1c2", 0)).await.unwrap();
        table.flush().await.unwrap();
        let version_before = table.current_state().unwrap().version;

        let outcome = table.delete_rows("identifier = 'zzzzzz'", false).await.unwrap();
        assert_eq!(outcome.affected_rows, 0);
        assert_eq!(table.current_state().unwrap().version, version_before);
    }
}
