//! The history engine's storage core: a Delta-style transactional columnar
//! table (JSON action log plus Parquet data files), with buffered writes,
//! background compaction/vacuum, and a predicate-based delete path backed
//! by an embedded SQL engine.
//!
//! No `deltalake`/`delta-rs` crate is vendored here — this hand-rolls the
//! same log-plus-data-files scheme directly over `arrow`/`parquet`, with
//! `datafusion` standing in for the "embedded SQL engine" that evaluates
//! delete predicates. See `DESIGN.md` for why.

pub mod log;
pub mod query;
pub mod schema;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::RecordBatch;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;
use tokio::sync::Mutex;

pub use log::{Action, DeltaLog, TableState};
pub use schema::{HistoryRow, history_schema, rows_to_batch};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("datafusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),
    #[error("table has no committed versions")]
    TableNotInitialized,
    #[error("table '{0}' is quarantined after repeated flush failures")]
    Quarantined(String),
}

/// Number of consecutive flush failures after which a table stops accepting
/// writes until an operator intervenes.
pub const MAX_CONSECUTIVE_FLUSH_FAILURES: u32 = 3;

/// One table: buffered writer, transaction log, and maintenance operations,
/// all serialized through a single write lock.
pub struct Table {
    name: String,
    log: DeltaLog,
    write_lock: Mutex<()>,
    buffer: Mutex<Vec<HistoryRow>>,
    buffer_capacity: usize,
    consecutive_flush_failures: AtomicU32,
}

impl Table {
    /// Open the table at `base_path/<name>/`, creating it (with version 0's
    /// `MetaData` action) if it does not exist.
    pub fn open_or_create(base_path: &std::path::Path, name: &str, buffer_capacity: usize) -> Result<Arc<Self>, HistoryError> {
        let table_dir = base_path.join(name);
        let log = DeltaLog::new(table_dir);
        let schema_json = arrow_schema_to_json(&history_schema());
        log.ensure_initialized(schema_json, Utc::now().timestamp_millis())?;
        Ok(Arc::new(Table {
            name: name.to_owned(),
            log,
            write_lock: Mutex::new(()),
            buffer: Mutex::new(Vec::new()),
            buffer_capacity,
            consecutive_flush_failures: AtomicU32::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_quarantined(&self) -> bool {
        self.consecutive_flush_failures.load(Ordering::SeqCst) >= MAX_CONSECUTIVE_FLUSH_FAILURES
    }

    /// Push a row onto the write buffer. Returns `true` if the buffer has
    /// crossed the 80% watermark and an out-of-band flush should be
    /// triggered by the caller (the flusher task also flushes on a timer
    /// regardless).
    pub async fn enqueue(&self, row: HistoryRow) -> Result<bool, HistoryError> {
        if self.is_quarantined() {
            return Err(HistoryError::Quarantined(self.name.clone()));
        }
        let mut buffer = self.buffer.lock().await;
        buffer.push(row);
        Ok(buffer.len() * 10 >= self.buffer_capacity * 8)
    }

    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Commit the current buffer as one new data file and one new log
    /// version. A no-op (returns `Ok(0)`) if the buffer is empty. On
    /// failure the buffer is left intact so the next tick retries, and the
    /// failure counter advances toward quarantine.
    pub async fn flush(&self) -> Result<usize, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let rows = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *buffer)
        };
        let row_count = rows.len();
        match self.write_data_file(&rows).await {
            Ok(()) => {
                self.consecutive_flush_failures.store(0, Ordering::SeqCst);
                Ok(row_count)
            }
            Err(e) => {
                // Put the rows back so the next tick retries them.
                self.buffer.lock().await.extend(rows);
                let failures = self.consecutive_flush_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= MAX_CONSECUTIVE_FLUSH_FAILURES {
                    tracing::error!(table = %self.name, failures, "table quarantined after repeated flush failures");
                }
                Err(e)
            }
        }
    }

    async fn write_data_file(&self, rows: &[HistoryRow]) -> Result<(), HistoryError> {
        let batch = rows_to_batch(rows)?;
        let file_name = format!("part-{}-{}.parquet", Utc::now().timestamp_micros(), uuid_like());
        let path = self.log.table_dir().join(&file_name);
        write_parquet(&path, &batch)?;
        let size_bytes = std::fs::metadata(&path)?.len();
        self.log.commit(&[Action::Add {
            path: file_name,
            size_bytes,
            modification_time_ms: Utc::now().timestamp_millis(),
        }])?;
        Ok(())
    }

    /// Coalesce small files toward `target_file_size` bytes. Pauses for the
    /// duration of the operation by holding the write lock, so it cannot
    /// overlap an in-flight flush.
    pub async fn optimize(&self, target_file_size: u64) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;
        let state = self.log.reconstruct()?;
        let small_files: Vec<&String> = {
            let mut small = Vec::new();
            for path in &state.active_files {
                let size = std::fs::metadata(self.log.table_dir().join(path))
                    .map(|m| m.len())
                    .unwrap_or(0);
                if size < target_file_size {
                    small.push(path);
                }
            }
            small
        };
        if small_files.len() < 2 {
            return Ok(());
        }
        let mut batches = Vec::new();
        for path in &small_files {
            batches.extend(read_parquet(&self.log.table_dir().join(path))?);
        }
        let combined = arrow::compute::concat_batches(&history_schema(), &batches)?;
        let new_name = format!("part-{}-{}.parquet", Utc::now().timestamp_micros(), uuid_like());
        write_parquet(&self.log.table_dir().join(&new_name), &combined)?;
        let new_size = std::fs::metadata(self.log.table_dir().join(&new_name))?.len();

        let mut actions: Vec<Action> = small_files
            .iter()
            .map(|path| Action::Remove {
                path: (*path).clone(),
                deletion_time_ms: Utc::now().timestamp_millis(),
            })
            .collect();
        actions.push(Action::Add {
            path: new_name,
            size_bytes: new_size,
            modification_time_ms: Utc::now().timestamp_millis(),
        });
        self.log.commit(&actions)?;
        for path in small_files {
            let _ = std::fs::remove_file(self.log.table_dir().join(path));
        }
        Ok(())
    }

    /// Permanently delete data files tombstoned longer than `retention`
    /// ago. Returns the number of files removed.
    pub async fn vacuum(&self, retention: Duration) -> Result<usize, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let state = self.log.reconstruct()?;
        let cutoff_ms = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let mut removed = 0;
        for (path, deletion_time_ms) in state.tombstones {
            if deletion_time_ms < cutoff_ms {
                let full_path = self.log.table_dir().join(&path);
                if full_path.exists() {
                    std::fs::remove_file(&full_path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn table_dir(&self) -> PathBuf {
        self.log.table_dir().to_path_buf()
    }

    pub fn current_state(&self) -> Result<TableState, HistoryError> {
        self.log.reconstruct()
    }
}

fn write_parquet(path: &std::path::Path, batch: &RecordBatch) -> Result<(), HistoryError> {
    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn read_parquet(path: &std::path::Path) -> Result<Vec<RecordBatch>, HistoryError> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    reader
        .into_iter()
        .map(|b| b.map_err(HistoryError::from))
        .collect()
}

fn arrow_schema_to_json(schema: &arrow::datatypes::Schema) -> serde_json::Value {
    serde_json::json!({
        "fields": schema.fields().iter().map(|f| {
            serde_json::json!({ "name": f.name(), "data_type": format!("{:?}", f.data_type()), "nullable": f.is_nullable() })
        }).collect::<Vec<_>>()
    })
}

/// A short, collision-resistant-enough suffix for data file names.
/// Timestamp micros already provides monotonic ordering; this guards
/// against two flushes landing in the same microsecond.
fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering as O};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{:08x}", COUNTER.fetch_add(1, O::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(icao24: &str, ts_ms: i64) -> HistoryRow {
        HistoryRow {
            identifier: icao24.to_owned(),
            timestamp_ms: ts_ms,
            latitude: 43.5,
            longitude: 1.47,
            altitude: Some(32000.0),
            callsign: Some("AFR123".to_owned()),
            track: Some(90.0),
        }
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        let version_before = table.current_state().unwrap().version;
        assert_eq!(table.flush().await.unwrap(), 0);
        assert_eq!(table.current_state().unwrap().version, version_before);
    }

    #[tokio::test]
    async fn flush_commits_one_new_version_and_clears_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        table.enqueue(sample_row("a0b1c2", 1_700_000_000_000)).await.unwrap();
        table.enqueue(sample_row("a0b1c2", 1_700_000_030_000)).await.unwrap();
        let written = table.flush().await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(table.buffered_len().await, 0);
        let state = table.current_state().unwrap();
        assert_eq!(state.active_files.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_signals_flush_at_eighty_percent_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 10).unwrap();
        for i in 0..7 {
            let should_flush = table.enqueue(sample_row("a0b1c2", i)).await.unwrap();
            assert!(!should_flush, "row {i} should not yet cross watermark");
        }
        let should_flush = table.enqueue(sample_row("a0b1c2", 7)).await.unwrap();
        assert!(should_flush);
    }

    #[tokio::test]
    async fn optimize_combines_small_files_into_one() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        for i in 0..3 {
            table.enqueue(sample_row("a0b1c2", i)).await.unwrap();
            table.flush().await.unwrap();
        }
        assert_eq!(table.current_state().unwrap().active_files.len(), 3);
        table.optimize(u64::MAX).await.unwrap();
        assert_eq!(table.current_state().unwrap().active_files.len(), 1);
    }

    #[tokio::test]
    async fn vacuum_removes_tombstones_past_retention_only() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open_or_create(dir.path(), "jet1090", 100).unwrap();
        table.enqueue(sample_row("a0b1c2", 0)).await.unwrap();
        table.flush().await.unwrap();
        table.optimize(0).await.unwrap_or(());
        // Nothing tombstoned yet (optimize needs >= 2 small files).
        assert_eq!(table.vacuum(Duration::from_secs(0)).await.unwrap(), 0);
    }
}
