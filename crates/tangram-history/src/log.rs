//! The transaction log: a `_delta_log/` directory of newline-delimited JSON
//! action files, one per committed version, in the shape Delta Lake itself
//! uses (though this is a hand-rolled reader/writer, not the `delta-rs`
//! crate — see the design notes for why).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::HistoryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    MetaData { schema_json: Value, created_at_ms: i64 },
    Add { path: String, size_bytes: u64, modification_time_ms: i64 },
    Remove { path: String, deletion_time_ms: i64 },
}

/// A handle onto one table's `_delta_log/` directory.
pub struct DeltaLog {
    table_dir: PathBuf,
}

impl DeltaLog {
    pub fn new(table_dir: impl Into<PathBuf>) -> Self {
        DeltaLog {
            table_dir: table_dir.into(),
        }
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    fn log_dir(&self) -> PathBuf {
        self.table_dir.join("_delta_log")
    }

    fn version_path(&self, version: i64) -> PathBuf {
        self.log_dir().join(format!("{version:020}.json"))
    }

    /// Create the table directory and write version 0 (`MetaData`) if the
    /// log does not already exist. Idempotent.
    pub fn ensure_initialized(&self, schema_json: Value, now_ms: i64) -> Result<(), HistoryError> {
        fs::create_dir_all(self.log_dir())?;
        if self.latest_version()?.is_none() {
            self.commit(&[Action::MetaData {
                schema_json,
                created_at_ms: now_ms,
            }])?;
        }
        Ok(())
    }

    pub fn latest_version(&self) -> Result<Option<i64>, HistoryError> {
        let dir = self.log_dir();
        if !dir.exists() {
            return Ok(None);
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(v) = stem.parse::<i64>() {
                        versions.push(v);
                    }
                }
            }
        }
        Ok(versions.into_iter().max())
    }

    pub fn read_version(&self, version: i64) -> Result<Vec<Action>, HistoryError> {
        let text = fs::read_to_string(self.version_path(version))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(HistoryError::from))
            .collect()
    }

    /// Append a new version containing `actions`. Returns the new version
    /// number. Not concurrency-safe by itself — callers serialize commits
    /// through the table's write lock.
    pub fn commit(&self, actions: &[Action]) -> Result<i64, HistoryError> {
        let next_version = self.latest_version()?.map_or(0, |v| v + 1);
        let mut buf = String::new();
        for action in actions {
            buf.push_str(&serde_json::to_string(action)?);
            buf.push('\n');
        }
        // Create-new so two writers racing on the same version number fail
        // loudly instead of silently clobbering each other's commit.
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.version_path(next_version))?;
        file.write_all(buf.as_bytes())?;
        Ok(next_version)
    }

    /// Replays every version from 0 through `latest_version` and returns the
    /// reconstructed table state: the schema (from version 0's `MetaData`),
    /// the set of currently active data file paths, and a map of tombstoned
    /// paths to their deletion timestamp (used by vacuum).
    pub fn reconstruct(&self) -> Result<TableState, HistoryError> {
        let Some(latest) = self.latest_version()? else {
            return Err(HistoryError::TableNotInitialized);
        };
        let mut schema_json = None;
        let mut active: HashSet<String> = HashSet::new();
        let mut tombstones: HashMap<String, i64> = HashMap::new();
        for version in 0..=latest {
            for action in self.read_version(version)? {
                match action {
                    Action::MetaData { schema_json: s, .. } => schema_json = Some(s),
                    Action::Add { path, .. } => {
                        tombstones.remove(&path);
                        active.insert(path);
                    }
                    Action::Remove { path, deletion_time_ms } => {
                        active.remove(&path);
                        tombstones.insert(path, deletion_time_ms);
                    }
                }
            }
        }
        Ok(TableState {
            version: latest,
            schema_json: schema_json.ok_or(HistoryError::TableNotInitialized)?,
            active_files: active.into_iter().collect(),
            tombstones,
        })
    }
}

pub struct TableState {
    pub version: i64,
    pub schema_json: Value,
    pub active_files: Vec<String>,
    pub tombstones: HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_initialized_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeltaLog::new(dir.path());
        log.ensure_initialized(serde_json::json!({"fields": []}), 0).unwrap();
        log.ensure_initialized(serde_json::json!({"fields": []}), 1).unwrap();
        assert_eq!(log.latest_version().unwrap(), Some(0));
    }

    #[test]
    fn commit_increments_version_and_reconstruct_tracks_active_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeltaLog::new(dir.path());
        log.ensure_initialized(serde_json::json!({"fields": []}), 0).unwrap();
        let v1 = log
            .commit(&[Action::Add {
                path: "part-0001.parquet".to_owned(),
                size_bytes: 128,
                modification_time_ms: 10,
            }])
            .unwrap();
        assert_eq!(v1, 1);
        let state = log.reconstruct().unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.active_files, vec!["part-0001.parquet".to_owned()]);
    }

    #[test]
    fn remove_then_reconstruct_excludes_tombstoned_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeltaLog::new(dir.path());
        log.ensure_initialized(serde_json::json!({"fields": []}), 0).unwrap();
        log.commit(&[Action::Add {
            path: "part-0001.parquet".to_owned(),
            size_bytes: 128,
            modification_time_ms: 10,
        }])
        .unwrap();
        log.commit(&[Action::Remove {
            path: "part-0001.parquet".to_owned(),
            deletion_time_ms: 20,
        }])
        .unwrap();
        let state = log.reconstruct().unwrap();
        assert!(state.active_files.is_empty());
        assert_eq!(state.tombstones.get("part-0001.parquet"), Some(&20));
    }
}
