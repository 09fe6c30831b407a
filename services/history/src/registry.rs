//! Lazily-opened tables, keyed by name, shared across the ingest and
//! maintenance tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tangram_history::{HistoryError, Table};
use tokio::sync::RwLock;

pub struct TableRegistry {
    base_path: PathBuf,
    buffer_capacity: usize,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl TableRegistry {
    pub fn new(base_path: PathBuf, buffer_capacity: usize) -> Arc<Self> {
        Arc::new(TableRegistry {
            base_path,
            buffer_capacity,
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    /// Returns the table for `name`, opening it on first use.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Table>, HistoryError> {
        if let Some(table) = self.tables.read().await.get(name) {
            return Ok(table.clone());
        }
        let mut tables = self.tables.write().await;
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }
        let table = Table::open_or_create(&self.base_path, name, self.buffer_capacity)?;
        tables.insert(name.to_owned(), table.clone());
        Ok(table)
    }

    /// All tables opened so far, for the maintenance loops to iterate.
    pub async fn open_tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_the_same_table_on_repeat_calls() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(dir.path().to_path_buf(), 100);
        let first = registry.get_or_create("jet1090").await.unwrap();
        let second = registry.get_or_create("jet1090").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.open_tables().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_names_open_distinct_tables() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(dir.path().to_path_buf(), 100);
        registry.get_or_create("jet1090").await.unwrap();
        registry.get_or_create("ship162").await.unwrap();
        assert_eq!(registry.open_tables().await.len(), 2);
    }
}
