//! Results storage contract and the in-memory backend
//!
//! Each controller owns a temporal storage (every accepted result) and a
//! permanent storage (what survives once the application completes).
//! Storages are append/merge only: several results may share a task id.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::RelayResult;

/// Append-only mapping of task id to results
pub trait ResultsStorage: Send + Sync {
    /// Append a result under `task_id`
    fn add(&self, task_id: &str, result: Value) -> RelayResult<()>;

    /// All results stored under `task_id`
    fn get(&self, task_id: &str) -> Vec<Value>;

    fn task_ids(&self) -> Vec<String>;

    /// Number of distinct task ids
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, task_id: &str) -> bool {
        !self.get(task_id).is_empty()
    }
}

/// Copy every entry of `from` into `into`
pub fn merge_into(from: &dyn ResultsStorage, into: &dyn ResultsStorage) -> RelayResult<usize> {
    let mut merged = 0;
    for task_id in from.task_ids() {
        for result in from.get(&task_id) {
            into.add(&task_id, result)?;
            merged += 1;
        }
    }
    debug!(merged, "merge_into: done");
    Ok(merged)
}

/// In-process storage, ordered by task id
#[derive(Debug, Default)]
pub struct MemoryResultsStorage {
    entries: RwLock<BTreeMap<String, Vec<Value>>>,
}

impl MemoryResultsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored results across all task ids
    pub fn total(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }
}

impl ResultsStorage for MemoryResultsStorage {
    fn add(&self, task_id: &str, result: Value) -> RelayResult<()> {
        self.entries.write().entry(task_id.to_string()).or_default().push(result);
        Ok(())
    }

    fn get(&self, task_id: &str) -> Vec<Value> {
        self.entries.read().get(task_id).cloned().unwrap_or_default()
    }

    fn task_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_and_get() {
        let storage = MemoryResultsStorage::new();
        assert!(storage.is_empty());

        storage.add("1", json!("hello")).unwrap();
        storage.add("1", json!("hallo")).unwrap();
        storage.add("2", json!("world")).unwrap();

        assert_eq!(storage.len(), 2);
        assert_eq!(storage.total(), 3);
        assert_eq!(storage.get("1"), vec![json!("hello"), json!("hallo")]);
        assert!(storage.contains("2"));
        assert!(!storage.contains("3"));
        assert!(storage.get("3").is_empty());
    }

    #[test]
    fn test_task_ids_sorted() {
        let storage = MemoryResultsStorage::new();
        storage.add("b", json!(1)).unwrap();
        storage.add("a", json!(2)).unwrap();
        assert_eq!(storage.task_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_merge_into() {
        let temporal = MemoryResultsStorage::new();
        let permanent = MemoryResultsStorage::new();
        temporal.add("1", json!("x")).unwrap();
        temporal.add("1", json!("y")).unwrap();
        temporal.add("2", json!("z")).unwrap();

        assert_eq!(merge_into(&temporal, &permanent).unwrap(), 3);
        assert_eq!(permanent.get("1"), vec![json!("x"), json!("y")]);
        assert_eq!(permanent.len(), 2);
        // The source is left untouched
        assert_eq!(temporal.total(), 3);
    }
}
