//! Project interface: the application-specific side of a controller
//!
//! A project produces tasks, can reproduce any task it issued by id, and
//! decides what a valid result looks like and when the work is done.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayResult;
use crate::storage::ResultsStorage;
use crate::task::Task;

/// How a project expects nodes to take part
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectMode {
    /// Tasks are handed out without per-node bookkeeping; nodes may
    /// re-subscribe freely and a new request replaces the outstanding task
    #[default]
    Automatic,

    /// Nodes follow an explicit subscribe/unsubscribe lifecycle; a node
    /// asking again before answering gets the same task back
    Manual,
}

/// Application-specific task generator and result validator
pub trait Project: Send {
    fn mode(&self) -> ProjectMode {
        ProjectMode::Automatic
    }

    /// Configuration handed to subscribing nodes (worker script location etc.)
    fn client_config(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Produce the next task, or `None` when the project has no new tasks.
    ///
    /// Returning [`crate::RelayError::ApplicationCompleted`] marks the whole
    /// application as finished.
    fn next_task(&mut self) -> RelayResult<Option<Task>>;

    /// Reproduce a task that was issued earlier
    fn task(&self, task_id: &str) -> RelayResult<Task>;

    /// Validate and normalize a raw result
    ///
    /// Fails with [`crate::RelayError::InvalidResult`] on malformed input.
    fn normalize_result(&self, _task_id: &str, raw: Value) -> RelayResult<Value> {
        Ok(raw)
    }

    /// Called after a result landed in `storage`
    fn result_stored(&mut self, _task_id: &str, _result: &Value, _storage: &dyn ResultsStorage) -> RelayResult<()> {
        Ok(())
    }

    /// True once the project needs no further results
    fn completed(&self) -> bool {
        false
    }
}
