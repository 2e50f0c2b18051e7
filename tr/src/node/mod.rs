//! Nodes: remote workers tracked by the relay
//!
//! A [`Node`] is mutated in memory while a request is handled and flushed to
//! the [`NodesRegistry`] exactly once before the response leaves. The
//! `dirty` flag records whether such a flush is owed.

mod id;
mod registry;

pub use id::{NODE_ID_LEN, NodeId};
pub use registry::{MemoryNodesRegistry, NodeGuard, NodesRegistry};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::controller::{Applications, Controller};
use crate::error::{RelayError, RelayResult};
use crate::pipeline::ResultOutcome;
use crate::task::{ResultData, Task};

/// Per-node state persisted by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,

    /// Name of the subscribed application
    application: Option<String>,

    /// Id of the task currently outstanding on this node
    task_id: Option<String>,

    /// Session fields kept server-side (node-backed session manager only)
    session_data: Option<Map<String, Value>>,

    last_seen: DateTime<Utc>,

    #[serde(skip)]
    dirty: bool,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            application: None,
            task_id: None,
            session_data: None,
            last_seen: Utc::now(),
            dirty: false,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn session_data(&self) -> Option<&Map<String, Value>> {
        self.session_data.as_ref()
    }

    /// True iff the in-memory state diverges from what the registry holds
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Called by the owner of the node after a successful registry flush
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Record an interaction with the node
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.dirty = true;
    }

    /// Check whether the node has been silent for longer than `timeout`
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_seen);
        idle.to_std().map(|idle| idle > timeout).unwrap_or(false)
    }

    /// Bind the node to an application, dropping any previous task
    pub fn subscribe(&mut self, application: &str) {
        debug!(node_id = %self.id, %application, "Node::subscribe: called");
        self.application = Some(application.to_string());
        self.task_id = None;
        self.session_data = None;
        self.dirty = true;
    }

    /// Clear the application binding; calling it twice is harmless
    pub fn unsubscribe(&mut self) {
        debug!(node_id = %self.id, "Node::unsubscribe: called");
        if self.application.is_some() || self.task_id.is_some() || self.session_data.is_some() {
            self.application = None;
            self.task_id = None;
            self.session_data = None;
            self.dirty = true;
        }
    }

    pub fn set_task_id(&mut self, task_id: &str) {
        self.task_id = Some(task_id.to_string());
        self.dirty = true;
    }

    /// Forget the outstanding task, returning its id
    pub fn take_task_id(&mut self) -> Option<String> {
        let taken = self.task_id.take();
        if taken.is_some() {
            self.dirty = true;
        }
        taken
    }

    pub fn set_session_data(&mut self, data: Map<String, Value>) {
        self.session_data = Some(data);
        self.dirty = true;
    }

    pub fn take_session_data(&mut self) -> Option<Map<String, Value>> {
        let taken = self.session_data.take();
        if taken.is_some() {
            self.dirty = true;
        }
        taken
    }

    /// Resolve the controller of the bound application
    pub fn controller<'a>(&self, applications: &'a Applications) -> RelayResult<&'a Controller> {
        let name = self
            .application
            .as_deref()
            .ok_or_else(|| RelayError::NodeRejected("the node is not subscribed to any application".to_string()))?;
        applications.get(name)
    }

    /// Request the next task from the bound application
    pub fn get_task(&mut self, applications: &Applications) -> RelayResult<Task> {
        debug!(node_id = %self.id, application = ?self.application, "Node::get_task: called");
        let controller = self.controller(applications)?;
        controller.get_task(self)
    }

    /// Hand a result to the bound application
    pub fn accept_result(&mut self, applications: &Applications, data: ResultData) -> RelayResult<ResultOutcome> {
        debug!(node_id = %self.id, task_id = ?self.task_id, "Node::accept_result: called");
        let controller = self.controller(applications)?;
        controller.accept_result(self, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new(NodeId::from_remote("127.0.0.1"))
    }

    #[test]
    fn test_new_node_is_clean() {
        let node = node();
        assert!(!node.is_dirty());
        assert!(node.application().is_none());
        assert!(node.task_id().is_none());
    }

    #[test]
    fn test_subscribe_marks_dirty() {
        let mut node = node();
        node.subscribe("ocr");
        assert!(node.is_dirty());
        assert_eq!(node.application(), Some("ocr"));

        node.mark_clean();
        assert!(!node.is_dirty());
    }

    #[test]
    fn test_subscribe_drops_outstanding_task() {
        let mut node = node();
        node.subscribe("ocr");
        node.set_task_id("3");
        node.subscribe("other");
        assert!(node.task_id().is_none());
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let mut node = node();
        node.subscribe("ocr");
        node.set_task_id("1");
        node.unsubscribe();
        assert!(node.application().is_none());
        assert!(node.task_id().is_none());

        node.mark_clean();
        node.unsubscribe();
        assert!(!node.is_dirty());
    }

    #[test]
    fn test_take_task_id() {
        let mut node = node();
        assert!(node.take_task_id().is_none());
        assert!(!node.is_dirty());

        node.set_task_id("42");
        node.mark_clean();
        assert_eq!(node.take_task_id().as_deref(), Some("42"));
        assert!(node.is_dirty());
    }

    #[test]
    fn test_is_expired() {
        let node = node();
        let later = node.last_seen() + chrono::Duration::seconds(10);
        assert!(node.is_expired(Duration::from_secs(5), later));
        assert!(!node.is_expired(Duration::from_secs(30), later));
        // Clock skew never expires a node
        let earlier = node.last_seen() - chrono::Duration::seconds(10);
        assert!(!node.is_expired(Duration::from_secs(5), earlier));
    }

    #[test]
    fn test_unsubscribed_node_is_rejected() {
        let mut node = node();
        let apps = Applications::empty();
        let err = node.get_task(&apps).unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn test_serde_skips_dirty() {
        let mut node = node();
        node.subscribe("ocr");
        let json = serde_json::to_string(&node).unwrap();
        assert!(!json.contains("dirty"));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back.application(), Some("ocr"));
        assert!(!back.is_dirty());
    }
}
