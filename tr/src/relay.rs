//! Coordination facade
//!
//! [`Relay`] is the single entry point for the transport layer. Every
//! operation returns a [`Response`] holding a JSON envelope; errors never
//! escape and are rendered as `{"error": <message>}` instead.
//!
//! Node-scoped operations run as a transaction: lock the node id, load the
//! node, mutate it, and flush it back to the registry once, whether the
//! operation itself succeeded or not.

use std::error::Error as StdError;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::Applications;
use crate::error::{RelayError, RelayResult};
use crate::node::{MemoryNodesRegistry, Node, NodeId, NodesRegistry};
use crate::sweeper::{Sweeper, SweeperHandle};
use crate::task::{ResultData, Task};

/// What the node is told to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Task,
    Unsubscribe,
    Nop,
}

impl Action {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "task" => Some(Action::Task),
            "unsubscribe" => Some(Action::Unsubscribe),
            "nop" => Some(Action::Nop),
            _ => None,
        }
    }
}

/// JSON payload handed back to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Response(Value);

impl Response {
    /// `{"action": <action>, "data": <data>}`
    pub fn action(action: Action, data: Value) -> Self {
        Self(json!({"action": action, "data": data}))
    }

    pub fn task(task: &Task) -> Self {
        Self::action(Action::Task, task.to_value())
    }

    pub fn unsubscribe(message: impl Into<String>) -> Self {
        Self::action(Action::Unsubscribe, Value::String(message.into()))
    }

    pub fn nop() -> Self {
        Self::action(Action::Nop, Value::Null)
    }

    /// Bare payload without an action wrapper
    pub fn data(value: Value) -> Self {
        Self(value)
    }

    /// `{"error": <message>}`, with the source chain appended when `debug` is set
    pub fn error(err: &RelayError, debug: bool) -> Self {
        let mut message = err.to_string();
        if debug {
            let mut source = err.source();
            while let Some(cause) = source {
                message.push_str("\ncaused by: ");
                message.push_str(&cause.to_string());
                source = cause.source();
            }
        }
        Self(json!({ "error": message }))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Compact JSON wire form
    pub fn body(&self) -> String {
        self.0.to_string()
    }

    pub fn is_error(&self) -> bool {
        self.0.get("error").is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn action_kind(&self) -> Option<Action> {
        self.0.get("action").and_then(Value::as_str).and_then(Action::from_name)
    }

    pub fn payload(&self) -> Option<&Value> {
        self.0.get("data")
    }
}

/// Decode a submitted result: a JSON string holding a key/value mapping
fn parse_result(data: &Value) -> RelayResult<ResultData> {
    let Value::String(text) = data else {
        return Err(RelayError::MalformedInput("result must be a JSON string".to_string()));
    };
    let parsed: Value =
        serde_json::from_str(text).map_err(|e| RelayError::MalformedInput(format!("result is not valid JSON: {}", e)))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(RelayError::InvalidResult("result must be a key/value mapping".to_string())),
    }
}

/// Front end tying the registry and the applications together
pub struct Relay {
    config: Config,
    registry: Arc<dyn NodesRegistry>,
    applications: Applications,
}

impl Relay {
    pub fn new(config: Config, registry: Arc<dyn NodesRegistry>, applications: Applications) -> Self {
        info!(
            applications = ?applications.names(),
            auto_get_action = config.auto_get_action,
            "Relay::new: called"
        );
        Self {
            config,
            registry,
            applications,
        }
    }

    /// Relay backed by an in-memory registry using the configured timeout
    pub fn with_memory_registry(config: Config, applications: Applications) -> Self {
        let registry = Arc::new(MemoryNodesRegistry::new(config.registry.timeout));
        Self::new(config, registry, applications)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn NodesRegistry> {
        &self.registry
    }

    pub fn applications(&self) -> &Applications {
        &self.applications
    }

    /// Register a remote host as a node
    pub fn register(&self, remote: &str) -> Response {
        debug!(%remote, "Relay::register: called");
        let result = self.try_register(remote);
        self.respond(result)
    }

    fn try_register(&self, remote: &str) -> RelayResult<Response> {
        let node = Node::new(NodeId::from_remote(remote));
        let node_id = *node.id();
        self.registry.add(node)?;
        info!(%node_id, %remote, "Registered node");
        Ok(Response::data(json!({
            "node_id": node_id.to_string(),
            "config": self.config.node_config(),
            "applications": self.applications.names(),
        })))
    }

    /// Forget a node; later requests with its id fail until it registers again
    pub fn unregister(&self, node_id: &str) -> Response {
        debug!(%node_id, "Relay::unregister: called");
        let result = self.try_unregister(node_id);
        self.respond(result)
    }

    fn try_unregister(&self, node_id: &str) -> RelayResult<Response> {
        let id: NodeId = node_id.parse()?;
        let _guard = self.registry.lock_node(&id);
        self.registry.delete(&id)?;
        info!(node_id = %id, "Unregistered node");
        Ok(Response::nop())
    }

    /// Bind a node to an application and return the application's node configuration
    pub fn subscribe(&self, node_id: &str, application: &str) -> Response {
        debug!(%node_id, %application, "Relay::subscribe: called");
        let result = self.with_node(node_id, |node| {
            let controller = self.applications.get(application)?;
            let config = controller.subscribe(node)?;
            info!(node_id = %node.id(), %application, "Node subscribed");
            Ok(Response::data(Value::Object(config)))
        });
        self.respond(result)
    }

    /// Clear the node's application binding
    pub fn unsubscribe(&self, node_id: &str) -> Response {
        debug!(%node_id, "Relay::unsubscribe: called");
        let result = self.with_node(node_id, |node| {
            node.unsubscribe();
            Ok(Response::nop())
        });
        self.respond(result)
    }

    /// Hand the node its next task, or tell it to stop
    pub fn get_action(&self, node_id: &str) -> Response {
        debug!(%node_id, "Relay::get_action: called");
        let result = self.with_node(node_id, |node| self.next_action(node));
        self.respond(result)
    }

    /// Accept a result; `data` is the raw JSON string the node sent
    pub fn accept_result(&self, node_id: &str, data: &Value) -> Response {
        debug!(%node_id, "Relay::accept_result: called");
        let result = self.with_node(node_id, |node| {
            let parsed = parse_result(data).and_then(|result| node.accept_result(&self.applications, result));
            match parsed {
                Ok(outcome) => debug!(node_id = %node.id(), ?outcome, "Result accepted"),
                Err(e) if e.is_invalid_result() => {
                    warn!(node_id = %node.id(), error = %e, "Invalid result, unsubscribing node");
                    node.unsubscribe();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            if self.config.auto_get_action {
                self.next_action(node)
            } else {
                Ok(Response::nop())
            }
        });
        self.respond(result)
    }

    /// Evict idle nodes
    pub fn clean(&self) -> RelayResult<usize> {
        self.registry.clean()
    }

    /// Start evicting idle nodes in the background at the configured interval
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        Sweeper::spawn(self.registry.clone(), self.config.sweeper.interval)
    }

    fn next_action(&self, node: &mut Node) -> RelayResult<Response> {
        match node.get_task(&self.applications) {
            Ok(task) => Ok(Response::task(&task)),
            Err(e) if e.is_rejection() => {
                info!(node_id = %node.id(), reason = %e, "Unsubscribing node");
                node.unsubscribe();
                Ok(Response::unsubscribe(format!(
                    "The node has been automatically unsubscribed: {}",
                    e
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Run `f` on the node under its lock, then persist the node once
    fn with_node<T>(&self, node_id: &str, f: impl FnOnce(&mut Node) -> RelayResult<T>) -> RelayResult<T> {
        let id: NodeId = node_id.parse()?;
        let _guard = self.registry.lock_node(&id);
        let mut node = self.registry.get(&id)?;
        node.touch();

        let result = f(&mut node);
        if node.is_dirty() {
            self.flush(&mut node)?;
        }
        result
    }

    fn flush(&self, node: &mut Node) -> RelayResult<()> {
        let retries = self.config.registry.flush_retries;
        let mut attempt = 0;
        loop {
            match self.registry.update(node) {
                Ok(()) => {
                    node.mark_clean();
                    return Ok(());
                }
                // Evicted while in flight
                Err(e @ RelayError::NotRegistered(_)) => return Err(e),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(node_id = %node.id(), attempt, error = %e, "Retrying node flush");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn respond(&self, result: RelayResult<Response>) -> Response {
        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Request failed");
                Response::error(&e, self.config.debug)
            }
        }
    }
}
