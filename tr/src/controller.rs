//! Application controllers
//!
//! A [`Controller`] couples one project with its storages, its session data
//! manager and its filter pipeline. It is shared by every node working on the
//! application, so all mutable state sits behind locks or atomics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{RelayError, RelayResult};
use crate::node::Node;
use crate::pipeline::{Pipeline, ResultCall, ResultOutcome, TaskCall};
use crate::project::{Project, ProjectMode};
use crate::session::{PhonySessionManager, SessionDataManager};
use crate::storage::{MemoryResultsStorage, ResultsStorage, merge_into};
use crate::task::{ResultData, Task};

/// Shared state of one application, as seen by pipeline filters
pub struct AppState {
    name: String,
    mode: ProjectMode,
    project: Mutex<Box<dyn Project>>,
    /// Held while a result is stored and while temporal results are merged
    completion: Mutex<()>,
    completed: AtomicBool,
    depleted: AtomicBool,
    temporal: Arc<dyn ResultsStorage>,
    permanent: Arc<dyn ResultsStorage>,
    session: Arc<dyn SessionDataManager>,
}

impl AppState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ProjectMode {
        self.mode
    }

    /// Exclusive access to the project
    ///
    /// Must not be held across [`AppState::ensure_open`] or [`AppState::complete`].
    pub fn project(&self) -> MutexGuard<'_, Box<dyn Project>> {
        self.project.lock()
    }

    pub fn session(&self) -> &dyn SessionDataManager {
        self.session.as_ref()
    }

    pub fn temporal(&self) -> &dyn ResultsStorage {
        self.temporal.as_ref()
    }

    pub fn permanent(&self) -> &dyn ResultsStorage {
        self.permanent.as_ref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_depleted(&self) -> bool {
        self.depleted.load(Ordering::Acquire)
    }

    pub fn mark_depleted(&self) {
        if !self.depleted.swap(true, Ordering::AcqRel) {
            info!(application = %self.name, "Application has no more tasks");
        }
    }

    /// Mark the application completed and move its results to permanent storage
    ///
    /// Only the first call merges. Waits for a result being stored to land first.
    pub fn complete(&self) -> RelayResult<()> {
        let _completion = self.completion.lock();
        self.complete_locked()
    }

    fn complete_locked(&self) -> RelayResult<()> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let merged = merge_into(self.temporal(), self.permanent())?;
        info!(application = %self.name, merged, "Application completed");
        Ok(())
    }

    /// Fail with [`RelayError::ApplicationCompleted`] once the application is done
    pub fn ensure_open(&self) -> RelayResult<()> {
        if self.is_completed() {
            return Err(RelayError::ApplicationCompleted(self.name.clone()));
        }
        let done = self.project().completed();
        if done {
            self.complete()?;
            return Err(RelayError::ApplicationCompleted(self.name.clone()));
        }
        Ok(())
    }
}

/// Innermost task handler: pick the task and bind it to the node
fn issue_task(call: &mut TaskCall<'_>) -> RelayResult<()> {
    let app = call.app;
    let task = {
        let mut project = app.project();
        match (app.mode(), call.node.task_id()) {
            (ProjectMode::Manual, Some(outstanding)) => {
                debug!(node_id = %call.node.id(), task_id = %outstanding, "Re-issuing outstanding task");
                project.task(outstanding)?
            }
            _ => match project.next_task()? {
                Some(task) => task,
                None => {
                    app.mark_depleted();
                    return Err(RelayError::NodeRejected(format!(
                        "application \"{}\" has no more tasks",
                        app.name()
                    )));
                }
            },
        }
    };
    debug!(node_id = %call.node.id(), task_id = %task.id, "Issued task");
    call.node.set_task_id(&task.id);
    call.task = Some(task);
    Ok(())
}

/// Innermost result handler: store the result and check for completion
fn store_result(call: &mut ResultCall<'_>) -> RelayResult<()> {
    let app = call.app;
    let task_id = call.task_id()?;
    let result = std::mem::take(&mut call.data);

    // Nothing may land in temporal storage once it has been merged
    let _completion = app.completion.lock();
    if app.is_completed() {
        return Err(RelayError::ApplicationCompleted(app.name().to_string()));
    }

    app.temporal().add(&task_id, result.clone())?;
    call.outcome = ResultOutcome::Stored;
    debug!(node_id = %call.node.id(), %task_id, "Stored result");

    let completed = {
        let mut project = app.project();
        match project.result_stored(&task_id, &result, app.temporal()) {
            Ok(()) => project.completed(),
            Err(RelayError::ApplicationCompleted(_)) => true,
            Err(e) => return Err(e),
        }
    };
    if completed {
        app.complete_locked()?;
    }
    Ok(())
}

/// Coordinates one application
pub struct Controller {
    state: AppState,
    pipeline: Pipeline,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.state.name)
            .field("mode", &self.state.mode)
            .field("session", &self.state.session.name())
            .field("completed", &self.state.is_completed())
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn builder(name: impl Into<String>, project: Box<dyn Project>) -> ControllerBuilder {
        ControllerBuilder::new(name, project)
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn mode(&self) -> ProjectMode {
        self.state.mode()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    pub fn is_depleted(&self) -> bool {
        self.state.is_depleted()
    }

    pub fn temporal_storage(&self) -> &dyn ResultsStorage {
        self.state.temporal()
    }

    pub fn permanent_storage(&self) -> &dyn ResultsStorage {
        self.state.permanent()
    }

    /// Bind `node` to this application and return what the node needs to start working
    pub fn subscribe(&self, node: &mut Node) -> RelayResult<Map<String, Value>> {
        debug!(node_id = %node.id(), application = %self.name(), "Controller::subscribe: called");
        self.state.ensure_open()?;
        if self.mode() == ProjectMode::Manual && node.application() == Some(self.name()) {
            return Err(RelayError::NodeRejected(format!(
                "the node is already subscribed to \"{}\"",
                self.name()
            )));
        }
        node.subscribe(self.name());
        Ok(self.state.project().client_config())
    }

    /// Issue a task to a subscribed node
    pub fn get_task(&self, node: &mut Node) -> RelayResult<Task> {
        debug!(node_id = %node.id(), application = %self.name(), "Controller::get_task: called");
        if node.application() != Some(self.name()) {
            return Err(RelayError::NodeRejected(format!(
                "the node is not subscribed to \"{}\"",
                self.name()
            )));
        }

        let mut call = TaskCall {
            app: &self.state,
            node,
            task: None,
        };
        self.pipeline.run_task(&mut call, issue_task)?;
        call.task
            .ok_or_else(|| RelayError::NodeRejected("no task was issued".to_string()))
    }

    /// Run a submitted result through the pipeline
    ///
    /// On success the node's outstanding task is cleared, whatever the outcome.
    ///
    /// In manual mode the node must be subscribed to this application. The
    /// relay only reaches a controller through the node's own binding, so the
    /// check matters for callers that hand a node to a controller directly.
    pub fn accept_result(&self, node: &mut Node, data: ResultData) -> RelayResult<ResultOutcome> {
        debug!(node_id = %node.id(), application = %self.name(), task_id = ?node.task_id(), "Controller::accept_result: called");
        if self.mode() == ProjectMode::Manual && node.application() != Some(self.name()) {
            return Err(RelayError::NodeRejected(format!(
                "the node is not subscribed to \"{}\"",
                self.name()
            )));
        }

        let mut call = ResultCall::new(&self.state, node, data);
        self.pipeline.run_result(&mut call, store_result)?;
        let outcome = call.outcome;
        node.take_task_id();
        debug!(node_id = %node.id(), ?outcome, "Controller::accept_result: done");
        Ok(outcome)
    }
}

/// Assembles a [`Controller`]; storages default to memory and session data to [`PhonySessionManager`]
pub struct ControllerBuilder {
    name: String,
    project: Box<dyn Project>,
    temporal: Option<Arc<dyn ResultsStorage>>,
    permanent: Option<Arc<dyn ResultsStorage>>,
    session: Option<Arc<dyn SessionDataManager>>,
    pipeline: Option<Pipeline>,
}

impl ControllerBuilder {
    pub fn new(name: impl Into<String>, project: Box<dyn Project>) -> Self {
        Self {
            name: name.into(),
            project,
            temporal: None,
            permanent: None,
            session: None,
            pipeline: None,
        }
    }

    pub fn temporal_storage(mut self, storage: Arc<dyn ResultsStorage>) -> Self {
        self.temporal = Some(storage);
        self
    }

    pub fn permanent_storage(mut self, storage: Arc<dyn ResultsStorage>) -> Self {
        self.permanent = Some(storage);
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionDataManager>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn build(self) -> Controller {
        let mode = self.project.mode();
        let session = self.session.unwrap_or_else(|| Arc::new(PhonySessionManager));
        debug!(application = %self.name, ?mode, session = session.name(), "ControllerBuilder::build: called");
        Controller {
            state: AppState {
                name: self.name,
                mode,
                project: Mutex::new(self.project),
                completion: Mutex::new(()),
                completed: AtomicBool::new(false),
                depleted: AtomicBool::new(false),
                temporal: self.temporal.unwrap_or_else(|| Arc::new(MemoryResultsStorage::new())),
                permanent: self.permanent.unwrap_or_else(|| Arc::new(MemoryResultsStorage::new())),
                session,
            },
            pipeline: self.pipeline.unwrap_or_default(),
        }
    }
}

/// The set of applications served by a relay, keyed by name
#[derive(Debug, Default)]
pub struct Applications {
    controllers: BTreeMap<String, Controller>,
}

impl Applications {
    /// Collect controllers, rejecting duplicate names
    pub fn new(controllers: impl IntoIterator<Item = Controller>) -> RelayResult<Self> {
        let mut map = BTreeMap::new();
        for controller in controllers {
            let name = controller.name().to_string();
            if map.contains_key(&name) {
                return Err(RelayError::Config(format!("duplicate application name \"{}\"", name)));
            }
            map.insert(name, controller);
        }
        Ok(Self { controllers: map })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> RelayResult<&Controller> {
        self.controllers
            .get(name)
            .ok_or_else(|| RelayError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.controllers.contains_key(name)
    }

    /// Application names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.controllers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::session::NodeSessionManager;
    use serde_json::json;

    /// Hands out `count` numbered tasks and completes after `count` results
    struct Counter {
        mode: ProjectMode,
        count: usize,
        issued: usize,
        done: bool,
    }

    impl Counter {
        fn new(mode: ProjectMode, count: usize) -> Self {
            Self {
                mode,
                count,
                issued: 0,
                done: false,
            }
        }
    }

    impl Project for Counter {
        fn mode(&self) -> ProjectMode {
            self.mode
        }

        fn client_config(&self) -> Map<String, Value> {
            let mut config = Map::new();
            config.insert("script".to_string(), json!("/static/counter.js"));
            config
        }

        fn next_task(&mut self) -> RelayResult<Option<Task>> {
            if self.issued == self.count {
                return Ok(None);
            }
            self.issued += 1;
            Ok(Some(Task::new(self.issued.to_string()).with("#secret", self.issued)))
        }

        fn task(&self, task_id: &str) -> RelayResult<Task> {
            let n: usize = task_id
                .parse()
                .map_err(|_| RelayError::InvalidResult(format!("unknown task {}", task_id)))?;
            Ok(Task::new(task_id).with("#secret", n))
        }

        fn result_stored(&mut self, _task_id: &str, _result: &Value, storage: &dyn ResultsStorage) -> RelayResult<()> {
            self.done = storage.len() == self.count;
            Ok(())
        }

        fn completed(&self) -> bool {
            self.done
        }
    }

    fn controller(mode: ProjectMode, count: usize) -> Controller {
        Controller::builder("counter", Box::new(Counter::new(mode, count)))
            .session(Arc::new(NodeSessionManager))
            .build()
    }

    fn node() -> Node {
        Node::new(NodeId::from_remote("10.0.0.1"))
    }

    fn answer(n: i64) -> ResultData {
        let mut map = Map::new();
        map.insert("answer".to_string(), json!(n));
        map
    }

    #[test]
    fn test_subscribe_returns_client_config() {
        let controller = controller(ProjectMode::Manual, 1);
        let mut node = node();
        let config = controller.subscribe(&mut node).unwrap();
        assert_eq!(config.get("script"), Some(&json!("/static/counter.js")));
        assert_eq!(node.application(), Some("counter"));
    }

    #[test]
    fn test_manual_resubscribe_rejected() {
        let controller = controller(ProjectMode::Manual, 1);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();
        let err = controller.subscribe(&mut node).unwrap_err();
        assert!(matches!(err, RelayError::NodeRejected(_)));
    }

    #[test]
    fn test_automatic_resubscribe_allowed() {
        let controller = controller(ProjectMode::Automatic, 2);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();
        controller.get_task(&mut node).unwrap();
        controller.subscribe(&mut node).unwrap();
        assert!(node.task_id().is_none());
    }

    #[test]
    fn test_get_task_requires_subscription() {
        let controller = controller(ProjectMode::Manual, 1);
        let mut node = node();
        assert!(controller.get_task(&mut node).unwrap_err().is_rejection());
    }

    #[test]
    fn test_manual_reissues_outstanding_task() {
        let controller = controller(ProjectMode::Manual, 3);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();

        let first = controller.get_task(&mut node).unwrap();
        let again = controller.get_task(&mut node).unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(again.id, "1");
    }

    #[test]
    fn test_automatic_replaces_outstanding_task() {
        let controller = controller(ProjectMode::Automatic, 3);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();

        assert_eq!(controller.get_task(&mut node).unwrap().id, "1");
        assert_eq!(controller.get_task(&mut node).unwrap().id, "2");
        assert_eq!(node.task_id(), Some("2"));
    }

    #[test]
    fn test_session_fields_round_trip_through_node() {
        let controller = controller(ProjectMode::Manual, 1);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();

        let task = controller.get_task(&mut node).unwrap();
        assert!(!task.has_session_fields());
        assert_eq!(node.session_data().and_then(|s| s.get("#secret")), Some(&json!(1)));

        let outcome = controller.accept_result(&mut node, answer(10)).unwrap();
        assert_eq!(outcome, ResultOutcome::Stored);
        assert_eq!(
            controller.temporal_storage().get("1"),
            vec![json!({"answer": 10, "#secret": 1})]
        );
    }

    #[test]
    fn test_accept_result_clears_outstanding_task() {
        let controller = controller(ProjectMode::Manual, 2);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();
        controller.get_task(&mut node).unwrap();
        controller.accept_result(&mut node, answer(1)).unwrap();
        assert!(node.task_id().is_none());

        // Answering twice is not possible
        let err = controller.accept_result(&mut node, answer(1)).unwrap_err();
        assert!(matches!(err, RelayError::InvalidResult(_)));
    }

    #[test]
    fn test_manual_accept_requires_subscription() {
        let controller = controller(ProjectMode::Manual, 1);
        let mut node = node();
        node.set_task_id("1");
        assert!(controller.accept_result(&mut node, answer(1)).unwrap_err().is_rejection());
    }

    #[test]
    fn test_depletion_rejects_node() {
        let controller = controller(ProjectMode::Automatic, 1);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();
        controller.get_task(&mut node).unwrap();

        let err = controller.get_task(&mut node).unwrap_err();
        assert!(err.is_rejection());
        assert!(controller.is_depleted());
        assert!(!controller.is_completed());
    }

    #[test]
    fn test_completion_merges_results() {
        let controller = controller(ProjectMode::Manual, 2);
        let mut node = node();
        controller.subscribe(&mut node).unwrap();

        for n in 0..2 {
            controller.get_task(&mut node).unwrap();
            controller.accept_result(&mut node, answer(n)).unwrap();
        }

        assert!(controller.is_completed());
        assert_eq!(controller.permanent_storage().len(), 2);

        let err = controller.get_task(&mut node).unwrap_err();
        assert!(matches!(err, RelayError::ApplicationCompleted(_)));
        let err = controller.subscribe(&mut Node::new(NodeId::from_remote("10.0.0.2"))).unwrap_err();
        assert!(matches!(err, RelayError::ApplicationCompleted(_)));
    }

    #[test]
    fn test_complete_merges_once() {
        let controller = controller(ProjectMode::Manual, 5);
        controller.temporal_storage().add("1", json!(1)).unwrap();
        controller.state().complete().unwrap();
        controller.state().complete().unwrap();
        assert_eq!(controller.permanent_storage().get("1"), vec![json!(1)]);
    }

    /// Automatic project where only odd tasks carry session fields
    struct Mixed {
        issued: usize,
    }

    impl Project for Mixed {
        fn next_task(&mut self) -> RelayResult<Option<Task>> {
            self.issued += 1;
            let task = Task::new(self.issued.to_string());
            if self.issued % 2 == 1 {
                return Ok(Some(task.with("#secret", format!("for-task-{}", self.issued))));
            }
            Ok(Some(task))
        }

        fn task(&self, task_id: &str) -> RelayResult<Task> {
            Ok(Task::new(task_id))
        }
    }

    #[test]
    fn test_node_session_data_not_carried_to_next_task() {
        let controller = Controller::builder("mixed", Box::new(Mixed { issued: 0 }))
            .session(Arc::new(NodeSessionManager))
            .build();
        let mut node = node();
        controller.subscribe(&mut node).unwrap();

        controller.get_task(&mut node).unwrap();
        controller.get_task(&mut node).unwrap();
        controller.accept_result(&mut node, answer(1)).unwrap();

        assert_eq!(controller.temporal_storage().get("2"), vec![json!({"answer": 1})]);
    }

    /// Memory storage whose `add` stalls for results tagged "slow"
    #[derive(Default)]
    struct SlowStorage {
        inner: MemoryResultsStorage,
    }

    impl ResultsStorage for SlowStorage {
        fn add(&self, task_id: &str, result: Value) -> RelayResult<()> {
            if result.get("v") == Some(&json!("slow")) {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            self.inner.add(task_id, result)
        }

        fn get(&self, task_id: &str) -> Vec<Value> {
            self.inner.get(task_id)
        }

        fn task_ids(&self) -> Vec<String> {
            self.inner.task_ids()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    /// Completes as soon as one result is stored
    struct FirstWins {
        issued: usize,
        done: bool,
    }

    impl Project for FirstWins {
        fn next_task(&mut self) -> RelayResult<Option<Task>> {
            self.issued += 1;
            Ok(Some(Task::new(self.issued.to_string())))
        }

        fn task(&self, task_id: &str) -> RelayResult<Task> {
            Ok(Task::new(task_id))
        }

        fn result_stored(&mut self, _task_id: &str, _result: &Value, storage: &dyn ResultsStorage) -> RelayResult<()> {
            self.done = !storage.is_empty();
            Ok(())
        }

        fn completed(&self) -> bool {
            self.done
        }
    }

    #[test]
    fn test_result_racing_completion_is_not_lost() {
        let controller = Controller::builder("race", Box::new(FirstWins { issued: 0, done: false }))
            .temporal_storage(Arc::new(SlowStorage::default()))
            .build();

        let mut slow_node = node();
        let mut fast_node = Node::new(NodeId::from_remote("10.0.0.2"));
        for node in [&mut slow_node, &mut fast_node] {
            controller.subscribe(node).unwrap();
            controller.get_task(node).unwrap();
        }

        let tagged = |tag: &str| {
            let mut map = Map::new();
            map.insert("v".to_string(), json!(tag));
            map
        };

        let (slow, fast) = std::thread::scope(|scope| {
            let slow = scope.spawn(|| controller.accept_result(&mut slow_node, tagged("slow")));
            std::thread::sleep(std::time::Duration::from_millis(50));
            let fast = scope.spawn(|| controller.accept_result(&mut fast_node, tagged("fast")));
            (slow.join().unwrap(), fast.join().unwrap())
        });

        assert_eq!(slow.unwrap(), ResultOutcome::Stored);
        assert!(matches!(fast, Err(RelayError::ApplicationCompleted(_))));
        assert!(controller.is_completed());
        assert_eq!(controller.temporal_storage().len(), 1);
        assert_eq!(controller.permanent_storage().len(), 1);
    }

    #[test]
    fn test_applications_lookup() {
        let apps = Applications::new(vec![
            controller(ProjectMode::Manual, 1),
            Controller::builder("alpha", Box::new(Counter::new(ProjectMode::Automatic, 1))).build(),
        ])
        .unwrap();

        assert_eq!(apps.len(), 2);
        assert_eq!(apps.names(), vec!["alpha".to_string(), "counter".to_string()]);
        assert!(apps.get("alpha").is_ok());
        assert!(matches!(apps.get("nope"), Err(RelayError::NotFound(_))));
    }

    #[test]
    fn test_applications_reject_duplicates() {
        let result = Applications::new(vec![controller(ProjectMode::Manual, 1), controller(ProjectMode::Manual, 1)]);
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
