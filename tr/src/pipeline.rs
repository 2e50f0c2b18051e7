//! Filter pipeline around controller operations
//!
//! Filters intercept the two controller paths: issuing a task and accepting
//! a result. Each filter gets the call and a [`TaskNext`] / [`ResultNext`]
//! continuation; it may edit the call, run the rest of the chain, post-process
//! after it, or return early to skip the rest entirely. The first filter in
//! the list is the outermost one.
//!
//! ```text
//! task:   CompletionGuard -> SessionAttach -> issue
//! result: CompletionGuard -> SessionRestore -> Normalize -> DecisionSearch -> NullSuppression -> store
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::controller::AppState;
use crate::error::{RelayError, RelayResult};
use crate::filters::{CompletionGuard, DecisionSearch, Normalize, NullSuppression, SessionAttach, SessionRestore};
use crate::node::Node;
use crate::task::{ResultData, Task};

/// What happened to a submitted result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// Written to temporal storage
    Stored,
    /// The node reported no solution; nothing stored
    NoSolution,
    /// The node skipped the task; nothing stored
    Skipped,
    /// Normalization left nothing to store
    Empty,
}

/// In-flight task request
pub struct TaskCall<'a> {
    pub app: &'a AppState,
    pub node: &'a mut Node,
    /// Filled in by the innermost handler
    pub task: Option<Task>,
}

/// In-flight result submission
pub struct ResultCall<'a> {
    pub app: &'a AppState,
    pub node: &'a mut Node,
    /// The mapping as submitted, plus restored session fields
    pub raw: ResultData,
    /// Working value handed from filter to filter; `Null` means nothing to store
    pub data: Value,
    pub outcome: ResultOutcome,
}

impl<'a> ResultCall<'a> {
    pub fn new(app: &'a AppState, node: &'a mut Node, raw: ResultData) -> Self {
        let data = Value::Object(raw.clone());
        Self {
            app,
            node,
            raw,
            data,
            outcome: ResultOutcome::Empty,
        }
    }

    /// Id of the task the result answers
    pub fn task_id(&self) -> RelayResult<String> {
        self.node
            .task_id()
            .map(str::to_string)
            .ok_or_else(|| RelayError::InvalidResult("the node has no outstanding task".to_string()))
    }
}

/// Innermost step of the task path
pub type TaskHandler = fn(&mut TaskCall<'_>) -> RelayResult<()>;

/// Innermost step of the result path
pub type ResultHandler = fn(&mut ResultCall<'_>) -> RelayResult<()>;

/// Intercepts task issuing
pub trait TaskFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_task(&self, call: &mut TaskCall<'_>, next: TaskNext<'_>) -> RelayResult<()>;
}

/// Intercepts result acceptance
pub trait ResultFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_result(&self, call: &mut ResultCall<'_>, next: ResultNext<'_>) -> RelayResult<()>;
}

/// Remainder of the task chain
pub struct TaskNext<'p> {
    rest: &'p [Arc<dyn TaskFilter>],
    handler: TaskHandler,
}

impl TaskNext<'_> {
    pub fn run(self, call: &mut TaskCall<'_>) -> RelayResult<()> {
        match self.rest.split_first() {
            Some((filter, rest)) => filter.on_task(
                call,
                TaskNext {
                    rest,
                    handler: self.handler,
                },
            ),
            None => (self.handler)(call),
        }
    }
}

/// Remainder of the result chain
pub struct ResultNext<'p> {
    rest: &'p [Arc<dyn ResultFilter>],
    handler: ResultHandler,
}

impl ResultNext<'_> {
    pub fn run(self, call: &mut ResultCall<'_>) -> RelayResult<()> {
        match self.rest.split_first() {
            Some((filter, rest)) => filter.on_result(
                call,
                ResultNext {
                    rest,
                    handler: self.handler,
                },
            ),
            None => (self.handler)(call),
        }
    }
}

/// Ordered filters for both controller paths, fixed at controller construction
#[derive(Clone)]
pub struct Pipeline {
    task_filters: Vec<Arc<dyn TaskFilter>>,
    result_filters: Vec<Arc<dyn ResultFilter>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl Pipeline {
    pub fn new(task_filters: Vec<Arc<dyn TaskFilter>>, result_filters: Vec<Arc<dyn ResultFilter>>) -> Self {
        Self {
            task_filters,
            result_filters,
        }
    }

    /// The filter order every controller uses unless told otherwise
    pub fn standard() -> Self {
        let guard = Arc::new(CompletionGuard);
        Self::new(
            vec![guard.clone(), Arc::new(SessionAttach)],
            vec![
                guard,
                Arc::new(SessionRestore),
                Arc::new(Normalize),
                Arc::new(DecisionSearch),
                Arc::new(NullSuppression),
            ],
        )
    }

    pub fn run_task(&self, call: &mut TaskCall<'_>, handler: TaskHandler) -> RelayResult<()> {
        TaskNext {
            rest: &self.task_filters,
            handler,
        }
        .run(call)
    }

    pub fn run_result(&self, call: &mut ResultCall<'_>, handler: ResultHandler) -> RelayResult<()> {
        ResultNext {
            rest: &self.result_filters,
            handler,
        }
        .run(call)
    }

    pub fn task_filter_names(&self) -> Vec<&'static str> {
        self.task_filters.iter().map(|f| f.name()).collect()
    }

    pub fn result_filter_names(&self) -> Vec<&'static str> {
        self.result_filters.iter().map(|f| f.name()).collect()
    }
}
