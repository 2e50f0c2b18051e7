//! Standard filters of the controller pipeline

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::controller::AppState;
use crate::error::{RelayError, RelayResult};
use crate::pipeline::{ResultCall, ResultFilter, ResultNext, ResultOutcome, TaskCall, TaskFilter, TaskNext};
use crate::session::strip_session_fields;
use crate::task::{DISCRIMINATOR_FIELD, NEXT_TASK, NO_SOLUTION, SESSION_TOKEN_FIELD, discriminator, is_null_result};

/// Fails fast once the application is completed, and records completion
/// signalled from further down the chain
#[derive(Debug, Default, Clone, Copy)]
pub struct CompletionGuard;

impl CompletionGuard {
    fn guard(app: &AppState, inner: impl FnOnce() -> RelayResult<()>) -> RelayResult<()> {
        app.ensure_open()?;
        match inner() {
            Err(RelayError::ApplicationCompleted(name)) => {
                info!(application = %app.name(), "Project signalled completion");
                app.complete()?;
                Err(RelayError::ApplicationCompleted(name))
            }
            other => other,
        }
    }
}

impl TaskFilter for CompletionGuard {
    fn name(&self) -> &'static str {
        "completion-guard"
    }

    fn on_task(&self, call: &mut TaskCall<'_>, next: TaskNext<'_>) -> RelayResult<()> {
        let app = call.app;
        Self::guard(app, || next.run(call))
    }
}

impl ResultFilter for CompletionGuard {
    fn name(&self) -> &'static str {
        "completion-guard"
    }

    fn on_result(&self, call: &mut ResultCall<'_>, next: ResultNext<'_>) -> RelayResult<()> {
        let app = call.app;
        Self::guard(app, || next.run(call))
    }
}

/// Moves session fields out of the issued task
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionAttach;

impl TaskFilter for SessionAttach {
    fn name(&self) -> &'static str {
        "session-attach"
    }

    fn on_task(&self, call: &mut TaskCall<'_>, next: TaskNext<'_>) -> RelayResult<()> {
        next.run(call)?;
        if let Some(task) = call.task.as_mut() {
            call.app.session().store(call.node, task)?;
        }
        Ok(())
    }
}

/// Puts session fields back into the result
///
/// Results carrying a discriminator are control messages and get no session
/// data. Session-looking fields supplied by the node are always dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionRestore;

impl ResultFilter for SessionRestore {
    fn name(&self) -> &'static str {
        "session-restore"
    }

    fn on_result(&self, call: &mut ResultCall<'_>, next: ResultNext<'_>) -> RelayResult<()> {
        let forged = strip_session_fields(&mut call.raw);
        if forged > 0 {
            warn!(node_id = %call.node.id(), forged, "Dropped session fields supplied by the node");
        }

        if discriminator(&call.raw).is_some() {
            call.raw.shift_remove(SESSION_TOKEN_FIELD);
            call.node.take_session_data();
        } else {
            call.app
                .session()
                .restore(call.node, &mut call.raw)
                .map_err(|e| RelayError::InvalidResult(e.to_string()))?;
        }

        call.data = Value::Object(call.raw.clone());
        next.run(call)
    }
}

/// Runs the project's validation and normalization
#[derive(Debug, Default, Clone, Copy)]
pub struct Normalize;

impl ResultFilter for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn on_result(&self, call: &mut ResultCall<'_>, next: ResultNext<'_>) -> RelayResult<()> {
        let task_id = call.task_id()?;
        let raw = std::mem::take(&mut call.data);
        call.data = call.app.project().normalize_result(&task_id, raw)?;
        next.run(call)
    }
}

/// Interprets the discriminator of control results
///
/// - [`NO_SOLUTION`]: nothing is stored, the node may move on
/// - [`NEXT_TASK`]: the result is skipped entirely
#[derive(Debug, Default, Clone, Copy)]
pub struct DecisionSearch;

impl ResultFilter for DecisionSearch {
    fn name(&self) -> &'static str {
        "decision-search"
    }

    fn on_result(&self, call: &mut ResultCall<'_>, next: ResultNext<'_>) -> RelayResult<()> {
        let Some(value) = discriminator(&call.raw) else {
            return next.run(call);
        };
        match value.as_u64() {
            Some(NO_SOLUTION) => {
                debug!(node_id = %call.node.id(), "DecisionSearch: no solution");
                call.data = Value::Null;
                call.outcome = ResultOutcome::NoSolution;
                next.run(call)
            }
            Some(NEXT_TASK) => {
                debug!(node_id = %call.node.id(), "DecisionSearch: next task");
                call.outcome = ResultOutcome::Skipped;
                Ok(())
            }
            _ => Err(RelayError::InvalidResult(format!(
                "unknown {} value: {}",
                DISCRIMINATOR_FIELD, value
            ))),
        }
    }
}

/// Stops empty results from reaching storage
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSuppression;

impl ResultFilter for NullSuppression {
    fn name(&self) -> &'static str {
        "null-suppression"
    }

    fn on_result(&self, call: &mut ResultCall<'_>, next: ResultNext<'_>) -> RelayResult<()> {
        if is_null_result(&call.data) {
            debug!(node_id = %call.node.id(), "NullSuppression: nothing to store");
            return Ok(());
        }
        next.run(call)
    }
}
