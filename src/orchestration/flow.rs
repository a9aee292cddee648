//! Control flow processing after a successful execution.
//!
//! The [`ControlFlowProcessor`] turns a task's flow script, or the action a
//! worker already computed, into a [`FlowAction`] and applies it to the job
//! graph. Script evaluation goes through the [`FlowEvaluator`] trait; the
//! built-in [`ResultBindingEvaluator`] reads the action from variables bound
//! in the task result.

use serde_json::Value;
use std::sync::Arc;

use crate::core::dag::JobGraph;
use crate::core::flow::{FlowAction, FlowActionType};
use crate::core::identity::TaskId;
use crate::core::task::{TaskInstance, TaskOrder, TaskStatus};
use crate::core::template::FlowScript;
use crate::error::{Error, Result};
use crate::zlog_debug;

/// Evaluates a flow script against the result of an execution.
///
/// Errors are plain messages: the caller turns them into an execution error
/// of the task.
pub trait FlowEvaluator: Send + Sync {
    fn evaluate(
        &self,
        script: &FlowScript,
        task: &TaskInstance,
        result: Option<&Value>,
    ) -> std::result::Result<FlowAction, String>;
}

/// Reads `branch`, `loop` and `runs` bindings from a JSON object result.
///
/// - IF: `branch` is `"if"` (or `"then"`) for the target, `"else"` for the
///   else target.
/// - LOOP: `loop` is a boolean; `false` continues past the loop.
/// - REPLICATE: `runs` is the number of copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultBindingEvaluator;

impl ResultBindingEvaluator {
    fn binding<'a>(result: Option<&'a Value>, name: &str) -> std::result::Result<&'a Value, String> {
        result
            .and_then(|value| value.get(name))
            .ok_or_else(|| format!("flow script result does not bind '{}'", name))
    }
}

impl FlowEvaluator for ResultBindingEvaluator {
    fn evaluate(
        &self,
        script: &FlowScript,
        task: &TaskInstance,
        result: Option<&Value>,
    ) -> std::result::Result<FlowAction, String> {
        let missing_target = || format!("flow script of {} has no target", task.id);
        match script.action_type {
            FlowActionType::If => {
                let then_target = script.target.clone().ok_or_else(missing_target)?;
                let else_target = script.target_else.clone().ok_or_else(missing_target)?;
                let branch = Self::binding(result, "branch")?;
                let (target, target_else) = match branch.as_str() {
                    Some("if") | Some("then") => (then_target, else_target),
                    Some("else") => (else_target, then_target),
                    _ => return Err(format!("'branch' must be \"if\" or \"else\", got {}", branch)),
                };
                Ok(FlowAction::If {
                    target,
                    target_else,
                    continuation: script.continuation.clone(),
                })
            }
            FlowActionType::Loop => {
                let again = Self::binding(result, "loop")?
                    .as_bool()
                    .ok_or_else(|| "'loop' must be a boolean".to_string())?;
                if again {
                    Ok(FlowAction::Loop {
                        target: script.target.clone().ok_or_else(missing_target)?,
                    })
                } else {
                    Ok(FlowAction::Continue)
                }
            }
            FlowActionType::Replicate => {
                let runs = Self::binding(result, "runs")?
                    .as_i64()
                    .ok_or_else(|| "'runs' must be an integer".to_string())?;
                Ok(FlowAction::Replicate {
                    runs: runs.clamp(0, i64::from(u32::MAX)) as u32,
                })
            }
            FlowActionType::Continue => Ok(FlowAction::Continue),
        }
    }
}

/// What a flow action did to the graph.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowOutcome {
    pub action: FlowAction,
    /// Instances created by LOOP or REPLICATE.
    pub created: Vec<TaskId>,
    /// Instances skipped by IF or superseded by REPLICATE.
    pub skipped: Vec<TaskId>,
    /// The LOOP this task ends was closed.
    pub closed_loop: bool,
}

/// Interprets flow actions and applies them to a job graph.
#[derive(Clone)]
pub struct ControlFlowProcessor {
    evaluator: Arc<dyn FlowEvaluator>,
    /// Order in which REPLICATE targets are copied.
    order: TaskOrder,
}

impl ControlFlowProcessor {
    pub fn new(evaluator: Arc<dyn FlowEvaluator>) -> Self {
        Self {
            evaluator,
            order: TaskOrder::Sequence,
        }
    }

    pub fn with_order(mut self, order: TaskOrder) -> Self {
        self.order = order;
        self
    }

    /// Decide the flow action of a task that just finished.
    ///
    /// An action computed by the worker wins; otherwise the task's flow
    /// script is evaluated. Tasks without a script yield NONE.
    pub fn evaluate(
        &self,
        task: &TaskInstance,
        reported: Option<&FlowAction>,
        result: Option<&Value>,
    ) -> std::result::Result<FlowAction, String> {
        if let Some(action) = reported {
            return Ok(action.clone());
        }
        match &task.template.flow_script {
            Some(script) => self.evaluator.evaluate(script, task, result),
            None => Ok(FlowAction::None),
        }
    }

    /// Apply `action` on behalf of `initiator`.
    ///
    /// CONTINUE or NONE from a LOOP task closes its loop. Graph errors leave
    /// the graph unchanged.
    pub fn apply(
        &self,
        graph: &mut JobGraph,
        initiator: &TaskId,
        action: &FlowAction,
    ) -> Result<FlowOutcome> {
        let mut outcome = FlowOutcome {
            action: action.clone(),
            ..FlowOutcome::default()
        };
        let script = graph
            .get_task(initiator)
            .ok_or_else(|| Error::TaskNotFound(initiator.to_string()))?
            .template
            .flow_script
            .clone();

        match action {
            FlowAction::None | FlowAction::Continue => {
                if let Some(script) = script.filter(|s| s.action_type == FlowActionType::Loop) {
                    let target = self.loop_target(graph, initiator, script.target.as_deref())?;
                    graph.loop_block(initiator, &target, false)?;
                    outcome.closed_loop = true;
                }
            }
            FlowAction::If { target, .. } => {
                outcome.skipped = graph.apply_if_action(initiator, target)?;
            }
            FlowAction::Replicate { runs } => {
                let mut children: Vec<&TaskInstance> = graph
                    .get_dependents(initiator)
                    .into_iter()
                    .filter(|t| matches!(t.status(), TaskStatus::Submitted | TaskStatus::Pending))
                    .collect();
                self.order.sort(&mut children);
                let starts: Vec<TaskId> = children.into_iter().map(|t| t.id.clone()).collect();
                if starts.is_empty() {
                    return Err(Error::mismatch(initiator, "REPLICATE action has no target left"));
                }
                outcome.created = graph.replicate_blocks(&starts, *runs)?;
                outcome.skipped = starts
                    .into_iter()
                    .filter(|id| graph.get_task(id).map(|t| t.status()) == Some(TaskStatus::Skipped))
                    .collect();
            }
            FlowAction::Loop { target } => {
                let target = self.loop_target(graph, initiator, Some(target))?;
                outcome.created = graph.loop_block(initiator, &target, true)?;
            }
        }

        zlog_debug!(
            "ControlFlowProcessor::apply task={} action={} created={} skipped={}",
            initiator,
            action,
            outcome.created.len(),
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    fn loop_target(&self, graph: &JobGraph, end: &TaskId, name: Option<&str>) -> Result<TaskId> {
        let name = name.ok_or_else(|| Error::mismatch(end, "LOOP action has no target"))?;
        graph
            .resolve_target(end, name)
            .ok_or_else(|| Error::mismatch(end, format!("LOOP target '{}' not found", name)))
    }
}

impl Default for ControlFlowProcessor {
    fn default() -> Self {
        Self::new(Arc::new(ResultBindingEvaluator))
    }
}

impl std::fmt::Debug for ControlFlowProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlFlowProcessor")
            .field("order", &self.order)
            .finish()
    }
}
