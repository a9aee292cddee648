//! Task lifecycle: execution reports, retries and exhaustion policies.
//!
//! [`TaskLifecycle`] borrows a [`Job`] and records the transitions driven by
//! execution reports and operator actions. It never blocks: restart delays
//! are returned in the [`Transition`] and the caller decides when to call
//! [`TaskLifecycle::restart_waiting`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::FailureExhaustion;
use crate::core::flow::FlowAction;
use crate::core::identity::TaskId;
use crate::core::task::{TaskInstance, TaskStatus};
use crate::core::template::{OnTaskError, RestartMode};
use crate::error::{Error, Result};
use crate::job::{Job, JobStatus};
use crate::orchestration::flow::{ControlFlowProcessor, FlowOutcome};
use crate::{zlog, zlog_debug, zlog_warn};

/// Longest delay before a task is restarted.
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// How an execution attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ExecutionOutcome {
    Finished,
    /// The task raised an error.
    Faulty { error: String },
    /// The node running the task was lost.
    NodeLost { reason: String },
}

/// Report sent by the execution worker when an attempt ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub outcome: ExecutionOutcome,
    /// Action already computed by the worker, if it ran the flow script.
    pub flow_action: Option<FlowAction>,
    pub result: Option<Value>,
    pub host: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn new(task_id: TaskId, outcome: ExecutionOutcome, finished_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            outcome,
            flow_action: None,
            result: None,
            host: None,
            started_at: None,
            finished_at,
        }
    }

    pub fn finished(task_id: TaskId, finished_at: DateTime<Utc>) -> Self {
        Self::new(task_id, ExecutionOutcome::Finished, finished_at)
    }

    pub fn faulty(task_id: TaskId, error: &str, finished_at: DateTime<Utc>) -> Self {
        Self::new(
            task_id,
            ExecutionOutcome::Faulty {
                error: error.to_string(),
            },
            finished_at,
        )
    }

    pub fn node_lost(task_id: TaskId, reason: &str, finished_at: DateTime<Utc>) -> Self {
        Self::new(
            task_id,
            ExecutionOutcome::NodeLost {
                reason: reason.to_string(),
            },
            finished_at,
        )
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_flow_action(mut self, action: FlowAction) -> Self {
        self.flow_action = Some(action);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }
}

/// Everything one report or operator action changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub task_id: TaskId,
    /// Status of the task once the transition is recorded.
    pub status: TaskStatus,
    /// Set when the task waits for a restart.
    pub restart_delay: Option<Duration>,
    /// Exhaustion policy that was applied.
    pub policy: Option<OnTaskError>,
    pub flow: Option<FlowOutcome>,
    /// Other tasks whose status changed, with their new status.
    pub affected: Vec<(TaskId, TaskStatus)>,
    pub job_status: JobStatus,
}

/// Delay before the restart following `execution` failed executions.
///
/// The base delay for the first, growing by `execution` seconds each time,
/// capped at [`MAX_RESTART_DELAY`] beyond ten executions.
pub fn next_waiting_time(execution: u32, base: Duration) -> Duration {
    match execution {
        0 => base,
        n if n > 10 => MAX_RESTART_DELAY,
        n => next_waiting_time(n - 1, base) + Duration::from_millis(u64::from(n) * 1000),
    }
}

/// Records task transitions on a borrowed job.
pub struct TaskLifecycle<'a> {
    job: &'a mut Job,
}

impl<'a> TaskLifecycle<'a> {
    pub fn new(job: &'a mut Job) -> Self {
        Self { job }
    }

    /// PENDING -> RUNNING on `host`.
    ///
    /// # Errors
    /// Returns an error if the job does not dispatch, the task is not
    /// eligible, or `host` is excluded for this task.
    pub fn dispatch(&mut self, id: &TaskId, host: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.job.eligible_tasks().any(|task| &task.id == id) {
            return Err(Error::IllegalState(format!(
                "task {} of job {} ({}) is not eligible for dispatch",
                id,
                self.job.id.short(),
                self.job.status
            )));
        }
        if self.task(id)?.info.excluded_hosts.contains(host) {
            return Err(Error::IllegalState(format!(
                "host {} is excluded for task {}",
                host, id
            )));
        }

        let task = self.move_task(id, TaskStatus::Running)?;
        task.info.started_at = Some(at);
        task.info.finished_at = None;
        task.info.attempts += 1;
        task.info.executed_hosts.push(host.to_string());

        if self.job.started_at.is_none() {
            self.job.started_at = Some(at);
        }
        self.job.set_status(JobStatus::Running, at);
        Ok(())
    }

    /// Apply an execution report.
    ///
    /// # Errors
    /// Returns [`Error::ExecutionReport`] for a report that cannot apply: its
    /// job is over, or its task is unknown or not running. Nothing changes.
    pub fn record(
        &mut self,
        report: &ExecutionReport,
        flow: &ControlFlowProcessor,
    ) -> Result<Transition> {
        self.check_report(report)?;
        let id = &report.task_id;
        {
            let task = self.task_mut(id)?;
            if let Some(host) = &report.host {
                if task.info.executed_hosts.last() != Some(host) {
                    task.info.executed_hosts.push(host.clone());
                }
            }
            if let Some(started_at) = report.started_at {
                task.info.started_at = Some(started_at);
            }
        }

        match &report.outcome {
            ExecutionOutcome::Finished => self.finish(report, flow),
            ExecutionOutcome::Faulty { error } => {
                self.execution_error(id, error, report.finished_at)
            }
            ExecutionOutcome::NodeLost { reason } => {
                self.node_lost(id, reason, report.finished_at)
            }
        }
    }

    /// WAITING_ON_ERROR or WAITING_ON_FAILURE -> PENDING once the restart
    /// delay elapsed. A task of a paused job goes to PAUSED instead.
    pub fn restart_waiting(&mut self, id: &TaskId, at: DateTime<Utc>) -> Result<Transition> {
        self.ensure_alive()?;
        let status = self.task(id)?.status();
        if !matches!(
            status,
            TaskStatus::WaitingOnError | TaskStatus::WaitingOnFailure
        ) {
            return Err(Error::IllegalState(format!(
                "task {} is {}, not waiting for a restart",
                id, status
            )));
        }
        let next = if self.job.status == JobStatus::Paused {
            TaskStatus::Paused
        } else {
            TaskStatus::Pending
        };
        self.move_task(id, next)?;
        Ok(self.settle(self.transition(id), at))
    }

    /// Kill the job: every alive task is ABORTED. Returns the aborted tasks.
    pub fn kill_job(&mut self, at: DateTime<Utc>) -> Result<Vec<TaskId>> {
        self.ensure_alive()?;
        let aborted = self.abort_alive(at);
        self.job.set_status(JobStatus::Killed, at);
        Ok(aborted.into_iter().map(|(id, _)| id).collect())
    }

    /// Hold every task that is not running. Returns the paused tasks.
    pub fn pause_job(&mut self, at: DateTime<Utc>) -> Result<Vec<TaskId>> {
        self.ensure_alive()?;
        if self.job.status == JobStatus::Paused {
            return Err(Error::IllegalState(format!(
                "job {} is already paused",
                self.job.id.short()
            )));
        }
        let paused = self.pause_waiting();
        self.job.set_status(JobStatus::Paused, at);
        Ok(paused.into_iter().map(|(id, _)| id).collect())
    }

    /// Release the tasks held by [`pause_job`](Self::pause_job) or PAUSE_JOB.
    pub fn resume_job(&mut self, at: DateTime<Utc>) -> Result<Vec<TaskId>> {
        if self.job.status != JobStatus::Paused {
            return Err(Error::IllegalState(format!(
                "job {} is {}, not paused",
                self.job.id.short(),
                self.job.status
            )));
        }
        let mut resumed = Vec::new();
        for task in self.job.graph.instances_mut() {
            if task.info.status == TaskStatus::Paused {
                task.info.status = TaskStatus::Pending;
                resumed.push(task.id.clone());
            }
        }
        let status = if self.job.started_at.is_some() {
            JobStatus::Stalled
        } else {
            JobStatus::Pending
        };
        self.job.set_status(status, at);
        self.job.refresh_status(at);
        zlog!(
            "Job {} resumed, {} tasks released",
            self.job.id.short(),
            resumed.len()
        );
        Ok(resumed)
    }

    /// IN_ERROR -> PENDING with fresh execution counters.
    pub fn restart_in_error_task(&mut self, id: &TaskId, at: DateTime<Utc>) -> Result<Transition> {
        self.ensure_alive()?;
        self.ensure_status(id, TaskStatus::InError)?;
        let task = self.move_task(id, TaskStatus::Pending)?;
        task.info.counters = crate::core::task::ExecutionCounters::from_template(&task.template);
        task.info.last_error = None;
        task.info.finished_at = None;
        Ok(self.settle(self.transition(id), at))
    }

    /// IN_ERROR -> FAULTY, releasing dependents without its result.
    pub fn finish_in_error_task(&mut self, id: &TaskId, at: DateTime<Utc>) -> Result<Transition> {
        self.ensure_alive()?;
        self.ensure_status(id, TaskStatus::InError)?;
        self.continue_without_result(id, at)?;
        Ok(self.settle(self.transition(id), at))
    }

    /// Stop one task. A running task counts as an errored execution; a
    /// waiting one is ABORTED.
    pub fn kill_task(&mut self, id: &TaskId, at: DateTime<Utc>) -> Result<Transition> {
        self.ensure_alive()?;
        let status = self.task(id)?.status();
        if status == TaskStatus::Running {
            return self.execution_error(id, "task killed by operator", at);
        }
        if !status.is_alive() {
            return Err(Error::IllegalState(format!(
                "task {} is already {}",
                id, status
            )));
        }
        self.move_task(id, TaskStatus::Aborted)?.info.finished_at = Some(at);
        Ok(self.settle(self.transition(id), at))
    }

    /// RUNNING -> PENDING without consuming an execution.
    pub fn preempt_task(&mut self, id: &TaskId, at: DateTime<Utc>) -> Result<Transition> {
        self.ensure_alive()?;
        self.ensure_status(id, TaskStatus::Running)?;
        self.move_task(id, TaskStatus::Pending)?.info.started_at = None;
        Ok(self.settle(self.transition(id), at))
    }

    // ========== Report handling ==========

    fn check_report(&self, report: &ExecutionReport) -> Result<()> {
        let dropped = |reason: String| Error::ExecutionReport {
            task: report.task_id.to_string(),
            reason,
        };
        if !self.job.is_alive() {
            return Err(dropped(format!(
                "job {} is {}",
                self.job.id.short(),
                self.job.status
            )));
        }
        let task = self
            .job
            .graph
            .get_task(&report.task_id)
            .ok_or_else(|| dropped("unknown task".to_string()))?;
        if task.status() != TaskStatus::Running {
            return Err(dropped(format!("task is {}", task.status())));
        }
        Ok(())
    }

    fn finish(&mut self, report: &ExecutionReport, flow: &ControlFlowProcessor) -> Result<Transition> {
        let id = &report.task_id;
        let at = report.finished_at;
        let evaluated = flow.evaluate(
            self.task(id)?,
            report.flow_action.as_ref(),
            report.result.as_ref(),
        );
        let action = match evaluated {
            Ok(action) => action,
            Err(message) => {
                zlog_warn!("Flow script of task {} failed: {}", id, message);
                return self.execution_error(id, &format!("flow script failed: {}", message), at);
            }
        };

        {
            let task = self.move_task(id, TaskStatus::Finished)?;
            task.info.finished_at = Some(at);
            task.info.last_error = None;
        }
        let outcome = match flow.apply(&mut self.job.graph, id, &action) {
            Ok(outcome) => outcome,
            Err(err) => {
                zlog_warn!("Flow action {} of task {} failed: {}", action, id, err);
                self.move_task(id, TaskStatus::Running)?.info.finished_at = None;
                return self.execution_error(id, &format!("flow action {} failed: {}", action, err), at);
            }
        };

        let mut transition = self.transition(id);
        transition.flow = Some(outcome);
        Ok(self.settle(transition, at))
    }

    fn execution_error(&mut self, id: &TaskId, error: &str, at: DateTime<Utc>) -> Result<Transition> {
        let base = self.job.settings.restart_delay();
        let task = self.task_mut(id)?;
        task.info.last_error = Some(error.to_string());
        task.info.counters.executions_left = task.info.counters.executions_left.saturating_sub(1);
        let left = task.info.counters.executions_left;
        zlog_debug!("Task {} execution error: {} ({} executions left)", id, error, left);
        if left == 0 {
            return self.exhaust(id, TaskStatus::Faulty, at);
        }

        let done = task.template.max_number_of_execution.saturating_sub(left);
        if task.template.restart_mode == RestartMode::Elsewhere {
            let hosts = task.info.executed_hosts.clone();
            task.info.excluded_hosts.extend(hosts);
        }
        self.move_task(id, TaskStatus::WaitingOnError)?;
        let mut transition = self.transition(id);
        transition.restart_delay = Some(next_waiting_time(done, base));
        Ok(self.settle(transition, at))
    }

    fn node_lost(&mut self, id: &TaskId, reason: &str, at: DateTime<Utc>) -> Result<Transition> {
        let base = self.job.settings.restart_delay();
        let exhaustion = self.job.settings.failure_exhaustion;
        let task = self.task_mut(id)?;
        task.info.last_error = Some(format!("node lost: {}", reason));
        task.info.counters.executions_on_failure_left =
            task.info.counters.executions_on_failure_left.saturating_sub(1);
        let left = task.info.counters.executions_on_failure_left;
        zlog_debug!("Task {} lost its node: {} ({} restarts left)", id, reason, left);

        if left > 0 {
            let done = task
                .template
                .max_number_of_execution_on_failure
                .saturating_sub(left);
            if task.template.restart_mode == RestartMode::Elsewhere {
                let hosts = task.info.executed_hosts.clone();
                task.info.excluded_hosts.extend(hosts);
            }
            self.move_task(id, TaskStatus::WaitingOnFailure)?;
            let mut transition = self.transition(id);
            transition.restart_delay = Some(next_waiting_time(done, base));
            return Ok(self.settle(transition, at));
        }

        match exhaustion {
            FailureExhaustion::ApplyOnTaskError => self.exhaust(id, TaskStatus::Failed, at),
            FailureExhaustion::FailJob => {
                self.move_task(id, TaskStatus::Failed)?.info.finished_at = Some(at);
                let mut transition = self.transition(id);
                transition.affected = self.fail_job(at);
                Ok(self.settle(transition, at))
            }
        }
    }

    /// No executions left: apply the effective on-task-error policy.
    fn exhaust(&mut self, id: &TaskId, terminal: TaskStatus, at: DateTime<Utc>) -> Result<Transition> {
        let policy = self.job.effective_policy(self.task(id)?);
        zlog!("Task {} has no executions left, applying {}", id, policy);

        let affected = match policy {
            OnTaskError::None => {
                self.move_task(id, terminal)?.info.finished_at = Some(at);
                if self.job.settings.cancel_job_on_error {
                    self.fail_job(at)
                } else {
                    Vec::new()
                }
            }
            OnTaskError::CancelJob => {
                self.move_task(id, terminal)?.info.finished_at = Some(at);
                let aborted = self.abort_alive(at);
                self.job.set_status(JobStatus::Canceled, at);
                aborted
            }
            OnTaskError::PauseTask => {
                self.move_task(id, TaskStatus::InError)?;
                Vec::new()
            }
            OnTaskError::PauseJob => {
                self.move_task(id, TaskStatus::InError)?;
                let paused = self.pause_waiting();
                self.job.set_status(JobStatus::Paused, at);
                paused
            }
            OnTaskError::ContinueJobExecution => {
                self.continue_without_result(id, at)?;
                Vec::new()
            }
        };

        let mut transition = self.transition(id);
        transition.policy = Some(policy);
        transition.affected = affected;
        Ok(self.settle(transition, at))
    }

    fn continue_without_result(&mut self, id: &TaskId, at: DateTime<Utc>) -> Result<()> {
        let task = self.move_task(id, TaskStatus::Faulty)?;
        task.info.finished_at = Some(at);
        task.info.continue_on_fault = true;

        let dependents: Vec<TaskId> = self
            .job
            .graph
            .get_dependents(id)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        for dependent in dependents {
            self.task_mut(&dependent)?
                .info
                .missing_results
                .insert(id.clone());
        }
        Ok(())
    }

    /// Running tasks are ABORTED, tasks waiting for a restart are
    /// NOT_RESTARTED and the other alive tasks NOT_STARTED.
    fn fail_job(&mut self, at: DateTime<Utc>) -> Vec<(TaskId, TaskStatus)> {
        let mut affected = Vec::new();
        for task in self.job.graph.instances_mut() {
            let next = match task.info.status {
                TaskStatus::Running => TaskStatus::Aborted,
                TaskStatus::WaitingOnError | TaskStatus::WaitingOnFailure => TaskStatus::NotRestarted,
                status if status.is_alive() => TaskStatus::NotStarted,
                _ => continue,
            };
            task.info.status = next;
            task.info.finished_at = Some(at);
            affected.push((task.id.clone(), next));
        }
        self.job.set_status(JobStatus::Failed, at);
        affected
    }

    fn abort_alive(&mut self, at: DateTime<Utc>) -> Vec<(TaskId, TaskStatus)> {
        let mut aborted = Vec::new();
        for task in self.job.graph.instances_mut() {
            if task.is_alive() {
                task.info.status = TaskStatus::Aborted;
                task.info.finished_at = Some(at);
                aborted.push((task.id.clone(), TaskStatus::Aborted));
            }
        }
        zlog!("Job {}: {} tasks aborted", self.job.id.short(), aborted.len());
        aborted
    }

    fn pause_waiting(&mut self) -> Vec<(TaskId, TaskStatus)> {
        let mut paused = Vec::new();
        for task in self.job.graph.instances_mut() {
            if matches!(
                task.info.status,
                TaskStatus::Submitted
                    | TaskStatus::Pending
                    | TaskStatus::WaitingOnError
                    | TaskStatus::WaitingOnFailure
            ) {
                task.info.status = TaskStatus::Paused;
                paused.push((task.id.clone(), TaskStatus::Paused));
            }
        }
        paused
    }

    /// Propagate NOT_STARTED and refresh the job status.
    fn settle(&mut self, mut transition: Transition, at: DateTime<Utc>) -> Transition {
        if self.job.is_alive() {
            for id in self.job.graph.mark_not_started() {
                zlog_debug!("Task {} can no longer start", id);
                transition.affected.push((id, TaskStatus::NotStarted));
            }
        }
        self.job.refresh_status(at);
        if let Some(task) = self.job.graph.get_task(&transition.task_id) {
            transition.status = task.status();
        }
        transition.job_status = self.job.status;
        transition
    }

    // ========== Helpers ==========

    fn transition(&self, id: &TaskId) -> Transition {
        Transition {
            task_id: id.clone(),
            status: self
                .job
                .graph
                .get_task(id)
                .map(TaskInstance::status)
                .unwrap_or_default(),
            restart_delay: None,
            policy: None,
            flow: None,
            affected: Vec::new(),
            job_status: self.job.status,
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if !self.job.is_alive() {
            return Err(Error::IllegalState(format!(
                "job {} is {}",
                self.job.id.short(),
                self.job.status
            )));
        }
        Ok(())
    }

    fn ensure_status(&self, id: &TaskId, expected: TaskStatus) -> Result<()> {
        let status = self.task(id)?.status();
        if status != expected {
            return Err(Error::IllegalState(format!(
                "task {} is {}, expected {}",
                id, status, expected
            )));
        }
        Ok(())
    }

    fn task(&self, id: &TaskId) -> Result<&TaskInstance> {
        self.job
            .graph
            .get_task(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut TaskInstance> {
        self.job
            .graph_mut()
            .task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    fn move_task(&mut self, id: &TaskId, status: TaskStatus) -> Result<&mut TaskInstance> {
        let job = self.job.id.short();
        let task = self.task_mut(id)?;
        zlog!("Job {} task {}: {} -> {}", job, id, task.info.status, status);
        task.info.status = status;
        Ok(task)
    }
}
