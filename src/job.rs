//! Jobs: a submitted task graph with its job-level status and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{FailureExhaustion, SchedulerConfig};
use crate::core::dag::JobGraph;
use crate::core::identity::{JobId, TaskId};
use crate::core::task::{TaskInstance, TaskStatus};
use crate::core::template::{OnTaskError, TaskTemplate};
use crate::error::{Error, Result};
use crate::zlog;

/// Job status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, no task dispatched yet.
    #[default]
    Pending,
    Running,
    /// Started, but no task is running right now.
    Stalled,
    Paused,
    /// A task waits in IN_ERROR for an operator.
    InError,
    Finished,
    Canceled,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending
                | JobStatus::Running
                | JobStatus::Stalled
                | JobStatus::Paused
                | JobStatus::InError
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stalled => "stalled",
            JobStatus::Paused => "paused",
            JobStatus::InError => "in_error",
            JobStatus::Finished => "finished",
            JobStatus::Canceled => "canceled",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
        };
        write!(f, "{}", s)
    }
}

/// Job-level policy defaults, taken from the scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    pub cancel_job_on_error: bool,
    pub on_task_error: OnTaskError,
    pub failure_exhaustion: FailureExhaustion,
    pub restart_delay_ms: u64,
}

impl JobSettings {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for JobSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            cancel_job_on_error: config.cancel_job_on_error,
            on_task_error: config.on_task_error,
            failure_exhaustion: config.failure_exhaustion,
            restart_delay_ms: config.restart_delay_ms,
        }
    }
}

/// A submitted job.
#[derive(Debug)]
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) name: String,
    pub(crate) status: JobStatus,
    pub(crate) settings: JobSettings,
    pub(crate) graph: JobGraph,
    pub(crate) submitted_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) cancellation: CancellationToken,
}

impl Job {
    /// Build, validate and submit a job from its task templates.
    pub fn submit(name: &str, templates: Vec<TaskTemplate>, config: &SchedulerConfig) -> Result<Self> {
        let graph = JobGraph::from_templates(JobId::new(), templates, config.naming())?;
        Self::from_graph(name, graph, JobSettings::from(config))
    }

    /// Submit an already built graph. An unsubmitted graph is frozen first.
    pub fn from_graph(name: &str, mut graph: JobGraph, settings: JobSettings) -> Result<Self> {
        if graph.is_empty() {
            return Err(Error::Validation(format!("job '{}' has no task", name)));
        }
        if !graph.is_frozen() {
            graph.freeze()?;
        }
        graph.mark_pending();

        zlog!(
            "Job {} '{}' submitted with {} tasks",
            graph.job_id().short(),
            name,
            graph.task_count()
        );
        Ok(Self {
            id: graph.job_id(),
            name: name.to_string(),
            status: JobStatus::Pending,
            settings,
            graph,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut JobGraph {
        &mut self.graph
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskInstance> {
        self.graph.get_task(id)
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Cancelled once the job is killed, canceled or failed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Tasks that may be dispatched now. Empty while the job is paused or over.
    pub fn eligible_tasks(&self) -> impl Iterator<Item = &TaskInstance> + Clone + '_ {
        let dispatchable = matches!(
            self.status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Stalled | JobStatus::InError
        );
        self.graph
            .eligible_tasks()
            .filter(move |_| dispatchable)
    }

    /// Policy applied when `task` runs out of executions: the task's own
    /// policy, or the job default when the task leaves it at NONE.
    pub fn effective_policy(&self, task: &TaskInstance) -> OnTaskError {
        match task.template.on_task_error {
            OnTaskError::None => self.settings.on_task_error,
            policy => policy,
        }
    }

    pub fn task_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for task in self.graph.tasks() {
            *counts.entry(task.status().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Move an alive job to the status its tasks imply.
    pub(crate) fn refresh_status(&mut self, at: DateTime<Utc>) {
        if !self.status.is_alive() {
            return;
        }
        let tasks: Vec<TaskStatus> = self.graph.tasks().map(|t| t.status()).collect();
        let next = if !tasks.iter().any(TaskStatus::is_alive) {
            JobStatus::Finished
        } else if self.status == JobStatus::Paused {
            JobStatus::Paused
        } else if tasks.contains(&TaskStatus::Running) {
            JobStatus::Running
        } else if tasks.contains(&TaskStatus::InError) {
            JobStatus::InError
        } else if self.started_at.is_some() {
            JobStatus::Stalled
        } else {
            JobStatus::Pending
        };
        self.set_status(next, at);
    }

    pub(crate) fn set_status(&mut self, status: JobStatus, at: DateTime<Utc>) {
        if self.status == status {
            return;
        }
        zlog!("Job {} {} -> {}", self.id.short(), self.status, status);
        self.status = status;
        if !status.is_alive() {
            self.finished_at = Some(at);
            if status != JobStatus::Finished {
                self.cancellation.cancel();
            }
        }
    }
}
