//! Live task instances and their execution status.
//!
//! A [`TaskInstance`] is a node of the job graph: a template snapshot plus
//! the runtime [`TaskInfo`]. Instances created by LOOP or REPLICATE are
//! plain clones of node records, so nothing mutable is shared with their
//! origin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::core::identity::TaskId;
use crate::core::template::{FlowBlock, TaskTemplate};

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created with its job, not yet started.
    #[default]
    Submitted,
    /// Waiting for its dependencies or for a worker.
    Pending,
    Running,
    Finished,
    /// Terminated with an execution error and no executions left.
    Faulty,
    /// Errored, waiting to be restarted.
    WaitingOnError,
    /// Lost its node, waiting to be restarted.
    WaitingOnFailure,
    /// Node loss with no executions on failure left.
    Failed,
    Aborted,
    /// Will never run: an upstream task cannot produce a usable result.
    NotStarted,
    /// Was waiting for a restart when its job ended.
    NotRestarted,
    /// Bypassed by an IF action or superseded by REPLICATE copies.
    Skipped,
    /// Suspended after exhaustion, until resumed by an operator.
    InError,
    Paused,
}

impl TaskStatus {
    /// Alive tasks can still change status on their own.
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            TaskStatus::Submitted
                | TaskStatus::Pending
                | TaskStatus::Paused
                | TaskStatus::Running
                | TaskStatus::WaitingOnError
                | TaskStatus::WaitingOnFailure
                | TaskStatus::InError
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_alive()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Faulty => "faulty",
            TaskStatus::WaitingOnError => "waiting_on_error",
            TaskStatus::WaitingOnFailure => "waiting_on_failure",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::NotStarted => "not_started",
            TaskStatus::NotRestarted => "not_restarted",
            TaskStatus::Skipped => "skipped",
            TaskStatus::InError => "in_error",
            TaskStatus::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// Remaining executions, counted down from the template maxima.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
    pub executions_left: u32,
    pub executions_on_failure_left: u32,
}

impl ExecutionCounters {
    pub fn from_template(template: &TaskTemplate) -> Self {
        Self {
            executions_left: template.max_number_of_execution,
            executions_on_failure_left: template.max_number_of_execution_on_failure,
        }
    }
}

/// Runtime state of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Every host that ran an attempt, in attempt order.
    pub executed_hosts: Vec<String>,
    /// Hosts the next attempt must avoid (restart ELSEWHERE).
    pub excluded_hosts: BTreeSet<String>,
    pub counters: ExecutionCounters,
    /// Number of attempts handed to a worker.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Released through CONTINUE_JOB_EXECUTION although these parents
    /// produced no result.
    pub missing_results: BTreeSet<TaskId>,
    /// Faulty, but dependents are released anyway.
    pub continue_on_fault: bool,
}

impl TaskInfo {
    fn new(template: &TaskTemplate) -> Self {
        Self {
            status: TaskStatus::Submitted,
            started_at: None,
            finished_at: None,
            executed_hosts: Vec::new(),
            excluded_hosts: BTreeSet::new(),
            counters: ExecutionCounters::from_template(template),
            attempts: 0,
            last_error: None,
            missing_results: BTreeSet::new(),
            continue_on_fault: false,
        }
    }
}

/// A live node of a job graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskId,
    pub template: TaskTemplate,
    pub info: TaskInfo,
    /// END instance closing the block this instance opens.
    pub matching_block: Option<TaskId>,
    /// IF task whose branch this instance starts.
    pub if_branch: Option<TaskId>,
    /// Instance this one was copied from by LOOP or REPLICATE.
    pub origin: Option<TaskId>,
}

impl TaskInstance {
    pub fn new(id: TaskId, template: TaskTemplate) -> Self {
        let info = TaskInfo::new(&template);
        Self {
            id,
            template,
            info,
            matching_block: None,
            if_branch: None,
            origin: None,
        }
    }

    /// Fresh copy under a new identity: runtime state is reset, the
    /// template snapshot is cloned.
    pub fn replicate(&self, id: TaskId) -> Self {
        let mut copy = Self::new(id, self.template.clone());
        copy.info.status = TaskStatus::Pending;
        copy.origin = Some(self.id.clone());
        copy
    }

    pub fn status(&self) -> TaskStatus {
        self.info.status
    }

    pub fn flow_block(&self) -> FlowBlock {
        self.template.flow_block
    }

    pub fn is_alive(&self) -> bool {
        self.info.status.is_alive()
    }

    pub fn base_name(&self) -> String {
        self.id.base_name()
    }

    /// Whether dependents may consume this instance's outcome.
    pub fn provides_result(&self) -> bool {
        match self.info.status {
            TaskStatus::Finished => true,
            TaskStatus::Faulty => self.info.continue_on_fault,
            _ => false,
        }
    }
}

/// Comparator for task views, passed explicitly to each sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrder {
    /// Submission order (sequence index).
    Sequence,
    Name,
    Status,
    /// Most recently finished first; unfinished tasks last.
    FinishedAt,
}

impl TaskOrder {
    pub fn compare(&self, a: &TaskInstance, b: &TaskInstance) -> Ordering {
        let by_sequence = a.id.sequence().cmp(&b.id.sequence());
        match self {
            TaskOrder::Sequence => by_sequence,
            TaskOrder::Name => a
                .id
                .readable_name()
                .cmp(b.id.readable_name())
                .then(by_sequence),
            TaskOrder::Status => a.info.status.cmp(&b.info.status).then(by_sequence),
            TaskOrder::FinishedAt => match (a.info.finished_at, b.info.finished_at) {
                (Some(x), Some(y)) => y.cmp(&x).then(by_sequence),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => by_sequence,
            },
        }
    }

    /// Sort task views with this comparator.
    pub fn sort(&self, tasks: &mut [&TaskInstance]) {
        tasks.sort_by(|a, b| self.compare(a, b));
    }
}
